// parser.rs - Recursive-descent parser for predicate expressions.
//
// Grammar, lowest precedence first:
//   or      := and ("or" and)*
//   and     := not ("and" not)*
//   not     := "not" not | compare
//   compare := sum (cmp_op sum)*          (chained like `0 < x < 10`)
//   sum     := product (("+" | "-") product)*
//   product := unary (("*" | "/" | "%") unary)*
//   unary   := ("-" | "+") unary | power
//   power   := primary ("**" unary)?      (right-assoc, binds tighter than a
//                                          unary minus on its left)
//   primary := literal | list | "(" or ")" | path | call
//
// The node set is closed: there is no assignment, no iteration, no
// definition and no call outside `Function`.

use crate::error::ExprError;
use crate::expr::lexer::Token;
use crate::expr::value::Value;

/// Hard cap on nesting so hostile input cannot exhaust the stack.
pub(crate) const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Literal(Value),
    List(Vec<Node>),
    Path(Vec<String>),
    Neg(Box<Node>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Arith(ArithOp, Box<Node>, Box<Node>),
    Compare(Box<Node>, Vec<(CompareOp, Node)>),
    Call(Function, Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Contains,
}

/// The only functions an expression may call. All are pure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Min,
    Max,
    Abs,
    Round,
    Floor,
    Ceil,
    Sqrt,
    Log,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "min" => Function::Min,
            "max" => Function::Max,
            "abs" => Function::Abs,
            "round" => Function::Round,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "sqrt" => Function::Sqrt,
            "log" => Function::Log,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Sqrt => "sqrt",
            Function::Log => "log",
        }
    }
}

const RESERVED: &[&str] = &[
    "and", "or", "not", "in", "contains", "true", "false", "null", "True", "False", "None",
];

pub(crate) struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    pub(crate) fn parse(mut self) -> Result<Node, ExprError> {
        if self.tokens.is_empty() {
            return Err(self.error("empty expression"));
        }
        let node = self.parse_or()?;
        if let Some(token) = self.peek() {
            return Err(self.error(format!("unexpected trailing token {:?}", token)));
        }
        Ok(node)
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        self.enter()?;
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        self.leave();
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ExprError> {
        // `not in` is a comparison operator, never a prefix.
        if self.at_keyword("not") && !self.next_is_keyword("in") {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_not()?;
            self.leave();
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Node, ExprError> {
        let left = self.parse_sum()?;
        let mut chain = Vec::new();
        while let Some(op) = self.compare_op() {
            let right = self.parse_sum()?;
            chain.push((op, right));
        }
        if chain.is_empty() {
            Ok(left)
        } else {
            Ok(Node::Compare(Box::new(left), chain))
        }
    }

    fn compare_op(&mut self) -> Option<CompareOp> {
        let (op, width) = match self.peek()? {
            Token::EqEq => (CompareOp::Eq, 1),
            Token::NotEq => (CompareOp::NotEq, 1),
            Token::Lt => (CompareOp::Lt, 1),
            Token::LtEq => (CompareOp::LtEq, 1),
            Token::Gt => (CompareOp::Gt, 1),
            Token::GtEq => (CompareOp::GtEq, 1),
            Token::Ident(word) if word == "in" => (CompareOp::In, 1),
            Token::Ident(word) if word == "contains" => (CompareOp::Contains, 1),
            Token::Ident(word) if word == "not" && self.next_is_keyword("in") => {
                (CompareOp::NotIn, 2)
            }
            _ => return None,
        };
        self.pos += width;
        Some(op)
    }

    fn parse_sum(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_product()?;
            left = Node::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                Some(Token::Percent) => ArithOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Node::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_unary()?;
                self.leave();
                Ok(Node::Neg(Box::new(inner)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_unary()?;
                self.leave();
                Ok(inner)
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Node, ExprError> {
        let base = self.parse_primary()?;
        if self.peek() != Some(&Token::StarStar) {
            return Ok(base);
        }
        self.pos += 1;
        self.enter()?;
        let exponent = self.parse_unary()?;
        self.leave();
        Ok(Node::Arith(ArithOp::Pow, Box::new(base), Box::new(exponent)))
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        let token = self
            .next()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        match token {
            Token::Int(n) => Ok(Node::Literal(Value::Int(n))),
            Token::Float(f) => Ok(Node::Literal(Value::Float(f))),
            Token::Str(s) => Ok(Node::Literal(Value::Str(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => self.parse_list(),
            Token::Ident(word) => self.parse_ident(word),
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_list(&mut self) -> Result<Node, ExprError> {
        self.enter()?;
        let mut items = Vec::new();
        if self.peek() != Some(&Token::RBracket) {
            loop {
                items.push(self.parse_or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    // Trailing comma.
                    if self.peek() == Some(&Token::RBracket) {
                        break;
                    }
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RBracket, "']'")?;
        self.leave();
        Ok(Node::List(items))
    }

    fn parse_ident(&mut self, word: String) -> Result<Node, ExprError> {
        match word.as_str() {
            "true" | "True" => return Ok(Node::Literal(Value::Bool(true))),
            "false" | "False" => return Ok(Node::Literal(Value::Bool(false))),
            "null" | "None" => return Ok(Node::Literal(Value::Null)),
            w if RESERVED.contains(&w) => {
                return Err(self.error(format!("unexpected keyword '{}'", w)))
            }
            _ => {}
        }
        check_name(self.source, &word)?;

        if self.peek() == Some(&Token::LParen) {
            let function = Function::lookup(&word)
                .ok_or_else(|| ExprError::UnknownFunction { name: word.clone() })?;
            self.pos += 1;
            return self.parse_call(function);
        }

        let mut segments = vec![word];
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            match self.next() {
                Some(Token::Ident(seg)) => {
                    check_name(self.source, &seg)?;
                    segments.push(seg);
                }
                Some(Token::Int(index)) if index >= 0 => segments.push(index.to_string()),
                _ => return Err(self.error("expected a field name after '.'")),
            }
        }
        if self.peek() == Some(&Token::LParen) {
            return Err(self.error("method calls are not allowed"));
        }
        Ok(Node::Path(segments))
    }

    fn parse_call(&mut self, function: Function) -> Result<Node, ExprError> {
        self.enter()?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;
        self.leave();

        let arity_ok = match function {
            Function::Min | Function::Max => !args.is_empty(),
            Function::Log | Function::Round => (1..=2).contains(&args.len()),
            Function::Abs | Function::Floor | Function::Ceil | Function::Sqrt => args.len() == 1,
        };
        if !arity_ok {
            return Err(self.error(format!(
                "wrong number of arguments to {}()",
                function.name()
            )));
        }
        Ok(Node::Call(function, args))
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("nesting deeper than {}", MAX_DEPTH)));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, want: Token, label: &str) -> Result<(), ExprError> {
        match self.next() {
            Some(ref t) if *t == want => Ok(()),
            Some(other) => Err(self.error(format!("expected {}, found {:?}", label, other))),
            None => Err(self.error(format!("expected {}, found end of input", label))),
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn next_is_keyword(&self, word: &str) -> bool {
        matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(w)) if w == word)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.at_keyword(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, reason: impl Into<String>) -> ExprError {
        ExprError::invalid(self.source, reason)
    }
}

fn check_name(source: &str, name: &str) -> Result<(), ExprError> {
    if name.starts_with("__") {
        return Err(ExprError::invalid(
            source,
            format!("dunder name '{}' is not allowed", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::tokenize;

    fn parse(src: &str) -> Result<Node, ExprError> {
        Parser::new(src, tokenize(src)?).parse()
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let node = parse("a or b and c").unwrap();
        match node {
            Node::Or(_, right) => assert!(matches!(*right, Node::And(_, _))),
            other => panic!("expected Or at the root, got {:?}", other),
        }
    }

    #[test]
    fn not_in_is_a_single_operator() {
        let node = parse("mode not in ['safe']").unwrap();
        match node {
            Node::Compare(_, chain) => assert_eq!(chain[0].0, CompareOp::NotIn),
            other => panic!("expected Compare, got {:?}", other),
        }
    }

    #[test]
    fn chained_comparisons_collect_every_link() {
        match parse("0 < score <= 100").unwrap() {
            Node::Compare(_, chain) => assert_eq!(chain.len(), 2),
            other => panic!("expected Compare, got {:?}", other),
        }
    }

    #[test]
    fn dotted_paths_become_segments() {
        assert_eq!(
            parse("risk.mode").unwrap(),
            Node::Path(vec!["risk".into(), "mode".into()])
        );
    }

    #[test]
    fn rejects_calls_outside_the_whitelist() {
        assert_eq!(
            parse("exec('rm -rf /')"),
            Err(ExprError::UnknownFunction {
                name: "exec".into()
            })
        );
        assert!(matches!(
            parse("args.keys()"),
            Err(ExprError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn rejects_dunder_names_and_dangling_operators() {
        assert!(parse("__class__").is_err());
        assert!(parse("a.__dict__").is_err());
        assert!(parse("score >=").is_err());
        assert!(parse("(score").is_err());
        assert!(parse("").is_err());
        assert!(parse("score 70").is_err());
    }

    #[test]
    fn rejects_excessive_nesting() {
        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        let err = parse(&deep).unwrap_err();
        match err {
            ExprError::InvalidExpression { reason, .. } => assert!(reason.contains("nesting")),
            other => panic!("expected InvalidExpression, got {:?}", other),
        }
        let negations = format!("{}1", "not ".repeat(200));
        assert!(parse(&negations).is_err());
    }

    #[test]
    fn checks_function_arity() {
        assert!(parse("abs(1, 2)").is_err());
        assert!(parse("max()").is_err());
        assert!(parse("max(score, 40)").is_ok());
    }
}
