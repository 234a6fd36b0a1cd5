// mod.rs - Sandboxed predicate expressions.
//
// Configuration files carry small expressions such as
// `risk.mode in ['review', 'danger']` or `score >= 70`. They are parsed by a
// hand-written grammar into a closed node set and evaluated against a
// read-only JSON context. Nothing here can reach I/O, mutate the context,
// loop, or call anything outside `parser::Function`.

mod lexer;
mod parser;
mod value;

use std::collections::BTreeSet;

use serde_json::Map;

use crate::error::ExprError;
use parser::{ArithOp, CompareOp, Function, Node, Parser};

pub use value::Value;

/// Longest expression source accepted, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Read-only key/value tree an expression is evaluated against.
///
/// Top-level keys are names (`score`, `risk`, `args`); nested objects are
/// reached with dotted paths (`risk.mode`, `args.payload.html`).
#[derive(Debug, Clone, Default)]
pub struct Context {
    root: Map<String, serde_json::Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding and return self (builder pattern).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add or replace a top-level binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.root.insert(name.into(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.root.contains_key(name)
    }

    /// Resolve a dotted path. Numeric segments index into arrays.
    pub fn lookup(&self, path: &[String]) -> Option<&serde_json::Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.root.get(first)?;
        for segment in rest {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// A parsed expression, ready to be evaluated many times.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    /// Parse an expression. Fails with `InvalidExpression` on any syntax
    /// outside the supported grammar and `UnknownFunction` on calls outside
    /// the whitelist.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        if source.len() > MAX_SOURCE_LEN {
            let head: String = source.chars().take(64).collect();
            return Err(ExprError::invalid(
                &head,
                format!("longer than {} bytes", MAX_SOURCE_LEN),
            ));
        }
        let tokens = lexer::tokenize(source)?;
        let root = Parser::new(source, tokens).parse()?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, ctx: &Context) -> Result<Value, ExprError> {
        eval_node(&self.root, ctx)
    }

    /// Evaluate and reduce to a boolean by truthiness.
    pub fn eval_bool(&self, ctx: &Context) -> Result<bool, ExprError> {
        Ok(self.eval(ctx)?.truthy())
    }

    /// Evaluate and require a numeric result.
    pub fn eval_number(&self, ctx: &Context) -> Result<f64, ExprError> {
        let value = self.eval(ctx)?;
        match value {
            Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            other => other.as_f64().ok_or_else(|| {
                ExprError::mismatch(format!("expected a number, got {}", other.type_name()))
            }),
        }
    }

    /// Dotted paths the expression reads, e.g. `{"risk.mode", "score"}`.
    pub fn referenced_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_names(&self.root, &mut names);
        names
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(expression: &str, ctx: &Context) -> Result<Value, ExprError> {
    Expr::parse(expression)?.eval(ctx)
}

fn collect_names(node: &Node, out: &mut BTreeSet<String>) {
    match node {
        Node::Literal(_) => {}
        Node::Path(segments) => {
            out.insert(segments.join("."));
        }
        Node::List(items) | Node::Call(_, items) => {
            for item in items {
                collect_names(item, out);
            }
        }
        Node::Neg(inner) | Node::Not(inner) => collect_names(inner, out),
        Node::And(a, b) | Node::Or(a, b) | Node::Arith(_, a, b) => {
            collect_names(a, out);
            collect_names(b, out);
        }
        Node::Compare(first, chain) => {
            collect_names(first, out);
            for (_, node) in chain {
                collect_names(node, out);
            }
        }
    }
}

fn eval_node(node: &Node, ctx: &Context) -> Result<Value, ExprError> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| eval_node(item, ctx))
                .collect::<Result<_, _>>()?,
        )),
        Node::Path(segments) => ctx
            .lookup(segments)
            .map(Value::from)
            .ok_or_else(|| ExprError::UnboundName {
                name: segments.join("."),
            }),
        Node::Neg(inner) => match eval_node(inner, ctx)? {
            Value::Int(i) => Ok(i
                .checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Float(-(i as f64)))),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(ExprError::mismatch(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
        Node::Not(inner) => Ok(Value::Bool(!eval_node(inner, ctx)?.truthy())),
        Node::And(a, b) => {
            if !eval_node(a, ctx)?.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_node(b, ctx)?.truthy()))
        }
        Node::Or(a, b) => {
            if eval_node(a, ctx)?.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_node(b, ctx)?.truthy()))
        }
        Node::Arith(op, a, b) => arith(*op, eval_node(a, ctx)?, eval_node(b, ctx)?),
        Node::Compare(first, chain) => {
            let mut left = eval_node(first, ctx)?;
            for (op, right_node) in chain {
                let right = eval_node(right_node, ctx)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Node::Call(function, args) => {
            let values = args
                .iter()
                .map(|arg| eval_node(arg, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call(*function, values)
        }
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CompareOp::Eq => left.loose_eq(right),
        CompareOp::NotEq => !left.loose_eq(right),
        CompareOp::Lt => left.compare(right)? == Less,
        CompareOp::LtEq => left.compare(right)? != Greater,
        CompareOp::Gt => left.compare(right)? == Greater,
        CompareOp::GtEq => left.compare(right)? != Less,
        CompareOp::In => right.holds(left)?,
        CompareOp::NotIn => !right.holds(left)?,
        CompareOp::Contains => left.holds(right)?,
    })
}

fn arith(op: ArithOp, left: Value, right: Value) -> Result<Value, ExprError> {
    if let (ArithOp::Add, Value::Str(a), Value::Str(b)) = (op, &left, &right) {
        return Ok(Value::Str(format!("{}{}", a, b)));
    }

    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let exact = match op {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
            ArithOp::Mod => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                // Result takes the sign of the divisor.
                a.checked_rem(b).map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
            }
            ArithOp::Pow => {
                if a == 0 && b < 0 {
                    return Err(ExprError::DivisionByZero);
                }
                u32::try_from(b).ok().and_then(|e| a.checked_pow(e))
            }
            ArithOp::Div => None,
        };
        if let Some(n) = exact {
            return Ok(Value::Int(n));
        }
    }

    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ExprError::mismatch(format!(
                "unsupported operand types {} and {}",
                left.type_name(),
                right.type_name()
            )))
        }
    };
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            a / b
        }
        ArithOp::Mod => {
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            a - b * (a / b).floor()
        }
        ArithOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            let raised = a.powf(b);
            // A negative base with a fractional exponent has no real result.
            if raised.is_nan() && !a.is_nan() && !b.is_nan() {
                return Err(ExprError::mismatch(format!("{} ** {} is not a real number", a, b)));
            }
            raised
        }
    };
    Ok(Value::Float(result))
}

fn call(function: Function, args: Vec<Value>) -> Result<Value, ExprError> {
    let number = |value: &Value| {
        value.as_f64().ok_or_else(|| {
            ExprError::mismatch(format!(
                "{}() expects numbers, got {}",
                function.name(),
                value.type_name()
            ))
        })
    };

    match function {
        Function::Min | Function::Max => {
            // A single list argument is spread: `max([a, b])` == `max(a, b)`.
            let mut items = args;
            if let [Value::List(inner)] = items.as_mut_slice() {
                items = std::mem::take(inner);
            }
            let mut best: Option<Value> = None;
            for item in items {
                number(&item)?;
                best = Some(match best {
                    None => item,
                    Some(current) => {
                        let ord = item.compare(&current)?;
                        let replace = match function {
                            Function::Min => ord.is_lt(),
                            _ => ord.is_gt(),
                        };
                        if replace {
                            item
                        } else {
                            current
                        }
                    }
                });
            }
            best.ok_or_else(|| ExprError::mismatch(format!("{}() of an empty list", function.name())))
        }
        Function::Abs => match &args[0] {
            Value::Int(i) => Ok(i
                .checked_abs()
                .map(Value::Int)
                .unwrap_or(Value::Float((*i as f64).abs()))),
            other => Ok(Value::Float(number(other)?.abs())),
        },
        Function::Round => {
            let x = number(&args[0])?;
            match args.get(1) {
                None => Ok(to_int(x.round_ties_even())),
                Some(digits) => {
                    let digits = number(digits)? as i32;
                    let scale = 10f64.powi(digits);
                    Ok(Value::Float((x * scale).round_ties_even() / scale))
                }
            }
        }
        Function::Floor => Ok(to_int(number(&args[0])?.floor())),
        Function::Ceil => Ok(to_int(number(&args[0])?.ceil())),
        Function::Sqrt => {
            let x = number(&args[0])?;
            if x < 0.0 {
                return Err(ExprError::mismatch("sqrt() of a negative number"));
            }
            Ok(Value::Float(x.sqrt()))
        }
        Function::Log => {
            let x = number(&args[0])?;
            if x <= 0.0 {
                return Err(ExprError::mismatch("log() of a non-positive number"));
            }
            match args.get(1) {
                None => Ok(Value::Float(x.ln())),
                Some(base) => {
                    let base = number(base)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(ExprError::mismatch("log() with an invalid base"));
                    }
                    Ok(Value::Float(x.log(base)))
                }
            }
        }
    }
}

fn to_int(x: f64) -> Value {
    if x.is_finite() && x >= i64::MIN as f64 && x <= i64::MAX as f64 {
        Value::Int(x as i64)
    } else {
        Value::Float(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn risk_ctx(mode: &str, score: i64) -> Context {
        Context::new()
            .with("risk", json!({"mode": mode, "score": score}))
            .with("score", score)
            .with("mode", mode)
    }

    #[test]
    fn membership_over_literal_list() {
        let ctx = risk_ctx("danger", 90);
        assert_eq!(
            evaluate("risk.mode in ['review', 'danger']", &ctx).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("risk.mode not in ['review', 'danger']", &ctx).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn comparisons_and_boolean_operators() {
        let ctx = risk_ctx("review", 55);
        assert!(Expr::parse("score >= 40 and score < 70")
            .unwrap()
            .eval_bool(&ctx)
            .unwrap());
        assert!(Expr::parse("not (score > 60) or mode == 'danger'")
            .unwrap()
            .eval_bool(&ctx)
            .unwrap());
        assert!(Expr::parse("40 <= risk.score <= 60")
            .unwrap()
            .eval_bool(&ctx)
            .unwrap());
    }

    #[test]
    fn substring_containment_both_directions() {
        let ctx = Context::new().with("args", json!({"html": "<p><script>x</script>"}));
        assert!(Expr::parse("'<script' in args.html")
            .unwrap()
            .eval_bool(&ctx)
            .unwrap());
        assert!(Expr::parse("args.html contains '<script'")
            .unwrap()
            .eval_bool(&ctx)
            .unwrap());
    }

    #[test]
    fn arithmetic_keeps_integers_exact() {
        let ctx = Context::new().with("amount", 1500);
        assert_eq!(evaluate("amount / 100 * 4", &ctx).unwrap(), Value::Float(60.0));
        assert_eq!(evaluate("amount + 20 - 5", &ctx).unwrap(), Value::Int(1515));
        assert_eq!(evaluate("-7 % 3", &ctx).unwrap(), Value::Int(2));
        assert_eq!(evaluate("7 % -3", &ctx).unwrap(), Value::Int(-2));
        assert_eq!(
            evaluate("amount / 0", &ctx).unwrap_err(),
            ExprError::DivisionByZero
        );
    }

    #[test]
    fn whitelisted_functions() {
        let ctx = Context::new().with("amount", 2500);
        assert_eq!(
            evaluate("min(50, amount / 25)", &ctx).unwrap(),
            Value::Int(50)
        );
        assert_eq!(evaluate("max([3, 9, 4])", &ctx).unwrap(), Value::Int(9));
        assert_eq!(evaluate("round(2.5)", &ctx).unwrap(), Value::Int(2));
        assert_eq!(evaluate("ceil(log(amount, 10))", &ctx).unwrap(), Value::Int(4));
        assert!(evaluate("sqrt(-1)", &ctx).is_err());
    }

    #[test]
    fn unbound_names_are_reported_with_full_path() {
        let ctx = risk_ctx("safe", 0);
        assert_eq!(
            evaluate("risk.level == 'x'", &ctx).unwrap_err(),
            ExprError::UnboundName {
                name: "risk.level".into()
            }
        );
        assert_eq!(
            evaluate("budget > 3", &ctx).unwrap_err(),
            ExprError::UnboundName {
                name: "budget".into()
            }
        );
    }

    #[test]
    fn short_circuit_skips_unbound_right_side() {
        let ctx = risk_ctx("safe", 0);
        assert!(!Expr::parse("score > 10 and missing == 1")
            .unwrap()
            .eval_bool(&ctx)
            .unwrap());
    }

    #[test]
    fn array_segments_index_into_lists() {
        let ctx = Context::new().with("args", json!({"to": ["a@x.io", "b@y.io"]}));
        assert_eq!(
            evaluate("args.to.1", &ctx).unwrap(),
            Value::Str("b@y.io".into())
        );
    }

    #[test]
    fn ordering_mismatch_is_a_type_error() {
        let ctx = risk_ctx("safe", 0);
        assert!(matches!(
            evaluate("mode > 3", &ctx),
            Err(ExprError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn sandbox_rejects_code_shaped_input() {
        for hostile in [
            "__import__('os').system('id')",
            "open('/etc/passwd')",
            "args.__class__",
            "[x for x in args]",
            "lambda: 1",
            "score = 100",
            "eval('1')",
        ] {
            assert!(Expr::parse(hostile).is_err(), "accepted: {}", hostile);
        }
        let huge = "1 + ".repeat(MAX_SOURCE_LEN) + "1";
        assert!(Expr::parse(&huge).is_err());
    }

    #[test]
    fn referenced_names_lists_paths() {
        let expr = Expr::parse("risk.score > 50 or max(score, x.y) > 3").unwrap();
        let names: Vec<_> = expr.referenced_names().into_iter().collect();
        assert_eq!(names, vec!["risk.score", "score", "x.y"]);
    }

    #[test]
    fn power_is_right_associative_and_binds_tighter_than_negation() {
        let ctx = risk_ctx("review", 12);
        assert_eq!(evaluate("2 ** 3 ** 2", &ctx).unwrap(), Value::Int(512));
        assert_eq!(evaluate("-2 ** 2", &ctx).unwrap(), Value::Int(-4));
        assert_eq!(evaluate("(-2) ** 2", &ctx).unwrap(), Value::Int(4));
        assert_eq!(evaluate("2 ** -1", &ctx).unwrap(), Value::Float(0.5));
        assert_eq!(evaluate("2 * 3 ** 2", &ctx).unwrap(), Value::Int(18));
        assert!(Expr::parse("score ** 2 > 100").unwrap().eval_bool(&ctx).unwrap());
    }

    #[test]
    fn power_edge_cases() {
        let ctx = Context::new();
        assert_eq!(
            evaluate("2 ** 63", &ctx).unwrap(),
            Value::Float(9_223_372_036_854_775_808.0)
        );
        assert_eq!(evaluate("4 ** 0.5", &ctx).unwrap(), Value::Float(2.0));
        assert!(matches!(
            evaluate("0 ** -1", &ctx),
            Err(ExprError::DivisionByZero)
        ));
        assert!(matches!(
            evaluate("(-8) ** 0.5", &ctx),
            Err(ExprError::TypeMismatch { .. })
        ));
        assert!(matches!(
            evaluate("'a' ** 2", &ctx),
            Err(ExprError::TypeMismatch { .. })
        ));
        assert!(Expr::parse("2 **").is_err());
        assert!(Expr::parse("2 * * 2").is_err());
    }
}
