// lexer.rs - Tokenizer for predicate expressions.
//
// Produces a flat token stream; keywords (`and`, `or`, `not`, `in`,
// `contains`, `true`, `false`, `null`) come out as identifiers and are
// recognised by the parser.

use crate::error::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => push(&mut tokens, &mut i, Token::LParen),
            ')' => push(&mut tokens, &mut i, Token::RParen),
            '[' => push(&mut tokens, &mut i, Token::LBracket),
            ']' => push(&mut tokens, &mut i, Token::RBracket),
            ',' => push(&mut tokens, &mut i, Token::Comma),
            '+' => push(&mut tokens, &mut i, Token::Plus),
            '-' => push(&mut tokens, &mut i, Token::Minus),
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::StarStar);
                i += 2;
            }
            '*' => push(&mut tokens, &mut i, Token::Star),
            '/' => push(&mut tokens, &mut i, Token::Slash),
            '%' => push(&mut tokens, &mut i, Token::Percent),
            '.' if !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())
                || matches!(tokens.last(), Some(Token::Ident(_))) =>
            {
                push(&mut tokens, &mut i, Token::Dot)
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::LtEq);
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::GtEq);
                i += 2;
            }
            '<' => push(&mut tokens, &mut i, Token::Lt),
            '>' => push(&mut tokens, &mut i, Token::Gt),
            '\'' | '"' => {
                let (text, next) = read_string(source, &chars, i)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let (token, next) = read_number(source, &chars, i)?;
                tokens.push(token);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ExprError::invalid(
                    source,
                    format!("unexpected character '{}' at offset {}", other, i),
                ))
            }
        }
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, i: &mut usize, token: Token) {
    tokens.push(token);
    *i += 1;
}

fn read_string(source: &str, chars: &[char], start: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| ExprError::invalid(source, "dangling escape in string"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ExprError::invalid(source, "unterminated string literal"))
}

fn read_number(source: &str, chars: &[char], start: usize) -> Result<(Token, usize), ExprError> {
    let mut i = start;
    let mut seen_dot = false;
    while i < chars.len() {
        match chars[i] {
            d if d.is_ascii_digit() || d == '_' => i += 1,
            '.' if !seen_dot && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                seen_dot = true;
                i += 1;
            }
            _ => break,
        }
    }
    let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    let token = if seen_dot {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| ExprError::invalid(source, format!("bad number '{}'", text)))?
    } else {
        // Integers too large for i64 degrade to floats rather than failing.
        match text.parse::<i64>() {
            Ok(n) => Token::Int(n),
            Err(_) => text
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| ExprError::invalid(source, format!("bad number '{}'", text)))?,
        }
    };
    Ok((token, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison_with_dotted_path() {
        let tokens = tokenize("risk.score >= 70").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("risk".into()),
                Token::Dot,
                Token::Ident("score".into()),
                Token::GtEq,
                Token::Int(70),
            ]
        );
    }

    #[test]
    fn tokenizes_strings_with_either_quote() {
        let tokens = tokenize(r#"mode in ['review', "danger"]"#).unwrap();
        assert!(tokens.contains(&Token::Str("review".into())));
        assert!(tokens.contains(&Token::Str("danger".into())));
    }

    #[test]
    fn tokenizes_floats_and_leading_dot_numbers() {
        assert_eq!(tokenize("2.5").unwrap(), vec![Token::Float(2.5)]);
        assert_eq!(tokenize(".5").unwrap(), vec![Token::Float(0.5)]);
        assert_eq!(tokenize("1_000").unwrap(), vec![Token::Int(1000)]);
    }

    #[test]
    fn numeric_path_segment_after_ident_is_a_dot() {
        let tokens = tokenize("args.items.0").unwrap();
        assert_eq!(tokens[3], Token::Dot);
        assert_eq!(tokens[4], Token::Int(0));
    }

    #[test]
    fn rejects_unknown_characters() {
        assert!(matches!(
            tokenize("a = 1"),
            Err(ExprError::InvalidExpression { .. })
        ));
        assert!(tokenize("x; import os").is_err());
        assert!(tokenize("'open").is_err());
    }
}
