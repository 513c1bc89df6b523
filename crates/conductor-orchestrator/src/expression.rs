//! A small, side-effect free expression language for condition steps.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or         := and (("||" | "or") and)*
//! and        := comparison (("&&" | "and") comparison)*
//! comparison := unary (("==" | "!=" | "<" | "<=" | ">" | ">=") unary)?
//! unary      := ("!" | "not" | "-") unary | primary
//! primary    := number | string | "true" | "false" | "null"
//!             | identifier | "(" or ")"
//! ```
//!
//! Identifiers may contain dotted paths (`user.age`, `items.0`) and may start
//! with `$` or `@`. They are resolved through a caller-supplied lookup; unknown
//! names evaluate to `null`. Nothing else is reachable from an expression.

use conductor_core::{ConductorError, ConductorResult};
use serde_json::Value;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

/// Evaluate `expression` to a boolean using JavaScript-like truthiness.
pub fn evaluate_condition(
    expression: &str,
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> ConductorResult<bool> {
    evaluate(expression, lookup).map(|v| truthy(&v))
}

/// Evaluate `expression` to a value.
pub fn evaluate(expression: &str, lookup: &dyn Fn(&str) -> Option<Value>) -> ConductorResult<Value> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(ConductorError::Expression("empty expression".to_string()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        lookup,
    };
    let value = parser.or()?;
    if let Some(token) = parser.peek() {
        return Err(ConductorError::Expression(format!(
            "unexpected token {token:?} in '{expression}'"
        )));
    }
    Ok(value)
}

/// `null`, `false`, `0`, `NaN` and `""` are false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn tokenize(input: &str) -> ConductorResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).copied();
        let third = chars.get(i + 2).copied();
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += if third == Some('=') { 3 } else { 2 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += if third == Some('=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ConductorError::Expression(format!(
                                "unterminated string in '{input}'"
                            )))
                        }
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal.parse::<f64>().map_err(|_| {
                    ConductorError::Expression(format!("invalid number '{literal}'"))
                })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' || c == '@' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ConductorError::Expression(format!(
                    "unexpected character '{other}' in '{input}'"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    lookup: &'a dyn Fn(&str) -> Option<Value>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> ConductorResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConductorError::Expression(
                "expression nested too deeply".to_string(),
            ));
        }
        Ok(())
    }

    fn or(&mut self) -> ConductorResult<Value> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and(&mut self) -> ConductorResult<Value> {
        let mut left = self.comparison()?;
        while self.eat(&Token::And) {
            let right = self.comparison()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> ConductorResult<Value> {
        let left = self.unary()?;
        let op = match self.peek() {
            Some(
                token @ (Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge),
            ) => token.clone(),
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.unary()?;

        let result = match op {
            Token::Eq => loose_eq(&left, &right),
            Token::Ne => !loose_eq(&left, &right),
            Token::Lt => compare(&left, &right).is_some_and(|o| o.is_lt()),
            Token::Le => compare(&left, &right).is_some_and(|o| o.is_le()),
            Token::Gt => compare(&left, &right).is_some_and(|o| o.is_gt()),
            _ => compare(&left, &right).is_some_and(|o| o.is_ge()),
        };
        Ok(Value::Bool(result))
    }

    fn unary(&mut self) -> ConductorResult<Value> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let value = self.unary()?;
            self.depth -= 1;
            return Ok(Value::Bool(!truthy(&value)));
        }
        if self.eat(&Token::Minus) {
            self.descend()?;
            let value = self.unary()?;
            self.depth -= 1;
            let number = as_number(&value).ok_or_else(|| {
                ConductorError::Expression(format!("cannot negate {value}"))
            })?;
            return Ok(number_value(-number));
        }
        self.primary()
    }

    fn primary(&mut self) -> ConductorResult<Value> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(number_value(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Ident(name)) => Ok((self.lookup)(&name).unwrap_or(Value::Null)),
            Some(Token::LParen) => {
                self.descend()?;
                let value = self.or()?;
                self.depth -= 1;
                if !self.eat(&Token::RParen) {
                    return Err(ConductorError::Expression("missing ')'".to_string()));
                }
                Ok(value)
            }
            Some(token) => Err(ConductorError::Expression(format!(
                "unexpected token {token:?}"
            ))),
            None => Err(ConductorError::Expression(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

/// Numbers, numeric strings and booleans coerce to a number.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(_) | Value::Bool(_), _) | (_, Value::Number(_) | Value::Bool(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            return x.partial_cmp(&y);
        }
        return Some(a.cmp(b));
    }
    as_number(left)?.partial_cmp(&as_number(right)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(name: &str) -> Option<Value> {
        let vars = json!({
            "score": 7,
            "name": "ana",
            "count": "12",
            "flag": true,
            "empty": "",
            "user": {"age": 30, "tags": ["a", "b"]}
        });
        let (head, rest) = name.split_once('.').unwrap_or((name, ""));
        let mut value = vars.get(head.trim_start_matches('$'))?;
        for segment in rest.split('.').filter(|s| !s.is_empty()) {
            value = match value {
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                other => other.get(segment)?,
            };
        }
        Some(value.clone())
    }

    fn check(expression: &str) -> bool {
        evaluate_condition(expression, &scope).unwrap()
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(check("score > 5"));
        assert!(check("score >= 7 && score <= 7"));
        assert!(!check("score < 7"));
        assert!(check("-1 < score"));
    }

    #[test]
    fn test_numeric_string_coercion() {
        assert!(check("count > 9"));
        assert!(check("count == 12"));
        assert!(check("'10' > '9'"));
    }

    #[test]
    fn test_string_equality_and_strict_aliases() {
        assert!(check("name == 'ana'"));
        assert!(check("name === \"ana\""));
        assert!(check("name !== 'bob'"));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        assert!(check("flag && score > 5 || false"));
        assert!(check("false || true && true"));
        assert!(!check("false || true && false"));
        assert!(check("not (score < 1) and flag"));
        assert!(check("!empty"));
    }

    #[test]
    fn test_nested_paths_and_dollar_prefix() {
        assert!(check("user.age == 30"));
        assert!(check("user.tags.1 == 'b'"));
        assert!(check("$score == 7"));
    }

    #[test]
    fn test_unknown_identifier_is_null() {
        assert!(check("missing == null"));
        assert!(!check("missing"));
        assert!(!check("missing > 1"));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
        assert!(truthy(&json!("0")));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(evaluate("", &scope).is_err());
        assert!(evaluate("score >", &scope).is_err());
        assert!(evaluate("(score > 1", &scope).is_err());
        assert!(evaluate("'open", &scope).is_err());
        assert!(evaluate("score > 1 2", &scope).is_err());
    }

    #[test]
    fn test_code_is_not_evaluated() {
        let err = evaluate("process.exit(1); true", &scope).unwrap_err();
        assert!(matches!(err, ConductorError::Expression(_)));
        assert!(evaluate("a = 1", &scope).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}true{}", "(".repeat(100), ")".repeat(100));
        assert!(evaluate(&deep, &scope).is_err());
        let shallow = format!("{}true{}", "(".repeat(10), ")".repeat(10));
        assert!(evaluate_condition(&shallow, &scope).unwrap());
    }
}
