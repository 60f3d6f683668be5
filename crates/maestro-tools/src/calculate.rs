// Calculator Tool
// Infix arithmetic evaluator: + - * / with parentheses and unary minus

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolContext, ToolError, ToolSchema};

pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "calculate".to_string(),
            description: "Evaluate an arithmetic expression".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "expression": {"type": "string"}
                },
                "required": ["expression"]
            }),
            category: "math".to_string(),
        }
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let expression = params
            .get("expression")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let result = evaluate(expression).map_err(|reason| ToolError::Execution {
            tool: "calculate".to_string(),
            reason,
        })?;
        // Integers render without a trailing ".0" so answers read naturally.
        let rendered = if result.fract() == 0.0 && result.abs() < 1e15 {
            format!("{}", result as i64)
        } else {
            format!("{result}")
        };
        Ok(json!({"expression": expression, "result": result, "rendered": rendered}))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("bad number literal `{literal}`"))?;
                tokens.push(Token::Number(value));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(tokens)
}

/// Recursive-descent evaluation with standard precedence.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.next();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.next();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.next();
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.next();
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::Plus) => self.factor(),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

pub(crate) fn evaluate(input: &str) -> Result<f64, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing tokens in expression".to_string());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        assert_eq!(evaluate("15 + 27 * 2").unwrap(), 69.0);
    }

    #[test]
    fn parentheses_override_precedence() {
        assert_eq!(evaluate("(15 + 27) * 2").unwrap(), 84.0);
    }

    #[test]
    fn unary_minus() {
        assert_eq!(evaluate("-4 + 10").unwrap(), 6.0);
        assert_eq!(evaluate("3 * -2").unwrap(), -6.0);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(evaluate("1 / 0").is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(evaluate("2 +* 2").is_err());
        assert!(evaluate("hello").is_err());
        assert!(evaluate("").is_err());
    }

    #[tokio::test]
    async fn tool_renders_integer_results_without_decimal() {
        let tool = CalculateTool;
        let ctx = ToolContext::new("s1", "u1");
        let out = tool
            .execute(serde_json::json!({"expression": "15 + 27 * 2"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["rendered"], "69");
    }
}
