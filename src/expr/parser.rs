//! Recursive-descent expression parser
//!
//! Produces a small AST evaluated against a typed context map. The grammar
//! is deliberately closed: property access, literals, arithmetic, string
//! concatenation, comparisons, boolean logic, a ternary conditional and a
//! fixed set of builtin functions. No assignments, no loops, no arbitrary
//! code execution.
//!
//! Precedence (lowest to highest):
//! `?:` < `||` < `&&` < `== !=` < `< <= > >=` < `+ -` < `* / %` < unary < postfix

use serde_json::Value;

use super::ExpressionError;
use super::token::{Token, tokenize};

/// Parsed expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal JSON scalar (number, string, bool, null)
    Literal(Value),
    /// Context root lookup by identifier
    Root(String),
    /// Property access: `target.field`
    Field(Box<Expr>, String),
    /// Index access: `target[expr]` (array index or object key)
    Index(Box<Expr>, Box<Expr>),
    /// Builtin function call
    Call(String, Vec<Expr>),
    /// Unary operator
    Unary(UnaryOp, Box<Expr>),
    /// Binary operator
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Conditional: `cond ? then : otherwise`
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// Parse an expression string into an AST
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        source: input,
        tokens,
        pos: 0,
    };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExpressionError::Parse {
            expr: input.to_string(),
            message: format!("unexpected trailing token {:?}", parser.tokens[parser.pos]),
        });
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
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

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {expected:?}, found {:?}", self.peek())))
        }
    }

    fn error(&self, message: String) -> ExpressionError {
        ExpressionError::Parse {
            expr: self.source.to_string(),
            message,
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.ternary()?;
            self.expect(Token::Colon)?;
            let otherwise = self.ternary()?;
            Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ))
        } else {
            Ok(cond)
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::And) {
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            let expr = self.unary()?;
            Ok(Expr::Unary(UnaryOp::Not, Box::new(expr)))
        } else if self.eat(&Token::Minus) {
            let expr = self.unary()?;
            Ok(Expr::Unary(UnaryOp::Neg, Box::new(expr)))
        } else {
            self.postfix()
        }
    }

    /// Postfix access chain: `.field` and `[index]` on any primary
    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(field)) => {
                        expr = Expr::Field(Box::new(expr), field);
                    }
                    other => {
                        return Err(self.error(format!(
                            "expected property name after '.', found {other:?}"
                        )));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.ternary()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(super::eval::number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(Token::RParen)?;
                            break;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Root(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse("42").unwrap(), Expr::Literal(json!(42)));
        assert_eq!(
            parse("'hi'").unwrap(),
            Expr::Literal(Value::String("hi".to_string()))
        );
    }

    #[test]
    fn test_parse_path() {
        let expr = parse("webhook.body.commits[0].message").unwrap();
        // Innermost is the root lookup
        let Expr::Field(target, field) = expr else {
            panic!("expected field access");
        };
        assert_eq!(field, "message");
        assert!(matches!(*target, Expr::Index(_, _)));
    }

    #[test]
    fn test_parse_precedence() {
        // 2 + 3 * 4 parses as 2 + (3 * 4)
        let expr = parse("2 + 3 * 4").unwrap();
        let Expr::Binary(BinaryOp::Add, _, rhs) = expr else {
            panic!("expected addition at top level");
        };
        assert!(matches!(*rhs, Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn test_parse_ternary() {
        let expr = parse("a > 1 ? 'big' : 'small'").unwrap();
        assert!(matches!(expr, Expr::Ternary(_, _, _)));
    }

    #[test]
    fn test_parse_call() {
        let expr = parse("length(webhook.body)").unwrap();
        let Expr::Call(name, args) = expr else {
            panic!("expected call");
        };
        assert_eq!(name, "length");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(parse("1 2").is_err());
        assert!(parse("a ?").is_err());
    }
}
