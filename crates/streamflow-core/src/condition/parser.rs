//! Recursive-descent parser from tokens to an expression tree.
//!
//! ```text
//! expr       := or
//! or         := and (("||" | "or") and)*
//! and        := unary (("&&" | "and") unary)*
//! unary      := ("!" | "not") unary | comparison
//! comparison := operand (cmp operand)?
//! operand    := literal | placeholder | path | "(" expr ")"
//! path       := ident ("." ident ("(" args? ")")?)*
//! ```

use serde_json::Value;

use super::ConditionError;
use super::lexer::Token;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Path(Path),
    Placeholder(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    pub(crate) fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Path {
    pub root: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Field(String),
    Method(Method, Vec<Expr>),
}

/// String predicates and size helpers available on path values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Len,
    IsEmpty,
    Contains,
    StartsWith,
    EndsWith,
}

impl Method {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "len" | "length" | "size" => Some(Method::Len),
            "isEmpty" => Some(Method::IsEmpty),
            "contains" => Some(Method::Contains),
            "startsWith" => Some(Method::StartsWith),
            "endsWith" => Some(Method::EndsWith),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Method::Len | Method::IsEmpty => 0,
            Method::Contains | Method::StartsWith | Method::EndsWith => 1,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Method::Len => "len",
            Method::IsEmpty => "isEmpty",
            Method::Contains => "contains",
            Method::StartsWith => "startsWith",
            Method::EndsWith => "endsWith",
        }
    }
}

pub(crate) fn parse(rule: &str, tokens: Vec<Token>) -> Result<Expr, ConditionError> {
    let mut parser = Parser {
        rule,
        tokens,
        pos: 0,
    };
    if parser.tokens.is_empty() {
        return Err(ConditionError::grammar(rule, "empty rule"));
    }
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(parser.error(format!("unexpected {token:?}"))),
    }
}

struct Parser<'a> {
    rule: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> ConditionError {
        ConditionError::grammar(self.rule, message)
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

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ConditionError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.eat(&Token::And) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.operand()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn operand(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n, fractional)) => Ok(Expr::Literal(number(n, fractional))),
            Some(Token::Minus) => match self.next() {
                Some(Token::Number(n, fractional)) => Ok(Expr::Literal(number(-n, fractional))),
                _ => Err(self.error("expected a number after `-`")),
            },
            Some(Token::Placeholder(name)) => Ok(Expr::Placeholder(name)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(&Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::Ident(root)) => self.path(root),
            Some(token) => Err(self.error(format!("unexpected {token:?}"))),
            None => Err(self.error("unexpected end of rule")),
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, ConditionError> {
        let mut segments = Vec::new();
        while self.eat(&Token::Dot) {
            let Some(Token::Ident(name)) = self.next() else {
                return Err(self.error("expected a name after `.`"));
            };
            if !self.eat(&Token::LParen) {
                segments.push(Segment::Field(name));
                continue;
            }
            let method = Method::lookup(&name)
                .ok_or_else(|| self.error(format!("unknown method `{name}`")))?;
            let args = self.arguments()?;
            if args.len() != method.arity() {
                return Err(self.error(format!(
                    "`{}` takes {} argument(s), got {}",
                    method.name(),
                    method.arity(),
                    args.len()
                )));
            }
            segments.push(Segment::Method(method, args));
        }
        if self.peek() == Some(&Token::LParen) {
            return Err(self.error(format!("`{root}` is not callable")));
        }
        Ok(Expr::Path(Path { root, segments }))
    }

    /// Arguments after an already consumed `(`.
    fn arguments(&mut self) -> Result<Vec<Expr>, ConditionError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma, "`,` or `)`")?;
        }
    }
}

fn number(n: f64, fractional: bool) -> Value {
    if !fractional && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}
