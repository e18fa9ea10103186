//! Rule tokenizer.

use std::iter::Peekable;
use std::str::CharIndices;

use super::ConditionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Number(f64, bool),
    Str(String),
    /// Legacy `{{name}}` placeholder.
    Placeholder(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    And,
    Or,
    Not,
    Minus,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

pub(crate) fn tokenize(rule: &str) -> Result<Vec<Token>, ConditionError> {
    Lexer {
        rule,
        chars: rule.char_indices().peekable(),
    }
    .run()
}

struct Lexer<'a> {
    rule: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Lexer<'_> {
    fn run(mut self) -> Result<Vec<Token>, ConditionError> {
        let mut tokens = Vec::new();
        while let Some(&(pos, c)) = self.chars.peek() {
            let token = match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                    continue;
                }
                '.' => {
                    self.chars.next();
                    if self.eat('.') {
                        return Err(self.error(pos, "empty path segment"));
                    }
                    Token::Dot
                }
                ',' => self.single(Token::Comma),
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '-' => self.single(Token::Minus),
                '&' => self.double('&', Token::And, pos)?,
                '|' => self.double('|', Token::Or, pos)?,
                '=' => self.double('=', Token::Eq, pos)?,
                '!' => {
                    self.chars.next();
                    if self.eat('=') { Token::Ne } else { Token::Not }
                }
                '>' => {
                    self.chars.next();
                    if self.eat('=') { Token::Ge } else { Token::Gt }
                }
                '<' => {
                    self.chars.next();
                    if self.eat('=') { Token::Le } else { Token::Lt }
                }
                '\'' | '"' => self.string(c, pos)?,
                '{' => self.placeholder(pos)?,
                c if c.is_ascii_digit() => self.number(pos)?,
                c if is_ident_start(c) => self.word(),
                other => return Err(self.error(pos, format!("unexpected character `{other}`"))),
            };
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> ConditionError {
        ConditionError::grammar(self.rule, format!("{} at offset {pos}", message.into()))
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().is_some_and(|&(_, c)| c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn double(&mut self, second: char, token: Token, pos: usize) -> Result<Token, ConditionError> {
        self.chars.next();
        if self.eat(second) {
            Ok(token)
        } else {
            Err(self.error(pos, format!("expected `{second}{second}`")))
        }
    }

    fn string(&mut self, quote: char, pos: usize) -> Result<Token, ConditionError> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(Token::Str(out)),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                Some((_, c)) => out.push(c),
                None => break,
            }
        }
        Err(self.error(pos, "unterminated string literal"))
    }

    fn placeholder(&mut self, pos: usize) -> Result<Token, ConditionError> {
        self.chars.next();
        if !self.eat('{') {
            return Err(self.error(pos, "expected `{{`"));
        }
        let mut name = String::new();
        loop {
            match self.chars.next() {
                Some((_, '}')) => {
                    if !self.eat('}') {
                        return Err(self.error(pos, "expected `}}`"));
                    }
                    let name = name.trim();
                    if name.is_empty() || name.split('.').any(str::is_empty) {
                        return Err(self.error(pos, "malformed placeholder"));
                    }
                    return Ok(Token::Placeholder(name.to_string()));
                }
                Some((_, c)) => name.push(c),
                None => return Err(self.error(pos, "unterminated placeholder")),
            }
        }
    }

    fn number(&mut self, pos: usize) -> Result<Token, ConditionError> {
        let mut text = String::new();
        let mut fractional = false;
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '.' && !fractional {
                // `1.5` is a number, `1.len()` is not.
                let mut ahead = self.chars.clone();
                ahead.next();
                if !ahead.peek().is_some_and(|&(_, d)| d.is_ascii_digit()) {
                    break;
                }
                fractional = true;
                text.push(c);
            } else {
                break;
            }
            self.chars.next();
        }
        text.parse::<f64>()
            .map(|n| Token::Number(n, fractional))
            .map_err(|_| self.error(pos, format!("invalid number `{text}`")))
    }

    fn word(&mut self) -> Token {
        let mut word = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if is_ident_continue(c) {
                word.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        match word.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Ident(word),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
