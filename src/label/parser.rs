//! Recursive-descent parser over the token stream.

use serde_json::{Map, Value};

use crate::label::lexer::{tokenize, Token, TokenKind};
use crate::label::ParseError;

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParseError> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    /// Parse the whole document and return the single `service` block body.
    pub fn parse_document(&mut self) -> Result<Map<String, Value>, ParseError> {
        let mut service: Option<Map<String, Value>> = None;

        while self.peek().kind != TokenKind::Eof {
            let name = self.expect_ident()?;
            if self.peek().kind == TokenKind::Equals {
                // Top-level attribute: evaluated for well-formedness, ignored.
                self.advance();
                self.parse_value()?;
                continue;
            }
            let body = self.parse_block_rest()?;
            if name == "service" {
                if service.is_some() {
                    return Err(ParseError::MultipleServiceBlocks);
                }
                service = Some(body);
            }
        }

        service.ok_or(ParseError::MissingServiceBlock)
    }

    /// Parse block labels and the braced body, the block name having already
    /// been consumed.
    fn parse_block_rest(&mut self) -> Result<Map<String, Value>, ParseError> {
        // Optional string labels are parsed and discarded.
        while matches!(self.peek().kind, TokenKind::Str(_)) {
            self.advance();
        }
        self.expect(TokenKind::LBrace)?;
        let body = self.parse_body()?;
        self.expect(TokenKind::RBrace)?;
        Ok(body)
    }

    /// Parse attributes and nested blocks until the closing brace.
    /// Same-type sibling blocks overwrite earlier ones.
    fn parse_body(&mut self) -> Result<Map<String, Value>, ParseError> {
        let mut out = Map::new();
        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::RBrace | TokenKind::Eof => return Ok(out),
                TokenKind::Ident(_) => {
                    let name = self.expect_ident()?;
                    if self.peek().kind == TokenKind::Equals {
                        self.advance();
                        let value = self.parse_value()?;
                        out.insert(name, value);
                    } else {
                        let body = self.parse_block_rest()?;
                        out.insert(name, Value::Object(body));
                    }
                }
                _ => return Err(self.unexpected(&token, "attribute or block")),
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Str(s) => {
                self.advance();
                Ok(Value::String(s))
            }
            TokenKind::Int(n) => {
                self.advance();
                Ok(Value::from(n))
            }
            TokenKind::Ident(ref word) => {
                self.advance();
                match word.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    // Bare identifiers have no evaluation context; they
                    // become an explicit null rather than an error.
                    _ => Ok(Value::Null),
                }
            }
            TokenKind::LBracket => self.parse_sequence(),
            TokenKind::LBrace => self.parse_object(),
            _ => Err(self.unexpected(&token, "value")),
        }
    }

    fn parse_sequence(&mut self) -> Result<Value, ParseError> {
        self.expect(TokenKind::LBracket)?;
        let mut items = Vec::new();
        loop {
            if self.peek().kind == TokenKind::RBracket {
                self.advance();
                return Ok(Value::Array(items));
            }
            items.push(self.parse_value()?);
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            }
        }
    }

    /// Object expression: `{ key = value, key : value, ... }`. Keys may be
    /// identifiers or strings; separators are commas or plain whitespace.
    fn parse_object(&mut self) -> Result<Value, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut out = Map::new();
        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::RBrace => {
                    self.advance();
                    return Ok(Value::Object(out));
                }
                TokenKind::Ident(key) => {
                    self.advance();
                    self.expect_assign()?;
                    out.insert(key, self.parse_value()?);
                }
                TokenKind::Str(key) => {
                    self.advance();
                    self.expect_assign()?;
                    out.insert(key, self.parse_value()?);
                }
                TokenKind::Comma => {
                    self.advance();
                }
                _ => return Err(self.unexpected(&token, "object key")),
            }
        }
    }

    fn expect_assign(&mut self) -> Result<(), ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Equals | TokenKind::Colon => {
                self.advance();
                Ok(())
            }
            _ => Err(self.unexpected(&token, "'=' or ':'")),
        }
    }

    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        let token = self.peek().clone();
        if token.kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&token, &kind.describe()))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(&token, "identifier")),
        }
    }

    fn unexpected(&self, token: &Token, expected: &str) -> ParseError {
        ParseError::Syntax {
            line: token.line,
            col: token.col,
            message: format!("expected {expected}, found {}", token.kind.describe()),
        }
    }
}
