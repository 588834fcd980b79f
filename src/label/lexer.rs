//! Tokenizer for the label mini-language.

use crate::label::ParseError;

/// A lexical token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Ident(String),
    Str(String),
    /// Integer literal; fractional parts are truncated toward zero.
    Int(i64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Equals,
    Colon,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) => format!("identifier '{s}'"),
            TokenKind::Str(_) => "string".to_string(),
            TokenKind::Int(n) => format!("number {n}"),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Equals => "'='".to_string(),
            TokenKind::Colon => "':'".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

/// Tokenize the full input up front. Label values are tiny, so a single
/// pass into a Vec keeps the parser free of lexer state.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        chars: input.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            line: self.line,
            col: self.col,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => self.skip_line_comment(),
                Some('/') if self.peek2() == Some('/') => self.skip_line_comment(),
                Some('/') if self.peek2() == Some('*') => self.skip_block_comment()?,
                _ => return Ok(()),
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), ParseError> {
        self.bump(); // '/'
        self.bump(); // '*'
        loop {
            match self.peek() {
                Some('*') if self.peek2() == Some('/') => {
                    self.bump();
                    self.bump();
                    return Ok(());
                }
                Some(_) => {
                    self.bump();
                }
                None => return Err(self.error("unterminated block comment")),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        self.skip_trivia()?;
        let (line, col) = (self.line, self.col);
        let kind = match self.peek() {
            None => TokenKind::Eof,
            Some('{') => {
                self.bump();
                TokenKind::LBrace
            }
            Some('}') => {
                self.bump();
                TokenKind::RBrace
            }
            Some('[') => {
                self.bump();
                TokenKind::LBracket
            }
            Some(']') => {
                self.bump();
                TokenKind::RBracket
            }
            Some(',') => {
                self.bump();
                TokenKind::Comma
            }
            Some('=') => {
                self.bump();
                TokenKind::Equals
            }
            Some(':') => {
                self.bump();
                TokenKind::Colon
            }
            Some('"') => self.lex_string()?,
            Some(c) if c == '-' || c.is_ascii_digit() => self.lex_number()?,
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.lex_ident(),
            Some(c) => return Err(self.error(format!("unexpected character '{c}'"))),
        };
        Ok(Token { kind, line, col })
    }

    fn lex_string(&mut self) -> Result<TokenKind, ParseError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(TokenKind::Str(out)),
                Some('\\') => match self.bump() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some(c) => return Err(self.error(format!("unknown escape '\\{c}'"))),
                    None => return Err(self.error("unterminated string")),
                },
                Some('\n') | None => return Err(self.error("unterminated string")),
                Some(c) => out.push(c),
            }
        }
    }

    fn lex_number(&mut self) -> Result<TokenKind, ParseError> {
        let mut raw = String::new();
        if self.peek() == Some('-') {
            raw.push('-');
            self.bump();
        }
        if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
            return Err(self.error("expected digit after '-'"));
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                raw.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // Fractional part is consumed and truncated toward zero.
        if self.peek() == Some('.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        raw.parse::<i64>()
            .map(TokenKind::Int)
            .map_err(|_| self.error(format!("integer literal '{raw}' out of range")))
    }

    fn lex_ident(&mut self) -> TokenKind {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        TokenKind::Ident(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds(r#"service { port = 8080 }"#),
            vec![
                TokenKind::Ident("service".into()),
                TokenKind::LBrace,
                TokenKind::Ident("port".into()),
                TokenKind::Equals,
                TokenKind::Int(8080),
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_negative_and_fractional_numbers() {
        assert_eq!(kinds("-12"), vec![TokenKind::Int(-12), TokenKind::Eof]);
        assert_eq!(kinds("3.99"), vec![TokenKind::Int(3), TokenKind::Eof]);
    }

    #[test]
    fn test_unterminated_string_errors() {
        assert!(tokenize(r#""abc"#).is_err());
    }

    #[test]
    fn test_position_tracking() {
        let tokens = tokenize("a\n  b").unwrap();
        assert_eq!((tokens[1].line, tokens[1].col), (2, 3));
    }
}
