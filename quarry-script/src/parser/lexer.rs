//! Lexer for the pipeline DSL.
//!
//! A hand-written scanner with two characters of lookahead. Three token
//! shapes: quoted strings (quotes kept verbatim), inline `{{ ... }}` blocks
//! (body kept verbatim), and whitespace-delimited bare words, which are
//! promoted to keywords on exact match.

use std::str::Chars;

use thiserror::Error;

use super::token::Token;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("EOF encountered while reading string starting at line {line}")]
    UnterminatedString { line: u32 },

    #[error("EOF encountered while reading block starting at line {line}")]
    UnterminatedBlock { line: u32 },
}

pub struct Lexer<'a> {
    source: Chars<'a>,
    cur: Option<char>,
    peek: Option<char>,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Self {
            source: source.chars(),
            cur: None,
            peek: None,
            line: 1,
        };
        lexer.bump();
        lexer.bump();
        lexer
    }

    fn bump(&mut self) {
        if self.cur == Some('\n') {
            self.line += 1;
        }
        self.cur = self.peek;
        self.peek = self.source.next();
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.cur, Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>, LexError> {
        self.skip_whitespace();
        let Some(c) = self.cur else { return Ok(None) };
        if c == '\'' || c == '"' {
            return self.read_string(c).map(Some);
        }
        if c == '{' && self.peek == Some('{') {
            return self.read_block().map(Some);
        }
        Ok(Some(self.read_word()))
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let line = self.line;
        let mut text = String::new();
        text.push(quote);
        self.bump();
        loop {
            match self.cur {
                None => return Err(LexError::UnterminatedString { line }),
                Some('\\') => {
                    // A backslash escapes exactly one character, kept verbatim.
                    text.push('\\');
                    self.bump();
                    match self.cur {
                        Some(escaped) => {
                            text.push(escaped);
                            self.bump();
                        }
                        None => return Err(LexError::UnterminatedString { line }),
                    }
                }
                Some(c) if c == quote => {
                    text.push(c);
                    self.bump();
                    return Ok(Token::word(text, line));
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn read_block(&mut self) -> Result<Token, LexError> {
        let line = self.line;
        self.bump();
        self.bump();
        let mut text = String::new();
        loop {
            match (self.cur, self.peek) {
                (Some('}'), Some('}')) => {
                    self.bump();
                    self.bump();
                    return Ok(Token::block(text, line));
                }
                (Some(c), _) => {
                    text.push(c);
                    self.bump();
                }
                (None, _) => return Err(LexError::UnterminatedBlock { line }),
            }
        }
    }

    fn read_word(&mut self) -> Token {
        let line = self.line;
        let mut text = String::new();
        while let Some(c) = self.cur {
            if c.is_whitespace() {
                break;
            }
            text.push(c);
            self.bump();
        }
        Token::word(text, line)
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}

/// Tokenize a full source string.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).collect()
}
