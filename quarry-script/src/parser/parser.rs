//! Recursive descent parser for the pipeline DSL.
//!
//! The grammar is keyword-directed: every expression begins with a keyword
//! (`get`, `post`, `send`, `wait`, `process`, `then`) or is a bare
//! identifier. Free-form host expression text is captured by buffering
//! tokens up to the next keyword and joining their spellings with single
//! spaces; the host-code bridge parses that text at evaluation time.

use quarry_client::Method;
use thiserror::Error;

use super::ast::*;
use super::lexer::{LexError, tokenize};
use super::token::{Keyword, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("Expected: {expected}, got: {found}, at line {line}")]
    Unexpected {
        expected: String,
        found: String,
        line: u32,
    },

    #[error("Expected: {expected}, got: EOF")]
    UnexpectedEof { expected: String },

    #[error("url required, at line {line}")]
    UrlRequired { line: u32 },

    #[error("url required, got EOF")]
    UrlRequiredEof,
}

impl ParseError {
    fn unexpected(expected: &str, token: &Token) -> Self {
        ParseError::Unexpected {
            expected: expected.to_string(),
            found: token.text().to_string(),
            line: token.line,
        }
    }

    fn eof(expected: &str) -> Self {
        ParseError::UnexpectedEof {
            expected: expected.to_string(),
        }
    }
}

type ParseResult<T> = Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> ParseResult<Self> {
        Ok(Self::from_tokens(tokenize(source)?))
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse(&mut self) -> ParseResult<Program> {
        let mut program = Program::default();
        while self.peek().is_some() {
            program.statements.push(self.parse_stmt()?);
        }
        Ok(program)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self) -> Option<Keyword> {
        self.peek().and_then(Token::keyword)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Consume the next token and check its spelling against `accept`.
    fn expect(&mut self, expected: &str, accept: &[&str]) -> ParseResult<Token> {
        match self.advance() {
            None => Err(ParseError::eof(expected)),
            Some(token) if accept.contains(&token.text()) => Ok(token),
            Some(token) => Err(ParseError::unexpected(expected, &token)),
        }
    }

    /// Buffer tokens until the next keyword (or EOF).
    fn cache_until_keyword(&mut self) -> Vec<Token> {
        let mut cache = Vec::new();
        while let Some(token) = self.peek() {
            if token.keyword().is_some() {
                break;
            }
            cache.push(token.clone());
            self.pos += 1;
        }
        cache
    }

    // ========================================
    // Statements
    // ========================================

    fn parse_stmt(&mut self) -> ParseResult<Stmt> {
        if self.peek_keyword() == Some(Keyword::Let) {
            self.parse_let_stmt()
        } else {
            Ok(Stmt::Expr(self.parse_expr()?))
        }
    }

    fn parse_let_stmt(&mut self) -> ParseResult<Stmt> {
        self.advance();
        let name = match self.advance() {
            None => return Err(ParseError::eof("identifier")),
            Some(token) => token.text().to_string(),
        };
        self.expect("=", &["="])?;
        let expr = self.parse_expr()?;
        Ok(Stmt::Let { name, expr })
    }

    // ========================================
    // Expressions
    // ========================================

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_expr_inner(false)
    }

    fn parse_expr_inner(&mut self, implicit: bool) -> ParseResult<Expr> {
        match self.peek_keyword() {
            Some(Keyword::Get) | Some(Keyword::Post) => self.parse_request_expr(implicit),
            Some(Keyword::Send) => {
                self.advance();
                Ok(Expr::Future(Box::new(self.parse_operand(implicit)?)))
            }
            Some(Keyword::Wait) => {
                self.advance();
                Ok(Expr::Response(Box::new(self.parse_operand(implicit)?)))
            }
            Some(Keyword::Process) => self.parse_result_expr(implicit),
            Some(Keyword::Then) => {
                self.advance();
                Ok(Expr::Then(Box::new(self.parse_expr_inner(true)?)))
            }
            _ => self.parse_identifier_expr(),
        }
    }

    /// The inner expression of `send`/`wait`/`process`: the implicit-input
    /// placeholder under `then`, a sub-expression otherwise.
    fn parse_operand(&mut self, implicit: bool) -> ParseResult<Expr> {
        if implicit {
            Ok(Expr::Placeholder)
        } else {
            self.parse_expr()
        }
    }

    fn parse_identifier_expr(&mut self) -> ParseResult<Expr> {
        match self.advance() {
            None => Err(ParseError::eof("expression")),
            Some(Token {
                kind: TokenKind::Word(text),
                ..
            }) => Ok(Expr::Ident(text)),
            Some(token) => Err(ParseError::unexpected("expression", &token)),
        }
    }

    fn parse_request_expr(&mut self, implicit: bool) -> ParseResult<Expr> {
        let method = match self.peek_keyword() {
            Some(Keyword::Post) => Method::Post,
            _ => Method::Get,
        };
        self.advance();
        match method {
            Method::Get => self.expect("from", &["from"])?,
            Method::Post => self.expect("to", &["to"])?,
        };

        let mut request = RequestExpr::new(method);
        if implicit {
            request.url = Slot::Placeholder;
        } else {
            let cache = self.cache_until_keyword();
            if cache.is_empty() {
                return Err(match self.peek() {
                    Some(token) => ParseError::UrlRequired { line: token.line },
                    None => ParseError::UrlRequiredEof,
                });
            }
            request.url = Slot::Host(join_text(&cache));
        }

        if self.peek_keyword() == Some(Keyword::With) {
            self.advance();
            loop {
                let clause = match self.peek_keyword() {
                    Some(
                        keyword @ (Keyword::Timeout
                        | Keyword::Retry
                        | Keyword::Sleep
                        | Keyword::Set),
                    ) => keyword,
                    _ => break,
                };
                self.advance();
                let cache = self.cache_until_keyword();
                match clause {
                    Keyword::Timeout => {
                        request.timeout = Slot::Interval(self.parse_time_interval(&cache)?);
                    }
                    Keyword::Retry => {
                        let (retry, retry_interval) = self.parse_retry(&cache)?;
                        request.retry = retry;
                        request.retry_interval = retry_interval;
                    }
                    Keyword::Sleep => {
                        request.sleep = Slot::Interval(self.parse_sleep(&cache)?);
                    }
                    Keyword::Set => request.set_list.push(self.parse_set(&cache)?),
                    _ => unreachable!("filtered above"),
                }
            }
        }

        Ok(Expr::Request(request))
    }

    fn parse_result_expr(&mut self, implicit: bool) -> ParseResult<Expr> {
        self.advance();
        let input = self.parse_operand(implicit)?;
        let mut branches = Vec::new();
        while matches!(
            self.peek_keyword(),
            Some(Keyword::Whose | Keyword::Otherwise | Keyword::As)
        ) {
            branches.push(self.parse_branch()?);
        }
        Ok(Expr::Result {
            input: Box::new(input),
            branches,
        })
    }

    // ========================================
    // Clauses
    // ========================================

    fn parse_time_interval(&self, cache: &[Token]) -> ParseResult<TimeInterval> {
        let num = cache.first().ok_or_else(|| ParseError::eof("number"))?;
        let unit = cache
            .get(1)
            .ok_or_else(|| ParseError::eof("second|minute"))?;
        let multiplier = match unit.text() {
            "second" | "seconds" => 1,
            "minute" | "minutes" => 60,
            _ => return Err(ParseError::unexpected("second|minute", unit)),
        };
        Ok(TimeInterval {
            num: num.text().to_string(),
            multiplier,
        })
    }

    /// `N time[s]` and `at T <unit> apart` in either order; the last
    /// occurrence of each wins, missing parts stay `None`.
    fn parse_retry(&self, cache: &[Token]) -> ParseResult<(Slot, Slot)> {
        let mut retry = Slot::Host("None".to_string());
        let mut retry_interval = Slot::Host("None".to_string());
        let mut rest = cache;
        while !rest.is_empty() {
            if rest[0].text() == "at" {
                let end = rest.len().min(3);
                retry_interval = Slot::Interval(self.parse_time_interval(&rest[1..end])?);
                match rest.get(3) {
                    None => return Err(ParseError::eof("apart")),
                    Some(token) if token.text() == "apart" => {}
                    Some(token) => return Err(ParseError::unexpected("apart", token)),
                }
                rest = &rest[4..];
            } else {
                retry = Slot::Host(rest[0].text().to_string());
                match rest.get(1) {
                    None => return Err(ParseError::eof("time")),
                    Some(token) if matches!(token.text(), "time" | "times") => {}
                    Some(token) => return Err(ParseError::unexpected("time", token)),
                }
                rest = &rest[2..];
            }
        }
        Ok((retry, retry_interval))
    }

    fn parse_sleep(&self, cache: &[Token]) -> ParseResult<TimeInterval> {
        match cache.get(2) {
            None => return Err(ParseError::eof("per")),
            Some(token) if token.text() == "per" => {}
            Some(token) => return Err(ParseError::unexpected("per", token)),
        }
        match cache.get(3) {
            None => return Err(ParseError::eof("request")),
            Some(token) if token.text() == "request" => {}
            Some(token) => return Err(ParseError::unexpected("request", token)),
        }
        self.parse_time_interval(&cache[..2])
    }

    fn parse_set(&self, cache: &[Token]) -> ParseResult<SetClause> {
        let key = cache
            .first()
            .ok_or_else(|| ParseError::eof("set key"))?
            .text()
            .to_string();
        match cache.get(1) {
            None => return Err(ParseError::eof("equals")),
            Some(token) if token.text() == "equals" => {}
            Some(token) => return Err(ParseError::unexpected("equals", token)),
        }
        if cache.len() < 4 {
            return Err(ParseError::eof("in"));
        }
        let in_token = &cache[cache.len() - 2];
        if in_token.text() != "in" {
            return Err(ParseError::unexpected("in", in_token));
        }
        let field = cache[cache.len() - 1].text().to_string();
        let value = join_text(&cache[2..cache.len() - 2]);
        Ok(SetClause { key, value, field })
    }

    // ========================================
    // Branches
    // ========================================

    fn parse_branch(&mut self) -> ParseResult<Branch> {
        if self.peek_keyword() == Some(Keyword::Otherwise) {
            self.advance();
            if self.peek_keyword() != Some(Keyword::As) {
                return Err(match self.peek() {
                    Some(token) => ParseError::unexpected("as", token),
                    None => ParseError::eof("as"),
                });
            }
        }

        if self.peek_keyword() == Some(Keyword::As) {
            self.advance();
            let (content_type, action) = self.parse_branch_tail()?;
            return Ok(Branch {
                attr: None,
                test_op: None,
                test_obj: None,
                content_type,
                action,
            });
        }

        // whose ATTR OP OBJ... as TYPE with ACTION
        self.advance();
        let attr = match self.advance() {
            None => return Err(ParseError::eof("attribute")),
            Some(token) => token.text().to_string(),
        };
        let test_op = self.parse_test_op()?;
        let mut cache = Vec::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::eof("as")),
                Some(token) if token.is_keyword(Keyword::As) => break,
                Some(token) => {
                    cache.push(token.clone());
                    self.pos += 1;
                }
            }
        }
        let test_obj = join_text(&cache);
        self.advance();
        let (content_type, action) = self.parse_branch_tail()?;
        Ok(Branch {
            attr: Some(attr),
            test_op: Some(test_op),
            test_obj: Some(test_obj),
            content_type,
            action,
        })
    }

    fn parse_branch_tail(&mut self) -> ParseResult<(String, Action)> {
        let content_type = match self.advance() {
            None => return Err(ParseError::eof("content type")),
            Some(token) => token.text().to_string(),
        };
        self.expect("with", &["with"])?;
        let action = match self.advance() {
            None => return Err(ParseError::eof("action")),
            Some(Token {
                kind: TokenKind::Block(text),
                ..
            }) => Action::Block(text),
            Some(Token {
                kind: TokenKind::Word(text),
                ..
            }) => Action::Ident(text),
            Some(token) => return Err(ParseError::unexpected("action", &token)),
        };
        Ok((content_type, action))
    }

    /// Multi-word test operators, longest match: `equals`, `does not equal`,
    /// `contains`, `does not contain`.
    fn parse_test_op(&mut self) -> ParseResult<TestOp> {
        const EXPECTED: &str = "equals|does not equal|contains|does not contain";
        let first = self.advance().ok_or_else(|| ParseError::eof(EXPECTED))?;
        match first.text() {
            "equals" => Ok(TestOp::Eq),
            "contains" => Ok(TestOp::In),
            "does" => {
                match self.advance() {
                    None => return Err(ParseError::eof("not")),
                    Some(token) if token.text() == "not" => {}
                    Some(token) => return Err(ParseError::unexpected("not", &token)),
                }
                match self.advance() {
                    None => Err(ParseError::eof("equal|contain")),
                    Some(token) if token.text() == "equal" => Ok(TestOp::Ne),
                    Some(token) if token.text() == "contain" => Ok(TestOp::NotIn),
                    Some(token) => Err(ParseError::unexpected("equal|contain", &token)),
                }
            }
            _ => Err(ParseError::unexpected(EXPECTED, &first)),
        }
    }
}

fn join_text(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(Token::text)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a full source string into a program.
pub fn parse(source: &str) -> ParseResult<Program> {
    Parser::new(source)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_err(source: &str) -> String {
        parse(source).unwrap_err().to_string()
    }

    #[test]
    fn test_reference_program() {
        let source = r#"
            let request = get from 'http://example.com/s' with
                            timeout 5 minutes
                            retry 3 times at 10 seconds apart
                            sleep 1 second per request
                            set wd equals 'x' in query

            let future = send request

            let response = wait future

            process response
                whose status equals 200 as html with {{
                    first title
                }}
                otherwise as bytes with {{
                    nothing
                }}

            post to 'another str'

            then process as bytes with {{
                nothing
            }}
        "#;

        let expected = Program {
            statements: vec![
                Stmt::Let {
                    name: "request".into(),
                    expr: Expr::Request(RequestExpr {
                        method: Method::Get,
                        url: Slot::Host("'http://example.com/s'".into()),
                        timeout: Slot::Interval(TimeInterval {
                            num: "5".into(),
                            multiplier: 60,
                        }),
                        retry: Slot::Host("3".into()),
                        retry_interval: Slot::Interval(TimeInterval {
                            num: "10".into(),
                            multiplier: 1,
                        }),
                        sleep: Slot::Interval(TimeInterval {
                            num: "1".into(),
                            multiplier: 1,
                        }),
                        set_list: vec![SetClause {
                            key: "wd".into(),
                            value: "'x'".into(),
                            field: "query".into(),
                        }],
                    }),
                },
                Stmt::Let {
                    name: "future".into(),
                    expr: Expr::Future(Box::new(Expr::Ident("request".into()))),
                },
                Stmt::Let {
                    name: "response".into(),
                    expr: Expr::Response(Box::new(Expr::Ident("future".into()))),
                },
                Stmt::Expr(Expr::Result {
                    input: Box::new(Expr::Ident("response".into())),
                    branches: vec![
                        Branch {
                            attr: Some("status".into()),
                            test_op: Some(TestOp::Eq),
                            test_obj: Some("200".into()),
                            content_type: "html".into(),
                            action: Action::Block(
                                "\n                    first title\n                ".into(),
                            ),
                        },
                        Branch {
                            attr: None,
                            test_op: None,
                            test_obj: None,
                            content_type: "bytes".into(),
                            action: Action::Block(
                                "\n                    nothing\n                ".into(),
                            ),
                        },
                    ],
                }),
                Stmt::Expr(Expr::Request(RequestExpr {
                    method: Method::Post,
                    url: Slot::Host("'another str'".into()),
                    timeout: Slot::Empty,
                    retry: Slot::Empty,
                    retry_interval: Slot::Empty,
                    sleep: Slot::Empty,
                    set_list: vec![],
                })),
                Stmt::Expr(Expr::Then(Box::new(Expr::Result {
                    input: Box::new(Expr::Placeholder),
                    branches: vec![Branch {
                        attr: None,
                        test_op: None,
                        test_obj: None,
                        content_type: "bytes".into(),
                        action: Action::Block("\n                nothing\n            ".into()),
                    }],
                }))),
            ],
        };

        assert_eq!(parse(source).unwrap(), expected);
    }

    #[test]
    fn test_url_list() {
        let program = parse("get from [ 'http://a/', 'http://b/', ]").unwrap();
        let Stmt::Expr(Expr::Request(request)) = &program.statements[0] else {
            panic!("expected a request expression");
        };
        assert_eq!(
            request.url,
            Slot::Host("[ 'http://a/' , 'http://b/' , ]".into())
        );
    }

    #[test]
    fn test_retry_clause_order_is_free() {
        let program = parse("get from 'u' with retry at 1 minute apart 2 times").unwrap();
        let Stmt::Expr(Expr::Request(request)) = &program.statements[0] else {
            panic!("expected a request expression");
        };
        assert_eq!(request.retry, Slot::Host("2".into()));
        assert_eq!(
            request.retry_interval,
            Slot::Interval(TimeInterval {
                num: "1".into(),
                multiplier: 60,
            })
        );
    }

    #[test]
    fn test_retry_only_interval_defaults_count() {
        let program = parse("get from 'u' with retry at 5 seconds apart").unwrap();
        let Stmt::Expr(Expr::Request(request)) = &program.statements[0] else {
            panic!("expected a request expression");
        };
        assert_eq!(request.retry, Slot::Host("None".into()));
    }

    #[test]
    fn test_branch_operators() {
        let source = "process r \
            whose status does not equal 200 as bytes with f \
            whose url contains 'x' as str with g \
            whose url does not contain 'y' as json with h";
        let program = parse(source).unwrap();
        let Stmt::Expr(Expr::Result { branches, .. }) = &program.statements[0] else {
            panic!("expected a result expression");
        };
        assert_eq!(branches.len(), 3);
        assert_eq!(branches[0].test_op, Some(TestOp::Ne));
        assert_eq!(branches[0].action, Action::Ident("f".into()));
        assert_eq!(branches[1].test_op, Some(TestOp::In));
        assert_eq!(branches[1].test_obj, Some("'x'".into()));
        assert_eq!(branches[2].test_op, Some(TestOp::NotIn));
    }

    #[test]
    fn test_set_in_body_and_meta() {
        let source = "post to 'u' with \
            set json equals {'k': 'v'} in body \
            set id equals 1 in meta";
        let program = parse(source).unwrap();
        let Stmt::Expr(Expr::Request(request)) = &program.statements[0] else {
            panic!("expected a request expression");
        };
        assert_eq!(
            request.set_list,
            vec![
                SetClause {
                    key: "json".into(),
                    value: "{'k': 'v' }".into(),
                    field: "body".into(),
                },
                SetClause {
                    key: "id".into(),
                    value: "1".into(),
                    field: "meta".into(),
                },
            ]
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse_err("let a b"), "Expected: =, got: b, at line 1");
        assert_eq!(parse_err("get to"), "Expected: from, got: to, at line 1");
        assert_eq!(parse_err("post from"), "Expected: to, got: from, at line 1");
        assert_eq!(parse_err("post to"), "url required, got EOF");
        assert_eq!(
            parse_err("get from url with\n timeout 5 hours"),
            "Expected: second|minute, got: hours, at line 2"
        );
        assert_eq!(
            parse_err("get from url with\n retry 5 hours"),
            "Expected: time, got: hours, at line 2"
        );
        assert_eq!(
            parse_err("get from url with\n retry at 10 seconds every"),
            "Expected: apart, got: every, at line 2"
        );
        assert_eq!(
            parse_err("get from url with\n sleep 1 second every request"),
            "Expected: per, got: every, at line 2"
        );
        assert_eq!(
            parse_err("get from url with\n sleep 1 second per req"),
            "Expected: request, got: req, at line 2"
        );
        assert_eq!(
            parse_err("get from url with\n set wd equal 'x' in query"),
            "Expected: equals, got: equal, at line 2"
        );
        assert_eq!(
            parse_err("get from url with\n set wd equals 'x' side query"),
            "Expected: in, got: side, at line 2"
        );
        assert_eq!(
            parse_err("process response as etree using func"),
            "Expected: with, got: using, at line 1"
        );
        assert_eq!(
            parse_err("process response whose status equals 200 as etree using func"),
            "Expected: with, got: using, at line 1"
        );
        assert_eq!(parse_err("let a ="), "Expected: expression, got: EOF");
        assert_eq!(parse_err("send"), "Expected: expression, got: EOF");
        assert_eq!(
            parse_err("process r whose url likes 'x' as str with f"),
            "Expected: equals|does not equal|contains|does not contain, got: likes, at line 1"
        );
    }

    #[test]
    fn test_lex_error_is_wrapped() {
        let err = parse("get from \"abc").unwrap_err();
        assert!(matches!(err, ParseError::Lex(_)));
        assert!(err.to_string().contains("EOF"));
    }
}
