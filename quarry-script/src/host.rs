//! Host-code bridge.
//!
//! The DSL captures two kinds of host-language source verbatim: short
//! expressions (URLs, test objects, set values) and inline `{{ ... }}`
//! blocks. The bridge is the seam where the embedder decides how that
//! source is evaluated. [`NativeBridge`] ships a literal-expression engine
//! for the former — quoted strings, numbers, byte strings, lists, maps, and
//! bare identifiers resolved against the environment stack — and delegates
//! blocks to an embedder-registered engine.

use std::sync::Arc;

use quarry_client::Response;

use crate::evaluator::EvalError;
use crate::value::{EnvStack, Value};

pub trait HostBridge: Send + Sync {
    /// Evaluate a host expression against the layered environment.
    fn eval_expr(&self, text: &str, env: &EnvStack<'_>) -> Result<Value, EvalError>;

    /// Evaluate an inline block with the response and extracted payload
    /// bound. The bridge dedents the block body before evaluation.
    fn eval_block(
        &self,
        source: &str,
        response: &Response,
        obj: &Value,
    ) -> Result<Value, EvalError>;
}

/// Block engine signature: `(dedented source, response, payload) -> value`.
pub type BlockFn = dyn Fn(&str, &Response, &Value) -> Result<Value, EvalError> + Send + Sync;

/// Default bridge: a closed literal-expression engine plus an optional
/// embedder-supplied block engine.
#[derive(Default, Clone)]
pub struct NativeBridge {
    block_engine: Option<Arc<BlockFn>>,
}

impl NativeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_engine<F>(engine: F) -> Self
    where
        F: Fn(&str, &Response, &Value) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        Self {
            block_engine: Some(Arc::new(engine)),
        }
    }
}

impl HostBridge for NativeBridge {
    fn eval_expr(&self, text: &str, env: &EnvStack<'_>) -> Result<Value, EvalError> {
        ExprParser::new(text, env).parse()
    }

    fn eval_block(
        &self,
        source: &str,
        response: &Response,
        obj: &Value,
    ) -> Result<Value, EvalError> {
        let body = dedent(source);
        match &self.block_engine {
            Some(engine) => engine(&body, response, obj),
            None => Err(EvalError::NoBlockEngine),
        }
    }
}

/// Strip the common leading indentation from a block body. The indent width
/// comes from the first non-empty line after the opening line, which is how
/// the blocks read in source: the opening `{{` shares a line with the
/// branch, the body is indented below it.
pub fn dedent(source: &str) -> String {
    let mut lines = source.lines();
    let first = lines.next().unwrap_or("").trim();
    let rest: Vec<&str> = lines.collect();
    if rest.is_empty() {
        return first.to_string();
    }
    let indent = rest
        .iter()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.chars().count() - line.trim_start().chars().count())
        .unwrap_or(0);

    let mut out = String::new();
    if !first.is_empty() {
        out.push_str(first);
        out.push('\n');
    }
    for line in rest {
        out.push_str(strip_indent(line, indent));
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Strip up to `indent` leading whitespace characters.
fn strip_indent(line: &str, indent: usize) -> &str {
    let mut stripped = 0;
    for (offset, c) in line.char_indices() {
        if stripped == indent || !c.is_whitespace() {
            return &line[offset..];
        }
        stripped += 1;
    }
    ""
}

struct ExprParser<'a> {
    text: &'a str,
    chars: Vec<char>,
    pos: usize,
    env: &'a EnvStack<'a>,
}

impl<'a> ExprParser<'a> {
    fn new(text: &'a str, env: &'a EnvStack<'a>) -> Self {
        Self {
            text,
            chars: text.chars().collect(),
            pos: 0,
            env,
        }
    }

    fn parse(mut self) -> Result<Value, EvalError> {
        self.skip_whitespace();
        let value = self.parse_value()?;
        self.skip_whitespace();
        if self.pos < self.chars.len() {
            return Err(self.fail());
        }
        Ok(value)
    }

    fn fail(&self) -> EvalError {
        EvalError::HostExpr(self.text.to_string())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Result<Value, EvalError> {
        match self.peek() {
            None => Err(self.fail()),
            Some('\'') | Some('"') => self.parse_string().map(Value::Str),
            Some('[') => self.parse_list(),
            Some('{') => self.parse_map(),
            Some('b')
                if matches!(self.chars.get(self.pos + 1).copied(), Some('\'' | '"')) =>
            {
                self.bump();
                self.parse_string().map(|text| Value::Bytes(text.into_bytes()))
            }
            Some(c) if c.is_ascii_digit() || c == '-' || c == '.' => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_name(),
            Some(_) => Err(self.fail()),
        }
    }

    fn parse_string(&mut self) -> Result<String, EvalError> {
        let quote = self.bump().ok_or_else(|| self.fail())?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.fail()),
                Some('\\') => match self.bump() {
                    None => return Err(self.fail()),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some(c) if c == quote => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, EvalError> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(c) if c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')
        ) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if let Ok(value) = text.parse::<i64>() {
            return Ok(Value::Int(value));
        }
        text.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| self.fail())
    }

    fn parse_list(&mut self) -> Result<Value, EvalError> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.fail()),
                Some(']') => {
                    self.bump();
                    return Ok(Value::List(items));
                }
                _ => {
                    items.push(self.parse_value()?);
                    self.skip_whitespace();
                    match self.peek() {
                        Some(',') => {
                            self.bump();
                        }
                        Some(']') => {}
                        _ => return Err(self.fail()),
                    }
                }
            }
        }
    }

    fn parse_map(&mut self) -> Result<Value, EvalError> {
        self.bump();
        let mut map = std::collections::BTreeMap::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.fail()),
                Some('}') => {
                    self.bump();
                    return Ok(Value::Map(map));
                }
                Some('\'') | Some('"') => {
                    let key = self.parse_string()?;
                    self.skip_whitespace();
                    if self.bump() != Some(':') {
                        return Err(self.fail());
                    }
                    self.skip_whitespace();
                    let value = self.parse_value()?;
                    map.insert(key, value);
                    self.skip_whitespace();
                    match self.peek() {
                        Some(',') => {
                            self.bump();
                        }
                        Some('}') => {}
                        _ => return Err(self.fail()),
                    }
                }
                Some(_) => return Err(self.fail()),
            }
        }
    }

    fn parse_name(&mut self) -> Result<Value, EvalError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        match name.as_str() {
            "None" => Ok(Value::None),
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            _ => self
                .env
                .lookup(&name)
                .cloned()
                .ok_or(EvalError::UnknownIdentifier(name)),
        }
    }
}
