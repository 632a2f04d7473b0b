//! Abstract syntax tree for the pipeline DSL.
//!
//! Slots are the algebraic counterpart of the grammar's optional and
//! variable positions: a slot is empty, the implicit-input placeholder, a
//! bare identifier, a verbatim host expression, or a time interval.

use std::fmt;

use quarry_client::Method;

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Empty,
    Placeholder,
    Ident(String),
    /// Host-language expression text, captured verbatim for the bridge.
    Host(String),
    Interval(TimeInterval),
}

/// `<num> second[s]` or `<num> minute[s]`. The count is host expression
/// text; the multiplier is 1 or 60.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeInterval {
    pub num: String,
    pub multiplier: u32,
}

/// One `set KEY equals VALUE in FIELD` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SetClause {
    pub key: String,
    pub value: String,
    pub field: String,
}

/// Branch test operator; the test object is always the left operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    Eq,
    Ne,
    In,
    NotIn,
}

impl TestOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOp::Eq => "==",
            TestOp::Ne => "!=",
            TestOp::In => "in",
            TestOp::NotIn => "not in",
        }
    }
}

impl fmt::Display for TestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Named extractor resolved from the environment.
    Ident(String),
    /// Inline host-language block.
    Block(String),
}

/// One arm of a `process` expression. `attr == None` matches
/// unconditionally (`otherwise` and bare `as` branches).
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub attr: Option<String>,
    pub test_op: Option<TestOp>,
    pub test_obj: Option<String>,
    pub content_type: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestExpr {
    pub method: Method,
    pub url: Slot,
    pub timeout: Slot,
    pub retry: Slot,
    pub retry_interval: Slot,
    pub sleep: Slot,
    pub set_list: Vec<SetClause>,
}

impl RequestExpr {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            url: Slot::Empty,
            timeout: Slot::Empty,
            retry: Slot::Empty,
            retry_interval: Slot::Empty,
            sleep: Slot::Empty,
            set_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    /// The previous statement's value.
    Placeholder,
    Request(RequestExpr),
    /// `send` — submit the inner request(s).
    Future(Box<Expr>),
    /// `wait` — await the inner future.
    Response(Box<Expr>),
    /// `process` — dispatch branches over the inner response(s).
    Result {
        input: Box<Expr>,
        branches: Vec<Branch>,
    },
    /// `then` — inner expression with its first slot filled implicitly.
    Then(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, expr: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}
