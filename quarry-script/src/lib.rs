//! Quarry pipeline DSL.
//!
//! An English-like language for HTTP fetch-and-extract pipelines:
//!
//! ```text
//! let request = get from 'https://example.com/search' with
//!                 timeout 5 minutes
//!                 set q equals 'rust' in query
//!
//! let future = send request
//!
//! let response = wait future
//!
//! process response
//!     whose status equals 200 as html with {{ title of page }}
//!     otherwise as bytes with fallback
//! ```
//!
//! Source text is lexed and parsed into a [`parser::Program`], then
//! evaluated against a [`quarry_client::Client`]. Host-language snippets
//! (quoted literals and `{{ ... }}` blocks) are delegated to a pluggable
//! [`HostBridge`].

pub mod evaluator;
pub mod host;
pub mod interpreter;
pub mod parser;
pub mod value;

pub use evaluator::{EvalError, Evaluator};
pub use host::{BlockFn, HostBridge, NativeBridge, dedent};
pub use interpreter::{Interpreter, ScriptError};
pub use parser::{LexError, Lexer, ParseError, Parser, Program, parse, tokenize};
pub use value::{Env, EnvStack, FutureSlot, NativeFn, Value};
