//! Runtime values and environments.
//!
//! Everything a pipeline statement can produce is a [`Value`]: host
//! literals, requests, futures, responses, extracted payload trees, native
//! callables, and captured branch errors.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_client::{Request, Response, ResponseFuture, XmlDocument};
use scraper::Html;

use crate::evaluator::EvalError;

/// Host-registered extractor callable: `(response, payload) -> value`.
pub type NativeFn = Arc<dyn Fn(&Response, &Value) -> Result<Value, EvalError> + Send + Sync>;

/// A pending batch. The underlying future can be awaited once; the slot is
/// shared so values stay cheaply cloneable.
#[derive(Clone)]
pub struct FutureSlot(Arc<Mutex<Option<ResponseFuture>>>);

impl FutureSlot {
    pub fn new(future: ResponseFuture) -> Self {
        Self(Arc::new(Mutex::new(Some(future))))
    }

    /// Take the future out of the slot. Returns `None` once consumed.
    pub fn take(&self) -> Option<ResponseFuture> {
        self.0.lock().take()
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FutureSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.lock().is_some() {
            "pending"
        } else {
            "consumed"
        };
        write!(f, "FutureSlot({state})")
    }
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Json(Arc<serde_json::Value>),
    Html(Arc<Html>),
    Xml(Arc<XmlDocument>),
    Request(Request),
    Future(FutureSlot),
    Response(Arc<Response>),
    Func(NativeFn),
    /// A captured branch failure; never propagated as an `Err`.
    Error(String),
}

impl Value {
    /// Convenience constructor for native extractor callables.
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&Response, &Value) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        Value::Func(Arc::new(f))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Json(_) => "json",
            Value::Html(_) => "html",
            Value::Xml(_) => "xml",
            Value::Request(_) => "request",
            Value::Future(_) => "future",
            Value::Response(_) => "response",
            Value::Func(_) => "function",
            Value::Error(_) => "error",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Containment with `self` as the container.
    pub fn contains(&self, needle: &Value) -> Result<bool, EvalError> {
        match (self, needle) {
            (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(needle)),
            (Value::Bytes(haystack), Value::Bytes(needle)) => Ok(haystack
                .windows(needle.len().max(1))
                .any(|window| window == needle.as_slice())),
            (Value::List(items), needle) => Ok(items.iter().any(|item| item == needle)),
            (Value::Map(map), Value::Str(key)) => Ok(map.contains_key(key)),
            (container, needle) => Err(EvalError::Unsupported {
                operation: "contains",
                left: needle.type_name(),
                right: container.type_name(),
            }),
        }
    }

    /// Lossy conversion into a JSON tree, for request bodies and metadata.
    pub fn to_json(&self) -> Result<serde_json::Value, EvalError> {
        match self {
            Value::None => Ok(serde_json::Value::Null),
            Value::Bool(value) => Ok(serde_json::Value::Bool(*value)),
            Value::Int(value) => Ok(serde_json::Value::from(*value)),
            Value::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .ok_or(EvalError::NotJson { found: "float" }),
            Value::Str(value) => Ok(serde_json::Value::String(value.clone())),
            Value::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Value::Map(map) => map
                .iter()
                .map(|(key, value)| Ok((key.clone(), value.to_json()?)))
                .collect::<Result<serde_json::Map<_, _>, EvalError>>()
                .map(serde_json::Value::Object),
            Value::Json(value) => Ok((**value).clone()),
            other => Err(EvalError::NotJson {
                found: other.type_name(),
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Xml(a), Value::Xml(b)) => a == b,
            (Value::Html(a), Value::Html(b)) => Arc::ptr_eq(a, b),
            (Value::Request(a), Value::Request(b)) => a == b,
            (Value::Response(a), Value::Response(b)) => a == b,
            (Value::Future(a), Value::Future(b)) => a.ptr_eq(b),
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(value) => write!(f, "{value:?}"),
            Value::Int(value) => write!(f, "{value:?}"),
            Value::Float(value) => write!(f, "{value:?}"),
            Value::Str(value) => write!(f, "{value:?}"),
            Value::Bytes(value) => write!(f, "b{:?}", String::from_utf8_lossy(value)),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(map) => f.debug_map().entries(map).finish(),
            Value::Json(value) => write!(f, "Json({value})"),
            Value::Html(_) => f.write_str("Html(..)"),
            Value::Xml(document) => write!(f, "Xml(<{}>)", document.root.name),
            Value::Request(request) => write!(f, "{request}"),
            Value::Future(slot) => slot.fmt(f),
            Value::Response(response) => write!(f, "{response}"),
            Value::Func(_) => f.write_str("Func(..)"),
            Value::Error(message) => write!(f, "Error({message})"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(value) => f.write_str(value),
            other => write!(f, "{other:?}"),
        }
    }
}

/// One naming scope.
pub type Env = HashMap<String, Value>;

/// Layered name resolution: `let`-bindings, then the caller's local
/// environment, then the global one.
pub struct EnvStack<'a> {
    pub lets: &'a Env,
    pub local: &'a Env,
    pub global: &'a Env,
}

impl EnvStack<'_> {
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.lets
            .get(name)
            .or_else(|| self.local.get(name))
            .or_else(|| self.global.get(name))
    }
}
