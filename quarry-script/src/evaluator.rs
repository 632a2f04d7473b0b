//! Evaluator for pipeline programs.
//!
//! Walks the AST statement by statement, holding the previous statement's
//! value in a single `result` slot: that value is what `then` expressions
//! and placeholder slots see as their implicit input. Request expressions
//! build [`Request`] values, `send` submits them to the client, `wait`
//! awaits the batch, and `process` dispatches pattern-matched branches over
//! the responses.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quarry_client::{Client, ClientError, Reply, Request, Response, Submission};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;

use crate::host::{HostBridge, NativeBridge};
use crate::parser::ast::{
    Action, Branch, Expr, Program, RequestExpr, Slot, Stmt, TestOp, TimeInterval,
};
use crate::value::{Env, EnvStack, FutureSlot, Value};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("invalid host expression: {0}")]
    HostExpr(String),

    #[error("no block engine configured")]
    NoBlockEngine,

    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    #[error("unknown response attribute: {0}")]
    UnknownAttribute(String),

    #[error("unknown request body slot: {0}")]
    UnknownBodySlot(String),

    #[error("unknown set field: {0}")]
    UnknownSetField(String),

    #[error("{0} is not callable")]
    NotCallable(String),

    #[error("expected {expected}, found {found}")]
    Type {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{found} is not representable as JSON")]
    NotJson { found: &'static str },

    #[error("unsupported operation: {left} {operation} {right}")]
    Unsupported {
        operation: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },

    #[error("negative duration")]
    NegativeDuration,

    #[error("future already consumed")]
    FutureConsumed,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Payload selector of a branch: the fixed content-type keyword table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Bytes,
    Str,
    Json,
    Html,
    Xml,
}

impl ContentKind {
    fn parse(keyword: &str) -> Result<Self, EvalError> {
        match keyword {
            "bytes" => Ok(ContentKind::Bytes),
            "str" => Ok(ContentKind::Str),
            "json" => Ok(ContentKind::Json),
            "html" => Ok(ContentKind::Html),
            "xml" => Ok(ContentKind::Xml),
            other => Err(EvalError::UnknownContentType(other.to_string())),
        }
    }
}

struct State {
    lets: Env,
    local: Env,
    global: Env,
    result: Value,
}

impl State {
    fn envs(&self) -> EnvStack<'_> {
        EnvStack {
            lets: &self.lets,
            local: &self.local,
            global: &self.global,
        }
    }
}

pub struct Evaluator<'c> {
    client: &'c Client,
    bridge: Arc<dyn HostBridge>,
}

impl<'c> Evaluator<'c> {
    pub fn new(client: &'c Client) -> Self {
        Self::with_bridge(client, Arc::new(NativeBridge::new()))
    }

    pub fn with_bridge(client: &'c Client, bridge: Arc<dyn HostBridge>) -> Self {
        Self { client, bridge }
    }

    /// Evaluate a program. The final statement's value is the program's
    /// value; a trailing `let` yields `None`.
    pub async fn eval(
        &self,
        program: &Program,
        global_env: Env,
        local_env: Env,
    ) -> Result<Value, EvalError> {
        let mut state = State {
            lets: Env::new(),
            local: local_env,
            global: global_env,
            result: Value::None,
        };
        for stmt in &program.statements {
            state.result = self.eval_stmt(stmt, &mut state).await?;
        }
        Ok(state.result)
    }

    async fn eval_stmt(&self, stmt: &Stmt, state: &mut State) -> Result<Value, EvalError> {
        match stmt {
            Stmt::Let { name, expr } => {
                let value = self.eval_expr(expr, state).await?;
                debug!(name = %name, value = ?value, "let binding");
                state.lets.insert(name.clone(), value);
                Ok(Value::None)
            }
            Stmt::Expr(expr) => self.eval_expr(expr, state).await,
        }
    }

    fn eval_expr<'a>(
        &'a self,
        expr: &'a Expr,
        state: &'a mut State,
    ) -> Pin<Box<dyn Future<Output = Result<Value, EvalError>> + Send + 'a>> {
        Box::pin(async move {
            match expr {
                Expr::Ident(name) => self.lookup(name, state),
                Expr::Placeholder => Ok(state.result.clone()),
                Expr::Request(request) => self.eval_request_expr(request, state),
                Expr::Future(inner) => {
                    let value = self.eval_expr(inner, state).await?;
                    self.eval_future(value)
                }
                Expr::Response(inner) => {
                    let value = self.eval_expr(inner, state).await?;
                    self.eval_response(value).await
                }
                Expr::Result { input, branches } => {
                    let value = self.eval_expr(input, state).await?;
                    self.eval_result(value, branches, state)
                }
                Expr::Then(inner) => self.eval_expr(inner, state).await,
            }
        })
    }

    fn lookup(&self, name: &str, state: &State) -> Result<Value, EvalError> {
        state
            .envs()
            .lookup(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownIdentifier(name.to_string()))
    }

    // ========================================
    // Requests
    // ========================================

    fn eval_request_expr(&self, expr: &RequestExpr, state: &State) -> Result<Value, EvalError> {
        let timeout = self.eval_duration_slot(&expr.timeout, state)?;
        let retry = self.eval_count_slot(&expr.retry, state)?;
        let retry_interval = self.eval_duration_slot(&expr.retry_interval, state)?;
        let sleep = self.eval_duration_slot(&expr.sleep, state)?;

        let mut headers = HeaderMap::new();
        let mut params: Vec<(String, String)> = Vec::new();
        let mut meta: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut json = None;
        let mut form = None;
        let mut body = None;
        let mut text = None;
        let mut file = None;

        for clause in &expr.set_list {
            let value = self.bridge.eval_expr(&clause.value, &state.envs())?;
            match clause.field.as_str() {
                "body" => match clause.key.as_str() {
                    "json" => json = Some(value.to_json()?),
                    "form" => form = Some(to_form(&value)?),
                    "body" => body = Some(to_bytes(&value)?),
                    "text" => text = Some(to_plain_string(&value)?),
                    "file" => file = Some(PathBuf::from(to_plain_string(&value)?)),
                    other => return Err(EvalError::UnknownBodySlot(other.to_string())),
                },
                "query" => params.push((clause.key.clone(), to_plain_string(&value)?)),
                "headers" => {
                    let name = HeaderName::from_bytes(clause.key.as_bytes()).map_err(|err| {
                        EvalError::InvalidHeader {
                            name: clause.key.clone(),
                            message: err.to_string(),
                        }
                    })?;
                    let value = HeaderValue::from_str(&to_plain_string(&value)?).map_err(
                        |err| EvalError::InvalidHeader {
                            name: clause.key.clone(),
                            message: err.to_string(),
                        },
                    )?;
                    headers.append(name, value);
                }
                "meta" => {
                    meta.insert(clause.key.clone(), value.to_json()?);
                }
                other => return Err(EvalError::UnknownSetField(other.to_string())),
            }
        }

        let build = |url: &str| -> Result<Request, EvalError> {
            let mut request = Request::new(url, expr.method)?;
            request.headers = (!headers.is_empty()).then(|| headers.clone());
            request.params = (!params.is_empty()).then(|| params.clone());
            request.meta = (!meta.is_empty()).then(|| meta.clone());
            request.json = json.clone();
            request.form = form.clone();
            request.body = body.clone();
            request.text = text.clone();
            request.file = file.clone();
            request.timeout = timeout;
            request.retry = retry;
            request.retry_interval = retry_interval;
            request.sleep = sleep;
            Ok(request)
        };

        let urls = match &expr.url {
            Slot::Placeholder => state.result.clone(),
            Slot::Ident(name) => self.lookup(name, state)?,
            Slot::Host(text) => self.bridge.eval_expr(text, &state.envs())?,
            Slot::Empty | Slot::Interval(_) => {
                return Err(EvalError::Type {
                    expected: "url",
                    found: "empty",
                });
            }
        };
        match urls {
            Value::Str(url) => Ok(Value::Request(build(&url)?)),
            Value::List(items) => {
                let mut requests = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Str(url) => requests.push(Value::Request(build(&url)?)),
                        other => {
                            return Err(EvalError::Type {
                                expected: "url",
                                found: other.type_name(),
                            });
                        }
                    }
                }
                Ok(Value::List(requests))
            }
            other => Err(EvalError::Type {
                expected: "url or url list",
                found: other.type_name(),
            }),
        }
    }

    fn eval_duration_slot(
        &self,
        slot: &Slot,
        state: &State,
    ) -> Result<Option<Duration>, EvalError> {
        match slot {
            Slot::Empty | Slot::Placeholder => Ok(None),
            Slot::Ident(name) => to_duration(&self.lookup(name, state)?),
            Slot::Host(text) => to_duration(&self.bridge.eval_expr(text, &state.envs())?),
            Slot::Interval(interval) => self.eval_interval(interval, state).map(Some),
        }
    }

    fn eval_interval(
        &self,
        interval: &TimeInterval,
        state: &State,
    ) -> Result<Duration, EvalError> {
        let num = self.bridge.eval_expr(&interval.num, &state.envs())?;
        let secs = num.as_f64().ok_or(EvalError::Type {
            expected: "number",
            found: num.type_name(),
        })?;
        let secs = secs * f64::from(interval.multiplier);
        if !secs.is_finite() || secs < 0.0 {
            return Err(EvalError::NegativeDuration);
        }
        Ok(Duration::from_secs_f64(secs))
    }

    fn eval_count_slot(&self, slot: &Slot, state: &State) -> Result<Option<u32>, EvalError> {
        let value = match slot {
            Slot::Empty | Slot::Placeholder | Slot::Interval(_) => return Ok(None),
            Slot::Ident(name) => self.lookup(name, state)?,
            Slot::Host(text) => self.bridge.eval_expr(text, &state.envs())?,
        };
        match value {
            Value::None => Ok(None),
            Value::Int(count) if count >= 0 => Ok(Some(count as u32)),
            other => Err(EvalError::Type {
                expected: "non-negative int",
                found: other.type_name(),
            }),
        }
    }

    // ========================================
    // Futures and responses
    // ========================================

    fn eval_future(&self, value: Value) -> Result<Value, EvalError> {
        let submission = match value {
            Value::Request(request) => Submission::One(request),
            Value::List(items) => {
                let mut requests = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Request(request) => requests.push(request),
                        other => {
                            return Err(EvalError::Type {
                                expected: "request",
                                found: other.type_name(),
                            });
                        }
                    }
                }
                Submission::Many(requests)
            }
            other => {
                return Err(EvalError::Type {
                    expected: "request or request list",
                    found: other.type_name(),
                });
            }
        };
        Ok(Value::Future(FutureSlot::new(self.client.submit(submission))))
    }

    async fn eval_response(&self, value: Value) -> Result<Value, EvalError> {
        let Value::Future(slot) = value else {
            return Err(EvalError::Type {
                expected: "future",
                found: value.type_name(),
            });
        };
        let future = slot.take().ok_or(EvalError::FutureConsumed)?;
        match future.wait().await? {
            Reply::One(response) => Ok(Value::Response(Arc::new(response))),
            Reply::Many(responses) => Ok(Value::List(
                responses
                    .into_iter()
                    .map(|response| Value::Response(Arc::new(response)))
                    .collect(),
            )),
        }
    }

    // ========================================
    // Branch dispatch
    // ========================================

    fn eval_result(
        &self,
        value: Value,
        branches: &[Branch],
        state: &State,
    ) -> Result<Value, EvalError> {
        let (single, responses) = match value {
            Value::Response(response) => (true, vec![response]),
            Value::List(items) => {
                let mut responses = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Response(response) => responses.push(response),
                        other => {
                            return Err(EvalError::Type {
                                expected: "response",
                                found: other.type_name(),
                            });
                        }
                    }
                }
                (false, responses)
            }
            other => {
                return Err(EvalError::Type {
                    expected: "response or response list",
                    found: other.type_name(),
                });
            }
        };

        let mut results = Vec::with_capacity(responses.len());
        for response in responses {
            let mut matched = None;
            for branch in branches {
                if let Some(result) = self.eval_branch(branch, &response, state)? {
                    matched = Some(result);
                    break;
                }
            }
            // A response nothing matched passes through unchanged.
            results.push(matched.unwrap_or(Value::Response(response)));
        }

        if single {
            Ok(results.into_iter().next().unwrap_or(Value::None))
        } else {
            Ok(Value::List(results))
        }
    }

    /// Evaluate one branch against one response. `Ok(None)` means the branch
    /// did not match. Extraction and action failures are captured into
    /// `Value::Error`; only an unknown content-type keyword propagates.
    fn eval_branch(
        &self,
        branch: &Branch,
        response: &Arc<Response>,
        state: &State,
    ) -> Result<Option<Value>, EvalError> {
        let matched = match (&branch.attr, branch.test_op) {
            (None, _) => true,
            (Some(attr), Some(op)) => {
                let attr_value = response_attr(response, attr)?;
                let test_obj = self
                    .bridge
                    .eval_expr(branch.test_obj.as_deref().unwrap_or(""), &state.envs())?;
                eval_test(op, &test_obj, &attr_value)?
            }
            (Some(_), None) => false,
        };
        if !matched {
            return Ok(None);
        }

        let kind = ContentKind::parse(&branch.content_type)?;
        let result = self
            .run_action(kind, branch, response, state)
            .unwrap_or_else(|err| Value::Error(err.to_string()));
        Ok(Some(result))
    }

    fn run_action(
        &self,
        kind: ContentKind,
        branch: &Branch,
        response: &Arc<Response>,
        state: &State,
    ) -> Result<Value, EvalError> {
        let obj = match kind {
            ContentKind::Bytes => Value::Bytes(response.content().to_vec()),
            ContentKind::Str => Value::Str(response.text(None)?),
            ContentKind::Json => Value::Json(response.json()?),
            ContentKind::Html => Value::Html(response.html()?),
            ContentKind::Xml => Value::Xml(response.xml()?),
        };
        match &branch.action {
            Action::Block(source) => self.bridge.eval_block(source, response, &obj),
            Action::Ident(name) => match self.lookup(name, state)? {
                Value::Func(action) => action(response, &obj),
                _ => Err(EvalError::NotCallable(name.clone())),
            },
        }
    }
}

fn response_attr(response: &Response, attr: &str) -> Result<Value, EvalError> {
    match attr {
        "status" => Ok(Value::Int(i64::from(response.status()))),
        "url" => Ok(Value::Str(response.url().to_string())),
        "reason" => Ok(Value::Str(response.reason().to_string())),
        other => Err(EvalError::UnknownAttribute(other.to_string())),
    }
}

/// The test object is the left operand: `whose url contains 'x'` asks
/// whether `'x'` occurs in the url.
fn eval_test(op: TestOp, test_obj: &Value, attr_value: &Value) -> Result<bool, EvalError> {
    match op {
        TestOp::Eq => Ok(test_obj == attr_value),
        TestOp::Ne => Ok(test_obj != attr_value),
        TestOp::In => attr_value.contains(test_obj),
        TestOp::NotIn => attr_value.contains(test_obj).map(|found| !found),
    }
}

fn to_duration(value: &Value) -> Result<Option<Duration>, EvalError> {
    match value {
        Value::None => Ok(None),
        _ => {
            let secs = value.as_f64().ok_or(EvalError::Type {
                expected: "number",
                found: value.type_name(),
            })?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(EvalError::NegativeDuration);
            }
            Ok(Some(Duration::from_secs_f64(secs)))
        }
    }
}

fn to_plain_string(value: &Value) -> Result<String, EvalError> {
    match value {
        Value::Str(text) => Ok(text.clone()),
        Value::Int(number) => Ok(number.to_string()),
        Value::Float(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(EvalError::Type {
            expected: "string",
            found: other.type_name(),
        }),
    }
}

fn to_form(value: &Value) -> Result<Vec<(String, String)>, EvalError> {
    match value {
        Value::Map(map) => map
            .iter()
            .map(|(key, value)| Ok((key.clone(), to_plain_string(value)?)))
            .collect(),
        other => Err(EvalError::Type {
            expected: "map",
            found: other.type_name(),
        }),
    }
}

fn to_bytes(value: &Value) -> Result<Bytes, EvalError> {
    match value {
        Value::Bytes(bytes) => Ok(Bytes::from(bytes.clone())),
        Value::Str(text) => Ok(Bytes::from(text.clone().into_bytes())),
        other => Err(EvalError::Type {
            expected: "bytes",
            found: other.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use quarry_client::{Method, Settings};
    use scraper::Selector;

    fn quick_settings() -> Settings {
        Settings {
            sleep_per_request: Duration::ZERO,
            ..Settings::default()
        }
    }

    fn response(url: &str, status: i32, content: &[u8]) -> Arc<Response> {
        Arc::new(Response::new(
            url,
            status,
            if status == 200 { "OK" } else { "" },
            content.to_vec(),
            Request::get("http://origin.invalid/").unwrap(),
        ))
    }

    async fn eval_with(
        source: &str,
        bridge: Arc<dyn HostBridge>,
        global_env: Env,
        local_env: Env,
    ) -> Result<Value, EvalError> {
        let program = parse(source).unwrap();
        let client = Client::new(quick_settings());
        let evaluator = Evaluator::with_bridge(&client, bridge);
        let result = evaluator.eval(&program, global_env, local_env).await;
        client.close().await;
        result
    }

    async fn eval(source: &str, global_env: Env, local_env: Env) -> Result<Value, EvalError> {
        eval_with(source, Arc::new(NativeBridge::new()), global_env, local_env).await
    }

    #[tokio::test]
    async fn test_request_expr() {
        let source = "post to 'http://example.com/s' with \
            timeout 5 minutes \
            retry 3 times at 1 minute apart \
            sleep 1 second per request \
            set wd equals 'x' in query \
            set UA equals 'Chrome' in headers \
            set json equals {'k': 'v'} in body \
            set id equals 1 in meta";
        let result = eval(source, Env::new(), Env::new()).await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"UA").unwrap(),
            HeaderValue::from_static("Chrome"),
        );
        let mut expected = Request::post("http://example.com/s").unwrap();
        expected.headers = Some(headers);
        expected.params = Some(vec![("wd".into(), "x".into())]);
        expected.json = Some(serde_json::json!({"k": "v"}));
        expected.meta = Some(
            [("id".to_string(), serde_json::json!(1))]
                .into_iter()
                .collect(),
        );
        expected.timeout = Some(Duration::from_secs(300));
        expected.retry = Some(3);
        expected.retry_interval = Some(Duration::from_secs(60));
        expected.sleep = Some(Duration::from_secs(1));

        assert_eq!(result, Value::Request(expected));
    }

    #[tokio::test]
    async fn test_time_intervals() {
        let source = "get from 'http://example.com/' with \
            timeout 90 seconds \
            retry 2 times at 10 seconds apart \
            sleep 2 minutes per request";
        let result = eval(source, Env::new(), Env::new()).await.unwrap();
        let Value::Request(request) = result else {
            panic!("expected a request");
        };
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.timeout, Some(Duration::from_secs(90)));
        assert_eq!(request.retry, Some(2));
        assert_eq!(request.retry_interval, Some(Duration::from_secs(10)));
        assert_eq!(request.sleep, Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_url_list_builds_one_request_per_url() {
        let result = eval(
            "get from [ 'http://a/', 'http://b/' ]",
            Env::new(),
            Env::new(),
        )
        .await
        .unwrap();
        let Value::List(items) = result else {
            panic!("expected a list");
        };
        assert_eq!(items.len(), 2);
        let Value::Request(first) = &items[0] else {
            panic!("expected a request");
        };
        assert_eq!(first.url.as_str(), "http://a/");
    }

    #[tokio::test]
    async fn test_let_binding_and_identifier() {
        let result = eval(
            "let a = get from 'http://x/'\na",
            Env::new(),
            Env::new(),
        )
        .await
        .unwrap();
        assert!(matches!(result, Value::Request(_)));

        let missing = eval("missing", Env::new(), Env::new()).await;
        assert!(matches!(missing, Err(EvalError::UnknownIdentifier(_))));
    }

    #[tokio::test]
    async fn test_trailing_let_yields_none() {
        let result = eval("let a = get from 'http://x/'", Env::new(), Env::new())
            .await
            .unwrap();
        assert_eq!(result, Value::None);
    }

    #[tokio::test]
    async fn test_placeholder_threading() {
        let mut global = Env::new();
        global.insert("url".into(), Value::Str("http://a/s".into()));
        let source = "url\nthen get from with set wd equals 'x' in query";
        let result = eval(source, global, Env::new()).await.unwrap();
        let Value::Request(request) = result else {
            panic!("expected a request");
        };
        assert_eq!(request.url.as_str(), "http://a/s");
        assert_eq!(
            request.params,
            Some(vec![("wd".to_string(), "x".to_string())])
        );
    }

    #[tokio::test]
    async fn test_branch_dispatch() {
        let source = "process responses \
            whose status does not equal 200 as bytes with {{ append ' bytes' to obj }} \
            whose url equals 'https://a/' as str with {{ first char of obj plus ' str' }} \
            whose url contains 'wd=1' as html with {{ title of obj plus ' html' }} \
            whose url does not contain '.com' as json with extract_url \
            otherwise as xml with extract_title";

        let responses = Value::List(vec![
            Value::Response(response("https://a/", 500, b"")),
            Value::Response(response("https://a/", 200, b"<html>")),
            Value::Response(response(
                "https://s/?wd=1",
                200,
                b"<html><head><title>1_title</title></head></html>",
            )),
            Value::Response(response("https://httpbin/get", 200, b"{}")),
            Value::Response(response("https://movie.example.com/", 200, b"<html><broken")),
        ]);

        let mut local = Env::new();
        local.insert("responses".into(), responses);
        local.insert(
            "extract_url".into(),
            Value::native(|response, _obj| {
                Ok(Value::Str(format!("{} json", response.url())))
            }),
        );
        local.insert(
            "extract_title".into(),
            Value::native(|_response, obj| {
                let Value::Xml(document) = obj else {
                    return Err(EvalError::Type {
                        expected: "xml",
                        found: obj.type_name(),
                    });
                };
                let title = document.find("title").map(|el| el.text()).unwrap_or_default();
                Ok(Value::Str(format!("{title} xml")))
            }),
        );

        let bridge = NativeBridge::with_block_engine(|body, _response, obj| {
            if body.contains("append") {
                let Value::Bytes(bytes) = obj else {
                    return Err(EvalError::Type {
                        expected: "bytes",
                        found: obj.type_name(),
                    });
                };
                let mut out = bytes.clone();
                out.extend_from_slice(b" bytes");
                Ok(Value::Bytes(out))
            } else if body.contains("first char") {
                let Value::Str(text) = obj else {
                    return Err(EvalError::Type {
                        expected: "str",
                        found: obj.type_name(),
                    });
                };
                let first = text.chars().next().unwrap_or_default();
                Ok(Value::Str(format!("{first} str")))
            } else if body.contains("title") {
                let Value::Html(html) = obj else {
                    return Err(EvalError::Type {
                        expected: "html",
                        found: obj.type_name(),
                    });
                };
                let selector =
                    Selector::parse("title").map_err(|_| EvalError::HostExpr("title".into()))?;
                let title: String = html
                    .select(&selector)
                    .next()
                    .map(|el| el.text().collect())
                    .unwrap_or_default();
                Ok(Value::Str(format!("{title} html")))
            } else {
                Err(EvalError::NoBlockEngine)
            }
        });

        let result = eval_with(source, Arc::new(bridge), Env::new(), local)
            .await
            .unwrap();
        let Value::List(results) = result else {
            panic!("expected a list");
        };
        assert_eq!(results.len(), 5);
        assert_eq!(results[0], Value::Bytes(b" bytes".to_vec()));
        assert_eq!(results[1], Value::Str("< str".into()));
        assert_eq!(results[2], Value::Str("1_title html".into()));
        assert_eq!(results[3], Value::Str("https://httpbin/get json".into()));
        assert!(
            matches!(&results[4], Value::Error(_)),
            "strict xml over broken markup must be captured: {:?}",
            results[4]
        );
    }

    #[tokio::test]
    async fn test_result_without_branches_is_identity() {
        let single = response("https://a/", 200, b"payload");
        let mut local = Env::new();
        local.insert("r".into(), Value::Response(Arc::clone(&single)));
        let result = eval("process r", Env::new(), local).await.unwrap();
        assert_eq!(result, Value::Response(single));

        let mut local = Env::new();
        local.insert(
            "rs".into(),
            Value::List(vec![
                Value::Response(response("https://a/", 200, b"one")),
                Value::Response(response("https://b/", 404, b"two")),
            ]),
        );
        let result = eval("process rs", Env::new(), local).await.unwrap();
        let Value::List(results) = result else {
            panic!("expected a list");
        };
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r, Value::Response(_))));
    }

    #[tokio::test]
    async fn test_unknown_content_type_propagates() {
        let mut local = Env::new();
        local.insert("r".into(), Value::Response(response("https://a/", 200, b"")));
        local.insert("f".into(), Value::native(|_, obj| Ok(obj.clone())));
        let result = eval("process r as nonsense with f", Env::new(), local).await;
        assert!(matches!(
            result,
            Err(EvalError::UnknownContentType(keyword)) if keyword == "nonsense"
        ));
    }

    #[tokio::test]
    async fn test_action_failures_are_captured() {
        let mut local = Env::new();
        local.insert("r".into(), Value::Response(response("https://a/", 200, b"x")));
        local.insert(
            "explode".into(),
            Value::native(|_, _| Err(EvalError::HostExpr("boom".into()))),
        );
        local.insert("not_a_function".into(), Value::Int(1));

        let result = eval("process r as bytes with explode", Env::new(), local.clone())
            .await
            .unwrap();
        let Value::Error(message) = result else {
            panic!("expected a captured error");
        };
        assert!(message.contains("boom"));

        let result = eval("process r as bytes with not_a_function", Env::new(), local)
            .await
            .unwrap();
        assert!(matches!(result, Value::Error(_)));
    }

    #[tokio::test]
    async fn test_bad_json_extraction_is_captured() {
        let mut local = Env::new();
        local.insert(
            "r".into(),
            Value::Response(response("https://a/", 200, b"not json")),
        );
        local.insert("f".into(), Value::native(|_, obj| Ok(obj.clone())));
        let result = eval("process r as json with f", Env::new(), local)
            .await
            .unwrap();
        assert!(matches!(result, Value::Error(_)));
    }

    #[tokio::test]
    async fn test_send_rejects_non_requests() {
        let mut local = Env::new();
        local.insert("x".into(), Value::Int(1));
        let result = eval("send x", Env::new(), local).await;
        assert!(matches!(result, Err(EvalError::Type { .. })));
    }
}
