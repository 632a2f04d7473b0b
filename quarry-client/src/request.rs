//! Request model.
//!
//! A [`Request`] is an immutable description of one HTTP exchange: URL,
//! method, optional headers/query/body, and optional per-request overrides
//! for the client's timeout/retry/sleep policy.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use url::Url;

use crate::error::ClientError;

/// HTTP methods understood by the pipeline DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One HTTP request.
///
/// At most one of `json`, `form`, `body`, `text`, `file` may be set; the
/// client materializes an error response when the invariant is violated.
/// `None` override fields fall back to the client settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: Option<HeaderMap>,
    pub params: Option<Vec<(String, String)>>,
    pub json: Option<serde_json::Value>,
    pub form: Option<Vec<(String, String)>>,
    pub body: Option<Bytes>,
    pub text: Option<String>,
    pub file: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub retry: Option<u32>,
    pub retry_interval: Option<Duration>,
    pub sleep: Option<Duration>,
    pub meta: Option<BTreeMap<String, serde_json::Value>>,
}

impl Request {
    pub fn new(url: &str, method: Method) -> Result<Self, ClientError> {
        Ok(Self::from_url(Url::parse(url)?, method))
    }

    pub fn get(url: &str) -> Result<Self, ClientError> {
        Self::new(url, Method::Get)
    }

    pub fn post(url: &str) -> Result<Self, ClientError> {
        Self::new(url, Method::Post)
    }

    pub fn from_url(url: Url, method: Method) -> Self {
        Self {
            url,
            method,
            headers: None,
            params: None,
            json: None,
            form: None,
            body: None,
            text: None,
            file: None,
            timeout: None,
            retry: None,
            retry_interval: None,
            sleep: None,
            meta: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.json = Some(json);
        self
    }

    pub fn with_form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = Some(form);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = Some(sleep);
        self
    }

    pub fn with_meta(mut self, meta: BTreeMap<String, serde_json::Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Number of body slots currently set. Valid requests have 0 or 1.
    pub fn body_slots(&self) -> usize {
        [
            self.json.is_some(),
            self.form.is_some(),
            self.body.is_some(),
            self.text.is_some(),
            self.file.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Request {} {}>", self.method, self.url)
    }
}
