//! Response model and derived views.
//!
//! A [`Response`] is produced by the client for every submitted request,
//! whether the exchange succeeded or not. `status == -1` marks a transport
//! or policy failure; in that case `reason` holds a printable form of the
//! triggering error and `content` is empty.
//!
//! The derived views (`text`, `json`, `html`, `xml`) are pure functions of
//! `content` and are memoized so repeated extraction is O(1) after the first
//! call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use parking_lot::Mutex;
use scraper::Html;

use crate::dom::XmlDocument;
use crate::error::ClientError;
use crate::request::Request;

const TEXT_CACHE_SIZE: usize = 8;

#[derive(Debug)]
pub struct Response {
    url: String,
    status: i32,
    reason: String,
    content: Bytes,
    request: Request,
    text_cache: Mutex<Vec<(Option<String>, String)>>,
    json_cache: OnceLock<Result<Arc<serde_json::Value>, ClientError>>,
    html_cache: OnceLock<Result<Arc<Html>, ClientError>>,
    xml_cache: OnceLock<Result<Arc<XmlDocument>, ClientError>>,
}

impl Response {
    pub fn new(
        url: impl Into<String>,
        status: i32,
        reason: impl Into<String>,
        content: impl Into<Bytes>,
        request: Request,
    ) -> Self {
        Self {
            url: url.into(),
            status,
            reason: reason.into(),
            content: content.into(),
            request,
            text_cache: Mutex::new(Vec::new()),
            json_cache: OnceLock::new(),
            html_cache: OnceLock::new(),
            xml_cache: OnceLock::new(),
        }
    }

    /// Materialize a transport or policy failure as a response.
    pub fn failure(request: Request, reason: impl Into<String>) -> Self {
        Self::new("", -1, reason, Bytes::new(), request)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn meta(&self) -> Option<&BTreeMap<String, serde_json::Value>> {
        self.request.meta.as_ref()
    }

    /// Decode the body as text. With no explicit encoding label the charset
    /// is detected from the bytes, falling back to UTF-8.
    pub fn text(&self, encoding: Option<&str>) -> Result<String, ClientError> {
        let key = encoding.map(str::to_ascii_lowercase);
        {
            let mut cache = self.text_cache.lock();
            if let Some(position) = cache.iter().position(|(label, _)| *label == key) {
                let entry = cache.remove(position);
                let text = entry.1.clone();
                cache.insert(0, entry);
                return Ok(text);
            }
        }

        let encoding = match &key {
            Some(label) => Encoding::for_label(label.as_bytes())
                .ok_or_else(|| ClientError::UnknownEncoding(label.clone()))?,
            None => {
                let mut detector = EncodingDetector::new();
                detector.feed(&self.content, true);
                detector.guess(None, true)
            }
        };
        let (decoded, _, _) = encoding.decode(&self.content);
        let decoded = decoded.into_owned();

        let mut cache = self.text_cache.lock();
        cache.insert(0, (key, decoded.clone()));
        cache.truncate(TEXT_CACHE_SIZE);
        Ok(decoded)
    }

    pub fn json(&self) -> Result<Arc<serde_json::Value>, ClientError> {
        self.json_cache
            .get_or_init(|| {
                serde_json::from_slice(&self.content)
                    .map(Arc::new)
                    .map_err(|err| ClientError::Json(err.to_string()))
            })
            .clone()
    }

    /// Parse the body as an HTML tree. Lenient: malformed markup yields a
    /// best-effort tree rather than an error.
    pub fn html(&self) -> Result<Arc<Html>, ClientError> {
        self.html_cache
            .get_or_init(|| {
                let text = self
                    .text(None)
                    .map_err(|err| ClientError::Html(err.to_string()))?;
                Ok(Arc::new(Html::parse_document(&text)))
            })
            .clone()
    }

    /// Parse the body as a strict XML tree.
    pub fn xml(&self) -> Result<Arc<XmlDocument>, ClientError> {
        self.xml_cache
            .get_or_init(|| XmlDocument::parse(&self.content).map(Arc::new))
            .clone()
    }
}

impl Clone for Response {
    fn clone(&self) -> Self {
        // Views are recomputed on demand; only the materialized state travels.
        Self::new(
            self.url.clone(),
            self.status,
            self.reason.clone(),
            self.content.clone(),
            self.request.clone(),
        )
    }
}

impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
            && self.status == other.status
            && self.reason == other.reason
            && self.content == other.content
            && self.request == other.request
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Response {} {}>", self.status, self.url)
    }
}
