//! Throttled asynchronous HTTP client.
//!
//! Requests are submitted in batches through a queue owned by a single
//! worker task. The worker fans each batch out into per-request tasks,
//! subject to the two-level [`Throttle`], and resolves the batch sink with
//! the materialized responses in input order. Transport failures and
//! timeouts never escape as errors: they become responses with
//! `status == -1`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::error::ClientError;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::settings::Settings;
use crate::throttle::Throttle;

const FILE_CHUNK_SIZE: usize = 64 * 1024;
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// One `submit` call: a single request or a list processed as a unit.
#[derive(Debug, Clone)]
pub enum Submission {
    One(Request),
    Many(Vec<Request>),
}

impl From<Request> for Submission {
    fn from(request: Request) -> Self {
        Submission::One(request)
    }
}

impl From<Vec<Request>> for Submission {
    fn from(requests: Vec<Request>) -> Self {
        Submission::Many(requests)
    }
}

/// The resolved value of a batch, shaped like its submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    One(Response),
    Many(Vec<Response>),
}

struct Batch {
    sink: oneshot::Sender<Reply>,
    single: bool,
    requests: Vec<Request>,
}

/// Handle to a submitted batch. Dropping it before the worker dequeues the
/// batch skips the batch entirely; dropping it mid-flight aborts the
/// in-flight requests.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Reply>,
}

impl ResponseFuture {
    pub async fn wait(self) -> Result<Reply, ClientError> {
        self.rx.await.map_err(|_| ClientError::Closed)
    }
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    batches: AtomicUsize,
    processing: AtomicUsize,
    done: AtomicUsize,
}

/// Counter snapshot, formatted the way the client reports itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    pub pending: usize,
    pub batches: usize,
    pub processing: usize,
    pub done: usize,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.batches <= 1 { "" } else { "es" };
        write!(
            f,
            "<Client - Pending: {} ({} batch{}) Processing: {}/{}>",
            self.pending, self.batches, suffix, self.done, self.processing
        )
    }
}

pub struct Client {
    settings: Settings,
    tx: mpsc::UnboundedSender<Batch>,
    worker: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl Client {
    /// Spawn a client on the current runtime. Settings are copied and never
    /// re-read afterwards.
    pub fn new(settings: Settings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run(rx, settings.clone(), Arc::clone(&counters)));
        Self {
            settings,
            tx,
            worker,
            counters,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Enqueue a batch. Non-blocking; the returned future resolves once every
    /// request in the batch has a materialized response.
    pub fn submit(&self, requests: impl Into<Submission>) -> ResponseFuture {
        let (single, requests) = match requests.into() {
            Submission::One(request) => (true, vec![request]),
            Submission::Many(requests) => (false, requests),
        };
        let (sink, rx) = oneshot::channel();
        self.counters.pending.fetch_add(requests.len(), Ordering::SeqCst);
        self.counters.batches.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(Batch {
                sink,
                single,
                requests,
            })
            .is_err()
        {
            warn!("submit on a closed client");
        }
        ResponseFuture { rx }
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            pending: self.counters.pending.load(Ordering::SeqCst),
            batches: self.counters.batches.load(Ordering::SeqCst),
            processing: self.counters.processing.load(Ordering::SeqCst),
            done: self.counters.done.load(Ordering::SeqCst),
        }
    }

    /// Cooperative shutdown: stop accepting batches, give the worker a short
    /// grace period to drain, then abort it.
    pub async fn close(self) {
        drop(self.tx);
        let abort = self.worker.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, self.worker).await.is_err() {
            abort.abort();
        }
        info!("client closed");
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.status().fmt(f)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Batch>, settings: Settings, counters: Arc<Counters>) {
    info!(
        concurrency = settings.concurrency,
        concurrency_per_host = settings.concurrency_per_host,
        "client start"
    );
    let session = match build_session(&settings) {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "failed to build http session");
            return;
        }
    };
    let throttle = Arc::new(Throttle::new(
        settings.concurrency,
        settings.concurrency_per_host,
    ));

    while let Some(batch) = rx.recv().await {
        let Batch {
            mut sink,
            single,
            requests,
        } = batch;
        counters.pending.fetch_sub(requests.len(), Ordering::SeqCst);
        counters.batches.fetch_sub(1, Ordering::SeqCst);
        counters.processing.store(requests.len(), Ordering::SeqCst);
        counters.done.store(0, Ordering::SeqCst);

        if sink.is_closed() {
            debug!("batch cancelled before dispatch, skipping");
            continue;
        }

        let fallback = requests.clone();
        let mut tasks = Vec::with_capacity(requests.len());
        for request in requests {
            let session = session.clone();
            let throttle = Arc::clone(&throttle);
            let settings = settings.clone();
            let counters = Arc::clone(&counters);
            tasks.push(tokio::spawn(async move {
                let response = process(&session, &throttle, &settings, request).await;
                counters.done.fetch_add(1, Ordering::SeqCst);
                response
            }));
        }
        let abort_handles: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        let gather = async move {
            let mut responses = Vec::with_capacity(tasks.len());
            for (index, task) in tasks.into_iter().enumerate() {
                let response = match task.await {
                    Ok(response) => response,
                    Err(err) => {
                        error!(error = %err, "request task failed");
                        Response::failure(fallback[index].clone(), err.to_string())
                    }
                };
                responses.push(response);
            }
            responses
        };
        tokio::pin!(gather);

        tokio::select! {
            mut responses = &mut gather => {
                let reply = if single {
                    match responses.pop() {
                        Some(response) => Reply::One(response),
                        None => continue,
                    }
                } else {
                    Reply::Many(responses)
                };
                let _ = sink.send(reply);
            }
            _ = sink.closed() => {
                debug!("batch cancelled during processing, aborting");
                for handle in &abort_handles {
                    handle.abort();
                }
            }
        }
    }
    debug!("client worker drained");
}

fn build_session(settings: &Settings) -> Result<reqwest::Client, ClientError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &settings.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
            ClientError::InvalidHeader {
                name: name.clone(),
                message: err.to_string(),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|err| ClientError::InvalidHeader {
            name: name.as_str().to_string(),
            message: err.to_string(),
        })?;
        headers.insert(name, value);
    }
    if !settings.cookies.is_empty() {
        let cookie = settings
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&cookie).map_err(|err| ClientError::InvalidHeader {
            name: COOKIE.as_str().to_string(),
            message: err.to_string(),
        })?;
        headers.insert(COOKIE, value);
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .cookie_store(true)
        .gzip(true)
        .build()
        .map_err(|err| ClientError::InvalidHeader {
            name: "session".into(),
            message: err.to_string(),
        })
}

async fn process(
    session: &reqwest::Client,
    throttle: &Throttle,
    settings: &Settings,
    request: Request,
) -> Response {
    debug!(request = %request, "pending");
    let host = request.url.host_str().unwrap_or_default().to_string();
    let _permit = throttle.acquire(&host).await;
    debug!(request = %request, "processing");

    let timeout = request.timeout.unwrap_or(settings.timeout);
    let retry = request.retry.unwrap_or(settings.retry);
    let retry_interval = request.retry_interval.unwrap_or(settings.retry_interval);
    let sleep = request.sleep.unwrap_or(settings.sleep_per_request);

    let response = execute_with_retry(session, request, timeout, retry, retry_interval).await;

    // Per-request cool-down, regardless of outcome.
    tokio::time::sleep(sleep).await;
    debug!(
        status = response.status(),
        reason = response.reason(),
        "complete"
    );
    response
}

async fn execute_with_retry(
    session: &reqwest::Client,
    request: Request,
    timeout: Duration,
    retry: u32,
    retry_interval: Duration,
) -> Response {
    for _ in 0..=retry {
        match tokio::time::timeout(timeout, attempt(session, &request)).await {
            Ok(Ok(response)) => return response,
            Ok(Err(err)) => {
                warn!(request = %request, error = %err, "request failed");
                return Response::failure(request, err.to_string());
            }
            Err(_elapsed) => tokio::time::sleep(retry_interval).await,
        }
    }
    let reason = format!("TimeoutError({}s)", format_seconds(timeout));
    Response::failure(request, reason)
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("multiple request bodies")]
    MultipleBodies,
    #[error("cannot open body file: {0}")]
    File(#[from] std::io::Error),
}

/// One attempt: send the request and read the body to completion. The caller
/// bounds the whole call with the per-attempt timeout.
async fn attempt(session: &reqwest::Client, request: &Request) -> Result<Response, AttemptError> {
    let builder = build_request(session, request).await?;
    let reply = builder.send().await?;
    let url = reply.url().to_string();
    let status = i32::from(reply.status().as_u16());
    let reason = reply
        .status()
        .canonical_reason()
        .unwrap_or_default()
        .to_string();
    let content = reply.bytes().await?;
    Ok(Response::new(url, status, reason, content, request.clone()))
}

async fn build_request(
    session: &reqwest::Client,
    request: &Request,
) -> Result<reqwest::RequestBuilder, AttemptError> {
    if request.body_slots() > 1 {
        return Err(AttemptError::MultipleBodies);
    }

    let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
    };
    let mut builder = session.request(method, request.url.clone());
    if let Some(headers) = &request.headers {
        builder = builder.headers(headers.clone());
    }
    if let Some(params) = &request.params {
        builder = builder.query(params);
    }
    if let Some(json) = &request.json {
        builder = builder.json(json);
    }
    if let Some(form) = &request.form {
        builder = builder.form(form);
    }
    if let Some(body) = &request.body {
        builder = builder
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body.clone());
    }
    if let Some(text) = &request.text {
        builder = builder
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text.clone());
    }
    if let Some(path) = &request.file {
        let file = tokio::fs::File::open(path).await?;
        let stream = ReaderStream::with_capacity(file, FILE_CHUNK_SIZE);
        builder = builder
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream));
    }
    Ok(builder)
}

fn format_seconds(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{secs}")
    }
}
