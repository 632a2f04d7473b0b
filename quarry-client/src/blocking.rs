//! Blocking bridge over the async client.
//!
//! A dedicated thread owns a current-thread runtime and an async [`Client`];
//! callers submit from synchronous code and poll a [`BlockingFuture`] for
//! the reply. The bridge thread must never block on the queue, so it polls
//! with a short async sleep between attempts.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::error;

use crate::client::{Client, Reply, Submission};
use crate::error::ClientError;
use crate::settings::Settings;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Job {
    Submit(BlockingFuture, Submission),
    Stop,
}

#[derive(Default)]
struct Shared {
    started: bool,
    done: bool,
    cancelled: bool,
    reply: Option<Result<Reply, ClientError>>,
}

/// Blocking handle to an async batch.
#[derive(Clone)]
pub struct BlockingFuture {
    shared: Arc<Mutex<Shared>>,
    cancel: Arc<Notify>,
}

impl BlockingFuture {
    fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            cancel: Arc::new(Notify::new()),
        }
    }

    /// Whether the bridge thread has handed the batch to the async client.
    pub fn running(&self) -> bool {
        self.shared.lock().started
    }

    pub fn done(&self) -> bool {
        let shared = self.shared.lock();
        shared.done || shared.cancelled
    }

    pub fn cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// Forward a cancellation to the async future. Blocks until the async
    /// future exists; returns false when the batch already completed.
    pub fn cancel(&self) -> bool {
        while !self.running() {
            thread::sleep(POLL_INTERVAL);
        }
        {
            let mut shared = self.shared.lock();
            if shared.done {
                return false;
            }
            shared.cancelled = true;
        }
        self.cancel.notify_one();
        true
    }

    /// Poll for the reply at a coarse (~100 ms) granularity.
    pub fn result(&self, timeout: Option<Duration>) -> Result<Reply, ClientError> {
        let start = Instant::now();
        loop {
            {
                let shared = self.shared.lock();
                if shared.cancelled {
                    return Err(ClientError::Cancelled);
                }
                if shared.done {
                    return shared
                        .reply
                        .clone()
                        .unwrap_or(Err(ClientError::Closed));
                }
            }
            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    return Err(ClientError::ResultTimeout);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Client facade usable from non-async code.
pub struct BlockingClient {
    tx: Sender<Job>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BlockingClient {
    pub fn new(settings: Settings) -> Self {
        let (tx, rx) = channel();
        let thread = thread::spawn(move || bridge_main(rx, settings));
        Self {
            tx,
            thread: Some(thread),
        }
    }

    pub fn submit(&self, requests: impl Into<Submission>) -> BlockingFuture {
        let future = BlockingFuture::new();
        let _ = self
            .tx
            .send(Job::Submit(future.clone(), requests.into()));
        future
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(Job::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bridge_main(rx: Receiver<Job>, settings: Settings) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build bridge runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let client = Client::new(settings);
        loop {
            // try_recv: a blocking Receiver::recv would stall the whole
            // runtime and the in-flight batches with it.
            match rx.try_recv() {
                Err(TryRecvError::Empty) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(TryRecvError::Disconnected) | Ok(Job::Stop) => break,
                Ok(Job::Submit(future, submission)) => {
                    let response_future = client.submit(submission);
                    future.shared.lock().started = true;
                    let shared = Arc::clone(&future.shared);
                    let cancel = Arc::clone(&future.cancel);
                    tokio::spawn(async move {
                        tokio::select! {
                            result = response_future.wait() => {
                                let mut shared = shared.lock();
                                shared.reply = Some(result);
                                shared.done = true;
                            }
                            _ = cancel.notified() => {
                                // Dropping the response future cancels the batch.
                                shared.lock().cancelled = true;
                            }
                        }
                    });
                }
            }
        }
        client.close().await;
    });
}
