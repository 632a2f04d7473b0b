//! Quarry HTTP client.
//!
//! A throttled asynchronous HTTP client built for fetch-and-extract
//! pipelines: batched submission, global and per-host concurrency limits,
//! per-request retry/timeout/sleep policy, and responses that are always
//! materialized, even for transport failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use quarry_client::{Client, Reply, Request, Settings};
//!
//! let client = Client::new(Settings::default());
//! let future = client.submit(Request::get("https://example.com/")?);
//! if let Reply::One(response) = future.wait().await? {
//!     println!("{} {}", response.status(), response.url());
//! }
//! client.close().await;
//! ```

pub mod blocking;
pub mod client;
pub mod dom;
pub mod error;
pub mod request;
pub mod response;
pub mod settings;
pub mod throttle;

pub use blocking::{BlockingClient, BlockingFuture};
pub use client::{Client, ClientStatus, Reply, ResponseFuture, Submission};
pub use dom::{XmlDocument, XmlElement, XmlNode};
pub use error::ClientError;
pub use request::{Method, Request};
pub use response::Response;
pub use settings::{Settings, SettingsOverlay};
pub use throttle::{Throttle, ThrottlePermit};
