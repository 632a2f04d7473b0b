//! Two-level admission control.
//!
//! A global semaphore caps total in-flight requests; a per-host semaphore
//! caps requests against any single host. The host table holds weak
//! references only, so entries evaporate as soon as the last permit holder
//! for that host is gone and the table stays bounded on long-lived clients.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct Throttle {
    global: Arc<Semaphore>,
    per_host: usize,
    hosts: Mutex<HashMap<String, Weak<Semaphore>>>,
}

/// A held admission slot. Dropping it releases the host permit first, then
/// the global permit, mirroring acquisition order.
pub struct ThrottlePermit {
    _host: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl Throttle {
    pub fn new(concurrency: usize, concurrency_per_host: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(concurrency)),
            per_host: concurrency_per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the global permit, then the permit for `host`. Cancellation
    /// while waiting releases whatever was already held.
    pub async fn acquire(&self, host: &str) -> ThrottlePermit {
        let host_semaphore = self.host_semaphore(host);
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .expect("throttle semaphore is never closed");
        let host_permit = host_semaphore
            .acquire_owned()
            .await
            .expect("throttle semaphore is never closed");
        ThrottlePermit {
            _host: host_permit,
            _global: global,
        }
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        if let Some(semaphore) = hosts.get(host).and_then(Weak::upgrade) {
            return semaphore;
        }
        hosts.retain(|_, weak| weak.strong_count() > 0);
        let semaphore = Arc::new(Semaphore::new(self.per_host));
        hosts.insert(host.to_string(), Arc::downgrade(&semaphore));
        semaphore
    }

    /// Number of live host entries. Exposed for tests and status reporting.
    pub fn host_count(&self) -> usize {
        self.hosts
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
