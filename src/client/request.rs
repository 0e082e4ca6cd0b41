//! Request/response correlation: one waiter per outstanding id.

use crate::binary::Node;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Outstanding requests keyed by id. Waiters are removed on response, timeout or failure.
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Result<Node>>>>,
    prefix: String,
    counter: AtomicU64,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        let tag: [u8; 2] = rand::random();
        Self {
            waiters: Mutex::new(HashMap::new()),
            prefix: format!("{}.{}", tag[0], tag[1]),
            counter: AtomicU64::new(1),
        }
    }

    /// Unique id for an outbound request on this client.
    pub(crate) fn next_id(&self) -> String {
        format!("{}-{}", self.prefix, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Register before sending so a fast response is never missed.
    pub(crate) fn register(&self, id: &str) -> oneshot::Receiver<Result<Node>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        rx
    }

    /// Hand a response to its waiter. Returns false if nobody waits for `id`.
    pub(crate) fn resolve(&self, id: &str, node: Node) -> bool {
        match self.lock().remove(id) {
            Some(tx) => tx.send(Ok(node)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Fail every waiter, e.g. with `Cancelled` on close or `AuthRevoked` on logout.
    pub(crate) fn fail_all(&self, err: impl Fn() -> Error) {
        let waiters: Vec<_> = self.lock().drain().collect();
        if !waiters.is_empty() {
            debug!(count = waiters.len(), "failing pending requests");
        }
        for (_, tx) in waiters {
            let _ = tx.send(Err(err()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Wait for the response to a registered id. On timeout the waiter is removed and
    /// `Timeout` is returned; other requests are unaffected.
    pub(crate) async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<Result<Node>>,
        timeout: Duration,
    ) -> Result<Node> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.remove(id);
                Err(Error::Timeout)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Result<Node>>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}
