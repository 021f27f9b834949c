//! Correlating outbound query ids with inbound reply DMs.
//!
//! `/forward` registers a one-shot completion handle under the query id
//! before sending; the dispatcher completes it when a matching
//! `http.response` arrives. A handle is removed exactly once: on reply,
//! on waiter timeout, or on a failed enqueue.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

/// Registry of in-flight `/forward` queries.
#[derive(Default)]
pub struct PendingRegistry {
    waiters: DashMap<String, oneshot::Sender<Value>>,
}

impl PendingRegistry {
    pub fn new() -> PendingRegistry {
        PendingRegistry::default()
    }

    /// Register a waiter for `id`, returning the receiving half.
    ///
    /// At most one waiter per id: a second registration under the same id
    /// replaces the first, whose receiver will observe a closed channel.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.to_owned(), tx);
        rx
    }

    /// Complete the waiter for `id` with a reply, removing it. Returns
    /// `false` when no waiter was registered (the reply is discarded).
    /// Completion is idempotent: a second reply finds no waiter.
    pub fn complete(&self, id: &str, reply: Value) -> bool {
        match self.waiters.remove(id) {
            // The waiter may have timed out between removal and send; the
            // dropped receiver just swallows the value.
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id`, if any. Used on timeout and on failed
    /// sends.
    pub fn remove(&self, id: &str) {
        self.waiters.remove(id);
    }

    /// Number of in-flight waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
