//! Correlation table for in-flight requests

use crate::error::{MeshError, MeshResult};
use crate::protocol::Envelope;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Single-slot waiters keyed by request id
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    waiters: DashMap<String, oneshot::Sender<Envelope>>,
    late_responses: AtomicU64,
    closed: AtomicBool,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; fails once the link is gone
    pub fn register(&self, key: String) -> MeshResult<Waiter<'_>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::transport_closed("connection is closed"));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key.clone(), tx);
        // fail_all sets the flag before clearing, so an insert that raced
        // it is either cleared by it or caught here
        if self.closed.load(Ordering::SeqCst) {
            self.waiters.remove(&key);
            return Err(MeshError::transport_closed("connection is closed"));
        }
        Ok(Waiter {
            key,
            rx,
            table: self,
        })
    }

    /// Hand a response to its waiter
    ///
    /// Responses with no waiter are dropped and counted.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(key) = envelope.correlation_key() else {
            debug!("Ignoring response without id");
            return false;
        };
        match self.waiters.remove(&key) {
            Some((_, tx)) => {
                if tx.send(envelope).is_err() {
                    self.count_late(&key);
                    return false;
                }
                true
            }
            None => {
                self.count_late(&key);
                false
            }
        }
    }

    fn count_late(&self, key: &str) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping response for unknown or abandoned request {}", key);
    }

    /// Mark the link closed and wake every waiter with an error
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.waiters.len();
        self.waiters.clear();
        if count > 0 {
            debug!("Failed {} pending requests", count);
        }
    }

    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Registered slot; its entry is removed on drop
pub(crate) struct Waiter<'a> {
    key: String,
    rx: oneshot::Receiver<Envelope>,
    table: &'a PendingRequests,
}

impl Waiter<'_> {
    /// Race the response against cancellation and the deadline
    pub async fn wait(
        mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> MeshResult<Envelope> {
        tokio::select! {
            response = &mut self.rx => response.map_err(|_| {
                MeshError::transport_closed(format!("connection closed before response to {}", self.key))
            }),
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(MeshError::timeout(timeout)),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.table.waiters.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, RequestId};
    use serde_json::json;

    fn response(id: &str) -> Envelope {
        Envelope::success(Some(RequestId::String(id.to_string())), json!({"ok": true}))
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let table = PendingRequests::new();
        let waiter = table.register("a".into()).unwrap();

        assert!(table.resolve(response("a")));
        let envelope = waiter
            .wait(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(envelope.correlation_key().as_deref(), Some("a"));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_late_response_counts() {
        let table = PendingRequests::new();
        let waiter = table.register("slow".into()).unwrap();

        let err = waiter
            .wait(&CancellationToken::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout { .. }));
        assert_eq!(table.len(), 0);

        assert!(!table.resolve(response("slow")));
        assert_eq!(table.late_responses(), 1);
    }

    #[tokio::test]
    async fn test_cancel_returns_early() {
        let table = PendingRequests::new();
        let waiter = table.register("c".into()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = waiter.wait(&cancel, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, MeshError::Cancelled));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_wakes_with_transport_closed() {
        let table = PendingRequests::new();
        let waiter = table.register("x".into()).unwrap();

        table.fail_all();
        let err = waiter
            .wait(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::TransportClosed { .. }));
        assert!(table.register("y".into()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_racing_fail_all_never_hangs() {
        for round in 0..50 {
            let table = std::sync::Arc::new(PendingRequests::new());
            let callers: Vec<_> = (0..8)
                .map(|i| {
                    let table = std::sync::Arc::clone(&table);
                    tokio::spawn(async move {
                        let Ok(waiter) = table.register(format!("{}-{}", round, i)) else {
                            return;
                        };
                        let err = waiter
                            .wait(&CancellationToken::new(), Duration::from_secs(2))
                            .await
                            .unwrap_err();
                        assert!(matches!(err, MeshError::TransportClosed { .. }), "{:?}", err);
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            table.fail_all();
            for caller in callers {
                caller.await.unwrap();
            }
            assert_eq!(table.len(), 0);
        }
    }
}
