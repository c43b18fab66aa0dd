//! Tracks in-flight Invocation frames awaiting a matching Completion
//! (spec §3/§4.B). Modeled on the `id -> in-flight request` map shape common
//! to JSON-RPC-style request managers, with a monotonic counter standing in
//! for the wire's string `invocationId`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::frame::CompletionFrame;

/// A single invocation awaiting completion: its target name (for logging)
/// and the oneshot the caller is blocked on.
struct InFlightInvocation {
    target: String,
    reply: oneshot::Sender<CompletionFrame>,
}

/// Tracks outstanding Invocations by id, matching Completions as they arrive.
///
/// Cloning is cheap and shares state — all clones see the same map.
#[derive(Clone)]
pub struct InvocationTracker {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<String, InFlightInvocation>>,
}

impl Default for InvocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationTracker {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                next_id: AtomicU64::new(1),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocates a fresh invocation id and registers a waiter for its
    /// completion. Returns the id to send on the wire and a receiver that
    /// resolves when [`InvocationTracker::match_completion`] is called with
    /// that id.
    pub fn track(&self, target: impl Into<String>) -> (String, oneshot::Receiver<CompletionFrame>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let invocation_id = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.in_flight.lock().insert(
            invocation_id.clone(),
            InFlightInvocation {
                target: target.into(),
                reply: tx,
            },
        );
        (invocation_id, rx)
    }

    /// Matches an inbound Completion frame against a tracked invocation,
    /// waking its waiter. Returns `false` if no such invocation is tracked
    /// (already completed, timed out, or never sent from here).
    pub fn match_completion(&self, completion: CompletionFrame) -> bool {
        let Some(id) = completion.invocation_id.clone() else {
            return false;
        };
        let Some(entry) = self.inner.in_flight.lock().remove(&id) else {
            return false;
        };
        // A dropped receiver (caller gave up waiting) is not an error here.
        let _ = entry.reply.send(completion);
        true
    }

    /// Drops a tracked invocation without completing it, e.g. on transport
    /// close. Returns the target name if one was tracked, for logging.
    pub fn abandon(&self, invocation_id: &str) -> Option<String> {
        self.inner
            .in_flight
            .lock()
            .remove(invocation_id)
            .map(|entry| entry.target)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.in_flight.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_and_matches_completion() {
        let tracker = InvocationTracker::new();
        let (id, rx) = tracker.track("Heartbeat");
        assert!(!tracker.is_empty());

        let matched = tracker.match_completion(CompletionFrame {
            kind: crate::frame::CompletionTag,
            invocation_id: Some(id.clone()),
            result: Some(serde_json::json!("ok")),
            error: None,
        });
        assert!(matched);
        assert!(tracker.is_empty());

        let completion = rx.await.unwrap();
        assert_eq!(completion.invocation_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn unknown_completion_id_is_ignored() {
        let tracker = InvocationTracker::new();
        let matched = tracker.match_completion(CompletionFrame {
            kind: crate::frame::CompletionTag,
            invocation_id: Some("does-not-exist".into()),
            result: None,
            error: None,
        });
        assert!(!matched);
    }

    #[test]
    fn abandon_removes_without_completing() {
        let tracker = InvocationTracker::new();
        let (id, _rx) = tracker.track("Heartbeat");
        assert_eq!(tracker.abandon(&id).as_deref(), Some("Heartbeat"));
        assert!(tracker.is_empty());
    }
}
