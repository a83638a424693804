//! Client-side pending-call table.
//!
//! Correlates responses with outstanding requests by id. Completion is
//! one-shot by construction: whichever of response arrival, timeout, write
//! failure or teardown removes the entry first delivers the outcome, and
//! everyone else observes absence and stands down.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;

pub(crate) type CallReply = Result<Value, Error>;

#[derive(Default)]
pub(crate) struct PendingCalls {
    entries: Mutex<HashMap<u32, oneshot::Sender<CallReply>>>,
}

impl PendingCalls {
    pub fn new() -> PendingCalls {
        PendingCalls::default()
    }

    /// Register an in-flight request. Reusing an id while the original call
    /// is still pending is a caller bug; the stale entry is dropped.
    pub fn insert(&self, id: u32) -> oneshot::Receiver<CallReply> {
        let (tx, rx) = oneshot::channel();
        let stale = self.lock().insert(id, tx);
        debug_assert!(stale.is_none(), "request id {id} reused while pending");
        rx
    }

    /// Deliver the outcome for `id`. Returns false when the entry is
    /// already gone, in which case the reply is discarded.
    pub fn complete(&self, id: u32, reply: CallReply) -> bool {
        // The send happens under the lock so that a completion racer that
        // observes absence can rely on the reply being in the channel.
        let mut entries = self.lock();
        match entries.remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => {
                drop(entries);
                debug!(id, "no pending call for response");
                false
            }
        }
    }

    /// Fail one outstanding call. A no-op if the call already completed.
    pub fn cancel(&self, id: u32, error: Error) -> bool {
        self.complete(id, Err(error))
    }

    /// Fail every outstanding call, e.g. at session teardown.
    pub fn cancel_all(&self, error: impl Fn() -> Error) {
        let entries = std::mem::take(&mut *self.lock());
        for (_, tx) in entries {
            let _ = tx.send(Err(error()));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, oneshot::Sender<CallReply>>> {
        self.entries.lock().expect("pending-call table lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_delivers_once() {
        let pending = PendingCalls::new();
        let rx = pending.insert(1);

        assert!(pending.complete(1, Ok(json!(42))));
        assert!(!pending.complete(1, Ok(json!(43))));

        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
    }

    #[tokio::test]
    async fn cancel_is_noop_after_completion() {
        let pending = PendingCalls::new();
        let rx = pending.insert(7);

        assert!(pending.complete(7, Ok(json!("ok"))));
        assert!(!pending.cancel(7, Error::Timeout));
        assert!(!pending.cancel(424242, Error::Cancelled));

        assert_eq!(rx.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_entry() {
        let pending = PendingCalls::new();
        let rx1 = pending.insert(1);
        let rx2 = pending.insert(2);

        pending.cancel_all(|| Error::SessionClosed);

        assert!(matches!(rx1.await.unwrap(), Err(Error::SessionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(Error::SessionClosed)));
    }
}
