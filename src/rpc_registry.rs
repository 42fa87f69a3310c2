//! Correlates outgoing RPC executions with server responses.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::value::EntryValue;

/// Why a pending RPC call's slot completed without a real response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcFailure {
    Cancelled,
    TimedOut,
}

pub type RpcOutcome = Result<Vec<EntryValue>, RpcFailure>;

/// Registry of in-flight RPC calls, keyed by `(definitionId, uniqueId)` as
/// the spec requires. Owned by the session event loop; nothing outside it
/// touches the map directly.
#[derive(Default)]
pub struct RpcRegistry {
    pending: HashMap<(u16, u16), oneshot::Sender<RpcOutcome>>,
    next_unique_id: HashMap<u16, u16>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh `uniqueId` for `def_id`, skipping any value
    /// currently pending for that definition, and registers a completion
    /// slot. Returns the unique id and the receiver half the caller should
    /// await.
    pub fn register_call(&mut self, def_id: u16) -> (u16, oneshot::Receiver<RpcOutcome>) {
        let counter = self.next_unique_id.entry(def_id).or_insert(0);
        let mut candidate = *counter;
        while self.pending.contains_key(&(def_id, candidate)) {
            candidate = candidate.wrapping_add(1);
        }
        *counter = candidate.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        self.pending.insert((def_id, candidate), tx);
        (candidate, rx)
    }

    /// Completes the matching slot with `results`. If no slot is pending
    /// (already timed out, or the response doesn't match anything we sent),
    /// the response is discarded; the caller should log this.
    pub fn complete(&mut self, def_id: u16, unique_id: u16, results: Vec<EntryValue>) -> bool {
        match self.pending.remove(&(def_id, unique_id)) {
            Some(tx) => {
                let _ = tx.send(Ok(results));
                true
            }
            None => false,
        }
    }

    /// Drops a slot without completing it (used when a per-call timeout
    /// fires; a later response for the same key is then silently
    /// discarded because the key is gone).
    pub fn expire(&mut self, def_id: u16, unique_id: u16) {
        if let Some(tx) = self.pending.remove(&(def_id, unique_id)) {
            let _ = tx.send(Err(RpcFailure::TimedOut));
        }
    }

    /// Completes every pending slot with `Cancelled`; called on session
    /// drop.
    pub fn cancel_all(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(RpcFailure::Cancelled));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
