//! Public client facade (C8): the only type embedders construct directly.
//!
//! `Client::connect` spawns the reconnect supervisor (§4.6, §4.8) as a
//! background task and returns once the first TCP connection attempt has
//! either succeeded or failed; handshake and steady-state traffic proceed
//! asynchronously and are observed through the returned event channel.

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::ClientConfig;
use crate::connection::{self, Command};
use crate::entry::{Entry, EntryFlags};
use crate::error::ClientError;
use crate::session::ClientEvent;
use crate::value::{EntryType, EntryValue};

/// Bound on the outbound command queue. Per §5 the queue is the sole
/// cross-task channel and is bounded; a full queue makes [`Client::set_entry`]
/// and friends wait (or, via the `try_*` variants, fail with `Backpressure`).
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Bound on the event channel delivered to the embedder.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// A handle to one client session. Cheap to clone; every clone shares the
/// same underlying connection and command queue.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
}

impl Client {
    /// Connects to the server described by `config`, returning once the
    /// first TCP connection attempt resolves. On success, returns the
    /// client handle plus the channel on which [`ClientEvent`]s (connection
    /// state changes, entry table changes, RPC responses) are delivered.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();

        let loop_command_tx = command_tx.clone();
        tokio::spawn(connection::run_supervisor(
            config,
            command_rx,
            loop_command_tx,
            event_tx,
            ready_tx,
        ));

        ready_rx
            .await
            .map_err(|_| ClientError::TransportClosed)??;

        Ok((Client { commands: command_tx }, event_rx))
    }

    /// Proposes a write to `name`. If the name is unknown to this client,
    /// an ENTRY_ASSIGNMENT with the unassigned sentinel id is queued and the
    /// name is reserved locally pending the server's authoritative echo
    /// (§4.5, §9 — assignments are authoritative-only, never optimistic).
    /// If the name is already known, an ENTRY_UPDATE with an incremented
    /// sequence number is sent.
    ///
    /// Resolves once the message has been handed to the socket, surfacing
    /// `ClientError::TypeMismatch` synchronously if `value`'s variant
    /// doesn't match `entry_type` — an encoder error is a caller bug, not a
    /// connection failure (§7).
    pub async fn set_entry(
        &self,
        name: &str,
        entry_type: EntryType,
        value: EntryValue,
        flags: EntryFlags,
    ) -> Result<(), ClientError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::Propose {
                name: name.to_string(),
                entry_type,
                value,
                flags,
                respond,
            })
            .await
            .map_err(|_| ClientError::TransportClosed)?;
        rx.await.map_err(|_| ClientError::TransportClosed)?
    }

    /// Non-blocking variant of [`Client::set_entry`]: fails immediately with
    /// `ClientError::Backpressure` instead of waiting when the outbound
    /// queue is full, per the "Backpressure" API mode in §5.
    pub fn try_set_entry(
        &self,
        name: &str,
        entry_type: EntryType,
        value: EntryValue,
        flags: EntryFlags,
    ) -> Result<(), ClientError> {
        let (respond, _rx) = oneshot::channel();
        self.commands
            .try_send(Command::Propose {
                name: name.to_string(),
                entry_type,
                value,
                flags,
                respond,
            })
            .map_err(|_| ClientError::Backpressure)
    }

    /// Invokes the RPC defined by the entry at `def_id` with `params`,
    /// awaiting the server's RPC_RESPONSE (or cancellation/timeout per
    /// §4.7).
    pub async fn call_rpc(
        &self,
        def_id: u16,
        params: Vec<EntryValue>,
    ) -> Result<Vec<EntryValue>, ClientError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::CallRpc {
                def_id,
                params,
                respond,
            })
            .await
            .map_err(|_| ClientError::TransportClosed)?;
        rx.await.map_err(|_| ClientError::TransportClosed)?
    }

    /// Returns a snapshot copy of every acknowledged entry in the table.
    pub async fn entries(&self) -> Result<Vec<Entry>, ClientError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { respond })
            .await
            .map_err(|_| ClientError::TransportClosed)?;
        rx.await.map_err(|_| ClientError::TransportClosed)
    }

    /// Requests a graceful close: best-effort drain, then DISCONNECTED.
    /// Does not wait for the teardown to complete.
    pub async fn close(&self) {
        if self.commands.send(Command::Close).await.is_err() {
            warn!("close() called after connection already gone");
        }
    }
}
