//! Session state machine: handshake negotiation and steady-state message
//! dispatch. Pure and synchronous — it owns the entry table and RPC
//! registry but knows nothing about sockets, so it can be driven by tests
//! without any I/O.

use tracing::{debug, trace, warn};

use crate::entry::{EntryFlags, EntryTable, TableChange, UNASSIGNED_ID};
use crate::error::ClientError;
use crate::message::{client_hello, is_unassigned_id, Message, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use crate::rpc_registry::RpcRegistry;
use crate::value::EntryValue;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingServerHello,
    ReceivingInitialAssignments,
    Ready,
    Disconnecting,
}

/// Something the session wants the caller (the transport glue / client
/// facade) to do in response to a decoded message or a local action.
#[derive(Debug)]
pub enum Action {
    Send(Message),
    Emit(ClientEvent),
    /// A fatal protocol error occurred; the caller should close the
    /// transport and (per its reconnect policy) transition to
    /// Disconnected.
    Fail(ClientError),
}

/// Events an embedder can observe, mirroring spec §6.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(SessionState),
    EntryAssigned { id: u16, name: String },
    EntryUpdated { id: u16, previous: EntryValue },
    EntryFlagsUpdated { id: u16 },
    EntryDeleted { id: u16, name: String },
    EntriesCleared,
    RpcResponse {
        def_id: u16,
        unique_id: u16,
        results: Vec<EntryValue>,
    },
}

/// Drives the handshake and steady-state dispatch. `table` and `rpc` are
/// public so the client facade can take snapshots / submit calls between
/// messages; only this module mutates them.
pub struct Session {
    pub state: SessionState,
    pub table: EntryTable,
    pub rpc: RpcRegistry,
    client_identity: String,
    client_previously_seen: bool,
    server_identity: String,
}

impl Session {
    pub fn new(client_identity: String) -> Self {
        Session {
            state: SessionState::Disconnected,
            table: EntryTable::new(),
            rpc: RpcRegistry::new(),
            client_identity,
            client_previously_seen: false,
            server_identity: String::new(),
        }
    }

    pub fn server_identity(&self) -> &str {
        &self.server_identity
    }

    pub fn client_previously_seen(&self) -> bool {
        self.client_previously_seen
    }

    fn set_state(&mut self, state: SessionState, actions: &mut Vec<Action>) {
        self.state = state;
        actions.push(Action::Emit(ClientEvent::ConnectionStateChanged(state)));
    }

    /// Called once the underlying transport is open. Transitions
    /// Connecting -> AwaitingServerHello and returns the CLIENT_HELLO to
    /// send.
    pub fn on_transport_up(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.set_state(SessionState::AwaitingServerHello, &mut actions);
        actions.push(Action::Send(client_hello(self.client_identity.clone())));
        actions
    }

    /// Called when the transport closes (expectedly or not). Cancels all
    /// pending RPC calls and resets to Disconnected; does not itself
    /// schedule a reconnect (that's the client facade's job, per its
    /// backoff policy).
    pub fn on_transport_down(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.rpc.cancel_all();
        self.set_state(SessionState::Disconnected, &mut actions);
        actions
    }

    pub fn on_close_requested(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.set_state(SessionState::Disconnecting, &mut actions);
        actions
    }

    /// Dispatches one decoded inbound message, mutating the entry table /
    /// RPC registry as needed and returning the actions the caller should
    /// take (sends, event emissions, or a fatal failure).
    pub fn on_message(&mut self, message: Message) -> Vec<Action> {
        let mut actions = Vec::new();
        match (self.state, message) {
            (SessionState::AwaitingServerHello, Message::ServerHello { client_previously_seen, server_identity }) => {
                self.client_previously_seen = client_previously_seen;
                self.server_identity = server_identity;
                self.set_state(SessionState::ReceivingInitialAssignments, &mut actions);
            }
            (SessionState::AwaitingServerHello, Message::ProtoVersionUnsupported { server_major, server_minor }) => {
                self.set_state(SessionState::Disconnecting, &mut actions);
                actions.push(Action::Fail(ClientError::UnsupportedProtocolVersion {
                    server_major,
                    server_minor,
                }));
            }
            (SessionState::ReceivingInitialAssignments, Message::EntryAssignment { name, entry_type, id, seq, flags, value }) => {
                self.apply_assignment(name, entry_type, id, seq, flags, value, &mut actions);
            }
            (SessionState::ReceivingInitialAssignments, Message::ServerHelloComplete) => {
                self.set_state(SessionState::Ready, &mut actions);
                actions.push(Action::Send(Message::ClientHelloComplete));
            }
            (SessionState::Ready, Message::EntryAssignment { name, entry_type, id, seq, flags, value }) => {
                self.apply_assignment(name, entry_type, id, seq, flags, value, &mut actions);
            }
            (SessionState::Ready, Message::EntryUpdate { id, seq, entry_type, value }) => {
                match self.table.apply_update(id, seq, entry_type, value) {
                    TableChange::Updated { previous } => {
                        actions.push(Action::Emit(ClientEvent::EntryUpdated { id, previous }));
                    }
                    TableChange::Ignored => {
                        debug!(id, seq, "dropped stale or unknown ENTRY_UPDATE");
                    }
                    _ => unreachable!("apply_update only returns Updated or Ignored"),
                }
            }
            (SessionState::Ready, Message::EntryFlagsUpdate { id, flags }) => {
                match self.table.apply_flags_update(id, flags) {
                    TableChange::FlagsUpdated => {
                        actions.push(Action::Emit(ClientEvent::EntryFlagsUpdated { id }));
                    }
                    TableChange::Ignored => {
                        debug!(id, "dropped ENTRY_FLAGS_UPDATE for unknown id");
                    }
                    _ => unreachable!("apply_flags_update only returns FlagsUpdated or Ignored"),
                }
            }
            (SessionState::Ready, Message::EntryDelete { id }) => {
                match self.table.apply_delete(id) {
                    TableChange::Deleted { name } => {
                        actions.push(Action::Emit(ClientEvent::EntryDeleted { id, name }));
                    }
                    TableChange::Ignored => trace!(id, "delete of unknown id is a no-op"),
                    _ => unreachable!("apply_delete only returns Deleted or Ignored"),
                }
            }
            (SessionState::Ready, Message::ClearAllEntries) => {
                self.table.apply_clear_all();
                actions.push(Action::Emit(ClientEvent::EntriesCleared));
            }
            (SessionState::Ready, Message::RpcResponse { def_id, unique_id, results }) => {
                if self.rpc.complete(def_id, unique_id, results.clone()) {
                    actions.push(Action::Emit(ClientEvent::RpcResponse { def_id, unique_id, results }));
                } else {
                    warn!(def_id, unique_id, "RPC_RESPONSE with no matching pending call");
                }
            }
            (SessionState::Ready, Message::KeepAlive) => {
                trace!("received KEEP_ALIVE");
            }
            (state, other) => {
                warn!(?state, ?other, "unexpected message for current session state");
            }
        }
        actions
    }

    fn apply_assignment(
        &mut self,
        name: String,
        entry_type: crate::value::EntryType,
        id: u16,
        seq: u16,
        flags: EntryFlags,
        value: EntryValue,
        actions: &mut Vec<Action>,
    ) {
        if is_unassigned_id(id) {
            actions.push(Action::Fail(ClientError::Decode(
                crate::error::DecodeError::Malformed(
                    "server sent ENTRY_ASSIGNMENT with the unassigned sentinel id".into(),
                ),
            )));
            return;
        }
        match self.table.apply_assignment(name, entry_type, id, seq, flags, value) {
            Ok(TableChange::Assigned) => {
                let name = self.table.get_by_id(id).map(|e| e.name.clone()).unwrap_or_default();
                actions.push(Action::Emit(ClientEvent::EntryAssigned { id, name }));
            }
            Ok(_) => unreachable!("apply_assignment only returns Assigned on success"),
            Err(()) => unreachable!("is_unassigned_id(id) is checked above"),
        }
    }

    /// Builds the outbound message for a client-origin write, and applies
    /// the local bookkeeping side effect (placeholder insertion for new
    /// names; nothing for known names, since those are mirrored
    /// optimistically by the caller if it wants to).
    pub fn propose_entry(
        &mut self,
        name: &str,
        entry_type: crate::value::EntryType,
        value: EntryValue,
        flags: EntryFlags,
    ) -> Message {
        if let Some(existing) = self.table.get_by_name(name) {
            let seq = existing.seq.wrapping_add(1);
            let id = existing.id;
            Message::EntryUpdate {
                id,
                seq,
                entry_type,
                value,
            }
        } else {
            let seq = 1;
            self.table
                .insert_placeholder(name.to_string(), entry_type, seq, flags, value.clone());
            Message::EntryAssignment {
                name: name.to_string(),
                entry_type,
                id: UNASSIGNED_ID,
                seq,
                flags,
                value,
            }
        }
    }

    pub fn protocol_version() -> (u8, u8) {
        (PROTOCOL_MAJOR, PROTOCOL_MINOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EntryType;

    fn ready_session() -> Session {
        let mut session = Session::new("test-client".to_string());
        session.on_transport_up();
        session.on_message(Message::ServerHello {
            client_previously_seen: false,
            server_identity: "srv".to_string(),
        });
        let actions = session.on_message(Message::ServerHelloComplete);
        assert!(matches!(session.state, SessionState::Ready));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Send(Message::ClientHelloComplete))));
        session
    }

    #[test]
    fn s1_handshake_sequence() {
        let mut session = Session::new(String::new());
        let actions = session.on_transport_up();
        assert_eq!(session.state, SessionState::AwaitingServerHello);
        let hello = actions
            .into_iter()
            .find_map(|a| match a {
                Action::Send(m) => Some(m),
                _ => None,
            })
            .unwrap();
        let mut bytes = Vec::new();
        hello.encode(&mut bytes).unwrap();
        assert_eq!(bytes, vec![0x01, 0x03, 0x00, 0x00]);

        session.on_message(Message::ServerHello {
            client_previously_seen: false,
            server_identity: "ABC".to_string(),
        });
        assert_eq!(session.state, SessionState::ReceivingInitialAssignments);

        let actions = session.on_message(Message::ServerHelloComplete);
        assert_eq!(session.state, SessionState::Ready);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Send(Message::ClientHelloComplete))));
    }

    #[test]
    fn proto_version_unsupported_is_fatal_and_terminal() {
        let mut session = Session::new(String::new());
        session.on_transport_up();
        let actions = session.on_message(Message::ProtoVersionUnsupported {
            server_major: 4,
            server_minor: 0,
        });
        assert_eq!(session.state, SessionState::Disconnecting);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Fail(ClientError::UnsupportedProtocolVersion { server_major: 4, server_minor: 0 })
        )));
    }

    #[test]
    fn ready_dispatches_entry_update_event() {
        let mut session = ready_session();
        session
            .table
            .apply_assignment(
                "x".to_string(),
                EntryType::Double,
                1,
                1,
                EntryFlags::default(),
                EntryValue::Double(1.0),
            )
            .unwrap();
        let actions = session.on_message(Message::EntryUpdate {
            id: 1,
            seq: 2,
            entry_type: EntryType::Double,
            value: EntryValue::Double(2.0),
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Emit(ClientEvent::EntryUpdated { id: 1, .. }))));
    }

    #[test]
    fn transport_down_cancels_pending_rpc() {
        let mut session = ready_session();
        let (_unique_id, rx) = session.rpc.register_call(9);
        session.on_transport_down();
        assert_eq!(session.state, SessionState::Disconnected);
        // The slot was cancelled synchronously; awaiting would resolve
        // immediately to Cancelled, but we only assert it was removed here
        // to keep this test synchronous.
        assert_eq!(session.rpc.pending_count(), 0);
        drop(rx);
    }

    #[test]
    fn propose_entry_for_new_name_uses_placeholder() {
        let mut session = Session::new(String::new());
        let msg = session.propose_entry(
            "new",
            EntryType::Boolean,
            EntryValue::Boolean(true),
            EntryFlags::default(),
        );
        assert!(matches!(
            msg,
            Message::EntryAssignment { id: UNASSIGNED_ID, .. }
        ));
        assert!(session.table.pending_by_name("new").is_some());
    }

    #[test]
    fn propose_entry_for_known_name_uses_update_with_incremented_seq() {
        let mut session = Session::new(String::new());
        session
            .table
            .apply_assignment(
                "known".to_string(),
                EntryType::Boolean,
                3,
                5,
                EntryFlags::default(),
                EntryValue::Boolean(false),
            )
            .unwrap();
        let msg = session.propose_entry(
            "known",
            EntryType::Boolean,
            EntryValue::Boolean(true),
            EntryFlags::default(),
        );
        assert_eq!(
            msg,
            Message::EntryUpdate {
                id: 3,
                seq: 6,
                entry_type: EntryType::Boolean,
                value: EntryValue::Boolean(true),
            }
        );
    }
}
