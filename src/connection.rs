//! Transport glue (C7): feeds inbound bytes to the message codec, flushes
//! outbound message bytes to the socket, and notifies the session state
//! machine of transport up/down events.
//!
//! Grounded in the teacher's `tcp.rs`/`rpcwire.rs` split, but collapsed into
//! a single per-connection task: the entry table and RPC registry are owned
//! by [`Session`], and the message codec needs read access to the table to
//! type RPC arguments (§4.4), so the reader loop and the state machine
//! cannot live on separate tasks without shipping the table back and forth.
//! A single task reads, parses, dispatches, and writes; a second task only
//! exists implicitly as whichever future is driving [`run_supervisor`].

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::entry::{Entry, EntryFlags};
use crate::error::{ClientError, DecodeError};
use crate::message::{lookup_rpc_definition, Message, ParseOutcome};
use crate::rpc_registry::RpcFailure;
use crate::session::{Action, ClientEvent, Session, SessionState};
use crate::value::{EntryType, EntryValue, MAX_ARRAY_LEN};

const READ_CHUNK: usize = 8192;

/// A request from the [`crate::Client`] facade into the connection's event
/// loop. All mutation of the session/table happens in response to one of
/// these, on the single task that owns them (§5).
pub enum Command {
    Propose {
        name: String,
        entry_type: EntryType,
        value: EntryValue,
        flags: EntryFlags,
        respond: oneshot::Sender<Result<(), ClientError>>,
    },
    CallRpc {
        def_id: u16,
        params: Vec<EntryValue>,
        respond: oneshot::Sender<Result<Vec<EntryValue>, ClientError>>,
    },
    Snapshot {
        respond: oneshot::Sender<Vec<Entry>>,
    },
    /// Internal: a per-call RPC timeout fired. Looped back through the same
    /// channel so the registry (owned by this task) is the only thing that
    /// ever touches it.
    ExpireRpc {
        def_id: u16,
        unique_id: u16,
    },
    Close,
}

/// Why one connection attempt ended, so the supervisor knows whether to
/// retry.
enum Ended {
    FailedToConnect(std::io::Error),
    /// The very first connection attempt failed; `Client::connect()` has
    /// already surfaced the error to its caller synchronously, so the
    /// supervisor must stop rather than retry in the background.
    FirstAttemptFailed,
    ClosedByUser,
    Dropped,
    /// The server rejected our protocol version; per spec this is terminal,
    /// never retried regardless of `reconnect`.
    VersionRejected,
}

/// Runs the reconnect supervisor for the lifetime of a [`crate::Client`]:
/// repeatedly attempts a connection, applying backoff between unexpected
/// drops. Only the *first* attempt's outcome is reported through `ready`;
/// later attempts are observed purely through `ClientEvent::ConnectionStateChanged`.
pub async fn run_supervisor(
    config: ClientConfig,
    mut commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    events: mpsc::Sender<ClientEvent>,
    ready: oneshot::Sender<Result<(), ClientError>>,
) {
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;
    loop {
        let ended = run_one_connection(&config, &mut commands, &command_tx, &events, &mut ready).await;
        match ended {
            Ended::ClosedByUser | Ended::VersionRejected | Ended::FirstAttemptFailed => break,
            Ended::FailedToConnect(_) | Ended::Dropped => {
                if !config.reconnect {
                    break;
                }
                let delay = config.reconnect_backoff.delay_for_attempt(attempt);
                attempt += 1;
                info!(?delay, attempt, "reconnecting after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
    debug!("connection supervisor exiting");
}

async fn run_one_connection(
    config: &ClientConfig,
    commands: &mut mpsc::Receiver<Command>,
    command_tx: &mpsc::Sender<Command>,
    events: &mpsc::Sender<ClientEvent>,
    ready: &mut Option<oneshot::Sender<Result<(), ClientError>>>,
) -> Ended {
    let addr = format!("{}:{}", config.server_addr, config.server_port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => {
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }
            stream
        }
        Err(e) => {
            warn!(error = %e, addr = %addr, "connect failed");
            return match ready.take() {
                Some(tx) => {
                    let _ = tx.send(Err(ClientError::Io(e)));
                    Ended::FirstAttemptFailed
                }
                None => Ended::FailedToConnect(e),
            };
        }
    };
    let _ = stream.set_nodelay(true);
    info!(addr = %addr, "connected");

    let (mut read_half, mut write_half) = stream.into_split();
    let mut session = Session::new(config.client_ident.clone());
    let mut last_outbound = Instant::now();

    if dispatch_actions(session.on_transport_up(), &mut write_half, events, &mut last_outbound)
        .await
        .is_some()
    {
        return Ended::Dropped;
    }

    let mut buffer: Vec<u8> = Vec::new();
    let mut offset: usize = 0;
    let mut read_buf = vec![0u8; READ_CHUNK];
    let mut keep_alive = tokio::time::interval(config.keep_alive_interval);
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keep_alive.tick().await; // first tick fires immediately; consume it

    let ended = loop {
        tokio::select! {
            result = read_half.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        info!("transport closed by peer");
                        break Ended::Dropped;
                    }
                    Ok(n) => {
                        buffer.extend_from_slice(&read_buf[..n]);
                        match drain_messages(&mut buffer, &mut offset, &mut session, &mut write_half, events, &mut last_outbound).await {
                            Ok(()) => {}
                            Err(DrainOutcome::VersionRejected) => break Ended::VersionRejected,
                            Err(DrainOutcome::Fatal) => break Ended::Dropped,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "read error, closing connection");
                        break Ended::Dropped;
                    }
                }
            }
            _ = keep_alive.tick() => {
                if session.state == SessionState::Ready
                    && last_outbound.elapsed() >= config.keep_alive_interval
                {
                    trace!("sending keep-alive");
                    if send_message(&mut write_half, &Message::KeepAlive).await.is_err() {
                        break Ended::Dropped;
                    }
                    last_outbound = Instant::now();
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    None => break Ended::ClosedByUser,
                    Some(Command::Close) => break Ended::ClosedByUser,
                    Some(other) => {
                        if handle_command(other, &mut session, &mut write_half, command_tx, config, &mut last_outbound).await {
                            break Ended::Dropped;
                        }
                    }
                }
            }
        }
    };

    let closed_by_user = matches!(ended, Ended::ClosedByUser);
    let actions = if closed_by_user {
        session.on_close_requested()
    } else {
        Vec::new()
    };
    // on_transport_down always runs: it cancels pending RPCs and emits the
    // Disconnected transition regardless of why the loop ended.
    let mut final_actions = actions;
    final_actions.extend(session.on_transport_down());
    let _ = dispatch_actions(final_actions, &mut write_half, events, &mut last_outbound).await;

    ended
}

enum DrainOutcome {
    VersionRejected,
    Fatal,
}

/// Repeatedly parses and dispatches messages out of `buffer` starting at
/// `offset` until the parser reports `NeedMore`, then compacts the buffer.
async fn drain_messages(
    buffer: &mut Vec<u8>,
    offset: &mut usize,
    session: &mut Session,
    write_half: &mut OwnedWriteHalf,
    events: &mpsc::Sender<ClientEvent>,
    last_outbound: &mut Instant,
) -> Result<(), DrainOutcome> {
    loop {
        match Message::try_parse(buffer, *offset, &session.table) {
            ParseOutcome::Parsed { message, new_offset } => {
                *offset = new_offset;
                trace!(?message, "decoded inbound message");
                let version_rejected = matches!(
                    message,
                    Message::ProtoVersionUnsupported { .. }
                );
                let actions = session.on_message(message);
                let fatal = dispatch_actions(actions, write_half, events, last_outbound).await;
                if fatal.is_some() {
                    buffer.drain(0..*offset);
                    *offset = 0;
                    return Err(if version_rejected {
                        DrainOutcome::VersionRejected
                    } else {
                        DrainOutcome::Fatal
                    });
                }
            }
            ParseOutcome::NeedMore => break,
            ParseOutcome::Invalid(e) => {
                error!(error = %e, "fatal decode error, closing connection");
                buffer.drain(0..*offset);
                *offset = 0;
                return Err(DrainOutcome::Fatal);
            }
        }
    }
    buffer.drain(0..*offset);
    *offset = 0;
    Ok(())
}

/// Executes a batch of [`Action`]s: sends get written to the socket,
/// emitted events get forwarded to the embedder's channel. Returns
/// `Some(err)` if a fatal failure (a session-level `Fail` action, or a
/// write error) occurred, meaning the caller should tear the connection
/// down.
async fn dispatch_actions(
    actions: Vec<Action>,
    write_half: &mut OwnedWriteHalf,
    events: &mpsc::Sender<ClientEvent>,
    last_outbound: &mut Instant,
) -> Option<ClientError> {
    for action in actions {
        match action {
            Action::Send(msg) => {
                if let Err(e) = send_message(write_half, &msg).await {
                    error!(error = %e, "write failed, closing connection");
                    return Some(e);
                }
                *last_outbound = Instant::now();
            }
            Action::Emit(event) => {
                if events.send(event).await.is_err() {
                    debug!("embedder dropped the event receiver");
                }
            }
            Action::Fail(err) => {
                error!(error = %err, "session-level failure");
                return Some(err);
            }
        }
    }
    None
}

async fn send_message(write_half: &mut OwnedWriteHalf, msg: &Message) -> Result<(), ClientError> {
    let mut bytes = Vec::new();
    msg.encode(&mut bytes)?;
    write_half.write_all(&bytes).await?;
    Ok(())
}

/// Handles one embedder-originated [`Command`]. Returns `true` if the
/// connection should be torn down (a write failed).
async fn handle_command(
    cmd: Command,
    session: &mut Session,
    write_half: &mut OwnedWriteHalf,
    command_tx: &mpsc::Sender<Command>,
    config: &ClientConfig,
    last_outbound: &mut Instant,
) -> bool {
    match cmd {
        Command::Propose {
            name,
            entry_type,
            value,
            flags,
            respond,
        } => {
            if value.entry_type() != entry_type {
                let _ = respond.send(Err(ClientError::TypeMismatch));
                return false;
            }
            let msg = session.propose_entry(&name, entry_type, value, flags);
            let result = send_message(write_half, &msg).await;
            if result.is_ok() {
                *last_outbound = Instant::now();
            }
            let fatal = result.is_err();
            let _ = respond.send(result);
            fatal
        }
        Command::CallRpc {
            def_id,
            params,
            respond,
        } => handle_call_rpc(def_id, params, respond, session, write_half, command_tx, config, last_outbound).await,
        Command::Snapshot { respond } => {
            let _ = respond.send(session.table.entries());
            false
        }
        Command::ExpireRpc { def_id, unique_id } => {
            session.rpc.expire(def_id, unique_id);
            false
        }
        Command::Close => unreachable!("Close is handled by the caller before dispatch"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_call_rpc(
    def_id: u16,
    params: Vec<EntryValue>,
    respond: oneshot::Sender<Result<Vec<EntryValue>, ClientError>>,
    session: &mut Session,
    write_half: &mut OwnedWriteHalf,
    command_tx: &mpsc::Sender<Command>,
    config: &ClientConfig,
    last_outbound: &mut Instant,
) -> bool {
    let def = match lookup_rpc_definition(&session.table, def_id) {
        Ok(def) => def,
        Err(e) => {
            let _ = respond.send(Err(e.into()));
            return false;
        }
    };
    if params.len() != def.params.len() {
        let _ = respond.send(Err(ClientError::Decode(DecodeError::RpcArityMismatch {
            expected: def.params.len(),
            got: params.len(),
        })));
        return false;
    }
    for (param, spec) in params.iter().zip(&def.params) {
        if param.entry_type() != spec.entry_type || !value_fits_wire(param) {
            let _ = respond.send(Err(ClientError::TypeMismatch));
            return false;
        }
    }

    let (unique_id, rx) = session.rpc.register_call(def_id);

    // Bridge the registry's internal oneshot (keyed by (def_id, unique_id))
    // to the caller's oneshot, translating RpcFailure into ClientError.
    tokio::spawn(async move {
        let outcome = rx.await.unwrap_or(Err(RpcFailure::Cancelled));
        let mapped = match outcome {
            Ok(results) => Ok(results),
            Err(RpcFailure::Cancelled) => Err(ClientError::Cancelled),
            Err(RpcFailure::TimedOut) => Err(ClientError::TimedOut),
        };
        let _ = respond.send(mapped);
    });

    let timeout_tx = command_tx.clone();
    let rpc_timeout = config.rpc_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(rpc_timeout).await;
        let _ = timeout_tx.send(Command::ExpireRpc { def_id, unique_id }).await;
    });

    let msg = Message::RpcExecute {
        def_id,
        unique_id,
        params,
    };
    let result = send_message(write_half, &msg).await;
    if result.is_ok() {
        *last_outbound = Instant::now();
    }
    // On write failure, leave the slot pending; on_transport_down's
    // cancel_all will complete it with Cancelled once this connection tears
    // down, which the bridge task above delivers to `respond`.
    result.is_err()
}

fn value_fits_wire(value: &EntryValue) -> bool {
    match value {
        EntryValue::BooleanArray(v) => v.len() <= MAX_ARRAY_LEN,
        EntryValue::DoubleArray(v) => v.len() <= MAX_ARRAY_LEN,
        EntryValue::StringArray(v) => v.len() <= MAX_ARRAY_LEN,
        _ => true,
    }
}
