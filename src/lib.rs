#![cfg_attr(feature = "strict", deny(warnings))]

//! Client for a flat-namespace publish/subscribe telemetry protocol (see
//! `SPEC_FULL.md`): a persistent TCP connection to a single server sharing
//! a table of named, typed entries, plus server-defined remote procedures.
//!
//! The codec and state machine (`wire`, `value`, `entry`, `message`,
//! `session`, `rpc_registry`) have no I/O dependency and can be exercised
//! entirely with in-memory byte buffers. [`connection`] and [`client`] wrap
//! them in a `tokio` TCP event loop behind the public [`Client`] facade.

mod client;
mod config;
mod connection;
mod entry;
mod error;
mod message;
mod rpc_registry;
mod session;
mod value;
mod wire;

pub use client::Client;
pub use config::{BackoffConfig, ClientConfig, DEFAULT_PORT};
pub use entry::{Entry, EntryFlags, UNASSIGNED_ID};
pub use error::{ClientError, DecodeError};
pub use message::{CLEAR_ALL_ENTRIES_MAGIC, PROTOCOL_MAJOR, PROTOCOL_MINOR};
pub use session::{ClientEvent, SessionState};
pub use value::{
    EntryType, EntryValue, ParamSpec, ResultSpec, RpcDefinition, MAX_ARRAY_LEN,
    RPC_DEFINITION_VERSION,
};
