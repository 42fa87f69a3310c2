use thiserror::Error;

/// Failures that can occur while decoding bytes off the wire.
///
/// `Truncated` is the only recoverable variant: the caller holds a rolling
/// buffer and should wait for more bytes rather than tear the connection
/// down. Every other variant is fatal to the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("buffer ended before a complete value could be read")]
    Truncated,

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("unrecognized entry type byte {0:#04x}")]
    InvalidType(u8),

    #[error("bad CLEAR_ALL_ENTRIES magic {0:#010x}")]
    InvalidMagic(u32),

    #[error("value payload does not match declared entry type")]
    TypeMismatch,

    #[error("unsupported RPC definition version {0:#04x}")]
    UnsupportedRpcVersion(u8),

    #[error("RPC_EXECUTE/RPC_RESPONSE referenced unknown definition id {0:#06x}")]
    UnknownRpcDefinition(u16),

    #[error("RPC argument count {got} does not match definition arity {expected}")]
    RpcArityMismatch { expected: usize, got: usize },

    #[error("unrecognized message type byte {0:#04x}")]
    InvalidMessageType(u8),
}

/// Top-level error surfaced to embedders of the client.
///
/// Decode errors (other than `Truncated`, which never escapes the framing
/// loop) are folded in via `From<DecodeError>`. Encoder-side errors,
/// transport errors, and session/RPC-lifecycle errors round out the rest.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encoder called with a value that does not match its declared type")]
    TypeMismatch,

    #[error("server rejected our protocol version: server speaks {server_major}.{server_minor}")]
    UnsupportedProtocolVersion { server_major: u8, server_minor: u8 },

    #[error("transport closed")]
    TransportClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("RPC call was cancelled")]
    Cancelled,

    #[error("RPC call timed out")]
    TimedOut,

    #[error("outbound queue is full")]
    Backpressure,
}
