//! Message codec: the eleven framed message types and the top-level
//! incremental parser.

use crate::entry::{EntryFlags, EntryTable, UNASSIGNED_ID};
use crate::error::DecodeError;
use crate::value::{decode_rpc_argument, encode_rpc_argument, EntryType, EntryValue};
use crate::wire::{
    decode_string, decode_u16_be, decode_u32_be, decode_u8, decode_varint, encode_string,
    encode_u16_be, encode_u32_be, encode_varint,
};

/// Guards CLEAR_ALL_ENTRIES against accidental emission.
pub const CLEAR_ALL_ENTRIES_MAGIC: u32 = 0xD06CB27A;

/// Major/minor protocol version this client speaks.
pub const PROTOCOL_MAJOR: u8 = 3;
pub const PROTOCOL_MINOR: u8 = 0;

mod type_byte {
    pub const KEEP_ALIVE: u8 = 0x00;
    pub const CLIENT_HELLO: u8 = 0x01;
    pub const PROTO_VERSION_UNSUPPORTED: u8 = 0x02;
    pub const SERVER_HELLO_COMPLETE: u8 = 0x03;
    pub const SERVER_HELLO: u8 = 0x04;
    pub const CLIENT_HELLO_COMPLETE: u8 = 0x05;
    pub const ENTRY_ASSIGNMENT: u8 = 0x10;
    pub const ENTRY_UPDATE: u8 = 0x11;
    pub const ENTRY_FLAGS_UPDATE: u8 = 0x12;
    pub const ENTRY_DELETE: u8 = 0x13;
    pub const CLEAR_ALL_ENTRIES: u8 = 0x14;
    pub const RPC_EXECUTE: u8 = 0x20;
    pub const RPC_RESPONSE: u8 = 0x21;
}

/// One wire message. Field order within each variant matches its on-wire
/// layout (§4.4 of the spec).
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    ClientHello {
        major: u8,
        minor: u8,
        client_identity: String,
    },
    ProtoVersionUnsupported {
        server_major: u8,
        server_minor: u8,
    },
    ServerHelloComplete,
    ServerHello {
        client_previously_seen: bool,
        server_identity: String,
    },
    ClientHelloComplete,
    EntryAssignment {
        name: String,
        entry_type: EntryType,
        id: u16,
        seq: u16,
        flags: EntryFlags,
        value: EntryValue,
    },
    EntryUpdate {
        id: u16,
        seq: u16,
        entry_type: EntryType,
        value: EntryValue,
    },
    EntryFlagsUpdate {
        id: u16,
        flags: EntryFlags,
    },
    EntryDelete {
        id: u16,
    },
    ClearAllEntries,
    RpcExecute {
        def_id: u16,
        unique_id: u16,
        params: Vec<EntryValue>,
    },
    RpcResponse {
        def_id: u16,
        unique_id: u16,
        results: Vec<EntryValue>,
    },
}

/// Result of attempting to parse one message at `offset`.
#[derive(Debug)]
pub enum ParseOutcome {
    Parsed { message: Message, new_offset: usize },
    NeedMore,
    Invalid(DecodeError),
}

impl Message {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), DecodeError> {
        match self {
            Message::KeepAlive => out.push(type_byte::KEEP_ALIVE),
            Message::ClientHello {
                major,
                minor,
                client_identity,
            } => {
                out.push(type_byte::CLIENT_HELLO);
                out.push(*major);
                out.push(*minor);
                encode_string(client_identity, out);
            }
            Message::ProtoVersionUnsupported {
                server_major,
                server_minor,
            } => {
                out.push(type_byte::PROTO_VERSION_UNSUPPORTED);
                out.push(*server_major);
                out.push(*server_minor);
            }
            Message::ServerHelloComplete => out.push(type_byte::SERVER_HELLO_COMPLETE),
            Message::ServerHello {
                client_previously_seen,
                server_identity,
            } => {
                out.push(type_byte::SERVER_HELLO);
                out.push(if *client_previously_seen { 0x01 } else { 0x00 });
                encode_string(server_identity, out);
            }
            Message::ClientHelloComplete => out.push(type_byte::CLIENT_HELLO_COMPLETE),
            Message::EntryAssignment {
                name,
                entry_type,
                id,
                seq,
                flags,
                value,
            } => {
                out.push(type_byte::ENTRY_ASSIGNMENT);
                encode_string(name, out);
                out.push(entry_type.tag());
                encode_u16_be(*id, out);
                encode_u16_be(*seq, out);
                out.push(flags.to_byte());
                value.encode(*entry_type, out)?;
            }
            Message::EntryUpdate {
                id,
                seq,
                entry_type,
                value,
            } => {
                out.push(type_byte::ENTRY_UPDATE);
                encode_u16_be(*id, out);
                encode_u16_be(*seq, out);
                out.push(entry_type.tag());
                value.encode(*entry_type, out)?;
            }
            Message::EntryFlagsUpdate { id, flags } => {
                out.push(type_byte::ENTRY_FLAGS_UPDATE);
                encode_u16_be(*id, out);
                out.push(flags.to_byte());
            }
            Message::EntryDelete { id } => {
                out.push(type_byte::ENTRY_DELETE);
                encode_u16_be(*id, out);
            }
            Message::ClearAllEntries => {
                out.push(type_byte::CLEAR_ALL_ENTRIES);
                encode_u32_be(CLEAR_ALL_ENTRIES_MAGIC, out);
            }
            Message::RpcExecute {
                def_id,
                unique_id,
                params,
            } => {
                out.push(type_byte::RPC_EXECUTE);
                encode_u16_be(*def_id, out);
                encode_u16_be(*unique_id, out);
                encode_varint(params.len() as u64, out);
                for (param, declared) in params.iter().zip(params.iter().map(|p| p.entry_type())) {
                    encode_rpc_argument(param, declared, out)?;
                }
            }
            Message::RpcResponse {
                def_id,
                unique_id,
                results,
            } => {
                out.push(type_byte::RPC_RESPONSE);
                encode_u16_be(*def_id, out);
                encode_u16_be(*unique_id, out);
                encode_varint(results.len() as u64, out);
                for (result, declared) in
                    results.iter().zip(results.iter().map(|r| r.entry_type()))
                {
                    encode_rpc_argument(result, declared, out)?;
                }
            }
        }
        Ok(())
    }

    /// Attempts to parse exactly one message starting at `offset`. The RPC
    /// variants require `table` to resolve parameter/result types from the
    /// referenced definition.
    pub fn try_parse(bytes: &[u8], offset: usize, table: &EntryTable) -> ParseOutcome {
        match decode_message(bytes, offset, table) {
            Ok((message, new_offset)) => ParseOutcome::Parsed { message, new_offset },
            Err(DecodeError::Truncated) => ParseOutcome::NeedMore,
            Err(e) => ParseOutcome::Invalid(e),
        }
    }
}

fn decode_message(
    bytes: &[u8],
    offset: usize,
    table: &EntryTable,
) -> Result<(Message, usize), DecodeError> {
    let (tag, mut pos) = decode_u8(bytes, offset)?;
    match tag {
        type_byte::KEEP_ALIVE => Ok((Message::KeepAlive, pos)),
        type_byte::CLIENT_HELLO => {
            let (major, p) = decode_u8(bytes, pos)?;
            pos = p;
            let (minor, p) = decode_u8(bytes, pos)?;
            pos = p;
            let (client_identity, p) = decode_string(bytes, pos)?;
            pos = p;
            Ok((
                Message::ClientHello {
                    major,
                    minor,
                    client_identity,
                },
                pos,
            ))
        }
        type_byte::PROTO_VERSION_UNSUPPORTED => {
            let (server_major, p) = decode_u8(bytes, pos)?;
            pos = p;
            let (server_minor, p) = decode_u8(bytes, pos)?;
            pos = p;
            Ok((
                Message::ProtoVersionUnsupported {
                    server_major,
                    server_minor,
                },
                pos,
            ))
        }
        type_byte::SERVER_HELLO_COMPLETE => Ok((Message::ServerHelloComplete, pos)),
        type_byte::SERVER_HELLO => {
            let (flags, p) = decode_u8(bytes, pos)?;
            pos = p;
            let (server_identity, p) = decode_string(bytes, pos)?;
            pos = p;
            Ok((
                Message::ServerHello {
                    client_previously_seen: flags & 0x01 != 0,
                    server_identity,
                },
                pos,
            ))
        }
        type_byte::CLIENT_HELLO_COMPLETE => Ok((Message::ClientHelloComplete, pos)),
        type_byte::ENTRY_ASSIGNMENT => {
            let (name, p) = decode_string(bytes, pos)?;
            pos = p;
            let (type_tag, p) = decode_u8(bytes, pos)?;
            pos = p;
            let entry_type = EntryType::from_tag(type_tag)?;
            let (id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let (seq, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let (flags_byte, p) = decode_u8(bytes, pos)?;
            pos = p;
            let (value, p) = EntryValue::decode(bytes, pos, entry_type)?;
            pos = p;
            Ok((
                Message::EntryAssignment {
                    name,
                    entry_type,
                    id,
                    seq,
                    flags: EntryFlags::from_byte(flags_byte),
                    value,
                },
                pos,
            ))
        }
        type_byte::ENTRY_UPDATE => {
            let (id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let (seq, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let (type_tag, p) = decode_u8(bytes, pos)?;
            pos = p;
            let entry_type = EntryType::from_tag(type_tag)?;
            let (value, p) = EntryValue::decode(bytes, pos, entry_type)?;
            pos = p;
            Ok((
                Message::EntryUpdate {
                    id,
                    seq,
                    entry_type,
                    value,
                },
                pos,
            ))
        }
        type_byte::ENTRY_FLAGS_UPDATE => {
            let (id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let (flags_byte, p) = decode_u8(bytes, pos)?;
            pos = p;
            Ok((
                Message::EntryFlagsUpdate {
                    id,
                    flags: EntryFlags::from_byte(flags_byte),
                },
                pos,
            ))
        }
        type_byte::ENTRY_DELETE => {
            let (id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            Ok((Message::EntryDelete { id }, pos))
        }
        type_byte::CLEAR_ALL_ENTRIES => {
            let (magic, p) = decode_u32_be(bytes, pos)?;
            pos = p;
            if magic != CLEAR_ALL_ENTRIES_MAGIC {
                return Err(DecodeError::InvalidMagic(magic));
            }
            Ok((Message::ClearAllEntries, pos))
        }
        type_byte::RPC_EXECUTE => {
            let (def_id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let (unique_id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let def = lookup_rpc_definition(table, def_id)?;
            let (count, p) = decode_varint(bytes, pos)?;
            pos = p;
            if count as usize != def.params.len() {
                return Err(DecodeError::RpcArityMismatch {
                    expected: def.params.len(),
                    got: count as usize,
                });
            }
            let mut params = Vec::with_capacity(def.params.len());
            for param_spec in &def.params {
                let (value, p) = decode_rpc_argument(bytes, pos, param_spec.entry_type)?;
                pos = p;
                params.push(value);
            }
            Ok((
                Message::RpcExecute {
                    def_id,
                    unique_id,
                    params,
                },
                pos,
            ))
        }
        type_byte::RPC_RESPONSE => {
            let (def_id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let (unique_id, p) = decode_u16_be(bytes, pos)?;
            pos = p;
            let def = lookup_rpc_definition(table, def_id)?;
            let (count, p) = decode_varint(bytes, pos)?;
            pos = p;
            if count as usize != def.results.len() {
                return Err(DecodeError::RpcArityMismatch {
                    expected: def.results.len(),
                    got: count as usize,
                });
            }
            let mut results = Vec::with_capacity(def.results.len());
            for result_spec in &def.results {
                let (value, p) = decode_rpc_argument(bytes, pos, result_spec.entry_type)?;
                pos = p;
                results.push(value);
            }
            Ok((
                Message::RpcResponse {
                    def_id,
                    unique_id,
                    results,
                },
                pos,
            ))
        }
        other => Err(DecodeError::InvalidMessageType(other)),
    }
}

pub(crate) fn lookup_rpc_definition(
    table: &EntryTable,
    def_id: u16,
) -> Result<crate::value::RpcDefinition, DecodeError> {
    let entry = table
        .get_by_id(def_id)
        .ok_or(DecodeError::UnknownRpcDefinition(def_id))?;
    match &entry.value {
        EntryValue::Rpc(def) => Ok((**def).clone()),
        _ => Err(DecodeError::UnknownRpcDefinition(def_id)),
    }
}

/// Builds the CLIENT_HELLO message this client sends on every handshake.
pub fn client_hello(identity: String) -> Message {
    Message::ClientHello {
        major: PROTOCOL_MAJOR,
        minor: PROTOCOL_MINOR,
        client_identity: identity,
    }
}

/// Looks up whether `id` equals the reserved sentinel; used by the session
/// state machine to reject a server-originated ENTRY_ASSIGNMENT carrying it
/// (spec §4.5, §9).
pub fn is_unassigned_id(id: u16) -> bool {
    id == UNASSIGNED_ID
}
