//! Entry-value codec (entry types, their payloads, and the recursive RPC
//! definition type embedded in the RPC value variant).

use crate::error::DecodeError;
use crate::wire::{
    decode_f64_be, decode_string, decode_u8, decode_varint, encode_f64_be, encode_string,
    encode_varint,
};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;

/// RPC definitions are versioned independently of the protocol handshake;
/// today only one version is defined.
pub const RPC_DEFINITION_VERSION: u8 = 0x01;

/// Maximum element count for the three array value kinds: the wire format
/// prefixes them with a single count byte.
pub const MAX_ARRAY_LEN: usize = 255;

/// The tag byte identifying an entry's semantic type. Carried both in
/// ENTRY_ASSIGNMENT/ENTRY_UPDATE message bodies and as the outer type of an
/// `EntryValue`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum EntryType {
    Boolean = 0x00,
    Double = 0x01,
    String = 0x02,
    Raw = 0x03,
    BooleanArray = 0x10,
    DoubleArray = 0x11,
    StringArray = 0x12,
    Rpc = 0x20,
}

impl EntryType {
    pub fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        Self::from_u8(tag).ok_or(DecodeError::InvalidType(tag))
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A parameter or result specification inside a [`RpcDefinition`].
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub entry_type: EntryType,
    pub name: String,
    pub default: EntryValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultSpec {
    pub entry_type: EntryType,
    pub name: String,
}

/// A remote-procedure signature, stored as the payload of a RPC-typed
/// entry. Single-level recursive: parameter defaults are entry values, but
/// none of those defaults may themselves be RPC-typed (the wire format has
/// no way to express that and this implementation never produces it).
#[derive(Clone, Debug, PartialEq)]
pub struct RpcDefinition {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub results: Vec<ResultSpec>,
}

impl RpcDefinition {
    /// Serializes the definition body (version, name, params, results) with
    /// no outer length prefix; the caller (the RPC `EntryValue` arm) adds
    /// that.
    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), DecodeError> {
        out.push(RPC_DEFINITION_VERSION);
        encode_string(&self.name, out);
        if self.params.len() > u8::MAX as usize {
            return Err(DecodeError::Malformed("too many RPC parameters".into()));
        }
        out.push(self.params.len() as u8);
        for p in &self.params {
            out.push(p.entry_type.tag());
            encode_string(&p.name, out);
            encode_value_payload(&p.default, p.entry_type, out)?;
        }
        if self.results.len() > u8::MAX as usize {
            return Err(DecodeError::Malformed("too many RPC results".into()));
        }
        out.push(self.results.len() as u8);
        for r in &self.results {
            out.push(r.entry_type.tag());
            encode_string(&r.name, out);
        }
        Ok(())
    }

    fn decode_body(bytes: &[u8], offset: usize) -> Result<(Self, usize), DecodeError> {
        let (version, mut pos) = decode_u8(bytes, offset)?;
        if version != RPC_DEFINITION_VERSION {
            return Err(DecodeError::UnsupportedRpcVersion(version));
        }
        let (name, p) = decode_string(bytes, pos)?;
        pos = p;
        let (param_count, p) = decode_u8(bytes, pos)?;
        pos = p;
        let mut params = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            let (type_tag, p) = decode_u8(bytes, pos)?;
            pos = p;
            let entry_type = EntryType::from_tag(type_tag)?;
            let (pname, p) = decode_string(bytes, pos)?;
            pos = p;
            let (default, p) = decode_value_payload(bytes, pos, entry_type)?;
            pos = p;
            params.push(ParamSpec {
                entry_type,
                name: pname,
                default,
            });
        }
        let (result_count, p) = decode_u8(bytes, pos)?;
        pos = p;
        let mut results = Vec::with_capacity(result_count as usize);
        for _ in 0..result_count {
            let (type_tag, p) = decode_u8(bytes, pos)?;
            pos = p;
            let entry_type = EntryType::from_tag(type_tag)?;
            let (rname, p) = decode_string(bytes, pos)?;
            pos = p;
            results.push(ResultSpec {
                entry_type,
                name: rname,
            });
        }
        Ok((
            RpcDefinition {
                name,
                params,
                results,
            },
            pos,
        ))
    }
}

/// A typed entry value. The `Rpc` arm owns its definition by `Box` since the
/// grammar is recursive only through that one arm.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryValue {
    Boolean(bool),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Rpc(Box<RpcDefinition>),
}

impl EntryValue {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryValue::Boolean(_) => EntryType::Boolean,
            EntryValue::Double(_) => EntryType::Double,
            EntryValue::String(_) => EntryType::String,
            EntryValue::Raw(_) => EntryType::Raw,
            EntryValue::BooleanArray(_) => EntryType::BooleanArray,
            EntryValue::DoubleArray(_) => EntryType::DoubleArray,
            EntryValue::StringArray(_) => EntryType::StringArray,
            EntryValue::Rpc(_) => EntryType::Rpc,
        }
    }

    /// Encodes `self` as the payload for `declared_type`, failing with
    /// `TypeMismatch` if `self`'s variant disagrees.
    pub fn encode(&self, declared_type: EntryType, out: &mut Vec<u8>) -> Result<(), DecodeError> {
        encode_value_payload(self, declared_type, out)
    }

    pub fn decode(
        bytes: &[u8],
        offset: usize,
        declared_type: EntryType,
    ) -> Result<(Self, usize), DecodeError> {
        decode_value_payload(bytes, offset, declared_type)
    }
}

fn encode_value_payload(
    value: &EntryValue,
    declared_type: EntryType,
    out: &mut Vec<u8>,
) -> Result<(), DecodeError> {
    if value.entry_type() != declared_type {
        return Err(DecodeError::TypeMismatch);
    }
    match value {
        EntryValue::Boolean(b) => out.push(if *b { 0x01 } else { 0x00 }),
        EntryValue::Double(d) => encode_f64_be(*d, out),
        EntryValue::String(s) => encode_string(s, out),
        EntryValue::Raw(bytes) => {
            encode_varint(bytes.len() as u64, out);
            out.extend_from_slice(bytes);
        }
        EntryValue::BooleanArray(vals) => {
            if vals.len() > MAX_ARRAY_LEN {
                return Err(DecodeError::Malformed("boolean array too long".into()));
            }
            out.push(vals.len() as u8);
            for b in vals {
                out.push(if *b { 0x01 } else { 0x00 });
            }
        }
        EntryValue::DoubleArray(vals) => {
            if vals.len() > MAX_ARRAY_LEN {
                return Err(DecodeError::Malformed("double array too long".into()));
            }
            out.push(vals.len() as u8);
            for d in vals {
                encode_f64_be(*d, out);
            }
        }
        EntryValue::StringArray(vals) => {
            if vals.len() > MAX_ARRAY_LEN {
                return Err(DecodeError::Malformed("string array too long".into()));
            }
            out.push(vals.len() as u8);
            for s in vals {
                encode_string(s, out);
            }
        }
        EntryValue::Rpc(def) => {
            let mut body = Vec::new();
            def.encode_body(&mut body)?;
            encode_varint(body.len() as u64, out);
            out.extend_from_slice(&body);
        }
    }
    Ok(())
}

fn decode_value_payload(
    bytes: &[u8],
    offset: usize,
    declared_type: EntryType,
) -> Result<(EntryValue, usize), DecodeError> {
    match declared_type {
        EntryType::Boolean => {
            let (b, pos) = decode_u8(bytes, offset)?;
            Ok((EntryValue::Boolean(b != 0), pos))
        }
        EntryType::Double => {
            let (d, pos) = decode_f64_be(bytes, offset)?;
            Ok((EntryValue::Double(d), pos))
        }
        EntryType::String => {
            let (s, pos) = decode_string(bytes, offset)?;
            Ok((EntryValue::String(s), pos))
        }
        EntryType::Raw => {
            let (len, pos) = decode_varint(bytes, offset)?;
            let len = len as usize;
            let end = pos.checked_add(len).ok_or(DecodeError::Truncated)?;
            let slice = bytes.get(pos..end).ok_or(DecodeError::Truncated)?;
            Ok((EntryValue::Raw(slice.to_vec()), end))
        }
        EntryType::BooleanArray => {
            let (count, mut pos) = decode_u8(bytes, offset)?;
            let mut vals = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (b, p) = decode_u8(bytes, pos)?;
                pos = p;
                vals.push(b != 0);
            }
            Ok((EntryValue::BooleanArray(vals), pos))
        }
        EntryType::DoubleArray => {
            let (count, mut pos) = decode_u8(bytes, offset)?;
            let mut vals = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (d, p) = decode_f64_be(bytes, pos)?;
                pos = p;
                vals.push(d);
            }
            Ok((EntryValue::DoubleArray(vals), pos))
        }
        EntryType::StringArray => {
            let (count, mut pos) = decode_u8(bytes, offset)?;
            let mut vals = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (s, p) = decode_string(bytes, pos)?;
                pos = p;
                vals.push(s);
            }
            Ok((EntryValue::StringArray(vals), pos))
        }
        EntryType::Rpc => {
            let (len, pos) = decode_varint(bytes, offset)?;
            let len = len as usize;
            let end = pos.checked_add(len).ok_or(DecodeError::Truncated)?;
            let body = bytes.get(pos..end).ok_or(DecodeError::Truncated)?;
            let (def, body_pos) = RpcDefinition::decode_body(body, 0)?;
            if body_pos != body.len() {
                return Err(DecodeError::Malformed(
                    "RPC definition had trailing bytes inside its length prefix".into(),
                ));
            }
            Ok((EntryValue::Rpc(Box::new(def)), end))
        }
    }
}

/// Decodes a result value for `entry_type` out of a RPC_RESPONSE body. Per
/// the spec, result specs never carry a default and the decoded result
/// payload here uses the same per-type encoding as any other value; this
/// wrapper exists purely so call sites that work with result specs (which
/// have no default `EntryValue`) don't accidentally reach for the
/// definition codec's `decode_value_payload` meant for the *definition's*
/// stored defaults.
pub fn decode_rpc_argument(
    bytes: &[u8],
    offset: usize,
    entry_type: EntryType,
) -> Result<(EntryValue, usize), DecodeError> {
    decode_value_payload(bytes, offset, entry_type)
}

pub fn encode_rpc_argument(
    value: &EntryValue,
    entry_type: EntryType,
    out: &mut Vec<u8>,
) -> Result<(), DecodeError> {
    encode_value_payload(value, entry_type, out)
}
