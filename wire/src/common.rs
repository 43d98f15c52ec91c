//! Shared wire-level data model: capability/compilation/dump bitflags, state
//! descriptors, and the small enums used in request headers. Adapted from
//! the teacher's `gel-protocol::common` module, trimmed to the fields this
//! engine actually threads through (the full scalar type-descriptor codec
//! stays out of scope — type descriptors are opaque blobs here).

use bytes::Bytes;
use uuid::Uuid;

use crate::error::DecodeError;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        const MODIFICATIONS =     0b0000_0001;
        const SESSION_CONFIG =    0b0000_0010;
        const TRANSACTION =       0b0000_0100;
        const DDL =               0b0000_1000;
        const PERSISTENT_CONFIG = 0b0001_0000;
        const ALL =               0b0001_1111;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CompilationFlags: u64 {
        const INJECT_OUTPUT_TYPE_IDS =   0b0000_0001;
        const INJECT_OUTPUT_TYPE_NAMES = 0b0000_0010;
        const INJECT_OUTPUT_OBJECT_IDS = 0b0000_0100;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DumpFlags: u64 {
        const DUMP_SECRETS = 0b0000_0001;
    }
}

/// Input source language, from the Parse/Execute request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLanguage {
    EdgeQl,
    Sql,
}

impl InputLanguage {
    pub fn from_wire(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0x45 => Ok(InputLanguage::EdgeQl),
            0x53 => Ok(InputLanguage::Sql),
            _ => Err(DecodeError::InvalidInputLanguage(tag)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            InputLanguage::EdgeQl => 0x45,
            InputLanguage::Sql => 0x53,
        }
    }
}

/// Output encoding requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFormat {
    Binary,
    Json,
    JsonElements,
    None,
}

impl IoFormat {
    pub fn from_wire(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            b'b' => Ok(IoFormat::Binary),
            b'j' => Ok(IoFormat::Json),
            b'J' => Ok(IoFormat::JsonElements),
            b'n' => Ok(IoFormat::None),
            _ => Err(DecodeError::InvalidIoFormat(tag)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            IoFormat::Binary => b'b',
            IoFormat::Json => b'j',
            IoFormat::JsonElements => b'J',
            IoFormat::None => b'n',
        }
    }
}

/// Declared result-shape expectation. `NoResult` may never be requested by a
/// client (spec section 4.4): it only appears as a compiled-plan property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    NoResult,
    AtMostOne,
    Many,
}

impl Cardinality {
    pub fn from_wire(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0x6e => Ok(Cardinality::NoResult),
            0x6f => Ok(Cardinality::AtMostOne),
            0x6d => Ok(Cardinality::Many),
            _ => Err(DecodeError::InvalidCardinality(tag)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Cardinality::NoResult => 0x6e,
            Cardinality::AtMostOne => 0x6f,
            Cardinality::Many => 0x6d,
        }
    }
}

/// Inputs to compilation that aren't part of the cache key text itself.
#[derive(Debug, Clone)]
pub struct CompilationOptions {
    pub implicit_limit: i64,
    pub implicit_typenames: bool,
    pub implicit_typeids: bool,
    pub explicit_objectids: bool,
    pub allow_capabilities: Capabilities,
    pub io_format: IoFormat,
    pub expected_cardinality: Cardinality,
    pub input_language: InputLanguage,
}

impl CompilationOptions {
    pub fn flags(&self) -> CompilationFlags {
        let mut flags = CompilationFlags::empty();
        if self.implicit_typenames {
            flags |= CompilationFlags::INJECT_OUTPUT_TYPE_NAMES;
        }
        if self.implicit_typeids {
            flags |= CompilationFlags::INJECT_OUTPUT_TYPE_IDS;
        }
        if self.explicit_objectids {
            flags |= CompilationFlags::INJECT_OUTPUT_OBJECT_IDS;
        }
        flags
    }
}

/// Session state descriptor: a type id plus opaque encoded bytes, exchanged
/// so clients can resume session config/aliases/globals across reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub typedesc_id: Uuid,
    pub data: Bytes,
}

impl State {
    pub fn empty() -> State {
        State {
            typedesc_id: Uuid::nil(),
            data: Bytes::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.typedesc_id.is_nil()
    }
}

/// A raw, opaque type descriptor as sent on the wire: an id plus the encoded
/// descriptor bytes. Decoding descriptor internals is out of scope (schema
/// introspection is an external collaborator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTypedesc {
    pub id: Uuid,
    pub data: Bytes,
}

impl RawTypedesc {
    pub fn uninitialized() -> RawTypedesc {
        RawTypedesc {
            id: Uuid::nil(),
            data: Bytes::new(),
        }
    }
}

/// The sentinel type id meaning "no arguments" / "no result" (all-zero
/// uuid), referenced throughout spec section 4.5 and the boundary behaviors
/// of section 8.
pub const NULL_TYPE_ID: Uuid = Uuid::nil();

/// Keys used in DumpHeader/DumpBlock key-value sections (spec section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpHeaderKey {
    BlockType,
    ServerTime,
    ServerVersion,
    BlocksInfo,
    ServerCatalogVersion,
}

impl DumpHeaderKey {
    pub fn code(self) -> u16 {
        match self {
            DumpHeaderKey::BlockType => 101,
            DumpHeaderKey::ServerTime => 102,
            DumpHeaderKey::ServerVersion => 103,
            DumpHeaderKey::BlocksInfo => 104,
            DumpHeaderKey::ServerCatalogVersion => 105,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpBlockKey {
    BlockId,
    BlockNum,
    BlockData,
    BlockTypeData,
}

impl DumpBlockKey {
    pub fn code(self) -> u16 {
        match self {
            DumpBlockKey::BlockId => 110,
            DumpBlockKey::BlockNum => 111,
            DumpBlockKey::BlockData => 112,
            DumpBlockKey::BlockTypeData => u16::from(b'D'),
        }
    }
}

/// The `I` marker for block-type-info-value, distinct from the `D`
/// (block-type-data) marker used on dump blocks.
pub const BLOCK_TYPE_INFO_VALUE: u8 = b'I';
