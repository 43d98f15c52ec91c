//! Client -> server message types and their wire tags (spec section 6).
//! Shaped after `gel-protocol::client_message`, re-expressed with the
//! hand-rolled [`crate::codec`] primitives instead of a generated zero-copy
//! builder layer.

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{Reader, WriterExt};
use crate::common::{Cardinality, CompilationFlags, Capabilities, InputLanguage, IoFormat};
use crate::error::DecodeError;

pub mod tag {
    pub const CLIENT_HANDSHAKE: u8 = 0x56; // 'V'
    pub const PARSE: u8 = 0x50; // 'P'
    pub const EXECUTE: u8 = 0x4f; // 'O'
    pub const SYNC: u8 = 0x53; // 'S'
    pub const TERMINATE: u8 = 0x58; // 'X'
    pub const FLUSH: u8 = 0x48; // 'H'
    pub const DUMP: u8 = 0x3e; // '>'
    pub const RESTORE: u8 = 0x3c; // '<'
    pub const RESTORE_BLOCK: u8 = 0x3d; // '='
    pub const RESTORE_EOF: u8 = 0x2e; // '.'
    pub const SASL_INITIAL_RESPONSE: u8 = 0x70; // 'p'
    pub const SASL_RESPONSE: u8 = 0x72; // 'r'
}

#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub major_ver: u16,
    pub minor_ver: u16,
    pub params: Vec<(String, String)>,
}

impl ClientHandshake {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let major_ver = r.u16()?;
        let minor_ver = r.u16()?;
        let nparams = r.u16()?;
        let mut params = Vec::with_capacity(nparams as usize);
        for _ in 0..nparams {
            let name = r.str16()?;
            let value = r.str16()?;
            params.push((name, value));
        }
        let reserved = r.u16()?;
        if reserved != 0 {
            return Err(DecodeError::NonZeroReserved);
        }
        r.finish()?;
        Ok(ClientHandshake {
            major_ver,
            minor_ver,
            params,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SaslInitialResponse {
    pub method: String,
    pub sasl_data: Bytes,
}

impl SaslInitialResponse {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let method = r.str32()?;
        let sasl_data = r.bytes32()?;
        r.finish()?;
        Ok(SaslInitialResponse { method, sasl_data })
    }
}

#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub sasl_data: Bytes,
}

impl SaslResponse {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let sasl_data = r.bytes32()?;
        r.finish()?;
        Ok(SaslResponse { sasl_data })
    }
}

/// The request header shared by Parse and Execute (spec section 4.4).
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub allow_capabilities: Capabilities,
    pub compilation_flags: CompilationFlags,
    pub implicit_limit: i64,
    pub input_language: InputLanguage,
    pub output_format: IoFormat,
    pub expected_cardinality: Cardinality,
    pub command_text: String,
    pub state_typedesc_id: Uuid,
    pub state_data: Bytes,
}

impl RequestHeader {
    fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let annotation_count = r.u16()?;
        for _ in 0..annotation_count {
            let _name = r.str32()?;
            let _value = r.str32()?;
        }
        let allow_capabilities = Capabilities::from_bits_truncate(r.u64()?);
        let compilation_flags = CompilationFlags::from_bits_truncate(r.u64()?);
        let implicit_limit = r.i64()?;
        let input_language = InputLanguage::from_wire(r.u8()?)?;
        let output_format = IoFormat::from_wire(r.u8()?)?;
        let expected_cardinality = Cardinality::from_wire(r.u8()?)?;
        let command_text = r.str32()?;
        let state_typedesc_id = r.uuid()?;
        let state_data = r.bytes32()?;
        Ok(RequestHeader {
            allow_capabilities,
            compilation_flags,
            implicit_limit,
            input_language,
            output_format,
            expected_cardinality,
            command_text,
            state_typedesc_id,
            state_data,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Parse {
    pub header: RequestHeader,
}

impl Parse {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let header = RequestHeader::decode(&mut r)?;
        r.finish()?;
        Ok(Parse { header })
    }
}

#[derive(Debug, Clone)]
pub struct Execute {
    pub header: RequestHeader,
    pub input_typedesc_id: Uuid,
    pub output_typedesc_id: Uuid,
    pub arguments: Bytes,
}

impl Execute {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let header = RequestHeader::decode(&mut r)?;
        let input_typedesc_id = r.uuid()?;
        let output_typedesc_id = r.uuid()?;
        let arguments = r.bytes(r.remaining())?;
        r.finish()?;
        Ok(Execute {
            header,
            input_typedesc_id,
            output_typedesc_id,
            arguments,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sync;

impl Sync {
    pub fn decode(r: Reader) -> Result<Self, DecodeError> {
        r.finish()?;
        Ok(Sync)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Terminate;

impl Terminate {
    pub fn decode(r: Reader) -> Result<Self, DecodeError> {
        r.finish()?;
        Ok(Terminate)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Flush;

impl Flush {
    pub fn decode(r: Reader) -> Result<Self, DecodeError> {
        r.finish()?;
        Ok(Flush)
    }
}

#[derive(Debug, Clone)]
pub struct Dump {
    pub include_secrets: bool,
}

impl Dump {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let flags = r.u64()?;
        r.finish()?;
        Ok(Dump {
            include_secrets: flags & 1 != 0,
        })
    }
}

/// The embedded dump header carried in the Restore request body (spec
/// section 4.7 step 1): protocol version plus the opaque dump payload that
/// follows it. The dump's own headers/schema/types/blocks sections are
/// parsed by [`crate::server_message::DumpHeader::decode`] reused here,
/// since the wire shape is identical.
#[derive(Debug, Clone)]
pub struct Restore {
    pub jobs: u16,
    pub header_data: Bytes,
}

impl Restore {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let jobs = r.u16()?;
        let header_data = r.bytes(r.remaining())?;
        r.finish()?;
        Ok(Restore { jobs, header_data })
    }
}

#[derive(Debug, Clone)]
pub struct RestoreBlock {
    pub block_id: Uuid,
    pub block_num: u32,
    pub block_data: Bytes,
}

impl RestoreBlock {
    pub fn decode(mut r: Reader) -> Result<Self, DecodeError> {
        let block_id = r.uuid()?;
        let block_num = r.u32()?;
        let block_data = r.bytes32()?;
        r.finish()?;
        Ok(RestoreBlock {
            block_id,
            block_num,
            block_data,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_uuid(self.block_id);
        buf.put_u32(self.block_num);
        buf.put_bytes32(&self.block_data);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreEof;

impl RestoreEof {
    pub fn decode(r: Reader) -> Result<Self, DecodeError> {
        r.finish()?;
        Ok(RestoreEof)
    }
}

/// Message types that remain legal post-handshake. Legacy `Describe` (`D`),
/// legacy `Execute` (`E`), and `ExecuteScript` (`Q`) are refused per spec
/// section 9: "the spec targets the current [protocol], legacy message
/// types are explicitly refused."
#[derive(Debug, Clone)]
pub enum ClientMessage {
    ClientHandshake(ClientHandshake),
    SaslInitialResponse(SaslInitialResponse),
    SaslResponse(SaslResponse),
    Parse(Parse),
    Execute(Execute),
    Sync(Sync),
    Terminate(Terminate),
    Flush(Flush),
    Dump(Dump),
    Restore(Restore),
    RestoreBlock(RestoreBlock),
    RestoreEof(RestoreEof),
}

impl ClientMessage {
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let r = Reader::new(payload);
        Ok(match tag {
            tag::CLIENT_HANDSHAKE => ClientMessage::ClientHandshake(ClientHandshake::decode(r)?),
            tag::SASL_INITIAL_RESPONSE => {
                ClientMessage::SaslInitialResponse(SaslInitialResponse::decode(r)?)
            }
            tag::SASL_RESPONSE => ClientMessage::SaslResponse(SaslResponse::decode(r)?),
            tag::PARSE => ClientMessage::Parse(Parse::decode(r)?),
            tag::EXECUTE => ClientMessage::Execute(Execute::decode(r)?),
            tag::SYNC => ClientMessage::Sync(Sync::decode(r)?),
            tag::TERMINATE => ClientMessage::Terminate(Terminate::decode(r)?),
            tag::FLUSH => ClientMessage::Flush(Flush::decode(r)?),
            tag::DUMP => ClientMessage::Dump(Dump::decode(r)?),
            tag::RESTORE => ClientMessage::Restore(Restore::decode(r)?),
            tag::RESTORE_BLOCK => ClientMessage::RestoreBlock(RestoreBlock::decode(r)?),
            tag::RESTORE_EOF => ClientMessage::RestoreEof(RestoreEof::decode(r)?),
            _ => {
                return Err(DecodeError::UnknownMessageType {
                    tag,
                    context: "client message",
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn decodes_client_handshake() {
        let mut buf = BytesMut::new();
        buf.put_u16(3);
        buf.put_u16(0);
        buf.put_u16(1);
        buf.put_str16("user");
        buf.put_str16("alice");
        buf.put_u16(0);
        let msg = ClientHandshake::decode(Reader::new(&buf)).unwrap();
        assert_eq!(msg.major_ver, 3);
        assert_eq!(msg.params, vec![("user".into(), "alice".into())]);
    }

    #[test]
    fn rejects_nonzero_reserved() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(1);
        assert!(matches!(
            ClientHandshake::decode(Reader::new(&buf)),
            Err(DecodeError::NonZeroReserved)
        ));
    }

    #[test]
    fn execute_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u16(0); // annotation count
        buf.put_u64(0);
        buf.put_u64(0);
        buf.put_i64(0);
        buf.put_u8(InputLanguage::EdgeQl.to_wire());
        buf.put_u8(IoFormat::Binary.to_wire());
        buf.put_u8(Cardinality::AtMostOne.to_wire());
        buf.put_str32("select 1");
        buf.put_uuid(Uuid::nil());
        buf.put_bytes32(&[]);
        buf.put_uuid(Uuid::nil());
        buf.put_uuid(Uuid::nil());
        let payload = buf.freeze();
        // Execute always consumes the remainder as `arguments`, so this is
        // really exercising that nothing is left for RequestHeader to choke
        // on; the "no trailing bytes" rule is enforced one level up, in the
        // recoder, which knows where the argument stream itself ends.
        assert!(Execute::decode(Reader::new(&payload)).is_ok());
    }
}
