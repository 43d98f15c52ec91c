//! Server -> client message types and their wire tags (spec section 6).
//! Shaped after `gel-protocol::server_message`.

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{Reader, WriterExt};
use crate::common::{
    Capabilities, Cardinality, DumpBlockKey, DumpHeaderKey, BLOCK_TYPE_INFO_VALUE,
};
use crate::error::DecodeError;

pub mod tag {
    pub const SERVER_HANDSHAKE: u8 = 0x76; // 'v'
    pub const AUTHENTICATION: u8 = 0x52; // 'R'
    pub const KEY_DATA: u8 = 0x4b; // 'K'
    pub const STATE_DATA_DESCRIPTION: u8 = 0x73; // 's'
    pub const SERVER_STATUS: u8 = 0x53; // 'S'
    pub const READY_FOR_COMMAND: u8 = 0x5a; // 'Z'
    pub const COMMAND_DATA_DESCRIPTION: u8 = 0x54; // 'T'
    pub const COMMAND_COMPLETE: u8 = 0x43; // 'C'
    pub const ERROR_RESPONSE: u8 = 0x45; // 'E'
    pub const LOG_MESSAGE: u8 = 0x4c; // 'L'
    pub const DUMP_HEADER: u8 = 0x40; // '@'
    pub const DUMP_BLOCK: u8 = 0x3d; // '='
    pub const RESTORE_READY: u8 = 0x2b; // '+'
    pub const DATA: u8 = 0x44; // 'D'
}

fn encode_kv_list(buf: &mut BytesMut, entries: &[(u16, &[u8])]) {
    buf.put_u16(entries.len() as u16);
    for (code, value) in entries {
        buf.put_u16(*code);
        buf.put_bytes32(value);
    }
}

fn decode_kv_list(r: &mut Reader) -> Result<Vec<(u16, Bytes)>, DecodeError> {
    let n = r.u16()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let code = r.u16()?;
        let value = r.bytes32()?;
        out.push((code, value));
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct NegotiateProtocolVersion {
    pub major_ver: u16,
    pub minor_ver: u16,
}

impl NegotiateProtocolVersion {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.major_ver);
        buf.put_u16(self.minor_ver);
        buf.put_u16(0); // extensions count: none supported
    }
}

#[derive(Debug, Clone)]
pub enum Authentication {
    Ok,
    SaslInitial { methods: Vec<String> },
    SaslContinue { sasl_data: Bytes },
    SaslFinal { sasl_data: Bytes },
}

impl Authentication {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Authentication::Ok => buf.put_u32(0),
            Authentication::SaslInitial { methods } => {
                buf.put_u32(10);
                buf.put_u32(methods.len() as u32);
                for m in methods {
                    buf.put_str32(m);
                }
            }
            Authentication::SaslContinue { sasl_data } => {
                buf.put_u32(11);
                buf.put_bytes32(sasl_data);
            }
            Authentication::SaslFinal { sasl_data } => {
                buf.put_u32(12);
                buf.put_bytes32(sasl_data);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyData {
    pub data: [u8; 32],
}

impl KeyData {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct StateDataDescription {
    pub typedesc_id: Uuid,
    pub data: Bytes,
}

impl StateDataDescription {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_uuid(self.typedesc_id);
        buf.put_bytes32(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub value: Bytes,
}

impl ServerStatus {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_str32(&self.name);
        buf.put_bytes32(&self.value);
    }
}

/// `I` = idle, `T` = in-transaction, `E` = in-transaction-with-error (spec
/// section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    InTransaction,
    InTransactionError,
}

impl TransactionState {
    pub fn to_wire(self) -> u8 {
        match self {
            TransactionState::Idle => b'I',
            TransactionState::InTransaction => b'T',
            TransactionState::InTransactionError => b'E',
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadyForCommand {
    pub transaction_state: TransactionState,
}

impl ReadyForCommand {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotation count
        buf.put_u8(self.transaction_state.to_wire());
    }
}

#[derive(Debug, Clone)]
pub struct CommandDataDescription {
    pub capabilities: Capabilities,
    pub cardinality: Cardinality,
    pub input_typedesc_id: Uuid,
    pub input_typedesc: Bytes,
    pub output_typedesc_id: Uuid,
    pub output_typedesc: Bytes,
}

impl CommandDataDescription {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotation/warning count
        buf.put_u64(self.capabilities.bits());
        buf.put_u8(self.cardinality.to_wire());
        buf.put_uuid(self.input_typedesc_id);
        buf.put_bytes32(&self.input_typedesc);
        buf.put_uuid(self.output_typedesc_id);
        buf.put_bytes32(&self.output_typedesc);
    }
}

#[derive(Debug, Clone)]
pub struct CommandComplete {
    pub capabilities: Capabilities,
    pub status: String,
    pub state_typedesc_id: Uuid,
    pub state_data: Bytes,
}

impl CommandComplete {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotation count
        buf.put_u64(self.capabilities.bits());
        buf.put_str32(&self.status);
        buf.put_uuid(self.state_typedesc_id);
        buf.put_bytes32(&self.state_data);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error = 0x78,
    Fatal = 0xc8,
    Panic = 0xff,
}

#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub severity: ErrorSeverity,
    pub code: u32,
    pub message: String,
    pub fields: Vec<(u16, String)>,
}

impl ErrorResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.severity as u8);
        buf.put_u32(self.code);
        buf.put_str32(&self.message);
        buf.put_u16(self.fields.len() as u16);
        for (code, value) in &self.fields {
            buf.put_u16(*code);
            buf.put_str32(value);
        }
    }
}

/// Field code for the mandatory server traceback attribute (spec section
/// 6: "always includes a server traceback field").
pub const ERROR_FIELD_SERVER_TRACEBACK: u16 = 0x0101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Debug,
    Info,
    Notice,
    Warning,
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub severity: MessageSeverity,
    pub code: u32,
    pub text: String,
}

impl LogMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        let severity = match self.severity {
            MessageSeverity::Debug => 0x20,
            MessageSeverity::Info => 0x40,
            MessageSeverity::Notice => 0x50,
            MessageSeverity::Warning => 0x60,
        };
        buf.put_u8(severity);
        buf.put_u32(self.code);
        buf.put_str32(&self.text);
        buf.put_u16(0); // no attributes
    }
}

#[derive(Debug, Clone)]
pub struct DumpTypeInfo {
    pub type_name: String,
    pub descriptor: Bytes,
    pub type_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct DumpObjectDesc {
    pub object_id: Uuid,
    pub descriptor: Bytes,
    pub dependencies: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct DumpHeader {
    pub server_version: String,
    pub server_time: i64,
    pub catalog_version: u64,
    pub major_ver: u16,
    pub minor_ver: u16,
    pub schema_ddl: String,
    pub types: Vec<DumpTypeInfo>,
    pub descriptors: Vec<DumpObjectDesc>,
}

impl DumpHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        let version = self.server_version.as_bytes();
        let time = self.server_time.to_be_bytes();
        let catalog = self.catalog_version.to_be_bytes();
        encode_kv_list(
            buf,
            &[
                (DumpHeaderKey::BlockType.code(), &[BLOCK_TYPE_INFO_VALUE]),
                (DumpHeaderKey::ServerTime.code(), &time),
                (DumpHeaderKey::ServerVersion.code(), version),
                (DumpHeaderKey::ServerCatalogVersion.code(), &catalog),
            ],
        );
        buf.put_u16(self.major_ver);
        buf.put_u16(self.minor_ver);
        buf.put_str32(&self.schema_ddl);

        buf.put_u32(self.types.len() as u32);
        for t in &self.types {
            buf.put_str32(&t.type_name);
            buf.put_bytes32(&t.descriptor);
            buf.put_uuid(t.type_id);
        }

        buf.put_u32(self.descriptors.len() as u32);
        for d in &self.descriptors {
            buf.put_uuid(d.object_id);
            buf.put_bytes32(&d.descriptor);
            buf.put_u16(d.dependencies.len() as u16);
            for dep in &d.dependencies {
                buf.put_uuid(*dep);
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let headers = decode_kv_list(&mut r)?;
        let mut server_version = String::new();
        let mut server_time = 0i64;
        let mut catalog_version = 0u64;
        for (code, value) in headers {
            if code == DumpHeaderKey::ServerVersion.code() {
                server_version = std::str::from_utf8(&value)?.to_owned();
            } else if code == DumpHeaderKey::ServerTime.code() {
                server_time = i64::from_be_bytes(value[..8].try_into().unwrap_or([0; 8]));
            } else if code == DumpHeaderKey::ServerCatalogVersion.code() {
                catalog_version = u64::from_be_bytes(value[..8].try_into().unwrap_or([0; 8]));
            }
        }
        let major_ver = r.u16()?;
        let minor_ver = r.u16()?;
        let schema_ddl = r.str32()?;

        let ntypes = r.u32()?;
        let mut types = Vec::with_capacity(ntypes as usize);
        for _ in 0..ntypes {
            types.push(DumpTypeInfo {
                type_name: r.str32()?,
                descriptor: r.bytes32()?,
                type_id: r.uuid()?,
            });
        }

        let ndescs = r.u32()?;
        let mut descriptors = Vec::with_capacity(ndescs as usize);
        for _ in 0..ndescs {
            let object_id = r.uuid()?;
            let descriptor = r.bytes32()?;
            let ndeps = r.u16()?;
            let mut dependencies = Vec::with_capacity(ndeps as usize);
            for _ in 0..ndeps {
                dependencies.push(r.uuid()?);
            }
            descriptors.push(DumpObjectDesc {
                object_id,
                descriptor,
                dependencies,
            });
        }

        Ok(DumpHeader {
            server_version,
            server_time,
            catalog_version,
            major_ver,
            minor_ver,
            schema_ddl,
            types,
            descriptors,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DumpBlock {
    pub block_id: Uuid,
    pub block_num: u32,
    pub block_data: Bytes,
}

impl DumpBlock {
    pub fn encode(&self, buf: &mut BytesMut) {
        let num = self.block_num.to_string();
        encode_kv_list(
            buf,
            &[
                (DumpBlockKey::BlockTypeData.code(), &[b'D']),
                (DumpBlockKey::BlockId.code(), self.block_id.as_bytes()),
                (DumpBlockKey::BlockNum.code(), num.as_bytes()),
                (DumpBlockKey::BlockData.code(), &self.block_data),
            ],
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreReady {
    pub jobs: u16,
}

impl RestoreReady {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotation count
        buf.put_u16(self.jobs);
    }
}

/// `Data` payload: one or more encoded column values framed as an element
/// group (spec section 8 scenario 1: `00 00 00 01  00 00 00 04  00 00 00 01`
/// = one element, 4-byte length, the i32 value `1`).
#[derive(Debug, Clone)]
pub struct Data {
    pub values: Vec<Bytes>,
}

impl Data {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.values.len() as u32);
        for v in &self.values {
            buf.put_bytes32(v);
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerMessage {
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    Authentication(Authentication),
    KeyData(KeyData),
    StateDataDescription(StateDataDescription),
    ServerStatus(ServerStatus),
    ReadyForCommand(ReadyForCommand),
    CommandDataDescription(CommandDataDescription),
    CommandComplete(CommandComplete),
    ErrorResponse(ErrorResponse),
    LogMessage(LogMessage),
    DumpHeader(DumpHeader),
    DumpBlock(DumpBlock),
    RestoreReady(RestoreReady),
    Data(Data),
}

impl ServerMessage {
    pub fn tag(&self) -> u8 {
        match self {
            ServerMessage::NegotiateProtocolVersion(_) => tag::SERVER_HANDSHAKE,
            ServerMessage::Authentication(_) => tag::AUTHENTICATION,
            ServerMessage::KeyData(_) => tag::KEY_DATA,
            ServerMessage::StateDataDescription(_) => tag::STATE_DATA_DESCRIPTION,
            ServerMessage::ServerStatus(_) => tag::SERVER_STATUS,
            ServerMessage::ReadyForCommand(_) => tag::READY_FOR_COMMAND,
            ServerMessage::CommandDataDescription(_) => tag::COMMAND_DATA_DESCRIPTION,
            ServerMessage::CommandComplete(_) => tag::COMMAND_COMPLETE,
            ServerMessage::ErrorResponse(_) => tag::ERROR_RESPONSE,
            ServerMessage::LogMessage(_) => tag::LOG_MESSAGE,
            ServerMessage::DumpHeader(_) => tag::DUMP_HEADER,
            ServerMessage::DumpBlock(_) => tag::DUMP_BLOCK,
            ServerMessage::RestoreReady(_) => tag::RESTORE_READY,
            ServerMessage::Data(_) => tag::DATA,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ServerMessage::NegotiateProtocolVersion(m) => m.encode(buf),
            ServerMessage::Authentication(m) => m.encode(buf),
            ServerMessage::KeyData(m) => m.encode(buf),
            ServerMessage::StateDataDescription(m) => m.encode(buf),
            ServerMessage::ServerStatus(m) => m.encode(buf),
            ServerMessage::ReadyForCommand(m) => m.encode(buf),
            ServerMessage::CommandDataDescription(m) => m.encode(buf),
            ServerMessage::CommandComplete(m) => m.encode(buf),
            ServerMessage::ErrorResponse(m) => m.encode(buf),
            ServerMessage::LogMessage(m) => m.encode(buf),
            ServerMessage::DumpHeader(m) => m.encode(buf),
            ServerMessage::DumpBlock(m) => m.encode(buf),
            ServerMessage::RestoreReady(m) => m.encode(buf),
            ServerMessage::Data(m) => m.encode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_message_matches_scenario_one() {
        let data = Data {
            values: vec![Bytes::from_static(&1i32.to_be_bytes())],
        };
        let mut buf = BytesMut::new();
        data.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 1][..]
        );
    }

    #[test]
    fn dump_header_round_trips() {
        let header = DumpHeader {
            server_version: "1.0".into(),
            server_time: 12345,
            catalog_version: 7,
            major_ver: 1,
            minor_ver: 0,
            schema_ddl: "create type Foo;".into(),
            types: vec![DumpTypeInfo {
                type_name: "Foo".into(),
                descriptor: Bytes::from_static(b"desc"),
                type_id: Uuid::from_u128(1),
            }],
            descriptors: vec![DumpObjectDesc {
                object_id: Uuid::from_u128(2),
                descriptor: Bytes::from_static(b"objdesc"),
                dependencies: vec![Uuid::from_u128(1)],
            }],
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = DumpHeader::decode(&buf).unwrap();
        assert_eq!(decoded.server_version, "1.0");
        assert_eq!(decoded.server_time, 12345);
        assert_eq!(decoded.catalog_version, 7);
        assert_eq!(decoded.schema_ddl, "create type Foo;");
        assert_eq!(decoded.types.len(), 1);
        assert_eq!(decoded.descriptors.len(), 1);
        assert_eq!(decoded.descriptors[0].dependencies, vec![Uuid::from_u128(1)]);
    }
}
