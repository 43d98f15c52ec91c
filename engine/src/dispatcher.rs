//! The request dispatcher (spec section 4.4): Parse, Execute, Sync,
//! Terminate, Flush, and the Dump/Restore entry points. `Ready`-phase
//! message handling lives here rather than in [`crate::connection`] because
//! it needs the compiler and backend seams the connection struct
//! deliberately doesn't own.

use bytes::Bytes;
use uuid::Uuid;

use db_wire::client_message::{tag as ctag, ClientMessage, RequestHeader};
use db_wire::common::{Cardinality, CompilationOptions, NULL_TYPE_ID};
use db_wire::error::EdbError;
use db_wire::server_message::{CommandComplete, CommandDataDescription, ServerMessage};

use crate::backend::Backend;
use crate::compile::{CompilationOptionsKey, CompilationRequest, CompiledQuery, Compiler, UnitGroup};
use crate::connection::{Connection, LastAnonCompile};
use crate::error::ConnectionError;
use crate::recoder;
use crate::session::SessionView;

/// An error raised mid-dispatch, carrying any response messages that must
/// still be flushed before the error itself (spec section 4.4, scenario 2:
/// a parameter-type mismatch emits a fresh `CommandDataDescription` *then*
/// the `Error`). The caller sends `prefix`, then runs the normal
/// error-recovery sequence on `error`.
#[derive(Debug)]
pub struct DispatchError {
    pub prefix: Vec<ServerMessage>,
    pub error: ConnectionError,
}

impl From<ConnectionError> for DispatchError {
    fn from(error: ConnectionError) -> Self {
        DispatchError { prefix: Vec::new(), error }
    }
}

impl From<db_wire::error::DecodeError> for DispatchError {
    fn from(e: db_wire::error::DecodeError) -> Self {
        DispatchError { prefix: Vec::new(), error: e.into() }
    }
}

fn compilation_options(header: &RequestHeader) -> CompilationOptions {
    CompilationOptions {
        implicit_limit: header.implicit_limit,
        implicit_typenames: false,
        implicit_typeids: false,
        explicit_objectids: false,
        allow_capabilities: header.allow_capabilities,
        io_format: header.output_format,
        expected_cardinality: header.expected_cardinality,
        input_language: header.input_language,
    }
}

fn check_header<V: SessionView>(
    conn: &mut Connection<V>,
    header: &RequestHeader,
) -> Result<(), ConnectionError> {
    if header.implicit_limit < 0 {
        return Err(ConnectionError::Protocol(EdbError::ProtocolError));
    }
    if header.expected_cardinality == Cardinality::NoResult {
        return Err(ConnectionError::Protocol(EdbError::ProtocolError));
    }
    let state = db_wire::common::State {
        typedesc_id: header.state_typedesc_id,
        data: header.state_data.clone(),
    };
    if let Err(_mismatch) = conn.view.decode_state(&state) {
        return Err(ConnectionError::Protocol(EdbError::StateMismatchError));
    }
    Ok(())
}

fn describe_first_unit(units: &UnitGroup) -> CommandDataDescription {
    let first = units.units.first();
    CommandDataDescription {
        capabilities: first.map(|u| u.capabilities).unwrap_or(db_wire::common::Capabilities::empty()),
        cardinality: first.map(|u| u.cardinality).unwrap_or(Cardinality::AtMostOne),
        input_typedesc_id: first.map(|u| u.input_type_id).unwrap_or(NULL_TYPE_ID),
        input_typedesc: first.map(|u| u.input_typedesc.clone()).unwrap_or_default(),
        output_typedesc_id: first.map(|u| u.output_type_id).unwrap_or(NULL_TYPE_ID),
        output_typedesc: first.map(|u| u.output_typedesc.clone()).unwrap_or_default(),
    }
}

/// Handles `P` (spec section 4.4, "Parse path").
pub fn handle_parse<V: SessionView, C: Compiler>(
    conn: &mut Connection<V>,
    compiler: &C,
    protocol_major: u16,
    protocol_minor: u16,
    payload: &[u8],
) -> Result<Vec<ServerMessage>, DispatchError> {
    let parse = match ClientMessage::decode(ctag::PARSE, payload)? {
        ClientMessage::Parse(p) => p,
        _ => unreachable!(),
    };
    let header = &parse.header;

    let mut out = Vec::new();
    if header.state_typedesc_id != NULL_TYPE_ID && header.state_typedesc_id != conn.advertised_state_id() {
        out.push(ServerMessage::StateDataDescription(db_wire::server_message::StateDataDescription {
            typedesc_id: conn.view.describe_state().typedesc_id,
            data: conn.view.describe_state().data,
        }));
    }
    check_header(conn, header)?;

    let request = CompilationRequest {
        source: header.command_text.clone(),
        protocol_major,
        protocol_minor,
        schema_version: conn.view.schema_version(),
        options: CompilationOptionsKey::from(&compilation_options(header)),
        modaliases: Vec::new(),
    };

    let compiled = compile_or_lookup(conn, compiler, &request)?;

    conn.last_anon = Some(LastAnonCompile {
        request_hash: request.hash(),
        input_type_id: compiled.units.units.first().map(|u| u.input_type_id).unwrap_or(NULL_TYPE_ID),
        output_type_id: compiled.units.units.first().map(|u| u.output_type_id).unwrap_or(NULL_TYPE_ID),
        units: compiled.units.clone(),
    });

    out.push(ServerMessage::CommandDataDescription(describe_first_unit(&compiled.units)));
    Ok(out)
}

fn compile_or_lookup<V: SessionView, C: Compiler>(
    conn: &mut Connection<V>,
    compiler: &C,
    request: &CompilationRequest,
) -> Result<CompiledQuery, ConnectionError> {
    if let Some(units) = conn.view.lookup_compiled_query(request.hash()) {
        return Ok(CompiledQuery {
            request_hash: request.hash(),
            units,
            warnings: Vec::new(),
        });
    }
    let state = conn.view.encode_state();
    let compiled = compiler
        .compile(request, &state)
        .map_err(|_| ConnectionError::Protocol(EdbError::QueryError))?;
    conn.view.cache_compiled_query(request, &compiled);
    Ok(compiled)
}

/// Handles `O` (spec section 4.4, "Execute path").
pub fn handle_execute<V: SessionView, C: Compiler, B: Backend>(
    conn: &mut Connection<V>,
    compiler: &C,
    backend: &mut B,
    protocol_major: u16,
    protocol_minor: u16,
    payload: &[u8],
) -> Result<Vec<ServerMessage>, DispatchError> {
    let execute = match ClientMessage::decode(ctag::EXECUTE, payload)? {
        ClientMessage::Execute(e) => e,
        _ => unreachable!(),
    };
    let header = &execute.header;
    check_header(conn, header)?;

    let request = CompilationRequest {
        source: header.command_text.clone(),
        protocol_major,
        protocol_minor,
        schema_version: conn.view.schema_version(),
        options: CompilationOptionsKey::from(&compilation_options(header)),
        modaliases: Vec::new(),
    };
    let hash = request.hash();

    let units = if let Some(anon) = &conn.last_anon {
        if anon.request_hash == hash
            && anon.input_type_id == execute.input_typedesc_id
            && anon.output_type_id == execute.output_typedesc_id
        {
            anon.units.clone()
        } else {
            compile_or_lookup(conn, compiler, &request)?.units
        }
    } else {
        compile_or_lookup(conn, compiler, &request)?.units
    };

    let mut out = Vec::new();
    let Some(unit) = units.units.first() else {
        return Err(ConnectionError::Protocol(EdbError::QueryError).into());
    };

    let required_capabilities = units
        .units
        .iter()
        .fold(db_wire::common::Capabilities::empty(), |acc, u| acc | u.capabilities);
    if !header.allow_capabilities.contains(required_capabilities) {
        return Err(ConnectionError::Protocol(EdbError::QueryError).into());
    }

    if unit.input_type_id != execute.input_typedesc_id {
        out.push(ServerMessage::CommandDataDescription(describe_first_unit(&units)));
        return Err(DispatchError {
            prefix: out,
            error: ConnectionError::Protocol(EdbError::QueryError),
        });
    }
    if unit.output_type_id != execute.output_typedesc_id {
        out.push(ServerMessage::CommandDataDescription(describe_first_unit(&units)));
    }

    let outcome = if units.is_rollback_only() {
        // Rollback-only path (spec section 4.4): a tx-abort-migration,
        // savepoint-rollback, or tx-rollback unit needs only its own SQL run
        // against the transaction, no argument binding or row readback.
        match backend.execute_sql(&unit.sql) {
            Ok(()) => crate::backend::ExecuteOutcome { rows: Vec::new(), status: unit.status.clone() },
            Err(_) => {
                return Err(DispatchError {
                    prefix: out,
                    error: ConnectionError::Protocol(EdbError::BackendError),
                })
            }
        }
    } else {
        let recoded = match recoder::recode_arguments(unit, &conn.view, execute.input_typedesc_id, &execute.arguments)
        {
            Ok(bytes) => bytes,
            Err(_) => {
                return Err(DispatchError {
                    prefix: out,
                    error: ConnectionError::Protocol(EdbError::InputDataError),
                })
            }
        };

        // Script path (spec section 4.4): more than one unit, or any unit
        // needing read-back, goes through the same backend call as a single
        // statement would, but carrying the whole unit group so the backend
        // can batch it as one implicit transaction.
        match backend.execute_unit(
            &request,
            &CompiledQuery { request_hash: hash, units: units.clone(), warnings: Vec::new() },
            &recoded,
        ) {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(DispatchError {
                    prefix: out,
                    error: ConnectionError::Protocol(EdbError::BackendError),
                })
            }
        }
    };

    for row in outcome.rows {
        out.push(ServerMessage::Data(db_wire::server_message::Data { values: row.values }));
    }

    let current_state = conn.view.describe_state();
    if current_state.typedesc_id != conn.advertised_state_id() {
        out.push(ServerMessage::StateDataDescription(db_wire::server_message::StateDataDescription {
            typedesc_id: current_state.typedesc_id,
            data: current_state.data.clone(),
        }));
        conn.set_advertised_state_id(current_state.typedesc_id);
    }

    out.push(ServerMessage::CommandComplete(CommandComplete {
        capabilities: required_capabilities,
        status: outcome.status,
        state_typedesc_id: current_state.typedesc_id,
        state_data: current_state.data,
    }));

    conn.sync_phase_with_view();
    Ok(out)
}

/// Handles `S` (spec section 4.4: emit `ReadyForQuery` reflecting the
/// current transaction state).
pub fn handle_sync<V: SessionView>(conn: &mut Connection<V>) -> ServerMessage {
    conn.sync_phase_with_view();
    conn.ready_for_command()
}

/// Top-level dispatch table (spec section 4.4). Parse/Execute need the
/// compiler and backend; Sync/Terminate/Flush don't. Dump/Restore are
/// handled by the caller via [`crate::dump`]/[`crate::restore`] since they
/// span multiple messages.
pub enum Dispatched {
    Messages(Vec<ServerMessage>),
    EnterDump,
    EnterRestore { jobs: u16, header_data: Bytes },
    Terminate,
    FlushOnly,
}

pub fn dispatch<V: SessionView, C: Compiler, B: Backend>(
    conn: &mut Connection<V>,
    compiler: &C,
    backend: &mut B,
    tag: u8,
    payload: &[u8],
) -> Result<Dispatched, DispatchError> {
    match tag {
        ctag::PARSE => Ok(Dispatched::Messages(handle_parse(
            conn,
            compiler,
            conn.protocol_major,
            conn.protocol_minor,
            payload,
        )?)),
        ctag::EXECUTE => Ok(Dispatched::Messages(handle_execute(
            conn,
            compiler,
            backend,
            conn.protocol_major,
            conn.protocol_minor,
            payload,
        )?)),
        ctag::SYNC => Ok(Dispatched::Messages(vec![handle_sync(conn)])),
        ctag::TERMINATE => {
            conn.terminate();
            Ok(Dispatched::Terminate)
        }
        ctag::FLUSH => Ok(Dispatched::FlushOnly),
        ctag::DUMP => Ok(Dispatched::EnterDump),
        ctag::RESTORE => {
            let restore = match ClientMessage::decode(ctag::RESTORE, payload)? {
                ClientMessage::Restore(r) => r,
                _ => unreachable!(),
            };
            Ok(Dispatched::EnterRestore {
                jobs: restore.jobs,
                header_data: restore.header_data,
            })
        }
        _ => Err(ConnectionError::Protocol(EdbError::ProtocolError).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::compile::{InputParam, QueryUnit};
    use crate::connection::CancelFlag;
    use crate::session::InMemorySessionView;
    use db_wire::common::{Capabilities, IoFormat, InputLanguage};
    use bytes::{BufMut, BytesMut};

    struct EchoCompiler;
    impl Compiler for EchoCompiler {
        type Error = std::convert::Infallible;
        fn compile(
            &self,
            request: &CompilationRequest,
            _state: &db_wire::common::State,
        ) -> Result<CompiledQuery, Self::Error> {
            let unit = QueryUnit {
                sql: request.source.clone(),
                sql_hash: None,
                input_type_id: NULL_TYPE_ID,
                input_typedesc: Bytes::new(),
                output_type_id: Uuid::from_u128(7),
                output_typedesc: Bytes::new(),
                cardinality: Cardinality::AtMostOne,
                capabilities: Capabilities::empty(),
                status: "SELECT".into(),
                input_params: Vec::<InputParam>::new(),
                globals: Vec::new(),
                needs_readback: false,
                tx_id: None,
                tx_commit: false,
                tx_rollback: false,
                tx_savepoint_declare: None,
                tx_savepoint_rollback: None,
                tx_abort_migration: false,
                extras_blob: Bytes::new(),
                extras_count: 0,
            };
            Ok(CompiledQuery {
                request_hash: request.hash(),
                units: UnitGroup { units: vec![unit] },
                warnings: Vec::new(),
            })
        }
    }

    fn base_unit(sql: &str, status: &str) -> QueryUnit {
        QueryUnit {
            sql: sql.into(),
            sql_hash: None,
            input_type_id: NULL_TYPE_ID,
            input_typedesc: Bytes::new(),
            output_type_id: NULL_TYPE_ID,
            output_typedesc: Bytes::new(),
            cardinality: Cardinality::AtMostOne,
            capabilities: Capabilities::empty(),
            status: status.into(),
            input_params: Vec::<InputParam>::new(),
            globals: Vec::new(),
            needs_readback: false,
            tx_id: None,
            tx_commit: false,
            tx_rollback: false,
            tx_savepoint_declare: None,
            tx_savepoint_rollback: None,
            tx_abort_migration: false,
            extras_blob: Bytes::new(),
            extras_count: 0,
        }
    }

    struct FixedCompiler(UnitGroup);
    impl Compiler for FixedCompiler {
        type Error = std::convert::Infallible;
        fn compile(
            &self,
            request: &CompilationRequest,
            _state: &db_wire::common::State,
        ) -> Result<CompiledQuery, Self::Error> {
            Ok(CompiledQuery {
                request_hash: request.hash(),
                units: self.0.clone(),
                warnings: Vec::new(),
            })
        }
    }

    fn request_header(text: &str) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u16(0); // annotation count
        b.put_u64(Capabilities::ALL.bits());
        b.put_u64(0);
        b.put_i64(0);
        b.put_u8(InputLanguage::EdgeQl.to_wire());
        b.put_u8(IoFormat::Binary.to_wire());
        b.put_u8(Cardinality::AtMostOne.to_wire());
        b.put_str32(text);
        b.put_uuid(Uuid::nil());
        b.put_bytes32(&[]);
        b.freeze()
    }

    use db_wire::codec::WriterExt;

    #[test]
    fn parse_then_execute_reuses_compile_cache() {
        let mut conn = Connection::new(InMemorySessionView::new("test"), CancelFlag::new());
        conn.phase = crate::connection::Phase::Ready;
        let compiler = EchoCompiler;
        let mut backend = MockBackend::default();

        let parse_payload = request_header("select 1");
        let out = handle_parse(&mut conn, &compiler, 3, 0, &parse_payload).unwrap();
        assert!(matches!(out[0], ServerMessage::CommandDataDescription(_)));

        let mut exec = BytesMut::new();
        exec.put_slice(&request_header("select 1"));
        exec.put_uuid(NULL_TYPE_ID);
        exec.put_uuid(Uuid::from_u128(7));
        let exec_payload = exec.freeze();

        backend.next_status = "SELECT".into();
        let out = handle_execute(&mut conn, &compiler, &mut backend, 3, 0, &exec_payload).unwrap();
        assert!(out.iter().any(|m| matches!(m, ServerMessage::CommandComplete(_))));
    }

    #[test]
    fn rollback_only_unit_runs_raw_sql_without_recoding() {
        let mut conn = Connection::new(InMemorySessionView::new("test"), CancelFlag::new());
        conn.phase = crate::connection::Phase::Ready;
        let mut unit = base_unit("ROLLBACK TO SAVEPOINT s1", "ROLLBACK TO SAVEPOINT");
        unit.tx_savepoint_rollback = Some("s1".into());
        let group = UnitGroup { units: vec![unit] };
        assert!(group.is_rollback_only());
        let compiler = FixedCompiler(group);
        let mut backend = MockBackend::default();

        let mut exec = BytesMut::new();
        exec.put_slice(&request_header("rollback to savepoint s1"));
        exec.put_uuid(NULL_TYPE_ID);
        exec.put_uuid(NULL_TYPE_ID);
        let exec_payload = exec.freeze();

        let out = handle_execute(&mut conn, &compiler, &mut backend, 3, 0, &exec_payload).unwrap();
        assert!(out.iter().any(|m| matches!(m, ServerMessage::CommandComplete(_))));
        assert_eq!(backend.executed_sql, vec!["ROLLBACK TO SAVEPOINT s1".to_string()]);
    }

    #[test]
    fn script_execution_reports_union_of_unit_capabilities() {
        let mut conn = Connection::new(InMemorySessionView::new("test"), CancelFlag::new());
        conn.phase = crate::connection::Phase::Ready;
        let mut first = base_unit("set global Foo::bar := 1", "SET GLOBAL");
        first.capabilities = Capabilities::MODIFICATIONS;
        first.needs_readback = true;
        let second = base_unit("select 1", "SELECT");
        let group = UnitGroup { units: vec![first, second] };
        assert!(group.needs_script_execution());
        let compiler = FixedCompiler(group);
        let mut backend = MockBackend::default();
        backend.next_status = "SELECT".into();

        let mut exec = BytesMut::new();
        exec.put_slice(&request_header("set global Foo::bar := 1; select 1"));
        exec.put_uuid(NULL_TYPE_ID);
        exec.put_uuid(NULL_TYPE_ID);
        let exec_payload = exec.freeze();

        let out = handle_execute(&mut conn, &compiler, &mut backend, 3, 0, &exec_payload).unwrap();
        let complete = out
            .iter()
            .find_map(|m| match m {
                ServerMessage::CommandComplete(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(complete.capabilities, Capabilities::MODIFICATIONS);
    }
}
