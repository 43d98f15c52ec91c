//! The session/state view interface (spec section 4.8) and session state
//! data model (spec section 3). The view is nominally an external
//! collaborator — owned by the database layer — but this engine ships a
//! concrete in-memory implementation so the connection state machine and
//! dispatcher can be exercised end to end without a real backend.

use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use db_wire::common::State;

use crate::compile::{CompilationRequest, CompiledQuery, UnitGroup};
use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("state mismatch: client descriptor is stale")]
pub struct StateMismatchError;

/// Observable contract the engine depends on (spec section 4.8). Parse/
/// compile are `async` because they may suspend on backend or compiler I/O
/// (spec section 5: suspension point (c)).
pub trait SessionView: Send {
    fn in_tx(&self) -> bool;
    fn in_tx_error(&self) -> bool;
    fn txid(&self) -> Option<u64>;
    fn dbname(&self) -> &str;
    fn schema_version(&self) -> Uuid;

    fn lookup_compiled_query(&self, request_hash: u64) -> Option<UnitGroup>;
    fn cache_compiled_query(&mut self, request: &CompilationRequest, query: &CompiledQuery);

    fn describe_state(&self) -> State;
    fn encode_state(&self) -> State;
    fn decode_state(&mut self, state: &State) -> Result<(), StateMismatchError>;

    fn resolve_backend_type_id(&self, client_type_id: Uuid) -> Option<i32>;

    fn rollback_tx_to_savepoint(&mut self, name: &str) -> Result<(), ConnectionError>;
    fn abort_tx(&mut self);
    fn clear_tx_error(&mut self);
    fn raise_in_tx_error(&mut self);
    fn begin_tx(&mut self, id: u64);
    fn commit_tx(&mut self);

    fn get_globals(&self) -> &HashMap<String, (Option<Bytes>, bool)>;
    fn set_global(&mut self, name: String, value: Option<Bytes>);
}

#[derive(Debug, Default, Clone)]
struct Savepoint {
    name: String,
}

/// A straightforward, single-connection in-memory session view.
#[derive(Debug)]
pub struct InMemorySessionView {
    dbname: String,
    schema_version: Uuid,
    txid: Option<u64>,
    in_tx_error: bool,
    savepoints: Vec<Savepoint>,
    state_typedesc_id: Uuid,
    state_data: Bytes,
    advertised_state_id: Uuid,
    globals: HashMap<String, (Option<Bytes>, bool)>,
    compile_cache: HashMap<u64, UnitGroup>,
    backend_type_ids: HashMap<Uuid, i32>,
}

impl InMemorySessionView {
    pub fn new(dbname: impl Into<String>) -> Self {
        InMemorySessionView {
            dbname: dbname.into(),
            schema_version: Uuid::new_v4(),
            txid: None,
            in_tx_error: false,
            savepoints: Vec::new(),
            state_typedesc_id: Uuid::nil(),
            state_data: Bytes::new(),
            advertised_state_id: Uuid::nil(),
            globals: HashMap::new(),
            compile_cache: HashMap::new(),
            backend_type_ids: HashMap::new(),
        }
    }

    pub fn register_backend_type(&mut self, client_id: Uuid, backend_oid: i32) {
        self.backend_type_ids.insert(client_id, backend_oid);
    }
}

impl SessionView for InMemorySessionView {
    fn in_tx(&self) -> bool {
        self.txid.is_some()
    }

    fn in_tx_error(&self) -> bool {
        self.in_tx_error
    }

    fn txid(&self) -> Option<u64> {
        self.txid
    }

    fn dbname(&self) -> &str {
        &self.dbname
    }

    fn schema_version(&self) -> Uuid {
        self.schema_version
    }

    fn lookup_compiled_query(&self, request_hash: u64) -> Option<UnitGroup> {
        self.compile_cache.get(&request_hash).cloned()
    }

    fn cache_compiled_query(&mut self, request: &CompilationRequest, query: &CompiledQuery) {
        self.compile_cache.insert(request.hash(), query.units.clone());
    }

    fn describe_state(&self) -> State {
        State {
            typedesc_id: self.state_typedesc_id,
            data: self.state_data.clone(),
        }
    }

    fn encode_state(&self) -> State {
        self.describe_state()
    }

    fn decode_state(&mut self, state: &State) -> Result<(), StateMismatchError> {
        if state.typedesc_id != self.advertised_state_id && !state.typedesc_id.is_nil() {
            return Err(StateMismatchError);
        }
        self.state_data = state.data.clone();
        Ok(())
    }

    fn resolve_backend_type_id(&self, client_type_id: Uuid) -> Option<i32> {
        self.backend_type_ids.get(&client_type_id).copied()
    }

    fn rollback_tx_to_savepoint(&mut self, name: &str) -> Result<(), ConnectionError> {
        if let Some(pos) = self.savepoints.iter().position(|s| s.name == name) {
            self.savepoints.truncate(pos + 1);
            self.in_tx_error = false;
            Ok(())
        } else {
            Err(ConnectionError::Protocol(db_wire::error::EdbError::QueryError))
        }
    }

    fn abort_tx(&mut self) {
        self.txid = None;
        self.in_tx_error = false;
        self.savepoints.clear();
    }

    fn clear_tx_error(&mut self) {
        self.in_tx_error = false;
    }

    fn raise_in_tx_error(&mut self) {
        if self.txid.is_some() {
            self.in_tx_error = true;
        }
    }

    fn begin_tx(&mut self, id: u64) {
        self.txid = Some(id);
    }

    fn commit_tx(&mut self) {
        self.txid = None;
        self.in_tx_error = false;
        self.savepoints.clear();
    }

    fn get_globals(&self) -> &HashMap<String, (Option<Bytes>, bool)> {
        &self.globals
    }

    fn set_global(&mut self, name: String, value: Option<Bytes>) {
        let present = value.is_some();
        self.globals.insert(name, (value, present));
    }
}
