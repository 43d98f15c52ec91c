//! The external SQL backend interface (spec section 4.8, consumed; spec
//! section 1, "mediates... a backing SQL engine"). Query execution and the
//! dump/restore backend operations are out of scope for this engine; this
//! trait is the seam, with a mock implementation used by the dispatcher and
//! streamer tests.

use bytes::Bytes;
use uuid::Uuid;

use crate::compile::{CompilationRequest, CompiledQuery};

#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
pub enum BackendError {
    #[display("backend error: {_0}")]
    #[error(ignore)]
    Other(String),
}

/// One row of a result set, already encoded the way the client expects it
/// (binary per-column values).
#[derive(Debug, Clone, Default)]
pub struct ResultRow {
    pub values: Vec<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOutcome {
    pub rows: Vec<ResultRow>,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct DumpPlan {
    pub schema_ddl: String,
    pub dynamic_ddl_queries: Vec<String>,
    pub type_ids: Vec<(String, Uuid)>,
    pub blocks: Vec<(Uuid, Vec<Uuid>)>,
}

#[derive(Debug, Clone, Default)]
pub struct RestorePlan {
    pub schema_sql_units: Vec<SchemaSqlUnit>,
    pub restore_blocks: Vec<Uuid>,
    pub tables_needing_trigger_disable: Vec<String>,
    pub repopulate_units: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SchemaSqlUnit {
    pub sql: String,
    pub ddl_statement_id: Option<String>,
    pub is_configure_instance: bool,
}

/// The backend query/transaction surface this engine drives (spec section
/// 4.6/4.7 describe these operations at the protocol level; the SQL engine
/// itself is out of scope).
pub trait Backend: Send {
    fn execute_unit(
        &mut self,
        request: &CompilationRequest,
        query: &CompiledQuery,
        recoded_args: &Bytes,
    ) -> Result<ExecuteOutcome, BackendError>;

    fn begin_readonly_serializable(&mut self) -> Result<(), BackendError>;
    fn rollback(&mut self) -> Result<(), BackendError>;
    fn commit(&mut self) -> Result<(), BackendError>;

    fn describe_database_dump(&mut self, include_secrets: bool) -> Result<DumpPlan, BackendError>;
    fn describe_database_restore(&mut self, header_schema_ddl: &str) -> Result<RestorePlan, BackendError>;

    /// Fetches the raw `COPY`-style payload for one dump block (spec
    /// section 4.6 step 5: the `(block, block_num, data)` tuples carried by
    /// the output queue).
    fn dump_block_data(&mut self, object_id: Uuid, block_num: u32) -> Result<Bytes, BackendError>;

    fn execute_sql(&mut self, sql: &str) -> Result<(), BackendError>;
    /// Executes a schema SQL unit in DDL mode (spec section 4.7 step 4:
    /// "use the backend's DDL execution mode (which returns type mappings
    /// to apply to the view)"). Returns `(client_type_id, backend_oid)`
    /// pairs discovered while applying the statement.
    fn execute_ddl_unit(&mut self, sql: &str) -> Result<Vec<(Uuid, i32)>, BackendError>;
    fn apply_restore_block(
        &mut self,
        block_id: Uuid,
        block_data: &Bytes,
        type_id_map: &[(Uuid, i32)],
    ) -> Result<(), BackendError>;
    fn disable_triggers(&mut self, tables: &[String]) -> Result<(), BackendError>;
}

/// An in-memory stand-in used by tests: executes nothing, just records calls
/// and returns canned data sufficient to drive the dispatcher/streamer state
/// machines end to end.
#[derive(Debug, Default)]
pub struct MockBackend {
    pub executed_sql: Vec<String>,
    pub next_rows: Vec<ResultRow>,
    pub next_status: String,
}

impl Backend for MockBackend {
    fn execute_unit(
        &mut self,
        _request: &CompilationRequest,
        _query: &CompiledQuery,
        _recoded_args: &Bytes,
    ) -> Result<ExecuteOutcome, BackendError> {
        Ok(ExecuteOutcome {
            rows: std::mem::take(&mut self.next_rows),
            status: if self.next_status.is_empty() {
                "SELECT".into()
            } else {
                self.next_status.clone()
            },
        })
    }

    fn begin_readonly_serializable(&mut self) -> Result<(), BackendError> {
        self.executed_sql.push("BEGIN READ ONLY SERIALIZABLE".into());
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        self.executed_sql.push("ROLLBACK".into());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.executed_sql.push("COMMIT".into());
        Ok(())
    }

    fn describe_database_dump(&mut self, _include_secrets: bool) -> Result<DumpPlan, BackendError> {
        Ok(DumpPlan::default())
    }

    fn describe_database_restore(&mut self, _header_schema_ddl: &str) -> Result<RestorePlan, BackendError> {
        Ok(RestorePlan::default())
    }

    fn dump_block_data(&mut self, _object_id: Uuid, _block_num: u32) -> Result<Bytes, BackendError> {
        Ok(Bytes::new())
    }

    fn execute_sql(&mut self, sql: &str) -> Result<(), BackendError> {
        self.executed_sql.push(sql.to_owned());
        Ok(())
    }

    fn execute_ddl_unit(&mut self, sql: &str) -> Result<Vec<(Uuid, i32)>, BackendError> {
        self.executed_sql.push(sql.to_owned());
        Ok(Vec::new())
    }

    fn apply_restore_block(
        &mut self,
        _block_id: Uuid,
        _block_data: &Bytes,
        _type_id_map: &[(Uuid, i32)],
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn disable_triggers(&mut self, tables: &[String]) -> Result<(), BackendError> {
        self.executed_sql.push(format!("ALTER TABLE {} DISABLE TRIGGER ALL", tables.join(", ")));
        Ok(())
    }
}
