//! The restore streamer (spec section 4.7): parses the client-supplied
//! `DumpHeader`, replays the schema, then consumes `RestoreBlock` messages
//! until `RestoreEof`, applying each to the backend.
//!
//! Like [`crate::dump`], this is driven one message at a time by the
//! listener rather than owning its own task; "pause the transport reader"
//! is just "don't call `apply_block` again until the listener decides to".

use bytes::Bytes;
use uuid::Uuid;

use db_wire::common::Capabilities;
use db_wire::error::EdbError;
use db_wire::server_message::{CommandComplete, DumpHeader, RestoreReady, ServerMessage};

use crate::backend::{Backend, BackendError};
use crate::error::ConnectionError;
use crate::session::SessionView;

const SUPPORTED_DUMP_MAJOR_MIN: u16 = 0;
const SUPPORTED_DUMP_MINOR_MIN: u16 = 7;
const SUPPORTED_DUMP_MAJOR_MAX: u16 = 2;

fn backend_err(_: BackendError) -> ConnectionError {
    ConnectionError::Protocol(EdbError::BackendError)
}

fn version_in_range(major: u16, minor: u16) -> bool {
    if major < SUPPORTED_DUMP_MAJOR_MIN || major > SUPPORTED_DUMP_MAJOR_MAX {
        return false;
    }
    if major == SUPPORTED_DUMP_MAJOR_MIN {
        return minor >= SUPPORTED_DUMP_MINOR_MIN;
    }
    true
}

pub struct RestoreSession {
    expected_jobs: u16,
    type_id_map: Vec<(Uuid, i32)>,
    restore_blocks: Vec<Uuid>,
    repopulate_units: Vec<String>,
    received_blocks: Vec<Uuid>,
}

impl RestoreSession {
    /// Runs spec section 4.7 steps 1-6: parses the embedded header, resets
    /// session state, opens the transaction, plans the restore, replays the
    /// schema, disables triggers, and returns `RestoreReady`.
    ///
    /// Preconditions: the view must not be in a transaction.
    pub fn start<V: SessionView, B: Backend>(
        view: &mut V,
        backend: &mut B,
        jobs: u16,
        header_data: &Bytes,
    ) -> Result<(ServerMessage, RestoreSession), ConnectionError> {
        if view.in_tx() {
            return Err(ConnectionError::Protocol(EdbError::QueryError));
        }

        let header = DumpHeader::decode(header_data).map_err(|e| ConnectionError::Protocol(EdbError::from(e)))?;
        if !version_in_range(header.major_ver, header.minor_ver) {
            return Err(ConnectionError::Protocol(EdbError::UnsupportedProtocolVersionError));
        }

        view.abort_tx();
        backend.execute_sql("START TRANSACTION ISOLATION SERIALIZABLE").map_err(backend_err)?;

        let plan = backend.describe_database_restore(&header.schema_ddl).map_err(backend_err)?;

        let mut type_id_map = Vec::new();
        for unit in &plan.schema_sql_units {
            if unit.is_configure_instance {
                let _ = backend.rollback();
                return Err(ConnectionError::Protocol(EdbError::ProtocolError));
            }
            if unit.ddl_statement_id.is_some() {
                match backend.execute_ddl_unit(&unit.sql) {
                    Ok(mappings) => type_id_map.extend(mappings),
                    Err(_) => {
                        let _ = backend.rollback();
                        return Err(ConnectionError::Protocol(EdbError::BackendError));
                    }
                }
            } else if backend.execute_sql(&unit.sql).is_err() {
                let _ = backend.rollback();
                return Err(ConnectionError::Protocol(EdbError::BackendError));
            }
        }

        if !plan.tables_needing_trigger_disable.is_empty() {
            if backend.disable_triggers(&plan.tables_needing_trigger_disable).is_err() {
                let _ = backend.rollback();
                return Err(ConnectionError::Protocol(EdbError::BackendError));
            }
        }

        let session = RestoreSession {
            expected_jobs: jobs.max(1),
            type_id_map,
            restore_blocks: plan.restore_blocks,
            repopulate_units: plan.repopulate_units,
            received_blocks: Vec::new(),
        };
        Ok((
            ServerMessage::RestoreReady(RestoreReady { jobs: session.expected_jobs }),
            session,
        ))
    }

    /// Applies one `RestoreBlock` (spec section 4.7 step 7).
    pub fn apply_block<B: Backend>(
        &mut self,
        backend: &mut B,
        block_id: Uuid,
        block_data: &Bytes,
    ) -> Result<(), ConnectionError> {
        backend
            .apply_restore_block(block_id, block_data, &self.type_id_map)
            .map_err(|_| {
                let _ = backend.rollback();
                ConnectionError::Protocol(EdbError::BackendError)
            })?;
        self.received_blocks.push(block_id);
        Ok(())
    }

    pub fn expected_blocks(&self) -> &[Uuid] {
        &self.restore_blocks
    }

    /// Finishes the restore (spec section 4.7 steps 8-9): repopulation,
    /// re-enabling triggers, commit, then the closing `CommandComplete`
    /// carrying the refreshed state descriptor.
    pub fn finish<V: SessionView, B: Backend>(
        self,
        view: &mut V,
        backend: &mut B,
    ) -> Result<ServerMessage, ConnectionError> {
        for unit in &self.repopulate_units {
            if backend.execute_sql(unit).is_err() {
                let _ = backend.rollback();
                return Err(ConnectionError::Protocol(EdbError::BackendError));
            }
        }
        if backend.execute_sql("ALTER TABLE ALL ENABLE TRIGGER ALL").is_err() {
            let _ = backend.rollback();
            return Err(ConnectionError::Protocol(EdbError::BackendError));
        }
        backend.commit().map_err(backend_err)?;

        let state = view.describe_state();
        Ok(ServerMessage::CommandComplete(CommandComplete {
            capabilities: Capabilities::empty(),
            status: "RESTORE".into(),
            state_typedesc_id: state.typedesc_id,
            state_data: state.data,
        }))
    }

    /// Aborts mid-restore (connection drop, cancellation, or a caller that
    /// chose not to call [`RestoreSession::finish`]).
    pub fn abort<B: Backend>(backend: &mut B) -> ConnectionError {
        let _ = backend.rollback();
        ConnectionError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MockBackend, RestorePlan, SchemaSqlUnit};
    use crate::session::InMemorySessionView;

    struct PlanningBackend {
        inner: MockBackend,
        plan: RestorePlan,
    }

    impl Backend for PlanningBackend {
        fn execute_unit(
            &mut self,
            request: &crate::compile::CompilationRequest,
            query: &crate::compile::CompiledQuery,
            recoded_args: &Bytes,
        ) -> Result<crate::backend::ExecuteOutcome, BackendError> {
            self.inner.execute_unit(request, query, recoded_args)
        }
        fn begin_readonly_serializable(&mut self) -> Result<(), BackendError> {
            self.inner.begin_readonly_serializable()
        }
        fn rollback(&mut self) -> Result<(), BackendError> {
            self.inner.rollback()
        }
        fn commit(&mut self) -> Result<(), BackendError> {
            self.inner.commit()
        }
        fn describe_database_dump(&mut self, s: bool) -> Result<crate::backend::DumpPlan, BackendError> {
            self.inner.describe_database_dump(s)
        }
        fn describe_database_restore(&mut self, _s: &str) -> Result<RestorePlan, BackendError> {
            Ok(self.plan.clone())
        }
        fn dump_block_data(&mut self, o: Uuid, n: u32) -> Result<Bytes, BackendError> {
            self.inner.dump_block_data(o, n)
        }
        fn execute_sql(&mut self, sql: &str) -> Result<(), BackendError> {
            self.inner.execute_sql(sql)
        }
        fn execute_ddl_unit(&mut self, sql: &str) -> Result<Vec<(Uuid, i32)>, BackendError> {
            self.inner.execute_ddl_unit(sql)
        }
        fn apply_restore_block(
            &mut self,
            b: Uuid,
            d: &Bytes,
            m: &[(Uuid, i32)],
        ) -> Result<(), BackendError> {
            self.inner.apply_restore_block(b, d, m)
        }
        fn disable_triggers(&mut self, t: &[String]) -> Result<(), BackendError> {
            self.inner.disable_triggers(t)
        }
    }

    fn encoded_header() -> Bytes {
        use bytes::BytesMut;
        let header = DumpHeader {
            server_version: "1.0".into(),
            server_time: 0,
            catalog_version: 1,
            major_ver: 2,
            minor_ver: 0,
            schema_ddl: String::new(),
            types: Vec::new(),
            descriptors: Vec::new(),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn restore_runs_schema_then_accepts_blocks_then_commits() {
        let mut view = InMemorySessionView::new("test");
        let block_id = Uuid::from_u128(42);
        let mut backend = PlanningBackend {
            inner: MockBackend::default(),
            plan: RestorePlan {
                schema_sql_units: vec![SchemaSqlUnit {
                    sql: "create type Foo".into(),
                    ddl_statement_id: Some("s1".into()),
                    is_configure_instance: false,
                }],
                restore_blocks: vec![block_id],
                tables_needing_trigger_disable: vec!["foo".into()],
                repopulate_units: vec!["refresh materialized view".into()],
            },
        };

        let (ready, mut session) =
            RestoreSession::start(&mut view, &mut backend, 1, &encoded_header()).unwrap();
        assert!(matches!(ready, ServerMessage::RestoreReady(_)));

        session.apply_block(&mut backend, block_id, &Bytes::from_static(b"data")).unwrap();
        assert_eq!(session.expected_blocks(), &[block_id]);

        let complete = session.finish(&mut view, &mut backend).unwrap();
        assert!(matches!(complete, ServerMessage::CommandComplete(_)));
        assert!(backend.inner.executed_sql.contains(&"COMMIT".to_string()));
    }

    #[test]
    fn restore_refuses_configure_instance_units() {
        let mut view = InMemorySessionView::new("test");
        let mut backend = PlanningBackend {
            inner: MockBackend::default(),
            plan: RestorePlan {
                schema_sql_units: vec![SchemaSqlUnit {
                    sql: "configure instance set foo := 1".into(),
                    ddl_statement_id: None,
                    is_configure_instance: true,
                }],
                restore_blocks: Vec::new(),
                tables_needing_trigger_disable: Vec::new(),
                repopulate_units: Vec::new(),
            },
        };
        let err = RestoreSession::start(&mut view, &mut backend, 1, &encoded_header()).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(EdbError::ProtocolError)));
    }
}
