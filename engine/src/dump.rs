//! The dump streamer (spec section 4.6): snapshots the database under a
//! read-only serializable transaction and streams it out as a `DumpHeader`
//! followed by `DumpBlock` messages.
//!
//! This runs as a cooperative step sequence the listener drives one
//! message at a time (spec section 5), rather than a spawned task: the
//! "shared bounded output queue (capacity 2)" from the spec is modeled as
//! an in-process prefetch buffer of the same depth (`DumpStreamer::next_block`
//! tops it up before popping), so the backend never needs to be
//! `Send + 'static` to be handed to `tokio::spawn`. Backpressure falls out
//! for free: the listener only calls `next_block` again once it has
//! flushed the previous message to the transport, matching "await the
//! transport's write drain before pulling the next queue item".

use std::collections::VecDeque;

use bytes::Bytes;
use uuid::Uuid;

use db_wire::common::{Capabilities, NULL_TYPE_ID};
use db_wire::error::EdbError;
use db_wire::server_message::{CommandComplete, DumpBlock, DumpHeader, DumpObjectDesc, DumpTypeInfo, ServerMessage};

use crate::backend::{Backend, BackendError};
use crate::error::ConnectionError;
use crate::session::SessionView;

const DEFAULT_DUMP_QUEUE_CAPACITY: usize = 2;

/// Protocol major/minor stamped into the `DumpHeader` (spec section 4.7:
/// restore accepts `[0.7 ... CURRENT]`).
const DUMP_FORMAT_MAJOR: u16 = 2;
const DUMP_FORMAT_MINOR: u16 = 0;

fn backend_err(_: BackendError) -> ConnectionError {
    ConnectionError::Protocol(EdbError::BackendError)
}

pub struct DumpStreamer {
    blocks: VecDeque<(Uuid, Vec<Uuid>)>,
    prefetch: VecDeque<DumpBlock>,
    block_num: u32,
    capacity: usize,
}

impl DumpStreamer {
    /// Starts the dump (spec section 4.6 steps 1-4). Preconditions: the
    /// view must not be in a transaction. Returns the `DumpHeader` message
    /// to send immediately, plus a streamer for the remaining blocks.
    pub fn start<V: SessionView, B: Backend>(
        view: &V,
        backend: &mut B,
        include_secrets: bool,
        server_version: &str,
        server_time: i64,
        catalog_version: u64,
    ) -> Result<(ServerMessage, DumpStreamer), ConnectionError> {
        Self::start_with_capacity(
            view,
            backend,
            include_secrets,
            server_version,
            server_time,
            catalog_version,
            DEFAULT_DUMP_QUEUE_CAPACITY,
        )
    }

    /// Same as [`DumpStreamer::start`], but with an explicit prefetch depth
    /// (spec section 4.6 step 5's output queue capacity, normally sourced
    /// from [`crate::config::ListenerConfig::dump_queue_capacity`]).
    pub fn start_with_capacity<V: SessionView, B: Backend>(
        view: &V,
        backend: &mut B,
        include_secrets: bool,
        server_version: &str,
        server_time: i64,
        catalog_version: u64,
        capacity: usize,
    ) -> Result<(ServerMessage, DumpStreamer), ConnectionError> {
        let capacity = capacity.max(1);
        if view.in_tx() {
            return Err(ConnectionError::Protocol(EdbError::QueryError));
        }

        backend.begin_readonly_serializable().map_err(backend_err)?;
        let plan = backend.describe_database_dump(include_secrets).map_err(backend_err)?;

        let mut schema_ddl = plan.schema_ddl;
        for query in &plan.dynamic_ddl_queries {
            backend.execute_sql(query).map_err(backend_err)?;
            schema_ddl.push('\n');
            schema_ddl.push_str(query);
        }

        let header = DumpHeader {
            server_version: server_version.to_string(),
            server_time,
            catalog_version,
            major_ver: DUMP_FORMAT_MAJOR,
            minor_ver: DUMP_FORMAT_MINOR,
            schema_ddl,
            types: plan
                .type_ids
                .into_iter()
                .map(|(type_name, type_id)| DumpTypeInfo {
                    type_name,
                    descriptor: Bytes::new(),
                    type_id,
                })
                .collect(),
            descriptors: plan
                .blocks
                .iter()
                .map(|(object_id, dependencies)| DumpObjectDesc {
                    object_id: *object_id,
                    descriptor: Bytes::new(),
                    dependencies: dependencies.clone(),
                })
                .collect(),
        };

        let streamer = DumpStreamer {
            blocks: plan.blocks.into(),
            prefetch: VecDeque::with_capacity(capacity),
            block_num: 0,
            capacity,
        };
        Ok((ServerMessage::DumpHeader(header), streamer))
    }

    /// Pulls the next `DumpBlock` message, refilling the prefetch buffer up
    /// to its capacity first. `None` once every block has been emitted.
    pub fn next_block<B: Backend>(&mut self, backend: &mut B) -> Result<Option<ServerMessage>, ConnectionError> {
        while self.prefetch.len() < self.capacity {
            let Some((object_id, _deps)) = self.blocks.pop_front() else {
                break;
            };
            let block_data = backend.dump_block_data(object_id, self.block_num).map_err(backend_err)?;
            self.prefetch.push_back(DumpBlock {
                block_id: object_id,
                block_num: self.block_num,
                block_data,
            });
            self.block_num += 1;
        }
        Ok(self.prefetch.pop_front().map(ServerMessage::DumpBlock))
    }

    pub fn is_exhausted(&self) -> bool {
        self.blocks.is_empty() && self.prefetch.is_empty()
    }

    /// Finishes the dump (spec section 4.6 step 6): the transaction was
    /// read-only, so closing it out is a rollback either way. Returns the
    /// closing `CommandComplete`.
    pub fn finish<B: Backend>(backend: &mut B) -> Result<ServerMessage, ConnectionError> {
        backend.rollback().map_err(backend_err)?;
        Ok(ServerMessage::CommandComplete(CommandComplete {
            capabilities: Capabilities::empty(),
            status: "DUMP".into(),
            state_typedesc_id: NULL_TYPE_ID,
            state_data: Bytes::new(),
        }))
    }

    /// Aborts a dump mid-stream (spec section 4.6, "Cancellation"): the
    /// backend rollback still runs even though no further blocks are sent.
    pub fn abort<B: Backend>(backend: &mut B) -> ConnectionError {
        let _ = backend.rollback();
        ConnectionError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::session::InMemorySessionView;

    #[test]
    fn dump_streams_header_then_blocks_then_completes() {
        let view = InMemorySessionView::new("test");
        let mut backend = MockBackend::default();

        let (header, mut streamer) =
            DumpStreamer::start(&view, &mut backend, false, "1.0", 0, 1).unwrap();
        assert!(matches!(header, ServerMessage::DumpHeader(_)));
        assert!(streamer.is_exhausted());
        assert!(streamer.next_block(&mut backend).unwrap().is_none());

        let complete = DumpStreamer::finish(&mut backend).unwrap();
        assert!(matches!(complete, ServerMessage::CommandComplete(_)));
        assert_eq!(backend.executed_sql, vec!["BEGIN READ ONLY SERIALIZABLE", "ROLLBACK"]);
    }

    #[test]
    fn dump_refuses_inside_a_transaction() {
        let mut view = InMemorySessionView::new("test");
        view.begin_tx(1);
        let mut backend = MockBackend::default();
        let err = DumpStreamer::start(&view, &mut backend, false, "1.0", 0, 1).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(EdbError::QueryError)));
    }
}
