//! The TCP accept loop and per-connection driver (spec section 5: a
//! cooperative, single-threaded state machine per connection). Grounded in
//! `gel-frontend/src/listener/gel.rs`'s accept-and-drive loop, simplified to
//! a plain `tokio::net::TcpStream` since TLS termination and HTTP transport
//! are out of scope for this engine.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace};

use db_wire::client_message::{tag as ctag, ClientMessage};
use db_wire::error::EdbError;
use db_wire::frame::{FrameReader, FrameWriter};
use db_wire::server_message::ServerMessage;

use crate::backend::Backend;
use crate::compile::Compiler;
use crate::config::ListenerConfig;
use crate::connection::{error_response, CancelFlag, Connection, Phase};
use crate::dispatcher::{self, Dispatched};
use crate::dump::DumpStreamer;
use crate::error::ConnectionError;
use crate::restore::RestoreSession;
use crate::session::SessionView;

const SERVER_VERSION: &str = concat!("db-engine/", env!("CARGO_PKG_VERSION"));
const CATALOG_VERSION: u64 = 1;
const READ_CHUNK: usize = 16 * 1024;

fn unix_time_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Accepts connections forever, spawning one task per connection. Stops
/// only on a listener-level I/O error (bind failure, accept failure).
pub async fn serve<V, C, B>(
    config: Arc<dyn ListenerConfig>,
    compiler: Arc<C>,
) -> std::io::Result<()>
where
    V: SessionView + Default + 'static,
    C: Compiler + Send + Sync + 'static,
    B: Backend + Default + 'static,
{
    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %config.listen_addr(), "listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        let config = config.clone();
        let compiler = compiler.clone();
        tokio::spawn(async move {
            let view = V::default();
            let backend = B::default();
            if let Err(e) = handle_connection(socket, config, compiler, view, backend).await {
                debug!(%peer, error = %e, "connection closed");
            }
        });
    }
}

async fn send_all(
    socket: &mut TcpStream,
    writer: &mut FrameWriter,
    messages: &[ServerMessage],
) -> std::io::Result<()> {
    for m in messages {
        let mut payload = bytes::BytesMut::new();
        m.encode(&mut payload);
        writer.write_message(m.tag(), &payload);
    }
    if !writer.is_empty() {
        let bytes = writer.drain();
        socket.write_all(&bytes).await?;
    }
    Ok(())
}

async fn send_one(socket: &mut TcpStream, writer: &mut FrameWriter, message: &ServerMessage) -> std::io::Result<()> {
    send_all(socket, writer, std::slice::from_ref(message)).await
}

/// Reads the next framed message, respecting the idle timeout outside
/// dump/restore (spec section 4.2, "Idle tracking"). `Ok(None)` on clean EOF.
async fn next_message(
    socket: &mut TcpStream,
    reader: &mut FrameReader,
    idle_timeout: Duration,
    track_idle: bool,
) -> Result<Option<(u8, Bytes)>, ConnectionError> {
    loop {
        if let Some(m) = reader.take_message().map_err(ConnectionError::from)? {
            return Ok(Some(m));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let read = if track_idle {
            match tokio::time::timeout(idle_timeout, socket.read(&mut chunk)).await {
                Ok(r) => r?,
                Err(_) => return Err(ConnectionError::Protocol(EdbError::IdleSessionTimeoutError)),
            }
        } else {
            socket.read(&mut chunk).await?
        };
        if read == 0 {
            return Ok(None);
        }
        reader.extend(&chunk[..read]);
    }
}

/// Drives one connection end to end: handshake, auth, then the
/// ready/dispatch loop with inline dump/restore sub-loops.
pub async fn handle_connection<V, C, B>(
    mut socket: TcpStream,
    config: Arc<dyn ListenerConfig>,
    compiler: Arc<C>,
    view: V,
    mut backend: B,
) -> Result<(), ConnectionError>
where
    V: SessionView,
    C: Compiler,
    B: Backend,
{
    let cancel = CancelFlag::new();
    let mut conn = Connection::new(view, cancel.clone());
    let mut reader = FrameReader::default();
    let mut writer = FrameWriter::with_flush_threshold(config.flush_threshold());

    loop {
        if conn.is_bad() || conn.phase == Phase::Closing {
            break;
        }
        conn.mark_idle();
        let track_idle = !matches!(conn.phase, Phase::Dumping | Phase::Restoring);

        let next = next_message(&mut socket, &mut reader, config.idle_timeout(), track_idle).await;
        let (tag, payload) = match next {
            Ok(Some(m)) => m,
            Ok(None) => break,
            Err(ConnectionError::Protocol(code)) => {
                let _ = send_one(&mut socket, &mut writer, &error_response(code, code.to_string())).await;
                break;
            }
            Err(e) => return Err(e),
        };

        if cancel.is_set() {
            break;
        }

        if conn.in_recovery() {
            if let Some(ready) = conn.recover_step(tag, &payload) {
                send_one(&mut socket, &mut writer, &ready).await?;
            }
            continue;
        }

        match conn.phase {
            Phase::New | Phase::Handshake | Phase::Auth => {
                match conn.drive_handshake(config.auth_policy(), tag, &payload) {
                    Ok(messages) => send_all(&mut socket, &mut writer, &messages).await?,
                    Err(ConnectionError::Protocol(code)) => {
                        send_one(&mut socket, &mut writer, &error_response(code, code.to_string())).await?;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            Phase::Ready | Phase::InTx | Phase::InTxError => {
                match dispatcher::dispatch(&mut conn, compiler.as_ref(), &mut backend, tag, &payload) {
                    Ok(Dispatched::Messages(messages)) => {
                        send_all(&mut socket, &mut writer, &messages).await?;
                    }
                    Ok(Dispatched::FlushOnly) => {
                        if !writer.is_empty() {
                            let bytes = writer.drain();
                            socket.write_all(&bytes).await?;
                        }
                    }
                    Ok(Dispatched::Terminate) => break,
                    Ok(Dispatched::EnterDump) => {
                        run_dump(&mut socket, &mut writer, &mut conn, &mut backend, config.dump_queue_capacity())
                            .await?;
                    }
                    Ok(Dispatched::EnterRestore { jobs, header_data }) => {
                        run_restore(
                            &mut socket,
                            &mut reader,
                            &mut writer,
                            &mut conn,
                            &mut backend,
                            jobs,
                            header_data,
                        )
                        .await?;
                    }
                    Err(err) => {
                        if !err.prefix.is_empty() {
                            send_all(&mut socket, &mut writer, &err.prefix).await?;
                        }
                        let code = err.error.as_edb_error().unwrap_or(EdbError::InternalServerError);
                        let message = conn.begin_error_recovery(code);
                        send_one(&mut socket, &mut writer, &message).await?;
                    }
                }
            }
            Phase::Dumping | Phase::Restoring | Phase::Closing | Phase::Bad => {
                trace!(tag, "unexpected message outside streaming loop");
                break;
            }
        }
    }

    Ok(())
}

async fn run_dump<V, B>(
    socket: &mut TcpStream,
    writer: &mut FrameWriter,
    conn: &mut Connection<V>,
    backend: &mut B,
    dump_queue_capacity: usize,
) -> Result<(), ConnectionError>
where
    V: SessionView,
    B: Backend,
{
    conn.enter_dumping();
    let start = DumpStreamer::start_with_capacity(
        &conn.view,
        backend,
        false,
        SERVER_VERSION,
        unix_time_now(),
        CATALOG_VERSION,
        dump_queue_capacity,
    );
    let (header, mut streamer) = match start {
        Ok(v) => v,
        Err(ConnectionError::Protocol(code)) => {
            let message = conn.begin_error_recovery(code);
            send_one(socket, writer, &message).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    send_one(socket, writer, &header).await?;

    loop {
        if conn.cancel.is_set() {
            let _ = DumpStreamer::abort(backend);
            break;
        }
        match streamer.next_block(backend) {
            Ok(Some(block)) => {
                send_one(socket, writer, &block).await?;
                if writer.should_flush() {
                    let bytes = writer.drain();
                    socket.write_all(&bytes).await?;
                }
            }
            Ok(None) => break,
            Err(ConnectionError::Protocol(code)) => {
                let message = conn.begin_error_recovery(code);
                send_one(socket, writer, &message).await?;
                conn.leave_streaming();
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    let complete = DumpStreamer::finish(backend)?;
    send_one(socket, writer, &complete).await?;
    conn.leave_streaming();
    Ok(())
}

async fn run_restore<V, B>(
    socket: &mut TcpStream,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    conn: &mut Connection<V>,
    backend: &mut B,
    jobs: u16,
    header_data: Bytes,
) -> Result<(), ConnectionError>
where
    V: SessionView,
    B: Backend,
{
    conn.enter_restoring();
    let start = RestoreSession::start(&mut conn.view, backend, jobs, &header_data);
    let (ready, mut session) = match start {
        Ok(v) => v,
        Err(ConnectionError::Protocol(code)) => {
            let message = conn.begin_error_recovery(code);
            send_one(socket, writer, &message).await?;
            conn.leave_streaming();
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    send_one(socket, writer, &ready).await?;

    loop {
        if conn.cancel.is_set() {
            let _ = RestoreSession::abort(backend);
            conn.leave_streaming();
            return Ok(());
        }
        let (tag, payload) = match next_message(socket, reader, Duration::from_secs(3600), false).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                let _ = RestoreSession::abort(backend);
                conn.leave_streaming();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match tag {
            ctag::RESTORE_BLOCK => {
                let block = match ClientMessage::decode(tag, &payload) {
                    Ok(ClientMessage::RestoreBlock(b)) => b,
                    Ok(_) => unreachable!(),
                    Err(e) => return Err(ConnectionError::from(e)),
                };
                if let Err(ConnectionError::Protocol(code)) =
                    session.apply_block(backend, block.block_id, &block.block_data)
                {
                    let message = conn.begin_error_recovery(code);
                    send_one(socket, writer, &message).await?;
                    conn.leave_streaming();
                    return Ok(());
                }
            }
            ctag::RESTORE_EOF => break,
            _ => {
                let _ = RestoreSession::abort(backend);
                conn.leave_streaming();
                return Err(ConnectionError::Protocol(EdbError::ProtocolError));
            }
        }
    }

    match session.finish(&mut conn.view, backend) {
        Ok(complete) => {
            send_one(socket, writer, &complete).await?;
            conn.leave_streaming();
            Ok(())
        }
        Err(ConnectionError::Protocol(code)) => {
            let message = conn.begin_error_recovery(code);
            send_one(socket, writer, &message).await?;
            conn.leave_streaming();
            Ok(())
        }
        Err(e) => Err(e),
    }
}
