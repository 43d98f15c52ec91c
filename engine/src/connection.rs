//! The per-connection protocol state machine (spec section 4.2): handshake,
//! version negotiation, authentication, the ready/in-tx/in-tx-error loop,
//! dump/restore sub-states, and the error-recovery-to-`Sync` loop. Modeled
//! on `gel-auth`'s `ServerState::drive` dispatch-by-state pattern, widened
//! to the full connection lifecycle rather than just the handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use db_auth::handshake::{ServerAuth, ServerAuthDrive, ServerAuthResponse};
use db_auth::{AuthType, CredentialData};
use db_wire::client_message::{tag as ctag, ClientMessage};
use db_wire::error::EdbError;
use db_wire::server_message::{
    Authentication, ErrorResponse, ErrorSeverity, KeyData, NegotiateProtocolVersion,
    ReadyForCommand, ServerMessage, ServerStatus, StateDataDescription, TransactionState,
    ERROR_FIELD_SERVER_TRACEBACK,
};

use crate::error::ConnectionError;
use crate::session::SessionView;

pub const SUPPORTED_MAJOR_MIN: u16 = 1;
pub const SUPPORTED_MAJOR_MAX: u16 = 3;

/// Connection phases (spec section 4.2). `InTx`/`InTxError` are reachable
/// only from `Ready` and always return to it; `Dumping`/`Restoring` are
/// likewise `Ready`-only excursions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Handshake,
    Auth,
    Ready,
    InTx,
    InTxError,
    Dumping,
    Restoring,
    Closing,
    Bad,
}

/// Looked up from server policy given a username; stands in for the
/// external user-catalog lookup (out of scope per spec).
pub trait AuthPolicy: Send + Sync {
    fn credential_for(&self, username: &str) -> (AuthType, CredentialData);
}

/// A cooperatively-cancellable flag, set by the listener when the transport
/// is lost mid-operation (spec section 5, "Cancellation semantics"). The
/// connection task checks it at every suspension point and never cancels
/// itself preemptively.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives the per-connection phase transitions and authentication exchange.
/// Parse/Execute/Sync/Dump/Restore content handling lives in `dispatcher`,
/// `dump`, and `restore`; this struct owns only the lifecycle envelope and
/// the idle/cancellation bookkeeping that wraps them (spec section 5).
pub struct Connection<V: SessionView> {
    pub phase: Phase,
    pub view: V,
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub username: String,
    pub cancel: CancelFlag,
    pub last_idle_at: Option<Instant>,
    auth: Option<ServerAuth>,
    advertised_state_id: uuid::Uuid,
    in_recovery: bool,
    /// The most recently compiled anonymous (unnamed) query, kept so a
    /// Parse immediately followed by an Execute with a matching request
    /// hash and type ids skips recompilation (spec section 8).
    pub last_anon: Option<LastAnonCompile>,
}

/// See [`Connection::last_anon`].
#[derive(Debug, Clone)]
pub struct LastAnonCompile {
    pub request_hash: u64,
    pub input_type_id: uuid::Uuid,
    pub output_type_id: uuid::Uuid,
    pub units: crate::compile::UnitGroup,
}

impl<V: SessionView> Connection<V> {
    pub fn new(view: V, cancel: CancelFlag) -> Self {
        Connection {
            phase: Phase::New,
            view,
            protocol_major: 0,
            protocol_minor: 0,
            username: String::new(),
            cancel,
            last_idle_at: None,
            auth: None,
            advertised_state_id: uuid::Uuid::nil(),
            in_recovery: false,
            last_anon: None,
        }
    }

    pub fn advertised_state_id(&self) -> uuid::Uuid {
        self.advertised_state_id
    }

    pub fn set_advertised_state_id(&mut self, id: uuid::Uuid) {
        self.advertised_state_id = id;
    }

    /// Called by the listener before each `wait_for_message` (spec section
    /// 4.2, "Idle tracking"). Dump/restore phases are excluded from idle
    /// classification.
    pub fn mark_idle(&mut self) {
        if !matches!(self.phase, Phase::Dumping | Phase::Restoring) {
            self.last_idle_at = Some(Instant::now());
        }
    }

    pub fn is_bad(&self) -> bool {
        self.phase == Phase::Bad
    }

    /// Negotiates the protocol version against the client's requested
    /// `(major, minor)`, clamping to the server's supported bounds (spec
    /// section 4.2, "Version negotiation").
    fn negotiate_version(&mut self, major: u16, minor: u16) -> Option<ServerMessage> {
        self.protocol_major = major.clamp(SUPPORTED_MAJOR_MIN, SUPPORTED_MAJOR_MAX);
        self.protocol_minor = if self.protocol_major == major { minor } else { 0 };
        if self.protocol_major != major || self.protocol_minor != minor {
            Some(ServerMessage::NegotiateProtocolVersion(NegotiateProtocolVersion {
                major_ver: self.protocol_major,
                minor_ver: self.protocol_minor,
            }))
        } else {
            None
        }
    }

    /// Processes one already-framed, already-tag-dispatched client message
    /// while in `New`/`Handshake`/`Auth` phase. Returns the messages to
    /// write back. `Ready`-phase dispatch is handled by the caller via
    /// `dispatcher::dispatch`, since it needs the compiler/backend seams
    /// this struct doesn't own.
    pub fn drive_handshake(
        &mut self,
        policy: &dyn AuthPolicy,
        tag: u8,
        payload: &[u8],
    ) -> Result<Vec<ServerMessage>, ConnectionError> {
        let mut out = Vec::new();
        match (self.phase, tag) {
            (Phase::New, ctag::CLIENT_HANDSHAKE) | (Phase::Handshake, ctag::CLIENT_HANDSHAKE) => {
                let handshake = match ClientMessage::decode(tag, payload) {
                    Ok(m) => m,
                    Err(e) => return Err(self.fail(EdbError::from(e))),
                };
                let handshake = match handshake {
                    ClientMessage::ClientHandshake(h) => h,
                    _ => unreachable!(),
                };
                if let Some(negotiate) = self.negotiate_version(handshake.major_ver, handshake.minor_ver) {
                    out.push(negotiate);
                }
                let mut user = String::new();
                for (k, v) in &handshake.params {
                    if k == "user" {
                        user = v.clone();
                    }
                }
                if user.is_empty() {
                    return Err(self.fail(EdbError::AuthenticationError));
                }
                self.username = user;
                let (auth_type, credential) = policy.credential_for(&self.username);
                let mut auth = ServerAuth::new(self.username.clone(), auth_type, credential);
                match auth.drive(ServerAuthDrive::Initial) {
                    ServerAuthResponse::Initial(AuthType::ScramSha256, _) => {
                        out.push(ServerMessage::Authentication(Authentication::SaslInitial {
                            methods: vec!["SCRAM-SHA-256".into()],
                        }));
                        self.auth = Some(auth);
                        self.phase = Phase::Auth;
                    }
                    ServerAuthResponse::Complete(_) => {
                        out.extend(self.finish_auth());
                    }
                    ServerAuthResponse::Error(_) => {
                        return Err(self.fail(EdbError::AuthenticationError));
                    }
                    _ => return Err(self.fail(EdbError::ProtocolError)),
                }
                Ok(out)
            }
            (Phase::Auth, ctag::SASL_INITIAL_RESPONSE) | (Phase::Auth, ctag::SASL_RESPONSE) => {
                let message = match ClientMessage::decode(tag, payload) {
                    Ok(m) => m,
                    Err(e) => return Err(self.fail(EdbError::from(e))),
                };
                let sasl_data = match message {
                    ClientMessage::SaslInitialResponse(m) => m.sasl_data,
                    ClientMessage::SaslResponse(m) => m.sasl_data,
                    _ => unreachable!(),
                };
                let response = match self.auth.as_mut() {
                    Some(auth) => auth.drive(ServerAuthDrive::Message(AuthType::ScramSha256, &sasl_data)),
                    None => return Err(self.fail(EdbError::ProtocolError)),
                };
                match response {
                    ServerAuthResponse::Continue(data) => {
                        out.push(ServerMessage::Authentication(Authentication::SaslContinue {
                            sasl_data: data,
                        }));
                        Ok(out)
                    }
                    ServerAuthResponse::Complete(data) => {
                        out.push(ServerMessage::Authentication(Authentication::SaslFinal {
                            sasl_data: data,
                        }));
                        out.extend(self.finish_auth());
                        Ok(out)
                    }
                    ServerAuthResponse::Error(_) => Err(self.fail(EdbError::AuthenticationError)),
                    _ => Err(self.fail(EdbError::ProtocolError)),
                }
            }
            (Phase::New, _) | (Phase::Handshake, _) => Err(self.fail(EdbError::ProtocolError)),
            _ => Err(self.fail(EdbError::ProtocolError)),
        }
    }

    fn finish_auth(&mut self) -> Vec<ServerMessage> {
        self.phase = Phase::Ready;
        self.auth = None;
        let state = self.view.describe_state();
        self.advertised_state_id = state.typedesc_id;
        vec![
            ServerMessage::Authentication(Authentication::Ok),
            ServerMessage::KeyData(KeyData { data: [0u8; 32] }),
            ServerMessage::StateDataDescription(StateDataDescription {
                typedesc_id: state.typedesc_id,
                data: state.data,
            }),
            ServerMessage::ServerStatus(ServerStatus {
                name: "suggested_pool_concurrency".into(),
                value: bytes::Bytes::from_static(b"1"),
            }),
            self.ready_for_command(),
        ]
    }

    /// Builds the `ReadyForCommand` message reflecting the view's current
    /// transaction state (spec section 4.2/4.4, `I`/`T`/`E`).
    pub fn ready_for_command(&self) -> ServerMessage {
        let state = if self.view.in_tx_error() {
            TransactionState::InTransactionError
        } else if self.view.in_tx() {
            TransactionState::InTransaction
        } else {
            TransactionState::Idle
        };
        ServerMessage::ReadyForCommand(ReadyForCommand { transaction_state: state })
    }

    /// Refreshes `phase` from the view's transaction bookkeeping after a
    /// dispatcher step (spec section 4.2: `READY <-> IN_TX`, `READY <-> IN_TX_ERROR`).
    pub fn sync_phase_with_view(&mut self) {
        if matches!(self.phase, Phase::Ready | Phase::InTx | Phase::InTxError) {
            self.phase = if self.view.in_tx_error() {
                Phase::InTxError
            } else if self.view.in_tx() {
                Phase::InTx
            } else {
                Phase::Ready
            };
        }
    }

    pub fn enter_dumping(&mut self) {
        self.phase = Phase::Dumping;
    }

    pub fn enter_restoring(&mut self) {
        self.phase = Phase::Restoring;
    }

    pub fn leave_streaming(&mut self) {
        self.sync_phase_with_view();
    }

    pub fn terminate(&mut self) {
        self.phase = Phase::Closing;
    }

    /// Marks the connection unrecoverable and returns the error, for use as
    /// `return Err(self.fail(...))`.
    fn fail(&mut self, error: EdbError) -> ConnectionError {
        self.phase = Phase::Bad;
        ConnectionError::Protocol(error)
    }

    /// The error-recovery loop (spec section 4.2, "Error recovery" and
    /// section 9, "small sub-state-machine"): call once a handler has
    /// raised, then repeatedly feed it incoming `(tag, payload)` pairs.
    /// Returns `Some(ready_message)` once a `Sync` has been consumed.
    pub fn recover_step(&mut self, tag: u8, _payload: &[u8]) -> Option<ServerMessage> {
        self.in_recovery = true;
        if tag == ctag::SYNC {
            self.in_recovery = false;
            self.sync_phase_with_view();
            Some(self.ready_for_command())
        } else {
            trace!(tag, "discarding message during error recovery");
            None
        }
    }

    pub fn in_recovery(&self) -> bool {
        self.in_recovery
    }

    /// Begins error recovery after a handler raised (spec section 4.2):
    /// marks the view in-tx-error (if inside a transaction) and returns the
    /// error message to send before entering the discard-until-Sync loop.
    pub fn begin_error_recovery(&mut self, error: EdbError) -> ServerMessage {
        self.view.raise_in_tx_error();
        self.sync_phase_with_view();
        self.in_recovery = true;
        error_response(error, error.to_string())
    }
}

/// Builds a well-formed `ErrorResponse`, always including the server
/// traceback field (spec section 6, "Error message fields... always
/// includes a server traceback field").
pub fn error_response(code: EdbError, message: impl Into<String>) -> ServerMessage {
    ServerMessage::ErrorResponse(ErrorResponse {
        severity: ErrorSeverity::Error,
        code: code.code(),
        message: message.into(),
        fields: vec![(ERROR_FIELD_SERVER_TRACEBACK, String::new())],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionView;
    use db_auth::CredentialData;

    struct TrustPolicy;
    impl AuthPolicy for TrustPolicy {
        fn credential_for(&self, _username: &str) -> (AuthType, CredentialData) {
            (AuthType::Trust, CredentialData::Trust)
        }
    }

    fn handshake_payload(user: &str) -> bytes::Bytes {
        use bytes::{BufMut, BytesMut};
        let mut b = BytesMut::new();
        b.put_u16(3);
        b.put_u16(0);
        b.put_u16(1);
        b.put_u16(4);
        b.put_slice(b"user");
        b.put_u16(user.len() as u16);
        b.put_slice(user.as_bytes());
        b.put_u16(0);
        b.freeze()
    }

    #[test]
    fn trust_handshake_reaches_ready() {
        let mut conn = Connection::new(InMemorySessionView::new("test"), CancelFlag::new());
        let policy = TrustPolicy;
        let payload = handshake_payload("alice");
        let out = conn
            .drive_handshake(&policy, ctag::CLIENT_HANDSHAKE, &payload)
            .unwrap();
        assert_eq!(conn.phase, Phase::Ready);
        assert!(matches!(out[0], ServerMessage::Authentication(Authentication::Ok)));
    }

    #[test]
    fn empty_username_is_rejected() {
        let mut conn = Connection::new(InMemorySessionView::new("test"), CancelFlag::new());
        let policy = TrustPolicy;
        let payload = handshake_payload("");
        let err = conn.drive_handshake(&policy, ctag::CLIENT_HANDSHAKE, &payload);
        assert!(err.is_err());
        assert_eq!(conn.phase, Phase::Bad);
    }
}
