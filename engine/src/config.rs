//! Pluggable listener configuration (spec section 4.3/4.8's ambient
//! surroundings), grounded in `gel-frontend`'s `ListenerConfig`/`TenantConfig`
//! split, but without TLS termination, HTTP transport, or tenant routing by
//! name — this engine only ever serves one tenant over a plain stream.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::AuthPolicy;

/// Authentication policy plus the knobs that shape how a connection behaves
/// once past the handshake (spec section 4.2's idle tracking, section 4.6's
/// dump queue).
pub trait ListenerConfig: std::fmt::Debug + Send + Sync + 'static {
    fn listen_addr(&self) -> SocketAddr;

    /// Returns the credential lookup used to answer SASL/Trust handshakes
    /// (spec section 4.3).
    fn auth_policy(&self) -> &dyn AuthPolicy;

    /// How long a connection may sit idle (outside dump/restore) before the
    /// listener closes it with `IdleSessionTimeoutError` (spec section 4.2,
    /// "Idle tracking").
    fn idle_timeout(&self) -> Duration;

    /// Depth of the dump streamer's output prefetch buffer (spec section
    /// 4.6 step 5, "a shared bounded output queue (capacity 2)").
    fn dump_queue_capacity(&self) -> usize {
        2
    }

    /// Bytes buffered in the outgoing [`db_wire::frame::FrameWriter`] before
    /// a streaming loop forces a drain to the transport, independent of any
    /// explicit `Flush` request (spec section 4.4, `Flush` handling; section
    /// 4.6 step 5's block-by-block drain).
    fn flush_threshold(&self) -> usize {
        db_wire::frame::FLUSH_THRESHOLD
    }
}

/// A fixed-at-startup [`ListenerConfig`], sufficient for tests and simple
/// single-tenant deployments (no hot-reload of listen address or policy).
pub struct StaticConfig {
    pub listen_addr: SocketAddr,
    pub auth_policy: Box<dyn AuthPolicy>,
    pub idle_timeout: Duration,
    pub dump_queue_capacity: usize,
    pub flush_threshold: usize,
}

impl std::fmt::Debug for StaticConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticConfig")
            .field("listen_addr", &self.listen_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("dump_queue_capacity", &self.dump_queue_capacity)
            .field("flush_threshold", &self.flush_threshold)
            .finish_non_exhaustive()
    }
}

impl StaticConfig {
    pub fn new(listen_addr: SocketAddr, auth_policy: Box<dyn AuthPolicy>) -> Self {
        StaticConfig {
            listen_addr,
            auth_policy,
            idle_timeout: Duration::from_secs(60),
            dump_queue_capacity: 2,
            flush_threshold: db_wire::frame::FLUSH_THRESHOLD,
        }
    }
}

impl ListenerConfig for StaticConfig {
    fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn auth_policy(&self) -> &dyn AuthPolicy {
        self.auth_policy.as_ref()
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn dump_queue_capacity(&self) -> usize {
        self.dump_queue_capacity
    }

    fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AuthPolicy;
    use db_auth::{AuthType, CredentialData};

    struct TrustEverything;
    impl AuthPolicy for TrustEverything {
        fn credential_for(&self, _username: &str) -> (AuthType, CredentialData) {
            (AuthType::Trust, CredentialData::Trust)
        }
    }

    #[test]
    fn static_config_defaults_match_spec_knobs() {
        let cfg = StaticConfig::new("127.0.0.1:5656".parse().unwrap(), Box::new(TrustEverything));
        assert_eq!(cfg.dump_queue_capacity(), 2);
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(60));
    }
}
