//! Authentication for the binary frontend protocol: policy types, the
//! SCRAM-SHA-256 exchange, and the server-side [`handshake::ServerAuth`]
//! state machine that the connection driver advances message by message.

pub mod handshake;
pub mod scram;

/// The three methods recognized by this engine (spec section 4.3). Bearer
/// token validation is dispatched separately, via [`db_jwt`], since it is
/// driven by the `Authorization` header / handshake secret rather than a
/// SASL round-trip.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum AuthType {
    /// Unconditionally denies, used to emulate a rejection with the same
    /// shape/timing as a real failure (anti user-enumeration, spec section
    /// 4.3's "mock verifier").
    #[default]
    Deny,
    /// Unconditionally trusts: the user must exist in the roles map, no
    /// challenge follows.
    Trust,
    /// SCRAM-SHA-256, RFC 5802.
    ScramSha256,
}

#[derive(derive_more::Debug, Clone)]
pub enum CredentialData {
    Trust,
    Deny,
    #[debug("Scram(...)")]
    Scram(scram::StoredKey),
}

impl CredentialData {
    pub fn new_scram(password: &[u8]) -> Self {
        let salt: [u8; 32] = rand::random();
        CredentialData::Scram(scram::StoredKey::generate(password, &salt, 4096))
    }

    pub fn auth_type(&self) -> AuthType {
        match self {
            CredentialData::Trust => AuthType::Trust,
            CredentialData::Deny => AuthType::Deny,
            CredentialData::Scram(..) => AuthType::ScramSha256,
        }
    }
}
