//! The server-side authentication state machine, driven message-by-message
//! by the connection driver exactly the way `gel-auth`'s
//! `server_state_machine.rs` drives its own `ServerAuth`: one `Initial`
//! drive to kick things off, then one `Message` drive per SASL message
//! received, until a terminal [`ServerAuthResponse`].

use crate::scram;
use crate::{AuthType, CredentialData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum ServerAuthError {
    #[display("invalid authorization specification")]
    InvalidAuthorizationSpecification,
    #[display("invalid password")]
    InvalidPassword,
    #[display("invalid SASL message")]
    InvalidSaslMessage,
    #[display("unsupported authentication type")]
    UnsupportedAuthType,
    #[display("message received out of order")]
    InvalidMessageType,
}

#[derive(Debug)]
pub enum ServerAuthDrive<'a> {
    Initial,
    Message(AuthType, &'a [u8]),
}

#[derive(Debug)]
pub enum ServerAuthResponse {
    /// Authentication requires a challenge of the given type; payload is
    /// the method list encoded for `AuthenticationRequiredSASLMessage`.
    Initial(AuthType, Vec<u8>),
    /// One more round-trip is needed; payload is the SASL-continue data.
    Continue(Vec<u8>),
    /// Authentication succeeded; payload is the SASL-final data (empty for
    /// Trust).
    Complete(Vec<u8>),
    Error(ServerAuthError),
}

#[derive(Debug)]
enum State {
    Start,
    WaitingClientFirst,
    WaitingClientFinal {
        client_first_bare: String,
        combined_nonce: String,
        server_first: String,
    },
    Done,
}

/// Drives one user's authentication to completion. Constructed fresh per
/// connection once the handshake's `user` parameter is known.
#[derive(Debug)]
pub struct ServerAuth {
    username: String,
    credential: CredentialData,
    state: State,
}

impl ServerAuth {
    pub fn new(username: String, _requested: AuthType, credential: CredentialData) -> Self {
        ServerAuth {
            username,
            credential,
            state: State::Start,
        }
    }

    /// Whether the next expected client message is the SASL *initial*
    /// response (`true`) or a SASL continuation response (`false`).
    pub fn is_initial_message(&self) -> bool {
        matches!(self.state, State::WaitingClientFirst)
    }

    fn stored_key(&self) -> (scram::StoredKey, bool) {
        match &self.credential {
            CredentialData::Scram(key) => (key.clone(), false),
            CredentialData::Trust | CredentialData::Deny => {
                (scram::StoredKey::mock(self.username.as_bytes(), &self.username), true)
            }
        }
    }

    pub fn drive(&mut self, drive: ServerAuthDrive) -> ServerAuthResponse {
        match (&self.state, drive) {
            (State::Start, ServerAuthDrive::Initial) => match self.credential.auth_type() {
                AuthType::Trust => {
                    self.state = State::Done;
                    ServerAuthResponse::Complete(Vec::new())
                }
                AuthType::ScramSha256 | AuthType::Deny => {
                    self.state = State::WaitingClientFirst;
                    ServerAuthResponse::Initial(AuthType::ScramSha256, Vec::new())
                }
            },
            (State::WaitingClientFirst, ServerAuthDrive::Message(AuthType::ScramSha256, data)) => {
                let text = match std::str::from_utf8(data) {
                    Ok(t) => t,
                    Err(_) => return ServerAuthResponse::Error(ServerAuthError::InvalidSaslMessage),
                };
                let parsed = match scram::parse_client_first(text) {
                    Ok(p) => p,
                    Err(_) => return ServerAuthResponse::Error(ServerAuthError::InvalidSaslMessage),
                };
                let (stored, _mock) = self.stored_key();
                let server_nonce = scram::random_nonce();
                let combined_nonce = format!("{}{}", parsed.client_nonce, server_nonce);
                let server_first =
                    scram::server_first_message(&combined_nonce, &stored.salt, stored.iterations);
                self.state = State::WaitingClientFinal {
                    client_first_bare: parsed.bare,
                    combined_nonce,
                    server_first: server_first.clone(),
                };
                ServerAuthResponse::Continue(server_first.into_bytes())
            }
            (
                State::WaitingClientFinal {
                    client_first_bare,
                    combined_nonce,
                    server_first,
                },
                ServerAuthDrive::Message(AuthType::ScramSha256, data),
            ) => {
                let text = match std::str::from_utf8(data) {
                    Ok(t) => t,
                    Err(_) => return ServerAuthResponse::Error(ServerAuthError::InvalidSaslMessage),
                };
                let parsed = match scram::parse_client_final(text) {
                    Ok(p) => p,
                    Err(_) => return ServerAuthResponse::Error(ServerAuthError::InvalidSaslMessage),
                };
                if parsed.nonce != *combined_nonce {
                    return ServerAuthResponse::Error(ServerAuthError::InvalidSaslMessage);
                }
                let (stored, is_mock) = self.stored_key();
                let auth_message =
                    format!("{client_first_bare},{server_first},{}", parsed.without_proof);
                let verified = scram::verify_client_proof(&stored, &auth_message, &parsed.proof);
                if is_mock || !verified {
                    return ServerAuthResponse::Error(ServerAuthError::InvalidPassword);
                }
                let final_message = scram::server_final_message(&stored, &auth_message);
                self.state = State::Done;
                ServerAuthResponse::Complete(final_message.into_bytes())
            }
            (_, ServerAuthDrive::Message(AuthType::Trust | AuthType::Deny, _)) => {
                ServerAuthResponse::Error(ServerAuthError::UnsupportedAuthType)
            }
            _ => ServerAuthResponse::Error(ServerAuthError::InvalidMessageType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scram::StoredKey;

    #[test]
    fn trust_completes_immediately() {
        let mut auth = ServerAuth::new("alice".into(), AuthType::Trust, CredentialData::Trust);
        match auth.drive(ServerAuthDrive::Initial) {
            ServerAuthResponse::Complete(data) => assert!(data.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn scram_round_trip_succeeds() {
        let password = b"s3cret";
        let salt = [3u8; 16];
        let key = StoredKey::generate(password, &salt, 4096);
        let mut auth = ServerAuth::new(
            "alice".into(),
            AuthType::ScramSha256,
            CredentialData::Scram(key),
        );
        assert!(matches!(
            auth.drive(ServerAuthDrive::Initial),
            ServerAuthResponse::Initial(AuthType::ScramSha256, _)
        ));
        assert!(auth.is_initial_message());

        let client_nonce = "abc123";
        let client_first_bare = format!("n=,r={client_nonce}");
        let msg = format!("n,,{client_first_bare}");
        let response = auth.drive(ServerAuthDrive::Message(AuthType::ScramSha256, msg.as_bytes()));
        let server_first = match response {
            ServerAuthResponse::Continue(data) => String::from_utf8(data).unwrap(),
            other => panic!("unexpected response: {other:?}"),
        };
        assert!(!auth.is_initial_message());

        let mut combined_nonce = None;
        let mut salt_b64 = None;
        for part in server_first.split(',') {
            if let Some(n) = part.strip_prefix("r=") {
                combined_nonce = Some(n.to_owned());
            } else if let Some(s) = part.strip_prefix("s=") {
                salt_b64 = Some(s.to_owned());
            }
        }
        let combined_nonce = combined_nonce.unwrap();
        use base64::Engine;
        let salt_bytes = base64::engine::general_purpose::STANDARD
            .decode(salt_b64.unwrap())
            .unwrap();
        assert_eq!(salt_bytes, salt);

        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        // Re-derive the client proof exactly as a real client would.
        let stored_for_proof = StoredKey::generate(password, &salt, 4096);
        let client_key = {
            use hmac::{Hmac, Mac};
            use sha2::Sha256;
            fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
                fn hmac_raw(key: &[u8], data: &[u8]) -> [u8; 32] {
                    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
                    mac.update(data);
                    mac.finalize().into_bytes().into()
                }
                let mut u = hmac_raw(password, &[salt, &1u32.to_be_bytes()].concat());
                let mut result = u;
                for _ in 1..iterations {
                    u = hmac_raw(password, &u);
                    for i in 0..32 {
                        result[i] ^= u[i];
                    }
                }
                result
            }
            let salted = hi(password, &salt, 4096);
            let mut mac = Hmac::<Sha256>::new_from_slice(&salted).unwrap();
            mac.update(b"Client Key");
            let ck: [u8; 32] = mac.finalize().into_bytes().into();
            ck
        };
        let client_signature = {
            use hmac::{Hmac, Mac};
            let mut mac = Hmac::<sha2::Sha256>::new_from_slice(&stored_for_proof.stored_key).unwrap();
            mac.update(auth_message.as_bytes());
            let sig: [u8; 32] = mac.finalize().into_bytes().into();
            sig
        };
        let mut proof = [0u8; 32];
        for i in 0..32 {
            proof[i] = client_key[i] ^ client_signature[i];
        }
        let proof_b64 = base64::engine::general_purpose::STANDARD.encode(proof);
        let final_msg = format!("{client_final_without_proof},p={proof_b64}");

        let response = auth.drive(ServerAuthDrive::Message(AuthType::ScramSha256, final_msg.as_bytes()));
        assert!(matches!(response, ServerAuthResponse::Complete(_)));
    }

    #[test]
    fn unknown_user_is_rejected_like_wrong_password() {
        let mut auth = ServerAuth::new("ghost".into(), AuthType::Deny, CredentialData::Deny);
        auth.drive(ServerAuthDrive::Initial);
        let msg = "n,,n=,r=whatever";
        let response = auth.drive(ServerAuthDrive::Message(AuthType::ScramSha256, msg.as_bytes()));
        assert!(matches!(response, ServerAuthResponse::Continue(_)));
        use base64::Engine;
        let zero_proof = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        let final_msg = format!("c=biws,r=whatever,p={zero_proof}");
        let response = auth.drive(ServerAuthDrive::Message(
            AuthType::ScramSha256,
            final_msg.as_bytes(),
        ));
        assert!(matches!(response, ServerAuthResponse::Error(ServerAuthError::InvalidPassword)));
    }
}
