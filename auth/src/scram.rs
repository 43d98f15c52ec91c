//! SCRAM-SHA-256 (RFC 5802) mechanics: salted-password derivation, the
//! client-first/server-first/client-final message grammar, and proof
//! verification. Driven by [`crate::handshake::ServerAuth`].

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn h(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor32(a: [u8; 32], b: [u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// `Hi(password, salt, iterations)` from RFC 5802: PBKDF2-HMAC-SHA256 with
/// `dkLen = 32`.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut u = hmac(password, &[salt, &1u32.to_be_bytes()].concat());
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u);
        result = xor32(result, u);
    }
    result
}

/// What the server stores (or synthesizes) for a user: enough to verify a
/// client proof, never the password itself.
#[derive(Clone)]
pub struct StoredKey {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey").finish_non_exhaustive()
    }
}

impl StoredKey {
    pub fn generate(password: &[u8], salt: &[u8], iterations: u32) -> Self {
        let salted_password = hi(password, salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = h(&client_key);
        let server_key = hmac(&salted_password, b"Server Key");
        StoredKey {
            salt: salt.to_vec(),
            iterations,
            stored_key,
            server_key,
        }
    }

    /// A deterministic-but-unusable verifier synthesized from the user name
    /// and a server-side seed, so that authenticating against an unknown
    /// user takes the same code path (and, ideally, similar time) as a
    /// known user with a wrong password (spec section 4.3's "mock
    /// verifier").
    pub fn mock(server_nonce_seed: &[u8], username: &str) -> Self {
        let seed = h(&[server_nonce_seed, username.as_bytes()].concat());
        Self::generate(&seed, &seed[..16], 4096)
    }

    fn verify(&self, client_proof: &[u8; 32], auth_message: &str) -> bool {
        let client_signature = hmac(&self.stored_key, auth_message.as_bytes());
        let client_key = xor32(*client_proof, client_signature);
        let derived_stored_key = h(&client_key);
        use subtle::ConstantTimeEq;
        derived_stored_key.ct_eq(&self.stored_key).into()
    }

    pub fn server_signature(&self, auth_message: &str) -> [u8; 32] {
        hmac(&self.server_key, auth_message.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum ScramError {
    #[display("malformed SCRAM message: {_0}")]
    Malformed(String),
    #[display("unsupported channel binding")]
    UnsupportedChannelBinding,
    #[display("SASL authzid is not supported")]
    AuthzidNotSupported,
}

pub struct ClientFirst {
    pub client_nonce: String,
    /// The `n=...,r=...` portion, needed verbatim to build the auth message.
    pub bare: String,
}

/// Parses `gs2-header "n=" username "," "r=" nonce` (spec section 4.3 step
/// 3). The username is parsed but ignored — the server already knows the
/// user from the handshake.
pub fn parse_client_first(msg: &str) -> Result<ClientFirst, ScramError> {
    let mut rest = msg;
    let cbind_flag = rest
        .chars()
        .next()
        .ok_or_else(|| ScramError::Malformed("empty message".into()))?;
    match cbind_flag {
        'n' | 'y' => {}
        'p' => return Err(ScramError::UnsupportedChannelBinding),
        _ => return Err(ScramError::Malformed("bad gs2 cbind flag".into())),
    }
    let comma = rest
        .find(',')
        .ok_or_else(|| ScramError::Malformed("missing gs2 header comma".into()))?;
    rest = &rest[comma + 1..];
    let comma = rest
        .find(',')
        .ok_or_else(|| ScramError::Malformed("missing authzid comma".into()))?;
    let authzid = &rest[..comma];
    if !authzid.is_empty() {
        return Err(ScramError::AuthzidNotSupported);
    }
    let bare_start = comma + 1;
    let bare = rest[bare_start..].to_owned();

    let mut client_nonce = None;
    for part in bare.split(',') {
        if let Some(n) = part.strip_prefix("r=") {
            client_nonce = Some(n.to_owned());
        }
    }
    Ok(ClientFirst {
        client_nonce: client_nonce
            .ok_or_else(|| ScramError::Malformed("missing client nonce".into()))?,
        bare,
    })
}

pub fn server_first_message(combined_nonce: &str, salt: &[u8], iterations: u32) -> String {
    let salt_b64 = base64::engine::general_purpose::STANDARD.encode(salt);
    format!("r={combined_nonce},s={salt_b64},i={iterations}")
}

pub struct ClientFinal {
    pub channel_binding: String,
    pub nonce: String,
    pub proof: [u8; 32],
    /// The message with `,p=...` stripped, needed to recompute the auth
    /// message on the server side.
    pub without_proof: String,
}

pub fn parse_client_final(msg: &str) -> Result<ClientFinal, ScramError> {
    let p_pos = msg
        .rfind(",p=")
        .ok_or_else(|| ScramError::Malformed("missing proof".into()))?;
    let without_proof = msg[..p_pos].to_owned();
    let proof_b64 = &msg[p_pos + 3..];
    let proof_bytes = base64::engine::general_purpose::STANDARD
        .decode(proof_b64)
        .map_err(|_| ScramError::Malformed("bad proof base64".into()))?;
    if proof_bytes.len() != 32 {
        return Err(ScramError::Malformed("proof must be 32 bytes".into()));
    }
    let mut proof = [0u8; 32];
    proof.copy_from_slice(&proof_bytes);

    let mut channel_binding = None;
    let mut nonce = None;
    for part in without_proof.split(',') {
        if let Some(c) = part.strip_prefix("c=") {
            channel_binding = Some(c.to_owned());
        } else if let Some(n) = part.strip_prefix("r=") {
            nonce = Some(n.to_owned());
        }
    }
    let channel_binding =
        channel_binding.ok_or_else(|| ScramError::Malformed("missing c=".into()))?;
    // "biws" = base64("n,,"), "eSws" = base64("y,,"): no channel binding
    // applied on either side (spec section 4.3 step 5).
    if channel_binding != "biws" && channel_binding != "eSws" {
        return Err(ScramError::UnsupportedChannelBinding);
    }
    Ok(ClientFinal {
        channel_binding,
        nonce: nonce.ok_or_else(|| ScramError::Malformed("missing r=".into()))?,
        proof,
        without_proof,
    })
}

pub fn verify_client_proof(stored: &StoredKey, auth_message: &str, proof: &[u8; 32]) -> bool {
    stored.verify(proof, auth_message)
}

pub fn server_final_message(stored: &StoredKey, auth_message: &str) -> String {
    let sig = stored.server_signature(auth_message);
    format!(
        "v={}",
        base64::engine::general_purpose::STANDARD.encode(sig)
    )
}

pub fn random_nonce() -> String {
    let bytes: [u8; 18] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_exchange_succeeds_with_correct_password() {
        let salt = [7u8; 16];
        let stored = StoredKey::generate(b"hunter2", &salt, 4096);

        let client_nonce = "clientnonce";
        let client_first_bare = format!("n=,r={client_nonce}");
        let parsed_first = parse_client_first(&format!("n,,{client_first_bare}")).unwrap();
        assert_eq!(parsed_first.client_nonce, client_nonce);

        let server_nonce = "servernonce";
        let combined_nonce = format!("{client_nonce}{server_nonce}");
        let server_first = server_first_message(&combined_nonce, &stored.salt, stored.iterations);

        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message =
            format!("{},{},{}", parsed_first.bare, server_first, client_final_without_proof);

        let salted_password = hi(b"hunter2", &salt, 4096);
        let client_key = hmac(&salted_password, b"Client Key");
        let client_signature = hmac(&stored.stored_key, auth_message.as_bytes());
        let proof = xor32(client_key, client_signature);
        let proof_b64 = base64::engine::general_purpose::STANDARD.encode(proof);
        let client_final_msg = format!("{client_final_without_proof},p={proof_b64}");

        let parsed_final = parse_client_final(&client_final_msg).unwrap();
        assert!(verify_client_proof(&stored, &auth_message, &parsed_final.proof));

        let bad_proof = [0u8; 32];
        assert!(!verify_client_proof(&stored, &auth_message, &bad_proof));
    }

    #[test]
    fn mock_verifier_never_matches_real_proof() {
        let stored = StoredKey::generate(b"hunter2", &[1u8; 16], 4096);
        let mock = StoredKey::mock(b"server-seed", "nosuchuser");
        assert_ne!(stored.stored_key, mock.stored_key);
    }

    #[test]
    fn rejects_channel_binding_requested() {
        assert!(matches!(
            parse_client_first("p=tls-server-end-point,,n=,r=x"),
            Err(ScramError::UnsupportedChannelBinding)
        ));
    }

    #[test]
    fn rejects_nonempty_authzid() {
        assert!(matches!(
            parse_client_first("n,someone,n=,r=x"),
            Err(ScramError::AuthzidNotSupported)
        ));
    }
}
