//! Bearer-token validation (spec section 4.3): the token is a JWE wrapping
//! a JWS. We decrypt the JWE with the server's symmetric key, verify the
//! inner JWS signature, then check claims: `<ns>.any_role` authorizes any
//! role, otherwise `<ns>.roles` must map the requesting user to the
//! password it was issued.
//!
//! Claim shape follows the spirit of `gel-jwt::gel::TokenClaims`
//! (namespaced boolean-or-list claims) but generalizes the namespace and
//! changes `roles` from a membership set to a `{user: password}` map, per
//! spec section 4.3's bearer-token paragraph.

mod jwe;

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

pub use jwe::{JweError, JweKey};

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum TokenValidationError {
    #[display("malformed bearer token")]
    Malformed,
    #[display("token decryption failed")]
    Decryption,
    #[display("token signature verification failed")]
    SignatureInvalid,
    #[display("token does not authorize role {_0}")]
    #[from(ignore)]
    InvalidRole(String),
}

/// Claims extracted from a validated token, namespaced under `ns` (e.g.
/// `"edb"`): `{ns}.any_role: bool`, `{ns}.roles: {user: password}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    pub any_role: bool,
    pub roles: HashMap<String, String>,
    pub issuer: Option<String>,
}

impl TokenClaims {
    /// Check whether this token authorizes `user` with `provided_password`.
    /// A single generic error covers every rejection path, per spec section
    /// 4.3: "Any failure -> authentication error without leaking which step
    /// failed."
    pub fn validate(&self, user: &str, provided_password: &str) -> Result<(), TokenValidationError> {
        if self.any_role {
            return Ok(());
        }
        match self.roles.get(user) {
            Some(password) if password == provided_password => Ok(()),
            _ => Err(TokenValidationError::InvalidRole(user.to_string())),
        }
    }

    fn from_raw(ns: &str, raw: &RawClaims) -> Self {
        let any_role_key = format!("{ns}.any_role");
        let roles_key = format!("{ns}.roles");
        let any_role = raw
            .extra
            .get(&any_role_key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let roles = raw
            .extra
            .get(&roles_key)
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        TokenClaims {
            any_role,
            roles,
            issuer: raw.iss.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: Option<String>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// Holds the two keys needed to validate a bearer token: the symmetric JWE
/// key (decryption) and the JWS verification key (signature). In this
/// engine both are server-generated secrets, not asymmetric key pairs, to
/// keep key management out of scope.
pub struct BearerKeyRegistry {
    pub jwe_key: JweKey,
    pub jws_secret: Vec<u8>,
    pub namespace: String,
}

impl BearerKeyRegistry {
    pub fn new(jwe_key: JweKey, jws_secret: Vec<u8>, namespace: impl Into<String>) -> Self {
        Self {
            jwe_key,
            jws_secret,
            namespace: namespace.into(),
        }
    }

    /// Decrypt the JWE envelope, verify the inner JWS, and extract claims.
    pub fn validate_bearer_token(&self, token: &str) -> Result<TokenClaims, TokenValidationError> {
        let jws_compact = jwe::decrypt_compact(&self.jwe_key, token)
            .map_err(|_| TokenValidationError::Decryption)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let key = DecodingKey::from_secret(&self.jws_secret);
        let decoded = jsonwebtoken::decode::<RawClaims>(&jws_compact, &key, &validation)
            .map_err(|_| TokenValidationError::SignatureInvalid)?;

        Ok(TokenClaims::from_raw(&self.namespace, &decoded.claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    fn sign_jws(secret: &[u8], claims: serde_json::Value) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn any_role_authorizes_everyone() {
        let claims = TokenClaims {
            any_role: true,
            roles: HashMap::new(),
            issuer: None,
        };
        assert!(claims.validate("alice", "whatever").is_ok());
    }

    #[test]
    fn roles_map_requires_matching_password() {
        let mut roles = HashMap::new();
        roles.insert("alice".to_string(), "secretpw".to_string());
        let claims = TokenClaims {
            any_role: false,
            roles,
            issuer: None,
        };
        assert!(claims.validate("alice", "secretpw").is_ok());
        assert!(claims.validate("alice", "wrong").is_err());
        assert!(claims.validate("bob", "secretpw").is_err());
    }

    #[test]
    fn full_round_trip_through_jwe_and_jws() {
        let jwe_key = JweKey::generate();
        let jws_secret = b"jws-secret-key-material".to_vec();
        let registry = BearerKeyRegistry::new(jwe_key.clone(), jws_secret.clone(), "edb".into());

        let jws = sign_jws(
            &jws_secret,
            json!({"iss": "test-issuer", "edb.any_role": true}),
        );
        let token = jwe::encrypt_compact(&jwe_key, &jws);

        let claims = registry.validate_bearer_token(&token).unwrap();
        assert!(claims.any_role);
        assert_eq!(claims.issuer.as_deref(), Some("test-issuer"));
    }
}
