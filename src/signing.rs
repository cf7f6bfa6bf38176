//! Server-side token issuance helpers: `generateToken`, `issueToken`, and
//! `createTokenRequest`.
//!
//! These are never invoked from the reconnect/auth lifecycle a browser-style
//! consumer drives — they exist for the back-end helper that mints tokens
//! other clients present. HMAC-SHA256 is the only scheme the wire format
//! calls for: a token request is a signed
//! `"{kid}.{timestamp}[.{alias}][.{json(permission)}]"` string.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("secret key is not a valid HMAC key")]
    InvalidKey,
}

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SigningError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(&mut out, "{byte:02x}").expect("writing into a String cannot fail");
    }
    out
}

/// Builds the signable string for a token request: `kid.timestamp[.alias][.permission_json]`.
pub fn token_request_message(
    kid: &str,
    timestamp: i64,
    alias: Option<&str>,
    permission: Option<&serde_json::Value>,
) -> String {
    let mut message = format!("{kid}.{timestamp}");
    if let Some(alias) = alias {
        message.push('.');
        message.push_str(alias);
    }
    if let Some(permission) = permission {
        message.push('.');
        message.push_str(&permission.to_string());
    }
    message
}

/// Signs a compact HS256 JWT: `base64url(header).base64url(payload).base64url(hmac)`.
/// The server-side counterpart to [`crate::jwt::decode_unverified`] — this
/// crate's own auth module never calls it, since a client only ever consumes
/// tokens a server mints, but the helper is part of the same signing
/// boundary as [`create_token_request`].
pub fn generate_token(
    secret: &str,
    kid: &str,
    exp: i64,
    alias: Option<&str>,
    permission: Option<&serde_json::Value>,
) -> Result<String, SigningError> {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let header = serde_json::json!({"alg": "HS256", "typ": "JWT", "kid": kid});
    let payload = serde_json::json!({"exp": exp, "alias": alias, "permission": permission});

    let encode = |value: &serde_json::Value| URL_SAFE_NO_PAD.encode(value.to_string());
    let signing_input = format!("{}.{}", encode(&header), encode(&payload));

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SigningError::InvalidKey)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Signs a token request: `{kid, timestamp, signature}`, ready to hand to a
/// client as the `tokenRequest` half of an auth response.
pub fn create_token_request(
    secret: &str,
    kid: &str,
    timestamp: i64,
    alias: Option<&str>,
    permission: Option<&serde_json::Value>,
) -> Result<TokenRequest, SigningError> {
    let message = token_request_message(kid, timestamp, alias, permission);
    let signature = hmac_sha256_hex(secret, &message)?;
    Ok(TokenRequest {
        kid: kid.to_owned(),
        timestamp,
        signature,
        alias: alias.map(str::to_owned),
        permission: permission.cloned(),
    })
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TokenRequest {
    pub kid: String,
    pub timestamp: i64,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic() {
        let a = hmac_sha256_hex("secret", "kid.1700000000").unwrap();
        let b = hmac_sha256_hex("secret", "kid.1700000000").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_messages_sign_differently() {
        let a = hmac_sha256_hex("secret", "kid.1700000000").unwrap();
        let b = hmac_sha256_hex("secret", "kid.1700000001").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn token_request_message_includes_alias_and_permission() {
        let permission = serde_json::json!({"channel": "news"});
        let message = token_request_message("kid", 1700000000, Some("alice"), Some(&permission));
        assert_eq!(message, "kid.1700000000.alice.{\"channel\":\"news\"}");
    }

    #[test]
    fn create_token_request_round_trips_signature() {
        let req = create_token_request("secret", "kid", 1700000000, None, None).unwrap();
        let expected = hmac_sha256_hex("secret", "kid.1700000000").unwrap();
        assert_eq!(req.signature, expected);
    }

    #[test]
    fn generate_token_decodes_with_the_matching_claims() {
        let token = generate_token("secret", "kid-1", 1_700_000_000, Some("alice"), None).unwrap();
        let decoded = crate::jwt::decode_unverified(&token).unwrap();
        assert_eq!(decoded.header.kid.as_deref(), Some("kid-1"));
        assert_eq!(decoded.payload.exp, 1_700_000_000);
        assert_eq!(decoded.payload.alias.as_deref(), Some("alice"));
    }
}
