//! Minimal, read-only JWT decoding.
//!
//! This client never verifies a signature — it only ever consumes a token a
//! server already issued, so the boundary here is narrow on purpose: split
//! the compact form, base64url-decode the header and payload segments, and
//! parse them as JSON. Anything that needs to mint or verify a signature
//! lives in [`crate::signing`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token does not have three dot-separated segments")]
    Malformed,
    #[error("failed to base64url-decode token segment: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("failed to parse token segment as JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub alg: String,
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub header: Header,
    pub payload: Payload,
}

/// Splits and decodes `raw` without checking its signature.
pub fn decode_unverified(raw: &str) -> Result<DecodedToken, JwtError> {
    let mut segments = raw.split('.');
    let (Some(header_b64), Some(payload_b64), Some(_signature_b64), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(JwtError::Malformed);
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_b64)?;
    let payload_bytes = URL_SAFE_NO_PAD.decode(payload_b64)?;

    let header: Header = serde_json::from_slice(&header_bytes)?;
    let payload: Payload = serde_json::from_slice(&payload_bytes)?;

    Ok(DecodedToken { header, payload })
}
