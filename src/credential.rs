//! The two shapes of credential the auth module can hold.

use std::fmt;

use thiserror::Error;

use crate::jwt::{self, DecodedToken, JwtError};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("api key must be formatted as \"id:secret\", got {0:?}")]
    InvalidApiKeyFormat(String),
    #[error(transparent)]
    InvalidToken(#[from] JwtError),
}

#[derive(Clone)]
pub struct ApiKey {
    pub id: String,
    secret: String,
}

impl ApiKey {
    pub fn parse(raw: &str) -> Result<Self, CredentialError> {
        let (id, secret) = raw
            .split_once(':')
            .ok_or_else(|| CredentialError::InvalidApiKeyFormat(raw.to_owned()))?;
        if id.is_empty() || secret.is_empty() {
            return Err(CredentialError::InvalidApiKeyFormat(raw.to_owned()));
        }
        Ok(Self {
            id: id.to_owned(),
            secret: secret.to_owned(),
        })
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `id:secret`, ready for `base64(...)` in a Basic auth header.
    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.id, self.secret)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey").field("id", &self.id).field("secret", &"<redacted>").finish()
    }
}

#[derive(Clone)]
pub struct BearerToken {
    raw: String,
    pub header: jwt::Header,
    pub payload: jwt::Payload,
}

impl BearerToken {
    pub fn decode(raw: &str) -> Result<Self, CredentialError> {
        let DecodedToken { header, payload } = jwt::decode_unverified(raw)?;
        Ok(Self {
            raw: raw.to_owned(),
            header,
            payload,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `true` while `now < exp`.
    pub fn is_valid_at(&self, now_epoch_seconds: i64) -> bool {
        now_epoch_seconds < self.payload.exp
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("raw", &"<redacted>")
            .field("header", &self.header)
            .field("payload", &self.payload)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(ApiKey),
    BearerToken(BearerToken),
}

impl Credential {
    pub fn api_key(raw: &str) -> Result<Self, CredentialError> {
        Ok(Credential::ApiKey(ApiKey::parse(raw)?))
    }

    pub fn bearer_token(raw: &str) -> Result<Self, CredentialError> {
        Ok(Credential::BearerToken(BearerToken::decode(raw)?))
    }

    /// Value for an `Authorization` header: `Bearer <raw>` or `Basic base64(id:secret)`.
    pub fn authorization_header_value(&self) -> String {
        match self {
            Credential::BearerToken(token) => format!("Bearer {}", token.raw()),
            Credential::ApiKey(key) => {
                use base64::Engine;
                format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(key.to_raw()))
            },
        }
    }

    /// `access_token=<raw>` or `api_key=<raw>`, unencoded; callers URL-encode.
    pub fn query_param(&self) -> (&'static str, String) {
        match self {
            Credential::BearerToken(token) => ("access_token", token.raw().to_owned()),
            Credential::ApiKey(key) => ("api_key", key.to_raw()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_api_key() {
        let key = ApiKey::parse("id:sec").unwrap();
        assert_eq!(key.id, "id");
        assert_eq!(key.secret(), "sec");
    }

    #[test]
    fn rejects_api_key_without_colon() {
        assert!(ApiKey::parse("no-colon").is_err());
    }

    #[test]
    fn api_key_debug_redacts_secret() {
        let key = ApiKey::parse("id:sec").unwrap();
        let debug = format!("{key:?}");
        assert!(!debug.contains("sec"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn api_key_query_param_is_id_colon_secret() {
        let cred = Credential::api_key("id:sec").unwrap();
        let (name, value) = cred.query_param();
        assert_eq!(name, "api_key");
        assert_eq!(value, "id:sec");
    }
}
