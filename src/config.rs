//! Typed configuration surface.
//!
//! A concrete, `Deserialize`-able struct per component with field defaults
//! matching the SDK's recognized option keys, so the rest of the crate has
//! something typed to read from instead of a loosely-typed merged-defaults
//! map.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signing::TokenRequest;

fn default_true() -> bool {
    true
}

fn default_auth_retry_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOptions {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub auth_options: Option<AuthRequestOptions>,
    #[serde(default)]
    pub token_request: Option<TokenRequest>,
    #[serde(default = "default_true")]
    pub auto_authenticate: bool,
    #[serde(default)]
    pub authenticate_retries: u32,
    #[serde(default = "default_auth_retry_interval_ms")]
    pub authenticate_retry_interval_ms: u64,
    #[serde(default)]
    pub alias: Option<String>,
    pub http_host: String,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub is_secure: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            auth_url: None,
            auth_options: None,
            token_request: None,
            auto_authenticate: true,
            authenticate_retries: 0,
            authenticate_retry_interval_ms: 1000,
            alias: None,
            http_host: String::new(),
            http_port: None,
            is_secure: false,
        }
    }
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_initial_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_backoff_multiplier() -> f64 {
    2.0
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    pub ws_host: String,
    #[serde(default)]
    pub ws_port: Option<u16>,
    #[serde(default)]
    pub is_secure: bool,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub auto_resubscribe: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_backoff_multiplier")]
    pub reconnect_backoff_multiplier: f64,
    /// Explicit override for the `pingTimeoutMs` key. Left unset, application
    /// pings fall back to 10s and the server-ping heartbeat falls back to
    /// 60s — see [`ConnectionOptions::app_ping_timeout_ms`] and
    /// [`ConnectionOptions::heartbeat_timeout_ms`].
    #[serde(default)]
    pub ping_timeout_ms: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ConnectionOptions {
    pub fn app_ping_timeout_ms(&self) -> u64 {
        self.ping_timeout_ms.unwrap_or(10_000)
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.ping_timeout_ms.unwrap_or(60_000)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            ws_host: String::new(),
            ws_port: None,
            is_secure: false,
            auto_connect: true,
            auto_reconnect: true,
            auto_resubscribe: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            reconnect_backoff_multiplier: default_reconnect_backoff_multiplier(),
            ping_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientOptions {
    #[serde(default)]
    pub auth: AuthOptions,
    #[serde(default)]
    pub connection: ConnectionOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_options_default_matches_spec_defaults() {
        let options = AuthOptions::default();
        assert!(options.auto_authenticate);
        assert_eq!(options.authenticate_retries, 0);
        assert_eq!(options.authenticate_retry_interval_ms, 1000);
    }

    #[test]
    fn connection_options_default_matches_spec_defaults() {
        let options = ConnectionOptions::default();
        assert!(options.auto_connect);
        assert!(options.auto_reconnect);
        assert!(options.auto_resubscribe);
        assert_eq!(options.ping_timeout_ms, None);
        assert_eq!(options.app_ping_timeout_ms(), 10_000);
        assert_eq!(options.heartbeat_timeout_ms(), 60_000);
        assert_eq!(options.connect_timeout_ms, 10_000);
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let json = serde_json::json!({
            "auth": {"apiKey": "id:sec", "httpHost": "h"},
            "connection": {"wsHost": "h"}
        });
        let options: ClientOptions = serde_json::from_value(json).unwrap();
        assert_eq!(options.auth.api_key.as_deref(), Some("id:sec"));
        assert_eq!(options.connection.ws_host, "h");
        assert!(options.connection.auto_connect);
    }
}
