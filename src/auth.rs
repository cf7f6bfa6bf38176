//! Auth module (C2): obtain, validate, refresh, and present credentials.

use std::sync::{Arc, Weak};

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use strum::EnumDiscriminants;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::AuthOptions;
use crate::credential::{Credential, CredentialError};
use crate::event_bus::EventBus;
use crate::signing::TokenRequest;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no authUrl and no apiKey configured")]
    MissingCredentials,
    #[error("auth response carried neither a token nor a tokenRequest")]
    InvalidAuthResponse,
    #[error(transparent)]
    InvalidToken(#[from] CredentialError),
    #[error("no credentials available to present")]
    NoCredentials,
    #[error("auth HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Server auth response: either a bearer token directly, or a token request
/// the client must exchange at `/v1/key/{kid}/token/request`.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: Option<String>,
    pub token_request: Option<TokenRequest>,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(AuthEventKind))]
#[strum_discriminants(derive(Hash))]
pub enum AuthEvent {
    TokenUpdated { token: String, expires_at: Option<i64> },
    TokenExpired,
    TokenError { message: String },
    AuthError { message: String },
}

impl crate::event_bus::Event for AuthEvent {
    type Kind = AuthEventKind;

    fn kind(&self) -> Self::Kind {
        self.into()
    }
}

struct TokenState {
    credential: Option<Credential>,
    refresh_timer: Option<tokio::task::JoinHandle<()>>,
}

/// Obtains, refreshes, and presents credentials, and signs server-side
/// helper requests. Never holds a reference to the connection module — the
/// connection listens on [`AuthModule::events`] instead, avoiding a cyclic
/// construction dependency between the two.
pub struct AuthModule {
    options: AuthOptions,
    http: reqwest::Client,
    state: Mutex<TokenState>,
    is_resetting: std::sync::atomic::AtomicBool,
    abort: Mutex<CancellationToken>,
    /// Lets the internally-spawned refresh timer obtain a strong `Arc`
    /// without this struct owning one of itself.
    weak_self: Weak<AuthModule>,
    pub events: EventBus<AuthEvent>,
}

impl AuthModule {
    pub fn new(options: AuthOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            options,
            http: reqwest::Client::new(),
            state: Mutex::new(TokenState {
                credential: None,
                refresh_timer: None,
            }),
            is_resetting: std::sync::atomic::AtomicBool::new(false),
            abort: Mutex::new(CancellationToken::new()),
            weak_self: weak_self.clone(),
            events: EventBus::new(),
        })
    }

    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    fn protocol(&self) -> &'static str {
        if self.options.is_secure { "https" } else { "http" }
    }

    fn http_base(&self) -> String {
        match self.options.http_port {
            Some(port) => format!("{}://{}:{}", self.protocol(), self.options.http_host, port),
            None => format!("{}://{}", self.protocol(), self.options.http_host),
        }
    }

    /// Runs the authenticate attempt loop. Returns `Ok(None)` for the
    /// no-op/api-key/resetting paths that never produce a bearer token, and
    /// `Ok(Some(response))` once one has been stored.
    pub async fn authenticate(&self) -> Result<Option<AuthResponse>, AuthError> {
        if self.is_resetting.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(None);
        }
        let abort = self.abort.lock().await.clone();

        let attempts = self.options.authenticate_retries + 1;
        for attempt in 0..attempts {
            if abort.is_cancelled() {
                return Ok(None);
            }

            match self.try_authenticate_once().await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if attempt + 1 == attempts {
                        tracing::error!(target: "pulse::auth", error = %err, "authentication failed");
                        self.events.emit(AuthEvent::AuthError { message: err.to_string() });
                        return Err(err);
                    }
                    tracing::debug!(
                        target: "pulse::auth",
                        error = %err,
                        attempt,
                        "authentication attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.options.authenticate_retry_interval_ms)).await;
                },
            }
        }

        Ok(None)
    }

    async fn try_authenticate_once(&self) -> Result<Option<AuthResponse>, AuthError> {
        if let Some(token_request) = self.options.token_request.clone() {
            let response = self.request_token(&token_request).await?;
            return Ok(Some(response));
        }

        if self.options.auth_url.is_none() && self.options.api_key.is_none() {
            return Err(AuthError::MissingCredentials);
        }

        let Some(auth_url) = self.options.auth_url.clone() else {
            // api-key mode: server-side auth via the `api_key` query param, no token stored.
            return Ok(None);
        };

        let mut request = self.http.post(&auth_url);
        if let Some(extra) = &self.options.auth_options {
            if let Some(body) = &extra.body {
                request = request.json(body);
            }
            for (name, value) in &extra.headers {
                request = request.header(name, value);
            }
        }

        let response: AuthResponse = request.send().await?.json().await?;

        if let Some(token) = &response.token {
            self.store_token(token).await?;
            return Ok(Some(response));
        }
        if let Some(token_request) = &response.token_request {
            let response = self.request_token(token_request).await?;
            return Ok(Some(response));
        }

        Err(AuthError::InvalidAuthResponse)
    }

    /// `POST {protocol}://{httpHost}[:{httpPort}]/v1/key/{kid}/token/issue`,
    /// authenticated with HTTP Basic over the configured api key rather than
    /// a signed [`TokenRequest`] — the server-side counterpart of
    /// `requestToken` for callers that hold the api key secret directly
    /// rather than a pre-signed request. Not exercised by the browser-facing
    /// connect/reconnect path; kept alongside `request_token` as the other
    /// server-side helper.
    pub async fn issue_token(&self, kid: &str) -> Result<AuthResponse, AuthError> {
        let api_key = self.options.api_key.as_deref().ok_or(AuthError::MissingCredentials)?;
        let credential = Credential::api_key(api_key)?;

        let url = format!("{}/v1/key/{kid}/token/issue", self.http_base());
        let response: AuthResponse = self
            .http
            .post(url)
            .header("Authorization", credential.authorization_header_value())
            .send()
            .await?
            .json()
            .await?;

        let Some(token) = &response.token else {
            return Err(AuthError::InvalidAuthResponse);
        };
        self.store_token(token).await?;
        Ok(response)
    }

    /// `POST {protocol}://{httpHost}[:{httpPort}]/v1/key/{kid}/token/request`.
    async fn request_token(&self, token_request: &TokenRequest) -> Result<AuthResponse, AuthError> {
        let url = format!("{}/v1/key/{}/token/request", self.http_base(), token_request.kid);
        let response: AuthResponse = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .json(token_request)
            .send()
            .await?
            .json()
            .await?;

        let Some(token) = &response.token else {
            return Err(AuthError::InvalidAuthResponse);
        };
        self.store_token(token).await?;
        Ok(response)
    }

    async fn store_token(&self, raw: &str) -> Result<(), AuthError> {
        let credential = match Credential::bearer_token(raw) {
            Ok(credential) => credential,
            Err(err) => {
                self.events.emit(AuthEvent::TokenError { message: err.to_string() });
                return Err(err.into());
            },
        };

        let Credential::BearerToken(ref token) = credential else {
            unreachable!("bearer_token always constructs a BearerToken credential");
        };
        let expires_at = token.payload.exp;

        {
            let mut state = self.state.lock().await;
            if let Some(timer) = state.refresh_timer.take() {
                timer.abort();
            }
            state.credential = Some(credential.clone());
        }

        self.events.emit(AuthEvent::TokenUpdated {
            token: raw.to_owned(),
            expires_at: Some(expires_at),
        });

        self.schedule_refresh(expires_at).await;
        Ok(())
    }

    /// Schedules a timer at `exp - 60s`; fires `token_expired` immediately
    /// if that delay is already non-positive.
    async fn schedule_refresh(&self, expires_at_epoch_seconds: i64) {
        let now = now_epoch_seconds();
        let delay_seconds = expires_at_epoch_seconds - now - 60;

        if delay_seconds <= 0 {
            self.expire_token().await;
            return;
        }

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_seconds as u64)).await;
            this.expire_token().await;
        });

        self.state.lock().await.refresh_timer = Some(handle);
    }

    async fn expire_token(&self) {
        self.state.lock().await.credential = None;
        self.events.emit(AuthEvent::TokenExpired);
    }

    /// Returns the stored credential iff it is still valid; otherwise
    /// expires it and returns `None`.
    pub async fn get_token(&self) -> Option<Credential> {
        let existing = self.state.lock().await.credential.clone();
        match existing {
            Some(Credential::BearerToken(token)) if token.is_valid_at(now_epoch_seconds()) => {
                Some(Credential::BearerToken(token))
            },
            Some(Credential::BearerToken(_)) => {
                self.expire_token().await;
                None
            },
            other => other,
        }
    }

    pub async fn get_auth_headers(&self) -> Result<Vec<(String, String)>, AuthError> {
        if let Some(credential) = self.get_token().await {
            return Ok(vec![("Authorization".to_owned(), credential.authorization_header_value())]);
        }
        if let Some(raw) = &self.options.api_key {
            let credential = Credential::api_key(raw)?;
            let mut headers = vec![("Authorization".to_owned(), credential.authorization_header_value())];
            if let Some(alias) = &self.options.alias {
                headers.push(("X-Alias".to_owned(), alias.clone()));
            }
            return Ok(headers);
        }
        Err(AuthError::NoCredentials)
    }

    pub async fn get_auth_query_params(&self) -> Result<Vec<(String, String)>, AuthError> {
        if let Some(credential) = self.get_token().await {
            let (name, value) = credential.query_param();
            return Ok(vec![(name.to_owned(), value)]);
        }
        if let Some(raw) = &self.options.api_key {
            let credential = Credential::api_key(raw)?;
            let (name, value) = credential.query_param();
            let mut params = vec![(name.to_owned(), value)];
            if let Some(alias) = &self.options.alias {
                params.push(("alias".to_owned(), alias.clone()));
            }
            return Ok(params);
        }
        Err(AuthError::NoCredentials)
    }

    pub async fn get_authenticate_url(&self, base: &str) -> Result<String, AuthError> {
        let params = self.get_auth_query_params().await?;
        let query: Vec<String> = params
            .into_iter()
            .map(|(name, value)| format!("{name}={}", utf8_percent_encode(&value, NON_ALPHANUMERIC)))
            .collect();
        let separator = if base.contains('?') { '&' } else { '?' };
        Ok(format!("{base}{separator}{}", query.join("&")))
    }

    /// Whether the current credential is a (still-valid) bearer token —
    /// `false` in api-key mode, where no token is ever stored locally.
    pub async fn is_authenticated(&self) -> bool {
        matches!(self.get_token().await, Some(Credential::BearerToken(_)))
    }

    pub async fn reset(&self) {
        self.is_resetting.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut abort = self.abort.lock().await;
        abort.cancel();
        *abort = CancellationToken::new();
        drop(abort);

        let mut state = self.state.lock().await;
        if let Some(timer) = state.refresh_timer.take() {
            timer.abort();
        }
        state.credential = None;
        drop(state);

        self.events.remove_all_listeners(None);
        self.is_resetting.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

fn now_epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}
