//! Crate-wide error type composing each module's own error enum.

use thiserror::Error;

use crate::auth::AuthError;
use crate::channel::ChannelError;
use crate::connection::ConnectionError;
use crate::credential::CredentialError;
use crate::jwt::JwtError;
use crate::protocol::ProtocolError;
use crate::signing::SigningError;
use crate::transport::TransportError;

/// Top-level error for consumers who don't need to match on a specific
/// module's error enum.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error(transparent)]
    Signing(#[from] SigningError),
}
