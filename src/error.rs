//! # Errors
//!
//! Error types for the authentication service. Every fallible operation in
//! the crate returns [`Error`]; the HTTP facade maps each kind to a status
//! code exactly once via [`Error::status`].
//!
//! OAuth-coded variants render as the RFC 6749 error envelope so the token
//! endpoint can return their `Display` output as the response body verbatim.

use serde::Serialize;
use thiserror::Error;

/// Error kinds surfaced by the authentication service.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed JSON, unparsable time strings, or missing required fields.
    #[error("{0}")]
    InvalidInput(String),

    /// No contract template matches the requested type/language/version or
    /// the presented contract text.
    #[error("{0}")]
    ContractNotFound(String),

    /// The contract parsed but failed a semantic check: required attributes
    /// missing, acting party mismatch, or malformed validity period.
    #[error("invalid contract text: {0}")]
    ContractInvalid(String),

    /// The contract's validity window lies entirely in the past.
    #[error("contract is expired since: {0}")]
    ContractExpired(String),

    /// The contract's validity window has not started yet.
    #[error("contract is not yet valid, valid from: {0}")]
    ContractNotYetValid(String),

    /// Signature mismatch, disallowed algorithm, or a revoked or untrusted
    /// certificate chain.
    #[error("{0}")]
    CryptoInvalid(String),

    /// The organization registry failed to answer.
    #[error("registry error: {0}")]
    Registry(#[source] anyhow::Error),

    /// The consent store failed to answer.
    #[error("consent store error: {0}")]
    Consent(#[source] anyhow::Error),

    /// The key store failed to sign or resolve a key.
    #[error("keystore error: {0}")]
    Keystore(#[source] anyhow::Error),

    /// A certificate revocation list could not be fetched or parsed and no
    /// fresh cached copy was available.
    #[error("CRL unavailable: {0}")]
    CrlUnavailable(String),

    /// RFC 6749 `invalid_request`.
    #[error(r#"{{"error": "invalid_request", "error_description": "{0}"}}"#)]
    OAuthInvalidRequest(String),

    /// RFC 6749 `invalid_grant`.
    #[error(r#"{{"error": "invalid_grant", "error_description": "{0}"}}"#)]
    OAuthInvalidGrant(String),

    /// RFC 6749 `unsupported_grant_type`.
    #[error(r#"{{"error": "unsupported_grant_type", "error_description": "{0}"}}"#)]
    OAuthUnsupportedGrantType(String),

    /// No signing session exists for the given session id.
    #[error("session not found")]
    SessionNotFound,

    /// A deadline expired while waiting on an external collaborator.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// The HTTP status code the facade should respond with.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::InvalidInput(_)
            | Self::ContractInvalid(_)
            | Self::ContractExpired(_)
            | Self::ContractNotYetValid(_)
            | Self::CryptoInvalid(_)
            | Self::OAuthInvalidRequest(_)
            | Self::OAuthInvalidGrant(_)
            | Self::OAuthUnsupportedGrantType(_) => 400,
            Self::ContractNotFound(_) | Self::SessionNotFound => 404,
            Self::Registry(_) | Self::Consent(_) | Self::Keystore(_) | Self::CrlUnavailable(_) => {
                502
            }
            Self::Timeout(_) => 504,
        }
    }

    /// The OAuth error envelope for this error, used by the access token
    /// endpoint which must always answer with an RFC 6749 body.
    #[must_use]
    pub fn oauth_envelope(&self) -> OAuthError {
        let (error, description) = match self {
            Self::OAuthInvalidRequest(d) => ("invalid_request", d.clone()),
            Self::OAuthUnsupportedGrantType(d) => ("unsupported_grant_type", d.clone()),
            Self::OAuthInvalidGrant(d) => ("invalid_grant", d.clone()),
            other => ("invalid_grant", other.to_string()),
        };
        OAuthError { error: error.to_string(), error_description: description }
    }
}

/// RFC 6749 error response body.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OAuthError {
    /// Error code, e.g. `invalid_request`.
    pub error: String,

    /// Human-readable description of the failure.
    pub error_description: String,
}

/// Shorthand result type for operations returning [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
