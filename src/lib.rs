//! An authentication and authorization service for a federated care
//! network.
//!
//! A care professional proves identity by signing a human-readable legal
//! contract with a government-issued identity means: an attribute-based
//! credential disclosure (ABC) or a qualified healthcare smartcard (UZI). A
//! relying service exchanges the signed contract for a short-lived OAuth 2.0
//! access token under the *JWT Bearer* grant ([RFC 7523]), carrying the
//! disclosed user attributes as claims.
//!
//! # Design
//!
//! The crate is transport-agnostic: [`endpoint::Service`] exposes one async
//! handler per resource, and an HTTP facade wraps them with a few lines per
//! route. External collaborators (registry, key store, consent store, ABC
//! signing provider, clock) are [`provider`] traits wired once into the
//! service; the only long-lived state is the template catalog, the session
//! registry and the CRL cache.
//!
//! [RFC 7523]: https://www.rfc-editor.org/rfc/rfc7523

pub mod abc;
pub mod contract;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod jose;
pub mod oauth;
pub mod provider;
pub mod session;
pub mod validator;
pub mod x509;

pub use error::{Error, Result};
