//! # Providers
//!
//! Traits for the external collaborators the service depends on: the
//! organization registry, the key store, the consent store, the ABC signing
//! provider and the clock.
//!
//! Implementers wire these once into a [`crate::endpoint::Service`]; there is
//! no process-wide state. All methods are async and assumed thread-safe by
//! contract. The clock is injected so tests can freeze time.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::abc::{AbcVerification, SignatureRequest, SessionPointer, SignatureSessionResult};
use crate::core::PartyId;
use crate::x509::Cert;

/// Result type for all provider methods.
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Top-level provider: everything the service needs from its environment.
pub trait Provider: Registry + Keystore + ConsentStore + AbcClient + Clock + Clone {}

/// An organization as registered in the network registry.
#[derive(Clone, Debug, Default)]
pub struct Organization {
    /// Party identifier of the organization.
    pub identifier: PartyId,

    /// Registered display name, as rendered into contract text.
    pub name: String,

    /// The vendor operating this organization's node.
    pub vendor: PartyId,

    /// The organization's current public key in SubjectPublicKeyInfo DER
    /// form, when published.
    pub public_key: Option<Vec<u8>>,
}

/// A registered service endpoint.
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    /// Opaque endpoint identifier, used as token audience.
    pub identifier: String,

    /// Endpoint type, e.g. `oauth`.
    pub endpoint_type: String,

    /// Resolvable location of the endpoint.
    pub url: String,
}

/// The organization/endpoint registry.
pub trait Registry: Send + Sync {
    /// Resolve an organization by its party identifier.
    fn organization_by_id(
        &self, id: &PartyId,
    ) -> impl Future<Output = Result<Organization>> + Send;

    /// Find the organization registered under the given name.
    fn reverse_lookup(&self, name: &str) -> impl Future<Output = Result<Organization>> + Send;

    /// Endpoints of the given type registered for an organization.
    fn endpoints_by_organization_and_type(
        &self, organization: &PartyId, endpoint_type: &str,
    ) -> impl Future<Output = Result<Vec<Endpoint>>> + Send;
}

/// Reference to a key held by the key store on behalf of a legal entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRef {
    /// The legal entity the key belongs to.
    pub entity: String,

    /// Optional qualifier distinguishing multiple keys per entity.
    pub qualifier: Option<String>,
}

impl KeyRef {
    /// Key reference for a legal entity without qualifier.
    #[must_use]
    pub fn for_entity(entity: &PartyId) -> Self {
        Self { entity: entity.to_string(), qualifier: None }
    }

    /// Derive a qualified key reference, e.g. the entity's `oauth` key.
    #[must_use]
    pub fn with_qualifier(mut self, qualifier: &str) -> Self {
        self.qualifier = Some(qualifier.to_string());
        self
    }
}

/// The key/crypto store signing and verifying on behalf of legal entities.
pub trait Keystore: Send + Sync {
    /// Whether the private key for the reference is held by this node.
    fn private_key_exists(&self, key: &KeyRef) -> impl Future<Output = bool> + Send;

    /// Generate a new key pair for the reference.
    fn generate_key_pair(&self, key: &KeyRef) -> impl Future<Output = Result<()>> + Send;

    /// Sign the given claims into a compact JWS with the referenced key.
    fn sign_jwt(&self, claims: &Value, key: &KeyRef) -> impl Future<Output = Result<String>> + Send;

    /// Sign the given claims into a compact JWS carrying the signing
    /// certificate in the `x5c` header.
    fn sign_jwt_with_certificate(
        &self, claims: &Value, key: &KeyRef,
    ) -> impl Future<Output = Result<String>> + Send;

    /// The public key for the reference in SubjectPublicKeyInfo DER form.
    fn public_key(&self, key: &KeyRef) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Build verified chains for the given certificate against the node's
    /// vendor trust store at the given instant. Chains are ordered leaf
    /// first.
    fn verified_chain(
        &self, cert: &Cert, at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Vec<Cert>>>> + Send;
}

/// A consent record linking actor, custodian and subject.
#[derive(Clone, Debug, Default)]
pub struct ConsentRecord {
    /// Party requesting access.
    pub actor: PartyId,

    /// Party holding the resource.
    pub custodian: PartyId,

    /// The subject the consent is about.
    pub subject: String,
}

/// The consent store.
pub trait ConsentStore: Send + Sync {
    /// Consent records for the actor/custodian/subject triple valid at the
    /// given instant.
    fn query_consent(
        &self, actor: &PartyId, custodian: &PartyId, subject: &str, at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ConsentRecord>>> + Send;
}

/// Adapter over the external ABC signing provider.
pub trait AbcClient: Send + Sync {
    /// Start a signature session for the given request. Returns a pointer
    /// the user's wallet app can pick up, e.g. rendered as a QR code.
    fn start_signing_session(
        &self, request: &SignatureRequest,
    ) -> impl Future<Output = Result<SessionPointer>> + Send;

    /// The current result of a signature session, or `None` when the
    /// provider does not know the session.
    fn signing_session_result(
        &self, token: &str,
    ) -> impl Future<Output = Result<Option<SignatureSessionResult>>> + Send;

    /// Cryptographically verify a disclosure signature, yielding the proof
    /// status and the disclosed attributes.
    fn verify_signature(
        &self, signature: &crate::abc::AbcSignature,
    ) -> impl Future<Output = Result<AbcVerification>> + Send;
}

/// Injected wall clock.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock for production wiring.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
