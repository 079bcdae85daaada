//! # OAuth JWT-Bearer Service
//!
//! RFC 7523 token exchange: building bearer assertions, the multi-step
//! validation pipeline turning a bearer assertion into an access token, and
//! introspection of issued access tokens.
//!
//! The process-wide OAuth key pair is the only long-lived cryptographic
//! material owned here; it is ensured once at wiring time.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::core::PartyId;
use crate::error::Error;
use crate::jose;
use crate::provider::{KeyRef, Keystore, Provider};
use crate::validator::{ContractValidators, ValidationState};
use crate::x509::crl::CrlFetcher;
use crate::x509::{subject_alt_name_other_names, Cert};

/// The only grant type accepted by the access token endpoint.
pub const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Endpoint type under which authorization servers register themselves.
pub const OAUTH_ENDPOINT_TYPE: &str = "oauth";

const OAUTH_KEY_QUALIFIER: &str = "oauth";

// SAN otherName type-id carrying the vendor identifier on vendor CA roots.
const VENDOR_ID_OID: &str = "1.3.6.1.4.1.54851.4";

/// Maximum validity of a bearer assertion.
#[must_use]
pub fn bearer_token_max_validity() -> TimeDelta {
    TimeDelta::try_seconds(5).unwrap_or_default()
}

/// Validity of an issued access token.
#[must_use]
pub fn access_token_validity() -> TimeDelta {
    TimeDelta::try_minutes(15).unwrap_or_default()
}

/// Request to build a bearer assertion.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CreateJwtBearerTokenRequest {
    /// Party identifier of the actor requesting access.
    pub actor: String,

    /// Party identifier of the custodian holding the resource.
    pub custodian: String,

    /// The identity JWT proving the user's signed contract.
    pub identity_token: String,

    /// Optional subject the request is scoped to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Requested scope.
    pub scope: String,
}

/// Claims of a bearer assertion as defined by RFC 7523 plus the network's
/// extensions.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BearerClaims {
    /// Party identifier of the actor.
    pub iss: String,

    /// Party identifier of the custodian.
    pub sub: String,

    /// Identifier of the custodian's token endpoint.
    pub aud: String,

    /// Issued-at, seconds since the epoch.
    pub iat: i64,

    /// Expiry, seconds since the epoch. At most five seconds after `iat`.
    pub exp: i64,

    /// Not-before; fixed at zero.
    #[serde(default)]
    pub nbf: i64,

    /// Unique token identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// The nested identity JWT.
    #[serde(rename = "usi", skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,

    /// Subject the request is scoped to, when any.
    #[serde(rename = "sid", skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,

    /// Requested scope.
    #[serde(default)]
    pub scope: String,
}

/// Claims of an issued access token.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AccessClaims {
    /// The custodian that signed the token.
    pub iss: String,

    /// The actor the token was issued to.
    pub sub: String,

    /// Issued-at, seconds since the epoch.
    pub iat: i64,

    /// Expiry, seconds since the epoch.
    pub exp: i64,

    /// Subject the token is scoped to, when any.
    #[serde(rename = "sid", skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,

    /// Granted scope.
    #[serde(default)]
    pub scope: String,

    /// Family name disclosed by the signer.
    #[serde(default)]
    pub family_name: String,

    /// Given name disclosed by the signer.
    #[serde(default)]
    pub given_name: String,

    /// Name prefix disclosed by the signer.
    #[serde(default)]
    pub prefix: String,

    /// Full name disclosed by the signer.
    #[serde(default)]
    pub name: String,

    /// Email address disclosed by the signer.
    #[serde(default)]
    pub email: String,
}

/// Response of the access token endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccessTokenResponse {
    /// The signed access token.
    pub access_token: String,

    /// Token type; always `bearer`.
    pub token_type: String,

    /// Lifetime of the token in seconds.
    pub expires_in: i64,
}

/// Response of the bearer token endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JwtBearerTokenResponse {
    /// The signed bearer assertion.
    pub bearer_token: String,
}

/// RFC 7662 style introspection response.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TokenIntrospectionResponse {
    /// Whether the token is active. All other fields are absent when not.
    pub active: bool,

    /// The custodian that signed the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// The actor the token was issued to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Subject the token is scoped to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    /// Granted scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Issued-at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Family name disclosed by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,

    /// Given name disclosed by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,

    /// Name prefix disclosed by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Full name disclosed by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Email address disclosed by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// The OAuth token service for one node.
#[derive(Clone, Debug)]
pub struct OAuthService {
    vendor: PartyId,
    oauth_key: KeyRef,
}

impl OAuthService {
    /// Create the service for the node operated by `vendor`.
    #[must_use]
    pub fn new(vendor: PartyId) -> Self {
        let oauth_key = KeyRef::for_entity(&vendor).with_qualifier(OAUTH_KEY_QUALIFIER);
        Self { vendor, oauth_key }
    }

    /// Ensure the process-wide OAuth signing key exists, generating it when
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Keystore` when key generation fails.
    pub async fn configure(&self, keystore: &impl Keystore) -> Result<(), Error> {
        if !keystore.private_key_exists(&self.oauth_key).await {
            tracing::info!("missing OAuth JWT signing key, generating new one");
            keystore.generate_key_pair(&self.oauth_key).await.map_err(Error::Keystore)?;
        }
        Ok(())
    }

    /// Build a signed bearer assertion for the given request.
    ///
    /// The audience is the identifier of the custodian's single registered
    /// `oauth` endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the custodian has no or multiple `oauth`
    /// endpoints, or signing fails.
    #[instrument(level = "debug", skip(provider, request))]
    pub async fn create_jwt_bearer_token(
        &self, provider: &impl Provider, request: &CreateJwtBearerTokenRequest,
    ) -> Result<String, Error> {
        let custodian = PartyId::parse(request.custodian.as_str())?;
        let actor = PartyId::parse(request.actor.as_str())?;

        let endpoints = provider
            .endpoints_by_organization_and_type(&custodian, OAUTH_ENDPOINT_TYPE)
            .await
            .map_err(Error::Registry)?;
        let [endpoint] = endpoints.as_slice() else {
            return Err(Error::InvalidInput(
                "none or multiple registered endpoints found".to_string(),
            ));
        };

        let now = provider.now();
        let claims = BearerClaims {
            iss: actor.to_string(),
            sub: custodian.to_string(),
            aud: endpoint.identifier.clone(),
            iat: now.timestamp(),
            exp: (now + bearer_token_max_validity()).timestamp(),
            nbf: 0,
            jti: Some(Uuid::new_v4().to_string()),
            identity_token: Some(request.identity_token.clone()),
            subject_id: request.subject.clone(),
            scope: request.scope.clone(),
        };
        let claims = serde_json::to_value(&claims)
            .map_err(|e| Error::InvalidInput(format!("could not construct claims: {e}")))?;

        let key = KeyRef::for_entity(&actor).with_qualifier(OAUTH_KEY_QUALIFIER);
        provider
            .sign_jwt_with_certificate(&claims, &key)
            .await
            .map_err(|e| Error::Keystore(e.context("could not sign bearer token")))
    }

    /// Exchange a bearer assertion for an access token.
    ///
    /// Runs the full validation pipeline; every step is fatal. The
    /// `acting_party_cn` is the common name from the caller's client
    /// certificate and is matched against the acting party inside the signed
    /// contract.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first failing step.
    #[instrument(level = "debug", skip_all)]
    pub async fn create_access_token<F: CrlFetcher>(
        &self, provider: &impl Provider, validators: &ContractValidators<F>, raw_assertion: &str,
        acting_party_cn: Option<&str>,
    ) -> Result<String, Error> {
        // 1-3: parse, enforce the algorithm whitelist, verify the signature
        // under the x5c certificate, deserialize the claims
        let (claims, certificate) = parse_and_validate_bearer(raw_assertion)
            .map_err(|e| Error::OAuthInvalidGrant(format!("jwt bearer token validation failed: {e}")))?;

        // 4: the custodian must be operated by this node's vendor
        let custodian_id = PartyId::parse(claims.sub.as_str())
            .map_err(|e| Error::OAuthInvalidGrant(format!("invalid jwt.subject: {e}")))?;
        let custodian = provider
            .organization_by_id(&custodian_id)
            .await
            .map_err(|e| Error::OAuthInvalidGrant(format!("invalid jwt.subject: {e}")))?;
        if custodian.vendor != self.vendor {
            return Err(Error::OAuthInvalidGrant(
                "invalid jwt.subject: organization.vendor doesn't match with vendor of this node"
                    .to_string(),
            ));
        }

        // 5: the actor must be registered
        let actor_id = PartyId::parse(claims.iss.as_str())
            .map_err(|e| Error::OAuthInvalidGrant(format!("invalid jwt.issuer: {e}")))?;
        let actor = provider
            .organization_by_id(&actor_id)
            .await
            .map_err(|e| Error::OAuthInvalidGrant(format!("invalid jwt.issuer: {e}")))?;

        let validation_time = DateTime::from_timestamp(claims.iat, 0).ok_or_else(|| {
            Error::OAuthInvalidGrant("invalid jwt.issuedAt".to_string())
        })?;

        // 6: the signing certificate must chain up to a root carrying the
        // actor's vendor in its vendor-id SAN
        let chains = provider
            .verified_chain(&certificate, validation_time)
            .await
            .map_err(|e| Error::OAuthInvalidGrant(format!("jwt x5c certificate validation failed: {e}")))?;
        if chains.is_empty() {
            return Err(Error::OAuthInvalidGrant(
                "jwt x5c certificate validation failed: no verified chains".to_string(),
            ));
        }
        if !vendor_chain_match(&chains, &actor.vendor)? {
            return Err(Error::OAuthInvalidGrant(
                "certificate from x5c is no sibling of actor signing certificate".to_string(),
            ));
        }

        // 7: maximum bearer validity
        if claims.exp - claims.iat > bearer_token_max_validity().num_seconds() {
            return Err(Error::OAuthInvalidGrant("JWT validity too long".to_string()));
        }

        // 8: the nested identity token must validate
        let Some(identity_token) = &claims.identity_token else {
            return Err(Error::OAuthInvalidGrant("missing usi claim".to_string()));
        };
        let result = validators
            .validate_identity_jwt(provider, identity_token, acting_party_cn, provider.now())
            .await
            .map_err(|e| Error::OAuthInvalidGrant(format!("identity token validation failed: {e}")))?;
        if result.validation_result != ValidationState::Valid {
            return Err(Error::OAuthInvalidGrant("identity validation failed".to_string()));
        }

        // 9: TODO: check aud against the custodian's registered oauth
        // endpoint identifier once registry endpoints are resolvable here

        // 10: subject-scoped requests need a consent record at issue time
        if let Some(subject) = &claims.subject_id {
            let records = provider
                .query_consent(&actor_id, &custodian_id, subject, validation_time)
                .await
                .map_err(|e| Error::Consent(e.context("legal base validation failed")))?;
            if records.is_empty() {
                return Err(Error::OAuthInvalidGrant(
                    "subject scope requested but no legal base present".to_string(),
                ));
            }
        }

        // 11: mint
        self.build_access_token(provider, &claims, &result.disclosed_attributes).await
    }

    /// Introspect an access token. Any token this node cannot positively
    /// verify, including when it does not hold the OAuth private key, is
    /// reported inactive.
    #[instrument(level = "debug", skip_all)]
    pub async fn introspect_access_token(
        &self, provider: &impl Provider, token: &str,
    ) -> TokenIntrospectionResponse {
        let inactive = TokenIntrospectionResponse::default();

        let Ok(jws) = jose::decode(token) else {
            return inactive;
        };
        if !provider.private_key_exists(&self.oauth_key).await {
            return inactive;
        }
        let Ok(public_key) = provider.public_key(&self.oauth_key).await else {
            return inactive;
        };
        if jose::verify_signature(
            jws.header.alg,
            &public_key,
            jws.signing_input.as_bytes(),
            &jws.signature,
        )
        .is_err()
        {
            return inactive;
        }
        let Ok(claims) = jws.claims::<AccessClaims>() else {
            return inactive;
        };
        if provider.now().timestamp() > claims.exp {
            return inactive;
        }

        TokenIntrospectionResponse {
            active: true,
            iss: Some(claims.iss),
            sub: Some(claims.sub),
            sid: claims.subject_id,
            scope: Some(claims.scope),
            iat: Some(claims.iat),
            exp: Some(claims.exp),
            family_name: Some(claims.family_name),
            given_name: Some(claims.given_name),
            prefix: Some(claims.prefix),
            name: Some(claims.name),
            email: Some(claims.email),
        }
    }

    // Build and sign the access token from the verified bearer claims and
    // the identity validation result.
    async fn build_access_token(
        &self, provider: &impl Provider, bearer: &BearerClaims,
        disclosed: &HashMap<String, String>,
    ) -> Result<String, Error> {
        let attribute = |key: &str| disclosed.get(key).cloned().unwrap_or_default();

        let now = provider.now();
        let claims = AccessClaims {
            iss: bearer.sub.clone(),
            sub: bearer.iss.clone(),
            iat: now.timestamp(),
            exp: (now + access_token_validity()).timestamp(),
            subject_id: bearer.subject_id.clone(),
            scope: bearer.scope.clone(),
            family_name: attribute("gemeente.personalData.familyname"),
            given_name: attribute("gemeente.personalData.firstnames"),
            prefix: attribute("gemeente.personalData.prefix"),
            name: attribute("gemeente.personalData.fullname"),
            email: attribute("pbdf.email.email"),
        };
        let claims = serde_json::to_value(&claims)
            .map_err(|e| Error::InvalidInput(format!("could not construct claims: {e}")))?;

        provider
            .sign_jwt(&claims, &self.oauth_key)
            .await
            .map_err(|e| Error::Keystore(e.context("could not build access token")))
    }
}

// Steps 1-3 of the exchange: decode the compact JWS (the algorithm whitelist
// is enforced by header deserialization), extract the single x5c
// certificate, verify the signature under its public key and deserialize the
// claims.
fn parse_and_validate_bearer(raw: &str) -> Result<(BearerClaims, Cert), Error> {
    let jws = jose::decode(raw)?;

    let Some(x5c) = &jws.header.x5c else {
        return Err(Error::CryptoInvalid("missing x5c header".to_string()));
    };
    let [cert_b64] = x5c.as_slice() else {
        return Err(Error::CryptoInvalid("invalid x5c header".to_string()));
    };
    let certificate = Cert::from_base64(cert_b64)?;

    jose::verify_signature(
        jws.header.alg,
        &certificate.public_key_der()?,
        jws.signing_input.as_bytes(),
        &jws.signature,
    )?;

    let claims: BearerClaims = jws.claims()?;
    Ok((claims, certificate))
}

// At least one chain must end in a root whose vendor-id SAN names the
// actor's vendor. Roots without a vendor SAN are skipped.
fn vendor_chain_match(chains: &[Vec<Cert>], vendor: &PartyId) -> Result<bool, Error> {
    for chain in chains {
        let Some(root) = chain.last() else { continue };
        let vendor_san = subject_alt_name_other_names(root)?
            .into_iter()
            .find(|(oid, _)| oid == VENDOR_ID_OID)
            .map(|(_, value)| value);
        if let Some(value) = vendor_san {
            if value == vendor.value() || value == vendor.as_str() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
