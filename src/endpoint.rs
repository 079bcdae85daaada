//! # Endpoint
//!
//! The transport-agnostic surface of the authentication service. Each
//! handler takes a request DTO and returns a response DTO; an HTTP facade
//! can expose them with a few lines of wrapper code per route.
//!
//! [`Service::new`] is the single wiring point: it takes the configuration
//! and the provider record and owns the only long-lived state (the template
//! catalog, the session registry and the CRL cache inside the UZI
//! verifier).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::abc::{AbcService, SessionPointer, SignedAbc};
use crate::contract::{Language, TemplateStore, Type, Version, ACTING_PARTY_ATTR,
    LEGAL_ENTITY_ATTR};
use crate::core::PartyId;
use crate::error::Error;
use crate::oauth::{
    AccessTokenResponse, CreateJwtBearerTokenRequest, JwtBearerTokenResponse, OAuthService,
    TokenIntrospectionResponse, JWT_BEARER_GRANT_TYPE,
};
use crate::provider::{KeyRef, Provider};
use crate::session::{CompletedSession, Session, SessionRegistry, SessionStatus};
use crate::validator::{ContractFormat, ContractValidators, ValidationResult};
use crate::x509::crl::CrlFetcher;
use crate::x509::uzi::{UziTrustBundle, UziVerifier};

/// Process-wide configuration, loaded once.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Bind address of the HTTP facade.
    pub address: String,

    /// Base URL advertised to external signers.
    pub public_url: String,

    /// `server` activates full initialization; otherwise the engine stays
    /// dormant.
    pub mode: String,

    /// Default acting party when a request does not carry one.
    pub acting_party_cn: Option<String>,

    /// Prefix used to qualify `.`-prefixed signer attributes.
    pub abc_scheme_manager: String,

    /// Local directory for the ABC scheme cache.
    pub abc_config_path: Option<PathBuf>,

    /// Disable network fetch of schemes at boot.
    pub skip_auto_update_schemas: bool,

    /// Which contract validators to activate.
    pub contract_validators: Vec<String>,

    /// Party identifier of the vendor operating this node.
    pub vendor: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "localhost:1323".to_string(),
            public_url: String::new(),
            mode: String::new(),
            acting_party_cn: None,
            abc_scheme_manager: "pbdf".to_string(),
            abc_config_path: None,
            skip_auto_update_schemas: false,
            contract_validators: vec!["abc".to_string(), "uzi".to_string()],
            vendor: String::new(),
        }
    }
}

impl Config {
    /// Whether the configuration asks for a fully initialized service.
    #[must_use]
    pub fn is_server_mode(&self) -> bool {
        self.mode == "server"
    }
}

/// Request to create a contract signing session.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Type of contract to sign, e.g. `BehandelaarLogin`.
    #[serde(rename = "type")]
    pub type_: Type,

    /// Language of the contract, defaults to `NL`.
    pub language: Option<Language>,

    /// Version of the contract, defaults to `v1`.
    pub version: Option<Version>,

    /// Party identifier of the user's organization.
    pub legal_entity: String,

    /// Start of the validity period, RFC 3339. Defaults to now.
    pub valid_from: Option<String>,

    /// End of the validity period, RFC 3339. Defaults to one hour after
    /// `validFrom`.
    pub valid_to: Option<String>,

    /// Extra template variables, e.g. `{"reason": "providing care"}`.
    #[serde(default)]
    pub template_attributes: HashMap<String, String>,
}

/// Result of creating a signing session.
#[derive(Clone, Debug, Serialize)]
pub struct CreateSessionResult {
    /// Pointer the user's wallet picks up, e.g. rendered as a QR code.
    pub qr_code_info: SessionPointer,

    /// Identifier to poll the session with.
    pub session_id: String,
}

/// Current state of a signing session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatusResult {
    /// Lifecycle state of the session.
    pub status: SessionStatus,

    /// The session identifier.
    pub token: String,

    /// Kind of session; always `signing`.
    #[serde(rename = "type")]
    pub type_: String,

    /// Disclosed attributes by well-known key, present once signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclosed: Option<HashMap<String, String>>,

    /// Proof status as reported by the signing provider.
    #[serde(skip_serializing_if = "Option::is_none", rename = "proofStatus")]
    pub proof_status: Option<crate::abc::ProofStatus>,

    /// The identity JWT for the signed contract, present when the session is
    /// DONE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nuts_auth_token: Option<String>,
}

/// Request to validate a signed contract.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ValidationRequest {
    /// Format of the signed contract.
    pub contract_format: ContractFormat,

    /// The signed contract; base64 for `abc`, the compact JWS for `jws`.
    pub contract_string: String,

    /// Common name of the acting party, from the caller's client
    /// certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acting_party_cn: Option<String>,
}

/// A contract template as served to clients.
#[derive(Clone, Debug, Serialize)]
pub struct ContractTemplateResponse {
    /// Type of contract.
    #[serde(rename = "type")]
    pub type_: Type,

    /// Language of the contract.
    pub language: Language,

    /// Version of the template.
    pub version: Version,

    /// The template text with placeholders.
    pub template: String,
}

/// Request to draw up a contract for a legal entity.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawUpContractRequest {
    /// Type of contract.
    #[serde(rename = "type")]
    pub type_: Type,

    /// Language of the contract, defaults to `NL`.
    pub language: Option<Language>,

    /// Version of the contract, defaults to `v1`.
    pub version: Option<Version>,

    /// Party identifier of the legal entity the contract is drawn up for.
    pub legal_entity: String,

    /// Start of the validity period, RFC 3339. Defaults to now.
    pub valid_from: Option<String>,

    /// End of the validity period, RFC 3339. Defaults to one hour after
    /// `validFrom`.
    pub valid_to: Option<String>,
}

/// A drawn-up contract.
#[derive(Clone, Debug, Serialize)]
pub struct ContractResponse {
    /// Type of contract.
    #[serde(rename = "type")]
    pub type_: Type,

    /// Language of the contract.
    pub language: Language,

    /// Version of the template.
    pub version: Version,

    /// The rendered contract text.
    pub message: String,
}

/// The authentication service: the single wiring point for all components.
pub struct Service<P: Provider, F: CrlFetcher> {
    config: Config,
    provider: P,
    templates: Arc<TemplateStore>,
    sessions: SessionRegistry,
    validators: ContractValidators<F>,
    oauth: OAuthService,
}

impl<P: Provider, F: CrlFetcher> Service<P, F> {
    /// Wire the service from its configuration and dependencies.
    ///
    /// Activates the validators named in `config.contract_validators`; the
    /// `uzi` validator additionally needs a trust bundle. Ensures the
    /// process-wide OAuth key pair exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is inconsistent, a trust
    /// bundle root is invalid, or the keystore fails.
    pub async fn new(
        config: Config, provider: P, crl_fetcher: F, uzi_trust: Option<UziTrustBundle>,
    ) -> Result<Self, Error> {
        let vendor = PartyId::parse(config.vendor.as_str())?;
        let templates = Arc::new(TemplateStore::standard()?);

        let abc = config
            .contract_validators
            .iter()
            .any(|v| v == "abc")
            .then(|| AbcService::new(Arc::clone(&templates), config.abc_scheme_manager.clone()));

        let uzi = if config.contract_validators.iter().any(|v| v == "uzi") {
            let bundle = uzi_trust.ok_or_else(|| {
                Error::InvalidInput(
                    "the uzi validator is activated but no trust bundle is configured".to_string(),
                )
            })?;
            Some(UziVerifier::new(bundle, Arc::clone(&templates), crl_fetcher)?)
        } else {
            None
        };

        let oauth = OAuthService::new(vendor);
        oauth.configure(&provider).await?;

        Ok(Self {
            config,
            provider,
            templates,
            sessions: SessionRegistry::default(),
            validators: ContractValidators::new(abc, uzi),
            oauth,
        })
    }

    /// The session registry, for diagnostics.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Whether this node holds a private key for the legal entity.
    pub async fn key_exists_for(&self, legal_entity: &PartyId) -> bool {
        self.provider.private_key_exists(&KeyRef::for_entity(legal_entity)).await
    }

    /// Start a contract signing session.
    ///
    /// Renders the requested template for the legal entity and hands the
    /// text to the signing provider; the returned pointer is what the user's
    /// wallet scans.
    ///
    /// # Errors
    ///
    /// Returns an error for unparsable validity bounds, an unknown template
    /// or legal entity, or a refused session.
    #[instrument(level = "debug", skip_all)]
    pub async fn create_signing_session(
        &self, request: CreateSessionRequest,
    ) -> Result<CreateSessionResult, Error> {
        let abc = self.abc()?;
        let now = self.provider.now();

        let valid_from = match &request.valid_from {
            Some(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| Error::InvalidInput(format!("Could not parse validFrom: {e}")))?
                .to_utc(),
            None => now,
        };
        let valid_to = match &request.valid_to {
            Some(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| Error::InvalidInput(format!("Could not parse validTo: {e}")))?
                .to_utc(),
            None => valid_from + TimeDelta::try_hours(1).unwrap_or_default(),
        };

        let legal_entity = PartyId::parse(request.legal_entity.as_str())?;
        if !self.key_exists_for(&legal_entity).await {
            return Err(Error::InvalidInput(format!(
                "no private key found for legal entity {legal_entity}"
            )));
        }
        let organization = self
            .provider
            .organization_by_id(&legal_entity)
            .await
            .map_err(Error::Registry)?;

        let contract = self.render_contract(
            &request.type_,
            request.language.as_ref(),
            request.version.as_ref(),
            &organization.name,
            &request.template_attributes,
            valid_from,
            valid_to - valid_from,
        )?;

        let challenge =
            abc.start_signing_session(&self.provider, &contract.raw_text).await?;

        self.sessions.insert(Session {
            id: challenge.session_id.clone(),
            contract_text: contract.raw_text,
            legal_entity,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
        });

        Ok(CreateSessionResult {
            qr_code_info: challenge.payload,
            session_id: challenge.session_id,
        })
    }

    /// The current status of a signing session.
    ///
    /// Polls the signing provider for non-terminal sessions; when the
    /// contract was signed, the identity JWT is derived and stored with the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for unknown or expired sessions.
    #[instrument(level = "debug", skip(self))]
    pub async fn contract_session_status(
        &self, session_id: &str,
    ) -> Result<SessionStatusResult, Error> {
        let abc = self.abc()?;
        let now = self.provider.now();

        let session = self.sessions.get(session_id, now)?;
        if session.status.is_terminal() {
            return Ok(self.session_status_result(&session));
        }

        // copy-out, call externally, compare-and-swap back in
        let Some(provider_result) = self
            .provider
            .signing_session_result(&session.id)
            .await
            .map_err(|e| Error::InvalidInput(format!("could not poll session: {e}")))?
        else {
            return Ok(self.session_status_result(&session));
        };

        let status = SessionStatus::from(provider_result.status);
        let auth_token = match &provider_result.signature {
            Some(signature) if status == SessionStatus::Done => {
                let signed = SignedAbc {
                    signature: signature.clone(),
                    proof_status: provider_result
                        .proof_status
                        .unwrap_or(crate::abc::ProofStatus::Invalid),
                    disclosed: provider_result.disclosed.clone(),
                    token: provider_result.token.clone(),
                };
                let contract =
                    crate::contract::Contract::parse(&signature.message, &self.templates)?;
                let legal_entity =
                    abc.legal_entity_from_contract(&self.provider, &contract).await?;
                let token = abc
                    .create_identity_token(&self.provider, &signed, &legal_entity, now)
                    .await
                    .map_err(|e| {
                        Error::InvalidInput(format!("could not create JWT for given session: {e}"))
                    })?;
                Some(token)
            }
            _ => None,
        };

        let updated = self.sessions.update_if(session_id, session.updated_at, now, |s| {
            s.status = status;
            if status.is_terminal() {
                s.result = Some(CompletedSession {
                    provider_result: provider_result.clone(),
                    auth_token: auth_token.clone(),
                });
            }
        })?;

        Ok(self.session_status_result(&updated))
    }

    /// Validate a signed contract.
    ///
    /// # Errors
    ///
    /// Returns an error when the contract cannot be decoded or a
    /// collaborator fails; semantic failures yield an `INVALID` result.
    #[instrument(level = "debug", skip_all)]
    pub async fn validate_contract(
        &self, request: ValidationRequest,
    ) -> Result<ValidationResult, Error> {
        let acting_party =
            request.acting_party_cn.as_deref().or(self.config.acting_party_cn.as_deref());
        self.validators
            .validate(
                &self.provider,
                &request.contract_string,
                request.contract_format,
                acting_party,
                self.provider.now(),
            )
            .await
    }

    /// The template for a contract type, defaulting to language `NL` and
    /// version `v1`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContractNotFound` when no template matches.
    pub fn contract_by_type(
        &self, type_: &Type, language: Option<&Language>, version: Option<&Version>,
    ) -> Result<ContractTemplateResponse, Error> {
        let language = language.cloned().unwrap_or_else(|| Language("NL".to_string()));
        let version = version.cloned().unwrap_or_else(|| Version("v1".to_string()));
        let template = self.templates.find(type_, &language, &version).map_err(|_| {
            Error::ContractNotFound(format!("Could not find contract with type {type_}"))
        })?;
        Ok(ContractTemplateResponse {
            type_: template.type_.clone(),
            language: template.language.clone(),
            version: template.version.clone(),
            template: template.template.clone(),
        })
    }

    /// Draw up a contract for a legal entity without starting a signing
    /// session.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown template or legal entity, or
    /// unparsable validity bounds.
    #[instrument(level = "debug", skip_all)]
    pub async fn draw_up_contract(
        &self, request: DrawUpContractRequest,
    ) -> Result<ContractResponse, Error> {
        let now = self.provider.now();
        let valid_from = match &request.valid_from {
            Some(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| Error::InvalidInput(format!("Could not parse validFrom: {e}")))?
                .to_utc(),
            None => now,
        };
        let valid_to = match &request.valid_to {
            Some(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| Error::InvalidInput(format!("Could not parse validTo: {e}")))?
                .to_utc(),
            None => valid_from + TimeDelta::try_hours(1).unwrap_or_default(),
        };

        let legal_entity = PartyId::parse(request.legal_entity.as_str())?;
        let organization = self
            .provider
            .organization_by_id(&legal_entity)
            .await
            .map_err(Error::Registry)?;

        let contract = self.render_contract(
            &request.type_,
            request.language.as_ref(),
            request.version.as_ref(),
            &organization.name,
            &HashMap::new(),
            valid_from,
            valid_to - valid_from,
        )?;

        Ok(ContractResponse {
            type_: contract.template.type_.clone(),
            language: contract.template.language.clone(),
            version: contract.template.version.clone(),
            message: contract.raw_text,
        })
    }

    /// Exchange a bearer assertion for an access token.
    ///
    /// `grant_type` must be the JWT-bearer grant and the caller must present
    /// its client certificate; the certificate's common name is matched
    /// against the acting party in the signed contract.
    ///
    /// # Errors
    ///
    /// Returns OAuth-coded errors; the facade serializes their envelope as
    /// the response body.
    #[instrument(level = "debug", skip_all)]
    pub async fn create_access_token(
        &self, grant_type: &str, assertion: &str, client_cert_pem: Option<&str>,
    ) -> Result<AccessTokenResponse, Error> {
        if grant_type != JWT_BEARER_GRANT_TYPE {
            return Err(Error::OAuthUnsupportedGrantType(format!(
                "grant_type must be: '{JWT_BEARER_GRANT_TYPE}'"
            )));
        }

        let Some(acting_party) = client_cert_pem.and_then(client_certificate_cn) else {
            return Err(Error::OAuthInvalidRequest(
                "Client certificate missing in header".to_string(),
            ));
        };

        let access_token = self
            .oauth
            .create_access_token(&self.provider, &self.validators, assertion, Some(&acting_party))
            .await?;

        Ok(AccessTokenResponse {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: crate::oauth::access_token_validity().num_seconds(),
        })
    }

    /// Build a signed bearer assertion.
    ///
    /// # Errors
    ///
    /// Returns an error when the custodian has no single `oauth` endpoint or
    /// signing fails.
    pub async fn create_jwt_bearer_token(
        &self, request: CreateJwtBearerTokenRequest,
    ) -> Result<JwtBearerTokenResponse, Error> {
        let bearer_token =
            self.oauth.create_jwt_bearer_token(&self.provider, &request).await?;
        Ok(JwtBearerTokenResponse { bearer_token })
    }

    /// Introspect an access token. Never fails: any token that cannot be
    /// positively verified is inactive.
    pub async fn introspect_access_token(&self, token: &str) -> TokenIntrospectionResponse {
        if token.is_empty() {
            return TokenIntrospectionResponse::default();
        }
        self.oauth.introspect_access_token(&self.provider, token).await
    }

    /// Verify the access token in an `Authorization: Bearer` header. The
    /// facade maps any error to 403.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when the header is absent, malformed
    /// or carries an inactive token.
    pub async fn verify_access_token(
        &self, authorization: Option<&str>,
    ) -> Result<TokenIntrospectionResponse, Error> {
        let Some(header) = authorization else {
            return Err(Error::CryptoInvalid("missing authorization header".to_string()));
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return Err(Error::CryptoInvalid("authorization header must be a bearer token".to_string()));
        };

        let introspection = self.introspect_access_token(token).await;
        if !introspection.active {
            return Err(Error::CryptoInvalid("token is not active".to_string()));
        }
        Ok(introspection)
    }

    fn abc(&self) -> Result<&AbcService, Error> {
        self.validators.abc().ok_or_else(|| {
            Error::InvalidInput("abc signing is not active on this node".to_string())
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn render_contract(
        &self, type_: &Type, language: Option<&Language>, version: Option<&Version>,
        organization_name: &str, extra_vars: &HashMap<String, String>,
        valid_from: chrono::DateTime<chrono::Utc>, duration: TimeDelta,
    ) -> Result<crate::contract::Contract, Error> {
        let language = language.cloned().unwrap_or_else(|| Language("NL".to_string()));
        let version = version.cloned().unwrap_or_else(|| Version("v1".to_string()));
        let template = self.templates.find(type_, &language, &version).map_err(|_| {
            Error::ContractNotFound(format!("Could not find contract with type {type_}"))
        })?;

        let acting_party = self.config.acting_party_cn.clone().ok_or_else(|| {
            Error::InvalidInput("no acting party configured for this node".to_string())
        })?;

        let mut vars = extra_vars.clone();
        vars.insert(ACTING_PARTY_ATTR.to_string(), acting_party);
        vars.insert(LEGAL_ENTITY_ATTR.to_string(), organization_name.to_string());

        template.render(&vars, valid_from, duration)
    }

    fn session_status_result(&self, session: &Session) -> SessionStatusResult {
        let (disclosed, proof_status, auth_token) = match (&session.result, self.validators.abc())
        {
            (Some(result), Some(abc)) => (
                Some(abc.flatten_disclosed(&result.provider_result.disclosed)),
                result.provider_result.proof_status,
                result.auth_token.clone(),
            ),
            (Some(result), None) => (None, result.provider_result.proof_status, None),
            (None, _) => (None, None, None),
        };

        SessionStatusResult {
            status: session.status,
            token: session.id.clone(),
            type_: "signing".to_string(),
            disclosed,
            proof_status,
            nuts_auth_token: auth_token,
        }
    }
}

// Common name from a PEM encoded client certificate, as forwarded by the
// TLS terminator.
fn client_certificate_cn(pem: &str) -> Option<String> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).ok()?;
    let cert = parsed.parse_x509().ok()?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToString::to_string);
    cn
}
