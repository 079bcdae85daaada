//! Shared test providers: in-memory registry, keystore, consent store and
//! ABC signing provider, plus a frozen clock.

#![allow(dead_code)]

pub mod pki;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, TimeZone, Utc};
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::EncodePublicKey as _;
use serde_json::{json, Value};

use carenet_auth::abc::{
    AbcSignature, AbcVerification, DisclosedAttribute, ProofStatus, SessionPointer,
    SignatureRequest, SignatureSessionResult, AbcSessionStatus,
};
use carenet_auth::core::PartyId;
use carenet_auth::provider::{
    AbcClient, Clock, ConsentRecord, ConsentStore, Endpoint, KeyRef, Keystore, Organization,
    Provider, Registry,
};
use carenet_auth::x509::crl::CrlFetcher;
use carenet_auth::x509::Cert;

pub const PUBLIC_URL: &str = "https://node.example.com";

static INIT: Once = Once::new();

pub fn init_tracer() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    });
}

/// The frozen test instant: 2020-10-29T00:00:00Z.
pub fn frozen_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 10, 29, 0, 0, 0).unwrap()
}

/// A contract text that is valid around [`frozen_now`] (00:30–02:30 in the
/// Amsterdam zone, which is CET on that date).
pub fn contract_text_for(acting_party: &str, legal_entity: &str) -> String {
    format!(
        "NL:BehandelaarLogin:v1 Ondergetekende geeft toestemming aan {acting_party} om namens \
         {legal_entity} en ondergetekende het Nuts netwerk te bevragen. Deze toestemming is \
         geldig van donderdag, 29 oktober 2020 00:30:00 tot donderdag, 29 oktober 2020 02:30:00."
    )
}

/// The standard disclosed attribute set for a valid signature.
pub fn standard_disclosed() -> Vec<Vec<DisclosedAttribute>> {
    vec![vec![
        DisclosedAttribute {
            identifier: "pbdf.gemeente.personalData.firstnames".to_string(),
            raw_value: "Jan".to_string(),
            status: "PRESENT".to_string(),
        },
        DisclosedAttribute {
            identifier: "pbdf.pbdf.email.email".to_string(),
            raw_value: "jan@example.com".to_string(),
            status: "PRESENT".to_string(),
        },
    ]]
}

/// Sign claims into an ES256 compact JWS, optionally with an `x5c` header.
pub fn sign_es256(claims: &Value, key: &SigningKey, x5c: Option<Vec<String>>) -> String {
    let mut header = json!({"alg": "ES256", "typ": "JWT"});
    if let Some(x5c) = x5c {
        header["x5c"] = json!(x5c);
    }
    let header = Base64UrlUnpadded::encode_string(header.to_string().as_bytes());
    let payload = Base64UrlUnpadded::encode_string(claims.to_string().as_bytes());
    let signing_input = format!("{header}.{payload}");
    let signature: Signature = key.sign(signing_input.as_bytes());
    format!("{signing_input}.{}", Base64UrlUnpadded::encode_string(&signature.to_vec()))
}

#[derive(Clone, Debug)]
struct AbcSessionState {
    message: String,
    result: Option<SignatureSessionResult>,
}

/// In-memory provider implementing every collaborator trait.
#[derive(Clone, Default)]
pub struct TestProvider {
    organizations: Arc<Mutex<HashMap<String, Organization>>>,
    endpoints: Arc<Mutex<HashMap<String, Vec<Endpoint>>>>,
    keys: Arc<Mutex<HashMap<String, SigningKey>>>,
    consents: Arc<Mutex<Vec<ConsentRecord>>>,
    abc_sessions: Arc<Mutex<HashMap<String, AbcSessionState>>>,
    session_counter: Arc<AtomicU64>,
    bearer_signer: Arc<Mutex<Option<(Vec<u8>, SigningKey)>>>,
    verified_chains: Arc<Mutex<HashMap<Vec<u8>, Vec<Vec<Cert>>>>>,
    now: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl TestProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        *provider.now.lock().unwrap() = Some(frozen_now());
        provider
    }

    pub fn set_now(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = Some(at);
    }

    pub fn register_organization(&self, organization: Organization) {
        self.organizations
            .lock()
            .unwrap()
            .insert(organization.identifier.to_string(), organization);
    }

    /// Register an organization and give it a registry-published signing
    /// key held by the test keystore.
    pub fn register_organization_with_key(&self, id: &PartyId, name: &str, vendor: &PartyId) {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let public_key = key.verifying_key().to_public_key_der().unwrap().into_vec();
        self.keys.lock().unwrap().insert(id.to_string(), key);
        self.register_organization(Organization {
            identifier: id.clone(),
            name: name.to_string(),
            vendor: vendor.clone(),
            public_key: Some(public_key),
        });
    }

    pub fn register_endpoint(&self, organization: &PartyId, endpoint: Endpoint) {
        self.endpoints
            .lock()
            .unwrap()
            .entry(organization.to_string())
            .or_default()
            .push(endpoint);
    }

    pub fn add_consent(&self, record: ConsentRecord) {
        self.consents.lock().unwrap().push(record);
    }

    /// Drop a key from the keystore, e.g. to simulate a node that does not
    /// hold the OAuth private key.
    pub fn remove_key(&self, key: &KeyRef) {
        self.keys.lock().unwrap().remove(&Self::key_id(key));
    }

    /// Install the certificate and key used for `sign_jwt_with_certificate`.
    pub fn set_bearer_signer(&self, cert_der: Vec<u8>, key: SigningKey) {
        *self.bearer_signer.lock().unwrap() = Some((cert_der, key));
    }

    /// Pre-compute the trust-store answer for a certificate.
    pub fn add_verified_chain(&self, leaf: &Cert, chains: Vec<Vec<Cert>>) {
        self.verified_chains.lock().unwrap().insert(leaf.der().to_vec(), chains);
    }

    /// Complete a running signing session with a valid signature over the
    /// session's contract text.
    pub fn complete_signing_session(
        &self, token: &str, disclosed: Vec<Vec<DisclosedAttribute>>,
    ) {
        let mut sessions = self.abc_sessions.lock().unwrap();
        let state = sessions.get_mut(token).expect("session exists");
        let verification =
            AbcVerification { proof_status: ProofStatus::Valid, disclosed: disclosed.clone() };
        state.result = Some(SignatureSessionResult {
            token: token.to_string(),
            status: AbcSessionStatus::Done,
            proof_status: Some(ProofStatus::Valid),
            disclosed,
            signature: Some(AbcSignature {
                message: state.message.clone(),
                proof: serde_json::to_value(&verification).unwrap(),
                timestamp: Some(frozen_now().timestamp()),
            }),
        });
    }

    /// Mark a running signing session as cancelled by the user.
    pub fn cancel_signing_session(&self, token: &str) {
        let mut sessions = self.abc_sessions.lock().unwrap();
        let state = sessions.get_mut(token).expect("session exists");
        state.result = Some(SignatureSessionResult {
            token: token.to_string(),
            status: AbcSessionStatus::Cancelled,
            proof_status: None,
            disclosed: vec![],
            signature: None,
        });
    }

    /// Build a valid signed contract and its verification blob.
    pub fn signed_contract(message: &str, disclosed: Vec<Vec<DisclosedAttribute>>) -> AbcSignature {
        let verification = AbcVerification { proof_status: ProofStatus::Valid, disclosed };
        AbcSignature {
            message: message.to_string(),
            proof: serde_json::to_value(&verification).unwrap(),
            timestamp: Some(frozen_now().timestamp()),
        }
    }

    fn key_id(key: &KeyRef) -> String {
        match &key.qualifier {
            Some(qualifier) => format!("{}|{qualifier}", key.entity),
            None => key.entity.clone(),
        }
    }
}

impl Registry for TestProvider {
    async fn organization_by_id(&self, id: &PartyId) -> anyhow::Result<Organization> {
        self.organizations
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("organization not found: {id}"))
    }

    async fn reverse_lookup(&self, name: &str) -> anyhow::Result<Organization> {
        self.organizations
            .lock()
            .unwrap()
            .values()
            .find(|o| o.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("organization not found: {name}"))
    }

    async fn endpoints_by_organization_and_type(
        &self, organization: &PartyId, endpoint_type: &str,
    ) -> anyhow::Result<Vec<Endpoint>> {
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .get(organization.as_str())
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter(|e| e.endpoint_type == endpoint_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl Keystore for TestProvider {
    async fn private_key_exists(&self, key: &KeyRef) -> bool {
        self.keys.lock().unwrap().contains_key(&Self::key_id(key))
    }

    async fn generate_key_pair(&self, key: &KeyRef) -> anyhow::Result<()> {
        self.keys
            .lock()
            .unwrap()
            .insert(Self::key_id(key), SigningKey::random(&mut rand::rngs::OsRng));
        Ok(())
    }

    async fn sign_jwt(&self, claims: &Value, key: &KeyRef) -> anyhow::Result<String> {
        let keys = self.keys.lock().unwrap();
        let signing_key = keys
            .get(&Self::key_id(key))
            .ok_or_else(|| anyhow::anyhow!("no private key for {}", key.entity))?;
        Ok(sign_es256(claims, signing_key, None))
    }

    async fn sign_jwt_with_certificate(
        &self, claims: &Value, _key: &KeyRef,
    ) -> anyhow::Result<String> {
        let signer = self.bearer_signer.lock().unwrap();
        let (cert_der, signing_key) =
            signer.as_ref().ok_or_else(|| anyhow::anyhow!("no bearer signer installed"))?;
        let x5c = vec![Cert::from_der(cert_der.clone())?.to_base64()];
        Ok(sign_es256(claims, signing_key, Some(x5c)))
    }

    async fn public_key(&self, key: &KeyRef) -> anyhow::Result<Vec<u8>> {
        let keys = self.keys.lock().unwrap();
        let signing_key = keys
            .get(&Self::key_id(key))
            .ok_or_else(|| anyhow::anyhow!("no key for {}", key.entity))?;
        Ok(signing_key.verifying_key().to_public_key_der()?.into_vec())
    }

    async fn verified_chain(
        &self, cert: &Cert, _at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Vec<Cert>>> {
        Ok(self
            .verified_chains
            .lock()
            .unwrap()
            .get(cert.der())
            .cloned()
            .unwrap_or_default())
    }
}

impl ConsentStore for TestProvider {
    async fn query_consent(
        &self, actor: &PartyId, custodian: &PartyId, subject: &str, _at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ConsentRecord>> {
        Ok(self
            .consents
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.actor == actor && &r.custodian == custodian && r.subject == subject)
            .cloned()
            .collect())
    }
}

impl AbcClient for TestProvider {
    async fn start_signing_session(
        &self, request: &SignatureRequest,
    ) -> anyhow::Result<SessionPointer> {
        let token = format!("abc-session-{}", self.session_counter.fetch_add(1, Ordering::SeqCst));
        self.abc_sessions.lock().unwrap().insert(
            token.clone(),
            AbcSessionState { message: request.message.clone(), result: None },
        );
        Ok(SessionPointer {
            u: format!("{PUBLIC_URL}/auth/abcclient/{token}"),
            session_type: "signing".to_string(),
            token,
        })
    }

    async fn signing_session_result(
        &self, token: &str,
    ) -> anyhow::Result<Option<SignatureSessionResult>> {
        let sessions = self.abc_sessions.lock().unwrap();
        Ok(sessions.get(token).map(|state| {
            state.result.clone().unwrap_or_else(|| SignatureSessionResult {
                token: token.to_string(),
                status: AbcSessionStatus::Initialized,
                proof_status: None,
                disclosed: vec![],
                signature: None,
            })
        }))
    }

    async fn verify_signature(&self, signature: &AbcSignature) -> anyhow::Result<AbcVerification> {
        serde_json::from_value(signature.proof.clone())
            .map_err(|e| anyhow::anyhow!("unverifiable proof: {e}"))
    }
}

impl Clock for TestProvider {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().unwrap().unwrap_or_else(Utc::now)
    }
}

impl Provider for TestProvider {}

/// CRL fetcher serving from a fixed map of URLs.
#[derive(Clone, Default, Debug)]
pub struct MapCrlFetcher {
    crls: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail: Arc<Mutex<bool>>,
}

impl MapCrlFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, der: Vec<u8>) {
        self.crls.lock().unwrap().insert(url.to_string(), der);
    }

    /// Make every subsequent fetch fail, simulating an unreachable
    /// distribution point.
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

impl CrlFetcher for MapCrlFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("connection refused");
        }
        self.crls
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no CRL at {url}"))
    }
}
