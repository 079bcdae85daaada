//! # ABC Signature Driver
//!
//! Adapter over the external attribute-based-credential signing provider:
//! starting signature sessions for a contract text, interpreting session
//! results, verifying disclosure signatures, and minting the short-lived
//! identity JWT from a completed session.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, TimeDelta, Utc};
use qrcode::QrCode;
use serde::{Deserialize, Serialize};

use crate::contract::{Contract, TemplateStore, ACTING_PARTY_ATTR, LEGAL_ENTITY_ATTR};
use crate::core::PartyId;
use crate::error::Error;
use crate::provider::{AbcClient, KeyRef, Keystore, Registry};
use crate::validator::{ContractFormat, ValidationResult, ValidationState};

/// Identity tokens are valid for thirty minutes.
#[must_use]
pub fn identity_token_validity() -> TimeDelta {
    TimeDelta::try_minutes(30).unwrap_or_default()
}

/// Status of a disclosure proof as reported by the signing provider.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofStatus {
    /// The proof verified and all attributes are valid.
    Valid,

    /// The proof did not verify.
    Invalid,

    /// One or more disclosed attributes are expired.
    Expired,

    /// The proof does not match the presented message.
    Unmatched,
}

/// Lifecycle states the signing provider reports for a session.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbcSessionStatus {
    /// Session created, waiting for the wallet to pick it up.
    Initialized,

    /// The wallet scanned the session pointer and is interacting.
    Connected,

    /// Signature produced.
    Done,

    /// Cancelled by the user.
    Cancelled,

    /// Expired before completion.
    Timeout,
}

/// A signature request handed to the signing provider.
///
/// `disclose` is a disjunction of conjunctions of attribute identifiers the
/// signer must disclose along with the signature.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignatureRequest {
    /// The contract text to sign.
    pub message: String,

    /// Required attributes: outer list is a disjunction, inner lists are
    /// conjunctions.
    pub disclose: Vec<Vec<String>>,
}

/// Pointer to a running signature session, handed to the user's wallet.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionPointer {
    /// URL the wallet connects to.
    pub u: String,

    /// Kind of session, `signing` for contract signatures.
    #[serde(rename = "type")]
    pub session_type: String,

    /// Opaque session token, used to poll the result.
    #[serde(skip)]
    pub token: String,
}

/// A disclosure signature over a contract text.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AbcSignature {
    /// The signed contract text.
    pub message: String,

    /// The zero-knowledge disclosure proof, opaque to this service.
    pub proof: serde_json::Value,

    /// Provider timestamp of the signature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One disclosed attribute.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DisclosedAttribute {
    /// Fully qualified attribute identifier, scheme manager first.
    pub identifier: String,

    /// The attribute's raw value.
    #[serde(rename = "rawvalue")]
    pub raw_value: String,

    /// Disclosure status as reported by the provider, e.g. `PRESENT`.
    pub status: String,
}

/// The result of verifying a disclosure signature.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AbcVerification {
    /// Outcome of the cryptographic proof check.
    pub proof_status: ProofStatus,

    /// Attributes disclosed by the proof, in disclosure order.
    pub disclosed: Vec<Vec<DisclosedAttribute>>,
}

/// Current result of a signature session as reported by the provider.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignatureSessionResult {
    /// The session token.
    pub token: String,

    /// Session lifecycle status.
    pub status: AbcSessionStatus,

    /// Proof status, present once a signature was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_status: Option<ProofStatus>,

    /// Disclosed attributes, present once a signature was produced.
    #[serde(default)]
    pub disclosed: Vec<Vec<DisclosedAttribute>>,

    /// The signature itself, present once produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<AbcSignature>,
}

/// A contract signed through the ABC system, ready for verification.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignedAbc {
    /// The disclosure signature.
    pub signature: AbcSignature,

    /// Outcome of the proof check.
    pub proof_status: ProofStatus,

    /// Attributes disclosed with the signature.
    pub disclosed: Vec<Vec<DisclosedAttribute>>,

    /// Token of the session that produced the signature, when known.
    #[serde(default)]
    pub token: String,
}

/// Challenge handed back to the caller starting a signing session.
#[derive(Clone, Debug, Serialize)]
pub struct SignChallenge {
    /// Identifier to poll the session with.
    pub session_id: String,

    /// Pointer for the user's wallet.
    pub payload: SessionPointer,
}

impl SignChallenge {
    /// Render the session pointer as a QR code, returned as a base64 encoded
    /// PNG data URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when the payload cannot be serialized
    /// or encoded.
    pub fn to_qrcode(&self) -> Result<String, Error> {
        let payload = serde_json::to_string(&self.payload)
            .map_err(|e| Error::InvalidInput(format!("could not serialize session pointer: {e}")))?;

        let qr_code = QrCode::new(payload)
            .map_err(|e| Error::InvalidInput(format!("could not create QR code: {e}")))?;

        let img_buf = qr_code.render::<image::Luma<u8>>().build();
        let mut buffer: Vec<u8> = Vec::new();
        let mut writer = Cursor::new(&mut buffer);
        img_buf
            .write_to(&mut writer, image::ImageFormat::Png)
            .map_err(|e| Error::InvalidInput(format!("could not render QR code: {e}")))?;

        Ok(format!("data:image/png;base64,{}", Base64::encode_string(buffer.as_slice())))
    }
}

/// Claims of the identity JWT derived from a completed signing session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IdentityClaims {
    /// The legal entity that issued and signed the token.
    pub iss: String,

    /// The serialized signed contract, base64 (standard) encoded.
    pub sig: String,

    /// Format of the signature in `sig`.
    #[serde(rename = "type")]
    pub format: ContractFormat,

    /// Issued-at, seconds since the epoch.
    pub iat: i64,

    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Driver for ABC signature sessions and the verification of their results.
///
/// Holds the template catalog and scheme-manager configuration; all external
/// collaborators are passed per call.
pub struct AbcService {
    templates: Arc<TemplateStore>,
    scheme_manager: String,
}

impl AbcService {
    /// Create a driver using the given catalog and scheme manager.
    #[must_use]
    pub fn new(templates: Arc<TemplateStore>, scheme_manager: impl Into<String>) -> Self {
        Self { templates, scheme_manager: scheme_manager.into() }
    }

    /// Start a signature session for a rendered contract text.
    ///
    /// The text is wrapped in a signature request carrying the template's
    /// signer attributes as a single conjunction; attribute names starting
    /// with a `.` are qualified with the configured scheme manager.
    ///
    /// # Errors
    ///
    /// Returns an error when the text does not match a catalog template or
    /// the signing provider refuses the session.
    pub async fn start_signing_session(
        &self, client: &impl AbcClient, raw_contract_text: &str,
    ) -> Result<SignChallenge, Error> {
        let contract = Contract::parse(raw_contract_text, &self.templates)?;

        let attributes = contract
            .template
            .signer_attributes
            .iter()
            .map(|attr| self.qualify_attribute(attr))
            .collect();
        let request = SignatureRequest {
            message: raw_contract_text.to_string(),
            disclose: vec![attributes],
        };

        let pointer = client
            .start_signing_session(&request)
            .await
            .map_err(|e| Error::InvalidInput(format!("error while creating session: {e}")))?;
        tracing::debug!("signature session created with token {}", pointer.token);

        Ok(SignChallenge { session_id: pointer.token.clone(), payload: pointer })
    }

    /// Verify a signed contract: proof status, template binding, validity
    /// window, acting party and required signer attributes.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first failing check.
    pub fn verify(
        &self, signed: &SignedAbc, acting_party_cn: Option<&str>, now: DateTime<Utc>,
    ) -> Result<ValidationResult, Error> {
        if signed.proof_status != ProofStatus::Valid {
            return Err(Error::ContractInvalid("the proof is invalid".to_string()));
        }

        let contract = Contract::parse(&signed.signature.message, &self.templates)?;
        contract.verify_temporal(now)?;

        let disclosed = self.flatten_disclosed(&signed.disclosed);

        if let Some(acting_party) = contract.params.get(ACTING_PARTY_ATTR) {
            if let Some(cn) = acting_party_cn {
                if !acting_party.eq_ignore_ascii_case(cn) {
                    return Err(Error::ContractInvalid(format!(
                        "acting party {acting_party} does not match caller {cn}"
                    )));
                }
            }
        }

        let disclosed_ids: Vec<&str> =
            signed.disclosed.iter().flatten().map(|a| a.identifier.as_str()).collect();
        for required in &contract.template.signer_attributes {
            let qualified = self.qualify_attribute(required);
            if !disclosed_ids.contains(&qualified.as_str()) {
                return Err(Error::ContractInvalid(format!(
                    "missing required signer attribute {qualified}"
                )));
            }
        }

        Ok(ValidationResult {
            validation_result: ValidationState::Valid,
            contract_format: ContractFormat::Abc,
            disclosed_attributes: disclosed,
        })
    }

    /// Mint the identity JWT for a signed contract.
    ///
    /// The `legal_entity` placeholder is extracted from the contract text and
    /// must reverse-resolve in the registry to `legal_entity`; the token is
    /// signed with that entity's private key.
    ///
    /// # Errors
    ///
    /// Returns an error when the contract names no legal entity, the name
    /// does not resolve to the given party, or signing fails.
    pub async fn create_identity_token(
        &self, provider: &(impl Registry + Keystore), signed: &SignedAbc, legal_entity: &PartyId,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let contract = Contract::parse(&signed.signature.message, &self.templates)?;
        let resolved = self.legal_entity_from_contract(provider, &contract).await?;
        if &resolved != legal_entity {
            return Err(Error::ContractInvalid(format!(
                "contract legal entity resolves to {resolved}, expected {legal_entity}"
            )));
        }

        // only the signature travels; the proof is re-verified on validation
        let serialized = serde_json::to_vec(&signed.signature)
            .map_err(|e| Error::InvalidInput(format!("could not serialize signature: {e}")))?;

        let claims = IdentityClaims {
            iss: legal_entity.to_string(),
            sig: Base64::encode_string(&serialized),
            format: ContractFormat::Abc,
            iat: now.timestamp(),
            exp: (now + identity_token_validity()).timestamp(),
        };
        let claims = serde_json::to_value(&claims)
            .map_err(|e| Error::InvalidInput(format!("could not construct claims: {e}")))?;

        provider
            .sign_jwt(&claims, &KeyRef::for_entity(legal_entity))
            .await
            .map_err(|e| Error::Keystore(e.context("could not sign identity token")))
    }

    /// Resolve the contract's `legal_entity` placeholder to a registered
    /// party through a registry reverse lookup.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContractInvalid` when the placeholder is absent and
    /// `Error::Registry` when the lookup fails.
    pub async fn legal_entity_from_contract(
        &self, registry: &impl Registry, contract: &Contract,
    ) -> Result<PartyId, Error> {
        let Some(name) = contract.params.get(LEGAL_ENTITY_ATTR) else {
            return Err(Error::ContractInvalid(format!(
                "value for [{LEGAL_ENTITY_ATTR}] is missing"
            )));
        };
        let organization = registry.reverse_lookup(name).await.map_err(Error::Registry)?;
        Ok(organization.identifier)
    }

    /// Flatten disclosed attributes to a name→value map, stripping the
    /// scheme-manager prefix so consumers can read by well-known keys.
    #[must_use]
    pub fn flatten_disclosed(
        &self, disclosed: &[Vec<DisclosedAttribute>],
    ) -> HashMap<String, String> {
        let prefix = format!("{}.", self.scheme_manager);
        disclosed
            .iter()
            .flatten()
            .map(|attr| {
                let key = attr
                    .identifier
                    .strip_prefix(&prefix)
                    .unwrap_or(&attr.identifier)
                    .to_string();
                (key, attr.raw_value.clone())
            })
            .collect()
    }

    fn qualify_attribute(&self, attribute: &str) -> String {
        if attribute.starts_with('.') {
            format!("{}{attribute}", self.scheme_manager)
        } else {
            attribute.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const RAW: &str = "NL:BehandelaarLogin:v1 Ondergetekende geeft toestemming aan Demo EHR om \
                       namens verpleeghuis De nootjes en ondergetekende het Nuts netwerk te \
                       bevragen. Deze toestemming is geldig van dinsdag, 1 oktober 2019 13:30:42 \
                       tot dinsdag, 1 oktober 2019 14:30:42.";

    fn service() -> AbcService {
        AbcService::new(Arc::new(TemplateStore::standard().expect("catalog compiles")), "pbdf")
    }

    fn signed(proof_status: ProofStatus) -> SignedAbc {
        SignedAbc {
            signature: AbcSignature {
                message: RAW.to_string(),
                proof: serde_json::json!({"proof": "opaque"}),
                timestamp: None,
            },
            proof_status,
            disclosed: vec![vec![
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
            ]],
            token: "abc-session".to_string(),
        }
    }

    fn in_window() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 10, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn verify_accepts_valid_contract() {
        let result = service().verify(&signed(ProofStatus::Valid), Some("Demo EHR"), in_window())
            .expect("verifies");
        assert_eq!(result.validation_result, ValidationState::Valid);
        assert_eq!(result.contract_format, ContractFormat::Abc);
        assert_eq!(result.disclosed_attributes["gemeente.personalData.firstnames"], "Jan");
        assert_eq!(result.disclosed_attributes["pbdf.email.email"], "jan@example.com");
    }

    #[test]
    fn verify_rejects_invalid_proof() {
        let err = service()
            .verify(&signed(ProofStatus::Invalid), Some("Demo EHR"), in_window())
            .unwrap_err();
        assert!(matches!(err, Error::ContractInvalid(_)));
    }

    #[test]
    fn verify_matches_acting_party_case_insensitively() {
        let service = service();
        assert!(service.verify(&signed(ProofStatus::Valid), Some("demo ehr"), in_window()).is_ok());
        let err =
            service.verify(&signed(ProofStatus::Valid), Some("Other EHR"), in_window()).unwrap_err();
        assert!(matches!(err, Error::ContractInvalid(_)));
    }

    #[test]
    fn verify_requires_all_signer_attributes() {
        let mut signed = signed(ProofStatus::Valid);
        signed.disclosed[0].pop();
        let err = service().verify(&signed, Some("Demo EHR"), in_window()).unwrap_err();
        assert!(matches!(err, Error::ContractInvalid(_)));
    }

    #[test]
    fn verify_enforces_contract_window() {
        let late = Utc.with_ymd_and_hms(2020, 10, 29, 0, 0, 0).unwrap();
        let err = service().verify(&signed(ProofStatus::Valid), Some("Demo EHR"), late).unwrap_err();
        assert!(matches!(err, Error::ContractExpired(_)));
    }

    #[test]
    fn qualifies_dot_prefixed_attributes() {
        let service = service();
        assert_eq!(
            service.qualify_attribute(".gemeente.personalData.firstnames"),
            "pbdf.gemeente.personalData.firstnames"
        );
        assert_eq!(service.qualify_attribute(".pbdf.email.email"), "pbdf.pbdf.email.email");
        // already qualified names pass through untouched
        assert_eq!(
            service.qualify_attribute("pbdf.gemeente.personalData.fullname"),
            "pbdf.gemeente.personalData.fullname"
        );
    }
}
