//! # Contract Validator Facade
//!
//! Dispatches signed contracts to the verifier for their format and yields a
//! unified [`ValidationResult`]. Formats are a closed sum: adding a format
//! means extending [`ContractFormat`] and every match over it.

use std::collections::HashMap;
use std::fmt;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::abc::{AbcService, AbcSignature, IdentityClaims, SignedAbc};
use crate::core::PartyId;
use crate::error::Error;
use crate::jose;
use crate::provider::{AbcClient, Registry};
use crate::x509::crl::CrlFetcher;
use crate::x509::uzi::UziVerifier;

/// Format of a signed contract.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContractFormat {
    /// An attribute-based-credential disclosure signature.
    Abc,

    /// A JWS whose certificate chain terminates at a qualified root.
    Jws,
}

impl fmt::Display for ContractFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abc => f.write_str("abc"),
            Self::Jws => f.write_str("jws"),
        }
    }
}

/// Outcome of a contract validation.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationState {
    /// The contract and its signature check out.
    Valid,

    /// The contract parsed but a semantic or cryptographic check failed.
    Invalid,
}

/// The unified result of validating a signed contract.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ValidationResult {
    /// Outcome of the validation.
    pub validation_result: ValidationState,

    /// Format of the validated contract.
    pub contract_format: ContractFormat,

    /// The attributes used to sign the contract, by well-known key.
    pub disclosed_attributes: HashMap<String, String>,
}

impl ValidationResult {
    fn invalid(format: ContractFormat) -> Self {
        Self {
            validation_result: ValidationState::Invalid,
            contract_format: format,
            disclosed_attributes: HashMap::new(),
        }
    }
}

/// The set of active contract verifiers.
///
/// Verifiers are optional so deployments can run ABC-only or UZI-only; a
/// contract for a deactivated format is rejected as invalid input.
pub struct ContractValidators<F: CrlFetcher> {
    abc: Option<AbcService>,
    uzi: Option<UziVerifier<F>>,
}

impl<F: CrlFetcher> ContractValidators<F> {
    /// Combine the active verifiers into a facade.
    #[must_use]
    pub fn new(abc: Option<AbcService>, uzi: Option<UziVerifier<F>>) -> Self {
        Self { abc, uzi }
    }

    /// The ABC driver, when active.
    #[must_use]
    pub fn abc(&self) -> Option<&AbcService> {
        self.abc.as_ref()
    }

    /// The UZI verifier, when active.
    #[must_use]
    pub fn uzi(&self) -> Option<&UziVerifier<F>> {
        self.uzi.as_ref()
    }

    /// Validate a signed contract of the given format.
    ///
    /// For [`ContractFormat::Abc`] the raw string is the base64 encoded
    /// serialized disclosure signature; for [`ContractFormat::Jws`] it is the
    /// compact JWS itself. Semantic failures (expired window, attribute or
    /// acting-party mismatch) yield an `INVALID` result; structural and
    /// collaborator failures yield an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the contract cannot be decoded or an external
    /// collaborator fails.
    pub async fn validate(
        &self, provider: &impl AbcClient, raw: &str, format: ContractFormat,
        acting_party_cn: Option<&str>, now: DateTime<Utc>,
    ) -> Result<ValidationResult, Error> {
        let outcome = match format {
            ContractFormat::Abc => {
                let abc = self.abc.as_ref().ok_or_else(|| {
                    Error::InvalidInput("abc contracts are not accepted by this node".to_string())
                })?;
                let decoded = Base64::decode_vec(raw).map_err(|e| {
                    Error::InvalidInput(format!("could not base64-decode contract: {e}"))
                })?;
                let signature: AbcSignature = serde_json::from_slice(&decoded).map_err(|e| {
                    Error::InvalidInput(format!("could not deserialize contract: {e}"))
                })?;
                let verification = provider
                    .verify_signature(&signature)
                    .await
                    .map_err(|e| Error::InvalidInput(format!("proof verification failed: {e}")))?;
                let signed = SignedAbc {
                    signature,
                    proof_status: verification.proof_status,
                    disclosed: verification.disclosed,
                    token: String::new(),
                };
                abc.verify(&signed, acting_party_cn, now)
            }
            ContractFormat::Jws => {
                let uzi = self.uzi.as_ref().ok_or_else(|| {
                    Error::InvalidInput("jws contracts are not accepted by this node".to_string())
                })?;
                let signed = uzi.parse(raw)?;
                match uzi.verify(&signed, now).await {
                    Ok(()) => Ok(ValidationResult {
                        validation_result: ValidationState::Valid,
                        contract_format: ContractFormat::Jws,
                        disclosed_attributes: signed.signer_attributes()?,
                    }),
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(result) => Ok(result),
            // semantic failures surface as an INVALID result
            Err(
                e @ (Error::ContractInvalid(_)
                | Error::ContractExpired(_)
                | Error::ContractNotYetValid(_)),
            ) => {
                tracing::debug!("contract validation failed: {e}");
                Ok(ValidationResult::invalid(format))
            }
            Err(e) => Err(e),
        }
    }

    /// Validate a nested identity JWT: verify its signature against the
    /// issuing organization's current public key from the registry, then
    /// dispatch the inner `sig` claim to the verifier for its declared type.
    ///
    /// # Errors
    ///
    /// Returns an error when the token cannot be decoded, its issuer is
    /// unknown, its signature does not verify or it is expired.
    pub async fn validate_identity_jwt(
        &self, provider: &(impl Registry + AbcClient), token: &str, acting_party_cn: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ValidationResult, Error> {
        let jws = jose::decode(token)?;
        let claims: IdentityClaims = jws.claims()?;

        let legal_entity = PartyId::parse(claims.iss.as_str())
            .map_err(|_| Error::CryptoInvalid(format!("invalid token issuer: {}", claims.iss)))?;
        let organization =
            provider.organization_by_id(&legal_entity).await.map_err(Error::Registry)?;
        let Some(public_key) = &organization.public_key else {
            return Err(Error::CryptoInvalid(format!(
                "no current public key for {legal_entity}"
            )));
        };

        jose::verify_signature(
            jws.header.alg,
            public_key,
            jws.signing_input.as_bytes(),
            &jws.signature,
        )?;
        jose::verify_temporal_claims(Some(claims.exp), None, Some(claims.iat), now)?;

        let inner = Base64::decode_vec(&claims.sig)
            .map_err(|e| Error::InvalidInput(format!("could not decode sig claim: {e}")))?;

        match claims.format {
            ContractFormat::Abc => {
                let raw = Base64::encode_string(&inner);
                self.validate(provider, &raw, ContractFormat::Abc, acting_party_cn, now).await
            }
            ContractFormat::Jws => {
                let raw = String::from_utf8(inner).map_err(|_| {
                    Error::InvalidInput("sig claim does not contain a JWS".to_string())
                })?;
                self.validate(provider, &raw, ContractFormat::Jws, acting_party_cn, now).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_format_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ContractFormat::Abc).unwrap(), r#""abc""#);
        assert_eq!(serde_json::to_string(&ContractFormat::Jws).unwrap(), r#""jws""#);
    }

    #[test]
    fn validation_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&ValidationState::Valid).unwrap(), r#""VALID""#);
        assert_eq!(serde_json::to_string(&ValidationState::Invalid).unwrap(), r#""INVALID""#);
    }
}
