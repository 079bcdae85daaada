//! UZI smartcard profile.
//!
//! Contracts signed with a qualified healthcare smartcard arrive as a JWS
//! whose `x5c` chain terminates at the card issuer's root. The production
//! and acceptance environments differ only in their certificate bundles.
//! The professional's identifiers travel in the leaf certificate's SAN
//! `otherName` entry as dash-separated fields.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{Contract, TemplateStore};
use crate::error::Error;
use crate::x509::crl::CrlFetcher;
use crate::x509::{has_extended_key_usage, subject_alt_name_other_names, Cert, JwsX509Token,
    X509Validator};

/// Extended key usage required on document-signing smartcard certificates,
/// per the card issuer's certification practice statement.
pub const EXT_KEY_USAGE_DOCUMENT_SIGNING: &str = "1.3.6.1.4.1.311.10.3.12";

// Attribute names for the dash-separated SAN otherName fields, in wire
// order. See table 12 of the CPS UZI-register.
const UZI_ATTRIBUTE_NAMES: [&str; 7] =
    ["oidCa", "version", "uziNr", "cardType", "orgID", "rollCode", "agbCode"];

/// The UZI certificate environment to validate against.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UziEnvironment {
    /// The production certificate tree.
    Production,

    /// The acceptance certificate tree.
    Acceptation,
}

/// Trust anchors for one UZI environment.
#[derive(Clone, Debug)]
pub struct UziTrustBundle {
    /// The environment the bundle belongs to.
    pub environment: UziEnvironment,

    /// Root certificates.
    pub roots: Vec<Cert>,

    /// Intermediate certificates.
    pub intermediates: Vec<Cert>,
}

impl UziTrustBundle {
    /// Load a bundle from DER certificate files on disk.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when a file cannot be read and
    /// `Error::CryptoInvalid` when its contents are not a DER certificate.
    pub fn from_files(
        environment: UziEnvironment, roots: &[impl AsRef<Path>], intermediates: &[impl AsRef<Path>],
    ) -> Result<Self, Error> {
        let read = |path: &Path| -> Result<Cert, Error> {
            let der = fs::read(path).map_err(|e| {
                Error::InvalidInput(format!("could not read certificate {}: {e}", path.display()))
            })?;
            Cert::from_der(der)
        };
        Ok(Self {
            environment,
            roots: roots.iter().map(|p| read(p.as_ref())).collect::<Result<_, _>>()?,
            intermediates: intermediates
                .iter()
                .map(|p| read(p.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// A contract signed with a UZI smartcard: the token plus the contract bound
/// from its `message` claim.
#[derive(Clone, Debug)]
pub struct UziSignedToken {
    /// The parsed JWS with its certificate chain.
    pub token: JwsX509Token,

    /// The contract carried in the `message` claim.
    pub contract: Contract,
}

impl UziSignedToken {
    /// The card holder's attributes from the leaf certificate's SAN
    /// `otherName` entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when the certificate carries no
    /// `otherName` with the expected number of dash-separated fields.
    pub fn signer_attributes(&self) -> Result<HashMap<String, String>, Error> {
        let other_names = subject_alt_name_other_names(self.token.leaf())?;

        for (_, value) in &other_names {
            let parts: Vec<&str> = value.split('-').collect();
            if parts.len() != UZI_ATTRIBUTE_NAMES.len() {
                continue;
            }
            return Ok(UZI_ATTRIBUTE_NAMES
                .iter()
                .zip(parts)
                .map(|(name, part)| ((*name).to_string(), part.to_string()))
                .collect());
        }

        Err(Error::CryptoInvalid(
            "could not extract signer attributes from certificate".to_string(),
        ))
    }
}

/// Validator for UZI-signed contract tokens.
pub struct UziVerifier<F: CrlFetcher> {
    environment: UziEnvironment,
    validator: X509Validator<F>,
    templates: Arc<TemplateStore>,
}

impl<F: CrlFetcher> UziVerifier<F> {
    /// Create a verifier for the given trust bundle.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when a bundle root is not a
    /// self-signed CA.
    pub fn new(
        bundle: UziTrustBundle, templates: Arc<TemplateStore>, crl_fetcher: F,
    ) -> Result<Self, Error> {
        Ok(Self {
            environment: bundle.environment,
            validator: X509Validator::new(bundle.roots, bundle.intermediates, crl_fetcher)?,
            templates,
        })
    }

    /// The environment this verifier validates against.
    #[must_use]
    pub const fn environment(&self) -> UziEnvironment {
        self.environment
    }

    /// Parse a raw token and bind its `message` claim to a contract
    /// template. No cryptographic checks are performed.
    ///
    /// # Errors
    ///
    /// Returns an error when the token is structurally invalid or the
    /// message does not match any catalog template.
    pub fn parse(&self, raw_token: &str) -> Result<UziSignedToken, Error> {
        let token = self.validator.parse(raw_token)?;
        let contract = Contract::parse(&token.message, &self.templates)?;
        Ok(UziSignedToken { token, contract })
    }

    /// Run the full verification pipeline over a parsed token: subject
    /// alternative names, certificate chain, JWS signature, token temporal
    /// claims, revocation, the document-signing key usage, and the
    /// contract's own validity window.
    ///
    /// A certificate that carries no attribute encoding in its SAN is not
    /// rejected here; readers of [`UziSignedToken::signer_attributes`] get
    /// the error instead.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step.
    pub async fn verify(&self, signed: &UziSignedToken, now: DateTime<Utc>) -> Result<(), Error> {
        subject_alt_name_other_names(signed.token.leaf())
            .map_err(|e| Error::CryptoInvalid(format!("invalid signer attributes: {e}")))?;

        self.validator.verify(&signed.token, now).await?;

        if !has_extended_key_usage(signed.token.leaf(), EXT_KEY_USAGE_DOCUMENT_SIGNING)? {
            return Err(Error::CryptoInvalid(format!(
                "certificate is missing the extended key usage for document signing \
                 ({EXT_KEY_USAGE_DOCUMENT_SIGNING})"
            )));
        }

        signed.contract.verify_temporal(now)?;

        Ok(())
    }
}
