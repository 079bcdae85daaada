//! # JSON Web Signatures
//!
//! Compact JWS ([RFC 7515]) decoding and signature verification for the token
//! formats used by the service.
//!
//! The signature algorithm whitelist is the [`Algorithm`] enum itself: a
//! token using `none`, an HMAC algorithm or anything else outside the list
//! fails header deserialization before any downstream check runs.
//!
//! [RFC 7515]: https://www.rfc-editor.org/rfc/rfc7515

use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::signature::Verifier as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};

use crate::error::Error;

/// Signature algorithms accepted on any token handled by the service.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256.
    RS256,
    /// RSASSA-PKCS1-v1_5 using SHA-512.
    RS512,
    /// RSASSA-PSS using SHA-256.
    PS256,
    /// RSASSA-PSS using SHA-384.
    PS384,
    /// RSASSA-PSS using SHA-512.
    PS512,
    /// ECDSA using P-256 and SHA-256.
    ES256,
    /// ECDSA using P-384 and SHA-384.
    ES384,
    /// ECDSA using P-521 and SHA-512.
    ES512,
}

/// JOSE header of a compact JWS.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Header {
    /// Signature algorithm.
    pub alg: Algorithm,

    /// Token type; `JWT` for every token handled here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    /// Certificate chain, base64 (standard, not URL) DER encoded, leaf first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,

    /// Key identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// A decoded but not yet verified compact JWS.
#[derive(Clone, Debug)]
pub struct DecodedJws {
    /// The deserialized JOSE header.
    pub header: Header,

    /// The raw payload bytes.
    pub payload: Vec<u8>,

    /// The raw signature bytes.
    pub signature: Vec<u8>,

    /// The `<header>.<payload>` signing input.
    pub signing_input: String,
}

impl DecodedJws {
    /// Deserialize the payload into typed claims.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when the payload is not valid JSON for
    /// the target type.
    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::InvalidInput(format!("could not deserialize claims: {e}")))
    }
}

/// Decode a compact JWS without verifying its signature.
///
/// # Errors
///
/// Returns `Error::CryptoInvalid` when the token is not a three-part compact
/// JWS or its header names an algorithm outside the whitelist.
pub fn decode(token: &str) -> Result<DecodedJws, Error> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header, payload, signature] = parts.as_slice() else {
        return Err(Error::CryptoInvalid("invalid compact JWS format".to_string()));
    };

    let header_bytes = Base64UrlUnpadded::decode_vec(header)
        .map_err(|e| Error::CryptoInvalid(format!("could not decode header: {e}")))?;
    let header: Header = serde_json::from_slice(&header_bytes)
        .map_err(|e| Error::CryptoInvalid(format!("could not deserialize header: {e}")))?;

    let payload_bytes = Base64UrlUnpadded::decode_vec(payload)
        .map_err(|e| Error::CryptoInvalid(format!("could not decode payload: {e}")))?;
    let signature_bytes = Base64UrlUnpadded::decode_vec(signature)
        .map_err(|e| Error::CryptoInvalid(format!("could not decode signature: {e}")))?;

    Ok(DecodedJws {
        header,
        payload: payload_bytes,
        signature: signature_bytes,
        signing_input: format!("{}.{}", parts[0], parts[1]),
    })
}

/// Verify a JWS signature against a public key in SubjectPublicKeyInfo DER
/// form, typically taken from an X.509 certificate.
///
/// # Errors
///
/// Returns `Error::CryptoInvalid` when the key does not match the algorithm
/// or the signature does not verify.
pub fn verify_signature(
    alg: Algorithm, spki_der: &[u8], message: &[u8], signature: &[u8],
) -> Result<(), Error> {
    match alg {
        Algorithm::RS256 => {
            let key = rsa_key(spki_der)?;
            let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
        Algorithm::RS512 => {
            let key = rsa_key(spki_der)?;
            let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha512>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
        Algorithm::PS256 => {
            let key = rsa_key(spki_der)?;
            let verifying_key = rsa::pss::VerifyingKey::<Sha256>::new(key);
            let sig = rsa::pss::Signature::try_from(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
        Algorithm::PS384 => {
            let key = rsa_key(spki_der)?;
            let verifying_key = rsa::pss::VerifyingKey::<Sha384>::new(key);
            let sig = rsa::pss::Signature::try_from(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
        Algorithm::PS512 => {
            let key = rsa_key(spki_der)?;
            let verifying_key = rsa::pss::VerifyingKey::<Sha512>::new(key);
            let sig = rsa::pss::Signature::try_from(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
        Algorithm::ES256 => {
            use p256::ecdsa::{Signature, VerifyingKey};
            use p256::pkcs8::DecodePublicKey as _;
            let verifying_key = VerifyingKey::from_public_key_der(spki_der)
                .map_err(|e| Error::CryptoInvalid(format!("invalid P-256 public key: {e}")))?;
            let sig = Signature::from_slice(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
        Algorithm::ES384 => {
            use p384::ecdsa::{Signature, VerifyingKey};
            use p384::pkcs8::DecodePublicKey as _;
            let verifying_key = VerifyingKey::from_public_key_der(spki_der)
                .map_err(|e| Error::CryptoInvalid(format!("invalid P-384 public key: {e}")))?;
            let sig = Signature::from_slice(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
        Algorithm::ES512 => {
            use p521::ecdsa::{Signature, VerifyingKey};
            use p521::elliptic_curve::sec1::ToEncodedPoint as _;
            use p521::pkcs8::DecodePublicKey as _;
            let public_key = p521::PublicKey::from_public_key_der(spki_der)
                .map_err(|e| Error::CryptoInvalid(format!("invalid P-521 public key: {e}")))?;
            let verifying_key = VerifyingKey::from_encoded_point(&public_key.to_encoded_point(false))
                .map_err(|e| Error::CryptoInvalid(format!("invalid P-521 public key: {e}")))?;
            let sig = Signature::from_slice(signature)
                .map_err(|e| Error::CryptoInvalid(format!("malformed signature: {e}")))?;
            verifying_key
                .verify(message, &sig)
                .map_err(|e| Error::CryptoInvalid(format!("signature verification failed: {e}")))
        }
    }
}

fn rsa_key(spki_der: &[u8]) -> Result<rsa::RsaPublicKey, Error> {
    use rsa::pkcs8::DecodePublicKey as _;
    rsa::RsaPublicKey::from_public_key_der(spki_der)
        .map_err(|e| Error::CryptoInvalid(format!("invalid RSA public key: {e}")))
}

/// Standard JWT temporal claim checks: `exp`, `nbf` and `iat` against the
/// given instant. Absent claims pass; `iat` may not lie in the future.
///
/// # Errors
///
/// Returns `Error::CryptoInvalid` when the token is expired, not yet valid
/// or issued in the future.
pub fn verify_temporal_claims(
    exp: Option<i64>, nbf: Option<i64>, iat: Option<i64>, now: chrono::DateTime<chrono::Utc>,
) -> Result<(), Error> {
    let now = now.timestamp();
    if let Some(exp) = exp {
        if now > exp {
            return Err(Error::CryptoInvalid("token is expired".to_string()));
        }
    }
    if let Some(nbf) = nbf {
        if now < nbf {
            return Err(Error::CryptoInvalid("token is not valid yet".to_string()));
        }
    }
    if let Some(iat) = iat {
        if now < iat {
            return Err(Error::CryptoInvalid("token used before issued".to_string()));
        }
    }
    Ok(())
}
