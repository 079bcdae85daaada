//! # X.509 Token Verification
//!
//! Verification of contracts signed as a JWS whose `x5c` header chains up to
//! a qualified root: certificate chain building against configured trust
//! anchors, JWS signature verification under the leaf key, and revocation
//! checking through cached CRLs.

pub mod crl;
pub mod uzi;

use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer as _;
use x509_parser::time::ASN1Time;

use crate::error::Error;
use crate::jose::{self, DecodedJws};
use crate::x509::crl::{CrlFetcher, CrlVerifier};

/// An X.509 certificate carried as owned DER bytes, parsed on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cert(Vec<u8>);

impl Cert {
    /// Wrap DER bytes, validating that they parse as a certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when the bytes are not a DER
    /// certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, Error> {
        X509Certificate::from_der(&der)
            .map_err(|e| Error::CryptoInvalid(format!("could not parse certificate: {e}")))?;
        Ok(Self(der))
    }

    /// Decode a certificate from its base64 (standard alphabet) DER form, as
    /// carried in an `x5c` header.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` on invalid base64 or DER.
    pub fn from_base64(b64: &str) -> Result<Self, Error> {
        use base64ct::{Base64, Encoding};
        let der = Base64::decode_vec(b64)
            .map_err(|e| Error::CryptoInvalid(format!("invalid x5c certificate encoding: {e}")))?;
        Self::from_der(der)
    }

    /// The certificate in base64 (standard alphabet) DER form.
    #[must_use]
    pub fn to_base64(&self) -> String {
        use base64ct::{Base64, Encoding};
        Base64::encode_string(&self.0)
    }

    /// The raw DER bytes.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn parse(&self) -> Result<X509Certificate<'_>, Error> {
        let (_, cert) = X509Certificate::from_der(&self.0)
            .map_err(|e| Error::CryptoInvalid(format!("could not parse certificate: {e}")))?;
        Ok(cert)
    }

    /// The certificate's SubjectPublicKeyInfo in DER form.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when the certificate does not parse.
    pub fn public_key_der(&self) -> Result<Vec<u8>, Error> {
        Ok(self.parse()?.public_key().raw.to_vec())
    }
}

/// Claims of a contract-bearing JWS.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct JwsContractClaims {
    /// Issued-at, seconds since the epoch.
    pub iat: Option<i64>,

    /// Expiry, seconds since the epoch.
    pub exp: Option<i64>,

    /// Not-before, seconds since the epoch.
    pub nbf: Option<i64>,
}

/// A parsed but not yet verified contract JWS with its `x5c` chain.
#[derive(Clone, Debug)]
pub struct JwsX509Token {
    /// The decoded compact JWS.
    pub jws: DecodedJws,

    /// Temporal claims of the token.
    pub claims: JwsContractClaims,

    /// The contract text from the `message` claim.
    pub message: String,

    /// Certificates from the `x5c` header, leaf first.
    pub chain: Vec<Cert>,
}

impl JwsX509Token {
    /// The leaf certificate the token was signed with.
    #[must_use]
    pub fn leaf(&self) -> &Cert {
        // parse() guarantees a non-empty chain
        &self.chain[0]
    }
}

/// Verifier for JWS tokens carrying an `x5c` certificate chain.
///
/// Holds the configured trust anchors and the CRL verifier. Extra
/// intermediates presented inside a token's `x5c` header participate in path
/// building but trust always terminates at a configured root.
#[derive(Debug)]
pub struct X509Validator<F: CrlFetcher> {
    roots: Vec<Cert>,
    intermediates: Vec<Cert>,
    crl: CrlVerifier<F>,
}

impl<F: CrlFetcher> X509Validator<F> {
    /// Create a validator from trust anchors.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when a configured root is not a
    /// self-signed CA certificate.
    pub fn new(
        roots: Vec<Cert>, intermediates: Vec<Cert>, crl_fetcher: F,
    ) -> Result<Self, Error> {
        for root in &roots {
            let parsed = root.parse()?;
            let self_signed = parsed.tbs_certificate.subject.as_raw()
                == parsed.tbs_certificate.issuer.as_raw()
                && parsed.verify_signature(None).is_ok();
            if !parsed.is_ca() || !self_signed {
                return Err(Error::CryptoInvalid("certificate is not a root CA".to_string()));
            }
        }
        Ok(Self { roots, intermediates, crl: CrlVerifier::new(crl_fetcher) })
    }

    /// Parse a compact JWS into a [`JwsX509Token`].
    ///
    /// Requires `typ` to be `JWT`, an `x5c` header with at least one
    /// certificate, and a string `message` claim. No cryptographic checks are
    /// performed; call [`Self::verify`] for those.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when the token violates any of the
    /// structural requirements above.
    pub fn parse(&self, raw_token: &str) -> Result<JwsX509Token, Error> {
        let jws = jose::decode(raw_token)?;

        if jws.header.typ.as_deref() != Some("JWT") {
            return Err(Error::CryptoInvalid("token is not a JWT".to_string()));
        }

        let Some(x5c) = &jws.header.x5c else {
            return Err(Error::CryptoInvalid("missing x5c header".to_string()));
        };
        if x5c.is_empty() {
            return Err(Error::CryptoInvalid("token does not have a certificate".to_string()));
        }
        let chain = x5c.iter().map(|c| Cert::from_base64(c)).collect::<Result<Vec<_>, _>>()?;

        let value: serde_json::Value = jws.claims()?;
        let message = value
            .get("message")
            .ok_or_else(|| Error::CryptoInvalid("jwt did not contain a message field".to_string()))?
            .as_str()
            .ok_or_else(|| {
                Error::CryptoInvalid("message field should contain a string".to_string())
            })?
            .to_string();
        let claims: JwsContractClaims = jws.claims()?;

        Ok(JwsX509Token { jws, claims, message, chain })
    }

    /// Verify a parsed token: certificate chain, JWS signature, temporal
    /// claims and revocation.
    ///
    /// Chain verification runs at the token's `iat` (or `now` when absent);
    /// temporal claims and CRL windows are checked against `now`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when any check fails and
    /// `Error::CrlUnavailable` when revocation status cannot be determined.
    pub async fn verify(&self, token: &JwsX509Token, now: DateTime<Utc>) -> Result<(), Error> {
        let at = token.claims.iat.and_then(|iat| DateTime::from_timestamp(iat, 0)).unwrap_or(now);

        let chains = self.verify_chain(&token.chain, at)?;

        let spki = token.leaf().public_key_der()?;
        jose::verify_signature(
            token.jws.header.alg,
            &spki,
            token.jws.signing_input.as_bytes(),
            &token.jws.signature,
        )?;

        jose::verify_temporal_claims(token.claims.exp, token.claims.nbf, token.claims.iat, now)?;

        for chain in &chains {
            self.check_revocation(chain, now).await?;
        }

        Ok(())
    }

    /// Build verified chains from the leaf up to a configured root.
    ///
    /// Candidate intermediates are the remaining token certificates plus the
    /// configured intermediates; each link is checked for subject/issuer
    /// correspondence, signature validity and its validity window at `at`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when no chain terminates at a
    /// configured root.
    pub fn verify_chain(
        &self, token_chain: &[Cert], at: DateTime<Utc>,
    ) -> Result<Vec<Vec<Cert>>, Error> {
        let Some(leaf) = token_chain.first() else {
            return Err(Error::CryptoInvalid("token does not have a certificate".to_string()));
        };

        let pool: Vec<&Cert> = token_chain
            .iter()
            .skip(1)
            .chain(self.intermediates.iter())
            .filter(|c| !self.roots.contains(*c))
            .collect();

        let mut chains = vec![];
        let mut path = vec![leaf.clone()];
        self.extend_chain(leaf, &pool, at, &mut path, &mut chains)?;

        if chains.is_empty() {
            return Err(Error::CryptoInvalid(
                "unable to verify certificate chain: certificate signed by unknown authority"
                    .to_string(),
            ));
        }
        Ok(chains)
    }

    fn extend_chain(
        &self, current: &Cert, pool: &[&Cert], at: DateTime<Utc>, path: &mut Vec<Cert>,
        chains: &mut Vec<Vec<Cert>>,
    ) -> Result<(), Error> {
        let cur = current.parse()?;
        if !cur.validity().is_valid_at(asn1_time(at)?) {
            return Ok(());
        }

        for root in &self.roots {
            let parsed_root = root.parse()?;
            if cur.tbs_certificate.issuer.as_raw() == parsed_root.tbs_certificate.subject.as_raw()
                && cur.verify_signature(Some(parsed_root.public_key())).is_ok()
                && parsed_root.validity().is_valid_at(asn1_time(at)?)
            {
                let mut chain = path.clone();
                chain.push(root.clone());
                chains.push(chain);
            }
        }

        for candidate in pool {
            if path.contains(*candidate) {
                continue;
            }
            let cand = candidate.parse()?;
            if cur.tbs_certificate.issuer.as_raw() == cand.tbs_certificate.subject.as_raw()
                && cand.is_ca()
                && cur.verify_signature(Some(cand.public_key())).is_ok()
            {
                path.push((*candidate).clone());
                self.extend_chain(candidate, pool, at, path, chains)?;
                path.pop();
            }
        }

        Ok(())
    }

    /// Check revocation for every non-root certificate in the chain that
    /// carries a CRL distribution point.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when a certificate is revoked or a CRL
    /// fails verification, and `Error::CrlUnavailable` when a CRL cannot be
    /// obtained.
    pub async fn check_revocation(
        &self, chain: &[Cert], now: DateTime<Utc>,
    ) -> Result<(), Error> {
        for pair in chain.windows(2) {
            let [cert, issuer] = pair else { continue };
            for url in crl_distribution_points(cert)? {
                self.crl.check(&url, cert, issuer, now).await?;
            }
        }
        Ok(())
    }
}

/// CRL distribution point URIs of a certificate.
fn crl_distribution_points(cert: &Cert) -> Result<Vec<String>, Error> {
    let parsed = cert.parse()?;
    let mut urls = vec![];
    for ext in parsed.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in &points.points {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            urls.push((*uri).to_string());
                        }
                    }
                }
            }
        }
    }
    Ok(urls)
}

/// Whether the certificate carries the given extended key usage OID.
pub(crate) fn has_extended_key_usage(cert: &Cert, oid: &str) -> Result<bool, Error> {
    let parsed = cert.parse()?;
    for ext in parsed.extensions() {
        if let ParsedExtension::ExtendedKeyUsage(eku) = ext.parsed_extension() {
            if eku.other.iter().any(|o| o.to_id_string() == oid) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// SAN `otherName` entries of a certificate as `(type OID, value)` pairs,
/// for entries whose value decodes to a string.
pub(crate) fn subject_alt_name_other_names(cert: &Cert) -> Result<Vec<(String, String)>, Error> {
    let parsed = cert.parse()?;
    let mut names = vec![];
    for ext in parsed.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::OtherName(oid, value) = name {
                    if let Some(s) = der_string(value) {
                        names.push((oid.to_id_string(), s));
                    }
                }
            }
        }
    }
    Ok(names)
}

// The otherName value is `[0] EXPLICIT ANY`; peel constructed tags until a
// primitive string is reached.
fn der_string(mut data: &[u8]) -> Option<String> {
    loop {
        if data.len() < 2 {
            return None;
        }
        let tag = data[0];
        let (len, header_len) = der_length(&data[1..])?;
        let content = data.get(1 + header_len..1 + header_len + len)?;

        if tag & 0x20 != 0 {
            data = content;
            continue;
        }
        // UTF8String, PrintableString, IA5String
        return match tag {
            0x0C | 0x13 | 0x16 => String::from_utf8(content.to_vec()).ok(),
            _ => None,
        };
    }
}

fn der_length(data: &[u8]) -> Option<(usize, usize)> {
    let first = *data.first()?;
    if first < 0x80 {
        return Some((first as usize, 1));
    }
    let num_bytes = (first & 0x7f) as usize;
    if num_bytes == 0 || num_bytes > 2 {
        return None;
    }
    let mut len = 0usize;
    for i in 0..num_bytes {
        len = (len << 8) | *data.get(1 + i)? as usize;
    }
    Some((len, 1 + num_bytes))
}

fn asn1_time(at: DateTime<Utc>) -> Result<ASN1Time, Error> {
    ASN1Time::from_timestamp(at.timestamp())
        .map_err(|e| Error::CryptoInvalid(format!("invalid validation time: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_length_forms() {
        assert_eq!(der_length(&[0x05]), Some((5, 1)));
        assert_eq!(der_length(&[0x81, 0x80]), Some((128, 2)));
        assert_eq!(der_length(&[0x82, 0x01, 0x00]), Some((256, 3)));
        assert_eq!(der_length(&[0x80]), None);
    }

    #[test]
    fn der_string_unwraps_explicit_tag() {
        // [0] EXPLICIT UTF8String "ab"
        let data = [0xA0, 0x04, 0x0C, 0x02, b'a', b'b'];
        assert_eq!(der_string(&data), Some("ab".to_string()));
    }

    #[test]
    fn der_string_rejects_non_string_content() {
        // [0] EXPLICIT INTEGER 1
        let data = [0xA0, 0x03, 0x02, 0x01, 0x01];
        assert_eq!(der_string(&data), None);
    }

    #[test]
    fn cert_rejects_garbage() {
        assert!(Cert::from_der(vec![0x30, 0x03, 0x01, 0x01, 0x00]).is_err());
        assert!(Cert::from_base64("not base64!").is_err());
    }
}
