//! Certificate revocation lists.
//!
//! CRLs are fetched through a pluggable [`CrlFetcher`] and cached per URL.
//! A fetched list is reused until its `nextUpdate`; a failed fetch is
//! remembered for sixty seconds so an unreachable distribution point does
//! not hammer the network. A fetch failure is fatal to verification unless a
//! fresh cached copy is available.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use x509_parser::prelude::FromDer as _;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::error::Error;
use crate::x509::Cert;

const NEGATIVE_CACHE_TTL_SECONDS: i64 = 60;

/// Fetches CRL bytes from a distribution point.
pub trait CrlFetcher: Send + Sync {
    /// Fetch the DER encoded CRL at the given URL.
    fn fetch(&self, url: &str) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;
}

/// Default fetcher retrieving CRLs over HTTP.
#[derive(Clone, Debug, Default)]
pub struct HttpCrlFetcher {
    client: reqwest::Client,
}

impl HttpCrlFetcher {
    /// Create a fetcher with a default HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CrlFetcher for HttpCrlFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Clone, Debug)]
enum CacheEntry {
    Crl { der: Arc<Vec<u8>>, expires_at: DateTime<Utc> },
    Failed { until: DateTime<Utc> },
}

/// CRL verifier with a URL-keyed result cache.
///
/// Many readers, single writer per URL; negative entries expire on their own
/// TTL and never displace a still-fresh positive entry.
#[derive(Debug)]
pub struct CrlVerifier<F> {
    fetcher: F,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl<F: CrlFetcher> CrlVerifier<F> {
    /// Create a verifier around the given fetcher.
    #[must_use]
    pub fn new(fetcher: F) -> Self {
        Self { fetcher, cache: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Check that `cert` is not listed on the CRL at `url`.
    ///
    /// The CRL's signature is verified against `issuer` and its window must
    /// contain `now`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoInvalid` when the certificate is revoked or the
    /// CRL fails verification, and `Error::CrlUnavailable` when no usable
    /// CRL can be obtained.
    pub async fn check(
        &self, url: &str, cert: &Cert, issuer: &Cert, now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let der = self.crl_der(url, now).await?;

        let (_, crl) = CertificateRevocationList::from_der(&der)
            .map_err(|e| Error::CrlUnavailable(format!("could not parse CRL from {url}: {e}")))?;

        let issuer_cert = issuer.parse()?;
        crl.verify_signature(issuer_cert.public_key()).map_err(|e| {
            Error::CryptoInvalid(format!("CRL signature verification failed for {url}: {e}"))
        })?;

        let this_update = crl.last_update().timestamp();
        let next_update = crl
            .next_update()
            .ok_or_else(|| Error::CrlUnavailable(format!("CRL from {url} has no nextUpdate")))?
            .timestamp();
        if now.timestamp() < this_update || now.timestamp() > next_update {
            return Err(Error::CrlUnavailable(format!("CRL from {url} is outside its window")));
        }

        let serial = &cert.parse()?.tbs_certificate.serial;
        if crl.iter_revoked_certificates().any(|revoked| &revoked.user_certificate == serial) {
            return Err(Error::CryptoInvalid(format!("certificate with serial {serial} is revoked")));
        }

        Ok(())
    }

    // Serve the CRL bytes from cache or fetch them, maintaining both the
    // positive and the negative cache.
    async fn crl_der(&self, url: &str, now: DateTime<Utc>) -> Result<Arc<Vec<u8>>, Error> {
        {
            let cache = self.cache.read().expect("cache lock poisoned");
            match cache.get(url) {
                Some(CacheEntry::Crl { der, expires_at }) if now < *expires_at => {
                    return Ok(Arc::clone(der));
                }
                Some(CacheEntry::Failed { until }) if now < *until => {
                    return Err(Error::CrlUnavailable(format!(
                        "fetch of {url} failed recently, retry later"
                    )));
                }
                _ => {}
            }
        }

        match self.fetcher.fetch(url).await {
            Ok(der) => {
                let der = Arc::new(der);
                let expires_at = next_update(&der).unwrap_or(now);
                let mut cache = self.cache.write().expect("cache lock poisoned");
                cache.insert(
                    url.to_string(),
                    CacheEntry::Crl { der: Arc::clone(&der), expires_at },
                );
                Ok(der)
            }
            Err(e) => {
                tracing::warn!("CRL fetch of {url} failed: {e}");
                let mut cache = self.cache.write().expect("cache lock poisoned");
                cache.insert(
                    url.to_string(),
                    CacheEntry::Failed {
                        until: now + TimeDelta::seconds(NEGATIVE_CACHE_TTL_SECONDS),
                    },
                );
                Err(Error::CrlUnavailable(format!("could not fetch CRL from {url}: {e}")))
            }
        }
    }
}

fn next_update(der: &[u8]) -> Option<DateTime<Utc>> {
    let (_, crl) = CertificateRevocationList::from_der(der).ok()?;
    DateTime::from_timestamp(crl.next_update()?.timestamp(), 0)
}
