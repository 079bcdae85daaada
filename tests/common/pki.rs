//! Programmatic test PKI: root/intermediate/leaf chains, CRLs and vendor
//! CA certificates, generated with rcgen.

use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey as _;
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, CertificateRevocationListParams,
    CrlDistributionPoint, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod,
    KeyPair, KeyUsagePurpose, OtherNameValue, RevokedCertParams, SanType, SerialNumber,
};

use carenet_auth::x509::Cert;

/// OID of the document-signing extended key usage.
pub const DOC_SIGNING_EKU: [u64; 10] = [1, 3, 6, 1, 4, 1, 311, 10, 3, 12];

// SAN otherName type-id of the vendor identifier on vendor CA roots.
const VENDOR_ID_OID: [u64; 7] = [1, 3, 6, 1, 4, 1, 54851];

/// The attribute string carried in the test smartcard's SAN otherName.
pub const UZI_OTHER_NAME: &str = "2.16.528.1.1007.99.218-1-900021219-N-90000382-00.000-00000000";

/// Where the test smartcard chain publishes its CRL.
pub const CRL_URL: &str = "http://crl.example.com/intermediate.crl";

pub struct CertAndKey {
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

impl CertAndKey {
    pub fn der(&self) -> Cert {
        Cert::from_der(self.cert.der().to_vec()).expect("generated certificate parses")
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// The certificate's private key as a P-256 signing key for JWS tests.
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_pkcs8_der(&self.key.serialize_der()).expect("key converts")
    }
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages =
        vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
    params
}

fn leaf_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params
}

/// Generate a self-signed root CA.
pub fn root_ca(common_name: &str) -> CertAndKey {
    let key = KeyPair::generate().expect("key generates");
    let cert = ca_params(common_name).self_signed(&key).expect("root signs");
    CertAndKey { cert, key }
}

/// Generate an intermediate CA signed by `issuer`.
pub fn intermediate_ca(common_name: &str, issuer: &CertAndKey) -> CertAndKey {
    let key = KeyPair::generate().expect("key generates");
    let cert = ca_params(common_name)
        .signed_by(&key, &issuer.cert, &issuer.key)
        .expect("intermediate signs");
    CertAndKey { cert, key }
}

/// Generate a plain leaf certificate signed by `issuer`.
pub fn leaf(common_name: &str, issuer: &CertAndKey) -> CertAndKey {
    let key = KeyPair::generate().expect("key generates");
    let cert = leaf_params(common_name)
        .signed_by(&key, &issuer.cert, &issuer.key)
        .expect("leaf signs");
    CertAndKey { cert, key }
}

/// Generate a smartcard-style leaf: document-signing EKU, the holder's
/// attributes in a SAN otherName, and a CRL distribution point.
pub fn uzi_leaf(issuer: &CertAndKey, serial: u64, with_eku: bool) -> CertAndKey {
    let key = KeyPair::generate().expect("key generates");
    let mut params = leaf_params("Jan test-90001794");
    params.serial_number = Some(SerialNumber::from(serial));
    if with_eku {
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::Other(DOC_SIGNING_EKU.to_vec()));
    }
    params.subject_alt_names.push(SanType::OtherName((
        vec![2, 5, 5, 5],
        OtherNameValue::Utf8String(UZI_OTHER_NAME.to_string()),
    )));
    params.crl_distribution_points =
        vec![CrlDistributionPoint { uris: vec![CRL_URL.to_string()] }];

    let cert = params.signed_by(&key, &issuer.cert, &issuer.key).expect("leaf signs");
    CertAndKey { cert, key }
}

/// Generate a smartcard-style leaf whose SAN carries no attribute encoding:
/// document-signing EKU and a CRL distribution point only.
pub fn uzi_leaf_without_attributes(issuer: &CertAndKey, serial: u64) -> CertAndKey {
    let key = KeyPair::generate().expect("key generates");
    let mut params = leaf_params("Jan test-90001794");
    params.serial_number = Some(SerialNumber::from(serial));
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::Other(DOC_SIGNING_EKU.to_vec()));
    params.crl_distribution_points =
        vec![CrlDistributionPoint { uris: vec![CRL_URL.to_string()] }];

    let cert = params.signed_by(&key, &issuer.cert, &issuer.key).expect("leaf signs");
    CertAndKey { cert, key }
}

/// Generate a vendor CA root carrying the vendor identifier in its SAN
/// otherName, as vendor trust anchors do.
pub fn vendor_root(common_name: &str, vendor_value: &str) -> CertAndKey {
    let key = KeyPair::generate().expect("key generates");
    let mut params = ca_params(common_name);
    params.subject_alt_names.push(SanType::OtherName((
        VENDOR_ID_OID.iter().copied().chain([4]).collect(),
        OtherNameValue::Utf8String(vendor_value.to_string()),
    )));
    let cert = params.self_signed(&key).expect("root signs");
    CertAndKey { cert, key }
}

/// A CRL for `issuer` covering the frozen test instant, revoking the given
/// serials.
pub fn crl(issuer: &CertAndKey, revoked_serials: &[u64]) -> Vec<u8> {
    let params = CertificateRevocationListParams {
        this_update: date_time_ymd(2020, 10, 1),
        next_update: date_time_ymd(2021, 10, 1),
        crl_number: SerialNumber::from(1234u64),
        issuing_distribution_point: None,
        revoked_certs: revoked_serials
            .iter()
            .map(|serial| RevokedCertParams {
                serial_number: SerialNumber::from(*serial),
                revocation_time: date_time_ymd(2020, 10, 15),
                reason_code: None,
                invalidity_date: None,
            })
            .collect(),
        key_identifier_method: KeyIdMethod::Sha256,
    };
    params
        .signed_by(&issuer.cert, &issuer.key)
        .expect("crl signs")
        .der()
        .to_vec()
}
