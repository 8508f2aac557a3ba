//! CA signer and subject key pair sources.
//!
//! The rest of the crate only sees [`CaSigner`] and [`KeyPairProvider`]; the
//! local rcgen implementation is what tests and the CLI wire in.

use crate::config::{CaConfig, KeyAlgorithm};
use crate::error::{EntitlementError, Result};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PublicKeyData, SignatureAlgorithm, SigningKey,
};
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use std::fmt;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Signature family of the CA key. Its label goes into the payload signature
/// block markers, so it always comes from the signer in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    Rsa,
    Ecdsa,
    Ed25519,
    MlDsa,
}

impl SignatureScheme {
    pub fn label(&self) -> &'static str {
        match self {
            SignatureScheme::Rsa => "RSA",
            SignatureScheme::Ecdsa => "ECDSA",
            SignatureScheme::Ed25519 => "ED25519",
            SignatureScheme::MlDsa => "ML-DSA",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "RSA" => Some(SignatureScheme::Rsa),
            "ECDSA" => Some(SignatureScheme::Ecdsa),
            "ED25519" => Some(SignatureScheme::Ed25519),
            "ML-DSA" => Some(SignatureScheme::MlDsa),
            _ => None,
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl KeyAlgorithm {
    pub fn signature_algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        match self {
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => SignatureScheme::Ecdsa,
            KeyAlgorithm::Ed25519 => SignatureScheme::Ed25519,
        }
    }

    fn verification_algorithm(&self) -> &'static dyn VerificationAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &signature::ECDSA_P256_SHA256_ASN1,
            KeyAlgorithm::EcdsaP384 => &signature::ECDSA_P384_SHA384_ASN1,
            KeyAlgorithm::Ed25519 => &signature::ED25519,
        }
    }

    pub fn generate_key_pair(&self) -> Result<KeyPair> {
        Ok(KeyPair::generate_for(self.signature_algorithm())?)
    }
}

/// The CA capability: sign bytes, sign certificates, expose the public key.
pub trait CaSigner: Send + Sync {
    fn scheme(&self) -> SignatureScheme;

    /// Sign arbitrary bytes with the CA private key.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()>;

    /// DER SubjectPublicKeyInfo of the CA key.
    fn ca_public_key_der(&self) -> Vec<u8>;

    fn ca_certificate_pem(&self) -> String;

    /// Sign `params` for `subject_key` with the CA as issuer. The authority key
    /// identifier is derived from the CA public key alone.
    fn issue(&self, params: &CertificateParams, subject_key: &KeyPair) -> Result<Certificate>;
}

/// Self-signed CA kept in memory.
pub struct LocalCertificateAuthority {
    params: CertificateParams,
    key: KeyPair,
    algorithm: KeyAlgorithm,
    certificate_pem: String,
}

impl fmt::Debug for LocalCertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCertificateAuthority")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl LocalCertificateAuthority {
    pub fn generate(config: &CaConfig, algorithm: KeyAlgorithm) -> Result<Self> {
        config.validate()?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, config.common_name.as_str());
        params
            .distinguished_name
            .push(DnType::OrganizationName, config.organization.as_str());
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(365 * config.validity_years as i64);

        let key = algorithm.generate_key_pair()?;
        let certificate = params.self_signed(&key)?;

        info!(
            "Generated certificate authority: CN={}, algorithm={:?}",
            config.common_name, algorithm
        );

        Ok(Self {
            params,
            key,
            algorithm,
            certificate_pem: certificate.pem(),
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

impl CaSigner for LocalCertificateAuthority {
    fn scheme(&self) -> SignatureScheme {
        self.algorithm.scheme()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        SigningKey::sign(&self.key, data)
            .map_err(|e| EntitlementError::creation(format!("CA signer failed: {}", e)))
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let public_key = UnparsedPublicKey::new(
            self.algorithm.verification_algorithm(),
            PublicKeyData::der_bytes(&self.key),
        );
        public_key
            .verify(data, signature)
            .map_err(|_| {
                EntitlementError::SignatureVerification(format!(
                    "{} signature does not match CA key",
                    self.scheme()
                ))
            })
    }

    fn ca_public_key_der(&self) -> Vec<u8> {
        PublicKeyData::subject_public_key_info(&self.key)
    }

    fn ca_certificate_pem(&self) -> String {
        self.certificate_pem.clone()
    }

    fn issue(&self, params: &CertificateParams, subject_key: &KeyPair) -> Result<Certificate> {
        let issuer = Issuer::from_params(&self.params, &self.key);
        Ok(params.signed_by(subject_key, &issuer)?)
    }
}

/// Source of per-subject key pairs. A subject keeps its key across reissues.
pub trait KeyPairProvider: Send + Sync {
    fn get_or_create(&self, subject: &str) -> Result<KeyPair>;
}

/// Keeps generated keys as PEM, keyed by subject.
#[derive(Debug)]
pub struct InMemoryKeyPairProvider {
    algorithm: KeyAlgorithm,
    keys: DashMap<String, String>,
}

impl InMemoryKeyPairProvider {
    pub fn new(algorithm: KeyAlgorithm) -> Self {
        Self {
            algorithm,
            keys: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyPairProvider for InMemoryKeyPairProvider {
    fn get_or_create(&self, subject: &str) -> Result<KeyPair> {
        if subject.trim().is_empty() {
            return Err(EntitlementError::Validation(
                "key pair subject cannot be empty".to_string(),
            ));
        }

        let pem = match self.keys.entry(subject.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!("Generating {:?} key pair for {}", self.algorithm, subject);
                let pem = self.algorithm.generate_key_pair()?.serialize_pem();
                entry.insert(pem.clone());
                pem
            }
        };

        Ok(KeyPair::from_pem(&pem)?)
    }
}
