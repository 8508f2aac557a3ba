//! X.509 assembly for every certificate role.
//!
//! A [`CertificateRequest`] carries everything a certificate needs, so there is
//! no half-built state: the serial in particular can only be supplied as a
//! [`SerialHandle`], which only exists once the serial store has persisted it.

use crate::error::{EntitlementError, Result};
use crate::pki::extensions::X509Extension;
use crate::pki::signer::CaSigner;
use crate::storage::SerialStore;
use crate::types::{CertificateSerial, SerialId};
use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod,
    KeyPair, KeyUsagePurpose, PublicKeyData, SerialNumber,
};
use sha2::{Digest, Sha256};
use std::fmt;
use time::OffsetDateTime;
use tracing::debug;
use yasna::models::ObjectIdentifier;
use yasna::{DERWriter, Tag};

const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_ORGANIZATION: &[u64] = &[2, 5, 4, 10];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];
const OID_NETSCAPE_CERT_TYPE: &[u64] = crate::pki::oid::NETSCAPE_CERT_TYPE_ARCS;

/// BIT STRING with sslClient and smime set
const NETSCAPE_SSL_CLIENT: [u8; 4] = [0x03, 0x02, 0x05, 0xa0];

/// Characters that change meaning at the start of an RDN value.
const DN_SPECIAL_LEADING: &[char] = &[',', '=', '+', '<', '>', '#', ';', '"'];

/// Escape a leading DN special character with a backslash.
pub fn escape_rdn_value(value: &str) -> String {
    match value.chars().next() {
        Some(first) if DN_SPECIAL_LEADING.contains(&first) => format!("\\{}", value),
        _ => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: Option<String>,
}

impl DistinguishedName {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    fn attributes(&self) -> Vec<(&'static [u64], &str)> {
        let mut attributes = vec![(OID_COMMON_NAME, self.common_name.as_str())];
        if let Some(organization) = &self.organization {
            attributes.push((OID_ORGANIZATION, organization.as_str()));
        }
        attributes
    }

    fn to_rcgen(&self) -> rcgen::DistinguishedName {
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        if let Some(organization) = &self.organization {
            dn.push(DnType::OrganizationName, organization.as_str());
        }
        dn
    }

    fn write_der(&self, writer: DERWriter<'_>) {
        writer.write_sequence(|writer| {
            for (oid, value) in self.attributes() {
                writer.next().write_set(|writer| {
                    writer.next().write_sequence(|writer| {
                        writer.next().write_oid(&ObjectIdentifier::from_slice(oid));
                        writer.next().write_utf8_string(value);
                    });
                });
            }
        });
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", escape_rdn_value(&self.common_name))?;
        if let Some(organization) = &self.organization {
            write!(f, ", O={}", escape_rdn_value(organization))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Self {
            not_before,
            not_after,
        }
    }
}

/// Proof that a serial has been persisted and has its database identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialHandle {
    serial: CertificateSerial,
}

impl SerialHandle {
    pub(crate) fn new(serial: CertificateSerial) -> Self {
        Self { serial }
    }

    pub fn id(&self) -> SerialId {
        self.serial.id
    }

    pub fn serial(&self) -> &CertificateSerial {
        &self.serial
    }

    pub fn into_serial(self) -> CertificateSerial {
        self.serial
    }
}

/// First phase of issuing: persist a serial expiring at `expiration`.
pub fn allocate_serial(store: &dyn SerialStore, expiration: DateTime<Utc>) -> Result<SerialHandle> {
    let serial = store.create(expiration)?;
    debug!("Allocated certificate serial {}", serial.id);
    Ok(SerialHandle::new(serial))
}

pub struct CertificateRequest<'a> {
    pub subject: DistinguishedName,
    /// Extra subject alternative name, written as `CN=<name>`
    pub alternate_name: Option<String>,
    pub validity: Validity,
    pub key_pair: &'a KeyPair,
    pub serial: &'a SerialHandle,
    pub extensions: Vec<X509Extension>,
}

#[derive(Debug, Clone)]
pub struct BuiltCertificate {
    pub pem: String,
    pub der: Vec<u8>,
    pub subject_key_identifier: Vec<u8>,
}

/// Subject key identifier over the subject public key and every extension,
/// so a change to either produces a different identifier.
pub fn subject_key_identifier(subject_spki: &[u8], extensions: &[X509Extension]) -> Vec<u8> {
    let mut ordered: Vec<(String, bool, Vec<u8>)> = extensions
        .iter()
        .map(|e| (e.oid.to_string(), e.critical, e.der_value()))
        .collect();
    ordered.sort();

    let mut hasher = Sha256::new();
    hasher.update(subject_spki);
    for (oid, critical, value) in &ordered {
        hasher.update(oid.as_bytes());
        hasher.update([u8::from(*critical)]);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hasher.finalize()[..20].to_vec()
}

fn subject_alt_names(subject: &DistinguishedName, alternate: &str) -> CustomExtension {
    let alternate = DistinguishedName::new(alternate);
    let content = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            for name in [subject, &alternate] {
                writer
                    .next()
                    .write_tagged(Tag::context(4), |writer| name.write_der(writer));
            }
        });
    });
    CustomExtension::from_oid_content(OID_SUBJECT_ALT_NAME, content)
}

fn to_offset(instant: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(instant.timestamp())
        .map_err(|e| EntitlementError::Validation(format!("validity out of range: {}", e)))
}

/// Checks every certificate input that needs no key material, so callers can
/// reject a bad subject before allocating a serial.
pub fn validate_subject(
    subject: &DistinguishedName,
    alternate_name: Option<&str>,
    validity: &Validity,
) -> Result<()> {
    if subject.common_name.trim().is_empty() {
        return Err(EntitlementError::Validation(
            "certificate subject requires a common name".to_string(),
        ));
    }
    if validity.not_before >= validity.not_after {
        return Err(EntitlementError::Validation(format!(
            "validity window is empty: {} .. {}",
            validity.not_before, validity.not_after
        )));
    }
    if let Some(alternate) = alternate_name {
        if alternate.trim().is_empty() {
            return Err(EntitlementError::Validation(
                "subject alternative name cannot be blank".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate(request: &CertificateRequest<'_>) -> Result<()> {
    validate_subject(
        &request.subject,
        request.alternate_name.as_deref(),
        &request.validity,
    )
}

/// Assemble and sign a certificate. Client usage markers, key identifiers and
/// the subject SAN entry are always added.
pub fn build_certificate(
    request: &CertificateRequest<'_>,
    signer: &dyn CaSigner,
) -> Result<BuiltCertificate> {
    validate(request)?;

    let subject_key_identifier = subject_key_identifier(
        &PublicKeyData::subject_public_key_info(request.key_pair),
        &request.extensions,
    );

    let mut params = CertificateParams::default();
    params.distinguished_name = request.subject.to_rcgen();
    params.serial_number = Some(SerialNumber::from(request.serial.id().to_be_bytes().to_vec()));
    params.not_before = to_offset(request.validity.not_before)?;
    params.not_after = to_offset(request.validity.not_after)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params.use_authority_key_identifier_extension = true;
    params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_identifier.clone());

    params.custom_extensions.push(CustomExtension::from_oid_content(
        OID_NETSCAPE_CERT_TYPE,
        NETSCAPE_SSL_CLIENT.to_vec(),
    ));
    if let Some(alternate) = &request.alternate_name {
        params
            .custom_extensions
            .push(subject_alt_names(&request.subject, alternate));
    }
    params
        .custom_extensions
        .extend(request.extensions.iter().map(X509Extension::to_custom));

    let certificate = signer.issue(&params, request.key_pair)?;

    debug!(
        "Built certificate {} serial={} with {} custom extensions",
        request.subject,
        request.serial.id(),
        request.extensions.len()
    );

    Ok(BuiltCertificate {
        pem: certificate.pem(),
        der: certificate.der().to_vec(),
        subject_key_identifier,
    })
}
