//! Identity, product and ueber certificates.

use super::{Draft, Shared};
use crate::content::model::{content_model, product_model};
use crate::content::{ContentPathBuilder, PromotedContent};
use crate::error::Result;
use crate::pki::payload::ProductModel;
use crate::pki::{
    compact_extensions, encode_payload, extensions::product_certificate_extensions,
    validate_subject, DistinguishedName, EntitlementBody, EntitlementType, Validity,
};
use crate::types::{CertificateKind, IssuedCertificate, Owner};
use chrono::Duration;

/// Common name of every ueber certificate; the owner goes in `O`.
pub const UEBER_CONSUMER_NAME: &str = "ueber_cert_consumer";

pub fn ueber_product_id(owner: &Owner) -> String {
    format!("{}_ueber_product", owner.key)
}

fn validity_days(shared: &Shared, days: u32) -> Validity {
    let not_before = shared.backdated_now();
    Validity::new(not_before, not_before + Duration::days(i64::from(days)))
}

pub(crate) fn issue_identity(shared: &Shared, consumer_id: &str) -> Result<IssuedCertificate> {
    let consumer = shared.stores.consumers.get_consumer(consumer_id)?;
    let owner = shared.stores.owners.get_owner(&consumer.owner_id)?;

    let draft = Draft {
        subject: DistinguishedName::new(consumer.uuid.as_str()).with_organization(owner.key.as_str()),
        alternate_name: Some(consumer.name.clone()),
        validity: validity_days(shared, shared.config.certificates.identity_validity_days),
        key_subject: consumer.uuid.clone(),
        extensions: Vec::new(),
        payload: None,
    };
    shared.sign(CertificateKind::Identity, consumer_id, draft)
}

pub(crate) fn issue_product(shared: &Shared, product_id: &str) -> Result<IssuedCertificate> {
    let product = shared.stores.products.get_product(product_id)?;
    let extensions = product_certificate_extensions(&product_model(&product, None))?;

    let draft = Draft {
        subject: DistinguishedName::new(product.id.as_str()),
        alternate_name: None,
        validity: validity_days(shared, shared.config.certificates.product_validity_days),
        key_subject: format!("product:{}", product.id),
        extensions,
        payload: None,
    };
    shared.sign(CertificateKind::Product, product_id, draft)
}

/// A certificate granting every active content of the owner, with paths
/// built from the owner prefix alone.
pub(crate) fn issue_ueber(shared: &Shared, owner_id: &str) -> Result<IssuedCertificate> {
    let owner = shared.stores.owners.get_owner(owner_id)?;
    let certificates = &shared.config.certificates;

    let subject = DistinguishedName::new(UEBER_CONSUMER_NAME).with_organization(owner.key.as_str());
    let not_before = shared.backdated_now();
    let years = i64::from(certificates.ueber_validity_years);
    let validity = Validity::new(not_before, not_before + Duration::days(365 * years));
    validate_subject(&subject, None, &validity)?;

    let promoted = PromotedContent::unscoped(ContentPathBuilder::for_owner(
        &owner,
        shared.config.content.default_content_prefix.as_deref(),
    ));

    let content = shared
        .stores
        .owners
        .active_content_for_owner(&owner.id)?
        .iter()
        .map(|pc| content_model(&pc.content, promoted.path(&pc.content), pc.enabled, &[]))
        .collect();
    let product = ProductModel {
        id: ueber_product_id(&owner),
        name: ueber_product_id(&owner),
        content,
        ..Default::default()
    };
    let body = EntitlementBody::content_only(UEBER_CONSUMER_NAME, vec![product]);

    let extensions = compact_extensions(
        &body,
        EntitlementType::Basic,
        &certificates.entitlement_version,
        None,
    )?;
    let payload = encode_payload(&body, shared.stores.signer.as_ref())?;

    let draft = Draft {
        subject,
        alternate_name: None,
        validity,
        key_subject: format!("{}:{}", UEBER_CONSUMER_NAME, owner.key),
        extensions,
        payload: Some(payload),
    };
    shared.sign(CertificateKind::Ueber, owner_id, draft)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{CertificateRole, CertificateState};
    use super::*;
    use crate::error::EntitlementError;
    use crate::pki::PayloadBlock;
    use crate::storage::*;
    use crate::types::{attributes, Product};
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn parse_pem(pem: &str) -> Vec<u8> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        pem.contents
    }

    #[test]
    fn test_identity_certificate_subject_and_alternate_name() {
        let h = harness();
        seed(&h.directory, Vec::new());
        let consumer = h.directory.get_consumer("consumer-1").unwrap();

        let cert = h
            .manager
            .generate(&CertificateRole::identity("consumer-1"))
            .unwrap()
            .unwrap();
        assert!(cert.payload.is_none());

        let der = parse_pem(&cert.cert_pem);
        let (_, x509) = X509Certificate::from_der(&der).unwrap();
        let subject = x509.subject().to_string();
        assert!(subject.contains(&format!("CN={}", consumer.uuid)));
        assert!(subject.contains("O=acme"));
        assert!(x509.subject_alternative_name().unwrap().is_some());
    }

    #[test]
    fn test_product_certificate_requires_numeric_id() {
        let h = harness();
        h.directory.add_product(
            Product::new("69", "Awesome OS").with_attribute(attributes::VERSION, "9.1"),
        );
        h.directory.add_product(Product::new("MKT-1", "Marketing"));

        let cert = h
            .manager
            .generate(&CertificateRole::product("69"))
            .unwrap()
            .unwrap();
        let der = parse_pem(&cert.cert_pem);
        let (_, x509) = X509Certificate::from_der(&der).unwrap();
        assert!(x509
            .extensions()
            .iter()
            .any(|e| e.oid.to_id_string() == "1.3.6.1.4.1.2312.9.1.69.1"));

        let err = h.manager.generate(&CertificateRole::product("MKT-1")).unwrap_err();
        assert!(matches!(err, EntitlementError::Validation(_)));
        assert_eq!(
            h.manager.state(&CertificateRole::product("MKT-1")).unwrap(),
            CertificateState::Absent
        );
    }

    #[test]
    fn test_ueber_certificate_grants_all_owner_content() {
        let h = harness();
        seed(&h.directory, vec![(content("1000"), true), (content("1001"), false)]);

        let cert = h
            .manager
            .generate(&CertificateRole::ueber("owner-1"))
            .unwrap()
            .unwrap();
        let block = PayloadBlock::parse(&cert.artifact()).unwrap().unwrap();
        let body = block.body().unwrap();
        assert_eq!(body.consumer, UEBER_CONSUMER_NAME);
        assert_eq!(body.products[0].id, "acme_ueber_product");
        assert_eq!(
            body.content_paths(),
            vec!["/content/1000".to_string(), "/content/1001".to_string()]
        );

        let der = parse_pem(&cert.cert_pem);
        let (_, x509) = X509Certificate::from_der(&der).unwrap();
        assert!(x509.subject().to_string().contains("CN=ueber_cert_consumer"));
    }

    #[test]
    fn test_ueber_validation_precedes_payload_signing() {
        let mut config = crate::config::Config::default();
        config.certificates.ueber_validity_years = 0;
        let (directory, manager, signer) = counting_harness(config);
        seed(&directory, vec![(content("1000"), true)]);

        let err = manager.generate(&CertificateRole::ueber("owner-1")).unwrap_err();
        assert!(matches!(err, EntitlementError::Validation(_)));
        assert_eq!(signer.uses(), 0);
    }
}
