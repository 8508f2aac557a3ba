use super::{Draft, Shared};
use crate::cache::AnonymousCertContent;
use crate::content::model::content_model;
use crate::content::{ContentPathBuilder, PromotedContent};
use crate::error::{EntitlementError, Result};
use crate::pki::payload::{ContentModel, ProductModel};
use crate::pki::{
    compact_extensions, encode_payload, validate_subject, DistinguishedName, EntitlementBody,
    EntitlementType, Validity,
};
use crate::types::*;
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub const ANONYMOUS_PRODUCT_ID: &str = "anonymous_cloud_content_access";

fn anonymous_product(content: Vec<ContentModel>) -> ProductModel {
    ProductModel {
        id: ANONYMOUS_PRODUCT_ID.to_string(),
        name: ANONYMOUS_PRODUCT_ID.to_string(),
        content,
        ..Default::default()
    }
}

/// Content of the products and everything they provide, enabled if any
/// product enables it.
fn merged_content(products: &[Product]) -> Vec<ProductContent> {
    fn collect(product: &Product, merged: &mut BTreeMap<ContentId, ProductContent>) {
        for pc in &product.product_content {
            merged
                .entry(pc.content.id.clone())
                .and_modify(|existing| existing.enabled |= pc.enabled)
                .or_insert_with(|| pc.clone());
        }
        for provided in &product.provided_products {
            collect(provided, merged);
        }
    }

    let mut merged = BTreeMap::new();
    for product in products {
        collect(product, &mut merged);
    }
    merged.into_values().collect()
}

fn build_content(shared: &Shared, product_ids: &BTreeSet<ProductId>) -> Result<AnonymousCertContent> {
    let products = shared.stores.products.get_products(product_ids)?;
    if products.is_empty() {
        return Err(EntitlementError::creation(format!(
            "no products found for anonymous consumer products [{}]",
            crate::cache::anonymous::cache_key(product_ids)
        )));
    }

    let promoted = PromotedContent::unscoped(ContentPathBuilder::new(
        shared.config.content.default_content_prefix.as_deref(),
    ));
    let content: Vec<ContentModel> = merged_content(&products)
        .iter()
        .map(|pc| content_model(&pc.content, promoted.path(&pc.content), pc.enabled, &[]))
        .collect();

    let body = EntitlementBody::content_only(String::new(), vec![anonymous_product(content.clone())]);
    let payload = encode_payload(&body, shared.stores.signer.as_ref())?;
    Ok(AnonymousCertContent { content, payload })
}

pub(crate) fn issue(shared: &Shared, consumer_uuid: &str) -> Result<IssuedCertificate> {
    if !shared.config.content.hosted {
        return Err(EntitlementError::creation(
            "anonymous certificates are only issued by hosted deployments",
        ));
    }

    let consumer = shared.stores.consumers.get_anonymous_consumer(consumer_uuid)?;
    let certificates = &shared.config.certificates;

    let subject = DistinguishedName::new(consumer.uuid.as_str());
    let not_before = shared.backdated_now();
    let days = i64::from(certificates.anonymous_validity_days);
    let validity = Validity::new(not_before, not_before + Duration::days(days));
    validate_subject(&subject, None, &validity)?;

    let cert_content = match shared.anonymous_cache.get(&consumer.product_ids) {
        Some(cached) => {
            debug!("Using cached anonymous content for consumer {}", consumer.uuid);
            cached
        }
        None => {
            let built = build_content(shared, &consumer.product_ids)?;
            shared.anonymous_cache.put(&consumer.product_ids, built.clone());
            info!(
                "Cached anonymous content for {} products ({} content sets)",
                consumer.product_ids.len(),
                built.content.len()
            );
            built
        }
    };

    let body = EntitlementBody::content_only(
        consumer.uuid.as_str(),
        vec![anonymous_product(cert_content.content)],
    );
    let extensions = compact_extensions(
        &body,
        EntitlementType::Basic,
        &certificates.entitlement_version,
        None,
    )?;

    let draft = Draft {
        subject,
        alternate_name: None,
        validity,
        key_subject: consumer.uuid.clone(),
        extensions,
        payload: Some(cert_content.payload),
    };
    shared.sign(CertificateKind::AnonymousContentAccess, &consumer.uuid, draft)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::CertificateRole;
    use super::*;
    use crate::config::Config;
    use crate::pki::PayloadBlock;

    fn anonymous_harness(config: Config) -> Harness {
        let h = harness_with(config);
        let mut provided = Product::new("200", "Provided").with_content(content("2000"), false);
        provided.product_content.push(ProductContent {
            content: content("2001"),
            enabled: true,
        });
        let mut sku = Product::new("100", "Cloud OS").with_content(content("2000"), true);
        sku.provided_products.push(provided);
        h.directory.add_product(sku);
        h.directory.add_product(Product::new("300", "Other").with_content(content("3000"), true));

        for (uuid, products) in [("anon-1", vec!["100"]), ("anon-2", vec!["100"]), ("anon-3", vec!["404"])] {
            h.directory.add_anonymous_consumer(AnonymousConsumer {
                id: format!("id-{}", uuid),
                uuid: uuid.to_string(),
                cloud_account_id: "account-1".to_string(),
                product_ids: products.into_iter().map(str::to_string).collect(),
            });
        }
        h
    }

    #[test]
    fn test_merged_content_ors_enabled_flags() {
        let a = Product::new("1", "a").with_content(content("c"), false);
        let b = Product::new("2", "b").with_content(content("c"), true);
        let merged = merged_content(&[a, b]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].enabled);
    }

    #[test]
    fn test_anonymous_certificate_lists_provided_content() {
        let h = anonymous_harness(Config::default());
        let cert = h
            .manager
            .generate(&CertificateRole::anonymous("anon-1"))
            .unwrap()
            .unwrap();

        let block = PayloadBlock::parse(&cert.artifact()).unwrap().unwrap();
        block.verify(h.signer.as_ref()).unwrap();
        let product = &block.body().unwrap().products[0];
        assert_eq!(product.id, ANONYMOUS_PRODUCT_ID);
        let ids: Vec<_> = product.content.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["2000", "2001"]);
        assert!(product.content.iter().all(|c| c.is_enabled()));
    }

    #[test]
    fn test_consumers_with_same_products_share_cached_content() {
        let h = anonymous_harness(Config::default());
        let one = h.manager.generate(&CertificateRole::anonymous("anon-1")).unwrap().unwrap();
        let two = h.manager.generate(&CertificateRole::anonymous("anon-2")).unwrap().unwrap();

        assert_eq!(one.payload, two.payload);
        assert_ne!(one.serial.id, two.serial.id);

        let again = h.manager.generate(&CertificateRole::anonymous("anon-1")).unwrap().unwrap();
        assert_eq!(again.serial.id, one.serial.id);
    }

    #[test]
    fn test_unknown_products_fail_creation() {
        let h = anonymous_harness(Config::default());
        let err = h
            .manager
            .generate(&CertificateRole::anonymous("anon-3"))
            .unwrap_err();
        assert!(matches!(err, EntitlementError::CertificateCreation { .. }));
    }

    #[test]
    fn test_standalone_deployment_refuses_anonymous_certificates() {
        let mut config = Config::default();
        config.content.hosted = false;
        let h = anonymous_harness(config);
        let err = h
            .manager
            .generate(&CertificateRole::anonymous("anon-1"))
            .unwrap_err();
        assert!(matches!(err, EntitlementError::CertificateCreation { .. }));
    }

    #[test]
    fn test_empty_validity_fails_before_content_is_built() {
        let mut config = Config::default();
        config.certificates.anonymous_validity_days = 0;
        let (directory, manager, signer) = counting_harness(config);
        directory.add_product(Product::new("100", "Cloud OS").with_content(content("2000"), true));
        directory.add_anonymous_consumer(AnonymousConsumer {
            id: "id-anon-1".to_string(),
            uuid: "anon-1".to_string(),
            cloud_account_id: "account-1".to_string(),
            product_ids: ["100".to_string()].into_iter().collect(),
        });

        let err = manager.generate(&CertificateRole::anonymous("anon-1")).unwrap_err();
        assert!(matches!(err, EntitlementError::Validation(_)));
        assert_eq!(signer.uses(), 0);
    }
}
