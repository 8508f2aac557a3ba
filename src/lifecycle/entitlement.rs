use super::{Draft, Shared};
use crate::content::model::{create_entitlement_body, validate_product_graph};
use crate::content::{entitlement_products, ContentPathBuilder, MappingContext, PromotedContent};
use crate::error::Result;
use crate::pki::{
    compact_extensions, encode_payload, legacy_extensions, validate_subject, DistinguishedName,
    EntitlementType, Validity,
};
use crate::types::{attributes, CertificateKind, Consumer, IssuedCertificate, Pool};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

const UNMAPPED_GUEST_DAYS: i64 = 7;

/// Validity of an entitlement certificate. Pools that started within the
/// backdating window are backdated so fresh clocks can still read them;
/// temporary guest pools end a week after the guest registered.
pub(crate) fn entitlement_validity(
    pool: &Pool,
    consumer: &Consumer,
    now: DateTime<Utc>,
    backdated: DateTime<Utc>,
) -> Validity {
    let not_before = if pool.start_date > backdated && pool.start_date <= now {
        backdated
    } else {
        pool.start_date
    };

    let not_after = if pool.attribute_flag(attributes::UNMAPPED_GUESTS_ONLY) {
        (consumer.created + Duration::days(UNMAPPED_GUEST_DAYS)).min(pool.end_date)
    } else {
        pool.end_date
    };

    Validity::new(not_before, not_after)
}

pub(crate) fn issue(shared: &Shared, entitlement_id: &str) -> Result<IssuedCertificate> {
    let stores = &shared.stores;
    let entitlement = stores.entitlements.get_entitlement(entitlement_id)?;
    let consumer = stores.consumers.get_consumer(&entitlement.consumer_id)?;
    let owner = stores.owners.get_owner(&consumer.owner_id)?;
    let pool = stores.pools.get_pool(&entitlement.pool_id)?;
    validate_product_graph(&pool.product)?;

    let subject = DistinguishedName::new(entitlement.id.as_str()).with_organization(owner.key.as_str());
    let validity = entitlement_validity(&pool, &consumer, Utc::now(), shared.backdated_now());
    validate_subject(&subject, None, &validity)?;

    let environments = stores.environments.get_consumer_environments(&consumer)?;
    let entitled = stores.entitlements.entitled_product_ids(&consumer.id)?;
    let promoted = PromotedContent::new(
        ContentPathBuilder::for_owner(&owner, shared.config.content.default_content_prefix.as_deref()),
        &environments,
    );
    let context = MappingContext {
        consumer: Some(&consumer),
        promoted: &promoted,
        environment_filtering: shared.config.content.environment_filtering,
        simple_content_access: false,
        entitled_product_ids: &entitled,
    };

    let products = entitlement_products(&pool, &consumer);
    let models = context.create_products(&pool.product, &products, Some(&pool));
    let body = create_entitlement_body(&consumer.uuid, &pool, entitlement.quantity, models);

    let certificates = &shared.config.certificates;
    let (extensions, payload) = if consumer.is_cert_v3_capable() {
        let extensions = compact_extensions(
            &body,
            EntitlementType::Basic,
            &certificates.entitlement_version,
            pool.product_namespace(),
        )?;
        (extensions, Some(encode_payload(&body, stores.signer.as_ref())?))
    } else {
        (legacy_extensions(&body, certificates.v1_content_limit)?, None)
    };

    debug!(
        "Entitlement {} for consumer {} carries {} content sets",
        entitlement.id,
        consumer.uuid,
        body.content_paths().len()
    );

    let draft = Draft {
        subject,
        alternate_name: None,
        validity,
        key_subject: consumer.uuid.clone(),
        extensions,
        payload,
    };
    shared.sign(CertificateKind::Entitlement, &entitlement.id, draft)
}
