//! Simple content access certificates.
//!
//! The stored certificate is the X.509 part only, scoped to the owner and the
//! consumer's environments by path. The signed payload listing the owner's
//! content is shared by every consumer with the same architectures and
//! environment list, lives in the payload cache, and is attached on read.

use super::{CertificateState, Draft, Shared};
use crate::content::paths::encode_segment;
use crate::content::{ContentPathBuilder, MappingContext, PromotedContent};
use crate::error::Result;
use crate::pki::payload::{ContentModel, ProductModel};
use crate::pki::{
    compact_extensions, encode_payload, DistinguishedName, EntitlementBody, EntitlementType,
    Validity,
};
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::debug;

pub const CONTENT_ACCESS_PRODUCT_ID: &str = "content_access";
pub const CONTENT_ACCESS_PRODUCT_NAME: &str = "Content Access";

/// Owner and consumer when the consumer qualifies for a content access
/// certificate.
fn eligible(shared: &Shared, consumer_id: &str) -> Result<Option<(Consumer, Owner)>> {
    let consumer = shared.stores.consumers.get_consumer(consumer_id)?;
    let owner = shared.stores.owners.get_owner(&consumer.owner_id)?;

    if !owner.is_using_simple_content_access() {
        debug!("Owner {} is not in simple content access mode", owner.key);
        return Ok(None);
    }
    if !consumer.is_cert_v3_capable() {
        debug!("Consumer {} cannot read compact certificates", consumer.uuid);
        return Ok(None);
    }
    Ok(Some((consumer, owner)))
}

/// One container path per environment, or the bare owner path.
pub fn container_paths(owner: &Owner, environments: &[Environment]) -> Vec<String> {
    let owner_path = format!("/{}", encode_segment(&owner.key));
    if environments.is_empty() {
        return vec![owner_path];
    }
    environments
        .iter()
        .map(|env| format!("{}/{}", owner_path, encode_segment(&env.name)))
        .collect()
}

fn issue_x509(
    shared: &Shared,
    consumer: &Consumer,
    owner: &Owner,
    environments: &[Environment],
) -> Result<IssuedCertificate> {
    let content = container_paths(owner, environments)
        .into_iter()
        .map(|path| ContentModel {
            id: CONTENT_ACCESS_PRODUCT_ID.to_string(),
            content_type: "yum".to_string(),
            name: CONTENT_ACCESS_PRODUCT_NAME.to_string(),
            label: CONTENT_ACCESS_PRODUCT_ID.to_string(),
            path,
            ..Default::default()
        })
        .collect();
    let container = ProductModel {
        id: CONTENT_ACCESS_PRODUCT_ID.to_string(),
        name: CONTENT_ACCESS_PRODUCT_NAME.to_string(),
        content,
        ..Default::default()
    };
    let body = EntitlementBody::content_only(consumer.uuid.as_str(), vec![container]);
    let extensions = compact_extensions(
        &body,
        EntitlementType::OrgLevel,
        &shared.config.certificates.entitlement_version,
        None,
    )?;

    let not_before = shared.backdated_now();
    let days = i64::from(shared.config.certificates.sca_validity_days);
    let draft = Draft {
        subject: DistinguishedName::new(consumer.uuid.as_str()).with_organization(owner.key.as_str()),
        alternate_name: None,
        validity: Validity::new(not_before, not_before + Duration::days(days)),
        key_subject: consumer.uuid.clone(),
        extensions,
        payload: None,
    };
    let mut issued = shared.sign(CertificateKind::ContentAccess, &consumer.id, draft)?;
    issued.environment_ids = consumer.environment_ids.clone();
    Ok(issued)
}

/// The stored X.509 part, reissued when missing, expired, `force`d or built
/// for another environment ordering.
fn current_x509(
    shared: &Shared,
    consumer: &Consumer,
    owner: &Owner,
    environments: &[Environment],
    force: bool,
) -> Result<IssuedCertificate> {
    let existing = shared
        .stores
        .certificates
        .get(CertificateKind::ContentAccess, &consumer.id)?;
    if let Some(existing) = existing {
        if existing.environment_ids != consumer.environment_ids {
            debug!(
                "Consumer {} environments changed from [{}] to [{}], reissuing",
                consumer.uuid,
                existing.environment_ids.join(","),
                consumer.environment_ids.join(",")
            );
        } else if !force && shared.state_of(&existing)? == CertificateState::Valid {
            return Ok(existing);
        }
    }
    let fresh = issue_x509(shared, consumer, owner, environments)?;
    shared.supersede(fresh)
}

/// Signed payload of all the owner's content as seen from `environments`.
fn build_payload(
    shared: &Shared,
    consumer: &Consumer,
    owner: &Owner,
    environments: &[Environment],
) -> Result<String> {
    let mut product = Product::new(CONTENT_ACCESS_PRODUCT_ID, CONTENT_ACCESS_PRODUCT_NAME);
    product.product_content = shared.stores.owners.active_content_for_owner(&owner.id)?;

    let promoted = PromotedContent::new(
        ContentPathBuilder::for_owner(owner, shared.config.content.default_content_prefix.as_deref()),
        environments,
    );
    let entitled = BTreeSet::new();
    let context = MappingContext {
        consumer: Some(consumer),
        promoted: &promoted,
        environment_filtering: shared.config.content.environment_filtering,
        simple_content_access: true,
        entitled_product_ids: &entitled,
    };
    let model = context.map_product(&product, &product, None);
    debug!(
        "Content access payload for owner {} lists {} content sets",
        owner.key,
        model.content.len()
    );

    // shared across consumers, so no consumer is named
    let body = EntitlementBody::content_only(String::new(), vec![model]);
    encode_payload(&body, shared.stores.signer.as_ref())
}

fn payload(
    shared: &Shared,
    consumer: &Consumer,
    owner: &Owner,
    environments: &[Environment],
) -> Result<ContentAccessPayload> {
    let key = shared
        .payload_cache
        .key_for(consumer, &consumer.environment_ids);
    shared
        .payload_cache
        .get_or_create(owner, &key, environments, || {
            build_payload(shared, consumer, owner, environments)
        })
}

pub(crate) fn generate(
    shared: &Shared,
    consumer_id: &str,
    force: bool,
) -> Result<Option<IssuedCertificate>> {
    let Some((consumer, owner)) = eligible(shared, consumer_id)? else {
        return Ok(None);
    };
    let environments = shared.stores.environments.get_consumer_environments(&consumer)?;

    let x509 = current_x509(shared, &consumer, &owner, &environments, force)?;
    let payload = payload(shared, &consumer, &owner, &environments)?;
    Ok(Some(IssuedCertificate {
        payload: Some(payload.payload),
        ..x509
    }))
}

pub(crate) fn payload_for(shared: &Shared, consumer_id: &str) -> Result<Option<String>> {
    let Some((consumer, owner)) = eligible(shared, consumer_id)? else {
        return Ok(None);
    };
    let environments = shared.stores.environments.get_consumer_environments(&consumer)?;
    Ok(Some(payload(shared, &consumer, &owner, &environments)?.payload))
}

pub(crate) fn x509_for(
    shared: &Shared,
    consumer_id: &str,
    force: bool,
) -> Result<Option<IssuedCertificate>> {
    let Some((consumer, owner)) = eligible(shared, consumer_id)? else {
        return Ok(None);
    };
    let environments = shared.stores.environments.get_consumer_environments(&consumer)?;
    current_x509(shared, &consumer, &owner, &environments, force).map(Some)
}

/// Whether anything a content access certificate is built from moved after
/// `since`: the owner's content, an environment of the consumer, or the
/// stored certificate itself. A missing or expired certificate, or one built
/// for another environment ordering, always counts.
pub(crate) fn changed_since(shared: &Shared, consumer_id: &str, since: DateTime<Utc>) -> Result<bool> {
    let Some((consumer, owner)) = eligible(shared, consumer_id)? else {
        return Ok(false);
    };
    if owner.last_content_update > since {
        return Ok(true);
    }

    let environments = shared.stores.environments.get_consumer_environments(&consumer)?;
    if environments.iter().any(|env| env.last_content_update > since) {
        return Ok(true);
    }

    Ok(shared
        .stores
        .certificates
        .get(CertificateKind::ContentAccess, &consumer.id)?
        .map(|cert| {
            cert.updated > since
                || cert.serial.is_expired(Utc::now())
                || cert.environment_ids != consumer.environment_ids
        })
        .unwrap_or(true))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::CertificateRole;
    use super::*;
    use crate::pki::huffman::decode_paths;
    use crate::pki::oid::{self, Oid};
    use crate::pki::{ExtensionValue, PayloadBlock};
    use crate::storage::*;

    fn sca_harness() -> Harness {
        let h = harness();
        seed(&h.directory, vec![(content("1000"), true), (content("1001"), false)]);
        h.directory
            .update_owner("owner-1", |o| {
                o.content_access_mode = ContentAccessMode::OrgEnvironment;
                o.content_prefix = Some("/acme/$env".to_string());
            })
            .unwrap();
        h
    }

    #[test]
    fn test_container_paths_per_environment() {
        let owner = Owner::new("o", "acme corp");
        assert_eq!(container_paths(&owner, &[]), vec!["/acme%20corp".to_string()]);

        let envs = vec![Environment::new("e1", "o", "dev"), Environment::new("e2", "o", "qa")];
        assert_eq!(
            container_paths(&owner, &envs),
            vec!["/acme%20corp/dev".to_string(), "/acme%20corp/qa".to_string()]
        );
    }

    #[test]
    fn test_entitlement_mode_owner_gets_no_certificate() {
        let h = harness();
        seed(&h.directory, vec![(content("1000"), true)]);
        let role = CertificateRole::content_access("consumer-1");
        assert!(h.manager.generate(&role).unwrap().is_none());
        assert!(h.manager.get_content_payload("consumer-1").unwrap().is_none());
        assert!(!h.manager.has_cert_changed_since("consumer-1", Utc::now()).unwrap());
    }

    #[test]
    fn test_legacy_consumer_gets_no_certificate() {
        let h = sca_harness();
        h.directory
            .update_consumer("consumer-1", |c| {
                c.facts.remove(facts::CERTIFICATE_VERSION);
            })
            .unwrap();
        assert!(h
            .manager
            .generate(&CertificateRole::content_access("consumer-1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_certificate_combines_stored_x509_and_cached_payload() {
        let h = sca_harness();
        let role = CertificateRole::content_access("consumer-1");

        let first = h.manager.generate(&role).unwrap().unwrap();
        let block = PayloadBlock::parse(&first.artifact()).unwrap().unwrap();
        block.verify(h.signer.as_ref()).unwrap();
        let body = block.body().unwrap();
        assert_eq!(body.products[0].id, CONTENT_ACCESS_PRODUCT_ID);
        assert_eq!(body.products[0].content.len(), 2);

        // the stored certificate carries no payload
        let stored = h.manager.get_x509_certificate("consumer-1").unwrap().unwrap();
        assert!(stored.payload.is_none());
        assert_eq!(stored.serial.id, first.serial.id);

        let again = h.manager.generate(&role).unwrap().unwrap();
        assert_eq!(again.serial.id, first.serial.id);
        assert_eq!(again.payload, first.payload);
        assert_eq!(h.manager.payload_cache().stats().hits, 1);
    }

    #[test]
    fn test_consumers_with_same_view_share_payload() {
        let h = sca_harness();
        let mut twin = h.directory.get_consumer("consumer-1").unwrap();
        twin.id = "consumer-2".to_string();
        twin.uuid = "twin-uuid".to_string();
        h.directory.add_consumer(twin);

        let one = h.manager.get_content_payload("consumer-1").unwrap().unwrap();
        let two = h.manager.get_content_payload("consumer-2").unwrap().unwrap();
        assert_eq!(one, two);

        let stats = h.manager.payload_cache().stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_environment_promotion_regenerates_payload() {
        let h = sca_harness();
        let mut env = Environment::new("env-1", "owner-1", "dev");
        env.promote("1000", Some(false));
        env.last_content_update = Utc::now() - Duration::hours(2);
        h.directory.add_environment(env);
        h.directory
            .update_consumer("consumer-1", |c| c.environment_ids = vec!["env-1".to_string()])
            .unwrap();

        let before = h
            .manager
            .generate(&CertificateRole::content_access("consumer-1"))
            .unwrap()
            .unwrap()
            .payload
            .unwrap();
        let since = Utc::now();
        assert!(!h.manager.has_cert_changed_since("consumer-1", since).unwrap());

        h.directory
            .update_environment("env-1", |env| env.promote("1001", Some(true)))
            .unwrap();
        assert!(h.manager.has_cert_changed_since("consumer-1", since).unwrap());

        let after = h.manager.get_content_payload("consumer-1").unwrap().unwrap();
        assert_ne!(before, after);
        assert_eq!(h.manager.payload_cache().stats().regenerations, 1);

        let body = PayloadBlock::parse(&after).unwrap().unwrap().body().unwrap();
        let paths = body.content_paths();
        assert!(paths.contains(&"/acme/dev/content/1000".to_string()));
        assert!(paths.contains(&"/acme/dev/content/1001".to_string()));
    }

    fn container_paths_of(cert: &IssuedCertificate) -> Vec<String> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(cert.cert_pem.as_bytes()).unwrap();
        let x509 = pem.parse_x509().unwrap();
        let data = Oid::redhat(&[oid::ENTITLEMENT_DATA]).to_string();
        let extension = x509
            .extensions()
            .iter()
            .find(|e| e.oid.to_id_string() == data)
            .unwrap();
        let paths = match ExtensionValue::from_der(extension.value).unwrap() {
            ExtensionValue::Bytes(tree) => decode_paths(&tree).unwrap(),
            ExtensionValue::Text(text) => panic!("content tree stored as text: {}", text),
        };
        paths
    }

    #[test]
    fn test_environment_membership_change_reissues_x509() {
        let h = sca_harness();
        h.directory.add_environment(Environment::new("env-1", "owner-1", "dev"));
        h.directory.add_environment(Environment::new("env-2", "owner-1", "qa"));
        let role = CertificateRole::content_access("consumer-1");

        let first = h.manager.get_x509_certificate("consumer-1").unwrap().unwrap();
        assert_eq!(container_paths_of(&first), vec!["/acme".to_string()]);
        let since = Utc::now();
        assert!(!h.manager.has_cert_changed_since("consumer-1", since).unwrap());

        h.directory
            .update_consumer("consumer-1", |c| c.environment_ids = vec!["env-1".to_string()])
            .unwrap();
        assert!(h.manager.has_cert_changed_since("consumer-1", since).unwrap());
        assert_eq!(h.manager.state(&role).unwrap(), CertificateState::Stale);

        let joined = h.manager.get_x509_certificate("consumer-1").unwrap().unwrap();
        assert_ne!(joined.serial.id, first.serial.id);
        assert_eq!(container_paths_of(&joined), vec!["/acme/dev".to_string()]);
        assert_eq!(joined.environment_ids, vec!["env-1".to_string()]);

        // a new ordering of the same environments is a new view
        h.directory
            .update_consumer("consumer-1", |c| {
                c.environment_ids = vec!["env-2".to_string(), "env-1".to_string()]
            })
            .unwrap();
        let reordered = h.manager.generate(&role).unwrap().unwrap();
        assert_ne!(reordered.serial.id, joined.serial.id);
        assert_eq!(
            container_paths_of(&reordered),
            vec!["/acme/dev".to_string(), "/acme/qa".to_string()]
        );

        let again = h.manager.get_x509_certificate("consumer-1").unwrap().unwrap();
        assert_eq!(again.serial.id, reordered.serial.id);

        let revoked: Vec<_> = h.manager.revoked_serials().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(revoked, vec![first.serial.id, joined.serial.id]);
    }

    #[test]
    fn test_forced_regeneration_revokes_previous_x509() {
        let h = sca_harness();
        let role = CertificateRole::content_access("consumer-1");
        let first = h.manager.generate(&role).unwrap().unwrap();
        let second = h.manager.regenerate(&role, true).unwrap().unwrap();

        assert_ne!(first.serial.id, second.serial.id);
        let revoked: Vec<_> = h.manager.revoked_serials().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(revoked, vec![first.serial.id]);
    }
}
