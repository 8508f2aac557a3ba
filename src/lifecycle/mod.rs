//! Certificate lifecycle: issue, reuse, renew and supersede certificates for
//! every role.
//!
//! A stored certificate is *valid* until its serial enters the renewal window
//! or, for entitlements, until the entitlement is flagged dirty. The next
//! request for a stale certificate issues a new one and revokes the old
//! serial. Nothing is regenerated in the background.

mod anonymous;
mod content_access;
mod entitlement;
mod identity;

use crate::cache::{AnonymousContentCache, ContentAccessPayloadCache};
use crate::config::Config;
use crate::content::{self, EnvironmentPromotions};
use crate::error::{EntitlementError, Result};
use crate::pki::{
    allocate_serial, build_certificate, validate_subject, CaSigner, CertificateRequest,
    DistinguishedName, KeyPairProvider, Validity, X509Extension,
};
use crate::storage::*;
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External services the lifecycle manager reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub serials: Arc<dyn SerialStore>,
    pub certificates: Arc<dyn CertificateStore>,
    pub owners: Arc<dyn OwnerLookup>,
    pub consumers: Arc<dyn ConsumerLookup>,
    pub environments: Arc<dyn EnvironmentLookup>,
    pub products: Arc<dyn ProductLookup>,
    pub pools: Arc<dyn PoolLookup>,
    pub entitlements: Arc<dyn EntitlementStore>,
    pub payloads: Arc<dyn PayloadStore>,
    pub signer: Arc<dyn CaSigner>,
    pub keys: Arc<dyn KeyPairProvider>,
}

impl Collaborators {
    /// Wire every lookup to one in-memory directory.
    pub fn in_memory(
        directory: Arc<InMemoryDirectory>,
        signer: Arc<dyn CaSigner>,
        keys: Arc<dyn KeyPairProvider>,
    ) -> Self {
        Self {
            serials: Arc::new(InMemorySerialStore::new()),
            certificates: Arc::new(InMemoryCertificateStore::new()),
            owners: directory.clone(),
            consumers: directory.clone(),
            environments: directory.clone(),
            products: directory.clone(),
            pools: directory.clone(),
            entitlements: directory,
            payloads: Arc::new(InMemoryPayloadStore::new()),
            signer,
            keys,
        }
    }
}

/// What to issue a certificate for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CertificateRole {
    Entitlement { entitlement_id: EntitlementId },
    Identity { consumer_id: ConsumerId },
    Product { product_id: ProductId },
    Ueber { owner_id: OwnerId },
    AnonymousContentAccess { consumer_uuid: String },
    ContentAccess { consumer_id: ConsumerId },
}

impl CertificateRole {
    pub fn entitlement(id: impl Into<String>) -> Self {
        CertificateRole::Entitlement {
            entitlement_id: id.into(),
        }
    }

    pub fn identity(consumer_id: impl Into<String>) -> Self {
        CertificateRole::Identity {
            consumer_id: consumer_id.into(),
        }
    }

    pub fn product(product_id: impl Into<String>) -> Self {
        CertificateRole::Product {
            product_id: product_id.into(),
        }
    }

    pub fn ueber(owner_id: impl Into<String>) -> Self {
        CertificateRole::Ueber {
            owner_id: owner_id.into(),
        }
    }

    pub fn anonymous(consumer_uuid: impl Into<String>) -> Self {
        CertificateRole::AnonymousContentAccess {
            consumer_uuid: consumer_uuid.into(),
        }
    }

    pub fn content_access(consumer_id: impl Into<String>) -> Self {
        CertificateRole::ContentAccess {
            consumer_id: consumer_id.into(),
        }
    }

    pub fn kind(&self) -> CertificateKind {
        match self {
            CertificateRole::Entitlement { .. } => CertificateKind::Entitlement,
            CertificateRole::Identity { .. } => CertificateKind::Identity,
            CertificateRole::Product { .. } => CertificateKind::Product,
            CertificateRole::Ueber { .. } => CertificateKind::Ueber,
            CertificateRole::AnonymousContentAccess { .. } => {
                CertificateKind::AnonymousContentAccess
            }
            CertificateRole::ContentAccess { .. } => CertificateKind::ContentAccess,
        }
    }

    /// Key the certificate is stored under.
    pub fn subject(&self) -> &str {
        match self {
            CertificateRole::Entitlement { entitlement_id } => entitlement_id,
            CertificateRole::Identity { consumer_id } => consumer_id,
            CertificateRole::Product { product_id } => product_id,
            CertificateRole::Ueber { owner_id } => owner_id,
            CertificateRole::AnonymousContentAccess { consumer_uuid } => consumer_uuid,
            CertificateRole::ContentAccess { consumer_id } => consumer_id,
        }
    }
}

impl fmt::Display for CertificateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.subject())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    Absent,
    Valid,
    Stale,
    /// The stored certificate's serial has been revoked
    Superseded,
}

/// Everything needed to sign a certificate except the serial, which is
/// allocated only once the draft has been validated.
pub(crate) struct Draft {
    pub subject: DistinguishedName,
    pub alternate_name: Option<String>,
    pub validity: Validity,
    /// Subject the key pair provider keys this certificate's key pair on
    pub key_subject: String,
    pub extensions: Vec<X509Extension>,
    pub payload: Option<String>,
}

/// State shared by the per-role generators.
pub(crate) struct Shared {
    pub config: Config,
    pub stores: Collaborators,
    pub payload_cache: ContentAccessPayloadCache,
    pub anonymous_cache: Arc<dyn AnonymousContentCache>,
}

impl Shared {
    pub fn backdated_now(&self) -> DateTime<Utc> {
        Utc::now() - Duration::minutes(i64::from(self.config.certificates.backdate_minutes))
    }

    /// Validate, allocate a serial, then sign.
    pub fn sign(&self, kind: CertificateKind, subject: &str, draft: Draft) -> Result<IssuedCertificate> {
        validate_subject(
            &draft.subject,
            draft.alternate_name.as_deref(),
            &draft.validity,
        )?;

        let key_pair = self.stores.keys.get_or_create(&draft.key_subject)?;
        let serial = allocate_serial(self.stores.serials.as_ref(), draft.validity.not_after)?;
        let built = build_certificate(
            &CertificateRequest {
                subject: draft.subject,
                alternate_name: draft.alternate_name,
                validity: draft.validity,
                key_pair: &key_pair,
                serial: &serial,
                extensions: draft.extensions,
            },
            self.stores.signer.as_ref(),
        )?;

        let now = Utc::now();
        Ok(IssuedCertificate {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            subject: subject.to_string(),
            key_pem: key_pair.serialize_pem(),
            cert_pem: built.pem,
            payload: draft.payload,
            serial: serial.into_serial(),
            environment_ids: Vec::new(),
            created: now,
            updated: now,
        })
    }

    /// Store `fresh` and revoke the serial of whatever it replaces.
    pub fn supersede(&self, fresh: IssuedCertificate) -> Result<IssuedCertificate> {
        match self.stores.certificates.put(fresh.clone())? {
            Some(previous) => {
                self.stores.serials.revoke(previous.serial.id)?;
                info!(
                    "Superseded {} certificate for {}: serial {} revoked, serial {} issued",
                    fresh.kind, fresh.subject, previous.serial.id, fresh.serial.id
                );
            }
            None => info!(
                "Issued {} certificate for {} with serial {}",
                fresh.kind, fresh.subject, fresh.serial.id
            ),
        }

        if fresh.kind == CertificateKind::Entitlement {
            self.stores.entitlements.set_dirty(&fresh.subject, false)?;
        }
        Ok(fresh)
    }

    /// Certificates of short-lived roles are only renewed once expired.
    fn renewal_window(&self, kind: CertificateKind) -> Duration {
        match kind {
            CertificateKind::ContentAccess | CertificateKind::AnonymousContentAccess => {
                Duration::zero()
            }
            _ => Duration::days(i64::from(self.config.certificates.renewal_threshold_days)),
        }
    }

    pub fn state_of(&self, certificate: &IssuedCertificate) -> Result<CertificateState> {
        let revoked = self
            .stores
            .serials
            .get(certificate.serial.id)?
            .map(|serial| serial.revoked)
            .unwrap_or(certificate.serial.revoked);
        if revoked {
            return Ok(CertificateState::Superseded);
        }

        let renew_at = Utc::now() + self.renewal_window(certificate.kind);
        if certificate.serial.is_expired(renew_at) {
            return Ok(CertificateState::Stale);
        }

        if certificate.kind == CertificateKind::Entitlement
            && self
                .stores
                .entitlements
                .get_entitlement(&certificate.subject)?
                .dirty
        {
            return Ok(CertificateState::Stale);
        }

        Ok(CertificateState::Valid)
    }
}

pub struct CertificateLifecycleManager {
    shared: Shared,
}

impl CertificateLifecycleManager {
    pub fn new(
        config: Config,
        stores: Collaborators,
        anonymous_cache: Arc<dyn AnonymousContentCache>,
    ) -> Self {
        let payload_cache =
            ContentAccessPayloadCache::new(stores.payloads.clone(), config.cache.payload_key_version);
        Self {
            shared: Shared {
                config,
                stores,
                payload_cache,
                anonymous_cache,
            },
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn payload_cache(&self) -> &ContentAccessPayloadCache {
        &self.shared.payload_cache
    }

    pub fn state(&self, role: &CertificateRole) -> Result<CertificateState> {
        match self.shared.stores.certificates.get(role.kind(), role.subject())? {
            Some(certificate) => {
                if let CertificateRole::ContentAccess { consumer_id } = role {
                    let consumer = self.shared.stores.consumers.get_consumer(consumer_id)?;
                    if certificate.environment_ids != consumer.environment_ids {
                        return Ok(CertificateState::Stale);
                    }
                }
                self.shared.state_of(&certificate)
            }
            None => Ok(CertificateState::Absent),
        }
    }

    /// Current certificate for `role`, issuing one when absent or stale.
    /// Content access certificates are `None` for owners not in simple
    /// content access mode and for consumers that can't read compact
    /// certificates.
    pub fn generate(&self, role: &CertificateRole) -> Result<Option<IssuedCertificate>> {
        if let CertificateRole::ContentAccess { consumer_id } = role {
            return content_access::generate(&self.shared, consumer_id, false);
        }

        if let Some(existing) = self
            .shared
            .stores
            .certificates
            .get(role.kind(), role.subject())?
        {
            if self.shared.state_of(&existing)? == CertificateState::Valid {
                debug!("Reusing valid certificate for {}", role);
                return Ok(Some(existing));
            }
        }

        let fresh = self.issue(role)?;
        self.shared.supersede(fresh).map(Some)
    }

    /// Replace the certificate for `role`. A lazy regeneration of an
    /// entitlement only flags it dirty; the next [`generate`](Self::generate)
    /// does the work. A regenerated entitlement that no longer fits a legacy
    /// certificate keeps its previous certificate.
    pub fn regenerate(&self, role: &CertificateRole, lazy: bool) -> Result<Option<IssuedCertificate>> {
        if let CertificateRole::Entitlement { entitlement_id } = role {
            if lazy {
                self.shared.stores.entitlements.set_dirty(entitlement_id, true)?;
                debug!("Flagged entitlement {} for regeneration", entitlement_id);
                return self
                    .shared
                    .stores
                    .certificates
                    .get(CertificateKind::Entitlement, entitlement_id);
            }
        }
        if let CertificateRole::ContentAccess { consumer_id } = role {
            return content_access::generate(&self.shared, consumer_id, true);
        }

        let previous = self
            .shared
            .stores
            .certificates
            .get(role.kind(), role.subject())?;
        match self.issue(role) {
            Ok(fresh) => self.shared.supersede(fresh).map(Some),
            Err(err @ EntitlementError::CertificateTooLarge { .. }) if previous.is_some() => {
                warn!("Keeping previous certificate for {}: {}", role, err);
                Ok(previous)
            }
            Err(err) => Err(err),
        }
    }

    fn issue(&self, role: &CertificateRole) -> Result<IssuedCertificate> {
        match role {
            CertificateRole::Entitlement { entitlement_id } => {
                entitlement::issue(&self.shared, entitlement_id)
            }
            CertificateRole::Identity { consumer_id } => identity::issue_identity(&self.shared, consumer_id),
            CertificateRole::Product { product_id } => identity::issue_product(&self.shared, product_id),
            CertificateRole::Ueber { owner_id } => identity::issue_ueber(&self.shared, owner_id),
            CertificateRole::AnonymousContentAccess { consumer_uuid } => {
                anonymous::issue(&self.shared, consumer_uuid)
            }
            CertificateRole::ContentAccess { consumer_id } => {
                content_access::generate(&self.shared, consumer_id, true)?.ok_or_else(|| {
                    EntitlementError::creation(format!(
                        "consumer {} is not eligible for a content access certificate",
                        consumer_id
                    ))
                })
            }
        }
    }

    /// Signed content access payload for a consumer, `None` when the consumer
    /// gets no content access certificate.
    pub fn get_content_payload(&self, consumer_id: &str) -> Result<Option<String>> {
        content_access::payload_for(&self.shared, consumer_id)
    }

    /// The X.509 part of a consumer's content access certificate.
    pub fn get_x509_certificate(&self, consumer_id: &str) -> Result<Option<IssuedCertificate>> {
        content_access::x509_for(&self.shared, consumer_id, false)
    }

    pub fn has_cert_changed_since(&self, consumer_id: &str, since: DateTime<Utc>) -> Result<bool> {
        content_access::changed_since(&self.shared, consumer_id, since)
    }

    /// Promotions of the stored environments with the given ids, in order.
    pub fn environment_promotions(&self, environment_ids: &[EnvironmentId]) -> Result<Vec<EnvironmentPromotions>> {
        environment_ids
            .iter()
            .map(|id| {
                self.shared
                    .stores
                    .environments
                    .get_environment(id)
                    .map(|env| EnvironmentPromotions::from(&env))
            })
            .collect()
    }

    /// Flag, and return, the entitlements of `consumer_ids` whose winning
    /// environment changed for any of their content.
    pub fn detect_dirty_entitlements(
        &self,
        consumer_ids: &[ConsumerId],
        before: &[EnvironmentPromotions],
        after: &[EnvironmentPromotions],
    ) -> Result<BTreeSet<EntitlementId>> {
        let stores = &self.shared.stores;
        let mut relevant = Vec::new();
        for consumer_id in consumer_ids {
            let consumer = stores.consumers.get_consumer(consumer_id)?;
            for ent in stores.entitlements.entitlements_for_consumer(consumer_id)? {
                let pool = stores.pools.get_pool(&ent.pool_id)?;
                relevant.push(content::EntitlementContent {
                    entitlement_id: ent.id.clone(),
                    consumer_id: consumer.id.clone(),
                    content_ids: content::entitlement_content_ids(&pool, &consumer),
                });
            }
        }

        let dirty = content::detect_dirty_entitlements(&relevant, before, after);
        for id in &dirty {
            stores.entitlements.set_dirty(id, true)?;
        }
        info!(
            "Environment change left {} of {} entitlements dirty",
            dirty.len(),
            relevant.len()
        );
        Ok(dirty)
    }

    /// Regenerate the entitlements, across the environment's consumers, that
    /// carry any of `content_ids`. Returns the affected entitlement ids.
    pub fn regenerate_for_environment(
        &self,
        environment_id: &str,
        content_ids: &BTreeSet<ContentId>,
        lazy: bool,
    ) -> Result<BTreeSet<EntitlementId>> {
        let stores = &self.shared.stores;
        let mut affected = BTreeSet::new();

        for consumer in stores.consumers.consumers_in_environment(environment_id)? {
            for ent in stores.entitlements.entitlements_for_consumer(&consumer.id)? {
                let pool = stores.pools.get_pool(&ent.pool_id)?;
                if !content::entitlement_content_ids(&pool, &consumer).is_disjoint(content_ids) {
                    affected.insert(ent.id);
                }
            }
        }

        for id in &affected {
            self.regenerate(&CertificateRole::entitlement(id.clone()), lazy)?;
        }
        info!(
            "Regenerated {} entitlements for environment {} (lazy={})",
            affected.len(),
            environment_id,
            lazy
        );
        Ok(affected)
    }

    /// Serials revoked by superseding certificates.
    pub fn revoked_serials(&self) -> Result<Vec<CertificateSerial>> {
        self.shared.stores.serials.revoked()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cache::LruAnonymousContentCache;
    use crate::config::{CaConfig, KeyAlgorithm};
    use crate::pki::{InMemoryKeyPairProvider, LocalCertificateAuthority, SignatureScheme};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct Harness {
        pub directory: Arc<InMemoryDirectory>,
        pub manager: CertificateLifecycleManager,
        pub signer: Arc<LocalCertificateAuthority>,
    }

    /// Counts every use of the CA private key.
    pub struct CountingSigner {
        inner: LocalCertificateAuthority,
        uses: AtomicUsize,
    }

    impl CountingSigner {
        pub fn uses(&self) -> usize {
            self.uses.load(Ordering::SeqCst)
        }
    }

    impl CaSigner for CountingSigner {
        fn scheme(&self) -> SignatureScheme {
            self.inner.scheme()
        }

        fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
            self.uses.fetch_add(1, Ordering::SeqCst);
            self.inner.sign(data)
        }

        fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
            self.inner.verify(data, signature)
        }

        fn ca_public_key_der(&self) -> Vec<u8> {
            self.inner.ca_public_key_der()
        }

        fn ca_certificate_pem(&self) -> String {
            self.inner.ca_certificate_pem()
        }

        fn issue(
            &self,
            params: &rcgen::CertificateParams,
            subject_key: &rcgen::KeyPair,
        ) -> Result<rcgen::Certificate> {
            self.uses.fetch_add(1, Ordering::SeqCst);
            self.inner.issue(params, subject_key)
        }
    }

    /// Harness whose CA counts signatures, for asserting no key use happened.
    pub fn counting_harness(config: Config) -> (Arc<InMemoryDirectory>, CertificateLifecycleManager, Arc<CountingSigner>) {
        let directory = Arc::new(InMemoryDirectory::new());
        let signer = Arc::new(CountingSigner {
            inner: LocalCertificateAuthority::generate(&CaConfig::default(), KeyAlgorithm::EcdsaP256).unwrap(),
            uses: AtomicUsize::new(0),
        });
        let stores = Collaborators::in_memory(
            directory.clone(),
            signer.clone(),
            Arc::new(InMemoryKeyPairProvider::new(KeyAlgorithm::EcdsaP256)),
        );
        let anonymous = Arc::new(LruAnonymousContentCache::from_config(&config.cache).unwrap());
        let manager = CertificateLifecycleManager::new(config, stores, anonymous);
        (directory, manager, signer)
    }

    pub fn harness_with(config: Config) -> Harness {
        let directory = Arc::new(InMemoryDirectory::new());
        let signer = Arc::new(
            LocalCertificateAuthority::generate(&CaConfig::default(), KeyAlgorithm::EcdsaP256).unwrap(),
        );
        let stores = Collaborators::in_memory(
            directory.clone(),
            signer.clone(),
            Arc::new(InMemoryKeyPairProvider::new(KeyAlgorithm::EcdsaP256)),
        );
        let anonymous = Arc::new(LruAnonymousContentCache::from_config(&config.cache).unwrap());
        Harness {
            directory,
            manager: CertificateLifecycleManager::new(config, stores, anonymous),
            signer,
        }
    }

    pub fn harness() -> Harness {
        harness_with(Config::default())
    }

    pub fn content(id: &str) -> Content {
        Content::new(id, format!("label-{}", id), format!("/content/{}", id))
    }

    /// Owner `owner-1` with a v3 system `consumer-1` entitled to product
    /// `100` through pool `pool-1`, entitlement `ent-1`.
    pub fn seed(directory: &InMemoryDirectory, content: Vec<(Content, bool)>) {
        let mut owner = Owner::new("owner-1", "acme");
        owner.last_content_update = Utc::now() - Duration::days(1);
        directory.add_owner(owner);

        let mut consumer = Consumer::new("consumer-1", "box-1", "owner-1", ConsumerType::System);
        consumer
            .facts
            .insert(facts::CERTIFICATE_VERSION.to_string(), "3.4".to_string());
        directory.add_consumer(consumer);

        let mut engineering = Product::new("100", "Awesome OS");
        for (c, enabled) in content {
            engineering = engineering.with_content(c, enabled);
        }
        let mut sku = Product::new("MKT-1", "Awesome OS Premium");
        sku.provided_products.push(engineering);

        directory.add_pool(Pool {
            id: "pool-1".to_string(),
            owner_id: "owner-1".to_string(),
            product: sku,
            quantity: 10,
            start_date: Utc::now() - Duration::days(10),
            end_date: Utc::now() + Duration::days(365),
            order_number: Some("order-1".to_string()),
            contract_number: None,
            account_number: None,
            attributes: BTreeMap::new(),
        });
        directory.add_entitlement(Entitlement {
            id: "ent-1".to_string(),
            consumer_id: "consumer-1".to_string(),
            pool_id: "pool-1".to_string(),
            quantity: 1,
            dirty: false,
        });
    }
}
