//! In-memory collaborators backed by `DashMap`.

use crate::error::EntitlementError;
use crate::storage::traits::*;
use crate::types::*;
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

fn not_found(what: &str, id: &str) -> EntitlementError {
    EntitlementError::NotFound(format!("{} {}", what, id))
}

#[derive(Debug)]
pub struct InMemorySerialStore {
    next_id: AtomicU64,
    serials: DashMap<SerialId, CertificateSerial>,
}

impl InMemorySerialStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            serials: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

impl Default for InMemorySerialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialStore for InMemorySerialStore {
    fn create(&self, expiration: DateTime<Utc>) -> Result<CertificateSerial> {
        let serial = CertificateSerial {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            expiration,
            revoked: false,
            created: Utc::now(),
        };
        self.serials.insert(serial.id, serial.clone());
        Ok(serial)
    }

    fn revoke(&self, id: SerialId) -> Result<()> {
        let mut serial = self
            .serials
            .get_mut(&id)
            .ok_or_else(|| not_found("serial", &id.to_string()))?;
        serial.revoked = true;
        Ok(())
    }

    fn get(&self, id: SerialId) -> Result<Option<CertificateSerial>> {
        Ok(self.serials.get(&id).map(|s| s.clone()))
    }

    fn revoked(&self) -> Result<Vec<CertificateSerial>> {
        let mut revoked: Vec<CertificateSerial> = self
            .serials
            .iter()
            .filter(|s| s.revoked)
            .map(|s| s.clone())
            .collect();
        revoked.sort_by_key(|s| s.id);
        Ok(revoked)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCertificateStore {
    certificates: DashMap<(CertificateKind, String), IssuedCertificate>,
}

impl InMemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertificateStore for InMemoryCertificateStore {
    fn get(&self, kind: CertificateKind, subject: &str) -> Result<Option<IssuedCertificate>> {
        Ok(self
            .certificates
            .get(&(kind, subject.to_string()))
            .map(|c| c.clone()))
    }

    fn put(&self, certificate: IssuedCertificate) -> Result<Option<IssuedCertificate>> {
        let key = (certificate.kind, certificate.subject.clone());
        Ok(self.certificates.insert(key, certificate))
    }

    fn remove(&self, kind: CertificateKind, subject: &str) -> Result<Option<IssuedCertificate>> {
        Ok(self
            .certificates
            .remove(&(kind, subject.to_string()))
            .map(|(_, c)| c))
    }

    fn list(&self, kind: CertificateKind) -> Result<Vec<IssuedCertificate>> {
        Ok(self
            .certificates
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPayloadStore {
    payloads: DashMap<(OwnerId, String), ContentAccessPayload>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    fn get_payload(&self, owner_id: &str, payload_key: &str) -> Result<Option<ContentAccessPayload>> {
        Ok(self
            .payloads
            .get(&(owner_id.to_string(), payload_key.to_string()))
            .map(|p| p.clone()))
    }

    fn try_create_unique(&self, payload: ContentAccessPayload) -> Result<CreateOutcome> {
        let key = (payload.owner_id.clone(), payload.payload_key.clone());
        match self.payloads.entry(key) {
            Entry::Occupied(_) => Ok(CreateOutcome::AlreadyExists),
            Entry::Vacant(entry) => {
                entry.insert(payload.clone());
                Ok(CreateOutcome::Created(payload))
            }
        }
    }

    fn replace(&self, payload: ContentAccessPayload) -> Result<()> {
        let key = (payload.owner_id.clone(), payload.payload_key.clone());
        self.payloads.insert(key, payload);
        Ok(())
    }
}

/// Owner, consumer, environment, product, pool and entitlement data.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    owners: DashMap<OwnerId, Owner>,
    consumers: DashMap<ConsumerId, Consumer>,
    anonymous_consumers: DashMap<String, AnonymousConsumer>,
    environments: DashMap<EnvironmentId, Environment>,
    products: DashMap<ProductId, Product>,
    pools: DashMap<PoolId, Pool>,
    entitlements: DashMap<EntitlementId, Entitlement>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_owner(&self, owner: Owner) {
        self.owners.insert(owner.id.clone(), owner);
    }

    pub fn add_consumer(&self, consumer: Consumer) {
        self.consumers.insert(consumer.id.clone(), consumer);
    }

    pub fn add_anonymous_consumer(&self, consumer: AnonymousConsumer) {
        self.anonymous_consumers.insert(consumer.uuid.clone(), consumer);
    }

    pub fn add_environment(&self, environment: Environment) {
        self.environments.insert(environment.id.clone(), environment);
    }

    pub fn add_product(&self, product: Product) {
        self.products.insert(product.id.clone(), product);
    }

    pub fn add_pool(&self, pool: Pool) {
        self.pools.insert(pool.id.clone(), pool);
    }

    pub fn add_entitlement(&self, entitlement: Entitlement) {
        self.entitlements.insert(entitlement.id.clone(), entitlement);
    }

    pub fn update_owner<F: FnOnce(&mut Owner)>(&self, id: &str, f: F) -> Result<()> {
        let mut owner = self.owners.get_mut(id).ok_or_else(|| not_found("owner", id))?;
        f(&mut owner);
        Ok(())
    }

    pub fn update_consumer<F: FnOnce(&mut Consumer)>(&self, id: &str, f: F) -> Result<()> {
        let mut consumer = self
            .consumers
            .get_mut(id)
            .ok_or_else(|| not_found("consumer", id))?;
        f(&mut consumer);
        Ok(())
    }

    pub fn update_environment<F: FnOnce(&mut Environment)>(&self, id: &str, f: F) -> Result<()> {
        let mut environment = self
            .environments
            .get_mut(id)
            .ok_or_else(|| not_found("environment", id))?;
        f(&mut environment);
        Ok(())
    }

    /// Drop an environment from every consumer's list; consumers left with no
    /// environment are deleted. Returns the deleted consumer ids.
    pub fn delete_environment(&self, id: &str) -> Result<Vec<ConsumerId>> {
        self.environments
            .remove(id)
            .ok_or_else(|| not_found("environment", id))?;

        let mut emptied = Vec::new();
        for mut consumer in self.consumers.iter_mut() {
            let before = consumer.environment_ids.len();
            consumer.environment_ids.retain(|env| env != id);
            if before > 0 && consumer.environment_ids.is_empty() {
                emptied.push(consumer.id.clone());
            }
        }
        for consumer_id in &emptied {
            self.consumers.remove(consumer_id);
            self.entitlements.retain(|_, e| &e.consumer_id != consumer_id);
        }

        info!(
            "Deleted environment {}, removed {} consumers left without environments",
            id,
            emptied.len()
        );
        Ok(emptied)
    }

    fn collect_content(product: &Product, content: &mut BTreeMap<ContentId, ProductContent>) {
        for pc in &product.product_content {
            content
                .entry(pc.content.id.clone())
                .and_modify(|existing| existing.enabled |= pc.enabled)
                .or_insert_with(|| pc.clone());
        }
        for provided in &product.provided_products {
            Self::collect_content(provided, content);
        }
        if let Some(derived) = &product.derived_product {
            Self::collect_content(derived, content);
        }
    }

    fn collect_product_ids(product: &Product, ids: &mut BTreeSet<ProductId>) {
        ids.insert(product.id.clone());
        for provided in &product.provided_products {
            Self::collect_product_ids(provided, ids);
        }
    }
}

impl OwnerLookup for InMemoryDirectory {
    fn get_owner(&self, id: &str) -> Result<Owner> {
        self.owners
            .get(id)
            .map(|o| o.clone())
            .ok_or_else(|| not_found("owner", id))
    }

    fn active_content_for_owner(&self, owner_id: &str) -> Result<Vec<ProductContent>> {
        let mut content = BTreeMap::new();
        for pool in self.pools.iter().filter(|p| p.owner_id == owner_id) {
            Self::collect_content(&pool.product, &mut content);
        }
        debug!("Owner {} has {} active content", owner_id, content.len());
        Ok(content.into_values().collect())
    }
}

impl ConsumerLookup for InMemoryDirectory {
    fn get_consumer(&self, id: &str) -> Result<Consumer> {
        self.consumers
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| not_found("consumer", id))
    }

    fn consumers_in_environment(&self, environment_id: &str) -> Result<Vec<Consumer>> {
        let mut consumers: Vec<Consumer> = self
            .consumers
            .iter()
            .filter(|c| c.environment_ids.iter().any(|e| e == environment_id))
            .map(|c| c.clone())
            .collect();
        consumers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(consumers)
    }

    fn get_anonymous_consumer(&self, uuid: &str) -> Result<AnonymousConsumer> {
        self.anonymous_consumers
            .get(uuid)
            .map(|c| c.clone())
            .ok_or_else(|| not_found("anonymous consumer", uuid))
    }
}

impl EnvironmentLookup for InMemoryDirectory {
    fn get_environment(&self, id: &str) -> Result<Environment> {
        self.environments
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found("environment", id))
    }

    fn get_consumer_environments(&self, consumer: &Consumer) -> Result<Vec<Environment>> {
        Ok(consumer
            .environment_ids
            .iter()
            .filter_map(|id| self.environments.get(id).map(|e| e.clone()))
            .collect())
    }
}

impl ProductLookup for InMemoryDirectory {
    fn get_product(&self, id: &str) -> Result<Product> {
        self.products
            .get(id)
            .map(|p| p.clone())
            .ok_or_else(|| not_found("product", id))
    }

    fn get_products(&self, ids: &BTreeSet<ProductId>) -> Result<Vec<Product>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.products.get(id).map(|p| p.clone()))
            .collect())
    }
}

impl PoolLookup for InMemoryDirectory {
    fn get_pool(&self, id: &str) -> Result<Pool> {
        self.pools
            .get(id)
            .map(|p| p.clone())
            .ok_or_else(|| not_found("pool", id))
    }
}

impl EntitlementStore for InMemoryDirectory {
    fn get_entitlement(&self, id: &str) -> Result<Entitlement> {
        self.entitlements
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found("entitlement", id))
    }

    fn entitlements_for_consumer(&self, consumer_id: &str) -> Result<Vec<Entitlement>> {
        let mut entitlements: Vec<Entitlement> = self
            .entitlements
            .iter()
            .filter(|e| e.consumer_id == consumer_id)
            .map(|e| e.clone())
            .collect();
        entitlements.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entitlements)
    }

    fn set_dirty(&self, id: &str, dirty: bool) -> Result<()> {
        let mut entitlement = self
            .entitlements
            .get_mut(id)
            .ok_or_else(|| not_found("entitlement", id))?;
        entitlement.dirty = dirty;
        Ok(())
    }

    fn entitled_product_ids(&self, consumer_id: &str) -> Result<BTreeSet<ProductId>> {
        let mut ids = BTreeSet::new();
        for entitlement in self.entitlements_for_consumer(consumer_id)? {
            if let Some(pool) = self.pools.get(&entitlement.pool_id) {
                Self::collect_product_ids(&pool.product, &mut ids);
            }
        }
        Ok(ids)
    }
}
