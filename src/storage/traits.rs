use crate::types::*;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Persists certificate serials. `create` must return a serial carrying its
/// durable id, since that id is embedded in the certificate.
pub trait SerialStore: Send + Sync {
    fn create(&self, expiration: DateTime<Utc>) -> Result<CertificateSerial>;
    fn revoke(&self, id: SerialId) -> Result<()>;
    fn get(&self, id: SerialId) -> Result<Option<CertificateSerial>>;
    fn revoked(&self) -> Result<Vec<CertificateSerial>>;
}

/// One live certificate per (kind, subject).
pub trait CertificateStore: Send + Sync {
    fn get(&self, kind: CertificateKind, subject: &str) -> Result<Option<IssuedCertificate>>;
    /// Store `certificate`, returning the one it replaces.
    fn put(&self, certificate: IssuedCertificate) -> Result<Option<IssuedCertificate>>;
    fn remove(&self, kind: CertificateKind, subject: &str) -> Result<Option<IssuedCertificate>>;
    fn list(&self, kind: CertificateKind) -> Result<Vec<IssuedCertificate>>;
}

pub trait OwnerLookup: Send + Sync {
    fn get_owner(&self, id: &str) -> Result<Owner>;
    /// Content of every product in the owner's pools, deduplicated by content id.
    fn active_content_for_owner(&self, owner_id: &str) -> Result<Vec<ProductContent>>;
}

pub trait ConsumerLookup: Send + Sync {
    fn get_consumer(&self, id: &str) -> Result<Consumer>;
    fn consumers_in_environment(&self, environment_id: &str) -> Result<Vec<Consumer>>;
    fn get_anonymous_consumer(&self, uuid: &str) -> Result<AnonymousConsumer>;
}

pub trait EnvironmentLookup: Send + Sync {
    fn get_environment(&self, id: &str) -> Result<Environment>;
    /// The consumer's environments, highest priority first.
    fn get_consumer_environments(&self, consumer: &Consumer) -> Result<Vec<Environment>>;
}

pub trait ProductLookup: Send + Sync {
    fn get_product(&self, id: &str) -> Result<Product>;
    /// Products for the given ids; unknown ids are skipped.
    fn get_products(&self, ids: &BTreeSet<ProductId>) -> Result<Vec<Product>>;
}

pub trait PoolLookup: Send + Sync {
    fn get_pool(&self, id: &str) -> Result<Pool>;
}

pub trait EntitlementStore: Send + Sync {
    fn get_entitlement(&self, id: &str) -> Result<Entitlement>;
    fn entitlements_for_consumer(&self, consumer_id: &str) -> Result<Vec<Entitlement>>;
    fn set_dirty(&self, id: &str, dirty: bool) -> Result<()>;
    /// Product ids, provided products included, the consumer is entitled to.
    fn entitled_product_ids(&self, consumer_id: &str) -> Result<BTreeSet<ProductId>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(ContentAccessPayload),
    AlreadyExists,
}

/// Content access payload rows, unique per (owner, payload key).
pub trait PayloadStore: Send + Sync {
    fn get_payload(&self, owner_id: &str, payload_key: &str) -> Result<Option<ContentAccessPayload>>;
    /// Insert unless a row with the same (owner, key) exists.
    fn try_create_unique(&self, payload: ContentAccessPayload) -> Result<CreateOutcome>;
    /// Swap in a regenerated payload for an existing key.
    fn replace(&self, payload: ContentAccessPayload) -> Result<()>;
}
