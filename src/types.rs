use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type OwnerId = String;
pub type ConsumerId = String;
pub type EnvironmentId = String;
pub type ContentId = String;
pub type ProductId = String;
pub type PoolId = String;
pub type EntitlementId = String;
pub type SerialId = u64;

/// Well-known product attribute names
pub mod attributes {
    pub const ARCHITECTURE: &str = "arch";
    pub const VERSION: &str = "version";
    pub const VARIANT: &str = "variant";
    pub const WARNING_PERIOD: &str = "warning_period";
    pub const SOCKETS: &str = "sockets";
    pub const RAM: &str = "ram";
    pub const CORES: &str = "cores";
    pub const MANAGEMENT_ENABLED: &str = "management_enabled";
    pub const STACKING_ID: &str = "stacking_id";
    pub const VIRT_ONLY: &str = "virt_only";
    pub const VIRT_LIMIT: &str = "virt_limit";
    pub const SUPPORT_LEVEL: &str = "support_level";
    pub const SUPPORT_TYPE: &str = "support_type";
    pub const USAGE: &str = "usage";
    pub const ROLES: &str = "roles";
    pub const ADDONS: &str = "addons";
    pub const CONTENT_ENABLED: &str = "content_enabled";
    pub const CONTENT_DISABLED: &str = "content_disabled";
    pub const DERIVED_POOL: &str = "pool_derived";
    pub const UNMAPPED_GUESTS_ONLY: &str = "unmapped_guests_only";
}

/// Consumer fact names consulted during issuance
pub mod facts {
    pub const ARCHITECTURE: &str = "uname.machine";
    pub const CERTIFICATE_VERSION: &str = "system.certificate_version";
    pub const SUPPORTED_ARCHITECTURES: &str = "supported_architectures";
}

pub const CERT_V3_CAPABILITY: &str = "cert_v3";

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// Split a comma separated attribute into its trimmed, non-empty items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentAccessMode {
    Entitlement,
    OrgEnvironment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub key: String,
    /// Path prefix prepended to every content URL, may reference `$env`
    pub content_prefix: Option<String>,
    pub content_access_mode: ContentAccessMode,
    pub last_content_update: DateTime<Utc>,
}

impl Owner {
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            content_prefix: None,
            content_access_mode: ContentAccessMode::Entitlement,
            last_content_update: Utc::now(),
        }
    }

    pub fn is_using_simple_content_access(&self) -> bool {
        self.content_access_mode == ContentAccessMode::OrgEnvironment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerType {
    System,
    Hypervisor,
    /// Manifest consumers (satellite style distributors)
    Distributor,
}

impl ConsumerType {
    pub fn is_manifest(&self) -> bool {
        matches!(self, ConsumerType::Distributor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consumer {
    pub id: ConsumerId,
    pub uuid: String,
    pub name: String,
    pub owner_id: OwnerId,
    pub consumer_type: ConsumerType,
    pub facts: BTreeMap<String, String>,
    pub capabilities: BTreeSet<String>,
    /// Environment references in priority order, index 0 wins
    pub environment_ids: Vec<EnvironmentId>,
    pub created: DateTime<Utc>,
}

impl Consumer {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
        consumer_type: ConsumerType,
    ) -> Self {
        Self {
            id: id.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            owner_id: owner_id.into(),
            consumer_type,
            facts: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            environment_ids: Vec::new(),
            created: Utc::now(),
        }
    }

    pub fn fact(&self, name: &str) -> Option<&str> {
        self.facts.get(name).map(String::as_str)
    }

    pub fn arch(&self) -> Option<&str> {
        self.fact(facts::ARCHITECTURE)
    }

    /// The arch fact plus any supported architectures, in fact order.
    pub fn all_arches(&self) -> Vec<String> {
        let mut arches: Vec<String> = self.arch().map(str::to_string).into_iter().collect();
        if let Some(supported) = self.fact(facts::SUPPORTED_ARCHITECTURES) {
            arches.extend(split_list(supported));
        }
        arches
    }

    /// Whether this consumer understands compact certificates with an entitlement payload.
    pub fn is_cert_v3_capable(&self) -> bool {
        match self.consumer_type {
            ConsumerType::Distributor => self.capabilities.contains(CERT_V3_CAPABILITY),
            // Hypervisors don't consume content, compact is always fine
            ConsumerType::Hypervisor => true,
            ConsumerType::System => self
                .fact(facts::CERTIFICATE_VERSION)
                .map(|v| v.starts_with("3."))
                .unwrap_or(false),
        }
    }
}

/// A (content, enabled) promotion inside an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentContent {
    pub content_id: ContentId,
    pub enabled: Option<bool>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub owner_id: OwnerId,
    pub name: String,
    pub contents: BTreeMap<ContentId, EnvironmentContent>,
    pub last_content_update: DateTime<Utc>,
}

impl Environment {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            contents: BTreeMap::new(),
            last_content_update: Utc::now(),
        }
    }

    pub fn promote(&mut self, content_id: impl Into<String>, enabled: Option<bool>) {
        let content_id = content_id.into();
        let now = Utc::now();
        self.contents.insert(
            content_id.clone(),
            EnvironmentContent {
                content_id,
                enabled,
                updated: now,
            },
        );
        self.last_content_update = now;
    }

    pub fn demote(&mut self, content_id: &str) -> bool {
        let removed = self.contents.remove(content_id).is_some();
        if removed {
            self.last_content_update = Utc::now();
        }
        removed
    }

    pub fn promotes(&self, content_id: &str) -> bool {
        self.contents.contains_key(content_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub id: ContentId,
    pub content_type: String,
    pub name: String,
    pub label: String,
    pub vendor: String,
    pub content_url: String,
    pub gpg_url: Option<String>,
    /// Comma separated arch list, empty means inherit from the product
    pub arches: Option<String>,
    pub metadata_expire: Option<i64>,
    pub required_tags: Option<String>,
    pub modified_product_ids: BTreeSet<ProductId>,
}

impl Content {
    pub fn new(id: impl Into<String>, label: impl Into<String>, content_url: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            id: id.into(),
            content_type: "yum".to_string(),
            name: label.clone(),
            label,
            vendor: "test-vendor".to_string(),
            content_url: content_url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductContent {
    pub content: Content,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branding {
    pub product_id: ProductId,
    pub name: String,
    pub brand_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub product_content: Vec<ProductContent>,
    pub provided_products: Vec<Product>,
    pub derived_product: Option<Box<Product>>,
    pub branding: Vec<Branding>,
    pub namespace: Option<String>,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_content(mut self, content: Content, enabled: bool) -> Self {
        self.product_content.push(ProductContent { content, enabled });
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn has_content(&self, content_id: &str) -> bool {
        self.product_content.iter().any(|pc| pc.content.id == content_id)
    }

    pub fn sku_enabled_content_ids(&self) -> Vec<String> {
        self.attribute(attributes::CONTENT_ENABLED)
            .map(split_list)
            .unwrap_or_default()
    }

    pub fn sku_disabled_content_ids(&self) -> Vec<String> {
        self.attribute(attributes::CONTENT_DISABLED)
            .map(split_list)
            .unwrap_or_default()
    }

    /// Every content id reachable from this product and the products it provides.
    pub fn content_ids(&self) -> BTreeSet<ContentId> {
        let mut ids: BTreeSet<ContentId> =
            self.product_content.iter().map(|pc| pc.content.id.clone()).collect();
        for provided in &self.provided_products {
            ids.extend(provided.content_ids());
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub owner_id: OwnerId,
    pub product: Product,
    pub quantity: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub order_number: Option<String>,
    pub contract_number: Option<String>,
    pub account_number: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Pool {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn attribute_flag(&self, name: &str) -> bool {
        self.attribute(name).map(is_truthy).unwrap_or(false)
    }

    pub fn product_namespace(&self) -> Option<&str> {
        self.product
            .namespace
            .as_deref()
            .filter(|ns| !ns.trim().is_empty())
    }

    /// Every content id this pool's product graph grants, derived product excluded.
    pub fn content_ids(&self) -> BTreeSet<ContentId> {
        self.product.content_ids()
    }
}

pub fn attribute_flag(value: Option<&str>) -> bool {
    value.map(is_truthy).unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: EntitlementId,
    pub consumer_id: ConsumerId,
    pub pool_id: PoolId,
    pub quantity: i64,
    /// Set when the current certificate no longer reflects the consumer's content view
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSerial {
    pub id: SerialId,
    pub expiration: DateTime<Utc>,
    pub revoked: bool,
    pub created: DateTime<Utc>,
}

impl CertificateSerial {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateKind {
    Entitlement,
    Identity,
    Product,
    Ueber,
    AnonymousContentAccess,
    ContentAccess,
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateKind::Entitlement => "entitlement",
            CertificateKind::Identity => "identity",
            CertificateKind::Product => "product",
            CertificateKind::Ueber => "ueber",
            CertificateKind::AnonymousContentAccess => "anonymous-content-access",
            CertificateKind::ContentAccess => "content-access",
        };
        write!(f, "{}", name)
    }
}

/// A persisted certificate. Never mutated after issue apart from dropping it once superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub id: String,
    pub kind: CertificateKind,
    /// Entitlement id, consumer uuid, product id or owner key depending on `kind`
    pub subject: String,
    pub key_pem: String,
    pub cert_pem: String,
    /// Entitlement data and signature blocks, appended after the PEM body
    pub payload: Option<String>,
    pub serial: CertificateSerial,
    /// Consumer environment ordering a content access certificate was built for
    #[serde(default)]
    pub environment_ids: Vec<EnvironmentId>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl IssuedCertificate {
    /// Certificate PEM followed by the payload blocks, as served to clients.
    pub fn artifact(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{}{}", self.cert_pem, payload),
            None => self.cert_pem.clone(),
        }
    }
}

/// Cached, signed content-access payload for one (owner, payload key) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAccessPayload {
    pub owner_id: OwnerId,
    pub payload_key: String,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousConsumer {
    pub id: String,
    pub uuid: String,
    pub cloud_account_id: String,
    pub product_ids: BTreeSet<ProductId>,
}
