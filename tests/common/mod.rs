#![allow(dead_code)]

use chrono::{Duration, Utc};
use entitlement_pki::cache::LruAnonymousContentCache;
use entitlement_pki::pki::{InMemoryKeyPairProvider, LocalCertificateAuthority, PayloadBlock};
use entitlement_pki::storage::*;
use entitlement_pki::types::*;
use entitlement_pki::{CertificateLifecycleManager, Collaborators, Config};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const OWNER: &str = "owner-1";
pub const CONSUMER: &str = "consumer-1";
pub const ENTITLEMENT: &str = "ent-1";

/// A lifecycle manager over in-memory collaborators, with the stores a test
/// may want to inspect kept at their concrete types.
pub struct Fixture {
    pub directory: Arc<InMemoryDirectory>,
    pub serials: Arc<InMemorySerialStore>,
    pub payloads: Arc<InMemoryPayloadStore>,
    pub signer: Arc<LocalCertificateAuthority>,
    pub anonymous: Arc<LruAnonymousContentCache>,
    pub manager: CertificateLifecycleManager,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        let serials = Arc::new(InMemorySerialStore::new());
        let payloads = Arc::new(InMemoryPayloadStore::new());
        let signer = Arc::new(
            LocalCertificateAuthority::generate(&config.ca, config.certificates.key_algorithm).unwrap(),
        );
        let anonymous = Arc::new(LruAnonymousContentCache::from_config(&config.cache).unwrap());

        let stores = Collaborators {
            serials: serials.clone(),
            certificates: Arc::new(InMemoryCertificateStore::new()),
            owners: directory.clone(),
            consumers: directory.clone(),
            environments: directory.clone(),
            products: directory.clone(),
            pools: directory.clone(),
            entitlements: directory.clone(),
            payloads: payloads.clone(),
            signer: signer.clone(),
            keys: Arc::new(InMemoryKeyPairProvider::new(config.certificates.key_algorithm)),
        };
        let manager = CertificateLifecycleManager::new(config, stores, anonymous.clone());

        Self {
            directory,
            serials,
            payloads,
            signer,
            anonymous,
            manager,
        }
    }

    /// Owner `acme`, consumer [`CONSUMER`] and entitlement [`ENTITLEMENT`] to
    /// a pool whose SKU provides engineering product `100` with `content`.
    pub fn seed(&self, v3: bool, content: Vec<(Content, bool)>) {
        let mut owner = Owner::new(OWNER, "acme");
        owner.last_content_update = Utc::now() - Duration::days(1);
        self.directory.add_owner(owner);

        let mut consumer = Consumer::new(CONSUMER, "box-1", OWNER, ConsumerType::System);
        consumer.facts.insert(
            facts::CERTIFICATE_VERSION.to_string(),
            if v3 { "3.4" } else { "1.0" }.to_string(),
        );
        consumer
            .facts
            .insert(facts::ARCHITECTURE.to_string(), "x86_64".to_string());
        self.directory.add_consumer(consumer);

        let mut engineering = Product::new("100", "Awesome OS")
            .with_attribute(attributes::VERSION, "9")
            .with_attribute(attributes::ARCHITECTURE, "x86_64");
        for (c, enabled) in content {
            engineering = engineering.with_content(c, enabled);
        }
        let mut sku = Product::new("MKT-1", "Awesome OS Premium")
            .with_attribute(attributes::SUPPORT_LEVEL, "Premium");
        sku.provided_products.push(engineering);

        self.directory.add_pool(Pool {
            id: "pool-1".to_string(),
            owner_id: OWNER.to_string(),
            product: sku,
            quantity: 10,
            start_date: Utc::now() - Duration::days(10),
            end_date: Utc::now() + Duration::days(365),
            order_number: Some("order-1".to_string()),
            contract_number: Some("contract-1".to_string()),
            account_number: None,
            attributes: BTreeMap::new(),
        });
        self.directory.add_entitlement(Entitlement {
            id: ENTITLEMENT.to_string(),
            consumer_id: CONSUMER.to_string(),
            pool_id: "pool-1".to_string(),
            quantity: 2,
            dirty: false,
        });
    }

    pub fn add_environment(&self, id: &str, name: &str, promotions: &[(&str, Option<bool>)]) {
        let mut environment = Environment::new(id, OWNER, name);
        for (content_id, enabled) in promotions {
            environment.promote(*content_id, *enabled);
        }
        self.directory.add_environment(environment);
    }

    pub fn set_environments(&self, consumer_id: &str, ids: &[&str]) {
        self.directory
            .update_consumer(consumer_id, |c| {
                c.environment_ids = ids.iter().map(|id| id.to_string()).collect()
            })
            .unwrap();
    }
}

pub fn content(id: &str) -> Content {
    Content::new(id, format!("label-{}", id), format!("/content/dist/{}", id))
}

/// Decode the payload of a served artifact, checking its signature.
pub fn payload_body(artifact: &str, fixture: &Fixture) -> entitlement_pki::pki::EntitlementBody {
    let block = PayloadBlock::parse(artifact).unwrap().expect("artifact has a payload");
    block.verify(fixture.signer.as_ref()).unwrap();
    block.body().unwrap()
}
