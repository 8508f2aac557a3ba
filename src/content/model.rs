//! Mapping of products, pools and content onto the entitlement body model.

use crate::content::arch::{is_compatible, parse_arches};
use crate::content::paths::PromotedContent;
use crate::error::{EntitlementError, Result};
use crate::pki::payload::{
    ContentModel, EntitlementBody, OrderModel, PoolModel, ProductModel, ServiceModel,
    SubscriptionModel,
};
use crate::types::{
    attribute_flag, attributes, split_list, Consumer, Content, ContentId, Pool, Product, ProductContent,
    ProductId,
};
use chrono::SecondsFormat;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

/// Only engineering products, which carry numeric ids, reach certificates.
pub fn is_engineering_product(product: &Product) -> bool {
    !product.id.is_empty() && product.id.chars().all(|c| c.is_ascii_digit())
}

/// Reject product graphs with records that cannot be rendered.
pub fn validate_product_graph(product: &Product) -> Result<()> {
    if product.id.trim().is_empty() {
        return Err(EntitlementError::Validation(format!(
            "product '{}' has no id",
            product.name
        )));
    }
    for brand in &product.branding {
        if brand.product_id.trim().is_empty() || brand.name.trim().is_empty() {
            return Err(EntitlementError::Validation(format!(
                "product {} has an incomplete branding record",
                product.id
            )));
        }
    }
    for provided in &product.provided_products {
        validate_product_graph(provided)?;
    }
    if let Some(derived) = &product.derived_product {
        validate_product_graph(derived)?;
    }
    Ok(())
}

/// Products whose content an entitlement to `pool` grants: the SKU, its
/// provided products and, for distributors on a non-derived pool, the derived
/// product with its provided products.
pub fn entitlement_products<'p>(pool: &'p Pool, consumer: &Consumer) -> Vec<&'p Product> {
    let mut products: Vec<&Product> = vec![&pool.product];
    products.extend(pool.product.provided_products.iter());

    if consumer.consumer_type.is_manifest() && !pool.has_attribute(attributes::DERIVED_POOL) {
        if let Some(derived) = pool.product.derived_product.as_deref() {
            debug!(
                "Folding derived product {} into distributor certificate for pool {}",
                derived.id, pool.id
            );
            products.push(derived);
            products.extend(derived.provided_products.iter());
        }
    }

    let mut seen = HashSet::new();
    products.retain(|p| seen.insert(p.id.clone()));
    products
}

/// Content ids carried by every product an entitlement to `pool` grants.
pub fn entitlement_content_ids(pool: &Pool, consumer: &Consumer) -> BTreeSet<ContentId> {
    entitlement_products(pool, consumer)
        .into_iter()
        .flat_map(|p| p.product_content.iter().map(|pc| pc.content.id.clone()))
        .collect()
}

/// Everything that shapes which content a consumer sees and how.
pub struct MappingContext<'a> {
    pub consumer: Option<&'a Consumer>,
    pub promoted: &'a PromotedContent<'a>,
    pub environment_filtering: bool,
    pub simple_content_access: bool,
    pub entitled_product_ids: &'a BTreeSet<ProductId>,
}

impl<'a> MappingContext<'a> {
    fn consumer_has_environments(&self) -> bool {
        self.consumer
            .map(|c| !c.environment_ids.is_empty())
            .unwrap_or(false)
    }

    /// Drop content modifying products the consumer isn't entitled to and, in
    /// entitlement mode, content no consumer environment promotes.
    pub fn filter_product_content<'p>(&self, product: &'p Product) -> Vec<&'p ProductContent> {
        let mut seen = HashSet::new();
        product
            .product_content
            .iter()
            .filter(|pc| seen.insert(pc.content.id.as_str()))
            .filter(|pc| {
                let modified = &pc.content.modified_product_ids;
                if self.simple_content_access || modified.is_empty() {
                    return true;
                }
                let entitled = !modified.is_disjoint(self.entitled_product_ids);
                if !entitled {
                    debug!(
                        "Skipping content {}, consumer not entitled to a modified product",
                        pc.content.id
                    );
                }
                entitled
            })
            .filter(|pc| {
                if self.simple_content_access
                    || !self.environment_filtering
                    || !self.consumer_has_environments()
                {
                    return true;
                }
                self.promoted.is_promoted(&pc.content.id)
            })
            .collect()
    }

    pub fn filter_by_arch<'p>(&self, content: Vec<&'p ProductContent>) -> Vec<&'p ProductContent> {
        let consumer_arch = self.consumer.and_then(Consumer::arch);
        content
            .into_iter()
            .filter(|pc| is_compatible(&parse_arches(pc.content.arches.as_deref()), consumer_arch))
            .collect()
    }

    /// Content visible for `product`, after every filter.
    pub fn visible_content<'p>(&self, product: &'p Product) -> Vec<&'p ProductContent> {
        self.filter_by_arch(self.filter_product_content(product))
    }

    fn content_enabled(&self, pc: &ProductContent, sku: &Product) -> bool {
        let mut enabled = pc.enabled;

        // when listed on both, enabled wins
        if sku.sku_disabled_content_ids().contains(&pc.content.id) {
            enabled = false;
        }
        if sku.sku_enabled_content_ids().contains(&pc.content.id) {
            enabled = true;
        }

        if self.environment_filtering && self.consumer_has_environments() {
            if let Some(promoted) = self.promoted.is_enabled(&pc.content.id) {
                debug!("Overriding enabled flag of {} to {}", pc.content.id, promoted);
                enabled = promoted;
            }
        }
        enabled
    }

    pub fn create_content(
        &self,
        content: &[&ProductContent],
        sku: &Product,
        product: &Product,
    ) -> Vec<ContentModel> {
        let product_arches = parse_arches(product.attribute(attributes::ARCHITECTURE));
        content
            .iter()
            .map(|pc| {
                content_model(
                    &pc.content,
                    self.promoted.path(&pc.content),
                    self.content_enabled(pc, sku),
                    &product_arches,
                )
            })
            .collect()
    }

    pub fn map_product(&self, product: &Product, sku: &Product, pool: Option<&Pool>) -> ProductModel {
        let content = self.visible_content(product);
        let mut model = product_model(product, pool);
        model.content = self.create_content(&content, sku, product);
        model
    }

    /// Models for the engineering products in `products`. A content id
    /// appearing under several products is kept only under the first.
    pub fn create_products(
        &self,
        sku: &Product,
        products: &[&Product],
        pool: Option<&Pool>,
    ) -> Vec<ProductModel> {
        let mut seen: HashSet<String> = HashSet::new();
        products
            .iter()
            .filter(|p| is_engineering_product(p))
            .map(|product| {
                let mut model = self.map_product(product, sku, pool);
                model.content.retain(|c| seen.insert(c.id.clone()));
                model
            })
            .collect()
    }
}

fn branding<'p>(pool: Option<&'p Pool>, product_id: &str) -> Option<&'p crate::types::Branding> {
    let pool = pool?;
    let mut matching = pool
        .product
        .branding
        .iter()
        .filter(|b| b.product_id == product_id);
    let first = matching.next();
    if first.is_some() && matching.next().is_some() {
        warn!(
            "Found multiple brand names for product {} in pool {}, using the first",
            product_id, pool.id
        );
    }
    first
}

/// Product model without content.
pub fn product_model(product: &Product, pool: Option<&Pool>) -> ProductModel {
    let brand = branding(pool, &product.id);
    ProductModel {
        id: product.id.clone(),
        name: product.name.clone(),
        variant: product.attribute(attributes::VARIANT).map(str::to_string),
        version: product.attribute(attributes::VERSION).map(str::to_string),
        brand_type: brand.map(|b| b.brand_type.clone()),
        brand_name: brand.map(|b| b.name.clone()),
        architectures: parse_arches(product.attribute(attributes::ARCHITECTURE)),
        content: Vec::new(),
    }
}

/// Content arches fall back to the product's when the content declares none.
pub fn content_model(
    content: &Content,
    path: String,
    enabled: bool,
    product_arches: &[String],
) -> ContentModel {
    let arches = parse_arches(content.arches.as_deref());
    let mut model = ContentModel {
        id: content.id.clone(),
        content_type: content.content_type.clone(),
        name: content.name.clone(),
        label: content.label.clone(),
        vendor: content.vendor.clone(),
        path,
        gpg_url: content.gpg_url.clone().filter(|u| !u.trim().is_empty()),
        enabled: None,
        metadata_expire: content.metadata_expire,
        required_tags: content
            .required_tags
            .as_deref()
            .map(split_list)
            .unwrap_or_default(),
        arches: if arches.is_empty() {
            product_arches.to_vec()
        } else {
            arches
        },
    };
    model.set_enabled(enabled);
    model
}

fn int_attribute(product: &Product, name: &str) -> Option<i64> {
    let value = product.attribute(name)?;
    match value.trim().parse::<i64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring non-numeric {} attribute '{}' on {}", name, value, product.id);
            None
        }
    }
}

pub fn create_subscription(pool: &Pool) -> SubscriptionModel {
    let product = &pool.product;

    let service = ServiceModel {
        level: product.attribute(attributes::SUPPORT_LEVEL).map(str::to_string),
        service_type: product.attribute(attributes::SUPPORT_TYPE).map(str::to_string),
    };
    let service = if service.level.is_none() && service.service_type.is_none() {
        None
    } else {
        Some(service)
    };

    SubscriptionModel {
        sku: product.id.clone(),
        name: product.name.clone(),
        warning: int_attribute(product, attributes::WARNING_PERIOD).filter(|w| *w != 0),
        sockets: int_attribute(product, attributes::SOCKETS),
        ram: int_attribute(product, attributes::RAM),
        cores: int_attribute(product, attributes::CORES),
        management: attribute_flag(product.attribute(attributes::MANAGEMENT_ENABLED)).then_some(true),
        stacking_id: product.attribute(attributes::STACKING_ID).map(str::to_string),
        virt_only: pool.attribute_flag(attributes::VIRT_ONLY).then_some(true),
        service,
        usage: product.attribute(attributes::USAGE).map(str::to_string),
        roles: product.attribute(attributes::ROLES).map(split_list),
        addons: product.attribute(attributes::ADDONS).map(split_list),
    }
}

pub fn create_order(pool: &Pool) -> OrderModel {
    let non_blank = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
    OrderModel {
        number: non_blank(&pool.order_number),
        quantity: pool.quantity,
        start: pool.start_date.to_rfc3339_opts(SecondsFormat::Secs, true),
        end: pool.end_date.to_rfc3339_opts(SecondsFormat::Secs, true),
        contract: non_blank(&pool.contract_number),
        account: non_blank(&pool.account_number),
    }
}

/// Full body for an entitlement certificate.
pub fn create_entitlement_body(
    consumer_uuid: &str,
    pool: &Pool,
    quantity: i64,
    products: Vec<ProductModel>,
) -> EntitlementBody {
    EntitlementBody {
        consumer: consumer_uuid.to_string(),
        quantity: Some(quantity),
        subscription: Some(create_subscription(pool)),
        order: Some(create_order(pool)),
        pool: Some(PoolModel {
            id: pool.id.clone(),
        }),
        products,
    }
}
