//! X.509 extension sets for entitlement certificates.
//!
//! Legacy (v1) certificates carry one UTF8String extension per product and
//! content attribute and are capped in the number of content sets they can
//! hold. Compact (v3) certificates carry a version, a type, an optional
//! namespace and the content path tree as a single byte extension; everything
//! else lives in the signed payload.

use crate::error::{EntitlementError, Result};
use crate::pki::huffman;
use crate::pki::oid::{self, Oid};
use crate::pki::payload::{ContentModel, EntitlementBody, ProductModel};
use rcgen::CustomExtension;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionValue {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Extension {
    pub oid: Oid,
    pub critical: bool,
    pub value: ExtensionValue,
}

impl X509Extension {
    pub fn text(oid: Oid, value: impl Into<String>) -> Self {
        Self {
            oid,
            critical: false,
            value: ExtensionValue::Text(value.into()),
        }
    }

    pub fn bytes(oid: Oid, value: Vec<u8>) -> Self {
        Self {
            oid,
            critical: false,
            value: ExtensionValue::Bytes(value),
        }
    }

    /// DER encoded extension value: UTF8String for text, OCTET STRING for bytes.
    pub fn der_value(&self) -> Vec<u8> {
        match &self.value {
            ExtensionValue::Text(text) => yasna::construct_der(|w| w.write_utf8_string(text)),
            ExtensionValue::Bytes(bytes) => yasna::construct_der(|w| w.write_bytes(bytes)),
        }
    }

    pub fn to_custom(&self) -> CustomExtension {
        let mut extension = CustomExtension::from_oid_content(self.oid.arcs(), self.der_value());
        extension.set_criticality(self.critical);
        extension
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            ExtensionValue::Text(text) => Some(text),
            ExtensionValue::Bytes(_) => None,
        }
    }
}

impl ExtensionValue {
    /// Read back a value written by [`X509Extension::der_value`].
    pub fn from_der(der: &[u8]) -> Result<Self> {
        if let Ok(text) = yasna::parse_der(der, |reader| reader.read_utf8string()) {
            return Ok(ExtensionValue::Text(text));
        }
        yasna::parse_der(der, |reader| reader.read_bytes())
            .map(ExtensionValue::Bytes)
            .map_err(|e| EntitlementError::MalformedPayload(format!("unreadable extension value: {}", e)))
    }
}

/// Value of the entitlement type extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementType {
    /// Pool entitlements, ueber and anonymous certificates
    Basic,
    /// Simple content access certificates
    OrgLevel,
}

impl fmt::Display for EntitlementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntitlementType::Basic => f.write_str("Basic"),
            EntitlementType::OrgLevel => f.write_str("OrgLevel"),
        }
    }
}

fn numeric_id(id: &str) -> Option<u64> {
    id.parse::<u64>().ok()
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Products that can be addressed by OID: numeric ids only.
fn encodable_products(body: &EntitlementBody) -> impl Iterator<Item = (u64, &ProductModel)> {
    body.products
        .iter()
        .filter_map(|product| numeric_id(&product.id).map(|id| (id, product)))
}

/// Build the legacy extension set. Fails with `CertificateTooLarge` before any
/// content extension is produced when the content count exceeds `limit`.
pub fn legacy_extensions(body: &EntitlementBody, limit: usize) -> Result<Vec<X509Extension>> {
    let content_count: usize = encodable_products(body).map(|(_, p)| p.content.len()).sum();
    if content_count > limit {
        let product = body
            .subscription
            .as_ref()
            .map(|s| s.name.clone())
            .or_else(|| body.products.first().map(|p| p.name.clone()))
            .unwrap_or_default();
        return Err(EntitlementError::CertificateTooLarge {
            product,
            content_count,
            limit,
        });
    }

    let mut extensions = Vec::new();
    for (product_id, product) in encodable_products(body) {
        extensions.extend(product_extensions(product_id, product));
        for content in &product.content {
            extensions.extend(content_extensions(content));
        }
    }
    extensions.extend(order_extensions(body));
    extensions.push(X509Extension::text(
        Oid::redhat(&[oid::SYSTEM_NAMESPACE, 1]),
        body.consumer.as_str(),
    ));

    debug!(
        "Prepared {} legacy extensions carrying {} content sets",
        extensions.len(),
        content_count
    );
    Ok(extensions)
}

/// Extensions of a product certificate: the product's own attributes only.
pub fn product_certificate_extensions(product: &ProductModel) -> Result<Vec<X509Extension>> {
    let product_id = numeric_id(&product.id).ok_or_else(|| {
        EntitlementError::Validation(format!(
            "product id '{}' cannot be encoded in a certificate",
            product.id
        ))
    })?;
    Ok(product_extensions(product_id, product))
}

fn product_extensions(product_id: u64, product: &ProductModel) -> Vec<X509Extension> {
    use oid::product::*;

    let mut extensions = vec![X509Extension::text(
        Oid::product(product_id, NAME),
        product.name.as_str(),
    )];
    if let Some(variant) = &product.variant {
        extensions.push(X509Extension::text(Oid::product(product_id, VARIANT), variant.as_str()));
    }
    if !product.architectures.is_empty() {
        extensions.push(X509Extension::text(
            Oid::product(product_id, ARCH),
            product.architectures.join(","),
        ));
    }
    if let Some(version) = &product.version {
        extensions.push(X509Extension::text(Oid::product(product_id, VERSION), version.as_str()));
    }
    if let Some(brand_type) = &product.brand_type {
        extensions.push(X509Extension::text(
            Oid::product(product_id, BRAND_TYPE),
            brand_type.as_str(),
        ));
    }
    if let Some(brand_name) = &product.brand_name {
        extensions.push(X509Extension::text(
            Oid::product(product_id, BRAND_NAME),
            brand_name.as_str(),
        ));
    }
    extensions
}

fn content_extensions(content: &ContentModel) -> Vec<X509Extension> {
    use oid::content::*;

    let (Some(content_id), Some(type_arc)) = (
        numeric_id(&content.id),
        oid::content_type_arc(&content.content_type),
    ) else {
        debug!(
            "Skipping content {} of type {}: not expressible in a legacy certificate",
            content.id, content.content_type
        );
        return Vec::new();
    };

    let base = Oid::content(content_id, type_arc);
    let mut extensions = vec![
        X509Extension::text(base.clone(), content.content_type.as_str()),
        X509Extension::text(base.child(NAME), content.name.as_str()),
        X509Extension::text(base.child(LABEL), content.label.as_str()),
        X509Extension::text(base.child(VENDOR), content.vendor.as_str()),
        X509Extension::text(base.child(DOWNLOAD_URL), content.path.as_str()),
        X509Extension::text(base.child(ENABLED), flag(content.is_enabled())),
    ];
    if let Some(gpg_url) = &content.gpg_url {
        extensions.push(X509Extension::text(base.child(GPG_URL), gpg_url.as_str()));
    }
    if let Some(expire) = content.metadata_expire {
        extensions.push(X509Extension::text(base.child(METADATA_EXPIRE), expire.to_string()));
    }
    if !content.required_tags.is_empty() {
        extensions.push(X509Extension::text(
            base.child(REQUIRED_TAGS),
            content.required_tags.join(","),
        ));
    }
    if !content.arches.is_empty() {
        extensions.push(X509Extension::text(base.child(ARCHES), content.arches.join(",")));
    }
    extensions
}

fn order_extensions(body: &EntitlementBody) -> Vec<X509Extension> {
    use oid::order::*;

    let mut extensions = Vec::new();
    let mut push = |field: u64, value: Option<String>| {
        if let Some(value) = value {
            extensions.push(X509Extension::text(Oid::order(field), value));
        }
    };

    if let Some(subscription) = &body.subscription {
        push(NAME, Some(subscription.name.clone()));
        push(SKU, Some(subscription.sku.clone()));
        push(SOCKET_LIMIT, subscription.sockets.map(|s| s.to_string()));
        push(WARNING_PERIOD, subscription.warning.map(|w| w.to_string()));
        push(
            PROVIDES_MANAGEMENT,
            Some(flag(subscription.management.unwrap_or(false)).to_string()),
        );
        let service = subscription.service.as_ref();
        push(SUPPORT_LEVEL, service.and_then(|s| s.level.clone()));
        push(SUPPORT_TYPE, service.and_then(|s| s.service_type.clone()));
        push(STACKING_ID, subscription.stacking_id.clone());
        push(
            VIRT_ONLY,
            subscription.virt_only.map(|v| flag(v).to_string()),
        );
    }
    if let Some(order) = &body.order {
        push(NUMBER, order.number.clone());
        push(QUANTITY, Some(order.quantity.to_string()));
        push(START_DATE, Some(order.start.clone()));
        push(END_DATE, Some(order.end.clone()));
        push(CONTRACT_NUMBER, order.contract.clone());
        push(ACCOUNT_NUMBER, order.account.clone());
    }
    if let Some(pool) = &body.pool {
        push(SUBSCRIPTION, Some(pool.id.clone()));
    }
    push(QUANTITY_USED, body.quantity.map(|q| q.to_string()));

    extensions
}

/// Build the compact extension set: version, type, namespace and content tree.
pub fn compact_extensions(
    body: &EntitlementBody,
    entitlement_type: EntitlementType,
    version: &str,
    namespace: Option<&str>,
) -> Result<Vec<X509Extension>> {
    let mut extensions = vec![
        X509Extension::text(Oid::redhat(&[oid::ENTITLEMENT_VERSION]), version),
        X509Extension::text(
            Oid::redhat(&[oid::ENTITLEMENT_TYPE]),
            entitlement_type.to_string(),
        ),
    ];
    if let Some(namespace) = namespace.filter(|ns| !ns.trim().is_empty()) {
        extensions.push(X509Extension::text(
            Oid::redhat(&[oid::ENTITLEMENT_NAMESPACE]),
            namespace,
        ));
    }

    let tree = huffman::encode_paths(&body.content_paths())?;
    extensions.push(X509Extension::bytes(
        Oid::redhat(&[oid::ENTITLEMENT_DATA]),
        tree,
    ));
    Ok(extensions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::payload::{OrderModel, PoolModel, SubscriptionModel};

    fn content(id: u32) -> ContentModel {
        ContentModel {
            id: id.to_string(),
            content_type: "yum".to_string(),
            name: format!("repo-{}", id),
            label: format!("repo-{}-label", id),
            vendor: "Acme".to_string(),
            path: format!("/content/dist/repo-{}", id),
            ..Default::default()
        }
    }

    fn body_with(content_count: u32) -> EntitlementBody {
        EntitlementBody {
            consumer: "consumer-uuid".to_string(),
            quantity: Some(1),
            subscription: Some(SubscriptionModel {
                sku: "MKT-1".to_string(),
                name: "Big Bundle".to_string(),
                ..Default::default()
            }),
            order: Some(OrderModel {
                quantity: 5,
                start: "2026-01-01T00:00:00Z".to_string(),
                end: "2027-01-01T00:00:00Z".to_string(),
                ..Default::default()
            }),
            pool: Some(PoolModel { id: "pool-1".to_string() }),
            products: vec![ProductModel {
                id: "100".to_string(),
                name: "Bundle OS".to_string(),
                content: (0..content_count).map(|i| content(1000 + i)).collect(),
                ..Default::default()
            }],
        }
    }

    fn find<'a>(extensions: &'a [X509Extension], oid: &str) -> Option<&'a X509Extension> {
        extensions.iter().find(|e| e.oid.to_string() == oid)
    }

    #[test]
    fn test_legacy_limit_is_inclusive() {
        assert!(legacy_extensions(&body_with(5), 5).is_ok());

        match legacy_extensions(&body_with(6), 5) {
            Err(EntitlementError::CertificateTooLarge {
                product,
                content_count,
                limit,
            }) => {
                assert_eq!(product, "Big Bundle");
                assert_eq!(content_count, 6);
                assert_eq!(limit, 5);
            }
            other => panic!("expected CertificateTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_extension_values() {
        let mut body = body_with(1);
        body.products[0].content[0].set_enabled(false);
        body.products[0].content[0].arches = vec!["x86_64".to_string(), "aarch64".to_string()];
        let extensions = legacy_extensions(&body, 185).unwrap();

        let base = "1.3.6.1.4.1.2312.9";
        assert_eq!(
            find(&extensions, &format!("{}.1.100.1", base)).and_then(|e| e.as_text()),
            Some("Bundle OS")
        );
        assert_eq!(
            find(&extensions, &format!("{}.2.1000.1.6", base)).and_then(|e| e.as_text()),
            Some("/content/dist/repo-1000")
        );
        assert_eq!(
            find(&extensions, &format!("{}.2.1000.1.8", base)).and_then(|e| e.as_text()),
            Some("0")
        );
        assert_eq!(
            find(&extensions, &format!("{}.2.1000.1.11", base)).and_then(|e| e.as_text()),
            Some("x86_64,aarch64")
        );
        assert_eq!(
            find(&extensions, &format!("{}.4.1.4", base)).and_then(|e| e.as_text()),
            Some("pool-1")
        );
        assert_eq!(
            find(&extensions, &format!("{}.4.1.11", base)).and_then(|e| e.as_text()),
            Some("1")
        );
        assert_eq!(
            find(&extensions, &format!("{}.5.1", base)).and_then(|e| e.as_text()),
            Some("consumer-uuid")
        );
    }

    #[test]
    fn test_legacy_skips_unencodable_products_and_content() {
        let mut body = body_with(2);
        body.products[0].content[1].content_type = "containerimage".to_string();
        body.products.push(ProductModel {
            id: "content_access".to_string(),
            name: "Content Access".to_string(),
            content: vec![content(9)],
            ..Default::default()
        });

        let extensions = legacy_extensions(&body, 185).unwrap();
        assert!(find(&extensions, "1.3.6.1.4.1.2312.9.2.1001.1").is_none());
        assert!(find(&extensions, "1.3.6.1.4.1.2312.9.2.9.1").is_none());
        assert!(find(&extensions, "1.3.6.1.4.1.2312.9.2.1000.1").is_some());
    }

    #[test]
    fn test_compact_extensions() {
        let body = body_with(3);
        let extensions =
            compact_extensions(&body, EntitlementType::Basic, "3.4", Some("tenant-a")).unwrap();

        assert_eq!(
            find(&extensions, "1.3.6.1.4.1.2312.9.6").and_then(|e| e.as_text()),
            Some("3.4")
        );
        assert_eq!(
            find(&extensions, "1.3.6.1.4.1.2312.9.8").and_then(|e| e.as_text()),
            Some("Basic")
        );
        assert_eq!(
            find(&extensions, "1.3.6.1.4.1.2312.9.10").and_then(|e| e.as_text()),
            Some("tenant-a")
        );

        let data = find(&extensions, "1.3.6.1.4.1.2312.9.7").unwrap();
        let ExtensionValue::Bytes(bytes) = &data.value else {
            panic!("entitlement data must be a byte extension");
        };
        let mut expected = body.content_paths();
        expected.sort();
        assert_eq!(huffman::decode_paths(bytes).unwrap(), expected);
    }

    #[test]
    fn test_blank_namespace_is_omitted() {
        let extensions =
            compact_extensions(&body_with(1), EntitlementType::OrgLevel, "3.4", Some("  ")).unwrap();
        assert!(find(&extensions, "1.3.6.1.4.1.2312.9.10").is_none());
        assert_eq!(
            find(&extensions, "1.3.6.1.4.1.2312.9.8").and_then(|e| e.as_text()),
            Some("OrgLevel")
        );
    }

    #[test]
    fn test_der_values() {
        let text = X509Extension::text(Oid::redhat(&[6]), "3.4");
        assert_eq!(text.der_value(), vec![0x0c, 0x03, b'3', b'.', b'4']);
        let bytes = X509Extension::bytes(Oid::redhat(&[7]), vec![1, 2]);
        assert_eq!(bytes.der_value(), vec![0x04, 0x02, 1, 2]);

        assert_eq!(ExtensionValue::from_der(&text.der_value()).unwrap(), text.value);
        assert_eq!(ExtensionValue::from_der(&bytes.der_value()).unwrap(), bytes.value);
        assert!(ExtensionValue::from_der(&[0x02, 0x01, 0x05]).is_err());
    }
}
