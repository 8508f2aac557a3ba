//! Red Hat entitlement OID namespace.
//!
//! Every custom extension lives below `1.3.6.1.4.1.2312.9`. Products and content
//! embed their numeric ids directly into the OID, so the tree is built at runtime.

use crate::error::{EntitlementError, Result};
use std::fmt;
use std::str::FromStr;

pub const REDHAT_ARCS: &[u64] = &[1, 3, 6, 1, 4, 1, 2312, 9];

pub const PRODUCT_NAMESPACE: u64 = 1;
pub const CONTENT_NAMESPACE: u64 = 2;
pub const ORDER_NAMESPACE: u64 = 4;
pub const SYSTEM_NAMESPACE: u64 = 5;
pub const ENTITLEMENT_VERSION: u64 = 6;
pub const ENTITLEMENT_DATA: u64 = 7;
pub const ENTITLEMENT_TYPE: u64 = 8;
pub const ENTITLEMENT_NAMESPACE: u64 = 10;

/// Netscape certificate type (2.16.840.1.113730.1.1)
pub const NETSCAPE_CERT_TYPE_ARCS: &[u64] = &[2, 16, 840, 1, 113730, 1, 1];

/// Product attribute arcs under `1.<product id>`
pub mod product {
    pub const NAME: u64 = 1;
    pub const VARIANT: u64 = 2;
    pub const ARCH: u64 = 3;
    pub const VERSION: u64 = 4;
    pub const BRAND_TYPE: u64 = 5;
    pub const BRAND_NAME: u64 = 7;
}

/// Content attribute arcs under `2.<content id>.<type>`
pub mod content {
    pub const NAME: u64 = 1;
    pub const LABEL: u64 = 2;
    pub const VENDOR: u64 = 5;
    pub const DOWNLOAD_URL: u64 = 6;
    pub const GPG_URL: u64 = 7;
    pub const ENABLED: u64 = 8;
    pub const METADATA_EXPIRE: u64 = 9;
    pub const REQUIRED_TAGS: u64 = 10;
    pub const ARCHES: u64 = 11;
}

/// Order arcs under `4.1`
pub mod order {
    pub const NAME: u64 = 1;
    pub const NUMBER: u64 = 2;
    pub const SKU: u64 = 3;
    pub const SUBSCRIPTION: u64 = 4;
    pub const QUANTITY: u64 = 5;
    pub const START_DATE: u64 = 6;
    pub const END_DATE: u64 = 7;
    pub const VIRT_LIMIT: u64 = 8;
    pub const SOCKET_LIMIT: u64 = 9;
    pub const CONTRACT_NUMBER: u64 = 10;
    pub const QUANTITY_USED: u64 = 11;
    pub const WARNING_PERIOD: u64 = 12;
    pub const ACCOUNT_NUMBER: u64 = 13;
    pub const PROVIDES_MANAGEMENT: u64 = 14;
    pub const SUPPORT_LEVEL: u64 = 15;
    pub const SUPPORT_TYPE: u64 = 16;
    pub const STACKING_ID: u64 = 17;
    pub const VIRT_ONLY: u64 = 18;
}

/// Numeric content type arc, only these types can be expressed in legacy certificates
pub fn content_type_arc(content_type: &str) -> Option<u64> {
    match content_type {
        "yum" => Some(1),
        "file" => Some(2),
        "kickstart" => Some(3),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(Vec<u64>);

impl Oid {
    pub fn new(arcs: &[u64]) -> Self {
        Self(arcs.to_vec())
    }

    /// An OID below the Red Hat base.
    pub fn redhat(suffix: &[u64]) -> Self {
        let mut arcs = REDHAT_ARCS.to_vec();
        arcs.extend_from_slice(suffix);
        Self(arcs)
    }

    pub fn child(&self, arc: u64) -> Self {
        let mut arcs = self.0.clone();
        arcs.push(arc);
        Self(arcs)
    }

    pub fn arcs(&self) -> &[u64] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn product(product_id: u64, field: u64) -> Self {
        Self::redhat(&[PRODUCT_NAMESPACE, product_id, field])
    }

    pub fn content(content_id: u64, type_arc: u64) -> Self {
        Self::redhat(&[CONTENT_NAMESPACE, content_id, type_arc])
    }

    pub fn order(field: u64) -> Self {
        Self::redhat(&[ORDER_NAMESPACE, 1, field])
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl FromStr for Oid {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self> {
        let arcs = s
            .split('.')
            .map(|arc| {
                arc.parse::<u64>()
                    .map_err(|_| EntitlementError::Validation(format!("invalid OID: {}", s)))
            })
            .collect::<Result<Vec<u64>>>()?;
        if arcs.len() < 2 {
            return Err(EntitlementError::Validation(format!("invalid OID: {}", s)));
        }
        Ok(Self(arcs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redhat_oid_formatting() {
        assert_eq!(Oid::redhat(&[ENTITLEMENT_VERSION]).to_string(), "1.3.6.1.4.1.2312.9.6");
        assert_eq!(
            Oid::product(37060, product::NAME).to_string(),
            "1.3.6.1.4.1.2312.9.1.37060.1"
        );
        assert_eq!(
            Oid::content(1111, 1).child(content::DOWNLOAD_URL).to_string(),
            "1.3.6.1.4.1.2312.9.2.1111.1.6"
        );
        assert_eq!(Oid::order(order::SKU).to_string(), "1.3.6.1.4.1.2312.9.4.1.3");
    }

    #[test]
    fn test_parse_round_trip_and_prefix() {
        let oid: Oid = "1.3.6.1.4.1.2312.9.2.55.1.6".parse().unwrap();
        assert!(oid.starts_with(&Oid::redhat(&[CONTENT_NAMESPACE])));
        assert!(!oid.starts_with(&Oid::redhat(&[PRODUCT_NAMESPACE])));
        assert!("1.x.3".parse::<Oid>().is_err());
        assert!("7".parse::<Oid>().is_err());
    }

    #[test]
    fn test_content_type_arcs() {
        assert_eq!(content_type_arc("yum"), Some(1));
        assert_eq!(content_type_arc("file"), Some(2));
        assert_eq!(content_type_arc("kickstart"), Some(3));
        assert_eq!(content_type_arc("containerimage"), None);
    }
}
