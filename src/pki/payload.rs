//! Entitlement data payload: the compressed JSON body appended after the
//! certificate PEM, followed by a signature block over the uncompressed JSON.

use crate::error::{EntitlementError, Result};
use crate::pki::signer::{CaSigner, SignatureScheme};
use base64::{engine::general_purpose, Engine};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

pub const PAYLOAD_BEGIN: &str = "-----BEGIN ENTITLEMENT DATA-----";
pub const PAYLOAD_END: &str = "-----END ENTITLEMENT DATA-----";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementBody {
    pub consumer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolModel>,
    #[serde(default)]
    pub products: Vec<ProductModel>,
}

impl EntitlementBody {
    /// Body with only consumer and products, as used by content access certificates.
    pub fn content_only(consumer: impl Into<String>, products: Vec<ProductModel>) -> Self {
        Self {
            consumer: consumer.into(),
            quantity: None,
            subscription: None,
            order: None,
            pool: None,
            products,
        }
    }

    /// Every content path across all products, in product order.
    pub fn content_paths(&self) -> Vec<String> {
        self.products
            .iter()
            .flat_map(|p| p.content.iter().map(|c| c.path.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionModel {
    pub sku: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virt_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    pub quantity: i64,
    /// ISO-8601 UTC
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolModel {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductModel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub content: Vec<ContentModel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentModel {
    pub id: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub name: String,
    pub label: String,
    pub vendor: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpg_url: Option<String>,
    /// Only present, as `false`, for disabled content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_expire: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arches: Vec<String>,
}

impl ContentModel {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = if enabled { None } else { Some(false) };
    }
}

/// `JSON -> zlib -> base64`, base64 on a single line.
pub fn compress_body(json: &[u8]) -> Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json)?;
    let compressed = encoder.finish()?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decompress_body(encoded: &str) -> Result<Vec<u8>> {
    let compressed = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| EntitlementError::MalformedPayload(format!("invalid base64: {}", e)))?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| EntitlementError::MalformedPayload(format!("invalid deflate stream: {}", e)))?;
    Ok(json)
}

fn signature_markers(scheme: SignatureScheme) -> (String, String) {
    (
        format!("-----BEGIN {} SIGNATURE-----", scheme.label()),
        format!("-----END {} SIGNATURE-----", scheme.label()),
    )
}

/// Serialize, compress, sign and frame `body`. The result is appended verbatim
/// after the certificate PEM.
pub fn encode_payload(body: &EntitlementBody, signer: &dyn CaSigner) -> Result<String> {
    let json = serde_json::to_vec(body)?;
    encode_json_payload(&json, signer)
}

pub fn encode_json_payload(json: &[u8], signer: &dyn CaSigner) -> Result<String> {
    let encoded = compress_body(json)?;
    let signature = general_purpose::STANDARD.encode(signer.sign(json)?);
    let (sig_begin, sig_end) = signature_markers(signer.scheme());

    debug!(
        "Framed entitlement payload: {} JSON bytes, {} encoded bytes, {} signature",
        json.len(),
        encoded.len(),
        signer.scheme()
    );

    Ok(format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n",
        PAYLOAD_BEGIN, encoded, PAYLOAD_END, sig_begin, signature, sig_end
    ))
}

/// A certificate artifact split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBlock {
    pub certificate_pem: String,
    /// Uncompressed JSON body
    pub json: Vec<u8>,
    pub scheme: SignatureScheme,
    pub signature: Vec<u8>,
}

impl PayloadBlock {
    /// Split a served artifact. An artifact without entitlement data yields `None`.
    pub fn parse(artifact: &str) -> Result<Option<Self>> {
        let Some(begin) = artifact.find(PAYLOAD_BEGIN) else {
            return Ok(None);
        };
        let certificate_pem = artifact[..begin].to_string();
        let rest = &artifact[begin + PAYLOAD_BEGIN.len()..];

        let end = rest
            .find(PAYLOAD_END)
            .ok_or_else(|| EntitlementError::MalformedPayload("missing end of entitlement data".to_string()))?;
        let json = decompress_body(&rest[..end])?;
        let rest = &rest[end + PAYLOAD_END.len()..];

        let rest = rest.trim_start();
        let header = rest
            .strip_prefix("-----BEGIN ")
            .ok_or_else(|| EntitlementError::MalformedPayload("missing signature block".to_string()))?;
        let label_end = header
            .find(" SIGNATURE-----")
            .ok_or_else(|| EntitlementError::MalformedPayload("malformed signature header".to_string()))?;
        let label = &header[..label_end];
        let scheme = SignatureScheme::from_label(label).ok_or_else(|| {
            EntitlementError::MalformedPayload(format!("unknown signature algorithm: {}", label))
        })?;

        let (_, sig_end) = signature_markers(scheme);
        let body = &header[label_end + " SIGNATURE-----".len()..];
        let body_end = body
            .find(&sig_end)
            .ok_or_else(|| EntitlementError::MalformedPayload("missing end of signature".to_string()))?;
        let signature = general_purpose::STANDARD
            .decode(body[..body_end].trim())
            .map_err(|e| EntitlementError::MalformedPayload(format!("invalid signature base64: {}", e)))?;

        Ok(Some(Self {
            certificate_pem,
            json,
            scheme,
            signature,
        }))
    }

    pub fn body(&self) -> Result<EntitlementBody> {
        Ok(serde_json::from_slice(&self.json)?)
    }

    /// Check the label and the signature against `signer`.
    pub fn verify(&self, signer: &dyn CaSigner) -> Result<()> {
        if self.scheme != signer.scheme() {
            return Err(EntitlementError::SignatureVerification(format!(
                "payload is labelled {} but the signer uses {}",
                self.scheme,
                signer.scheme()
            )));
        }
        signer.verify(&self.json, &self.signature)
    }
}
