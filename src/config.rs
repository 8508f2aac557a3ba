use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub certificates: CertificateConfig,
    pub content: ContentConfig,
    pub cache: CacheConfig,
    pub ca: CaConfig,
}

/// Issuance settings shared by every certificate role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// A certificate whose serial expires within this many days is stale
    pub renewal_threshold_days: u32,
    /// Maximum number of content sets a legacy (v1) certificate may carry
    pub v1_content_limit: usize,
    /// Value of the entitlement version extension on compact certificates
    pub entitlement_version: String,
    /// Algorithm used for freshly generated subject key pairs
    pub key_algorithm: KeyAlgorithm,
    pub identity_validity_days: u32,
    pub product_validity_days: u32,
    pub ueber_validity_years: u32,
    pub sca_validity_days: u32,
    pub anonymous_validity_days: u32,
    /// Start of validity is pulled back by this much to absorb clock skew
    pub backdate_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Hide content that is not promoted to any of the consumer's environments
    pub environment_filtering: bool,
    /// Standalone deployments cannot serve anonymous consumers
    pub hosted: bool,
    /// Owner content prefix used when the owner does not carry one; `$env` is
    /// replaced by the winning environment name
    pub default_content_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version component of the content-access payload key
    pub payload_key_version: u32,
    pub anonymous_max_entries: usize,
    pub anonymous_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    pub common_name: String,
    pub organization: String,
    pub validity_years: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            renewal_threshold_days: 30,
            v1_content_limit: 185,
            entitlement_version: "3.4".to_string(),
            key_algorithm: KeyAlgorithm::EcdsaP256,
            identity_validity_days: 365,
            product_validity_days: 3650,
            ueber_validity_years: 1,
            sca_validity_days: 365,
            anonymous_validity_days: 2,
            backdate_minutes: 60,
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            environment_filtering: true,
            hosted: true,
            default_content_prefix: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            payload_key_version: 1,
            anonymous_max_entries: 1000,
            anonymous_ttl_seconds: 3600, // 1 hour
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: "Entitlement Signing CA".to_string(),
            organization: "Entitlement PKI".to_string(),
            validity_years: 10,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::EntitlementError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional TOML file with `ENTITLEMENT__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("ENTITLEMENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.certificates.validate()?;
        self.cache.validate()?;
        self.ca.validate()?;
        Ok(())
    }
}

impl CertificateConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.v1_content_limit == 0 {
            return Err(crate::error::EntitlementError::InvalidConfig(
                "certificates.v1_content_limit must be greater than 0".to_string(),
            ));
        }

        if self.entitlement_version.trim().is_empty() {
            return Err(crate::error::EntitlementError::InvalidConfig(
                "certificates.entitlement_version cannot be empty".to_string(),
            ));
        }

        let validity = [
            ("identity_validity_days", self.identity_validity_days),
            ("product_validity_days", self.product_validity_days),
            ("ueber_validity_years", self.ueber_validity_years),
            ("sca_validity_days", self.sca_validity_days),
            ("anonymous_validity_days", self.anonymous_validity_days),
        ];
        for (name, value) in validity {
            if value == 0 {
                return Err(crate::error::EntitlementError::InvalidConfig(format!(
                    "certificates.{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.anonymous_max_entries == 0 {
            return Err(crate::error::EntitlementError::InvalidConfig(
                "cache.anonymous_max_entries must be greater than 0".to_string(),
            ));
        }

        if self.anonymous_ttl_seconds == 0 {
            return Err(crate::error::EntitlementError::InvalidConfig(
                "cache.anonymous_ttl_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl CaConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.common_name.trim().is_empty() {
            return Err(crate::error::EntitlementError::InvalidConfig(
                "ca.common_name cannot be empty".to_string(),
            ));
        }

        if self.validity_years == 0 {
            return Err(crate::error::EntitlementError::InvalidConfig(
                "ca.validity_years must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
