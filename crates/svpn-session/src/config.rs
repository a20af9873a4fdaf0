//! Session Configuration
//!
//! Loaded from TOML or JSON, picked by file extension. Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! product = "SecureVPN"
//! dns = ["1.1.1.1", "1.0.0.1"]
//! address_pool = "10.8.0.0/24"
//! backend = "simulated"
//! profile_source = "local"
//!
//! [issuance]
//! url = "https://issuance.example/vpn-config"
//!
//! [[endpoints]]
//! country_label = "Germany"
//! network_address = "192.0.2.30:51820"
//! server_public_key = "ServerPublicKey3GHI=="
//! ```

use crate::backend::BackendKind;
use crate::endpoint::{Endpoint, EndpointCatalog};
use crate::profile::{AddressPool, DEFAULT_ALLOWED_IPS, DEFAULT_KEEPALIVE, ProfileBuilder};
use crate::provisioner::HttpProvisionerConfig;
use crate::ticker::TICK_PERIOD;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Slowest status tick accepted
const MAX_TICK_PERIOD_MS: u64 = 60 * 60 * 1000;

/// Where tunnel profiles are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileSource {
    /// Rendered locally by [`ProfileBuilder`]
    #[default]
    Local,
    /// Rendered by the issuance service
    Remote,
}

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

/// Issuance service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceConfig {
    /// Service URL (http or https)
    pub url: String,
    #[serde(default = "default_issuance_timeout")]
    pub timeout_secs: u64,
}

fn default_issuance_timeout() -> u64 {
    15
}

impl IssuanceConfig {
    pub fn http_config(&self) -> HttpProvisionerConfig {
        let mut config = HttpProvisionerConfig::new(self.url.clone());
        config.timeout = Duration::from_secs(self.timeout_secs);
        config
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Product name, used in export file names
    pub product: String,
    /// DNS servers pushed into the tunnel
    pub dns: Vec<IpAddr>,
    /// Private range client addresses are drawn from
    pub address_pool: String,
    /// Routes sent through the tunnel
    pub allowed_ips: Vec<String>,
    /// Persistent keepalive, 0 disables
    pub keepalive_secs: u16,
    /// Status ticker period
    pub tick_period_ms: u64,
    /// Deadline for a whole connect (provisioning + establish)
    pub connect_timeout_secs: u64,
    pub backend: BackendKind,
    pub profile_source: ProfileSource,
    /// Interface / profile file name for the desktop backend
    pub interface: String,
    /// Issuance service; simulated keys are used when absent
    pub issuance: Option<IssuanceConfig>,
    pub endpoints: EndpointCatalog,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            product: "SecureVPN".to_string(),
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
            ],
            address_pool: AddressPool::default().to_string(),
            allowed_ips: DEFAULT_ALLOWED_IPS.iter().map(|s| s.to_string()).collect(),
            keepalive_secs: DEFAULT_KEEPALIVE,
            tick_period_ms: TICK_PERIOD.as_millis() as u64,
            connect_timeout_secs: 30,
            backend: BackendKind::Auto,
            profile_source: ProfileSource::Local,
            interface: "svpn0".to_string(),
            issuance: None,
            endpoints: EndpointCatalog::builtin(),
        }
    }
}

impl SessionConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content, format)
    }

    /// Load from a string
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = match format {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tick_period_ms must be positive".into()));
        }
        if self.tick_period_ms > MAX_TICK_PERIOD_MS {
            return Err(ConfigError::Invalid(format!(
                "tick_period_ms must be at most {}",
                MAX_TICK_PERIOD_MS
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout_secs must be positive".into()));
        }
        if self.product.trim().is_empty() {
            return Err(ConfigError::Invalid("product must not be empty".into()));
        }

        self.pool()?;

        if let Some(addr) = self.endpoints.duplicate_address() {
            return Err(ConfigError::Invalid(format!("duplicate endpoint address {}", addr)));
        }

        if let Some(issuance) = &self.issuance {
            let url = Url::parse(&issuance.url).map_err(|e| {
                ConfigError::Invalid(format!("issuance url {:?}: {}", issuance.url, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "issuance url {:?} is not an http(s) URL with a host",
                    issuance.url
                )));
            }
            if issuance.timeout_secs == 0 {
                return Err(ConfigError::Invalid("issuance timeout_secs must be positive".into()));
            }
        } else if self.profile_source == ProfileSource::Remote {
            return Err(ConfigError::Invalid(
                "profile_source = \"remote\" requires [issuance]".into(),
            ));
        }

        Ok(())
    }

    /// Parsed client address pool
    pub fn pool(&self) -> Result<AddressPool, ConfigError> {
        self.address_pool
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("address_pool: {}", e)))
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Profile builder with this configuration's routing parameters
    pub fn profile_builder(&self) -> ProfileBuilder {
        let keepalive = (self.keepalive_secs > 0).then_some(self.keepalive_secs);
        ProfileBuilder::new(self.allowed_ips.clone(), keepalive)
    }

    /// Find an endpoint by label
    pub fn endpoint(&self, label: &str) -> Option<&Endpoint> {
        self.endpoints.find(label)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
