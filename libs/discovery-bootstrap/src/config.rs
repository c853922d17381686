use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub use discovery_client::{DiscoveryConfig, RegistrationConfig};

/// Environment prefix for overrides, e.g. `DISCOVERY__DISCOVERY__ROOT_PATH=/services`.
pub const ENV_PREFIX: &str = "DISCOVERY__";

/// Host configuration for a process that advertises and/or discovers services.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Logging configuration (optional, uses defaults if None).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    /// Present only on processes that advertise themselves.
    #[serde(default)]
    pub registration: Option<RegistrationConfig>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/discovery.log", empty disables the file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/discovery.log".to_string(),
            file_level: "debug".to_string(),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: Some(default_logging_config()),
            registration: None,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Optional sections stay None unless YAML/ENV provide them.
        let base = AppConfig {
            logging: None,
            registration: None,
            discovery: DiscoveryConfig::default(),
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: AppConfig = figment.extract().with_context(|| {
            format!(
                "Failed to load config from {}",
                config_path.as_ref().display()
            )
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file or fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Ok(Self::default()),
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Reject settings that would only fail later, at advertise time.
    pub fn validate(&self) -> Result<()> {
        if let Some(reg) = &self.registration {
            discovery_client::parse_service_spec(&reg.services)
                .with_context(|| format!("registration.services '{}'", reg.services))?;
            if reg.name.trim().is_empty() {
                anyhow::bail!("registration.name must not be empty");
            }
        }
        if self.discovery.root_path.trim().is_empty() {
            anyhow::bail!("discovery.root_path must not be empty");
        }
        Ok(())
    }
}
