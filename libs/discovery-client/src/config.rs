//! Serde configuration for the registration and discovery clients

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::acl::AuthInfo;
use crate::discovery::DiscoveryClient;
use crate::error::Result;
use crate::registration::RegistrationClient;
use crate::tree::CoordinationTree;

fn default_root_path() -> String {
    "/services".to_string()
}

/// Worker-side settings.
///
/// ```yaml
/// root_path: /services
/// stack: prod
/// name: vanilla
/// services: "http:80,guide:10004"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrationConfig {
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default)]
    pub stack: Option<String>,
    pub name: String,
    /// Advertised address. The local interface address when absent.
    #[serde(default)]
    pub address: Option<String>,
    /// Service specification, `flavor:port[,flavor:port...]`.
    pub services: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default)]
    pub flavors: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            flavors: Vec::new(),
        }
    }
}

impl RegistrationClient {
    pub fn from_config(tree: Arc<dyn CoordinationTree>, cfg: &RegistrationConfig) -> Result<Self> {
        let mut client =
            RegistrationClient::new(tree, &cfg.root_path, cfg.name.as_str(), &cfg.services)?
                .with_parameters(cfg.parameters.clone())
                .with_auth(cfg.auth.as_ref());
        if let Some(stack) = cfg.stack.as_deref() {
            client = client.with_stack(stack)?;
        }
        if let Some(address) = &cfg.address {
            client = client.with_address(address.as_str());
        }
        Ok(client)
    }
}

impl DiscoveryClient {
    pub fn from_config(tree: Arc<dyn CoordinationTree>, cfg: &DiscoveryConfig) -> Self {
        DiscoveryClient::new(tree, &cfg.root_path).with_flavors(cfg.flavors.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTree;
    use crate::DiscoveryError;

    #[test]
    fn test_registration_config_from_yaml() {
        let yaml = r#"
stack: prod
name: vanilla
address: 10.0.0.7
services: "http:80,guide:10004"
parameters:
  zone: eu-1
auth:
  scheme: digest
  id: "user:hash"
"#;
        let cfg: RegistrationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.root_path, "/services");
        assert_eq!(cfg.stack.as_deref(), Some("prod"));
        assert_eq!(cfg.parameters["zone"], "eu-1");

        let client = RegistrationClient::from_config(Arc::new(MemoryTree::new()), &cfg).unwrap();
        assert_eq!(client.directory(), "/services/prod");
        assert_eq!(client.name(), "vanilla");
    }

    #[test]
    fn test_registration_config_rejects_unknown_fields() {
        let yaml = "name: a\nservices: \"http:80\"\nport: 80\n";
        assert!(serde_yaml::from_str::<RegistrationConfig>(yaml).is_err());
    }

    #[test]
    fn test_registration_config_bad_services() {
        let cfg = RegistrationConfig {
            root_path: "/services".to_string(),
            stack: None,
            name: "vanilla".to_string(),
            address: None,
            services: "http".to_string(),
            parameters: BTreeMap::new(),
            auth: None,
        };
        let err = RegistrationClient::from_config(Arc::new(MemoryTree::new()), &cfg).unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedSpec(_)));
    }

    #[test]
    fn test_discovery_config_defaults() {
        let cfg: DiscoveryConfig = serde_yaml::from_str("flavors: [http]").unwrap();
        assert_eq!(cfg.root_path, "/services");

        let client = DiscoveryClient::from_config(Arc::new(MemoryTree::new()), &cfg);
        assert_eq!(client.root(), "/services");
        assert!(client.flavors().contains("http"));
        assert_eq!(DiscoveryConfig::default().flavors.len(), 0);
    }
}
