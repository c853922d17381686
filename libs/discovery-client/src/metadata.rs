//! Descriptor of one advertised service instance

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable description of a registered instance.
///
/// `id` is an opaque per-registration token. Duplicate detection uses
/// `(flavor, address, port)` within a directory, never the id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetaData {
    id: Uuid,
    address: String,
    port: u16,
    flavor: String,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

impl ServiceMetaData {
    /// New descriptor with a fresh random id.
    pub fn new(address: impl Into<String>, port: u16, flavor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            port,
            flavor: flavor.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn flavor(&self) -> &str {
        &self.flavor
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// True when both descriptors claim the same network identity.
    pub fn same_identity(&self, other: &ServiceMetaData) -> bool {
        self.flavor == other.flavor && self.address == other.address && self.port == other.port
    }
}
