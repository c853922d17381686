//! Per-directory service registry
//!
//! One registry manages a single flavor directory: `base/name/address:port`, where each
//! leaf holds a JSON-encoded [`ServiceInstance`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::acl::AclPolicy;
use crate::error::{DiscoveryError, Result};
use crate::metadata::ServiceMetaData;
use crate::path::{self, join_path};
use crate::tree::{ensure_path, CoordinationTree, CreateMode, TreeError};

/// How long a registration outlives its session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    /// Removed with the registering session.
    #[default]
    Dynamic,
    Static,
    Permanent,
}

impl ServiceType {
    fn create_mode(self) -> CreateMode {
        match self {
            ServiceType::Dynamic => CreateMode::Ephemeral,
            ServiceType::Static | ServiceType::Permanent => CreateMode::Persistent,
        }
    }
}

/// Envelope stored in a registry leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub name: String,
    pub id: String,
    pub address: String,
    pub port: u16,
    pub registration_time_utc: i64,
    #[serde(default)]
    pub service_type: ServiceType,
    pub payload: ServiceMetaData,
}

impl ServiceInstance {
    /// Wrap a descriptor under worker `name`; the id is `address:port`.
    pub fn new(name: impl Into<String>, payload: ServiceMetaData) -> Self {
        Self {
            name: name.into(),
            id: path::instance_id(payload.address(), payload.port()),
            address: payload.address().to_string(),
            port: payload.port(),
            registration_time_utc: Utc::now().timestamp_millis(),
            service_type: ServiceType::Dynamic,
            payload,
        }
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }
}

/// Value codec for registry leaves.
pub fn encode_instance(instance: &ServiceInstance) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(instance)?)
}

pub fn decode_instance(data: &[u8]) -> Option<ServiceInstance> {
    if data.is_empty() {
        return None;
    }
    serde_json::from_slice(data).ok()
}

/// A node is an instance leaf iff its value decodes as a descriptor.
pub fn is_leaf_instance_node(data: &[u8]) -> bool {
    decode_instance(data).is_some()
}

/// Name to instance lookups within one flavor directory.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    fn base_path(&self) -> &str;

    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    async fn unregister(&self, instance: &ServiceInstance) -> Result<()>;

    /// Worker names present; empty when the directory does not exist.
    async fn query_for_names(&self) -> Result<Vec<String>>;

    /// Live instances under `name`; empty when the name does not exist.
    async fn query_for_instances(&self, name: &str) -> Result<Vec<ServiceInstance>>;
}

/// Opens registries by base path.
pub trait DirectoryFactory: Send + Sync {
    fn open(&self, base_path: &str) -> Arc<dyn ServiceDirectory>;
}

/// Registry backed directly by the coordination tree.
pub struct TreeServiceDirectory {
    tree: Arc<dyn CoordinationTree>,
    base_path: String,
}

impl TreeServiceDirectory {
    pub fn new(tree: Arc<dyn CoordinationTree>, base_path: impl AsRef<str>) -> Self {
        Self {
            tree,
            base_path: join_path([base_path.as_ref()]),
        }
    }

    fn name_path(&self, name: &str) -> String {
        join_path([self.base_path.as_str(), name])
    }

    fn leaf_path(&self, instance: &ServiceInstance) -> String {
        join_path([self.base_path.as_str(), &instance.name, &instance.id])
    }
}

#[async_trait]
impl ServiceDirectory for TreeServiceDirectory {
    fn base_path(&self) -> &str {
        &self.base_path
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        path::validate_segment("name", &instance.name)?;
        path::validate_segment("id", &instance.id)?;

        // intermediate name nodes are shared by every worker and stay open
        let open = AclPolicy::Open.resolve();
        ensure_path(self.tree.as_ref(), &self.name_path(&instance.name), &open)
            .await
            .map_err(DiscoveryError::Coordination)?;

        let leaf = self.leaf_path(instance);
        let data = encode_instance(instance)?;
        match self
            .tree
            .create(&leaf, data, instance.service_type.create_mode(), &open)
            .await
        {
            Ok(()) => {
                tracing::debug!(path = %leaf, "registered service instance");
                Ok(())
            }
            Err(TreeError::NodeExists(_)) => Err(DiscoveryError::DuplicateRegistration {
                directory: path::directory_of_registry(&self.base_path).to_string(),
                flavor: path::last_segment(&self.base_path).to_string(),
                address: instance.address.clone(),
                port: instance.port,
            }),
            Err(e) => Err(DiscoveryError::Coordination(e)),
        }
    }

    async fn unregister(&self, instance: &ServiceInstance) -> Result<()> {
        let leaf = self.leaf_path(instance);
        match self.tree.delete(&leaf).await {
            Ok(()) | Err(TreeError::NoNode(_)) => {}
            Err(e) => return Err(DiscoveryError::Coordination(e)),
        }
        tracing::debug!(path = %leaf, "unregistered service instance");

        // prune the name node once its last instance is gone
        match self.tree.delete(&self.name_path(&instance.name)).await {
            Ok(()) | Err(TreeError::NoNode(_)) | Err(TreeError::NotEmpty(_)) => Ok(()),
            Err(e) => Err(DiscoveryError::Coordination(e)),
        }
    }

    async fn query_for_names(&self) -> Result<Vec<String>> {
        match self.tree.list_children(&self.base_path).await {
            Ok(names) => Ok(names),
            Err(TreeError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(DiscoveryError::Coordination(e)),
        }
    }

    async fn query_for_instances(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let name_path = self.name_path(name);
        let ids = match self.tree.list_children(&name_path).await {
            Ok(ids) => ids,
            Err(TreeError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(DiscoveryError::Coordination(e)),
        };

        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            let leaf = join_path([name_path.as_str(), id.as_str()]);
            let data = match self.tree.get_data(&leaf).await {
                Ok(data) => data,
                // unregistered between list and read
                Err(TreeError::NoNode(_)) => continue,
                Err(e) => return Err(DiscoveryError::Coordination(e)),
            };
            match decode_instance(&data) {
                Some(instance) => instances.push(instance),
                None => tracing::warn!(path = %leaf, "skipping node that is not a service instance"),
            }
        }
        Ok(instances)
    }
}

/// Builds [`TreeServiceDirectory`] handles over a shared tree.
#[derive(Clone)]
pub struct TreeDirectoryFactory {
    tree: Arc<dyn CoordinationTree>,
}

impl TreeDirectoryFactory {
    pub fn new(tree: Arc<dyn CoordinationTree>) -> Self {
        Self { tree }
    }
}

impl DirectoryFactory for TreeDirectoryFactory {
    fn open(&self, base_path: &str) -> Arc<dyn ServiceDirectory> {
        Arc::new(TreeServiceDirectory::new(Arc::clone(&self.tree), base_path))
    }
}
