//! # Discovery Client - service registration and discovery
//!
//! Workers advertise their network services under a hierarchical coordination tree;
//! consumers walk the same tree to find them.
//!
//! ## Namespace layout
//!
//! ```text
//! root[/stack]/flavor/name/address:port
//! ```
//!
//! - `root[/stack]` is a *directory* that groups deployments.
//! - `flavor` is a per-protocol *registry* (`http`, `guide`, ...).
//! - `name` is the worker name, and the leaf `address:port` holds a JSON descriptor.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use discovery_client::{DiscoveryClient, MemoryTree, RegistrationClient};
//!
//! let tree = Arc::new(MemoryTree::new());
//! let mut worker = RegistrationClient::new(tree.clone(), "/services", "vanilla", "http:80")?
//!     .with_stack("prod")?;
//! worker.advertise_availability().await?;
//!
//! let discovery = DiscoveryClient::new(tree, "/services").with_flavors(["http"]);
//! let found = discovery.find_all().await?;
//! ```

pub mod acl;
pub mod config;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod path;
pub mod registration;
pub mod registry;
pub mod tree;

pub use acl::{AclEntry, AclId, AclPolicy, AuthInfo, Perms};
pub use config::{DiscoveryConfig, RegistrationConfig};
pub use discovery::{DiscoveryClient, InstanceMap, WalkEntry};
pub use error::{DiscoveryError, Result};
pub use memory::MemoryTree;
pub use metadata::ServiceMetaData;
pub use path::parse_service_spec;
pub use registration::{RegistrationClient, RegistrationState};
pub use registry::{
    DirectoryFactory, ServiceDirectory, ServiceInstance, ServiceType, TreeDirectoryFactory,
    TreeServiceDirectory,
};
pub use tree::{CoordinationTree, CreateMode, TreeError};
