//! Error taxonomy for registration and discovery

use thiserror::Error;

use crate::tree::TreeError;

pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The service specification string could not be parsed.
    #[error("Invalid service specification: {0}")]
    MalformedSpec(String),

    /// A path segment or composed path breaks the namespace grammar.
    #[error("Invalid namespace path: {0}")]
    InvalidPath(String),

    /// Another live registration already owns this identity.
    #[error("Duplicate service being registered: {flavor} at {address}:{port} under '{directory}'")]
    DuplicateRegistration {
        directory: String,
        flavor: String,
        address: String,
        port: u16,
    },

    /// Lifecycle precondition violated by the caller.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// A path queried directly does not exist.
    #[error("Path not found: {0}")]
    NotFound(String),

    /// Transport or session failure reported by the coordination tree.
    #[error("Coordination service error: {0}")]
    Coordination(#[source] TreeError),

    /// No address was supplied and the local interface address is unknown.
    #[error("Unable to resolve a local address: {0}")]
    AddressResolution(String),

    #[error("Failed to encode service instance: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<TreeError> for DiscoveryError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NoNode(path) => DiscoveryError::NotFound(path),
            other => DiscoveryError::Coordination(other),
        }
    }
}

impl DiscoveryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscoveryError::NotFound(_))
    }
}
