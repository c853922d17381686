//! Coordination tree contract - the hierarchical key-value store the overlay is built on

use async_trait::async_trait;
use thiserror::Error;

use crate::acl::AclEntry;

/// Errors reported by a coordination tree implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("node does not exist: {0}")]
    NoNode(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),
    #[error("malformed path: {0}")]
    InvalidPath(String),
    #[error("connection to the coordination service lost")]
    ConnectionLoss,
    #[error("session expired")]
    SessionExpired,
}

/// Lifetime of a created node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// Lives until explicitly deleted.
    Persistent,
    /// Removed by the service when the creating session ends.
    Ephemeral,
}

/// Operations the overlay consumes from the coordination service.
///
/// Paths are absolute, `/`-delimited and never end with `/` (except the root).
/// ACLs are attached at creation time only.
#[async_trait]
pub trait CoordinationTree: Send + Sync {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        acl: &[AclEntry],
    ) -> Result<(), TreeError>;

    async fn exists(&self, path: &str) -> Result<bool, TreeError>;

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, TreeError>;

    /// Names (not full paths) of the immediate children, sorted.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, TreeError>;

    async fn delete(&self, path: &str) -> Result<(), TreeError>;

    async fn get_acl(&self, path: &str) -> Result<Vec<AclEntry>, TreeError>;
}

/// Check that `path` is absolute with no empty segments.
pub fn validate_path(path: &str) -> Result<(), TreeError> {
    if path == "/" {
        return Ok(());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(TreeError::InvalidPath(path.to_string()));
    };
    if rest.split('/').any(str::is_empty) {
        return Err(TreeError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Parent of an absolute path, `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Create every missing node along `path` as an empty persistent node carrying `acl`.
///
/// Nodes that already exist keep their ACL.
pub async fn ensure_path(
    tree: &dyn CoordinationTree,
    path: &str,
    acl: &[AclEntry],
) -> Result<(), TreeError> {
    validate_path(path)?;
    if path == "/" {
        return Ok(());
    }

    let mut current = String::with_capacity(path.len());
    for segment in path.trim_start_matches('/').split('/') {
        current.push('/');
        current.push_str(segment);

        if tree.exists(&current).await? {
            continue;
        }
        match tree
            .create(&current, Vec::new(), CreateMode::Persistent, acl)
            .await
        {
            Ok(()) => tracing::debug!(path = %current, "created namespace node"),
            // lost a race with another creator
            Err(TreeError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
