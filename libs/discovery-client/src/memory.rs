//! In-process coordination tree
//!
//! Shares one node map between any number of sessions. Ephemeral nodes belong to
//! the session that created them and disappear when it is closed.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::acl::AclEntry;
use crate::tree::{parent_of, validate_path, CoordinationTree, CreateMode, TreeError};

type SessionId = u64;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    acl: Vec<AclEntry>,
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    available: bool,
}

impl TreeState {
    fn check_available(&self) -> Result<(), TreeError> {
        if self.available {
            Ok(())
        } else {
            Err(TreeError::ConnectionLoss)
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = child_prefix(path);
        self.nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(k, _)| k.len() > prefix.len())
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

/// A session on a shared in-memory tree.
///
/// Cloning keeps the same session; [`MemoryTree::connect`] opens a new one.
#[derive(Clone, Debug)]
pub struct MemoryTree {
    state: Arc<RwLock<TreeState>>,
    sessions: Arc<AtomicU64>,
    session: SessionId,
}

impl MemoryTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                acl: vec![AclEntry::open()],
                owner: None,
            },
        );
        Self {
            state: Arc::new(RwLock::new(TreeState {
                nodes,
                available: true,
            })),
            sessions: Arc::new(AtomicU64::new(1)),
            session: 1,
        }
    }

    /// Open another session on the same tree.
    pub fn connect(&self) -> Self {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            state: Arc::clone(&self.state),
            sessions: Arc::clone(&self.sessions),
            session,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// End this session, dropping every ephemeral node it owns.
    pub fn close(&self) {
        let mut state = self.state.write();
        let before = state.nodes.len();
        state.nodes.retain(|_, node| node.owner != Some(self.session));
        tracing::debug!(
            session = self.session,
            removed = before - state.nodes.len(),
            "memory tree session closed"
        );
    }

    /// Simulate losing (or regaining) the connection for every session.
    pub fn set_available(&self, available: bool) {
        self.state.write().available = available;
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationTree for MemoryTree {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        acl: &[AclEntry],
    ) -> Result<(), TreeError> {
        validate_path(path)?;
        let mut state = self.state.write();
        state.check_available()?;

        if state.nodes.contains_key(path) {
            return Err(TreeError::NodeExists(path.to_string()));
        }
        let parent = parent_of(path).ok_or_else(|| TreeError::NodeExists(path.to_string()))?;
        match state.nodes.get(parent) {
            None => return Err(TreeError::NoNode(parent.to_string())),
            Some(p) if p.owner.is_some() => {
                return Err(TreeError::NoChildrenForEphemerals(parent.to_string()))
            }
            Some(_) => {}
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session),
        };
        state.nodes.insert(
            path.to_string(),
            Node {
                data,
                acl: acl.to_vec(),
                owner,
            },
        );
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, TreeError> {
        validate_path(path)?;
        let state = self.state.read();
        state.check_available()?;
        Ok(state.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, TreeError> {
        validate_path(path)?;
        let state = self.state.read();
        state.check_available()?;
        state
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| TreeError::NoNode(path.to_string()))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, TreeError> {
        validate_path(path)?;
        let state = self.state.read();
        state.check_available()?;
        if !state.nodes.contains_key(path) {
            return Err(TreeError::NoNode(path.to_string()));
        }

        let prefix = child_prefix(path);
        let children = state
            .nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    async fn delete(&self, path: &str) -> Result<(), TreeError> {
        validate_path(path)?;
        let mut state = self.state.write();
        state.check_available()?;
        if path == "/" || !state.nodes.contains_key(path) {
            return Err(TreeError::NoNode(path.to_string()));
        }
        if state.has_children(path) {
            return Err(TreeError::NotEmpty(path.to_string()));
        }
        state.nodes.remove(path);
        Ok(())
    }

    async fn get_acl(&self, path: &str) -> Result<Vec<AclEntry>, TreeError> {
        validate_path(path)?;
        let state = self.state.read();
        state.check_available()?;
        state
            .nodes
            .get(path)
            .map(|n| n.acl.clone())
            .ok_or_else(|| TreeError::NoNode(path.to_string()))
    }
}
