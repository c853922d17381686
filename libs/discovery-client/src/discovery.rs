//! Discovery client - walks the namespace to find advertised instances
//!
//! Every call re-reads the tree. Results are assembled from several independent
//! reads, so they are a best-effort snapshot: nodes that vanish mid-walk are
//! skipped, while any other failure aborts the call without touching the caller's map.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};

use crate::error::{DiscoveryError, Result};
use crate::metadata::ServiceMetaData;
use crate::path::{join_path, last_segment, registry_path, split_immediate_children};
use crate::registry::{
    decode_instance, is_leaf_instance_node, DirectoryFactory, ServiceInstance,
    TreeDirectoryFactory,
};
use crate::tree::{CoordinationTree, TreeError};

/// Discovered instances keyed by `directory/flavor/name/address:port`.
pub type InstanceMap = BTreeMap<String, ServiceMetaData>;

/// One item produced by [`DiscoveryClient::walk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalkEntry {
    Directory(String),
    Instance {
        path: String,
        metadata: ServiceMetaData,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum NodeKind {
    Instance(Box<ServiceInstance>),
    Registry,
    Directory,
    Vanished,
}

#[derive(Default)]
struct Level {
    instances: Vec<(String, ServiceMetaData)>,
    directories: Vec<String>,
}

struct WalkState {
    start: Option<String>,
    pending: Vec<String>,
    ready: VecDeque<WalkEntry>,
}

impl WalkState {
    fn push_instances(&mut self, instances: Vec<(String, ServiceMetaData)>) {
        self.ready.extend(
            instances
                .into_iter()
                .map(|(path, metadata)| WalkEntry::Instance { path, metadata }),
        );
    }

    fn push_level(&mut self, level: Level) {
        self.push_instances(level.instances);
        self.pending.extend(level.directories.iter().rev().cloned());
        self.ready
            .extend(level.directories.into_iter().map(WalkEntry::Directory));
    }
}

/// Read-only view over the namespace, optionally restricted to some flavors.
pub struct DiscoveryClient {
    tree: Arc<dyn CoordinationTree>,
    root: String,
    flavors: BTreeSet<String>,
    factory: Arc<dyn DirectoryFactory>,
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("root", &self.root)
            .field("flavors", &self.flavors)
            .finish()
    }
}

impl DiscoveryClient {
    /// Client matching every flavor below `root`.
    pub fn new(tree: Arc<dyn CoordinationTree>, root: &str) -> Self {
        Self {
            factory: Arc::new(TreeDirectoryFactory::new(Arc::clone(&tree))),
            tree,
            root: join_path([root]),
            flavors: BTreeSet::new(),
        }
    }

    /// Restrict results to these flavors. An empty set matches all.
    pub fn with_flavors<I, S>(mut self, flavors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flavors = flavors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_directory_factory(mut self, factory: Arc<dyn DirectoryFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn flavors(&self) -> &BTreeSet<String> {
        &self.flavors
    }

    /// Immediate child directories of `path`, sorted. Flavor registries and instance
    /// leaves are not directories.
    ///
    /// Fails with `NotFound` only if `path` itself is absent.
    pub async fn find_directories(&self, path: &str) -> Result<Vec<String>> {
        let path = join_path([path]);
        let children = self
            .classify_children(&path, true)
            .await?
            .unwrap_or_default();
        Ok(children
            .into_iter()
            .filter(|(_, kind)| *kind == NodeKind::Directory)
            .map(|(child, _)| child)
            .collect())
    }

    /// Add the instances registered directly below `directory` to `out`.
    ///
    /// With flavors configured, `directory/flavor` is read for each of them; otherwise
    /// every flavor registry found below `directory` is read. Missing registries add
    /// nothing.
    pub async fn find_children(&self, out: &mut InstanceMap, directory: &str) -> Result<()> {
        let directory = join_path([directory]);
        let mut found = Vec::new();

        if self.flavors.is_empty() {
            let children = self
                .classify_children(&directory, false)
                .await?
                .unwrap_or_default();
            for (child, kind) in children {
                if kind == NodeKind::Registry {
                    self.collect_registry(&child, &mut found).await?;
                }
            }
        } else {
            for flavor in &self.flavors {
                self.collect_registry(&registry_path(&directory, flavor), &mut found)
                    .await?;
            }
        }

        out.extend(found);
        Ok(())
    }

    /// Add every instance in the subtree rooted at `path` to `out`.
    ///
    /// Fails with `NotFound` if `path` itself is absent.
    pub async fn find_sub_nodes(&self, out: &mut InstanceMap, path: &str) -> Result<()> {
        let found = self
            .walk(path)
            .try_fold(InstanceMap::new(), |mut found, entry| async move {
                if let WalkEntry::Instance { path, metadata } = entry {
                    found.insert(path, metadata);
                }
                Ok(found)
            })
            .await?;

        tracing::debug!(path, count = found.len(), "subtree discovery finished");
        out.extend(found);
        Ok(())
    }

    /// Every instance below the client's root.
    pub async fn find_all(&self) -> Result<InstanceMap> {
        let mut out = InstanceMap::new();
        self.find_sub_nodes(&mut out, &self.root).await?;
        Ok(out)
    }

    /// Lazy depth-first walk below `path`.
    ///
    /// `path` may be a directory, a flavor registry, a name node or a single instance
    /// leaf. Below a directory, each level's instances are yielded before its child
    /// directories, and descent uses an explicit stack. A directory that vanishes
    /// before it is read yields nothing.
    pub fn walk(&self, path: &str) -> impl Stream<Item = Result<WalkEntry>> + '_ {
        let state = WalkState {
            start: Some(join_path([path])),
            pending: Vec::new(),
            ready: VecDeque::new(),
        };
        stream::try_unfold(state, move |state| self.walk_step(state))
    }

    async fn walk_step(&self, mut state: WalkState) -> Result<Option<(WalkEntry, WalkState)>> {
        loop {
            if let Some(entry) = state.ready.pop_front() {
                return Ok(Some((entry, state)));
            }
            if let Some(start) = state.start.take() {
                self.open_walk(start, &mut state).await?;
                continue;
            }
            let Some(dir) = state.pending.pop() else {
                return Ok(None);
            };

            match self.read_level(&dir, false).await? {
                Some(level) => state.push_level(level),
                None => tracing::debug!(path = %dir, "directory vanished during walk"),
            }
        }
    }

    /// Seed the walk according to what the start node is.
    async fn open_walk(&self, start: String, state: &mut WalkState) -> Result<()> {
        match self.classify(&start).await? {
            NodeKind::Vanished => return Err(DiscoveryError::NotFound(start)),
            NodeKind::Instance(instance) => {
                if self.accepts(instance.payload.flavor()) {
                    state.push_instances(vec![(start, instance.payload)]);
                }
            }
            NodeKind::Registry => {
                if self.accepts(last_segment(&start)) {
                    let mut found = Vec::new();
                    self.collect_registry(&start, &mut found).await?;
                    state.push_instances(found);
                }
            }
            NodeKind::Directory => {
                if let Some(level) = self.read_level(&start, true).await? {
                    state.push_level(level);
                }
            }
        }
        Ok(())
    }

    async fn read_level(&self, dir: &str, strict: bool) -> Result<Option<Level>> {
        let Some(children) = self.classify_children(dir, strict).await? else {
            return Ok(None);
        };

        let mut level = Level::default();
        for (child, kind) in children {
            match kind {
                NodeKind::Directory => level.directories.push(child),
                NodeKind::Registry if self.accepts(last_segment(&child)) => {
                    self.collect_registry(&child, &mut level.instances).await?;
                }
                NodeKind::Instance(instance) if self.accepts(instance.payload.flavor()) => {
                    level.instances.push((child, instance.payload));
                }
                _ => {}
            }
        }
        tracing::debug!(
            path = dir,
            instances = level.instances.len(),
            directories = level.directories.len(),
            "read directory level"
        );
        Ok(Some(level))
    }

    /// Classify every child of `dir`. `None` when `dir` is absent and `strict` is off.
    async fn classify_children(
        &self,
        dir: &str,
        strict: bool,
    ) -> Result<Option<Vec<(String, NodeKind)>>> {
        let names = match self.tree.list_children(dir).await {
            Ok(names) => names,
            Err(TreeError::NoNode(_)) if !strict => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::with_capacity(names.len());
        for child in split_immediate_children(dir, &names) {
            let kind = self.classify(&child).await?;
            if kind != NodeKind::Vanished {
                children.push((child, kind));
            }
        }
        Ok(Some(children))
    }

    async fn classify(&self, path: &str) -> Result<NodeKind> {
        match self.tree.get_data(path).await {
            Ok(data) => {
                if let Some(instance) = decode_instance(&data) {
                    return Ok(NodeKind::Instance(Box::new(instance)));
                }
            }
            Err(TreeError::NoNode(_)) => return Ok(NodeKind::Vanished),
            Err(e) => return Err(DiscoveryError::Coordination(e)),
        }

        if self.flavors.contains(last_segment(path)) || self.holds_instances(path).await? {
            Ok(NodeKind::Registry)
        } else {
            Ok(NodeKind::Directory)
        }
    }

    /// True when some grandchild `path/name/id` is an instance leaf.
    async fn holds_instances(&self, path: &str) -> Result<bool> {
        for name in self.children_or_empty(path).await? {
            let group = join_path([path, name.as_str()]);
            for id in self.children_or_empty(&group).await? {
                match self.tree.get_data(&join_path([group.as_str(), id.as_str()])).await {
                    Ok(data) if is_leaf_instance_node(&data) => return Ok(true),
                    Ok(_) | Err(TreeError::NoNode(_)) => {}
                    Err(e) => return Err(DiscoveryError::Coordination(e)),
                }
            }
        }
        Ok(false)
    }

    async fn children_or_empty(&self, path: &str) -> Result<Vec<String>> {
        match self.tree.list_children(path).await {
            Ok(children) => Ok(children),
            Err(TreeError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(DiscoveryError::Coordination(e)),
        }
    }

    async fn collect_registry(
        &self,
        base: &str,
        out: &mut Vec<(String, ServiceMetaData)>,
    ) -> Result<()> {
        let registry = self.factory.open(base);
        for name in registry.query_for_names().await? {
            for instance in registry.query_for_instances(&name).await? {
                let key = join_path([registry.base_path(), &instance.name, &instance.id]);
                out.push((key, instance.payload));
            }
        }
        Ok(())
    }

    fn accepts(&self, flavor: &str) -> bool {
        self.flavors.is_empty() || self.flavors.contains(flavor)
    }
}
