//! Registration client - advertises one worker's services under the namespace

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::acl::{AclPolicy, AuthInfo};
use crate::error::{DiscoveryError, Result};
use crate::metadata::ServiceMetaData;
use crate::path::{self, directory_path, parse_service_spec, registry_path};
use crate::registry::{
    DirectoryFactory, ServiceDirectory, ServiceInstance, ServiceType, TreeDirectoryFactory,
};
use crate::tree::{ensure_path, CoordinationTree};

/// Lifecycle of a [`RegistrationClient`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Advertising,
}

struct Advertised {
    registry: Arc<dyn ServiceDirectory>,
    instance: ServiceInstance,
}

/// Owns the advertisement of one worker.
///
/// Every `flavor:port` entry of the service spec is advertised under
/// `root[/stack]/flavor/name/address:port`. `advertise_availability` and
/// `de_advertise_availability` each succeed once per cycle; calling either out of
/// order fails with [`DiscoveryError::InvalidState`].
pub struct RegistrationClient {
    tree: Arc<dyn CoordinationTree>,
    factory: Arc<dyn DirectoryFactory>,
    directory: String,
    name: String,
    address: Option<String>,
    services: BTreeMap<String, u16>,
    parameters: BTreeMap<String, String>,
    acl: AclPolicy,
    service_type: ServiceType,
    advertised: Vec<Advertised>,
    state: RegistrationState,
}

impl std::fmt::Debug for RegistrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationClient")
            .field("directory", &self.directory)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("services", &self.services)
            .field("acl", &self.acl)
            .field("state", &self.state)
            .field("advertised_count", &self.advertised.len())
            .finish()
    }
}

impl RegistrationClient {
    /// Client for worker `name` under `root`, advertising every entry of `service_spec`.
    pub fn new(
        tree: Arc<dyn CoordinationTree>,
        root: &str,
        name: impl Into<String>,
        service_spec: &str,
    ) -> Result<Self> {
        let name = name.into();
        path::validate_segment("name", &name)?;
        let services = parse_service_spec(service_spec)?;

        Ok(Self {
            factory: Arc::new(TreeDirectoryFactory::new(Arc::clone(&tree))),
            tree,
            directory: directory_path(root, None),
            name,
            address: None,
            services,
            parameters: BTreeMap::new(),
            acl: AclPolicy::Open,
            service_type: ServiceType::Dynamic,
            advertised: Vec::new(),
            state: RegistrationState::Unregistered,
        })
    }

    /// Scope registrations to a deployment group below the root.
    ///
    /// `stack` is a single segment; surrounding separators are ignored.
    pub fn with_stack(mut self, stack: &str) -> Result<Self> {
        let stack = stack.trim_matches(path::SEPARATOR);
        path::validate_segment("stack", stack)?;
        let root = std::mem::take(&mut self.directory);
        self.directory = directory_path(&root, Some(stack));
        Ok(self)
    }

    /// Address to advertise; the local interface address is used when unset.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_auth(mut self, auth: Option<&AuthInfo>) -> Self {
        self.acl = AclPolicy::from_auth(auth);
        self
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn with_directory_factory(mut self, factory: Arc<dyn DirectoryFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// `root[/stack]` this client registers into.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptors currently advertised.
    pub fn advertised(&self) -> Vec<&ServiceMetaData> {
        self.advertised.iter().map(|a| &a.instance.payload).collect()
    }

    /// Full paths of the advertised instance leaves.
    pub fn advertised_paths(&self) -> Vec<String> {
        self.advertised
            .iter()
            .map(|a| {
                path::join_path([
                    a.registry.base_path(),
                    a.instance.name.as_str(),
                    a.instance.id.as_str(),
                ])
            })
            .collect()
    }

    /// Publish every configured service.
    ///
    /// Fails with `DuplicateRegistration` when any flavor registry already holds an
    /// instance at the same address and port; nothing is registered in that case.
    pub async fn advertise_availability(&mut self) -> Result<()> {
        if self.state != RegistrationState::Unregistered {
            return Err(DiscoveryError::InvalidState(
                "advertise_availability called while already advertising",
            ));
        }

        let acl = self.acl.resolve();
        let address = match &self.address {
            Some(address) => address.clone(),
            None => local_address()?,
        };

        let mut pending = Vec::with_capacity(self.services.len());
        for (flavor, port) in &self.services {
            let base = registry_path(&self.directory, flavor);
            ensure_path(self.tree.as_ref(), &base, &acl)
                .await
                .map_err(DiscoveryError::Coordination)?;

            let registry = self.factory.open(&base);
            self.check_unique(registry.as_ref(), flavor, &address, *port)
                .await?;

            let metadata = ServiceMetaData::new(address.clone(), *port, flavor.clone())
                .with_parameters(self.parameters.clone());
            let instance = ServiceInstance::new(self.name.clone(), metadata)
                .with_service_type(self.service_type);
            pending.push(Advertised { registry, instance });
        }

        let mut done: Vec<Advertised> = Vec::with_capacity(pending.len());
        for entry in pending {
            if let Err(e) = entry.registry.register(&entry.instance).await {
                rollback(&done).await;
                return Err(e);
            }
            done.push(entry);
        }

        for entry in &done {
            tracing::info!(
                directory = %self.directory,
                flavor = entry.instance.payload.flavor(),
                name = %self.name,
                address = %entry.instance.address,
                port = entry.instance.port,
                "service advertised"
            );
        }
        self.advertised = done;
        self.state = RegistrationState::Advertising;
        Ok(())
    }

    /// Withdraw every advertised service.
    ///
    /// Entries that fail to unregister stay tracked and the client keeps advertising,
    /// so the call can be retried.
    pub async fn de_advertise_availability(&mut self) -> Result<()> {
        if self.state != RegistrationState::Advertising {
            return Err(DiscoveryError::InvalidState(
                "de_advertise_availability called while not advertising",
            ));
        }

        let mut first_err = None;
        let mut remaining = Vec::new();
        for entry in std::mem::take(&mut self.advertised) {
            match entry.registry.unregister(&entry.instance).await {
                Ok(()) => tracing::info!(
                    directory = %self.directory,
                    flavor = entry.instance.payload.flavor(),
                    name = %self.name,
                    address = %entry.instance.address,
                    port = entry.instance.port,
                    "service de-advertised"
                ),
                Err(e) => {
                    first_err.get_or_insert(e);
                    remaining.push(entry);
                }
            }
        }

        if let Some(e) = first_err {
            self.advertised = remaining;
            return Err(e);
        }
        self.state = RegistrationState::Unregistered;
        Ok(())
    }

    async fn check_unique(
        &self,
        registry: &dyn ServiceDirectory,
        flavor: &str,
        address: &str,
        port: u16,
    ) -> Result<()> {
        for name in registry.query_for_names().await? {
            let clash = registry
                .query_for_instances(&name)
                .await?
                .into_iter()
                .any(|i| i.address == address && i.port == port);
            if clash {
                tracing::warn!(
                    directory = %self.directory,
                    flavor,
                    address,
                    port,
                    existing_name = %name,
                    "refusing duplicate registration"
                );
                return Err(DiscoveryError::DuplicateRegistration {
                    directory: self.directory.clone(),
                    flavor: flavor.to_string(),
                    address: address.to_string(),
                    port,
                });
            }
        }
        Ok(())
    }
}

async fn rollback(registered: &[Advertised]) {
    for entry in registered {
        if let Err(e) = entry.registry.unregister(&entry.instance).await {
            tracing::warn!(
                error = %e,
                base = entry.registry.base_path(),
                id = %entry.instance.id,
                "failed to roll back partial registration"
            );
        }
    }
}

fn local_address() -> Result<String> {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .map_err(|e| DiscoveryError::AddressResolution(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::acl::{AclEntry, AclId, Perms};
    use crate::memory::MemoryTree;
    use crate::registry::TreeServiceDirectory;
    use crate::tree::{CreateMode, TreeError};

    fn shared(tree: &MemoryTree) -> Arc<dyn CoordinationTree> {
        Arc::new(tree.clone())
    }

    #[test]
    fn test_new_rejects_bad_input() {
        let tree = MemoryTree::new();
        let err = RegistrationClient::new(shared(&tree), "/services", "vanilla", "http")
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedSpec(_)));

        let err = RegistrationClient::new(shared(&tree), "/services", "a/b", "http:80")
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidPath(_)));
    }

    #[test]
    fn test_directory_composition() {
        let tree = MemoryTree::new();
        let client = RegistrationClient::new(shared(&tree), "/services/", "vanilla", "http:80")
            .unwrap()
            .with_stack("/prod/")
            .unwrap();
        assert_eq!(client.directory(), "/services/prod");
        assert_eq!(client.name(), "vanilla");
        assert_eq!(client.state(), RegistrationState::Unregistered);
    }

    #[tokio::test]
    async fn test_advertise_then_de_advertise() {
        let tree = MemoryTree::new();
        let mut client = RegistrationClient::new(shared(&tree), "/services", "vanilla", "foo:2181")
            .unwrap()
            .with_stack("prod")
            .unwrap()
            .with_address("127.0.0.1");

        client.advertise_availability().await.unwrap();
        assert_eq!(client.state(), RegistrationState::Advertising);
        assert_eq!(
            client.advertised_paths(),
            vec!["/services/prod/foo/vanilla/127.0.0.1:2181"]
        );
        let meta = client.advertised()[0];
        assert_eq!(meta.address(), "127.0.0.1");
        assert_eq!(meta.port(), 2181);
        assert_eq!(meta.flavor(), "foo");

        client.de_advertise_availability().await.unwrap();
        assert_eq!(client.state(), RegistrationState::Unregistered);
        assert!(client.advertised().is_empty());
        assert!(!tree
            .exists("/services/prod/foo/vanilla/127.0.0.1:2181")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_double_advertise_is_invalid_state() {
        let tree = MemoryTree::new();
        let mut client = RegistrationClient::new(shared(&tree), "/services", "y", "dayview:10022")
            .unwrap()
            .with_address("192.168.1.101");

        client.advertise_availability().await.unwrap();
        let err = client.advertise_availability().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidState(_)));
        assert_eq!(client.state(), RegistrationState::Advertising);
    }

    #[tokio::test]
    async fn test_de_advertise_without_advertise_is_invalid_state() {
        let tree = MemoryTree::new();
        let mut client = RegistrationClient::new(shared(&tree), "/services", "y", "dayview:10022")
            .unwrap()
            .with_address("192.168.1.101");

        let err = client.de_advertise_availability().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidState(_)));

        client.advertise_availability().await.unwrap();
        client.de_advertise_availability().await.unwrap();
        let err = client.de_advertise_availability().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_readvertise_after_de_advertise() {
        let tree = MemoryTree::new();
        let mut client = RegistrationClient::new(shared(&tree), "/services", "y", "http:80")
            .unwrap()
            .with_address("10.0.0.1");

        client.advertise_availability().await.unwrap();
        let first = client.advertised()[0].id();
        client.de_advertise_availability().await.unwrap();
        client.advertise_availability().await.unwrap();
        assert_ne!(client.advertised()[0].id(), first);
    }

    #[tokio::test]
    async fn test_ensure_path_uses_resolved_acl() {
        let tree = MemoryTree::new();
        let auth = AuthInfo::new("digest", "worker:hash", true);
        let mut client = RegistrationClient::new(shared(&tree), "/secure", "w", "http:80")
            .unwrap()
            .with_address("10.0.0.1")
            .with_auth(Some(&auth));

        client.advertise_availability().await.unwrap();

        let expected = vec![
            AclEntry::new(Perms::ALL, AclId::new("digest", "worker:hash")),
            AclEntry::open(),
        ];
        assert_eq!(tree.get_acl("/secure").await.unwrap(), expected);
        assert_eq!(tree.get_acl("/secure/http").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_multi_service_spec_registers_each_flavor() {
        let tree = MemoryTree::new();
        let mut client =
            RegistrationClient::new(shared(&tree), "/services", "vanilla", "http:80,guide:10004")
                .unwrap()
                .with_address("127.0.0.1");

        client.advertise_availability().await.unwrap();
        let mut paths = client.advertised_paths();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "/services/guide/vanilla/127.0.0.1:10004",
                "/services/http/vanilla/127.0.0.1:80",
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_in_one_flavor_registers_nothing() {
        let tree = MemoryTree::new();
        let mut first = RegistrationClient::new(shared(&tree), "/services", "a", "http:80")
            .unwrap()
            .with_address("127.0.0.1");
        first.advertise_availability().await.unwrap();

        let mut second =
            RegistrationClient::new(shared(&tree), "/services", "b", "guide:10004,http:80")
                .unwrap()
                .with_address("127.0.0.1");
        let err = second.advertise_availability().await.unwrap_err();

        assert!(matches!(
            err,
            DiscoveryError::DuplicateRegistration { ref flavor, port: 80, .. } if flavor == "http"
        ));
        assert_eq!(second.state(), RegistrationState::Unregistered);
        assert!(tree
            .list_children("/services/guide")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_connection_loss_leaves_state_unchanged() {
        let tree = MemoryTree::new();
        let mut client = RegistrationClient::new(shared(&tree), "/services", "w", "http:80")
            .unwrap()
            .with_address("10.0.0.1");

        tree.set_available(false);
        let err = client.advertise_availability().await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Coordination(TreeError::ConnectionLoss)
        ));
        assert_eq!(client.state(), RegistrationState::Unregistered);

        tree.set_available(true);
        client.advertise_availability().await.unwrap();

        tree.set_available(false);
        let err = client.de_advertise_availability().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Coordination(_)));
        assert_eq!(client.state(), RegistrationState::Advertising);
        assert_eq!(client.advertised().len(), 1);

        tree.set_available(true);
        client.de_advertise_availability().await.unwrap();
        assert_eq!(client.state(), RegistrationState::Unregistered);
    }

    #[tokio::test]
    async fn test_parameters_travel_with_descriptor() {
        let tree = MemoryTree::new();
        let mut params = BTreeMap::new();
        params.insert("version".to_string(), "1.2.3".to_string());

        let mut client = RegistrationClient::new(shared(&tree), "/services", "w", "http:80")
            .unwrap()
            .with_address("10.0.0.1")
            .with_parameters(params);
        client.advertise_availability().await.unwrap();

        let registry = TreeDirectoryFactory::new(shared(&tree)).open("/services/http");
        let found = registry.query_for_instances("w").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload.parameter("version"), Some("1.2.3"));
    }

    #[test]
    fn test_with_stack_rejects_nested_segment() {
        let tree = MemoryTree::new();
        let client = RegistrationClient::new(shared(&tree), "/services", "vanilla", "http:80")
            .unwrap();
        let err = client.with_stack("a/b").unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidPath(_)));

        let client = RegistrationClient::new(shared(&tree), "/services", "vanilla", "http:80")
            .unwrap();
        assert!(matches!(
            client.with_stack("//"),
            Err(DiscoveryError::InvalidPath(_))
        ));
    }

    /// Tree whose node creation always reports a missing parent.
    struct MissingParentTree(MemoryTree);

    #[async_trait]
    impl CoordinationTree for MissingParentTree {
        async fn create(
            &self,
            path: &str,
            _data: Vec<u8>,
            _mode: CreateMode,
            _acl: &[AclEntry],
        ) -> std::result::Result<(), TreeError> {
            Err(TreeError::NoNode(path.to_string()))
        }

        async fn exists(&self, path: &str) -> std::result::Result<bool, TreeError> {
            self.0.exists(path).await
        }

        async fn get_data(&self, path: &str) -> std::result::Result<Vec<u8>, TreeError> {
            self.0.get_data(path).await
        }

        async fn list_children(&self, path: &str) -> std::result::Result<Vec<String>, TreeError> {
            self.0.list_children(path).await
        }

        async fn delete(&self, path: &str) -> std::result::Result<(), TreeError> {
            self.0.delete(path).await
        }

        async fn get_acl(&self, path: &str) -> std::result::Result<Vec<AclEntry>, TreeError> {
            self.0.get_acl(path).await
        }
    }

    #[tokio::test]
    async fn test_namespace_creation_failure_is_coordination_error() {
        let tree: Arc<dyn CoordinationTree> = Arc::new(MissingParentTree(MemoryTree::new()));
        let mut client = RegistrationClient::new(Arc::clone(&tree), "/services", "w", "http:80")
            .unwrap()
            .with_address("10.0.0.1");

        let err = client.advertise_availability().await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(
            err,
            DiscoveryError::Coordination(TreeError::NoNode(_))
        ));
        assert_eq!(client.state(), RegistrationState::Unregistered);

        let registry = TreeServiceDirectory::new(tree, "/services/http");
        let instance = ServiceInstance::new("w", ServiceMetaData::new("10.0.0.1", 80, "http"));
        assert!(matches!(
            registry.register(&instance).await,
            Err(DiscoveryError::Coordination(TreeError::NoNode(_)))
        ));
    }

    /// Registry that refuses every registration.
    struct RejectingDirectory(Arc<dyn ServiceDirectory>);

    #[async_trait]
    impl ServiceDirectory for RejectingDirectory {
        fn base_path(&self) -> &str {
            self.0.base_path()
        }

        async fn register(&self, _instance: &ServiceInstance) -> Result<()> {
            Err(DiscoveryError::Coordination(TreeError::ConnectionLoss))
        }

        async fn unregister(&self, instance: &ServiceInstance) -> Result<()> {
            self.0.unregister(instance).await
        }

        async fn query_for_names(&self) -> Result<Vec<String>> {
            self.0.query_for_names().await
        }

        async fn query_for_instances(&self, name: &str) -> Result<Vec<ServiceInstance>> {
            self.0.query_for_instances(name).await
        }
    }

    struct RejectingFactory {
        inner: TreeDirectoryFactory,
        flavor: &'static str,
    }

    impl DirectoryFactory for RejectingFactory {
        fn open(&self, base_path: &str) -> Arc<dyn ServiceDirectory> {
            let registry = self.inner.open(base_path);
            if path::last_segment(base_path) == self.flavor {
                Arc::new(RejectingDirectory(registry))
            } else {
                registry
            }
        }
    }

    #[tokio::test]
    async fn test_failed_registration_rolls_back_earlier_flavors() {
        let tree = MemoryTree::new();
        let factory = RejectingFactory {
            inner: TreeDirectoryFactory::new(shared(&tree)),
            flavor: "http",
        };
        let mut client =
            RegistrationClient::new(shared(&tree), "/services", "w", "guide:10004,http:80")
                .unwrap()
                .with_address("127.0.0.1")
                .with_directory_factory(Arc::new(factory));

        let err = client.advertise_availability().await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Coordination(TreeError::ConnectionLoss)
        ));
        assert_eq!(client.state(), RegistrationState::Unregistered);
        assert!(client.advertised().is_empty());
        assert!(tree
            .list_children("/services/guide")
            .await
            .unwrap()
            .is_empty());
    }
}
