//! Access control applied to namespace nodes created by the client

use serde::{Deserialize, Serialize};

/// Permission bits in coordination-service encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Perms(pub u32);

impl Perms {
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(1 << 1);
    pub const CREATE: Perms = Perms(1 << 2);
    pub const DELETE: Perms = Perms(1 << 3);
    pub const ADMIN: Perms = Perms(1 << 4);
    pub const ALL: Perms = Perms(0x1f);

    pub fn contains(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Principal an ACL entry applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclId {
    pub scheme: String,
    pub id: String,
}

impl AclId {
    pub const WORLD_SCHEME: &'static str = "world";
    pub const ANYONE: &'static str = "anyone";

    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// The wildcard principal.
    pub fn anyone() -> Self {
        Self::new(Self::WORLD_SCHEME, Self::ANYONE)
    }

    pub fn is_anyone(&self) -> bool {
        self.scheme == Self::WORLD_SCHEME && self.id == Self::ANYONE
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclEntry {
    pub perms: Perms,
    pub id: AclId,
}

impl AclEntry {
    pub fn new(perms: Perms, id: AclId) -> Self {
        Self { perms, id }
    }

    /// Full rights for everyone.
    pub fn open() -> Self {
        Self::new(Perms::ALL, AclId::anyone())
    }
}

/// Credentials of the principal that should own newly created namespace nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthInfo {
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// Also grant open access so unauthenticated peers keep working during migration.
    #[serde(default)]
    pub allow_not_authenticated: bool,
}

impl AuthInfo {
    pub fn new(
        scheme: impl Into<String>,
        id: impl Into<String>,
        allow_not_authenticated: bool,
    ) -> Self {
        Self {
            scheme: Some(scheme.into()),
            id: Some(id.into()),
            allow_not_authenticated,
        }
    }
}

/// How namespace nodes are protected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AclPolicy {
    #[default]
    Open,
    Authenticated {
        scheme: String,
        id: String,
        allow_fallback: bool,
    },
}

impl AclPolicy {
    /// Pick the policy matching optional credentials. Unset scheme/id become empty strings.
    pub fn from_auth(auth: Option<&AuthInfo>) -> Self {
        match auth {
            None => AclPolicy::Open,
            Some(info) => AclPolicy::Authenticated {
                scheme: info.scheme.clone().unwrap_or_default(),
                id: info.id.clone().unwrap_or_default(),
                allow_fallback: info.allow_not_authenticated,
            },
        }
    }

    /// Concrete ACL list attached to every node created while ensuring a path.
    pub fn resolve(&self) -> Vec<AclEntry> {
        match self {
            AclPolicy::Open => vec![AclEntry::open()],
            AclPolicy::Authenticated {
                scheme,
                id,
                allow_fallback,
            } => {
                let mut acl = vec![AclEntry::new(Perms::ALL, AclId::new(scheme, id))];
                if *allow_fallback {
                    acl.push(AclEntry::open());
                }
                acl
            }
        }
    }
}

/// Shorthand for `AclPolicy::from_auth(auth).resolve()`.
pub fn resolve_acl(auth: Option<&AuthInfo>) -> Vec<AclEntry> {
    AclPolicy::from_auth(auth).resolve()
}
