//! Namespace authorization derived from watched RBAC resources: a directed
//! graph from bearer tokens to the namespaces they may observe.

pub mod canonical;
pub mod graph;
pub mod view;

use std::fmt;

use crate::data::StringSet;

/// Result of resolving a token against the RBAC graph.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnedNamespaces {
    /// Cluster-wide reader; no restriction applies.
    All,
    Set(StringSet),
}

impl OwnedNamespaces {
    pub fn has_all(&self) -> bool {
        matches!(self, OwnedNamespaces::All)
    }

    /// Sorted namespace values; empty for the unrestricted case, which
    /// callers must check through [`OwnedNamespaces::has_all`] first.
    pub fn values(&self) -> Vec<&str> {
        match self {
            OwnedNamespaces::All => Vec::new(),
            OwnedNamespaces::Set(set) => set.values(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            OwnedNamespaces::All => false,
            OwnedNamespaces::Set(set) => set.is_empty(),
        }
    }
}

impl fmt::Display for OwnedNamespaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "owned namespaces => hasAll: {}, values: [{}]",
            self.has_all(),
            self.values().join(",")
        )
    }
}

/// Answers "which namespaces does this token own" for the dispatcher.
/// Production uses [`view::RbacView`]; tests substitute fixed mappings.
pub trait NamespacesView: Send + Sync {
    fn own(&self, token: &str) -> OwnedNamespaces;
}
