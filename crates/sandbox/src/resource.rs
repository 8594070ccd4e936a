//! Resource queries against a cluster.
//!
//! A [`ResourceRequest`] describes *what* to fetch; a [`ResourceBackend`]
//! knows *how* to fetch it for a given cluster. Scripts build requests
//! through the `kubectl` handle and never see the backend directly.

pub mod cache;
pub mod fixture;
pub mod kube;
pub mod selector;

use std::fmt;

use async_trait::async_trait;
use kinspect_core::ClusterRef;
use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

pub use cache::ResponseCache;
pub use fixture::StaticBackend;
pub use kube::KubeApiBackend;
pub use selector::LabelSelector;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Group/version/kind of a resource type. `group` is empty for the core API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// `v1` for the core group, `apps/v1` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Namespace scoping of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum NamespaceScope {
    /// Nothing chosen; namespaced kinds resolve to `default`.
    #[default]
    Unset,
    Namespace(String),
    All,
}

impl NamespaceScope {
    /// Namespace to query, `None` meaning across all namespaces.
    pub fn resolve(&self) -> Option<&str> {
        match self {
            NamespaceScope::Unset => Some(DEFAULT_NAMESPACE),
            NamespaceScope::Namespace(ns) => Some(ns),
            NamespaceScope::All => None,
        }
    }
}

/// The shape of one resource query. Doubles as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ResourceRequest {
    pub gvk: Option<Gvk>,
    pub namespace: NamespaceScope,
    pub label_selector: Option<String>,
    pub name: Option<String>,
}

impl ResourceRequest {
    pub fn gvk(&self) -> Result<&Gvk, ResourceError> {
        self.gvk.as_ref().ok_or(ResourceError::MissingGvk)
    }

    pub fn name(&self) -> Result<&str, ResourceError> {
        self.name.as_deref().ok_or(ResourceError::MissingName)
    }
}

/// Typed access to cluster resources.
///
/// `list` returns a JSON array of objects, `get` a single object and `doc`
/// the description text of a dotted field path within the kind's schema.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    async fn list(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<serde_json::Value, ResourceError>;

    async fn get(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<serde_json::Value, ResourceError>;

    async fn doc(
        &self,
        cluster: &ClusterRef,
        gvk: &Gvk,
        field_path: &str,
    ) -> Result<String, ResourceError>;
}
