//! In-memory backend serving a fixed set of objects.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use kinspect_core::ClusterRef;

use super::selector::LabelSelector;
use super::{Gvk, ResourceBackend, ResourceRequest};
use crate::error::ResourceError;

#[derive(Default)]
struct ClusterState {
    objects: Vec<serde_json::Value>,
    docs: HashMap<(String, String), String>,
}

/// Resources held in memory, keyed by cluster. Objects are matched on their
/// `apiVersion`, `kind`, `metadata.namespace`, `metadata.name` and labels.
///
/// Kinds listed through [`StaticBackend::cluster_scoped`] ignore namespaces.
#[derive(Default)]
pub struct StaticBackend {
    clusters: RwLock<HashMap<ClusterRef, ClusterState>>,
    cluster_scoped: RwLock<Vec<String>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, cluster: &str, object: serde_json::Value) -> Self {
        self.insert(cluster, object);
        self
    }

    pub fn with_doc(self, cluster: &str, kind: &str, path: &str, text: &str) -> Self {
        let mut clusters = self.clusters.write().unwrap_or_else(|e| e.into_inner());
        clusters
            .entry(ClusterRef::from(cluster))
            .or_default()
            .docs
            .insert((kind.to_string(), path.to_string()), text.to_string());
        drop(clusters);
        self
    }

    pub fn cluster_scoped(self, kind: &str) -> Self {
        self.cluster_scoped
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(kind.to_string());
        self
    }

    pub fn insert(&self, cluster: &str, object: serde_json::Value) {
        let mut clusters = self.clusters.write().unwrap_or_else(|e| e.into_inner());
        clusters
            .entry(ClusterRef::from(cluster))
            .or_default()
            .objects
            .push(object);
    }

    fn is_cluster_scoped(&self, kind: &str) -> bool {
        self.cluster_scoped
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|k| k == kind)
    }

    fn matching(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<Vec<serde_json::Value>, ResourceError> {
        let gvk = request.gvk()?;
        let selector = match &request.label_selector {
            Some(raw) => Some(LabelSelector::parse(raw)?),
            None => None,
        };
        let namespace = if self.is_cluster_scoped(&gvk.kind) {
            None
        } else {
            request.namespace.resolve()
        };

        let clusters = self.clusters.read().unwrap_or_else(|e| e.into_inner());
        let state = clusters
            .get(cluster)
            .ok_or_else(|| ResourceError::UnknownCluster(cluster.to_string()))?;

        let api_version = gvk.api_version();
        Ok(state
            .objects
            .iter()
            .filter(|o| o["apiVersion"] == api_version.as_str() && o["kind"] == gvk.kind.as_str())
            .filter(|o| match namespace {
                Some(ns) => o.pointer("/metadata/namespace").and_then(|v| v.as_str()) == Some(ns),
                None => true,
            })
            .filter(|o| match &request.name {
                Some(name) => o.pointer("/metadata/name").and_then(|v| v.as_str()) == Some(name),
                None => true,
            })
            .filter(|o| selector.as_ref().map_or(true, |s| s.matches_object(o)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResourceBackend for StaticBackend {
    async fn list(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<serde_json::Value, ResourceError> {
        Ok(serde_json::Value::Array(self.matching(cluster, request)?))
    }

    async fn get(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<serde_json::Value, ResourceError> {
        let name = request.name()?.to_string();
        let kind = request.gvk()?.kind.clone();
        self.matching(cluster, request)?
            .into_iter()
            .next()
            .ok_or(ResourceError::NotFound { kind, name })
    }

    async fn doc(
        &self,
        cluster: &ClusterRef,
        gvk: &Gvk,
        field_path: &str,
    ) -> Result<String, ResourceError> {
        let clusters = self.clusters.read().unwrap_or_else(|e| e.into_inner());
        let state = clusters
            .get(cluster)
            .ok_or_else(|| ResourceError::UnknownCluster(cluster.to_string()))?;
        state
            .docs
            .get(&(gvk.kind.clone(), field_path.to_string()))
            .cloned()
            .ok_or_else(|| ResourceError::NoDoc {
                kind: gvk.kind.clone(),
                path: field_path.to_string(),
            })
    }
}
