//! Kubernetes REST API backend.
//!
//! Speaks plain HTTP to each cluster's API server: kind → resource name
//! resolution goes through API discovery, field docs through the cluster's
//! OpenAPI v2 document. Both are fetched once per cluster and kept.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kinspect_core::clusters::{ClusterEndpoint, ClusterRegistry};
use kinspect_core::ClusterRef;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Gvk, ResourceBackend, ResourceRequest};
use crate::error::ResourceError;

struct ClusterClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ClusterClient {
    fn from_endpoint(endpoint: &ClusterEndpoint) -> Result<Self, ResourceError> {
        let mut builder = reqwest::Client::builder();
        if let Some(ca_file) = &endpoint.ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| {
                ResourceError::Config(format!("reading CA file {}: {e}", ca_file.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ResourceError::Config(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if endpoint.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let token = endpoint
            .bearer_token()
            .map_err(|e| ResourceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: endpoint.server.trim_end_matches('/').to_string(),
            token,
            http: builder
                .build()
                .map_err(|e| ResourceError::Config(e.to_string()))?,
        })
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<serde_json::Value>, ResourceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(url = %url, "cluster API request");
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            return Err(ResourceError::Api(format!("{status}: {message}")));
        }
        Ok(Some(response.json().await?))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiResource {
    name: String,
    kind: String,
    namespaced: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResourceList {
    #[serde(default)]
    resources: Vec<ApiResource>,
}

/// Resource backend that talks to real clusters from the cluster registry.
pub struct KubeApiBackend {
    clients: HashMap<ClusterRef, ClusterClient>,
    discovery: Mutex<HashMap<(ClusterRef, String), Arc<Vec<ApiResource>>>>,
    openapi: Mutex<HashMap<ClusterRef, Arc<serde_json::Value>>>,
}

impl KubeApiBackend {
    pub fn from_registry(registry: &ClusterRegistry) -> Result<Self, ResourceError> {
        let mut clients = HashMap::with_capacity(registry.clusters.len());
        for endpoint in &registry.clusters {
            clients.insert(
                ClusterRef::new(endpoint.name.clone()),
                ClusterClient::from_endpoint(endpoint)?,
            );
        }
        info!(clusters = clients.len(), "Kubernetes API backend ready");
        Ok(Self {
            clients,
            discovery: Mutex::new(HashMap::new()),
            openapi: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, cluster: &ClusterRef) -> Result<&ClusterClient, ResourceError> {
        self.clients
            .get(cluster)
            .ok_or_else(|| ResourceError::UnknownCluster(cluster.to_string()))
    }

    async fn resolve(&self, cluster: &ClusterRef, gvk: &Gvk) -> Result<ApiResource, ResourceError> {
        let api_version = gvk.api_version();
        let cache_key = (cluster.clone(), api_version.clone());
        let cached = self
            .discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&cache_key)
            .cloned();

        let resources = match cached {
            Some(r) => r,
            None => {
                let list = self
                    .client(cluster)?
                    .get_json(&api_prefix(gvk), &[])
                    .await?
                    .ok_or_else(|| ResourceError::UnknownKind {
                        api_version: api_version.clone(),
                        kind: gvk.kind.clone(),
                    })?;
                let parsed: ApiResourceList = serde_json::from_value(list)
                    .map_err(|e| ResourceError::Api(format!("bad discovery document: {e}")))?;
                let resources = Arc::new(parsed.resources);
                self.discovery
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(cache_key, resources.clone());
                resources
            }
        };

        resources
            .iter()
            .find(|r| r.kind == gvk.kind && !r.name.contains('/'))
            .cloned()
            .ok_or_else(|| ResourceError::UnknownKind {
                api_version,
                kind: gvk.kind.clone(),
            })
    }

    async fn openapi_document(
        &self,
        cluster: &ClusterRef,
    ) -> Result<Arc<serde_json::Value>, ResourceError> {
        let cached = self
            .openapi
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(cluster)
            .cloned();
        if let Some(doc) = cached {
            return Ok(doc);
        }
        let doc = self
            .client(cluster)?
            .get_json("/openapi/v2", &[])
            .await?
            .ok_or_else(|| ResourceError::Api("cluster does not serve /openapi/v2".into()))?;
        let doc = Arc::new(doc);
        self.openapi
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cluster.clone(), doc.clone());
        Ok(doc)
    }

    async fn list_items(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<Vec<serde_json::Value>, ResourceError> {
        let gvk = request.gvk()?;
        let resource = self.resolve(cluster, gvk).await?;
        let namespace = if resource.namespaced {
            request.namespace.resolve()
        } else {
            None
        };
        let path = collection_path(gvk, &resource, namespace);

        let field_selector = request.name.as_ref().map(|n| format!("metadata.name={n}"));
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(sel) = &request.label_selector {
            query.push(("labelSelector", sel.as_str()));
        }
        if let Some(sel) = &field_selector {
            query.push(("fieldSelector", sel.as_str()));
        }

        let body = self
            .client(cluster)?
            .get_json(&path, &query)
            .await?
            .unwrap_or(serde_json::Value::Null);
        let api_version = gvk.api_version();
        Ok(body["items"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut item| {
                // list responses omit per-item type metadata
                if let Some(obj) = item.as_object_mut() {
                    obj.entry("apiVersion").or_insert_with(|| api_version.clone().into());
                    obj.entry("kind").or_insert_with(|| gvk.kind.clone().into());
                }
                item
            })
            .collect())
    }
}

#[async_trait]
impl ResourceBackend for KubeApiBackend {
    async fn list(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<serde_json::Value, ResourceError> {
        Ok(serde_json::Value::Array(self.list_items(cluster, request).await?))
    }

    async fn get(
        &self,
        cluster: &ClusterRef,
        request: &ResourceRequest,
    ) -> Result<serde_json::Value, ResourceError> {
        let gvk = request.gvk()?;
        let name = request.name()?;
        let not_found = || ResourceError::NotFound {
            kind: gvk.kind.clone(),
            name: name.to_string(),
        };

        let resource = self.resolve(cluster, gvk).await?;
        let namespace = if resource.namespaced {
            request.namespace.resolve()
        } else {
            None
        };

        if resource.namespaced && namespace.is_none() {
            // Get across all namespaces: first match by name
            return self
                .list_items(cluster, request)
                .await?
                .into_iter()
                .next()
                .ok_or_else(not_found);
        }

        let path = format!("{}/{}", collection_path(gvk, &resource, namespace), name);
        self.client(cluster)?
            .get_json(&path, &[])
            .await?
            .ok_or_else(not_found)
    }

    async fn doc(
        &self,
        cluster: &ClusterRef,
        gvk: &Gvk,
        field_path: &str,
    ) -> Result<String, ResourceError> {
        let document = self.openapi_document(cluster).await?;
        field_doc(&document, gvk, field_path).ok_or_else(|| ResourceError::NoDoc {
            kind: gvk.kind.clone(),
            path: field_path.to_string(),
        })
    }
}

fn api_prefix(gvk: &Gvk) -> String {
    if gvk.group.is_empty() {
        format!("/api/{}", gvk.version)
    } else {
        format!("/apis/{}/{}", gvk.group, gvk.version)
    }
}

fn collection_path(gvk: &Gvk, resource: &ApiResource, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{}/namespaces/{}/{}", api_prefix(gvk), ns, resource.name),
        None => format!("{}/{}", api_prefix(gvk), resource.name),
    }
}

// ── OpenAPI field docs ────────────────────────────────────────

/// Description of `field_path` (dotted, e.g. `spec.containers.image`) in the
/// schema of `gvk`. An empty path yields the kind's own description. Array
/// fields are stepped through transparently.
fn field_doc(document: &serde_json::Value, gvk: &Gvk, field_path: &str) -> Option<String> {
    let definitions = document.get("definitions")?.as_object()?;
    let root = definitions.values().find(|def| declares_gvk(def, gvk))?;

    let mut schema = root;
    let mut description = root.get("description");
    for segment in field_path.split('.').filter(|s| !s.is_empty()) {
        let container = deref(definitions, schema)?;
        let container = match container.get("items") {
            Some(items) => deref(definitions, items)?,
            None => container,
        };
        let field = container.get("properties")?.get(segment)?;
        description = field
            .get("description")
            .or_else(|| deref(definitions, field).and_then(|d| d.get("description")));
        schema = field;
    }
    description.and_then(|d| d.as_str()).map(str::to_string)
}

fn declares_gvk(definition: &serde_json::Value, gvk: &Gvk) -> bool {
    definition
        .get("x-kubernetes-group-version-kind")
        .and_then(|v| v.as_array())
        .is_some_and(|entries| {
            entries.iter().any(|e| {
                e["group"].as_str().unwrap_or("") == gvk.group
                    && e["version"] == gvk.version.as_str()
                    && e["kind"] == gvk.kind.as_str()
            })
        })
}

/// Follow `$ref` links (`#/definitions/<name>`) to the concrete schema.
fn deref<'a>(
    definitions: &'a serde_json::Map<String, serde_json::Value>,
    schema: &'a serde_json::Value,
) -> Option<&'a serde_json::Value> {
    let mut current = schema;
    for _ in 0..16 {
        match current.get("$ref").and_then(|r| r.as_str()) {
            Some(reference) => {
                current = definitions.get(reference.strip_prefix("#/definitions/")?)?;
            }
            None => return Some(current),
        }
    }
    None
}
