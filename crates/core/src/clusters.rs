//! YAML registry of the clusters the engine can inspect.
//!
//! ```yaml
//! clusters:
//!   - name: demo
//!     server: https://10.0.0.1:6443
//!     token_file: /var/run/secrets/demo-token
//!     ca_file: /etc/kinspect/demo-ca.pem
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Connection details for one cluster's API server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub name: String,
    /// API server base URL.
    pub server: String,
    /// Bearer token; takes precedence over `token_file`.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    /// PEM bundle used to verify the API server certificate.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

impl ClusterEndpoint {
    /// Resolve the bearer token, reading `token_file` when no inline token is set.
    pub fn bearer_token(&self) -> Result<Option<String>, ConfigError> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        match &self.token_file {
            Some(path) => std::fs::read_to_string(path)
                .map(|t| Some(t.trim().to_string()))
                .map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterRegistry {
    #[serde(default)]
    pub clusters: Vec<ClusterEndpoint>,
}

impl ClusterRegistry {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn get(&self, name: &str) -> Option<&ClusterEndpoint> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.clusters.iter().map(|c| c.name.as_str()).collect()
    }
}
