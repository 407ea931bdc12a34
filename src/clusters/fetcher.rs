/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/clusters/fetcher.rs
*
* Cluster fetchers enumerate the clusters the registry should know about.
* The single fetcher yields only the cluster the server runs in; the file
* fetcher reads a `clusters.yaml` style list of remote API servers; the multi
* fetcher merges several sources, first occurrence of a name winning.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::{Cluster, Connection};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

#[async_trait]
pub trait ClusterFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Cluster>>;
}

pub struct SingleClusterFetcher {
    name: String,
}

impl SingleClusterFetcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ClusterFetcher for SingleClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        Ok(vec![Cluster::in_cluster(self.name.clone())])
    }
}

// --- Configuration Structures for clusters.yaml ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterEntry {
    name: String,
    server: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    ca_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct ClustersFile {
    #[serde(default)]
    clusters: Vec<ClusterEntry>,
}

/// Reads the file on every fetch so edits are picked up on refresh.
pub struct FileClusterFetcher {
    path: PathBuf,
}

impl FileClusterFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(raw: &str) -> Result<Vec<Cluster>> {
        let file: ClustersFile = serde_yaml::from_str(raw)
            .map_err(|e| Error::InvalidArgument(format!("parsing clusters file: {}", e)))?;
        file.clusters
            .into_iter()
            .map(|entry| {
                if entry.name.is_empty() || entry.server.is_empty() {
                    return Err(Error::InvalidArgument(
                        "every cluster needs a name and a server".into(),
                    ));
                }
                Ok(Cluster {
                    name: entry.name,
                    connection: Connection::Remote {
                        server: entry.server,
                        token: entry.token,
                        ca_data: entry.ca_data,
                        insecure_skip_tls_verify: entry.insecure_skip_tls_verify,
                    },
                })
            })
            .collect()
    }
}

#[async_trait]
impl ClusterFetcher for FileClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Unavailable(format!("reading clusters file {}: {}", self.path.display(), e))
        })?;
        Self::parse(&raw)
    }
}

pub struct MultiClusterFetcher {
    fetchers: Vec<Arc<dyn ClusterFetcher>>,
}

impl MultiClusterFetcher {
    pub fn new(fetchers: Vec<Arc<dyn ClusterFetcher>>) -> Self {
        Self { fetchers }
    }
}

#[async_trait]
impl ClusterFetcher for MultiClusterFetcher {
    /// Any failing source fails the whole fetch, so a transient error never
    /// looks like the removal of that source's clusters.
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        let results = join_all(self.fetchers.iter().map(|f| f.fetch())).await;

        let mut seen = HashSet::new();
        let mut clusters = Vec::new();
        for result in results {
            for cluster in result? {
                if seen.insert(cluster.name.clone()) {
                    clusters.push(cluster);
                }
            }
        }
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTERS_YAML: &str = r#"
clusters:
  - name: staging
    server: https://staging.example.com:6443
    token: abc
    caData: LS0tLS1CRUdJTg==
  - name: prod
    server: https://prod.example.com:6443
    insecureSkipTlsVerify: true
"#;

    #[test]
    fn test_parse_clusters_file() {
        let clusters = FileClusterFetcher::parse(CLUSTERS_YAML).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "staging");
        match &clusters[1].connection {
            Connection::Remote {
                insecure_skip_tls_verify,
                token,
                ..
            } => {
                assert!(*insecure_skip_tls_verify);
                assert!(token.is_none());
            }
            other => panic!("unexpected connection {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_server() {
        let err = FileClusterFetcher::parse("clusters:\n  - name: broken\n    server: \"\"\n").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_multi_fetcher_keeps_first_occurrence() {
        let fetcher = MultiClusterFetcher::new(vec![
            Arc::new(SingleClusterFetcher::new("Default")),
            Arc::new(SingleClusterFetcher::new("Default")),
        ]);
        let clusters = fetcher.fetch().await.unwrap();
        assert_eq!(clusters, vec![Cluster::in_cluster("Default")]);
    }

    #[tokio::test]
    async fn test_file_fetcher_missing_file_is_unavailable() {
        let fetcher = FileClusterFetcher::new("/nonexistent/clusters.yaml");
        assert_eq!(fetcher.fetch().await.unwrap_err().kind(), "unavailable");
    }
}
