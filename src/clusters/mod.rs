/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/clusters/mod.rs
*
* Data model for the fleet: the clusters the core talks to, and the principal
* on whose behalf each request runs. The submodules hold the client seam
* (`client`), the cluster fetchers (`fetcher`), the per-request client pool
* (`pool`) and the registry that ties them together (`registry`).
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod client;
pub mod fetcher;
pub mod pool;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use client::{ClientFactory, KubeClient, KubeClientFactory, ListOptions, ObjectList};
pub use fetcher::{ClusterFetcher, FileClusterFetcher, MultiClusterFetcher, SingleClusterFetcher};
pub use pool::{ClientPool, ClusterError};
pub use registry::{ClusterRegistry, ClusterSetUpdate};

/// How the core reaches a cluster's API server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Connection {
    /// Service-account credentials when running in a pod, the local
    /// kubeconfig otherwise.
    InCluster,
    #[serde(rename_all = "camelCase")]
    Remote {
        server: String,
        #[serde(default)]
        token: Option<String>,
        /// Base64 encoded PEM bundle.
        #[serde(default)]
        ca_data: Option<String>,
        #[serde(default)]
        insecure_skip_tls_verify: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub connection: Connection,
}

impl Cluster {
    pub fn in_cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: Connection::InCluster,
        }
    }
}

/// The authenticated caller. Supplied by the upstream authenticator and only
/// ever read by the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            id: id.into(),
            groups,
        }
    }

    /// Cache key that distinguishes principals with the same id but
    /// different group memberships. Group order does not matter; group names
    /// are kept whole since directory DNs contain commas.
    pub(crate) fn cache_key(&self) -> PrincipalKey {
        let mut groups = self.groups.clone();
        groups.sort();
        groups.dedup();
        (self.id.clone(), groups)
    }
}

pub(crate) type PrincipalKey = (String, Vec<String>);
