/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/clusters/pool.rs
*
* The per-request set of impersonated clients, one per reachable cluster.
* Clusters whose client could not be built are recorded as errors instead of
* failing the request.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::client::KubeClient;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A failure attributed to one cluster, surfaced in response `errors[]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterError {
    pub cluster: String,
    pub message: String,
}

impl ClusterError {
    pub fn new(cluster: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            cluster: cluster.into(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ClientPool {
    clients: BTreeMap<String, Arc<dyn KubeClient>>,
    errors: Vec<ClusterError>,
    generation: u64,
}

impl ClientPool {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    pub(crate) fn add(&mut self, cluster: String, client: Arc<dyn KubeClient>) {
        self.clients.insert(cluster, client);
    }

    pub(crate) fn add_error(&mut self, error: ClusterError) {
        self.errors.push(error);
    }

    pub fn client(&self, cluster: &str) -> Result<Arc<dyn KubeClient>> {
        if let Some(client) = self.clients.get(cluster) {
            return Ok(client.clone());
        }
        match self.errors.iter().find(|e| e.cluster == cluster) {
            Some(e) => Err(Error::Unavailable(format!("cluster {}: {}", cluster, e.message))),
            None => Err(Error::cluster_not_found(cluster)),
        }
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn clients(&self) -> impl Iterator<Item = (&str, &Arc<dyn KubeClient>)> {
        self.clients.iter().map(|(name, client)| (name.as_str(), client))
    }

    pub fn errors(&self) -> &[ClusterError] {
        &self.errors
    }

    /// Registry generation the pool was built against.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("clusters", &self.clients.keys().collect::<Vec<_>>())
            .field("errors", &self.errors)
            .field("generation", &self.generation)
            .finish()
    }
}
