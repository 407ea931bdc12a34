/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/clusters/registry.rs
*
* The cluster registry tracks the fleet and hands out clients for it.
*
* Architecture:
* - The cluster set comes from a `ClusterFetcher`. A refresh diffs the new
*   set against the current one; any change bumps the generation, drops every
*   cached client and is broadcast to subscribers (the namespace cache).
* - The default cluster is always part of the set, even when the fetcher
*   omits it.
* - Clients are built through a `ClientFactory` and cached per (cluster,
*   principal) for a short TTL. Cache entries are stamped with the generation
*   they were built for and are never served across a cluster-set change.
* - `impersonated_client` builds a whole pool concurrently; clusters whose
*   client cannot be built are reported in the pool's error list.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::client::{ClientFactory, KubeClient};
use super::fetcher::ClusterFetcher;
use super::pool::{ClientPool, ClusterError};
use super::{Cluster, Principal, PrincipalKey};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Membership change published after a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSetUpdate {
    pub added: Vec<Cluster>,
    pub removed: Vec<Cluster>,
    pub generation: u64,
}

struct ClusterState {
    clusters: BTreeMap<String, Cluster>,
    generation: u64,
}

struct CachedClient {
    client: Arc<dyn KubeClient>,
    generation: u64,
    created: Instant,
}

/// `None` principal means the server's own identity.
type ClientKey = (String, Option<PrincipalKey>);

pub struct ClusterRegistry {
    fetcher: Arc<dyn ClusterFetcher>,
    factory: Arc<dyn ClientFactory>,
    default_cluster: String,
    client_ttl: Duration,
    refresh_retry: RetryConfig,
    state: RwLock<ClusterState>,
    clients: Mutex<HashMap<ClientKey, CachedClient>>,
    updates: broadcast::Sender<ClusterSetUpdate>,
}

impl ClusterRegistry {
    pub fn new(
        fetcher: Arc<dyn ClusterFetcher>,
        factory: Arc<dyn ClientFactory>,
        config: &CoreConfig,
    ) -> Self {
        let default_cluster = config.default_cluster_name.clone();
        let mut clusters = BTreeMap::new();
        clusters.insert(default_cluster.clone(), Cluster::in_cluster(default_cluster.clone()));
        let (updates, _) = broadcast::channel(16);

        Self {
            fetcher,
            factory,
            default_cluster,
            client_ttl: config.client_cache_ttl(),
            refresh_retry: RetryConfig::default(),
            state: RwLock::new(ClusterState {
                clusters,
                generation: 0,
            }),
            clients: Mutex::new(HashMap::new()),
            updates,
        }
    }

    pub fn with_refresh_retry(mut self, retry: RetryConfig) -> Self {
        self.refresh_retry = retry;
        self
    }

    pub fn default_cluster_name(&self) -> &str {
        &self.default_cluster
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, ClusterState>> {
        self.state
            .read()
            .map_err(|_| Error::Internal("cluster registry lock poisoned".into()))
    }

    pub fn clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.read_state()?.clusters.values().cloned().collect())
    }

    pub fn cluster(&self, name: &str) -> Result<Cluster> {
        self.read_state()?
            .clusters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::cluster_not_found(name))
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.read_state()?.generation)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterSetUpdate> {
        self.updates.subscribe()
    }

    /// Re-reads the cluster set. Returns the change, if there was one.
    pub async fn refresh(&self) -> Result<Option<ClusterSetUpdate>> {
        let fetched = retry_with_backoff(&self.refresh_retry, "fetch_clusters", |_| true, || {
            self.fetcher.fetch()
        })
        .await?;

        let mut next: BTreeMap<String, Cluster> =
            fetched.into_iter().map(|c| (c.name.clone(), c)).collect();
        next.entry(self.default_cluster.clone())
            .or_insert_with(|| Cluster::in_cluster(self.default_cluster.clone()));

        let update = {
            let mut state = self
                .state
                .write()
                .map_err(|_| Error::Internal("cluster registry lock poisoned".into()))?;

            let added: Vec<Cluster> = next
                .values()
                .filter(|c| state.clusters.get(&c.name) != Some(*c))
                .cloned()
                .collect();
            let removed: Vec<Cluster> = state
                .clusters
                .values()
                .filter(|c| next.get(&c.name) != Some(*c))
                .cloned()
                .collect();
            if added.is_empty() && removed.is_empty() {
                return Ok(None);
            }

            state.clusters = next;
            state.generation += 1;
            ClusterSetUpdate {
                added,
                removed,
                generation: state.generation,
            }
        };

        if let Ok(mut clients) = self.clients.lock() {
            clients.clear();
        }
        info!(
            added = ?update.added.iter().map(|c| &c.name).collect::<Vec<_>>(),
            removed = ?update.removed.iter().map(|c| &c.name).collect::<Vec<_>>(),
            generation = update.generation,
            "cluster set changed"
        );
        // Nobody listening is fine.
        let _ = self.updates.send(update.clone());
        Ok(Some(update))
    }

    /// Periodically refreshes the cluster set until `cancel` fires.
    pub fn start(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("cluster refresh loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = registry.refresh().await {
                            warn!(error = %e, "refreshing clusters failed, keeping previous set");
                        }
                    }
                }
            }
        })
    }

    /// A pool of clients impersonating `principal` on every known cluster.
    pub async fn impersonated_client(&self, principal: &Principal) -> Result<ClientPool> {
        let (clusters, generation) = {
            let state = self.read_state()?;
            (state.clusters.values().cloned().collect::<Vec<_>>(), state.generation)
        };

        let results = join_all(clusters.iter().map(|cluster| async move {
            (
                cluster.name.clone(),
                self.client_for(cluster, Some(principal), generation).await,
            )
        }))
        .await;

        let mut pool = ClientPool::new(generation);
        for (name, result) in results {
            match result {
                Ok(client) => pool.add(name, client),
                Err(e) => {
                    warn!(cluster = %name, error = %e, "failed to build impersonated client");
                    pool.add_error(ClusterError::new(name, e));
                }
            }
        }
        Ok(pool)
    }

    pub async fn impersonated_client_for(
        &self,
        principal: &Principal,
        cluster: &str,
    ) -> Result<Arc<dyn KubeClient>> {
        let (cluster, generation) = {
            let state = self.read_state()?;
            let cluster = state
                .clusters
                .get(cluster)
                .cloned()
                .ok_or_else(|| Error::cluster_not_found(cluster))?;
            (cluster, state.generation)
        };
        self.client_for(&cluster, Some(principal), generation).await
    }

    /// Client with the server's own identity, for cache refreshes and other
    /// internal reads.
    pub async fn server_client(&self, cluster: &str) -> Result<Arc<dyn KubeClient>> {
        let (cluster, generation) = {
            let state = self.read_state()?;
            let cluster = state
                .clusters
                .get(cluster)
                .cloned()
                .ok_or_else(|| Error::cluster_not_found(cluster))?;
            (cluster, state.generation)
        };
        self.client_for(&cluster, None, generation).await
    }

    async fn client_for(
        &self,
        cluster: &Cluster,
        principal: Option<&Principal>,
        generation: u64,
    ) -> Result<Arc<dyn KubeClient>> {
        let key: ClientKey = (cluster.name.clone(), principal.map(Principal::cache_key));
        if let Some(client) = self.cached(&key, generation) {
            return Ok(client);
        }

        let client = match principal {
            Some(p) => self.factory.impersonated_client(cluster, p).await?,
            None => self.factory.server_client(cluster).await?,
        };

        // A refresh may have happened while building; such a client is
        // returned to its caller but never cached.
        if self.generation()? == generation {
            if let Ok(mut clients) = self.clients.lock() {
                let ttl = self.client_ttl;
                clients.retain(|_, c| c.created.elapsed() < ttl);
                clients.insert(
                    key,
                    CachedClient {
                        client: client.clone(),
                        generation,
                        created: Instant::now(),
                    },
                );
            }
        }
        Ok(client)
    }

    fn cached(&self, key: &ClientKey, generation: u64) -> Option<Arc<dyn KubeClient>> {
        let clients = self.clients.lock().ok()?;
        clients
            .get(key)
            .filter(|c| c.generation == generation && c.created.elapsed() < self.client_ttl)
            .map(|c| c.client.clone())
    }
}
