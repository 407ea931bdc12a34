/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/namespace_cache.rs
*
* Per-cluster snapshot of the namespaces that exist, read with the server's
* own identity. The query engine walks these snapshots for paginated lists,
* the inventory resolver reads tenant labels from them and the session log
* reader finds the Flux install namespace here.
*
* A snapshot is replaced whole (an `Arc` swap under the write lock), so a
* reader sees either the previous list or the new one. A failed refresh
* keeps whatever was there before.
*
* On top of the snapshots sits a per-principal view: the namespaces of a
* cluster that principal may read, decided by a `NamespaceChecker` with the
* principal's own client. A view is reused until its TTL expires or the
* snapshot it was derived from is replaced.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::clusters::client::{into_typed, namespace_gvk};
use crate::clusters::{
    ClusterRegistry, ClusterSetUpdate, KubeClient, ListOptions, Principal, PrincipalKey,
};
use crate::error::{Error, Result};
use crate::namespace_access::NamespaceChecker;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Namespace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TENANT_LABEL: &str = "toolkit.fluxcd.io/tenant";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

const DEFAULT_USER_TTL: Duration = Duration::from_secs(30);

struct UserNamespaces {
    source: Arc<Vec<Namespace>>,
    accessible: Arc<Vec<Namespace>>,
    resolved: Instant,
}

pub struct NamespaceCache {
    registry: Arc<ClusterRegistry>,
    interval: Duration,
    snapshots: RwLock<HashMap<String, Arc<Vec<Namespace>>>>,
    checker: NamespaceChecker,
    user_ttl: Duration,
    users: RwLock<HashMap<(PrincipalKey, String), UserNamespaces>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NamespaceCache {
    pub fn new(registry: Arc<ClusterRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            snapshots: RwLock::new(HashMap::new()),
            checker: NamespaceChecker::default(),
            user_ttl: DEFAULT_USER_TTL,
            users: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_checker(mut self, checker: NamespaceChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_user_ttl(mut self, ttl: Duration) -> Self {
        self.user_ttl = ttl;
        self
    }

    /// Spawns the background refresher. It polls every cluster on the
    /// configured interval and follows cluster-set changes.
    pub fn start(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let cancel = self.cancel.clone();
        let mut updates = self.registry.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => cache.refresh_all().await,
                    update = updates.recv() => match update {
                        Ok(update) => cache.apply_update(update).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "missed cluster updates, refreshing every cluster");
                            cache.refresh_all().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("namespace cache refresher stopped");
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Cancels the refresher and waits for it to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn refresh_all(&self) {
        let clusters = match self.registry.clusters() {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "cannot read cluster set for namespace refresh");
                return;
            }
        };
        join_all(clusters.iter().map(|cluster| async move {
            if let Err(e) = self.force_refresh(&cluster.name).await {
                warn!(cluster = %cluster.name, error = %e, "namespace refresh failed, keeping previous snapshot");
            }
        }))
        .await;
    }

    /// Refreshes one cluster and returns once the new snapshot is in place.
    pub async fn force_refresh(&self, cluster: &str) -> Result<()> {
        let client = self.registry.server_client(cluster).await?;
        let list = client
            .list(&namespace_gvk(), None, &ListOptions::default())
            .await?;
        let namespaces: Vec<Namespace> = into_typed(list.items)?;
        debug!(cluster = %cluster, count = namespaces.len(), "namespace snapshot refreshed");

        if let Ok(mut snapshots) = self.snapshots.write() {
            snapshots.insert(cluster.to_string(), Arc::new(namespaces));
        }
        Ok(())
    }

    async fn apply_update(&self, update: ClusterSetUpdate) {
        if let Ok(mut snapshots) = self.snapshots.write() {
            for cluster in &update.removed {
                snapshots.remove(&cluster.name);
            }
        }
        if let Ok(mut users) = self.users.write() {
            users.retain(|(_, cluster), _| update.removed.iter().all(|c| c.name != *cluster));
        }
        join_all(update.added.iter().map(|cluster| async move {
            if let Err(e) = self.force_refresh(&cluster.name).await {
                warn!(cluster = %cluster.name, error = %e, "namespace refresh of new cluster failed");
            }
        }))
        .await;
    }

    fn snapshot(&self, cluster: &str) -> Option<Arc<Vec<Namespace>>> {
        self.snapshots.read().ok().and_then(|s| s.get(cluster).cloned())
    }

    /// Current snapshot, in server order. Empty for unknown clusters.
    pub fn namespaces(&self, cluster: &str) -> Arc<Vec<Namespace>> {
        self.snapshot(cluster).unwrap_or_default()
    }

    /// The snapshot of `cluster`, loading it first when the cluster has
    /// none yet (it joined between polls, or its last refresh failed).
    pub async fn namespaces_or_refresh(&self, cluster: &str) -> Result<Arc<Vec<Namespace>>> {
        if let Some(snapshot) = self.snapshot(cluster) {
            return Ok(snapshot);
        }
        self.force_refresh(cluster)
            .await
            .map_err(|e| e.context(format!("loading namespaces of cluster {}", cluster)))?;
        self.snapshot(cluster).ok_or_else(|| {
            Error::Unavailable(format!("no namespace snapshot for cluster {}", cluster))
        })
    }

    /// Namespaces of `cluster` that `principal` may read. `client` must be
    /// the principal's impersonated client for that cluster.
    pub async fn user_namespaces(
        &self,
        principal: &Principal,
        cluster: &str,
        client: &dyn KubeClient,
    ) -> Result<Arc<Vec<Namespace>>> {
        let snapshot = self.namespaces_or_refresh(cluster).await?;
        let key = (principal.cache_key(), cluster.to_string());

        let cached = self.users.read().ok().and_then(|users| {
            users
                .get(&key)
                .filter(|u| Arc::ptr_eq(&u.source, &snapshot) && u.resolved.elapsed() < self.user_ttl)
                .map(|u| u.accessible.clone())
        });
        if let Some(accessible) = cached {
            return Ok(accessible);
        }

        let accessible = Arc::new(self.checker.filter_accessible(client, &snapshot).await?);
        debug!(
            cluster = %cluster,
            principal = %principal.id,
            accessible = accessible.len(),
            total = snapshot.len(),
            "resolved user namespaces"
        );
        if let Ok(mut users) = self.users.write() {
            let ttl = self.user_ttl;
            users.retain(|_, u| u.resolved.elapsed() < ttl);
            users.insert(
                key,
                UserNamespaces {
                    source: snapshot,
                    accessible: accessible.clone(),
                    resolved: Instant::now(),
                },
            );
        }
        Ok(accessible)
    }

    pub fn tenant(&self, cluster: &str, namespace: &str) -> Option<String> {
        self.namespaces(cluster)
            .iter()
            .find(|ns| ns.metadata.name.as_deref() == Some(namespace))
            .and_then(|ns| ns.metadata.labels.as_ref())
            .and_then(|labels| labels.get(TENANT_LABEL).cloned())
            .filter(|tenant| !tenant.is_empty())
    }

    /// The namespace Flux is installed in on `cluster`.
    pub fn flux_namespace(&self, cluster: &str, fallback: &str) -> String {
        self.namespaces(cluster)
            .iter()
            .find(|ns| {
                ns.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(PART_OF_LABEL))
                    .is_some_and(|v| v == "flux")
            })
            .and_then(|ns| ns.metadata.name.clone())
            .unwrap_or_else(|| fallback.to_string())
    }
}
