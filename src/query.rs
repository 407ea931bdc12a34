/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/query.rs
*
* The fan-out query engine. A list runs one task per target cluster, each
* with the caller's impersonated client, and joins them at the end. Clusters
* that fail are reported in `errors` next to whatever the others returned.
*
* Pagination walks the namespaces of each cluster the caller may read (the
* namespace cache's per-principal view). The state of one cluster is a
* `PageToken` (namespace index, namespace name, server continuation); the
* token handed to the caller is the base64 JSON map of those per cluster. A
* cluster missing from a non-empty token has nothing left to return.
*
* An unpaged list without a namespace is one cluster-wide call; when the
* caller may not list at the cluster scope it falls back to the same
* namespace walk. A namespace that refuses the caller mid-walk is skipped
* and reported as an error of its cluster.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::clusters::{ClusterError, ClusterRegistry, KubeClient, ListOptions, Principal};
use crate::error::{Error, Result};
use crate::inventory::redact;
use crate::namespace_cache::NamespaceCache;
use crate::primary_kinds::PrimaryKinds;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::join_all;
use kube::api::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Position of a paginated walk inside one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub namespace_index: usize,
    pub namespace: String,
    pub k8s_page_token: String,
}

impl PageToken {
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        decode_json(raw)
    }
}

/// Page tokens of every cluster that still has items to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusteredPageToken(pub BTreeMap<String, PageToken>);

impl ClusteredPageToken {
    /// An empty map encodes to the empty string, meaning "no more pages".
    pub fn encode(&self) -> Result<String> {
        if self.0.is_empty() {
            return Ok(String::new());
        }
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        decode_json(raw)
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(raw)
        .map_err(|e| Error::InvalidArgument(format!("malformed page token: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidArgument(format!("malformed page token: {}", e)))
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub kind: String,
    pub namespace: Option<String>,
    pub cluster: Option<String>,
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClusterObject {
    pub cluster: String,
    pub object: DynamicObject,
}

#[derive(Debug, Default)]
pub struct ListResult {
    pub objects: Vec<ClusterObject>,
    pub errors: Vec<ClusterError>,
    pub next_page_token: String,
}

pub struct QueryEngine {
    registry: Arc<ClusterRegistry>,
    namespaces: Arc<NamespaceCache>,
    kinds: Arc<PrimaryKinds>,
}

impl QueryEngine {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        namespaces: Arc<NamespaceCache>,
        kinds: Arc<PrimaryKinds>,
    ) -> Self {
        Self {
            registry,
            namespaces,
            kinds,
        }
    }

    pub async fn list(&self, principal: &Principal, req: &ListRequest) -> Result<ListResult> {
        let gvk = self.kinds.lookup(&req.kind)?;
        self.list_gvk(principal, &gvk, req).await
    }

    pub async fn list_gvk(
        &self,
        principal: &Principal,
        gvk: &GroupVersionKind,
        req: &ListRequest,
    ) -> Result<ListResult> {
        let raw_token = req.page_token.as_deref().unwrap_or_default();
        let page_size = req.page_size.filter(|size| *size > 0);
        if page_size.is_none() && !raw_token.is_empty() {
            return Err(Error::InvalidArgument(
                "a page token needs a page size".into(),
            ));
        }
        let tokens = ClusteredPageToken::decode(raw_token)?;

        let pool = self.registry.impersonated_client(principal).await?;
        let mut result = ListResult {
            errors: pool
                .errors()
                .iter()
                .filter(|e| req.cluster.as_ref().map_or(true, |c| *c == e.cluster))
                .cloned()
                .collect(),
            ..Default::default()
        };

        if let Some(cluster) = &req.cluster {
            if pool.client(cluster).is_err() && result.errors.is_empty() {
                result
                    .errors
                    .push(ClusterError::new(cluster.clone(), Error::cluster_not_found(cluster)));
            }
        }

        let targets: Vec<(String, Arc<dyn KubeClient>, Option<PageToken>)> = pool
            .clients()
            .filter(|(name, _)| req.cluster.as_deref().map_or(true, |c| c == *name))
            .filter_map(|(name, client)| {
                let start = match page_size {
                    None => None,
                    Some(_) if tokens.0.is_empty() => Some(PageToken::default()),
                    // Absent from a continuing token: already exhausted.
                    Some(_) => Some(tokens.0.get(name)?.clone()),
                };
                Some((name.to_string(), client.clone(), start))
            })
            .collect();

        let outcomes = join_all(targets.into_iter().map(|(cluster, client, start)| async move {
            let outcome = match (page_size, start) {
                (Some(size), Some(start)) => {
                    self.list_page(principal, client.as_ref(), &cluster, gvk, req, size, start)
                        .await
                }
                _ => self.list_all(principal, client.as_ref(), &cluster, gvk, req).await,
            };
            (cluster, outcome)
        }))
        .await;

        let mut next = ClusteredPageToken::default();
        for (cluster, outcome) in outcomes {
            match outcome {
                Ok(page) => {
                    debug!(cluster = %cluster, kind = %gvk.kind, count = page.items.len(), "listed objects");
                    result.objects.extend(page.items.into_iter().map(|mut object| {
                        redact(&mut object);
                        ClusterObject {
                            cluster: cluster.clone(),
                            object,
                        }
                    }));
                    result
                        .errors
                        .extend(page.skipped.into_iter().map(|e| ClusterError::new(cluster.clone(), e)));
                    if let Some(token) = page.next {
                        next.0.insert(cluster, token);
                    }
                }
                Err(e) => {
                    warn!(cluster = %cluster, kind = %gvk.kind, error = %e, "list failed on cluster");
                    result.errors.push(ClusterError::new(cluster, e));
                }
            }
        }
        result.next_page_token = next.encode()?;
        Ok(result)
    }

    fn options(req: &ListRequest) -> ListOptions {
        ListOptions {
            label_selector: req.label_selector.clone(),
            field_selector: req.field_selector.clone(),
            ..Default::default()
        }
    }

    /// Names of the namespaces to walk on `cluster`: the requested one, or
    /// every namespace the caller may read.
    async fn walk_order(
        &self,
        principal: &Principal,
        client: &dyn KubeClient,
        cluster: &str,
        req: &ListRequest,
    ) -> Result<Vec<String>> {
        if let Some(ns) = req.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            return Ok(vec![ns.to_string()]);
        }
        Ok(self
            .namespaces
            .user_namespaces(principal, cluster, client)
            .await?
            .iter()
            .filter_map(|ns| ns.metadata.name.clone())
            .collect())
    }

    async fn list_all(
        &self,
        principal: &Principal,
        client: &dyn KubeClient,
        cluster: &str,
        gvk: &GroupVersionKind,
        req: &ListRequest,
    ) -> Result<ClusterPage> {
        let opts = Self::options(req);
        let namespace = req.namespace.as_deref().filter(|ns| !ns.is_empty());
        match client.list(gvk, namespace, &opts).await {
            Ok(list) => {
                return Ok(ClusterPage {
                    items: list.items,
                    ..Default::default()
                })
            }
            Err(Error::PermissionDenied(message)) if namespace.is_none() => {
                debug!(cluster = %cluster, kind = %gvk.kind, reason = %message, "cluster-wide list refused, walking namespaces");
            }
            Err(e) => return Err(e),
        }

        let mut page = ClusterPage::default();
        for ns in self.walk_order(principal, client, cluster, req).await? {
            match client.list(gvk, Some(&ns), &opts).await {
                Ok(list) => page.items.extend(list.items),
                Err(e @ Error::PermissionDenied(_)) => page.skip(cluster, &ns, e),
                Err(e) => return Err(e),
            }
        }
        Ok(page)
    }

    /// One page from one cluster, walking its namespaces from `start`.
    #[allow(clippy::too_many_arguments)]
    async fn list_page(
        &self,
        principal: &Principal,
        client: &dyn KubeClient,
        cluster: &str,
        gvk: &GroupVersionKind,
        req: &ListRequest,
        page_size: u32,
        start: PageToken,
    ) -> Result<ClusterPage> {
        let namespaces = self.walk_order(principal, client, cluster, req).await?;
        let (mut index, mut continue_token) = resume_position(&namespaces, start);
        let mut items_left = page_size as usize;
        let mut page = ClusterPage::default();

        while index < namespaces.len() {
            let opts = ListOptions {
                limit: Some(items_left as u32),
                continue_token: Some(continue_token).filter(|t| !t.is_empty()),
                ..Self::options(req)
            };
            match client.list(gvk, Some(&namespaces[index]), &opts).await {
                Ok(list) => {
                    items_left = items_left.saturating_sub(list.items.len());
                    page.items.extend(list.items);
                    if let Some(next) = list.continue_token {
                        page.next = Some(PageToken {
                            namespace_index: index,
                            namespace: namespaces[index].clone(),
                            k8s_page_token: next,
                        });
                        return Ok(page);
                    }
                }
                Err(e @ Error::PermissionDenied(_)) => page.skip(cluster, &namespaces[index], e),
                Err(e) => return Err(e),
            }

            index += 1;
            continue_token = String::new();
            if items_left == 0 {
                page.next = namespaces.get(index).map(|ns| PageToken {
                    namespace_index: index,
                    namespace: ns.clone(),
                    k8s_page_token: String::new(),
                });
                return Ok(page);
            }
        }
        Ok(page)
    }
}

/// What one cluster contributed to a list.
#[derive(Debug, Default)]
struct ClusterPage {
    items: Vec<DynamicObject>,
    next: Option<PageToken>,
    /// Namespaces that refused the caller.
    skipped: Vec<Error>,
}

impl ClusterPage {
    fn skip(&mut self, cluster: &str, namespace: &str, err: Error) {
        warn!(cluster = %cluster, namespace = %namespace, error = %err, "namespace refused the caller, skipping");
        self.skipped.push(err.context(format!("namespace {}", namespace)));
    }
}

/// Where to resume a walk. A token whose namespace disappeared restarts at
/// the first namespace sorting after it, without a server continuation.
fn resume_position(namespaces: &[String], token: PageToken) -> (usize, String) {
    if token.namespace.is_empty() {
        return (token.namespace_index, token.k8s_page_token);
    }
    if namespaces.get(token.namespace_index) == Some(&token.namespace) {
        return (token.namespace_index, token.k8s_page_token);
    }
    if let Some(index) = namespaces.iter().position(|ns| *ns == token.namespace) {
        return (index, token.k8s_page_token);
    }
    let index = namespaces
        .iter()
        .position(|ns| *ns > token.namespace)
        .unwrap_or(namespaces.len());
    (index, String::new())
}
