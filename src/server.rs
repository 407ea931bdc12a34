/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/server.rs
*
* The RPC surface of the core. `CoreServer` owns one instance of every
* engine and exposes the method set the API front-end calls: listing and
* fetching Flux objects, syncing, suspending, inventories, policy
* violations, session logs and CRD availability. Request and response types
* here are the wire contract; the transport only moves them.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::clusters::client::crd_gvk;
use crate::clusters::{ClusterError, ClusterRegistry, KubeClient, Principal};
use crate::config::CoreConfig;
use crate::crds::HelmRelease;
use crate::error::{Error, Result};
use crate::inventory::{helm_release_kinds, redact, InventoryEntry, InventoryResolver};
use crate::namespace_cache::NamespaceCache;
use crate::policy::{PolicyViolation, PolicyViolations, ValidationType, ViolationFilter};
use crate::primary_kinds::PrimaryKinds;
use crate::query::{ListRequest, QueryEngine};
use crate::reconcile::{ObjectTarget, ReconcileEngine};
use crate::session_logs::{ObjectStoreProvider, SessionLogReader, SessionLogRequest, SessionLogs};
use crate::suspend::SuspendController;
use futures::future::join_all;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

// --- Wire types ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    pub page_size: u32,
    pub page_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindRef {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// A Flux object as returned by `list_objects` and `get_object`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// The object serialized as JSON.
    pub payload: String,
    pub cluster_name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    /// Kinds rendered by a HelmRelease; empty for other kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inventory: Vec<KindRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListObjectsRequest {
    pub kind: String,
    pub namespace: String,
    pub cluster_name: String,
    pub label_selector: String,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListObjectsResponse {
    pub objects: Vec<ObjectSummary>,
    pub errors: Vec<ClusterError>,
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetObjectRequest {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetObjectResponse {
    pub object: ObjectSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    pub objects: Vec<ObjectTarget>,
    pub with_source: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspendRequest {
    pub objects: Vec<ObjectTarget>,
    pub suspend: bool,
    pub comment: String,
}

/// Response of the mutating methods, which return nothing on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetInventoryRequest {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub with_children: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetInventoryResponse {
    pub entries: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListPolicyValidationsRequest {
    #[serde(flatten)]
    pub filter: ViolationFilter,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPolicyValidationsResponse {
    pub violations: Vec<PolicyViolation>,
    /// Violations on this page, not across all pages.
    pub total: usize,
    pub next_page_token: String,
    pub errors: Vec<ClusterError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetPolicyValidationRequest {
    pub cluster_name: String,
    pub validation_id: String,
    pub validation_type: Option<ValidationType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPolicyValidationResponse {
    pub validation: PolicyViolation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsCrdAvailableRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsCrdAvailableResponse {
    pub clusters: BTreeMap<String, bool>,
}

fn paging(pagination: &Option<Pagination>) -> (Option<u32>, Option<String>) {
    match pagination {
        Some(p) => (
            Some(p.page_size).filter(|size| *size > 0),
            Some(p.page_token.clone()).filter(|t| !t.is_empty()),
        ),
        None => (None, None),
    }
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.to_string()).filter(|v| !v.is_empty())
}

// --- Server ---

pub struct CoreServer {
    registry: Arc<ClusterRegistry>,
    namespaces: Arc<NamespaceCache>,
    kinds: Arc<PrimaryKinds>,
    query: Arc<QueryEngine>,
    reconcile: ReconcileEngine,
    suspend: SuspendController,
    inventory: InventoryResolver,
    policies: PolicyViolations,
    session_logs: SessionLogReader,
}

impl CoreServer {
    pub fn new(
        config: &CoreConfig,
        registry: Arc<ClusterRegistry>,
        namespaces: Arc<NamespaceCache>,
        kinds: Arc<PrimaryKinds>,
        log_store: Arc<dyn ObjectStoreProvider>,
    ) -> Self {
        let query = Arc::new(QueryEngine::new(
            registry.clone(),
            namespaces.clone(),
            kinds.clone(),
        ));
        Self {
            reconcile: ReconcileEngine::new(
                registry.clone(),
                kinds.clone(),
                config.reconcile_poll_interval(),
                config.reconcile_timeout(),
            ),
            suspend: SuspendController::new(registry.clone(), kinds.clone()),
            inventory: InventoryResolver::new(registry.clone(), namespaces.clone(), kinds.clone()),
            policies: PolicyViolations::new(registry.clone(), query.clone()),
            session_logs: SessionLogReader::new(
                registry.clone(),
                namespaces.clone(),
                log_store,
                config.log_bucket_name.clone(),
                config.flux_namespace.clone(),
            )
            .with_pod_bucket(config.pod_log_bucket_name.clone()),
            registry,
            namespaces,
            kinds,
            query,
        }
    }

    #[instrument(skip_all, fields(kind = %req.kind, principal = %principal.id))]
    pub async fn list_objects(
        &self,
        principal: &Principal,
        req: ListObjectsRequest,
    ) -> Result<ListObjectsResponse> {
        let (page_size, page_token) = paging(&req.pagination);
        let listed = self
            .query
            .list(
                principal,
                &ListRequest {
                    kind: req.kind.clone(),
                    namespace: non_empty(&req.namespace),
                    cluster: non_empty(&req.cluster_name),
                    page_size,
                    page_token,
                    label_selector: non_empty(&req.label_selector),
                    field_selector: None,
                },
            )
            .await?;

        let mut objects = Vec::with_capacity(listed.objects.len());
        for item in listed.objects {
            objects.push(self.summarize(principal, &item.cluster, None, item.object).await?);
        }
        debug!(count = objects.len(), errors = listed.errors.len(), "listed objects");
        Ok(ListObjectsResponse {
            objects,
            errors: listed.errors,
            next_page_token: listed.next_page_token,
        })
    }

    #[instrument(skip_all, fields(kind = %req.kind, name = %req.name, principal = %principal.id))]
    pub async fn get_object(
        &self,
        principal: &Principal,
        req: GetObjectRequest,
    ) -> Result<GetObjectResponse> {
        let gvk = self.kinds.lookup(&req.kind)?;
        let cluster = non_empty(&req.cluster_name)
            .unwrap_or_else(|| self.registry.default_cluster_name().to_string());
        let client = self.registry.impersonated_client_for(principal, &cluster).await?;
        let mut obj = client.get(&gvk, Some(&req.namespace), &req.name).await?;
        redact(&mut obj);
        Ok(GetObjectResponse {
            object: self.summarize(principal, &cluster, Some(client), obj).await?,
        })
    }

    async fn summarize(
        &self,
        principal: &Principal,
        cluster: &str,
        client: Option<Arc<dyn KubeClient>>,
        obj: DynamicObject,
    ) -> Result<ObjectSummary> {
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let mut summary = ObjectSummary {
            payload: serde_json::to_string(&obj)?,
            cluster_name: cluster.to_string(),
            uid: obj.metadata.uid.clone().unwrap_or_default(),
            tenant: self.namespaces.tenant(cluster, &namespace).unwrap_or_default(),
            inventory: Vec::new(),
        };

        let is_release = obj.types.as_ref().is_some_and(|t| t.kind == "HelmRelease");
        if is_release {
            let client = match client {
                Some(client) => client,
                None => self.registry.impersonated_client_for(principal, cluster).await?,
            };
            let kinds = match serde_json::to_value(&obj).and_then(serde_json::from_value::<HelmRelease>) {
                Ok(hr) => helm_release_kinds(client.as_ref(), &hr).await,
                Err(e) => Err(Error::from(e).context("decoding HelmRelease")),
            };
            match kinds {
                Ok(kinds) => {
                    summary.inventory = kinds
                        .into_iter()
                        .map(|gvk| KindRef {
                            group: gvk.group,
                            version: gvk.version,
                            kind: gvk.kind,
                        })
                        .collect()
                }
                Err(e) => warn!(
                    cluster = %cluster,
                    namespace = %namespace,
                    name = obj.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "cannot summarize HelmRelease inventory"
                ),
            }
        }
        Ok(summary)
    }

    #[instrument(skip_all, fields(count = req.objects.len(), principal = %principal.id))]
    pub async fn sync(&self, principal: &Principal, req: SyncRequest) -> Result<Empty> {
        self.reconcile
            .sync(principal, &req.objects, req.with_source)
            .await?;
        Ok(Empty {})
    }

    #[instrument(skip_all, fields(count = req.objects.len(), suspend = req.suspend, principal = %principal.id))]
    pub async fn suspend(&self, principal: &Principal, req: SuspendRequest) -> Result<Empty> {
        self.suspend
            .set_suspended(principal, &req.objects, req.suspend, &req.comment)
            .await?;
        Ok(Empty {})
    }

    #[instrument(skip_all, fields(kind = %req.kind, name = %req.name, principal = %principal.id))]
    pub async fn get_inventory(
        &self,
        principal: &Principal,
        req: GetInventoryRequest,
    ) -> Result<GetInventoryResponse> {
        let cluster = non_empty(&req.cluster_name)
            .unwrap_or_else(|| self.registry.default_cluster_name().to_string());
        let entries = self
            .inventory
            .inventory(
                principal,
                &cluster,
                &req.kind,
                &req.name,
                &req.namespace,
                req.with_children,
            )
            .await?;
        Ok(GetInventoryResponse { entries })
    }

    #[instrument(skip_all, fields(principal = %principal.id))]
    pub async fn list_policy_validations(
        &self,
        principal: &Principal,
        req: ListPolicyValidationsRequest,
    ) -> Result<ListPolicyValidationsResponse> {
        let (page_size, page_token) = paging(&req.pagination);
        let listed = self
            .policies
            .list(principal, &req.filter, page_size, page_token)
            .await?;
        Ok(ListPolicyValidationsResponse {
            total: listed.violations.len(),
            violations: listed.violations,
            next_page_token: listed.next_page_token,
            errors: listed.errors,
        })
    }

    #[instrument(skip_all, fields(id = %req.validation_id, principal = %principal.id))]
    pub async fn get_policy_validation(
        &self,
        principal: &Principal,
        req: GetPolicyValidationRequest,
    ) -> Result<GetPolicyValidationResponse> {
        let validation = self
            .policies
            .get(
                principal,
                &req.cluster_name,
                &req.validation_id,
                req.validation_type,
            )
            .await?;
        Ok(GetPolicyValidationResponse { validation })
    }

    #[instrument(skip_all, fields(session = %req.session_id, principal = %principal.id))]
    pub async fn get_session_logs(
        &self,
        principal: &Principal,
        req: SessionLogRequest,
    ) -> Result<SessionLogs> {
        self.session_logs.read(principal, &req).await
    }

    /// Whether each registered cluster serves the named CRD. Asked with the
    /// server's own identity; unreachable clusters count as unavailable.
    #[instrument(skip_all, fields(crd = %req.name))]
    pub async fn is_crd_available(&self, req: IsCrdAvailableRequest) -> Result<IsCrdAvailableResponse> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("a CRD name is required".into()));
        }
        let clusters = self.registry.clusters()?;
        let gvk = crd_gvk();
        let answers = join_all(clusters.iter().map(|cluster| {
            let gvk = &gvk;
            let name = &req.name;
            async move {
                let found = match self.registry.server_client(&cluster.name).await {
                    Ok(client) => client.get(gvk, None, name).await.map(|_| true),
                    Err(e) => Err(e),
                };
                let available = match found {
                    Ok(found) => found,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => {
                        warn!(cluster = %cluster.name, crd = %name, error = %e, "cannot check CRD");
                        false
                    }
                };
                (cluster.name.clone(), available)
            }
        }))
        .await;

        Ok(IsCrdAvailableResponse {
            clusters: answers.into_iter().collect(),
        })
    }
}
