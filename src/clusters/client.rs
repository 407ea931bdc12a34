/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/clusters/client.rs
*
* The seam between the engines and the Kubernetes API. Engines only use the
* `KubeClient` trait (list, get, merge-patch over dynamic objects, and the
* rules review behind namespace filtering), which lets the same code run
* against a real API server or an in-memory fake.
*
* `KubeClientFactory` builds real clients. Every client it hands out for a
* principal carries that principal as impersonation identity; kube turns the
* `impersonate` fields of the auth info into Impersonate-User and
* Impersonate-Group headers on every request.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::{Cluster, Connection, Principal};
use crate::adapter::type_meta;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceRule, SelfSubjectRulesReview, SelfSubjectRulesReviewSpec,
};
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// --- Well-known kinds ---

pub fn namespace_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Namespace")
}

pub fn secret_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Secret")
}

pub fn event_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Event")
}

pub fn crd_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition")
}

// --- Client seam ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<DynamicObject>,
    /// Server continuation; `None` once the listing is exhausted.
    pub continue_token: Option<String>,
}

/// A client bound to one cluster and one identity.
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Lists `gvk` in `namespace`, or across all namespaces when `None`.
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> Result<ObjectList>;

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject>;

    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject>;

    /// What this client's identity may do in `namespace`.
    async fn resource_rules(&self, namespace: &str) -> Result<Vec<ResourceRule>>;
}

/// Fetches an object and converts it into a typed struct.
pub async fn get_typed<K: DeserializeOwned>(
    client: &dyn KubeClient,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<K> {
    let obj = client.get(gvk, namespace, name).await?;
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Converts listed dynamic objects into typed structs.
pub fn into_typed<K: DeserializeOwned>(items: Vec<DynamicObject>) -> Result<Vec<K>> {
    items
        .into_iter()
        .map(|obj| -> Result<K> { Ok(serde_json::from_value(serde_json::to_value(obj)?)?) })
        .collect()
}

// --- kube-backed implementation ---

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

/// List items of built-in kinds come back without apiVersion/kind.
fn with_types(mut obj: DynamicObject, gvk: &GroupVersionKind) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(type_meta(gvk));
    }
    obj
}

#[async_trait]
impl KubeClient for KubeClusterClient {
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> Result<ObjectList> {
        let mut params = ListParams::default();
        if let Some(labels) = &opts.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &opts.field_selector {
            params = params.fields(fields);
        }
        if let Some(limit) = opts.limit {
            params = params.limit(limit);
        }
        if let Some(token) = opts.continue_token.as_deref().filter(|t| !t.is_empty()) {
            params = params.continue_token(token);
        }

        let list = self.api(gvk, namespace).list(&params).await?;
        Ok(ObjectList {
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
            items: list.items.into_iter().map(|o| with_types(o, gvk)).collect(),
        })
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let obj = self.api(gvk, namespace).get(name).await?;
        Ok(with_types(obj, gvk))
    }

    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let obj = self
            .api(gvk, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(with_types(obj, gvk))
    }

    async fn resource_rules(&self, namespace: &str) -> Result<Vec<ResourceRule>> {
        let review = SelfSubjectRulesReview {
            spec: SelfSubjectRulesReviewSpec {
                namespace: Some(namespace.to_string()),
            },
            ..Default::default()
        };
        let reviews: Api<SelfSubjectRulesReview> = Api::all(self.client.clone());
        let review = reviews.create(&PostParams::default(), &review).await?;
        let status = review.status.unwrap_or_default();
        if status.incomplete {
            debug!(namespace = %namespace, error = ?status.evaluation_error, "incomplete rules review");
        }
        Ok(status.resource_rules)
    }
}

// --- Client construction ---

/// Identity sent in the impersonation headers. Empty prefixes are omitted.
pub fn impersonation_identity(
    principal: &Principal,
    username_prefix: &str,
    groups_prefix: &str,
) -> (String, Vec<String>) {
    let user = format!("{}{}", username_prefix, principal.id);
    let groups = principal
        .groups
        .iter()
        .map(|g| format!("{}{}", groups_prefix, g))
        .collect();
    (user, groups)
}

/// Builds clients for a cluster, either with the server's own identity or
/// impersonating a principal.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn server_client(&self, cluster: &Cluster) -> Result<Arc<dyn KubeClient>>;

    async fn impersonated_client(
        &self,
        cluster: &Cluster,
        principal: &Principal,
    ) -> Result<Arc<dyn KubeClient>>;
}

pub struct KubeClientFactory {
    username_prefix: String,
    groups_prefix: String,
    timeout: Duration,
}

impl KubeClientFactory {
    pub fn new(username_prefix: &str, groups_prefix: &str, timeout: Duration) -> Self {
        Self {
            username_prefix: username_prefix.to_string(),
            groups_prefix: groups_prefix.to_string(),
            timeout,
        }
    }

    async fn base_config(&self, cluster: &Cluster) -> Result<Config> {
        let mut config = match &cluster.connection {
            Connection::InCluster => Config::infer().await?,
            Connection::Remote {
                server,
                token,
                ca_data,
                insecure_skip_tls_verify,
            } => {
                let kubeconfig: Kubeconfig = serde_json::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "Config",
                    "clusters": [{
                        "name": cluster.name,
                        "cluster": {
                            "server": server,
                            "certificate-authority-data": ca_data,
                            "insecure-skip-tls-verify": insecure_skip_tls_verify,
                        }
                    }],
                    "users": [{"name": cluster.name, "user": {"token": token}}],
                    "contexts": [{
                        "name": cluster.name,
                        "context": {"cluster": cluster.name, "user": cluster.name}
                    }],
                    "current-context": cluster.name,
                }))
                .map_err(|e| {
                    Error::InvalidArgument(format!(
                        "invalid connection settings for cluster {}: {}",
                        cluster.name, e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
        };
        config.connect_timeout = Some(self.timeout);
        config.read_timeout = Some(self.timeout);
        config.write_timeout = Some(self.timeout);
        Ok(config)
    }

    fn build(config: Config, cluster: &Cluster) -> Result<Arc<dyn KubeClient>> {
        let client = Client::try_from(config).map_err(|e| {
            Error::Unavailable(format!("creating client for cluster {}: {}", cluster.name, e))
        })?;
        Ok(Arc::new(KubeClusterClient::new(client)))
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn server_client(&self, cluster: &Cluster) -> Result<Arc<dyn KubeClient>> {
        let config = self.base_config(cluster).await?;
        Self::build(config, cluster)
    }

    async fn impersonated_client(
        &self,
        cluster: &Cluster,
        principal: &Principal,
    ) -> Result<Arc<dyn KubeClient>> {
        if principal.id.is_empty() {
            return Err(Error::PermissionDenied("no principal id to impersonate".into()));
        }
        let mut config = self.base_config(cluster).await?;
        let (user, groups) =
            impersonation_identity(principal, &self.username_prefix, &self.groups_prefix);
        debug!(cluster = %cluster.name, user = %user, groups = ?groups, "building impersonated client");
        config.auth_info.impersonate = Some(user);
        config.auth_info.impersonate_groups = (!groups.is_empty()).then_some(groups);
        Self::build(config, cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impersonation_with_prefixes() {
        let principal = Principal::new("anne", vec!["devs".into(), "ops".into()]);
        let (user, groups) = impersonation_identity(&principal, "oidc:", "oidc-group:");
        assert_eq!(user, "oidc:anne");
        assert_eq!(groups, vec!["oidc-group:devs", "oidc-group:ops"]);
    }

    #[test]
    fn test_empty_prefixes_are_omitted() {
        let principal = Principal::new("anne", vec!["devs".into()]);
        let (user, groups) = impersonation_identity(&principal, "", "");
        assert_eq!(user, "anne");
        assert_eq!(groups, vec!["devs"]);
    }

    #[test]
    fn test_user_prefix_only_leaves_groups_bare() {
        let principal = Principal::new("anne", vec!["devs".into()]);
        let (user, groups) = impersonation_identity(&principal, "sso:", "");
        assert_eq!(user, "sso:anne");
        assert_eq!(groups, vec!["devs"]);
    }

    #[test]
    fn test_well_known_kinds() {
        assert_eq!(type_meta(&secret_gvk()).api_version, "v1");
        assert_eq!(
            type_meta(&crd_gvk()).api_version,
            "apiextensions.k8s.io/v1"
        );
    }

    #[test]
    fn test_into_typed_namespaces() {
        let items: Vec<DynamicObject> = vec![serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "ns1", "labels": {"toolkit.fluxcd.io/tenant": "team-a"}}
        }))
        .unwrap()];
        let namespaces: Vec<k8s_openapi::api::core::v1::Namespace> = into_typed(items).unwrap();
        assert_eq!(namespaces[0].metadata.name.as_deref(), Some("ns1"));
    }
}
