/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/inventory.rs
*
* Resolves the inventory of a Flux object into live cluster objects.
*
* Architecture:
* - Kustomizations (and any kind with a Flux-style `status.inventory`) list
*   their managed objects as `<namespace>_<name>_<group>_<kind>` ids plus a
*   version.
* - HelmReleases keep theirs in the Helm storage secret
*   `sh.helm.release.v1.<release>.v<revision>`. Its `release` field is base64
*   text of a (possibly gzipped) JSON record whose `manifest` is the rendered
*   multi-document YAML.
* - Every declared object is fetched with the caller's client, concurrently.
*   Objects that cannot be read are logged and skipped. Secrets are redacted
*   before anything is serialized.
* - With `with_children`, workloads are expanded into the ReplicaSets and
*   Pods they own, matched by owner reference uid.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::adapter::{set_nested, FluxObject};
use crate::clusters::client::{get_typed, secret_gvk};
use crate::clusters::{ClusterRegistry, KubeClient, ListOptions, Principal};
use crate::crds::{HelmRelease, Kustomization};
use crate::error::{Error, Result};
use crate::health::{classify, Health};
use crate::namespace_cache::NamespaceCache;
use crate::primary_kinds::PrimaryKinds;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use futures::future::{join_all, BoxFuture, FutureExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// A hydrated inventory object.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryEntry {
    pub payload: Value,
    pub cluster_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    pub health: Health,
    pub children: Vec<InventoryEntry>,
}

/// Where to find a declared object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub gvk: GroupVersionKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    /// Parses a Flux inventory id. The core group may be written as an
    /// empty segment or as `core`.
    pub fn parse(id: &str, version: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('_').collect();
        let [namespace, name, group, kind] = parts.as_slice() else {
            return Err(Error::InvalidArgument(format!(
                "unable to parse inventory id {}",
                id
            )));
        };
        if name.is_empty() || kind.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "unable to parse inventory id {}",
                id
            )));
        }
        let group = if *group == "core" { "" } else { *group };
        Ok(Self {
            gvk: GroupVersionKind::gvk(group, version, kind),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    fn from_manifest(obj: &Value) -> Option<Self> {
        let api_version = obj["apiVersion"].as_str()?;
        let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
        Some(Self {
            gvk: GroupVersionKind::gvk(group, version, obj["kind"].as_str()?),
            namespace: obj["metadata"]["namespace"].as_str().unwrap_or_default().to_string(),
            name: obj["metadata"]["name"].as_str()?.to_string(),
        })
    }
}

/// Replaces the whole `data` map of a Secret. Other kinds are left alone.
pub fn redact(obj: &mut DynamicObject) {
    let is_secret = obj
        .types
        .as_ref()
        .is_some_and(|t| t.kind == "Secret" && t.api_version == "v1");
    if !is_secret {
        return;
    }
    if let Value::Object(map) = &mut obj.data {
        map.remove("stringData");
        map.insert("data".to_string(), json!({"redacted": null}));
    } else {
        obj.data = json!({"data": {"redacted": null}});
    }
}

// --- Declared objects ---

fn kustomization_refs(ks: &Kustomization) -> Vec<ObjectRef> {
    let entries = ks
        .status
        .as_ref()
        .and_then(|s| s.inventory.as_ref())
        .map(|inv| inv.entries.as_slice())
        .unwrap_or_default();
    entries
        .iter()
        .filter_map(|entry| {
            if entry.v.is_empty() {
                warn!(id = %entry.id, "inventory entry without version, skipping");
                return None;
            }
            ObjectRef::parse(&entry.id, &entry.v)
                .map_err(|e| warn!(error = %e, "skipping malformed inventory entry"))
                .ok()
        })
        .collect()
}

/// Flux-style inventory of any other kind, read by path.
fn status_inventory_refs(obj: &Value) -> Vec<ObjectRef> {
    let Some(entries) = obj.pointer("/status/inventory/entries").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry["id"].as_str()?;
            let version = entry["v"].as_str().filter(|v| !v.is_empty())?;
            ObjectRef::parse(id, version)
                .map_err(|e| warn!(error = %e, "skipping malformed inventory entry"))
                .ok()
        })
        .collect()
}

#[derive(Deserialize)]
struct ReleaseStorage {
    #[serde(default)]
    manifest: String,
}

/// Manifest of the Helm release stored in the `release` field.
pub fn decode_release(raw: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::Internal(format!("helm release payload is not text: {}", e)))?;
    let mut bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| Error::Internal(format!("decoding helm release payload: {}", e)))?;

    if bytes.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| Error::Internal(format!("decompressing helm release payload: {}", e)))?;
        bytes = inflated;
    }

    let storage: ReleaseStorage = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Internal(format!("decoding helm release record: {}", e)))?;
    Ok(storage.manifest)
}

/// Splits a rendered manifest into objects, stamping `default_namespace` on
/// those without one.
pub fn parse_manifest(manifest: &str, default_namespace: &str) -> Result<Vec<Value>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let doc = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::Internal(format!("reading helm manifest: {}", e)))?;
        if doc.is_null() {
            continue;
        }
        let mut obj = serde_json::to_value(doc)?;
        if obj["kind"].as_str().is_none() {
            continue;
        }
        if obj["metadata"]["namespace"].as_str().unwrap_or_default().is_empty() {
            set_nested(&mut obj, &["metadata", "namespace"], json!(default_namespace));
        }
        objects.push(obj);
    }
    Ok(objects)
}

/// Objects rendered by the last release of `hr`. Failed installs and
/// releases targeting a remote cluster have none we can see.
pub async fn helm_release_objects(client: &dyn KubeClient, hr: &HelmRelease) -> Result<Vec<Value>> {
    let revision = hr.last_release_revision();
    if revision < 1 || hr.spec.kube_config.is_some() {
        return Ok(Vec::new());
    }

    let secret_name = format!("sh.helm.release.v1.{}.v{}", hr.release_name(), revision);
    let storage_namespace = hr.storage_namespace();
    let secret: Secret =
        get_typed(client, &secret_gvk(), Some(&storage_namespace), &secret_name).await?;

    let name = hr.metadata.name.as_deref().unwrap_or_default();
    let release = secret
        .data
        .as_ref()
        .and_then(|data| data.get("release"))
        .ok_or_else(|| {
            Error::Internal(format!(
                "failed to decode the Helm storage object for HelmRelease '{}'",
                name
            ))
        })?;

    let manifest = decode_release(&release.0)?;
    let default_namespace = hr
        .spec
        .target_namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| hr.metadata.namespace.clone())
        .unwrap_or_default();
    parse_manifest(&manifest, &default_namespace)
}

/// Distinct kinds rendered by the last release, for object summaries.
pub async fn helm_release_kinds(
    client: &dyn KubeClient,
    hr: &HelmRelease,
) -> Result<Vec<GroupVersionKind>> {
    let kinds: BTreeSet<(String, String, String)> = helm_release_objects(client, hr)
        .await?
        .iter()
        .filter_map(ObjectRef::from_manifest)
        .map(|r| (r.gvk.group, r.gvk.version, r.gvk.kind))
        .collect();
    Ok(kinds
        .into_iter()
        .map(|(group, version, kind)| GroupVersionKind::gvk(&group, &version, &kind))
        .collect())
}

// --- Resolver ---

pub struct InventoryResolver {
    registry: Arc<ClusterRegistry>,
    namespaces: Arc<NamespaceCache>,
    kinds: Arc<PrimaryKinds>,
}

impl InventoryResolver {
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

    pub async fn inventory(
        &self,
        principal: &Principal,
        cluster: &str,
        kind: &str,
        name: &str,
        namespace: &str,
        with_children: bool,
    ) -> Result<Vec<InventoryEntry>> {
        let gvk = self.kinds.lookup(kind)?;
        let client = self.registry.impersonated_client_for(principal, cluster).await?;
        let owner = client.get(&gvk, Some(namespace), name).await?;

        let declared = match FluxObject::from_dynamic(owner) {
            FluxObject::Kustomization(ks) => kustomization_refs(&ks),
            FluxObject::HelmRelease(hr) => helm_release_objects(client.as_ref(), &hr)
                .await?
                .iter()
                .filter_map(ObjectRef::from_manifest)
                .collect(),
            other => status_inventory_refs(&other.to_value()?),
        };
        debug!(cluster = %cluster, kind = %kind, name = %name, count = declared.len(), "resolving inventory");

        let entries = join_all(
            declared
                .iter()
                .map(|r| self.hydrate(client.as_ref(), cluster, r, with_children)),
        )
        .await;
        Ok(entries.into_iter().flatten().collect())
    }

    async fn hydrate(
        &self,
        client: &dyn KubeClient,
        cluster: &str,
        reference: &ObjectRef,
        with_children: bool,
    ) -> Option<InventoryEntry> {
        let namespace = Some(reference.namespace.as_str()).filter(|ns| !ns.is_empty());
        match client.get(&reference.gvk, namespace, &reference.name).await {
            Ok(obj) => Some(self.entry(client, cluster, obj, with_children).await),
            Err(e) => {
                warn!(
                    cluster = %cluster,
                    kind = %reference.gvk.kind,
                    namespace = %reference.namespace,
                    name = %reference.name,
                    error = %e,
                    "failed to get inventory object"
                );
                None
            }
        }
    }

    fn entry<'a>(
        &'a self,
        client: &'a dyn KubeClient,
        cluster: &'a str,
        mut obj: DynamicObject,
        with_children: bool,
    ) -> BoxFuture<'a, InventoryEntry> {
        async move {
            redact(&mut obj);
            let children = if with_children {
                self.children(client, cluster, &obj).await
            } else {
                Vec::new()
            };
            let tenant = obj
                .metadata
                .namespace
                .as_deref()
                .and_then(|ns| self.namespaces.tenant(cluster, ns))
                .unwrap_or_default();
            let payload = serde_json::to_value(&obj).unwrap_or(Value::Null);

            InventoryEntry {
                health: classify(&payload),
                payload,
                cluster_name: cluster.to_string(),
                tenant,
                children,
            }
        }
        .boxed()
    }

    async fn children(
        &self,
        client: &dyn KubeClient,
        cluster: &str,
        parent: &DynamicObject,
    ) -> Vec<InventoryEntry> {
        let kind = parent.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
        let child_gvk = match kind {
            "Deployment" | "StatefulSet" => GroupVersionKind::gvk("apps", "v1", "ReplicaSet"),
            "ReplicaSet" => GroupVersionKind::gvk("", "v1", "Pod"),
            _ => return Vec::new(),
        };
        let Some(uid) = parent.metadata.uid.as_deref() else {
            return Vec::new();
        };

        let list = match client
            .list(&child_gvk, parent.metadata.namespace.as_deref(), &ListOptions::default())
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(cluster = %cluster, kind = %child_gvk.kind, error = %e, "failed to list children");
                return Vec::new();
            }
        };

        let owned = list.items.into_iter().filter(|child| {
            child
                .metadata
                .owner_references
                .iter()
                .flatten()
                .any(|r| r.uid == uid)
        });
        let mut children = Vec::new();
        for child in owned {
            children.push(self.entry(client, cluster, child, true).await);
        }
        children
    }
}
