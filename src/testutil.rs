/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/testutil.rs
*
* In-memory stand-ins for the cluster-facing seams, shared by the unit tests
* of every engine. `FakeKube` behaves like a small API server: objects are
* kept in server order (namespace, then name), selectors and `limit` /
* `continue` are honoured, merge patches bump `resourceVersion` and check the
* one sent by the caller. Objects marked with `acknowledge_reconcile` copy
* the reconcile request annotation into their status on patch, which is what
* a Flux controller does.
*
* Namespaces marked with `forbid_namespace` are closed to impersonated
* clients: reads there fail with permission denied, rules reviews come back
* empty, and so does any cluster-wide read of a namespaced kind. The
* server's own identity sees everything.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::adapter::{set_nested, RECONCILE_REQUEST_ANNOTATION};
use crate::clusters::{
    Cluster, ClientFactory, ClusterFetcher, ClusterRegistry, KubeClient, ListOptions, ObjectList,
    Principal,
};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::ResourceRule;
use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const CLUSTER_SCOPED: [&str; 2] = ["Namespace", "CustomResourceDefinition"];

/// (group, kind, namespace, name)
type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    acknowledging: HashSet<(String, String, String)>,
    failure: Option<String>,
    forbidden: HashSet<String>,
    conflicts: u32,
    patches: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct FakeKube {
    state: Arc<Mutex<FakeState>>,
    impersonating: bool,
}

fn key_of(value: &Value) -> ObjectKey {
    let api_version = value["apiVersion"].as_str().unwrap_or_default();
    let group = api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");
    (
        group.to_string(),
        value["kind"].as_str().unwrap_or_default().to_string(),
        value["metadata"]["namespace"].as_str().unwrap_or_default().to_string(),
        value["metadata"]["name"].as_str().unwrap_or_default().to_string(),
    )
}

fn parse_selector(selector: Option<&str>) -> Vec<(String, String)> {
    selector
        .unwrap_or_default()
        .split(',')
        .filter(|term| !term.is_empty())
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn field_value<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    let pointer = format!("/{}", path.replace('.', "/"));
    value.pointer(&pointer).and_then(Value::as_str)
}

/// RFC 7386 application.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, mut value: Value) -> &Self {
        let mut state = self.lock();
        state.resource_version += 1;
        let rv = state.resource_version.to_string();
        let key = key_of(&value);
        if value.pointer("/metadata/uid").is_none() {
            set_nested(&mut value, &["metadata", "uid"], json!(format!("{}-{}-uid", key.2, key.3)));
        }
        set_nested(&mut value, &["metadata", "resourceVersion"], json!(rv));
        state.objects.insert(key, value);
        self
    }

    pub fn remove(&self, api_version: &str, kind: &str, namespace: &str, name: &str) {
        let key = key_of(&json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"namespace": namespace, "name": name}
        }));
        self.lock().objects.remove(&key);
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .iter()
            .find(|(k, _)| k.1 == kind && k.2 == namespace && k.3 == name)
            .map(|(_, v)| v.clone())
    }

    /// Marks an object as reconciled by a controller that acknowledges
    /// every reconcile request immediately.
    pub fn acknowledge_reconcile(&self, kind: &str, namespace: &str, name: &str) {
        self.lock()
            .acknowledging
            .insert((kind.to_string(), namespace.to_string(), name.to_string()));
    }

    /// A view of the same objects through an impersonated identity.
    pub fn impersonated(&self) -> Self {
        Self {
            state: self.state.clone(),
            impersonating: true,
        }
    }

    pub fn forbid_namespace(&self, namespace: &str) {
        self.lock().forbidden.insert(namespace.to_string());
    }

    fn check_access(
        &self,
        state: &FakeState,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<()> {
        if !self.impersonating || state.forbidden.is_empty() {
            return Ok(());
        }
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) if state.forbidden.contains(ns) => Err(Error::PermissionDenied(format!(
                "{} is forbidden in namespace {}",
                gvk.kind, ns
            ))),
            Some(_) => Ok(()),
            None if CLUSTER_SCOPED.contains(&gvk.kind.as_str()) => Ok(()),
            None => Err(Error::PermissionDenied(format!(
                "{} is forbidden at the cluster scope",
                gvk.kind
            ))),
        }
    }

    pub fn set_unavailable(&self, message: &str) {
        self.lock().failure = Some(message.to_string());
    }

    pub fn inject_conflicts(&self, count: u32) {
        self.lock().conflicts = count;
    }

    /// (kind, name) of every applied patch, in order.
    pub fn patches(&self) -> Vec<(String, String)> {
        self.lock().patches.clone()
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> Result<ObjectList> {
        let state = self.lock();
        if let Some(message) = &state.failure {
            return Err(Error::Unavailable(message.clone()));
        }
        self.check_access(&state, gvk, namespace)?;
        let labels = parse_selector(opts.label_selector.as_deref());
        let fields = parse_selector(opts.field_selector.as_deref());

        let matched: Vec<&Value> = state
            .objects
            .iter()
            .filter(|(k, _)| k.0 == gvk.group && k.1 == gvk.kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| ns.is_empty() || k.2 == ns))
            .map(|(_, v)| v)
            .filter(|v| {
                labels.iter().all(|(k, want)| {
                    v["metadata"]["labels"][k.as_str()].as_str() == Some(want.as_str())
                })
            })
            .filter(|v| fields.iter().all(|(k, want)| field_value(v, k) == Some(want.as_str())))
            .collect();

        let offset = match opts.continue_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::InvalidArgument(format!("bad continue token {}", token)))?,
            None => 0,
        };
        let start = offset.min(matched.len());
        let end = match opts.limit {
            Some(limit) if limit > 0 => (start + limit as usize).min(matched.len()),
            _ => matched.len(),
        };

        let items = matched[start..end]
            .iter()
            .map(|v| serde_json::from_value::<DynamicObject>((*v).clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ObjectList {
            items,
            continue_token: (end < matched.len()).then(|| end.to_string()),
        })
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let state = self.lock();
        if let Some(message) = &state.failure {
            return Err(Error::Unavailable(message.clone()));
        }
        self.check_access(&state, gvk, namespace)?;
        let key = (
            gvk.group.clone(),
            gvk.kind.clone(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        );
        let value = state.objects.get(&key).cloned().ok_or_else(|| {
            Error::NotFound(format!("{} {}/{} not found", gvk.kind, key.2, name))
        })?;
        Ok(serde_json::from_value(value)?)
    }

    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut state = self.lock();
        if let Some(message) = &state.failure {
            return Err(Error::Unavailable(message.clone()));
        }
        self.check_access(&state, gvk, namespace)?;
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(Error::Conflict("the object has been modified".into()));
        }
        let key = (
            gvk.group.clone(),
            gvk.kind.clone(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        );
        let mut updated = state.objects.get(&key).cloned().ok_or_else(|| {
            Error::NotFound(format!("{} {}/{} not found", gvk.kind, key.2, name))
        })?;

        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if updated.pointer("/metadata/resourceVersion").and_then(Value::as_str) != Some(expected) {
                return Err(Error::Conflict("the object has been modified".into()));
            }
        }

        apply_merge_patch(&mut updated, patch);
        state.resource_version += 1;
        let rv = state.resource_version.to_string();
        set_nested(&mut updated, &["metadata", "resourceVersion"], json!(rv));

        let pointer = format!(
            "/metadata/annotations/{}",
            RECONCILE_REQUEST_ANNOTATION.replace('/', "~1")
        );
        let acknowledged = (key.1.clone(), key.2.clone(), key.3.clone());
        if state.acknowledging.contains(&acknowledged) {
            if let Some(requested) = patch.pointer(&pointer).cloned() {
                set_nested(&mut updated, &["status", "lastHandledReconcileAt"], requested);
            }
        }

        state.patches.push((key.1.clone(), key.3.clone()));
        state.objects.insert(key, updated.clone());
        Ok(serde_json::from_value(updated)?)
    }

    async fn resource_rules(&self, namespace: &str) -> Result<Vec<ResourceRule>> {
        let state = self.lock();
        if let Some(message) = &state.failure {
            return Err(Error::Unavailable(message.clone()));
        }
        if self.impersonating && state.forbidden.contains(namespace) {
            return Ok(Vec::new());
        }
        let all = vec!["*".to_string()];
        Ok(vec![ResourceRule {
            api_groups: Some(all.clone()),
            resources: Some(all.clone()),
            verbs: all,
            resource_names: None,
        }])
    }
}

// --- Factories and fetchers ---

#[derive(Default)]
pub struct FakeFactory {
    clusters: Mutex<HashMap<String, FakeKube>>,
    unreachable: Mutex<HashSet<String>>,
    builds: AtomicUsize,
    principals: Mutex<Vec<String>>,
}

impl FakeFactory {
    pub fn add_cluster(&self, name: &str, kube: FakeKube) {
        self.clusters.lock().unwrap().insert(name.to_string(), kube);
    }

    pub fn unreachable(&self, name: &str) {
        self.unreachable.lock().unwrap().insert(name.to_string());
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn principals(&self) -> Vec<String> {
        self.principals.lock().unwrap().clone()
    }

    fn build(&self, cluster: &Cluster) -> Result<FakeKube> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().unwrap().contains(&cluster.name) {
            return Err(Error::Unavailable(format!("cluster {} unreachable", cluster.name)));
        }
        let kube = self
            .clusters
            .lock()
            .unwrap()
            .get(&cluster.name)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("no fake for cluster {}", cluster.name)))?;
        Ok(kube)
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn server_client(&self, cluster: &Cluster) -> Result<Arc<dyn KubeClient>> {
        Ok(Arc::new(self.build(cluster)?))
    }

    async fn impersonated_client(
        &self,
        cluster: &Cluster,
        principal: &Principal,
    ) -> Result<Arc<dyn KubeClient>> {
        self.principals.lock().unwrap().push(principal.id.clone());
        Ok(Arc::new(self.build(cluster)?.impersonated()))
    }
}

pub struct StaticFetcher {
    clusters: Mutex<std::result::Result<Vec<Cluster>, String>>,
}

impl StaticFetcher {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self {
            clusters: Mutex::new(Ok(clusters)),
        }
    }

    pub fn set(&self, clusters: Vec<Cluster>) {
        *self.clusters.lock().unwrap() = Ok(clusters);
    }

    pub fn fail(&self, message: &str) {
        *self.clusters.lock().unwrap() = Err(message.to_string());
    }
}

#[async_trait]
impl ClusterFetcher for StaticFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        self.clusters
            .lock()
            .unwrap()
            .clone()
            .map_err(Error::Unavailable)
    }
}

// --- Fixtures ---

/// A refreshed registry over the given fake clusters. "Default" is always
/// registered; give it a fake to make it reachable.
pub async fn fleet(clusters: &[(&str, FakeKube)]) -> (Arc<ClusterRegistry>, Arc<FakeFactory>) {
    let (registry, factory, _) = fleet_with_fetcher(clusters).await;
    (registry, factory)
}

/// `fleet`, also returning the fetcher so tests can change membership.
pub async fn fleet_with_fetcher(
    clusters: &[(&str, FakeKube)],
) -> (Arc<ClusterRegistry>, Arc<FakeFactory>, Arc<StaticFetcher>) {
    let factory = Arc::new(FakeFactory::default());
    let mut members = Vec::new();
    for (name, kube) in clusters {
        factory.add_cluster(name, kube.clone());
        members.push(Cluster::in_cluster(*name));
    }
    let fetcher = Arc::new(StaticFetcher::new(members));
    let registry = ClusterRegistry::new(fetcher.clone(), factory.clone(), &CoreConfig::default())
        .with_refresh_retry(RetryConfig::with_max_attempts(1));
    registry.refresh().await.unwrap();
    (Arc::new(registry), factory, fetcher)
}

pub fn anne() -> Principal {
    Principal::new("anne", vec!["devs".into()])
}

pub fn namespace(name: &str, labels: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name, "labels": labels}
    })
}

pub fn kustomization(namespace: &str, name: &str) -> Value {
    json!({
        "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
        "kind": "Kustomization",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {
            "sourceRef": {"kind": "GitRepository", "name": "repo"},
            "path": "./",
            "interval": "10m",
            "suspend": false
        }
    })
}
