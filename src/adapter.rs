/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/adapter.rs
*
* The object adapter gives the rest of the core one view over every Flux kind.
* `FluxObject` is a tagged union with a typed variant per recognized kind and
* a schemaless variant that reads the same fields through JSON paths, so kinds
* introduced by newer controllers remain observable. Reconcile, suspend and
* status rendering only ever talk to this type.
*
* Adding a kind means adding a CRD struct, a variant here and a registration
* in `flux_kinds`; nothing else in the core changes.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::crds::{
    Bucket, Condition, GitRepository, HelmChart, HelmRelease, HelmRepository, ImageRepository,
    ImageUpdateAutomation, Kustomization, OCIRepository,
};
use crate::error::{Error, Result};
use kube::api::{DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const RECONCILE_REQUEST_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// Cross-namespace reference from an automation to its source. The namespace
/// is always resolved; an empty one in the object means the referrer's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub enum FluxObject {
    Kustomization(Kustomization),
    HelmRelease(HelmRelease),
    GitRepository(GitRepository),
    HelmRepository(HelmRepository),
    HelmChart(HelmChart),
    Bucket(Bucket),
    OciRepository(OCIRepository),
    ImageRepository(ImageRepository),
    ImageUpdateAutomation(ImageUpdateAutomation),
    Schemaless(DynamicObject),
}

/// Canonical GVKs of every kind with a typed variant.
pub fn flux_kinds() -> Vec<GroupVersionKind> {
    vec![
        gvk_of::<Kustomization>(),
        gvk_of::<HelmRelease>(),
        gvk_of::<GitRepository>(),
        gvk_of::<HelmRepository>(),
        gvk_of::<HelmChart>(),
        gvk_of::<Bucket>(),
        gvk_of::<OCIRepository>(),
        gvk_of::<ImageRepository>(),
        gvk_of::<ImageUpdateAutomation>(),
    ]
}

pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Kinds that consume a source and therefore carry a `SourceRef`.
pub fn is_automation_kind(kind: &str) -> bool {
    matches!(kind, "Kustomization" | "HelmRelease" | "ImageUpdateAutomation")
}

/// Applies `$body` to the inner object of every typed variant; the schemaless
/// variant is handled by `$schemaless`.
macro_rules! typed {
    ($self:expr, $o:ident => $body:expr, $s:ident => $schemaless:expr) => {
        match $self {
            FluxObject::Kustomization($o) => $body,
            FluxObject::HelmRelease($o) => $body,
            FluxObject::GitRepository($o) => $body,
            FluxObject::HelmRepository($o) => $body,
            FluxObject::HelmChart($o) => $body,
            FluxObject::Bucket($o) => $body,
            FluxObject::OciRepository($o) => $body,
            FluxObject::ImageRepository($o) => $body,
            FluxObject::ImageUpdateAutomation($o) => $body,
            FluxObject::Schemaless($s) => $schemaless,
        }
    };
}

impl FluxObject {
    /// Builds the adapter for an object read from the API server. Objects of
    /// unknown kinds, or that don't fit their typed shape, become schemaless.
    pub fn from_dynamic(obj: DynamicObject) -> Self {
        let Some(types) = obj.types.clone() else {
            return FluxObject::Schemaless(obj);
        };
        let group = types.api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");

        match (group, types.kind.as_str()) {
            ("kustomize.toolkit.fluxcd.io", "Kustomization") => {
                typed_or_schemaless(obj, FluxObject::Kustomization)
            }
            ("helm.toolkit.fluxcd.io", "HelmRelease") => {
                typed_or_schemaless(obj, FluxObject::HelmRelease)
            }
            ("source.toolkit.fluxcd.io", "GitRepository") => {
                typed_or_schemaless(obj, FluxObject::GitRepository)
            }
            ("source.toolkit.fluxcd.io", "HelmRepository") => {
                typed_or_schemaless(obj, FluxObject::HelmRepository)
            }
            ("source.toolkit.fluxcd.io", "HelmChart") => {
                typed_or_schemaless(obj, FluxObject::HelmChart)
            }
            ("source.toolkit.fluxcd.io", "Bucket") => typed_or_schemaless(obj, FluxObject::Bucket),
            ("source.toolkit.fluxcd.io", "OCIRepository") => {
                typed_or_schemaless(obj, FluxObject::OciRepository)
            }
            ("image.toolkit.fluxcd.io", "ImageRepository") => {
                typed_or_schemaless(obj, FluxObject::ImageRepository)
            }
            ("image.toolkit.fluxcd.io", "ImageUpdateAutomation") => {
                typed_or_schemaless(obj, FluxObject::ImageUpdateAutomation)
            }
            _ => FluxObject::Schemaless(obj),
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        typed!(self, o => &o.metadata, d => &d.metadata)
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        typed!(self, o => &mut o.metadata, d => &mut d.metadata)
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Canonical GVK of a typed kind, or the object's own for schemaless.
    pub fn group_version_kind(&self) -> GroupVersionKind {
        match self {
            FluxObject::Kustomization(_) => gvk_of::<Kustomization>(),
            FluxObject::HelmRelease(_) => gvk_of::<HelmRelease>(),
            FluxObject::GitRepository(_) => gvk_of::<GitRepository>(),
            FluxObject::HelmRepository(_) => gvk_of::<HelmRepository>(),
            FluxObject::HelmChart(_) => gvk_of::<HelmChart>(),
            FluxObject::Bucket(_) => gvk_of::<Bucket>(),
            FluxObject::OciRepository(_) => gvk_of::<OCIRepository>(),
            FluxObject::ImageRepository(_) => gvk_of::<ImageRepository>(),
            FluxObject::ImageUpdateAutomation(_) => gvk_of::<ImageUpdateAutomation>(),
            FluxObject::Schemaless(d) => {
                let (api_version, kind) = d
                    .types
                    .as_ref()
                    .map(|t| (t.api_version.as_str(), t.kind.as_str()))
                    .unwrap_or_default();
                let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
                GroupVersionKind::gvk(group, version, kind)
            }
        }
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata().annotations.clone().unwrap_or_default()
    }

    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.metadata_mut().annotations = Some(annotations);
    }

    pub fn conditions(&self) -> Vec<Condition> {
        typed!(
            self,
            o => o.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default(),
            d => d
                .data
                .pointer("/status/conditions")
                .cloned()
                .and_then(|c| serde_json::from_value::<Vec<Condition>>(c).ok())
                .unwrap_or_default()
        )
    }

    /// Value of `status.lastHandledReconcileAt`; empty if never reconciled.
    pub fn last_handled_reconcile_request(&self) -> String {
        typed!(
            self,
            o => o
                .status
                .as_ref()
                .and_then(|s| s.last_handled_reconcile_at.clone())
                .unwrap_or_default(),
            d => d
                .data
                .pointer("/status/lastHandledReconcileAt")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        )
    }

    pub fn suspended(&self) -> bool {
        typed!(
            self,
            o => o.spec.suspend,
            d => d.data.pointer("/spec/suspend").and_then(Value::as_bool).unwrap_or(false)
        )
    }

    pub fn set_suspended(&mut self, suspend: bool) {
        typed!(
            self,
            o => o.spec.suspend = suspend,
            d => set_nested(&mut d.data, &["spec", "suspend"], Value::Bool(suspend))
        )
    }

    /// The source an automation consumes. Source kinds have none.
    pub fn source_ref(&self) -> Result<SourceRef> {
        let (reference, referrer_ns) = match self {
            FluxObject::Kustomization(ks) => (&ks.spec.source_ref, self.namespace()),
            FluxObject::ImageUpdateAutomation(iua) => (&iua.spec.source_ref, self.namespace()),
            FluxObject::HelmRelease(hr) => match &hr.spec.chart {
                Some(chart) => (&chart.spec.source_ref, self.namespace()),
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "HelmRelease {}/{} has no chart template",
                        self.namespace(),
                        self.name()
                    )))
                }
            },
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "kind {} does not reference a source",
                    self.group_version_kind().kind
                )))
            }
        };

        if reference.kind.is_empty() || reference.name.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{}/{} has an incomplete source reference",
                referrer_ns,
                self.name()
            )));
        }

        Ok(SourceRef {
            api_version: reference.api_version.clone(),
            kind: reference.kind.clone(),
            name: reference.name.clone(),
            namespace: reference
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| referrer_ns.to_string()),
        })
    }

    /// Independent adapter over a cloned object.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Serialized form, including apiVersion and kind.
    pub fn to_value(&self) -> Result<Value> {
        let value = typed!(
            self,
            o => serde_json::to_value(o)?,
            d => serde_json::to_value(d)?
        );
        Ok(value)
    }
}

fn typed_or_schemaless<K, F>(obj: DynamicObject, wrap: F) -> FluxObject
where
    K: DeserializeOwned,
    F: FnOnce(K) -> FluxObject,
{
    let parsed = serde_json::to_value(&obj).and_then(serde_json::from_value::<K>);
    match parsed {
        Ok(typed) => wrap(typed),
        Err(e) => {
            debug!(
                name = obj.metadata.name.as_deref().unwrap_or_default(),
                error = %e,
                "object does not match its typed shape, using schemaless view"
            );
            FluxObject::Schemaless(obj)
        }
    }
}

/// Writes `value` at `path`, creating (or replacing non-object) parents.
pub fn set_nested(root: &mut Value, path: &[&str], value: Value) {
    let mut current = root;
    for key in path {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        current = map.entry(key.to_string()).or_insert(Value::Null);
    }
    *current = value;
}

/// JSON merge patch (RFC 7386) that turns `original` into `modified`.
pub fn merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for (key, new_value) in modi {
                match orig.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) if old_value.is_object() && new_value.is_object() => {
                        patch.insert(key.clone(), merge_patch(old_value, new_value));
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in orig.keys() {
                if !modi.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        (_, modified) => modified.clone(),
    }
}

/// Builds the TypeMeta for a GVK, as DynamicObject expects it.
pub fn type_meta(gvk: &GroupVersionKind) -> TypeMeta {
    let api_version = if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    };
    TypeMeta {
        api_version,
        kind: gvk.kind.clone(),
    }
}
