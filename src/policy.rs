/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/policy.rs
*
* Policy violations are not a resource of their own: the admission and audit
* controllers record them as Warning events labelled `pac.weave.works/type`,
* carrying the details in annotations. This module translates those events
* into violation records and queries them across the fleet, reusing the
* fan-out engine for selectors and pagination.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::clusters::{client::event_gvk, ClusterError, ClusterRegistry, Principal};
use crate::error::{Error, Result};
use crate::query::{ListRequest, QueryEngine};
use chrono::{DateTime, SecondsFormat};
use k8s_openapi::api::core::v1::Event;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const POLICY_TYPE_LABEL: &str = "pac.weave.works/type";
pub const POLICY_ID_LABEL: &str = "pac.weave.works/id";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationType {
    #[default]
    Admission,
    Audit,
}

impl ValidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationType::Admission => "Admission",
            ValidationType::Audit => "Audit",
        }
    }
}

/// A policy parameter value, typed after its JSON kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Double(f64),
    Bool(bool),
    Strings(Vec<String>),
}

impl ParamValue {
    /// Objects and nulls carry no value.
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(ParamValue::String(s.clone())),
            Value::Number(n) => n.as_f64().map(ParamValue::Double),
            Value::Bool(b) => Some(ParamValue::Bool(*b)),
            Value::Array(items) => Some(ParamValue::Strings(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            Value::Null | Value::Object(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyParam {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ParamValue>,
}

#[derive(Deserialize)]
struct RawParam {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    type_: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    config_ref: Option<String>,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub id: String,
    pub name: String,
    pub policy_id: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub category: String,
    pub severity: String,
    pub created_at: String,
    pub message: String,
    pub entity: String,
    pub entity_kind: String,
    pub namespace: String,
    pub validation_type: ValidationType,
    pub description: String,
    pub how_to_solve: String,
    pub violating_entity: String,
    pub occurrences: Vec<Occurrence>,
    pub parameters: Vec<PolicyParam>,
}

fn annotation(annotations: &BTreeMap<String, String>, key: &str) -> String {
    annotations.get(key).cloned().unwrap_or_default()
}

fn rfc3339(raw: &str) -> Result<String> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| Error::InvalidArgument(format!("event timestamp {}: {}", raw, e)))?;
    Ok(parsed.to_utc().to_rfc3339_opts(SecondsFormat::Secs, true))
}

impl PolicyViolation {
    pub fn from_event(event: &Event, cluster_name: &str) -> Result<Self> {
        let labels = event.metadata.labels.clone().unwrap_or_default();
        let annotations = event.metadata.annotations.clone().unwrap_or_default();
        let involved = &event.involved_object;

        let created_at = match serde_json::to_value(&event.metadata.creation_timestamp)? {
            Value::String(raw) => rfc3339(&raw)?,
            _ => String::new(),
        };
        let validation_type = match labels.get(POLICY_TYPE_LABEL).map(String::as_str) {
            Some("Audit") => ValidationType::Audit,
            _ => ValidationType::Admission,
        };

        let occurrences = match annotations.get("occurrences").filter(|raw| !raw.is_empty()) {
            Some(raw) => serde_json::from_str::<Vec<Occurrence>>(raw).map_err(|e| {
                Error::InvalidArgument(format!("failed to get occurrences from event: {}", e))
            })?,
            None => Vec::new(),
        };
        let parameters = match annotations.get("parameters").filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_parameters(raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            id: annotation(&labels, POLICY_ID_LABEL),
            name: annotation(&annotations, "policy_name"),
            policy_id: annotation(&annotations, "policy_id"),
            cluster_id: annotation(&annotations, "cluster_id"),
            cluster_name: cluster_name.to_string(),
            category: annotation(&annotations, "category"),
            severity: annotation(&annotations, "severity"),
            created_at,
            message: event.message.clone().unwrap_or_default(),
            entity: involved.name.clone().unwrap_or_default(),
            entity_kind: involved.kind.clone().unwrap_or_default(),
            namespace: involved.namespace.clone().unwrap_or_default(),
            validation_type,
            description: annotation(&annotations, "description"),
            how_to_solve: annotation(&annotations, "how_to_solve"),
            violating_entity: annotation(&annotations, "entity_manifest"),
            occurrences,
            parameters,
        })
    }

    pub fn from_object(obj: DynamicObject, cluster_name: &str) -> Result<Self> {
        let event: Event = serde_json::from_value(serde_json::to_value(obj)?)?;
        Self::from_event(&event, cluster_name)
    }

    /// The event shape a policy controller would have recorded for this
    /// violation. Fields not carried by the event are left out.
    pub fn to_event(&self) -> Result<Event> {
        let mut annotations = BTreeMap::from([
            ("policy_name".to_string(), self.name.clone()),
            ("policy_id".to_string(), self.policy_id.clone()),
            ("cluster_id".to_string(), self.cluster_id.clone()),
            ("category".to_string(), self.category.clone()),
            ("severity".to_string(), self.severity.clone()),
            ("description".to_string(), self.description.clone()),
            ("how_to_solve".to_string(), self.how_to_solve.clone()),
            ("entity_manifest".to_string(), self.violating_entity.clone()),
            ("occurrences".to_string(), serde_json::to_string(&self.occurrences)?),
        ]);
        if !self.parameters.is_empty() {
            annotations.insert("parameters".to_string(), serde_json::to_string(&self.parameters)?);
        }

        let mut event = json!({
            "metadata": {
                "name": format!("{}.{}", self.entity, self.id),
                "namespace": self.namespace,
                "labels": {
                    POLICY_TYPE_LABEL: self.validation_type.as_str(),
                    POLICY_ID_LABEL: self.id,
                },
                "annotations": annotations,
            },
            "type": "Warning",
            "message": self.message,
            "involvedObject": {
                "kind": self.entity_kind,
                "name": self.entity,
                "namespace": self.namespace,
                "fieldPath": self.policy_id,
            },
        });
        if !self.created_at.is_empty() {
            event["metadata"]["creationTimestamp"] = json!(self.created_at);
        }
        Ok(serde_json::from_value(event)?)
    }
}

fn parse_parameters(raw: &str) -> Result<Vec<PolicyParam>> {
    let params: Vec<RawParam> = serde_json::from_str(raw).map_err(|e| {
        Error::InvalidArgument(format!("failed to unmarshal policy validation parameter: {}", e))
    })?;
    Ok(params
        .into_iter()
        .map(|p| PolicyParam {
            name: p.name,
            type_: p.type_,
            required: p.required,
            config_ref: p.config_ref,
            value: ParamValue::from_json(&p.value),
        })
        .collect())
}

/// Filters of a violation listing. Empty strings mean "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationFilter {
    pub cluster_name: String,
    pub application: String,
    pub kind: String,
    pub namespace: String,
    pub policy_id: String,
    pub validation_type: Option<ValidationType>,
}

impl ViolationFilter {
    fn label_selector(&self) -> String {
        format!(
            "{}={}",
            POLICY_TYPE_LABEL,
            self.validation_type.unwrap_or_default().as_str()
        )
    }

    fn field_selector(&self) -> String {
        let mut terms = vec!["type=Warning".to_string()];
        if !self.application.is_empty() {
            terms.push(format!("involvedObject.name={}", self.application));
            if !self.kind.is_empty() {
                terms.push(format!("involvedObject.kind={}", self.kind));
            }
        }
        if !self.namespace.is_empty() {
            terms.push(format!("involvedObject.namespace={}", self.namespace));
        }
        if !self.policy_id.is_empty() {
            terms.push(format!("involvedObject.fieldPath={}", self.policy_id));
        }
        terms.join(",")
    }
}

#[derive(Debug, Default)]
pub struct ViolationList {
    pub violations: Vec<PolicyViolation>,
    pub errors: Vec<ClusterError>,
    pub next_page_token: String,
}

pub struct PolicyViolations {
    registry: Arc<ClusterRegistry>,
    query: Arc<QueryEngine>,
}

impl PolicyViolations {
    pub fn new(registry: Arc<ClusterRegistry>, query: Arc<QueryEngine>) -> Self {
        Self { registry, query }
    }

    pub async fn list(
        &self,
        principal: &Principal,
        filter: &ViolationFilter,
        page_size: Option<u32>,
        page_token: Option<String>,
    ) -> Result<ViolationList> {
        let req = ListRequest {
            kind: "Event".into(),
            cluster: Some(filter.cluster_name.clone()).filter(|c| !c.is_empty()),
            page_size,
            page_token,
            label_selector: Some(filter.label_selector()),
            field_selector: Some(filter.field_selector()),
            ..Default::default()
        };
        let listed = self.query.list_gvk(principal, &event_gvk(), &req).await?;

        let mut violations = Vec::with_capacity(listed.objects.len());
        for item in listed.objects {
            let name = item.object.metadata.name.clone().unwrap_or_default();
            match PolicyViolation::from_object(item.object, &item.cluster) {
                Ok(violation) => violations.push(violation),
                Err(e) => {
                    warn!(cluster = %item.cluster, event = %name, error = %e, "skipping malformed policy event")
                }
            }
        }
        debug!(count = violations.len(), "listed policy violations");

        Ok(ViolationList {
            violations,
            errors: listed.errors,
            next_page_token: listed.next_page_token,
        })
    }

    /// Looks a violation up by id across the target clusters. A match wins
    /// over failures elsewhere; failures only surface when nothing matched.
    pub async fn get(
        &self,
        principal: &Principal,
        cluster: &str,
        id: &str,
        validation_type: Option<ValidationType>,
    ) -> Result<PolicyViolation> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("a violation id is required".into()));
        }
        if !cluster.is_empty() {
            self.registry.cluster(cluster)?;
        }

        let validation_type = validation_type.unwrap_or_default();
        let req = ListRequest {
            kind: "Event".into(),
            cluster: Some(cluster.to_string()).filter(|c| !c.is_empty()),
            label_selector: Some(format!(
                "{}={},{}={}",
                POLICY_TYPE_LABEL,
                validation_type.as_str(),
                POLICY_ID_LABEL,
                id
            )),
            field_selector: Some("type=Warning".into()),
            ..Default::default()
        };
        let listed = self.query.list_gvk(principal, &event_gvk(), &req).await?;
        let item = match listed.objects.into_iter().next() {
            Some(item) => item,
            None => {
                if let Some(failure) = listed.errors.first() {
                    return Err(Error::Unavailable(format!(
                        "listing events on cluster {}: {}",
                        failure.cluster, failure.message
                    )));
                }
                return Err(Error::NotFound(format!(
                    "no policy violation found with id {} and cluster: {}",
                    id, cluster
                )));
            }
        };
        for failure in &listed.errors {
            debug!(cluster = %failure.cluster, error = %failure.message, "violation found despite cluster failure");
        }
        PolicyViolation::from_object(item.object, &item.cluster)
    }
}
