/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/health.rs
*
* Health classification of live objects shown in inventories. Workload kinds
* are judged from their typed status (rollout observed, replicas updated and
* available); everything else from the Ready/Reconciling/Stalled conditions
* that Flux and most operators publish.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::crds::Condition;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Health {
    fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn healthy() -> Self {
        Self::new(HealthStatus::Healthy, "")
    }

    fn progressing(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Progressing, message)
    }
}

pub fn classify(obj: &Value) -> Health {
    match obj["kind"].as_str().unwrap_or_default() {
        "Deployment" => typed(obj, deployment),
        "ReplicaSet" => typed(obj, replica_set),
        "StatefulSet" => typed(obj, stateful_set),
        "DaemonSet" => typed(obj, daemon_set),
        "Job" => typed(obj, job),
        "Pod" => typed(obj, pod),
        "PersistentVolumeClaim" => typed(obj, pvc),
        _ => from_conditions(obj),
    }
}

fn typed<K: DeserializeOwned>(obj: &Value, check: fn(K) -> Health) -> Health {
    match serde_json::from_value::<K>(obj.clone()) {
        Ok(k) => check(k),
        Err(e) => Health::new(HealthStatus::Unknown, format!("decoding object: {}", e)),
    }
}

fn observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    generation.unwrap_or_default() == observed.unwrap_or_default()
}

fn deployment(dpl: Deployment) -> Health {
    let status = dpl.status.unwrap_or_default();
    if !observed(dpl.metadata.generation, status.observed_generation) {
        return Health::progressing("waiting for spec to be observed");
    }
    let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return Health::new(
            HealthStatus::Unhealthy,
            "deployment exceeded its progress deadline",
        );
    }
    let replicas = dpl.spec.and_then(|s| s.replicas).unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or_default();
    if updated < replicas {
        return Health::progressing("waiting for updated replicas");
    }
    if status.available_replicas.unwrap_or_default() < updated {
        return Health::progressing("waiting for available replicas");
    }
    Health::healthy()
}

fn replica_set(rs: ReplicaSet) -> Health {
    let status = rs.status.unwrap_or_default();
    if let Some(failure) = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "ReplicaFailure" && c.status == "True")
    {
        return Health::new(
            HealthStatus::Unhealthy,
            failure.message.clone().unwrap_or_default(),
        );
    }
    if !observed(rs.metadata.generation, status.observed_generation) {
        return Health::progressing("waiting for spec to be observed");
    }
    let replicas = rs.spec.and_then(|s| s.replicas).unwrap_or(1);
    if status.available_replicas.unwrap_or_default() < replicas {
        return Health::progressing("waiting for replicas");
    }
    Health::healthy()
}

fn stateful_set(sts: StatefulSet) -> Health {
    let status = sts.status.unwrap_or_default();
    if !observed(sts.metadata.generation, status.observed_generation) {
        return Health::progressing("waiting for spec to be observed");
    }
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    if status.ready_replicas.unwrap_or_default() < replicas {
        return Health::progressing("waiting for ready replicas");
    }
    if status.updated_replicas.unwrap_or_default() < replicas
        || status.update_revision != status.current_revision
    {
        return Health::progressing(format!(
            "waiting for rolling update to complete, {} pods updated",
            status.updated_replicas.unwrap_or_default()
        ));
    }
    Health::healthy()
}

fn daemon_set(ds: DaemonSet) -> Health {
    let status = ds.status.unwrap_or_default();
    if !observed(ds.metadata.generation, status.observed_generation) {
        return Health::progressing("waiting for spec to be observed");
    }
    if status.updated_number_scheduled.unwrap_or_default() != status.desired_number_scheduled {
        return Health::progressing("waiting for all nodes to run the updated pod");
    }
    if status.number_available.unwrap_or_default() != status.desired_number_scheduled {
        return Health::progressing("waiting for pods to become available");
    }
    Health::healthy()
}

fn job(job: Job) -> Health {
    let status = job.status.unwrap_or_default();
    if status.succeeded.unwrap_or_default() > 0 {
        Health::healthy()
    } else if status.failed.unwrap_or_default() > 0 {
        Health::new(HealthStatus::Unhealthy, "job is in a failed state")
    } else {
        Health::progressing("")
    }
}

fn pod(pod: Pod) -> Health {
    let status = pod.status.unwrap_or_default();
    let message = status.message.clone().unwrap_or_default();

    let backoff = status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.clone())
        .find(|reason| {
            matches!(
                reason.as_str(),
                "CrashLoopBackOff" | "ImagePullBackOff" | "ErrImagePull"
            )
        });
    if let Some(reason) = backoff {
        return Health::new(HealthStatus::Unhealthy, reason);
    }

    match status.phase.as_deref() {
        Some("Running") | Some("Succeeded") => Health::new(HealthStatus::Healthy, message),
        Some("Pending") => Health::new(HealthStatus::Progressing, message),
        Some("Failed") => Health::new(HealthStatus::Unhealthy, message),
        _ => Health::new(HealthStatus::Unknown, message),
    }
}

fn pvc(pvc: PersistentVolumeClaim) -> Health {
    match pvc.status.and_then(|s| s.phase).as_deref() {
        Some("Bound") => Health::healthy(),
        Some("Pending") => Health::progressing("waiting for volume to be bound"),
        Some("Lost") => Health::new(HealthStatus::Unhealthy, "volume lost"),
        _ => Health::new(HealthStatus::Unknown, ""),
    }
}

fn from_conditions(obj: &Value) -> Health {
    let status = match obj.get("status") {
        None | Some(Value::Null) => return Health::healthy(),
        Some(Value::Object(map)) if map.is_empty() => return Health::healthy(),
        Some(status) => status,
    };
    let conditions: Vec<Condition> = status
        .get("conditions")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
        .unwrap_or_default();
    let find = |type_: &str| conditions.iter().find(|c| c.type_ == type_);

    if let Some(c) = find("Stalled").filter(|c| c.status == "True") {
        return Health::new(HealthStatus::Unhealthy, c.message.clone());
    }
    if let Some(c) = find("Reconciling").filter(|c| c.status == "True") {
        return Health::progressing(c.message.clone());
    }
    match find("Ready") {
        Some(c) if c.status == "True" => Health::new(HealthStatus::Healthy, c.message.clone()),
        Some(c) if c.status == "False" => match c.reason.as_str() {
            "Progressing" | "DependencyNotReady" => Health::progressing(c.message.clone()),
            _ => Health::new(HealthStatus::Unhealthy, c.message.clone()),
        },
        Some(c) => Health::progressing(c.message.clone()),
        None => Health::new(HealthStatus::Unknown, ""),
    }
}
