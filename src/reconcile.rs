/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/reconcile.rs
*
* The reconcile engine asks Flux controllers to reconcile an object now and
* waits for them to acknowledge it.
*
* Architecture:
* - A request is the `reconcile.fluxcd.io/requestedAt` annotation set to the
*   current time. The patch carries the resourceVersion it was computed
*   from, so a concurrent writer turns it into a conflict that is retried
*   with the conflict backoff policy.
* - The controller acknowledges by copying the value into
*   `status.lastHandledReconcileAt`. The engine polls until that field moves
*   away from the value read before the request, or the deadline passes.
* - With `with_source`, the source of an automation is reconciled (and
*   waited for) first. The automation is only touched once its source has
*   been handled.
* - Objects of a batch are synced concurrently; failures are collected into
*   a `MultiError`.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::adapter::{FluxObject, RECONCILE_REQUEST_ANNOTATION};
use crate::clusters::{ClusterRegistry, KubeClient, Principal};
use crate::error::{Error, MultiError, Result};
use crate::primary_kinds::PrimaryKinds;
use crate::retry::retry_on_conflict;
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use kube::api::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SYNC_TIMEOUT_MESSAGE: &str =
    "Sync request timed out. The sync operation may still be in progress.";

/// One object addressed by a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTarget {
    pub cluster: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// Sets the reconcile request annotation; returns the value written.
pub async fn request_reconciliation(
    client: &dyn KubeClient,
    gvk: &GroupVersionKind,
    namespace: &str,
    name: &str,
) -> Result<String> {
    retry_on_conflict("request_reconciliation", move || async move {
        let current = client.get(gvk, Some(namespace), name).await?;
        let requested_at = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);

        let mut patch = json!({
            "metadata": {"annotations": {RECONCILE_REQUEST_ANNOTATION: &requested_at}}
        });
        if let Some(rv) = current.metadata.resource_version {
            patch["metadata"]["resourceVersion"] = json!(rv);
        }
        client.patch_merge(gvk, Some(namespace), name, &patch).await?;
        Ok(requested_at)
    })
    .await
}

/// Polls until the last handled reconcile request differs from `previous`.
pub async fn wait_for_sync(
    client: &dyn KubeClient,
    gvk: &GroupVersionKind,
    namespace: &str,
    name: &str,
    previous: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let poll = async {
        loop {
            let obj = FluxObject::from_dynamic(client.get(gvk, Some(namespace), name).await?);
            if obj.last_handled_reconcile_request() != previous {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(SYNC_TIMEOUT_MESSAGE.to_string())),
    }
}

pub struct ReconcileEngine {
    registry: Arc<ClusterRegistry>,
    kinds: Arc<PrimaryKinds>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ReconcileEngine {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        kinds: Arc<PrimaryKinds>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            kinds,
            poll_interval,
            timeout,
        }
    }

    pub async fn sync(
        &self,
        principal: &Principal,
        targets: &[ObjectTarget],
        with_source: bool,
    ) -> Result<()> {
        let results = join_all(
            targets
                .iter()
                .map(|target| self.sync_one(principal, target, with_source)),
        )
        .await;

        let mut errors = MultiError::default();
        for (target, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    cluster = %target.cluster,
                    kind = %target.kind,
                    namespace = %target.namespace,
                    name = %target.name,
                    error = %e,
                    "sync failed"
                );
                errors.push(e);
            }
        }
        errors.into_result()
    }

    async fn sync_one(
        &self,
        principal: &Principal,
        target: &ObjectTarget,
        with_source: bool,
    ) -> Result<()> {
        let gvk = self.kinds.lookup(&target.kind)?;
        let client = self
            .registry
            .impersonated_client_for(principal, &target.cluster)
            .await?;

        if with_source {
            let obj = FluxObject::from_dynamic(
                client.get(&gvk, Some(&target.namespace), &target.name).await?,
            );
            let source = obj.source_ref()?;
            let source_gvk = self.kinds.lookup(&source.kind)?;
            self.reconcile_and_wait(client.as_ref(), &source_gvk, &source.namespace, &source.name)
                .await
                .map_err(|e| e.context(format!("syncing source {}/{}", source.namespace, source.name)))?;
        }

        self.reconcile_and_wait(client.as_ref(), &gvk, &target.namespace, &target.name)
            .await
    }

    async fn reconcile_and_wait(
        &self,
        client: &dyn KubeClient,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let before = FluxObject::from_dynamic(client.get(gvk, Some(namespace), name).await?)
            .last_handled_reconcile_request();
        let requested_at = request_reconciliation(client, gvk, namespace, name).await?;
        debug!(kind = %gvk.kind, namespace = %namespace, name = %name, requested_at = %requested_at, "reconcile requested");

        wait_for_sync(
            client,
            gvk,
            namespace,
            name,
            &before,
            self.poll_interval,
            self.timeout,
        )
        .await?;
        info!(kind = %gvk.kind, namespace = %namespace, name = %name, "reconcile acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{anne, fleet, kustomization, FakeKube};
    use serde_json::Value;

    fn engine(registry: Arc<ClusterRegistry>) -> ReconcileEngine {
        ReconcileEngine::new(
            registry,
            Arc::new(PrimaryKinds::with_flux_kinds().unwrap()),
            Duration::from_millis(5),
            Duration::from_millis(50),
        )
    }

    fn target(kind: &str, name: &str) -> ObjectTarget {
        ObjectTarget {
            cluster: "Default".into(),
            kind: kind.into(),
            name: name.into(),
            namespace: "ns1".into(),
        }
    }

    fn ks_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("kustomize.toolkit.fluxcd.io", "v1", "Kustomization")
    }

    fn requested_at(kube: &FakeKube, kind: &str, name: &str) -> String {
        kube.object(kind, "ns1", name).unwrap()["metadata"]["annotations"]
            [RECONCILE_REQUEST_ANNOTATION]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn helm_fixture() -> FakeKube {
        let kube = FakeKube::new();
        kube.insert(json!({
            "apiVersion": "helm.toolkit.fluxcd.io/v2",
            "kind": "HelmRelease",
            "metadata": {"name": "hr1", "namespace": "ns1"},
            "spec": {"chart": {"spec": {"chart": "podinfo", "sourceRef": {"kind": "HelmRepository", "name": "hr-repo"}}}}
        }));
        kube.insert(json!({
            "apiVersion": "source.toolkit.fluxcd.io/v1",
            "kind": "HelmRepository",
            "metadata": {"name": "hr-repo", "namespace": "ns1"},
            "spec": {"url": "https://stefanprodan.github.io/podinfo"}
        }));
        kube
    }

    #[tokio::test]
    async fn test_request_annotation_is_not_before_request_time() {
        let kube = FakeKube::new();
        kube.insert(kustomization("ns1", "ks1"));

        let issued = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let written = request_reconciliation(&kube, &ks_gvk(), "ns1", "ks1").await.unwrap();
        assert!(written >= issued);
        assert_eq!(requested_at(&kube, "Kustomization", "ks1"), written);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let kube = FakeKube::new();
        kube.insert(kustomization("ns1", "ks1"));
        kube.inject_conflicts(2);

        request_reconciliation(&kube, &ks_gvk(), "ns1", "ks1").await.unwrap();
        assert_eq!(kube.patches().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_waits_for_acknowledgement() {
        let kube = FakeKube::new();
        kube.insert(kustomization("ns1", "ks1"));
        kube.acknowledge_reconcile("Kustomization", "ns1", "ks1");
        let (registry, _) = fleet(&[("Default", kube.clone())]).await;

        engine(registry)
            .sync(&anne(), &[target("Kustomization", "ks1")], false)
            .await
            .unwrap();
        let obj = kube.object("Kustomization", "ns1", "ks1").unwrap();
        assert_eq!(
            obj["status"]["lastHandledReconcileAt"],
            Value::String(requested_at(&kube, "Kustomization", "ks1"))
        );
    }

    #[tokio::test]
    async fn test_sync_times_out_without_controller() {
        let kube = FakeKube::new();
        kube.insert(kustomization("ns1", "ks1"));
        let (registry, _) = fleet(&[("Default", kube)]).await;

        let err = engine(registry)
            .sync(&anne(), &[target("Kustomization", "ks1")], false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), SYNC_TIMEOUT_MESSAGE);
    }

    #[tokio::test]
    async fn test_source_is_synced_before_automation() {
        let kube = helm_fixture();
        kube.acknowledge_reconcile("HelmRepository", "ns1", "hr-repo");
        kube.acknowledge_reconcile("HelmRelease", "ns1", "hr1");
        let (registry, _) = fleet(&[("Default", kube.clone())]).await;

        engine(registry)
            .sync(&anne(), &[target("HelmRelease", "hr1")], true)
            .await
            .unwrap();
        assert_eq!(
            kube.patches(),
            vec![
                ("HelmRepository".to_string(), "hr-repo".to_string()),
                ("HelmRelease".to_string(), "hr1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_source_timeout_leaves_automation_untouched() {
        let kube = helm_fixture();
        kube.acknowledge_reconcile("HelmRelease", "ns1", "hr1");
        let (registry, _) = fleet(&[("Default", kube.clone())]).await;

        let err = engine(registry)
            .sync(&anne(), &[target("HelmRelease", "hr1")], true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().starts_with("syncing source ns1/hr-repo"));
        assert_eq!(
            kube.patches(),
            vec![("HelmRepository".to_string(), "hr-repo".to_string())]
        );
        assert!(kube.object("HelmRelease", "ns1", "hr1").unwrap()["metadata"]
            .get("annotations")
            .is_none());
    }

    #[tokio::test]
    async fn test_with_source_on_source_kind_is_invalid() {
        let kube = helm_fixture();
        let (registry, _) = fleet(&[("Default", kube)]).await;

        let err = engine(registry)
            .sync(&anne(), &[target("HelmRepository", "hr-repo")], true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_batch_collects_every_failure() {
        let kube = FakeKube::new();
        kube.insert(kustomization("ns1", "ks1"));
        kube.acknowledge_reconcile("Kustomization", "ns1", "ks1");
        let (registry, _) = fleet(&[("Default", kube.clone())]).await;

        let err = engine(registry)
            .sync(
                &anne(),
                &[
                    target("Kustomization", "missing-a"),
                    target("Kustomization", "ks1"),
                    target("Kustomization", "missing-b"),
                ],
                false,
            )
            .await
            .unwrap_err();
        match err {
            Error::Multi(multi) => {
                assert_eq!(multi.errors.len(), 2);
                assert!(multi.errors.iter().all(Error::is_not_found));
            }
            other => panic!("expected multi error, got {:?}", other),
        }
        assert_eq!(kube.patches().len(), 1);
    }
}
