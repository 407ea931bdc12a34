/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/suspend.rs
*
* Suspends and resumes Flux objects. The change is computed on a deep copy
* of the live object and sent as a JSON merge patch, so only `spec.suspend`
* and the audit annotations are written. Suspending records who did it and
* why; resuming removes both records.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::adapter::{merge_patch, FluxObject};
use crate::clusters::{ClusterRegistry, Principal};
use crate::error::{MultiError, Result};
use crate::primary_kinds::PrimaryKinds;
use crate::reconcile::ObjectTarget;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

pub const SUSPENDED_BY_ANNOTATION: &str = "metadata.weave.works/suspended-by";
pub const SUSPENDED_COMMENT_ANNOTATION: &str = "metadata.weave.works/suspended-comment";

pub struct SuspendController {
    registry: Arc<ClusterRegistry>,
    kinds: Arc<PrimaryKinds>,
}

impl SuspendController {
    pub fn new(registry: Arc<ClusterRegistry>, kinds: Arc<PrimaryKinds>) -> Self {
        Self { registry, kinds }
    }

    pub async fn set_suspended(
        &self,
        principal: &Principal,
        targets: &[ObjectTarget],
        suspend: bool,
        comment: &str,
    ) -> Result<()> {
        let results = join_all(
            targets
                .iter()
                .map(|target| self.apply(principal, target, suspend, comment)),
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
                    "suspend/resume failed"
                );
                errors.push(e);
            }
        }
        errors.into_result()
    }

    async fn apply(
        &self,
        principal: &Principal,
        target: &ObjectTarget,
        suspend: bool,
        comment: &str,
    ) -> Result<()> {
        let gvk = self.kinds.lookup(&target.kind)?;
        let client = self
            .registry
            .impersonated_client_for(principal, &target.cluster)
            .await?;
        let live = FluxObject::from_dynamic(
            client.get(&gvk, Some(&target.namespace), &target.name).await?,
        );

        let mut modified = live.deep_copy();
        modified.set_suspended(suspend);
        let mut annotations = modified.annotations();
        if suspend {
            annotations.insert(SUSPENDED_BY_ANNOTATION.to_string(), principal.id.clone());
            annotations.insert(SUSPENDED_COMMENT_ANNOTATION.to_string(), comment.to_string());
        } else {
            annotations.remove(SUSPENDED_BY_ANNOTATION);
            annotations.remove(SUSPENDED_COMMENT_ANNOTATION);
        }
        modified.set_annotations(annotations);

        let patch = merge_patch(&live.to_value()?, &modified.to_value()?);
        client
            .patch_merge(&gvk, Some(&target.namespace), &target.name, &patch)
            .await?;
        info!(
            cluster = %target.cluster,
            kind = %target.kind,
            namespace = %target.namespace,
            name = %target.name,
            suspend,
            principal = %principal.id,
            "suspend state changed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{anne, fleet, kustomization, FakeKube};
    use serde_json::{json, Value};

    async fn controller(kube: &FakeKube) -> SuspendController {
        let (registry, _) = fleet(&[("Default", kube.clone())]).await;
        SuspendController::new(registry, Arc::new(PrimaryKinds::with_flux_kinds().unwrap()))
    }

    fn target(kind: &str, name: &str) -> ObjectTarget {
        ObjectTarget {
            cluster: "Default".into(),
            kind: kind.into(),
            name: name.into(),
            namespace: "ns1".into(),
        }
    }

    #[tokio::test]
    async fn test_suspend_then_resume_kustomization() {
        let kube = FakeKube::new();
        let mut ks = kustomization("ns1", "ks1");
        ks["metadata"]["annotations"] = json!({"team": "platform"});
        kube.insert(ks);
        let controller = controller(&kube).await;
        let targets = [target("Kustomization", "ks1")];

        controller.set_suspended(&anne(), &targets, true, "maint").await.unwrap();
        let obj = kube.object("Kustomization", "ns1", "ks1").unwrap();
        assert_eq!(obj["spec"]["suspend"], Value::Bool(true));
        let annotations = &obj["metadata"]["annotations"];
        assert_eq!(annotations[SUSPENDED_BY_ANNOTATION], "anne");
        assert_eq!(annotations[SUSPENDED_COMMENT_ANNOTATION], "maint");
        assert_eq!(annotations["team"], "platform");

        controller.set_suspended(&anne(), &targets, false, "").await.unwrap();
        let obj = kube.object("Kustomization", "ns1", "ks1").unwrap();
        assert_eq!(obj["spec"]["suspend"], Value::Bool(false));
        let annotations = obj["metadata"]["annotations"].as_object().unwrap();
        assert!(!annotations.contains_key(SUSPENDED_BY_ANNOTATION));
        assert!(!annotations.contains_key(SUSPENDED_COMMENT_ANNOTATION));
        assert_eq!(annotations["team"], "platform");
        // Untouched fields survive the patches.
        assert_eq!(obj["spec"]["path"], "./");
    }

    #[tokio::test]
    async fn test_suspend_source_kind() {
        let kube = FakeKube::new();
        kube.insert(json!({
            "apiVersion": "source.toolkit.fluxcd.io/v1",
            "kind": "GitRepository",
            "metadata": {"name": "repo", "namespace": "ns1"},
            "spec": {"url": "https://example.com/repo.git", "interval": "1m"}
        }));
        let controller = controller(&kube).await;

        controller
            .set_suspended(&anne(), &[target("GitRepository", "repo")], true, "")
            .await
            .unwrap();
        let obj = kube.object("GitRepository", "ns1", "repo").unwrap();
        assert_eq!(obj["spec"]["suspend"], Value::Bool(true));
        assert_eq!(obj["spec"]["url"], "https://example.com/repo.git");
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_batch() {
        let kube = FakeKube::new();
        kube.insert(kustomization("ns1", "ks1"));
        let controller = controller(&kube).await;

        let err = controller
            .set_suspended(
                &anne(),
                &[target("Kustomization", "missing"), target("Kustomization", "ks1")],
                true,
                "",
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let obj = kube.object("Kustomization", "ns1", "ks1").unwrap();
        assert_eq!(obj["spec"]["suspend"], Value::Bool(true));
    }
}
