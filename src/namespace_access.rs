/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/namespace_access.rs
*
* Decides which namespaces a principal may read. For every namespace in a
* cluster snapshot the impersonated client asks the API server what it is
* allowed to do there (a SelfSubjectRulesReview); the namespace is kept when
* the granted rules cover every required (group, resource, verb) triple.
* Rules may be spread over several roles. Rules limited to named objects do
* not count.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::clusters::KubeClient;
use crate::error::{Error, Result};
use futures::future::join_all;
use k8s_openapi::api::authorization::v1::ResourceRule;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1 as rbac;
use tracing::debug;

const WILDCARD: &str = "*";

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> rbac::PolicyRule {
    let owned = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
    rbac::PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

/// What a principal needs in a namespace before the core shows it to them.
pub fn default_rules() -> Vec<rbac::PolicyRule> {
    let read = ["get", "list"];
    vec![
        rule(&[""], &["secrets", "pods", "events"], &read),
        rule(&["apps"], &["deployments", "replicasets"], &read),
        rule(&["kustomize.toolkit.fluxcd.io"], &["kustomizations"], &read),
        rule(&["helm.toolkit.fluxcd.io"], &["helmreleases"], &read),
        rule(
            &["source.toolkit.fluxcd.io"],
            &["buckets", "helmcharts", "gitrepositories", "helmrepositories", "ocirepositories"],
            &read,
        ),
    ]
}

fn covers(values: Option<&Vec<String>>, wanted: &str) -> bool {
    values
        .into_iter()
        .flatten()
        .any(|v| v == WILDCARD || v == wanted)
}

fn grants(granted: &ResourceRule, group: &str, resource: &str, verb: &str) -> bool {
    let unrestricted = granted.resource_names.as_ref().map_or(true, Vec::is_empty);
    unrestricted
        && covers(granted.api_groups.as_ref(), group)
        && covers(granted.resources.as_ref(), resource)
        && covers(Some(&granted.verbs), verb)
}

/// True when `granted` allows every triple named by `required`.
pub fn has_all_rules(granted: &[ResourceRule], required: &[rbac::PolicyRule]) -> bool {
    required.iter().all(|req| {
        let groups = req.api_groups.as_deref().unwrap_or_default();
        let resources = req.resources.as_deref().unwrap_or_default();
        groups.iter().all(|group| {
            resources.iter().all(|resource| {
                req.verbs
                    .iter()
                    .all(|verb| granted.iter().any(|g| grants(g, group, resource, verb)))
            })
        })
    })
}

#[derive(Debug, Clone)]
pub struct NamespaceChecker {
    required: Vec<rbac::PolicyRule>,
}

impl Default for NamespaceChecker {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl NamespaceChecker {
    pub fn new(required: Vec<rbac::PolicyRule>) -> Self {
        Self { required }
    }

    /// The subset of `namespaces` the client's identity may read, in the
    /// order given. Any failed review fails the whole filter.
    pub async fn filter_accessible(
        &self,
        client: &dyn KubeClient,
        namespaces: &[Namespace],
    ) -> Result<Vec<Namespace>> {
        let reviews = join_all(namespaces.iter().map(|ns| async move {
            let name = ns.metadata.name.as_deref().unwrap_or_default();
            let rules = client.resource_rules(name).await?;
            Ok::<_, Error>(has_all_rules(&rules, &self.required))
        }))
        .await;

        let mut accessible = Vec::new();
        for (ns, allowed) in namespaces.iter().zip(reviews) {
            if allowed? {
                accessible.push(ns.clone());
            } else {
                debug!(namespace = ?ns.metadata.name, "namespace not accessible");
            }
        }
        Ok(accessible)
    }
}
