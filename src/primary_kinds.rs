/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/primary_kinds.rs
*
* Process-wide registry from short kind names ("Kustomization") to the
* group/version/kind the core reads them through. When several versions of a
* kind are known, the most stable, newest one wins.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::adapter::flux_kinds;
use crate::error::{Error, Result};
use kube::api::GroupVersionKind;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

fn version_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^v(\d+)(?:(alpha|beta)(\d+))?$").ok())
        .as_ref()
        .ok_or_else(|| Error::Internal("version pattern failed to compile".into()))
}

/// Stability of an API version, ordered from least to most stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stability {
    Internal,
    Alpha,
    Beta,
    Stable,
}

/// Ordering key of a version string: major, then stability, then the
/// alpha/beta number. `v2beta1 > v1 > v1beta2 > v1alpha3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionRank {
    pub major: u32,
    pub stability: Stability,
    pub minor: u32,
}

pub fn version_rank(version: &str) -> Result<VersionRank> {
    if version == "__internal" {
        return Ok(VersionRank {
            major: 0,
            stability: Stability::Internal,
            minor: 0,
        });
    }

    let caps = version_pattern()?
        .captures(version)
        .ok_or_else(|| Error::InvalidArgument(format!("invalid version string: {}", version)))?;
    let number = |i: usize| -> Result<u32> {
        caps.get(i)
            .map(|m| m.as_str().parse::<u32>())
            .transpose()
            .map(|n| n.unwrap_or(0))
            .map_err(|_| Error::InvalidArgument(format!("invalid version string: {}", version)))
    };

    let stability = match caps.get(2).map(|m| m.as_str()) {
        Some("alpha") => Stability::Alpha,
        Some("beta") => Stability::Beta,
        _ => Stability::Stable,
    };
    Ok(VersionRank {
        major: number(1)?,
        stability,
        minor: number(3)?,
    })
}

/// Orders two GVKs by version rank, breaking ties on group then kind.
pub fn compare(a: &GroupVersionKind, b: &GroupVersionKind) -> Result<Ordering> {
    let rank_a = version_rank(&a.version)?;
    let rank_b = version_rank(&b.version)?;
    Ok(rank_a
        .cmp(&rank_b)
        .then_with(|| a.group.cmp(&b.group))
        .then_with(|| a.kind.cmp(&b.kind)))
}

#[derive(Debug, Default)]
pub struct PrimaryKinds {
    kinds: RwLock<HashMap<String, GroupVersionKind>>,
}

impl PrimaryKinds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry over every Flux kind the adapter knows.
    pub fn with_flux_kinds() -> Result<Self> {
        Self::from_known(flux_kinds())
    }

    /// Keeps the preferred version of every kind found in `known`.
    pub fn from_known<I>(known: I) -> Result<Self>
    where
        I: IntoIterator<Item = GroupVersionKind>,
    {
        let mut kinds: HashMap<String, GroupVersionKind> = HashMap::new();
        for gvk in known {
            match kinds.get(&gvk.kind) {
                Some(existing) if compare(&gvk, existing)? != Ordering::Greater => {}
                _ => {
                    kinds.insert(gvk.kind.clone(), gvk);
                }
            }
        }
        Ok(Self {
            kinds: RwLock::new(kinds),
        })
    }

    /// Adds a kind; a second registration of the same name is refused since
    /// it means two different uses of one kind string.
    pub fn register(&self, kind: &str, gvk: GroupVersionKind) -> Result<()> {
        let mut kinds = self
            .kinds
            .write()
            .map_err(|_| Error::Internal("primary kinds lock poisoned".into()))?;
        if kinds.contains_key(kind) {
            return Err(Error::InvalidArgument(format!(
                "couldn't add kind {} - already added",
                kind
            )));
        }
        kinds.insert(kind.to_string(), gvk);
        Ok(())
    }

    pub fn lookup(&self, kind: &str) -> Result<GroupVersionKind> {
        let kinds = self
            .kinds
            .read()
            .map_err(|_| Error::Internal("primary kinds lock poisoned".into()))?;
        kinds.get(kind).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("looking up objects of kind {} not supported", kind))
        })
    }
}
