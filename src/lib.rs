/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/lib.rs
*
* Crate root of gitops-core, the multi-cluster query and control plane for
* Flux CD objects. The binary in `main.rs` wires these modules together; the
* library is kept separate so every engine can be driven from tests against
* in-memory clusters.
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod adapter;
pub mod clusters;
pub mod config;
pub mod crds;
pub mod error;
pub mod health;
pub mod http;
pub mod inventory;
pub mod namespace_access;
pub mod namespace_cache;
pub mod policy;
pub mod primary_kinds;
pub mod query;
pub mod reconcile;
pub mod retry;
pub mod server;
pub mod session_logs;
pub mod suspend;
pub mod telemetry;

#[cfg(test)]
pub mod testutil;

pub use error::{Error, Result};
