/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/config.rs
*
* Runtime configuration of the core. Every option has a built-in default;
* an optional YAML file (path in GITOPS_CORE_CONFIG) overrides the defaults,
* and GITOPS_CORE_* environment variables override the file for the scalar
* options. Durations are expressed in seconds in both sources.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "GITOPS_CORE_CONFIG";
const ENV_PREFIX: &str = "GITOPS_CORE_";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "snake_case")]
pub struct CoreConfig {
    pub default_cluster_name: String,
    pub username_prefix: String,
    pub groups_prefix: String,
    pub flux_namespace: String,
    pub namespace_poll_interval_secs: u64,
    /// Fractional seconds are accepted so tests can shrink the reconcile loop.
    pub reconcile_timeout_secs: f64,
    pub reconcile_poll_interval_secs: f64,
    pub log_bucket_name: String,
    /// Bucket holding the fluent-bit records of pods.
    pub pod_log_bucket_name: String,
    pub object_store_region: String,
    /// How long the namespaces a principal may read are reused.
    pub user_namespace_ttl_secs: u64,

    pub listen_address: String,
    pub clusters_file: Option<PathBuf>,
    pub cluster_refresh_interval_secs: u64,
    pub client_cache_ttl_secs: u64,
    pub client_timeout_secs: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_cluster_name: "Default".to_string(),
            username_prefix: String::new(),
            groups_prefix: String::new(),
            flux_namespace: "flux-system".to_string(),
            namespace_poll_interval_secs: 300,
            reconcile_timeout_secs: 60.0,
            reconcile_poll_interval_secs: 2.0,
            log_bucket_name: "gitops-run-logs".to_string(),
            pod_log_bucket_name: "pod-logs".to_string(),
            object_store_region: "us-east-1".to_string(),
            user_namespace_ttl_secs: 30,
            listen_address: "0.0.0.0:9001".to_string(),
            clusters_file: None,
            cluster_refresh_interval_secs: 30,
            client_cache_ttl_secs: 30,
            client_timeout_secs: 30,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl CoreConfig {
    /// Defaults, then the file named by GITOPS_CORE_CONFIG, then the environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("reading config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| Error::InvalidArgument(format!("parsing config: {}", e)))
    }

    /// `lookup` receives the option name in upper case, without prefix.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let strings: [(&str, &mut String); 9] = [
            ("DEFAULT_CLUSTER_NAME", &mut self.default_cluster_name),
            ("USERNAME_PREFIX", &mut self.username_prefix),
            ("GROUPS_PREFIX", &mut self.groups_prefix),
            ("FLUX_NAMESPACE", &mut self.flux_namespace),
            ("LOG_BUCKET_NAME", &mut self.log_bucket_name),
            ("POD_LOG_BUCKET_NAME", &mut self.pod_log_bucket_name),
            ("OBJECT_STORE_REGION", &mut self.object_store_region),
            ("LISTEN_ADDRESS", &mut self.listen_address),
            ("LOG_LEVEL", &mut self.log_level),
        ];
        for (key, slot) in strings {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        }

        let seconds: [(&str, &mut u64); 5] = [
            ("NAMESPACE_POLL_INTERVAL_SECS", &mut self.namespace_poll_interval_secs),
            ("CLUSTER_REFRESH_INTERVAL_SECS", &mut self.cluster_refresh_interval_secs),
            ("CLIENT_CACHE_TTL_SECS", &mut self.client_cache_ttl_secs),
            ("CLIENT_TIMEOUT_SECS", &mut self.client_timeout_secs),
            ("USER_NAMESPACE_TTL_SECS", &mut self.user_namespace_ttl_secs),
        ];
        for (key, slot) in seconds {
            if let Some(value) = lookup(key) {
                *slot = value.parse().map_err(|_| {
                    Error::InvalidArgument(format!("{}{} must be an integer", ENV_PREFIX, key))
                })?;
            }
        }

        let fractional: [(&str, &mut f64); 2] = [
            ("RECONCILE_TIMEOUT_SECS", &mut self.reconcile_timeout_secs),
            ("RECONCILE_POLL_INTERVAL_SECS", &mut self.reconcile_poll_interval_secs),
        ];
        for (key, slot) in fractional {
            if let Some(value) = lookup(key) {
                *slot = value.parse().map_err(|_| {
                    Error::InvalidArgument(format!("{}{} must be a number", ENV_PREFIX, key))
                })?;
            }
        }

        if let Some(path) = lookup("CLUSTERS_FILE") {
            self.clusters_file = Some(PathBuf::from(path));
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.log_format = match format.as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(Error::InvalidArgument(format!("unknown log format '{}'", other)))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_cluster_name.trim().is_empty() {
            return Err(Error::InvalidArgument("default_cluster_name must not be empty".into()));
        }
        if self.namespace_poll_interval_secs == 0 || self.cluster_refresh_interval_secs == 0 {
            return Err(Error::InvalidArgument("poll intervals must be greater than zero".into()));
        }
        if self.reconcile_poll_interval_secs <= 0.0 || self.reconcile_timeout_secs <= 0.0 {
            return Err(Error::InvalidArgument(
                "reconcile timeout and poll interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn namespace_poll_interval(&self) -> Duration {
        Duration::from_secs(self.namespace_poll_interval_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.reconcile_timeout_secs)
    }

    pub fn reconcile_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconcile_poll_interval_secs)
    }

    pub fn cluster_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cluster_refresh_interval_secs)
    }

    pub fn client_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.client_cache_ttl_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn user_namespace_ttl(&self) -> Duration {
        Duration::from_secs(self.user_namespace_ttl_secs)
    }
}
