/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/session_logs.rs
*
* Reads the logs of interactive development sessions. Each record is stored
* as one object in an S3-compatible bucket, keyed under the session id, so a
* lexicographic listing is the log order. Callers page through a session by
* passing back the last key they received.
*
* Pod logs shipped by fluent-bit live in a second bucket of the same store,
* under `fluent-bit-logs`, one JSON record per line. A read merges both
* streams by sorting key and reports every pod log source it saw. The cursor
* handed to callers is `<session key>,<pod key>`.
*
* The bucket endpoint and credentials come from the cluster the session runs
* on: the `run-dev-bucket` Bucket source and the `run-dev-bucket-credentials`
* secret, looked up in the session namespace and then in the Flux namespace.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::adapter::gvk_of;
use crate::clusters::client::{get_typed, secret_gvk};
use crate::clusters::{ClusterRegistry, KubeClient, Principal};
use crate::crds::Bucket;
use crate::error::{Error, Result};
use crate::namespace_cache::NamespaceCache;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::GroupVersionKind;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

pub const RUN_DEV_BUCKET_CREDENTIALS: &str = "run-dev-bucket-credentials";
pub const RUN_DEV_BUCKET_NAME: &str = "run-dev-bucket";
/// Session id under which logs of the host cluster itself are stored.
pub const NO_SESSION: &str = "no-session";
/// Source name of records written by the session client.
pub const SESSION_LOG_SOURCE: &str = "gitops-run-client";
pub const POD_LOG_PREFIX: &str = "fluent-bit-logs";

// --- Object store seam ---

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys under `prefix` strictly after `start_after`, in lexicographic order.
    async fn list_keys(&self, bucket: &str, prefix: &str, start_after: &str) -> Result<Vec<String>>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Where a session's bucket lives and how to authenticate to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConnection {
    pub endpoint: String,
    pub insecure: bool,
    pub access_key: String,
    pub secret_key: String,
}

impl BucketConnection {
    /// Endpoint as a URL. Bucket sources usually carry a bare `host:port`.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            return self.endpoint.clone();
        }
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

#[async_trait]
pub trait ObjectStoreProvider: Send + Sync {
    async fn connect(&self, connection: &BucketConnection) -> Result<Arc<dyn ObjectStore>>;
}

// --- S3 implementation ---

pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub async fn connect(connection: &BucketConnection, region: &str) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            &connection.access_key,
            &connection.secret_key,
            None,
            None,
            "gitops-core",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .endpoint_url(connection.endpoint_url())
            .force_path_style(true)
            .build();
        Self {
            client: S3Client::from_conf(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_keys(&self, bucket: &str, prefix: &str, start_after: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if !start_after.is_empty() {
                request = request.start_after(start_after);
            }
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let page = request.send().await.map_err(|e| {
                Error::Unavailable(format!("listing s3://{}/{}: {}", bucket, prefix, e))
            })?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("reading s3://{}/{}: {}", bucket, key, e)))?;
        let body = object
            .body
            .collect()
            .await
            .map_err(|e| Error::Unavailable(format!("reading s3://{}/{}: {}", bucket, key, e)))?;
        Ok(body.into_bytes().to_vec())
    }
}

pub struct S3Provider {
    region: String,
}

impl S3Provider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

#[async_trait]
impl ObjectStoreProvider for S3Provider {
    async fn connect(&self, connection: &BucketConnection) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3ObjectStore::connect(connection, &self.region).await))
    }
}

// --- Records and reading ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntry {
    pub sorting_key: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub source: String,
}

impl LogEntry {
    fn parse(key: &str, body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| LogEntry {
            sorting_key: key.to_string(),
            message: String::from_utf8_lossy(body).trim_end().to_string(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLogs {
    pub logs: Vec<LogEntry>,
    /// Cursor after the last record read; empty when nothing new was found.
    /// Callers keep their previous cursor in that case and pass it again on
    /// the next poll.
    pub next_token: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_sources: Vec<String>,
}

/// Reads the records of `session_id` after `token`, one object at a time.
/// Any store failure aborts the read; the caller retries with its last token.
pub async fn read_session(
    store: &dyn ObjectStore,
    bucket: &str,
    session_id: &str,
    token: &str,
    level: &str,
) -> Result<SessionLogs> {
    let mut logs = SessionLogs::default();
    for key in store.list_keys(bucket, session_id, token).await? {
        if key.as_str() <= token {
            continue;
        }
        let body = store.get_object(bucket, &key).await?;
        let entry = LogEntry::parse(&key, &body);
        if level.is_empty() || entry.level == level {
            logs.logs.push(entry);
        }
        logs.next_token = key;
    }
    Ok(logs)
}

// --- Pod logs ---

fn level_patterns() -> Result<&'static (Regex, Regex)> {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| Some((Regex::new(r"err|fatal|ftl").ok()?, Regex::new(r"warn|wrn").ok()?)))
        .as_ref()
        .ok_or_else(|| Error::Internal("log level patterns failed to compile".into()))
}

/// Maps free text (a level field or the message itself) to error, warning or info.
pub fn detect_log_level(text: &str) -> Result<&'static str> {
    let (error, warning) = level_patterns()?;
    let text = text.to_lowercase();
    Ok(if error.is_match(&text) {
        "error"
    } else if warning.is_match(&text) {
        "warning"
    } else {
        "info"
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodLogRecord {
    time: Option<DateTime<Utc>>,
    log: String,
    msg: String,
    level: String,
    kubernetes: PodMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodMeta {
    pod_name: String,
    namespace_name: String,
    labels: Option<BTreeMap<String, String>>,
}

impl PodLogRecord {
    fn message(&self) -> &str {
        if self.log.is_empty() {
            &self.msg
        } else {
            &self.log
        }
    }

    /// `<namespace>/<app label>`, or `<namespace>/<pod>` for unlabelled pods.
    fn source(&self) -> String {
        let meta = &self.kubernetes;
        let name = meta
            .labels
            .as_ref()
            .and_then(|labels| labels.get("app"))
            .unwrap_or(&meta.pod_name);
        format!("{}/{}", meta.namespace_name, name)
    }
}

/// Reads pod log records stored after `token`. `source` and `level` keep
/// records whose source or detected level contains them; every source seen
/// is reported, filtered or not. Lines that are not records are skipped.
pub async fn read_pod_logs(
    store: &dyn ObjectStore,
    bucket: &str,
    token: &str,
    source: &str,
    level: &str,
) -> Result<SessionLogs> {
    let mut logs = SessionLogs::default();
    let mut sources = BTreeSet::new();
    for key in store.list_keys(bucket, POD_LOG_PREFIX, token).await? {
        if key.as_str() <= token {
            continue;
        }
        let body = store.get_object(bucket, &key).await?;
        for line in String::from_utf8_lossy(&body).lines().filter(|l| !l.trim().is_empty()) {
            let record: PodLogRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed pod log line");
                    continue;
                }
            };
            let message = record.message();
            if message.is_empty() || message == "&{   }" {
                continue;
            }

            let entry_source = record.source();
            sources.insert(entry_source.clone());
            let detected = if record.level.is_empty() {
                detect_log_level(message)?
            } else {
                detect_log_level(&record.level)?
            };
            if !entry_source.contains(source) || !detected.contains(level) {
                continue;
            }

            let time = record.time.unwrap_or_default();
            logs.logs.push(LogEntry {
                sorting_key: time.timestamp_nanos_opt().unwrap_or_default().to_string(),
                timestamp: time.to_rfc3339_opts(SecondsFormat::Secs, true),
                level: detected.to_string(),
                message: message.to_string(),
                source: entry_source,
            });
        }
        logs.next_token = key;
    }
    logs.log_sources = sources.into_iter().collect();
    Ok(logs)
}

/// Position in both log streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCursor {
    pub session: String,
    pub pods: String,
}

impl LogCursor {
    /// A token without a comma is a session-only cursor.
    pub fn parse(token: &str) -> Self {
        match token.split_once(',') {
            Some((session, pods)) => Self {
                session: session.to_string(),
                pods: pods.to_string(),
            },
            None => Self {
                session: token.to_string(),
                pods: String::new(),
            },
        }
    }

    pub fn encode(&self) -> String {
        format!("{},{}", self.session, self.pods)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLogRequest {
    pub cluster: String,
    pub session_namespace: String,
    pub session_id: String,
    pub token: String,
    pub log_level: String,
    /// Keep only records whose source contains this; `gitops-run-client`
    /// selects the session stream alone.
    pub log_source_filter: String,
}

pub struct SessionLogReader {
    registry: Arc<ClusterRegistry>,
    namespaces: Arc<NamespaceCache>,
    provider: Arc<dyn ObjectStoreProvider>,
    bucket: String,
    pod_bucket: String,
    flux_namespace: String,
}

impl SessionLogReader {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        namespaces: Arc<NamespaceCache>,
        provider: Arc<dyn ObjectStoreProvider>,
        bucket: impl Into<String>,
        flux_namespace: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            namespaces,
            provider,
            bucket: bucket.into(),
            pod_bucket: "pod-logs".into(),
            flux_namespace: flux_namespace.into(),
        }
    }

    pub fn with_pod_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.pod_bucket = bucket.into();
        self
    }

    pub async fn read(&self, principal: &Principal, req: &SessionLogRequest) -> Result<SessionLogs> {
        if req.session_id.is_empty() {
            return Err(Error::InvalidArgument("a session id is required".into()));
        }
        let cluster = if req.session_id == NO_SESSION || req.cluster.is_empty() {
            self.registry.default_cluster_name().to_string()
        } else {
            req.cluster.clone()
        };
        let client = self.registry.impersonated_client_for(principal, &cluster).await?;

        let flux_namespace = self.namespaces.flux_namespace(&cluster, &self.flux_namespace);
        let mut search = Vec::new();
        if !req.session_namespace.is_empty() {
            search.push(req.session_namespace.as_str());
        }
        if !search.contains(&flux_namespace.as_str()) {
            search.push(flux_namespace.as_str());
        }

        let connection = bucket_connection(client.as_ref(), &search).await?;
        debug!(cluster = %cluster, endpoint = %connection.endpoint, "connecting to session log bucket");
        let store = self.provider.connect(&connection).await?;

        let cursor = LogCursor::parse(&req.token);
        let mut next = cursor.clone();
        let mut logs = SessionLogs::default();

        let source = req.log_source_filter.as_str();
        if source.is_empty() || source == SESSION_LOG_SOURCE {
            let session = read_session(
                store.as_ref(),
                &self.bucket,
                &req.session_id,
                &cursor.session,
                &req.log_level,
            )
            .await?;
            if !session.next_token.is_empty() {
                next.session = session.next_token;
            }
            logs.logs = session.logs;
        }

        let pods = read_pod_logs(store.as_ref(), &self.pod_bucket, &cursor.pods, source, &req.log_level).await?;
        if !pods.next_token.is_empty() {
            next.pods = pods.next_token;
        }
        if !pods.logs.is_empty() {
            logs.logs.extend(pods.logs);
            logs.logs
                .sort_by_key(|entry| entry.sorting_key.parse::<i64>().unwrap_or_default());
        }

        if next != cursor {
            logs.next_token = next.encode();
        }
        logs.log_sources = std::iter::once(SESSION_LOG_SOURCE.to_string())
            .chain(pods.log_sources)
            .collect();
        info!(
            cluster = %cluster,
            session = %req.session_id,
            count = logs.logs.len(),
            "read session logs"
        );
        Ok(logs)
    }
}

/// First namespace in `search` that holds the named object.
async fn find_in<K: DeserializeOwned>(
    client: &dyn KubeClient,
    gvk: &GroupVersionKind,
    search: &[&str],
    name: &str,
) -> Result<K> {
    for namespace in search {
        match get_typed::<K>(client, gvk, Some(namespace), name).await {
            Err(e) if e.is_not_found() => continue,
            other => return other,
        }
    }
    Err(Error::NotFound(format!(
        "{} {} not found in namespaces {}",
        gvk.kind,
        name,
        search.join(", ")
    )))
}

async fn bucket_connection(client: &dyn KubeClient, search: &[&str]) -> Result<BucketConnection> {
    let secret: Secret = find_in(client, &secret_gvk(), search, RUN_DEV_BUCKET_CREDENTIALS).await?;
    let bucket: Bucket = find_in(client, &gvk_of::<Bucket>(), search, RUN_DEV_BUCKET_NAME).await?;

    let data = secret.data.unwrap_or_default();
    let key = |name: &str| -> Result<String> {
        let value = data.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!("secret {} has no {} key", RUN_DEV_BUCKET_CREDENTIALS, name))
        })?;
        Ok(String::from_utf8_lossy(&value.0).to_string())
    };

    Ok(BucketConnection {
        endpoint: bucket.spec.endpoint,
        insecure: bucket.spec.insecure,
        access_key: key("accesskey")?,
        secret_key: key("secretkey")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{anne, fleet, namespace, FakeKube};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeStore {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        failing: Mutex<bool>,
    }

    impl FakeStore {
        fn put(&self, key: &str, body: &str) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), body.as_bytes().to_vec());
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn list_keys(&self, _bucket: &str, prefix: &str, start_after: &str) -> Result<Vec<String>> {
            if *self.failing.lock().unwrap() {
                return Err(Error::Unavailable("connection reset".into()));
            }
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix) && k.as_str() > start_after)
                .cloned()
                .collect())
        }

        async fn get_object(&self, _bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NotFound(key.to_string()))
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        store: Arc<FakeStore>,
        connections: Mutex<Vec<BucketConnection>>,
    }

    #[async_trait]
    impl ObjectStoreProvider for FakeProvider {
        async fn connect(&self, connection: &BucketConnection) -> Result<Arc<dyn ObjectStore>> {
            self.connections.lock().unwrap().push(connection.clone());
            Ok(self.store.clone())
        }
    }

    fn record(key: &str, level: &str, message: &str) -> String {
        json!({
            "sortingKey": key,
            "timestamp": "2024-03-01T10:20:30Z",
            "level": level,
            "message": message,
            "source": "gitops-run",
        })
        .to_string()
    }

    fn seeded_store() -> FakeStore {
        let store = FakeStore::default();
        store.put("s1/0001", &record("1", "info", "starting"));
        store.put("s1/0002", &record("2", "error", "boom"));
        store.put("s1/0003", "plain text line\n");
        store.put("s2/0001", &record("1", "info", "other session"));
        store
    }

    #[tokio::test]
    async fn test_cursor_advances() {
        let store = seeded_store();

        let first = read_session(&store, "logs", "s1", "", "").await.unwrap();
        assert_eq!(first.logs.len(), 3);
        assert_eq!(first.logs[0].message, "starting");
        assert_eq!(first.logs[2].message, "plain text line");
        assert_eq!(first.logs[2].sorting_key, "s1/0003");
        assert_eq!(first.next_token, "s1/0003");

        let idle = read_session(&store, "logs", "s1", &first.next_token, "").await.unwrap();
        assert!(idle.logs.is_empty());
        assert_eq!(idle.next_token, "");

        store.put("s1/0004", &record("4", "info", "done"));
        let more = read_session(&store, "logs", "s1", &first.next_token, "").await.unwrap();
        assert_eq!(more.logs.len(), 1);
        assert_eq!(more.logs[0].message, "done");
        assert_eq!(more.next_token, "s1/0004");
    }

    #[tokio::test]
    async fn test_level_filter_still_advances_cursor() {
        let store = seeded_store();
        let errors = read_session(&store, "logs", "s1", "", "error").await.unwrap();
        assert_eq!(errors.logs.len(), 1);
        assert_eq!(errors.logs[0].message, "boom");
        assert_eq!(errors.next_token, "s1/0003");
    }

    #[tokio::test]
    async fn test_store_failure_aborts() {
        let store = seeded_store();
        *store.failing.lock().unwrap() = true;
        let err = read_session(&store, "logs", "s1", "", "").await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
    }

    #[test]
    fn test_endpoint_url() {
        let mut connection = BucketConnection {
            endpoint: "run-dev-bucket.flux-system.svc:9000".into(),
            insecure: true,
            access_key: "a".into(),
            secret_key: "s".into(),
        };
        assert_eq!(connection.endpoint_url(), "http://run-dev-bucket.flux-system.svc:9000");
        connection.insecure = false;
        assert_eq!(connection.endpoint_url(), "https://run-dev-bucket.flux-system.svc:9000");
        connection.endpoint = "http://minio:9000".into();
        assert_eq!(connection.endpoint_url(), "http://minio:9000");
    }

    fn bucket_objects(kube: &FakeKube, ns: &str) {
        kube.insert(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": RUN_DEV_BUCKET_CREDENTIALS, "namespace": ns},
            // "user" / "pass"
            "data": {"accesskey": "dXNlcg==", "secretkey": "cGFzcw=="}
        }));
        kube.insert(json!({
            "apiVersion": "source.toolkit.fluxcd.io/v1",
            "kind": "Bucket",
            "metadata": {"name": RUN_DEV_BUCKET_NAME, "namespace": ns},
            "spec": {"bucketName": "gitops-run-logs", "endpoint": "run-dev-bucket.flux-system.svc:9000", "insecure": true, "interval": "1m"}
        }));
    }

    async fn reader(kube: &FakeKube, provider: Arc<FakeProvider>) -> SessionLogReader {
        let (registry, _) = fleet(&[("Default", kube.clone())]).await;
        let cache = Arc::new(NamespaceCache::new(registry.clone(), Duration::from_secs(300)));
        cache.refresh_all().await;
        SessionLogReader::new(registry, cache, provider, "gitops-run-logs", "flux-system")
    }

    #[tokio::test]
    async fn test_no_session_reads_default_cluster_via_flux_namespace() {
        let kube = FakeKube::new();
        kube.insert(namespace("flux", json!({"app.kubernetes.io/part-of": "flux"})));
        bucket_objects(&kube, "flux");
        let provider = Arc::new(FakeProvider {
            store: Arc::new(seeded_store()),
            ..Default::default()
        });
        provider.store.put("no-session/0001", &record("1", "info", "host"));
        let reader = reader(&kube, provider.clone()).await;

        let req = SessionLogRequest {
            cluster: "elsewhere".into(),
            session_id: NO_SESSION.into(),
            ..Default::default()
        };
        let logs = reader.read(&anne(), &req).await.unwrap();
        assert_eq!(logs.logs.len(), 1);
        assert_eq!(logs.logs[0].message, "host");

        let connections = provider.connections.lock().unwrap();
        assert_eq!(
            connections[0],
            BucketConnection {
                endpoint: "run-dev-bucket.flux-system.svc:9000".into(),
                insecure: true,
                access_key: "user".into(),
                secret_key: "pass".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_session_namespace_takes_precedence() {
        let kube = FakeKube::new();
        bucket_objects(&kube, "dev");
        let provider = Arc::new(FakeProvider {
            store: Arc::new(seeded_store()),
            ..Default::default()
        });
        let reader = reader(&kube, provider).await;

        let req = SessionLogRequest {
            cluster: "Default".into(),
            session_namespace: "dev".into(),
            session_id: "s1".into(),
            log_level: "info".into(),
            ..Default::default()
        };
        let logs = reader.read(&anne(), &req).await.unwrap();
        assert_eq!(logs.logs.len(), 1);
        assert_eq!(logs.logs[0].message, "starting");
    }

    fn pod_line(time: &str, namespace: &str, app: Option<&str>, level: &str, log: &str) -> String {
        let labels = app.map(|app| json!({"app": app}));
        json!({
            "time": time,
            "log": log,
            "level": level,
            "kubernetes": {"pod_name": "web-7d9f", "namespace_name": namespace, "labels": labels},
        })
        .to_string()
    }

    #[test]
    fn test_detect_log_level() {
        assert_eq!(detect_log_level("ERROR: disk full").unwrap(), "error");
        assert_eq!(detect_log_level("FTL").unwrap(), "error");
        assert_eq!(detect_log_level("Warning: retrying").unwrap(), "warning");
        assert_eq!(detect_log_level("wrn").unwrap(), "warning");
        assert_eq!(detect_log_level("listening on :8080").unwrap(), "info");
    }

    #[test]
    fn test_log_cursor_parse() {
        let cursor = LogCursor::parse("s1/0003,fluent-bit-logs/b");
        assert_eq!(cursor.session, "s1/0003");
        assert_eq!(cursor.pods, "fluent-bit-logs/b");
        assert_eq!(cursor.encode(), "s1/0003,fluent-bit-logs/b");

        assert_eq!(LogCursor::parse("s1/0003").pods, "");
        assert_eq!(LogCursor::parse(""), LogCursor::default());
    }

    #[tokio::test]
    async fn test_pod_logs_sources_and_filters() {
        let store = FakeStore::default();
        let body = [
            pod_line("2024-03-01T10:00:01Z", "apps", Some("web"), "", "GET / 200"),
            pod_line("2024-03-01T10:00:02Z", "apps", None, "", "connection error"),
            pod_line("2024-03-01T10:00:03Z", "apps", Some("web"), "warn", "slow request"),
            pod_line("2024-03-01T10:00:04Z", "apps", Some("web"), "", "&{   }"),
            "not json".to_string(),
        ]
        .join("\n");
        store.put("fluent-bit-logs/a", &body);

        let all = read_pod_logs(&store, "pod-logs", "", "", "").await.unwrap();
        assert_eq!(all.logs.len(), 3);
        assert_eq!(all.log_sources, vec!["apps/web", "apps/web-7d9f"]);
        assert_eq!(all.next_token, "fluent-bit-logs/a");
        assert_eq!(all.logs[0].timestamp, "2024-03-01T10:00:01Z");
        assert_eq!(all.logs[1].level, "error");
        assert_eq!(all.logs[2].level, "warning");

        let web = read_pod_logs(&store, "pod-logs", "", "apps/web", "warn").await.unwrap();
        assert_eq!(web.logs.len(), 1);
        assert_eq!(web.logs[0].message, "slow request");
        assert_eq!(web.log_sources.len(), 2);

        let idle = read_pod_logs(&store, "pod-logs", "fluent-bit-logs/a", "", "").await.unwrap();
        assert!(idle.logs.is_empty());
        assert_eq!(idle.next_token, "");
    }

    #[tokio::test]
    async fn test_reader_merges_streams_and_keeps_cursor() {
        let kube = FakeKube::new();
        bucket_objects(&kube, "dev");
        let store = FakeStore::default();
        let at = |secs: i64| (secs * 1_000_000_000).to_string();
        store.put("s1/0001", &record(&at(1_709_287_201), "info", "starting"));
        store.put("s1/0002", &record(&at(1_709_287_203), "info", "done"));
        store.put(
            "fluent-bit-logs/a",
            &pod_line("2024-03-01T10:00:02Z", "apps", Some("web"), "", "serving"),
        );
        let provider = Arc::new(FakeProvider {
            store: Arc::new(store),
            ..Default::default()
        });
        let reader = reader(&kube, provider.clone()).await;

        let mut req = SessionLogRequest {
            cluster: "Default".into(),
            session_namespace: "dev".into(),
            session_id: "s1".into(),
            ..Default::default()
        };
        let logs = reader.read(&anne(), &req).await.unwrap();
        let messages: Vec<_> = logs.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["starting", "serving", "done"]);
        assert_eq!(logs.next_token, "s1/0002,fluent-bit-logs/a");
        assert_eq!(logs.log_sources, vec![SESSION_LOG_SOURCE, "apps/web"]);

        provider.store.put("s1/0003", &record(&at(1_709_287_205), "info", "again"));
        req.token = logs.next_token.clone();
        let more = reader.read(&anne(), &req).await.unwrap();
        assert_eq!(more.logs.len(), 1);
        assert_eq!(more.next_token, "s1/0003,fluent-bit-logs/a");

        req.token = more.next_token;
        let idle = reader.read(&anne(), &req).await.unwrap();
        assert!(idle.logs.is_empty());
        assert_eq!(idle.next_token, "");

        req.token = String::new();
        req.log_source_filter = SESSION_LOG_SOURCE.into();
        let session_only = reader.read(&anne(), &req).await.unwrap();
        assert_eq!(session_only.logs.len(), 3);
        assert!(session_only.logs.iter().all(|l| l.source == "gitops-run"));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_not_found() {
        let kube = FakeKube::new();
        let reader = reader(&kube, Arc::new(FakeProvider::default())).await;
        let req = SessionLogRequest {
            session_id: "s1".into(),
            ..Default::default()
        };
        let err = reader.read(&anne(), &req).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains(RUN_DEV_BUCKET_CREDENTIALS));
    }
}
