/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/main.rs
*
* Entry point of the gitops-core API server. Loads the configuration, starts
* logging, builds the cluster registry and the namespace cache, and serves
* the RPC methods over HTTP until Ctrl-C. Background refreshers are stopped
* before the process exits.
*
* SPDX-License-Identifier: Apache-2.0 */

use anyhow::Context;
use gitops_core::clusters::{
    ClusterFetcher, ClusterRegistry, FileClusterFetcher, KubeClientFactory, MultiClusterFetcher,
    SingleClusterFetcher,
};
use gitops_core::config::CoreConfig;
use gitops_core::namespace_cache::NamespaceCache;
use gitops_core::primary_kinds::PrimaryKinds;
use gitops_core::server::CoreServer;
use gitops_core::session_logs::S3Provider;
use gitops_core::{http, telemetry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration and logging
    let config = CoreConfig::load().context("loading configuration")?;
    telemetry::init(&config).map_err(|e| anyhow::anyhow!("initialising telemetry: {}", e))?;
    info!(
        default_cluster = %config.default_cluster_name,
        clusters_file = ?config.clusters_file,
        "gitops core starting"
    );

    // 2. Cluster registry
    let mut fetchers: Vec<Arc<dyn ClusterFetcher>> = vec![Arc::new(SingleClusterFetcher::new(
        config.default_cluster_name.clone(),
    ))];
    if let Some(path) = &config.clusters_file {
        fetchers.push(Arc::new(FileClusterFetcher::new(path.clone())));
    }
    let factory = Arc::new(KubeClientFactory::new(
        &config.username_prefix,
        &config.groups_prefix,
        config.client_timeout(),
    ));
    let registry = Arc::new(ClusterRegistry::new(
        Arc::new(MultiClusterFetcher::new(fetchers)),
        factory,
        &config,
    ));
    if let Err(e) = registry.refresh().await {
        warn!(error = %e, "initial cluster fetch failed, serving the default cluster only");
    }
    let cancel = CancellationToken::new();
    let refresher = registry.start(config.cluster_refresh_interval(), cancel.clone());

    // 3. Namespace cache
    let namespaces = Arc::new(
        NamespaceCache::new(registry.clone(), config.namespace_poll_interval())
            .with_user_ttl(config.user_namespace_ttl()),
    );
    namespaces.refresh_all().await;
    namespaces.start();

    // 4. RPC server
    let kinds = Arc::new(PrimaryKinds::with_flux_kinds().context("registering Flux kinds")?);
    let server = Arc::new(CoreServer::new(
        &config,
        registry.clone(),
        namespaces.clone(),
        kinds,
        Arc::new(S3Provider::new(config.object_store_region.clone())),
    ));

    let address: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.listen_address))?;
    let shutdown = cancel.clone();
    let (bound, serving) = warp::serve(http::routes(server))
        .try_bind_with_graceful_shutdown(address, async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
            shutdown.cancel();
        })
        .context("binding the API listener")?;
    info!(address = %bound, "gitops core listening");
    serving.await;

    // 5. Shutdown
    cancel.cancel();
    namespaces.stop().await;
    if let Err(e) = refresher.await {
        warn!(error = %e, "cluster refresh loop ended abnormally");
    }
    info!("gitops core stopped");
    Ok(())
}
