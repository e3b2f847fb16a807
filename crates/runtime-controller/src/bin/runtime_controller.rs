/*
 * Workspaces Platform - Runtime Controller
 * Copyright (C) 2025 Workspaces Platform
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Runtime controller service
//!
//! - Serves the namespace endpoints, access tokens and broker completion reports
//! - Settles runtimes left mid-transition by a previous process
//! - Provides health and readiness endpoints

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use runtime_controller::api::{build_router, AppState};
use runtime_controller::broker::BrokerEvents;
use runtime_controller::cluster::{ClusterClient, KubeClusterClient};
use runtime_controller::config::{StateStoreKind, DEFAULT_CONFIG_PATH};
use runtime_controller::driver;
use runtime_controller::namespace::NamespaceManager;
use runtime_controller::runtime::{ConfigMapStateStore, InMemoryStateStore, RuntimeStateStore};
use runtime_controller::{ControllerConfig, RuntimeOrchestrator};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "runtime-controller")]
#[command(about = "Workspace runtime orchestration service")]
#[command(version)]
struct Cli {
    /// Mounted configuration file
    #[arg(long, env = "RUNTIME_CONTROLLER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[arg(long, env = "RUNTIME_CONTROLLER_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &str) -> anyhow::Result<ControllerConfig> {
    let mut config = ControllerConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {path}"))?;
    if Path::new(path).exists() {
        info!("Loaded controller configuration from {}", path);
    } else {
        info!("No configuration at {}, using defaults", path);
    }
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!(
        "Starting runtime controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_config(&cli.config)?;
    info!(
        infrastructure = ?config.infrastructure,
        strategy = ?config.exposure.strategy,
        signer_proxy = config.signer_proxy.enabled,
        "Configuration ready"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to connect to the cluster")?;
    info!("Connected to Kubernetes cluster");

    let cluster: Arc<dyn ClusterClient> =
        Arc::new(KubeClusterClient::new(client.clone(), config.infrastructure));
    let driver = driver::from_config(&config, cluster.clone());
    let store: Arc<dyn RuntimeStateStore> = match config.state_store.kind {
        StateStoreKind::ConfigMap => Arc::new(ConfigMapStateStore::new(
            client,
            &config.state_store.namespace,
        )),
        StateStoreKind::Memory => {
            warn!("Runtime state is kept in memory and will not survive a restart");
            Arc::new(InMemoryStateStore::new())
        }
    };
    let broker_events = Arc::new(BrokerEvents::new());

    let orchestrator = Arc::new(RuntimeOrchestrator::new(
        &config,
        cluster.clone(),
        driver.clone(),
        store,
        broker_events.clone(),
    ));
    let ready = Arc::new(AtomicBool::new(false));

    let recovery_handle = {
        let orchestrator = orchestrator.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match orchestrator.recover().await {
                Ok(settled) => info!(settled, "Runtime recovery finished"),
                Err(e) => error!("Runtime recovery failed: {}", e),
            }
            ready.store(true, Ordering::Release);
        })
    };

    let state = AppState {
        namespaces: Arc::new(NamespaceManager::new(cluster, driver, &config)),
        broker_events,
        runtimes: orchestrator,
        ready,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!("Runtime controller listening on {}", cli.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    recovery_handle.abort();
    info!("Runtime controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
