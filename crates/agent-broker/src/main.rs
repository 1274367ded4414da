mod auth;
mod config;
mod director;
mod error;
mod identity;
mod lifecycle;
mod manifest;
mod models;
mod registry;
mod routes;
mod upgrade;
mod version;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::config::{AuthConfig, BrokerConfig};
use crate::director::{DeploymentClient, DirectorClient};
use crate::lifecycle::{LifecycleController, LifecycleSettings};
use crate::manifest::ManifestRenderer;
use crate::models::LifecycleState;
use crate::registry::InstanceRegistry;
use crate::upgrade::UpgradeOrchestrator;

#[derive(Clone)]
pub struct State {
    pub controller: LifecycleController,
    pub upgrades: UpgradeOrchestrator,
    pub auth: Option<Arc<AuthConfig>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    agent_broker_tls::init_rustls_crypto_provider();

    let cfg = BrokerConfig::from_env()?;
    let catalog = Arc::new(cfg.catalog()?);
    let policy = cfg.version_policy()?;
    let renderer = Arc::new(ManifestRenderer::from_config(&cfg));
    let director: Arc<dyn DeploymentClient> = Arc::new(
        DirectorClient::from_config(&cfg.director).context("configure director client")?,
    );
    let registry = InstanceRegistry::open(cfg.state_path.clone())?;
    let in_flight = registry
        .count(|instance| {
            matches!(
                instance.state,
                LifecycleState::Provisioning | LifecycleState::Deprovisioning
            )
        })
        .await;

    if cfg.auth.is_none() {
        warn!("broker credentials not configured; API is unauthenticated");
    }
    info!(
        director = %cfg.director.url,
        plans = catalog.plans().len(),
        min_version = %policy.floor(),
        default_version = %cfg.default_version,
        in_flight,
        "broker configured"
    );

    let controller = LifecycleController::new(
        registry.clone(),
        director.clone(),
        renderer.clone(),
        catalog,
        policy.clone(),
        LifecycleSettings {
            deployment_prefix: cfg.deployment_prefix.clone(),
            default_version: cfg.default_version.clone(),
        },
    );
    let upgrades = UpgradeOrchestrator::new(registry, director, renderer, policy);
    let state = State {
        controller,
        upgrades,
        auth: cfg.auth.clone().map(Arc::new),
    };

    let addr: std::net::SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("parse listen_addr {}", cfg.listen_addr))?;

    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("bind {addr}"))?
        .serve(routes::router(state).into_make_service());

    info!("Broker running on http://{addr}");

    let graceful = server.with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
        }
        info!("shutting down");
    });

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }

    Ok(())
}
