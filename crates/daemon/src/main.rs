use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portgate_controller::{run_controller, KubeWorkspaceApi, WorkspaceReconciler};
use portgate_proxy::{ProxyManager, StaticAuthorizer};

mod config;

use config::Settings;

/// Per-workspace authenticating proxy controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match cli.config {
        Some(path) => {
            info!(config = %path, "loading configuration file");
            Settings::from_file(&path)?
        }
        None => Settings::from_env()?,
    };

    let password = settings
        .workspace
        .owner_password
        .clone()
        .context("no owner password configured; set PORTGATE__WORKSPACE__OWNER_PASSWORD")?;
    let authorizer = Arc::new(StaticAuthorizer::new(&settings.workspace.owner_id, &password));
    let manager = Arc::new(ProxyManager::new(settings.manager_config(), authorizer)?);

    let client = Client::try_default()
        .await
        .context("failed to build kubernetes client")?;
    let namespace = settings.workspace.namespace.clone();
    let api = KubeWorkspaceApi::new(client.clone(), &namespace);

    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(
        WorkspaceReconciler::new(
            api,
            manager.clone(),
            settings.workspace.name.clone(),
            shutdown.clone(),
        )
        .with_create_timeout(settings.create_timeout()),
    );

    info!(
        workspace = %settings.workspace.name,
        namespace = %namespace,
        "watching workspace"
    );
    let controller = tokio::spawn(run_controller(reconciler, client, namespace));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(10), controller)
        .await
        .is_err()
    {
        warn!("controller did not stop in time");
    }

    // Stop whatever proxies are still running; waits must not be
    // short-circuited by the already-cancelled token.
    manager.gc(&CancellationToken::new(), &[]).await;

    Ok(())
}
