//! Control Node
//!
//! Serves the lab control surface over HTTP on top of the local Docker daemon
//! and runs the session reaper for the life of the process.

use anyhow::{bail, Context, Result};
use clap::Parser;
use control_server::{router, AppState};
use lab_orchestrator::{DockerClient, LabOrchestrator, OrchestratorConfig, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ==================== CLI ====================

#[derive(Parser, Debug)]
#[command(name = "control-node")]
#[command(about = "Lab container control service")]
struct Args {
    /// Address the HTTP control surface binds to
    #[arg(long, env = "CONTROL_LISTEN", default_value = "0.0.0.0:9001")]
    listen: SocketAddr,

    /// Bearer token expected from collaborators
    #[arg(long, env = "CHALLENGE_CONTROL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Refuse to start without a token
    #[arg(long, env = "CONTROL_REQUIRE_TOKEN")]
    require_token: bool,

    /// Public host in lab URLs (overrides CONTROL_PUBLIC_HOST)
    #[arg(long)]
    public_host: Option<String>,

    /// Public scheme in terminal URLs (overrides CONTROL_PUBLIC_SCHEME)
    #[arg(long)]
    public_scheme: Option<String>,

    #[arg(long, default_value = "5")]
    reaper_interval_secs: u64,
}

impl Args {
    fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::from_env();
        if let Some(host) = self.public_host.as_deref().filter(|h| !h.trim().is_empty()) {
            config.public_host = host.trim().to_string();
        }
        if let Some(scheme) = self.public_scheme.as_deref().filter(|s| !s.trim().is_empty()) {
            config.public_scheme = scheme.trim().to_string();
        }
        config.reaper_interval = Duration::from_secs(self.reaper_interval_secs.max(1));
        config
    }

    fn auth_token(&self) -> Result<Option<String>> {
        let token = self
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        if token.is_none() {
            if self.require_token {
                bail!("CHALLENGE_CONTROL_TOKEN is empty but --require-token is set");
            }
            warn!("No control token configured: authentication is disabled");
        }
        Ok(token)
    }
}

// ==================== Main ====================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,control_node=debug,lab_orchestrator=debug".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting control node");

    let token = args.auth_token()?;
    let config = args.orchestrator_config();
    info!(
        public_host = %config.public_host,
        public_scheme = %config.public_scheme,
        "Lab endpoints"
    );

    let docker = DockerClient::connect()
        .await
        .context("failed to connect to Docker")?;

    let orchestrator = Arc::new(LabOrchestrator::new(docker.clone(), config.clone()));
    let sessions = SessionManager::new(docker, config.clone());
    let reaper = sessions.start_reaper();
    info!(interval_secs = config.reaper_interval.as_secs(), "Session reaper started");

    let state = Arc::new(AppState::new(orchestrator, sessions, token));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, "Control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await
        .context("HTTP server error")?;

    reaper.abort();
    Ok(())
}
