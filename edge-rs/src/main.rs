//! edge-rs: TLS edge proxy
//!
//! `edge-rs <rules> <email>` serves; `edge-rs <rules> <email> update-certs`
//! renews the certificate once and exits.

use clap::Parser;
use edge_rs::renewal::{Certbot, CertificateIssuer, RenewalCoordinator, RenewalJob};
use edge_rs::{run_manual_renewal, Cli, EdgeConfig, RoutingTable, ServingMode};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EdgeConfig::from_cli(Cli::parse())?;

    info!("Starting edge-rs v{}", env!("CARGO_PKG_VERSION"));
    info!(base_dir = %config.layout.base_dir().display(), "Using base directory");

    let routes = Arc::new(RoutingTable::from_file(&config.rules_path)?);
    info!("Loaded {} routing rules from {}", routes.len(), config.rules_path.display());

    let issuer: Arc<dyn CertificateIssuer> =
        Arc::new(Certbot::new(config.certbot.clone(), config.layout.clone()));

    if config.manual_renewal {
        info!("Updating certificates");
        let listener = TcpListener::bind(config.http_addr).await?;
        let job = RenewalJob::new(routes.domains().to_vec(), config.email.clone());
        let coordinator = Arc::new(RenewalCoordinator::new(issuer, job));

        let exit = run_manual_renewal(listener, config.layout.webroot(), coordinator).await?;
        info!(?exit, "Certificate update finished");
        return Ok(exit.exit_code());
    }

    // Certificate problems abort before any socket is bound
    let serving = ServingMode::prepare(&config, routes, issuer)?;

    let https = TcpListener::bind(config.https_addr).await?;
    let http = TcpListener::bind(config.http_addr).await?;

    tokio::select! {
        result = serving.run(https, http) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal");
        }
    }

    info!("edge-rs stopped");
    Ok(ExitCode::SUCCESS)
}
