//! Startup modes
//!
//! Serving mode terminates TLS on the HTTPS listener, redirects the HTTP
//! listener and renews on a schedule. Manual renewal mode runs certbot once
//! behind a challenge-only HTTP listener and then exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::acme::ChallengeResponder;
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::proxy::EdgeServer;
use crate::redirect::{challenge_router, redirect_router, serve_http};
use crate::renewal::{CertificateIssuer, RenewalCoordinator, RenewalJob, RenewalOutcome};
use crate::router::RoutingTable;
use crate::tls::{CertificateStore, TlsManager};

/// Delay between the last challenge delivery and manual-mode shutdown
pub const CHALLENGE_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Why manual renewal mode stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualExit {
    /// certbot finished before or during the shutdown grace period
    Renewal(RenewalOutcome),
    /// A challenge file was delivered and the grace period elapsed
    ChallengeDelivered,
}

impl ManualExit {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ManualExit::Renewal(RenewalOutcome::Failed(_)) => ExitCode::FAILURE,
            _ => ExitCode::SUCCESS,
        }
    }
}

/// Run one forced renewal behind a challenge-only HTTP listener
///
/// Returns when certbot finishes, or one second after the first challenge
/// file has been streamed out, whichever comes first. The listener must be
/// bound before calling so the CA can reach it as soon as certbot asks.
pub async fn run_manual_renewal(
    listener: TcpListener,
    webroot: PathBuf,
    coordinator: Arc<RenewalCoordinator>,
) -> Result<ManualExit> {
    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel::<String>();
    let responder = ChallengeResponder::new(webroot).with_delivery_callback(move |path| {
        let _ = delivered_tx.send(path.to_string());
    });

    info!("Temporary http server to handle certbot http challenge is live");
    let mut server = tokio::spawn(serve_http(listener, challenge_router(responder)));

    let renewal = coordinator.renew_once();
    tokio::pin!(renewal);

    let exit = tokio::select! {
        outcome = &mut renewal => Ok(ManualExit::Renewal(outcome)),
        Some(path) = delivered_rx.recv() => {
            info!(path = %path, "Certbot did request. Stopping in one second");
            tokio::select! {
                outcome = &mut renewal => Ok(ManualExit::Renewal(outcome)),
                _ = tokio::time::sleep(CHALLENGE_SHUTDOWN_GRACE) => Ok(ManualExit::ChallengeDelivered),
            }
        }
        served = &mut server => match served {
            Ok(Ok(())) => Err(EdgeError::Renewal("challenge server stopped".to_string())),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(EdgeError::Renewal(format!("challenge server task failed: {}", e))),
        },
    };

    server.abort();
    exit
}

/// Everything serving mode needs before it binds a socket
pub struct ServingMode {
    routes: Arc<RoutingTable>,
    tls: Arc<TlsManager>,
    coordinator: Arc<RenewalCoordinator>,
    webroot: PathBuf,
    renew_interval: Duration,
}

impl ServingMode {
    /// Load the certificate and wire up renewal
    ///
    /// A missing or unreadable certificate fails here, before any listener
    /// is bound.
    pub fn prepare(
        config: &EdgeConfig,
        routes: Arc<RoutingTable>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Result<Self> {
        let store = CertificateStore::new(
            config.layout.live_dir(),
            routes.domains().first().cloned(),
        );
        let tls = Arc::new(TlsManager::new(store)?);

        let job = RenewalJob::new(routes.domains().to_vec(), config.email.clone());
        let coordinator =
            Arc::new(RenewalCoordinator::new(issuer, job).with_tls_reload(tls.clone()));

        Ok(Self {
            routes,
            tls,
            coordinator,
            webroot: config.layout.webroot(),
            renew_interval: config.renew_interval,
        })
    }

    pub fn tls(&self) -> &Arc<TlsManager> {
        &self.tls
    }

    pub fn coordinator(&self) -> &Arc<RenewalCoordinator> {
        &self.coordinator
    }

    /// Serve on already bound listeners until one of them fails
    pub async fn run(self, https: TcpListener, http: TcpListener) -> Result<()> {
        let renewal = self
            .coordinator
            .clone()
            .start_renewal_task(self.renew_interval);

        let edge = EdgeServer::new(self.routes.clone(), self.tls.clone());
        let redirect = redirect_router(ChallengeResponder::new(self.webroot.clone()));

        let result = tokio::select! {
            r = edge.serve(https) => r,
            r = serve_http(http, redirect) => r,
        };

        if let Err(e) = &result {
            error!(error = %e, "Listener failed");
        }
        renewal.abort();
        result
    }
}
