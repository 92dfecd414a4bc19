//! Certificate renewal
//!
//! Issuance is delegated to certbot running in webroot mode. The
//! [`CertificateIssuer`] trait is the seam between the renewal state machine
//! and the subprocess, so the coordinator can be driven by a fake in tests.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Layout;
use crate::error::{EdgeError, Result};
use crate::tls::TlsManager;

/// certbot prints this when the lineage does not need renewing yet
pub const NOT_YET_DUE_MARKER: &str = "not yet due for renewal";

/// One renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalJob {
    /// Domains in rule order; the first names the certificate lineage
    pub domains: Vec<String>,
    pub contact_email: String,
    /// Renew even when the certificate is not close to expiry
    pub forced: bool,
}

impl RenewalJob {
    pub fn new(domains: Vec<String>, contact_email: impl Into<String>) -> Self {
        Self {
            domains,
            contact_email: contact_email.into(),
            forced: true,
        }
    }
}

/// Captured result of an issuing run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerOutput {
    pub success: bool,
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// External certificate-issuing client
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Run the client to completion. `Err` means it could not be run at all.
    async fn issue(&self, job: &RenewalJob) -> Result<IssuerOutput>;
}

/// certbot subprocess in webroot mode
#[derive(Debug, Clone)]
pub struct Certbot {
    program: PathBuf,
    layout: Layout,
}

impl Certbot {
    pub fn new(program: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            program: program.into(),
            layout,
        }
    }

    /// Command line arguments for a job
    pub fn args(&self, job: &RenewalJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["certonly".into()];
        if job.forced {
            args.push("--force-renewal".into());
        }
        args.push("--webroot".into());
        args.push("-w".into());
        args.push(self.layout.webroot().into());
        for domain in &job.domains {
            args.push("-d".into());
            args.push(domain.into());
        }
        args.push("--config-dir".into());
        args.push(self.layout.config_dir().into());
        args.push("--work-dir".into());
        args.push(self.layout.work_dir().into());
        args.push("--logs-dir".into());
        args.push(self.layout.logs_dir().into());
        args.push("--noninteractive".into());
        args.push("--agree-tos".into());
        args.push("--email".into());
        args.push(job.contact_email.as_str().into());
        args
    }
}

#[async_trait]
impl CertificateIssuer for Certbot {
    async fn issue(&self, job: &RenewalJob) -> Result<IssuerOutput> {
        tokio::fs::create_dir_all(self.layout.webroot()).await?;

        let args = self.args(job);
        info!(
            command = %format!(
                "{} {}",
                self.program.display(),
                args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
            ),
            "Running certbot"
        );

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                EdgeError::Renewal(format!("Failed to run {}: {}", self.program.display(), e))
            })?;

        Ok(IssuerOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Result of one renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// A new certificate was issued
    Renewed,
    /// The issuer ran successfully but had nothing to do
    NotYetDue,
    /// Spawn failure or non-zero exit
    Failed(String),
}

impl RenewalOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RenewalOutcome::Failed(_))
    }
}

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Runs renewal attempts once or on a schedule
pub struct RenewalCoordinator {
    issuer: Arc<dyn CertificateIssuer>,
    job: RenewalJob,
    state: RwLock<RenewalState>,
    /// Reloaded after a scheduled renewal issues a new certificate
    tls: Option<Arc<TlsManager>>,
}

impl RenewalCoordinator {
    pub fn new(issuer: Arc<dyn CertificateIssuer>, job: RenewalJob) -> Self {
        Self {
            issuer,
            job,
            state: RwLock::new(RenewalState::Idle),
            tls: None,
        }
    }

    /// Swap the served certificate after each successful scheduled renewal
    pub fn with_tls_reload(mut self, tls: Arc<TlsManager>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn job(&self) -> &RenewalJob {
        &self.job
    }

    pub async fn state(&self) -> RenewalState {
        *self.state.read().await
    }

    /// Run a single attempt. Never fails; errors are folded into the outcome.
    pub async fn renew_once(&self) -> RenewalOutcome {
        *self.state.write().await = RenewalState::Running;
        info!(
            domains = %self.job.domains.join(", "),
            "Updating https certificates"
        );

        let outcome = match self.issuer.issue(&self.job).await {
            Err(e) => {
                error!(error = %e, "Certificate issuer could not be run");
                RenewalOutcome::Failed(e.to_string())
            }
            Ok(output) => {
                if !output.stdout.is_empty() {
                    info!(stdout = %output.stdout.trim_end(), "certbot output");
                }
                if !output.stderr.is_empty() {
                    warn!(stderr = %output.stderr.trim_end(), "certbot error output");
                }

                if !output.success {
                    let reason = match output.code {
                        Some(code) => format!("certbot exited with status {}", code),
                        None => "certbot terminated by signal".to_string(),
                    };
                    error!(reason = %reason, "Certificate renewal failed");
                    RenewalOutcome::Failed(reason)
                } else if output.stdout.contains(NOT_YET_DUE_MARKER) {
                    info!("Certificate not yet due for renewal");
                    RenewalOutcome::NotYetDue
                } else {
                    info!("Certificate renewed");
                    RenewalOutcome::Renewed
                }
            }
        };

        *self.state.write().await = if outcome.is_success() {
            RenewalState::Succeeded
        } else {
            RenewalState::Failed
        };

        outcome
    }

    /// Renew every `period`, forever
    ///
    /// The first attempt happens one period after start. A failed attempt is
    /// logged and the schedule continues.
    pub async fn run_scheduled(self: Arc<Self>, period: Duration) {
        info!(
            period_secs = period.as_secs(),
            "Starting certificate renewal scheduler"
        );

        let Some(mut next) = Instant::now().checked_add(period) else {
            error!(period_secs = period.as_secs(), "Renewal period out of range, scheduled renewal disabled");
            return;
        };
        loop {
            tokio::time::sleep_until(next).await;

            match self.renew_once().await {
                RenewalOutcome::Renewed => {
                    if let Some(tls) = &self.tls {
                        if let Err(e) = tls.reload().await {
                            error!(error = %e, "Failed to reload TLS certificate, keeping previous one");
                        }
                    }
                }
                RenewalOutcome::NotYetDue => {}
                RenewalOutcome::Failed(reason) => {
                    warn!(reason = %reason, "Scheduled renewal failed, will retry next period");
                }
            }

            let now = Instant::now();
            next = match next_deadline(next, now, period) {
                Some(next) => next,
                None => {
                    error!(period_secs = period.as_secs(), "Renewal period out of range, scheduled renewal stopped");
                    return;
                }
            };
            debug!(in_secs = (next - now).as_secs(), "Next certificate renewal scheduled");
        }
    }

    /// Spawn the scheduled renewal loop
    pub fn start_renewal_task(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(self.run_scheduled(period))
    }
}

/// Deadline recomputed from the previous one; skipped rounds are not replayed
fn next_deadline(previous: Instant, now: Instant, period: Duration) -> Option<Instant> {
    previous
        .checked_add(period)
        .filter(|next| *next > now)
        .or_else(|| now.checked_add(period))
}
