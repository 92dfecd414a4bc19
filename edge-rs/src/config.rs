//! Configuration for edge-rs
//!
//! Everything is resolved once at startup from the command line (with
//! environment overrides) and then passed by value into the components.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EdgeError, Result};

/// Largest delay a 32-bit millisecond timer can hold, about 24.9 days.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_millis((1 << 31) - 1);

/// Upper bound for `--renew-interval-secs`, ten years
pub const MAX_RENEW_INTERVAL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Command line interface
///
/// ```text
/// edge-rs <rules-file-path> <email> [update-certs]
/// ```
#[derive(Parser, Debug, Clone)]
#[command(name = "edge-rs", version)]
#[command(about = "TLS edge proxy with certbot-managed certificates", long_about = None)]
pub struct Cli {
    /// Routing rules file (TOML or JSON) mapping hostname to upstream URL
    pub rules: PathBuf,

    /// Contact email passed to certbot
    pub email: String,

    /// Renew the certificates once and exit instead of serving
    #[arg(value_enum)]
    pub mode: Option<Mode>,

    /// Directory holding the certbot-* directories (defaults to the executable's directory)
    #[arg(long, env = "EDGE_RS_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Plain HTTP listen address (redirects and ACME challenges)
    #[arg(long, env = "EDGE_RS_HTTP_ADDR", default_value = "0.0.0.0:80")]
    pub http_addr: SocketAddr,

    /// HTTPS listen address
    #[arg(long, env = "EDGE_RS_HTTPS_ADDR", default_value = "0.0.0.0:443")]
    pub https_addr: SocketAddr,

    /// certbot executable
    #[arg(long, env = "EDGE_RS_CERTBOT", default_value = "certbot")]
    pub certbot: PathBuf,

    /// Seconds between scheduled renewals
    #[arg(long, env = "EDGE_RS_RENEW_INTERVAL_SECS")]
    pub renew_interval_secs: Option<u64>,
}

/// Startup mode selected by the optional third argument
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve only ACME challenges, run one renewal, exit
    UpdateCerts,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Absolute path of the routing rules file
    pub rules_path: PathBuf,
    /// Operator email for certbot
    pub email: String,
    /// Manual renewal mode (`update-certs`)
    pub manual_renewal: bool,
    /// Certbot directory layout
    pub layout: Layout,
    /// Plain HTTP listen address
    pub http_addr: SocketAddr,
    /// HTTPS listen address
    pub https_addr: SocketAddr,
    /// certbot executable
    pub certbot: PathBuf,
    /// Period of scheduled renewals
    pub renew_interval: Duration,
}

impl EdgeConfig {
    /// Resolve the parsed command line into a configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.email.trim().is_empty() {
            return Err(EdgeError::Config(
                "Missing argument: email (for certbot).".to_string(),
            ));
        }

        let rules_path = absolutize(&cli.rules)?;

        let base_dir = match cli.base_dir {
            Some(dir) => absolutize(&dir)?,
            None => executable_dir()?,
        };

        let renew_interval = match cli.renew_interval_secs {
            Some(0) => {
                return Err(EdgeError::Config(
                    "Renewal interval must be at least one second".to_string(),
                ))
            }
            Some(secs) if Duration::from_secs(secs) > MAX_RENEW_INTERVAL => {
                return Err(EdgeError::Config(format!(
                    "Renewal interval must be at most {} seconds",
                    MAX_RENEW_INTERVAL.as_secs()
                )))
            }
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_RENEW_INTERVAL,
        };

        Ok(Self {
            rules_path,
            email: cli.email,
            manual_renewal: cli.mode == Some(Mode::UpdateCerts),
            layout: Layout::new(base_dir),
            http_addr: cli.http_addr,
            https_addr: cli.https_addr,
            certbot: cli.certbot,
            renew_interval,
        })
    }
}

/// Certbot directory layout, all relative to one base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    base_dir: PathBuf,
}

impl Layout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory served for HTTP-01 challenges
    pub fn webroot(&self) -> PathBuf {
        self.base_dir.join("certbot-webroot")
    }

    /// certbot `--config-dir`
    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("certbot-config-dir")
    }

    /// Directory holding one subdirectory per issued domain set
    pub fn live_dir(&self) -> PathBuf {
        self.config_dir().join("live")
    }

    /// certbot `--work-dir`
    pub fn work_dir(&self) -> PathBuf {
        self.base_dir.join("certbot-work-dir")
    }

    /// certbot `--logs-dir`
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("certbot-logs-dir")
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| EdgeError::Config(format!("No parent directory for {}", exe.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("edge-rs").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_serving_mode() {
        let cli = parse(&["rules.toml", "ops@example.com", "--base-dir", "/srv/edge"]).unwrap();
        let config = EdgeConfig::from_cli(cli).unwrap();

        assert!(!config.manual_renewal);
        assert_eq!(config.email, "ops@example.com");
        assert_eq!(config.layout.base_dir(), Path::new("/srv/edge"));
        assert!(config.rules_path.is_absolute());
        assert!(config.rules_path.ends_with("rules.toml"));
    }

    #[test]
    fn test_parse_update_certs() {
        let cli = parse(&["/etc/edge/rules.json", "ops@example.com", "update-certs"]).unwrap();
        assert_eq!(cli.mode, Some(Mode::UpdateCerts));

        let config = EdgeConfig::from_cli(cli).unwrap();
        assert!(config.manual_renewal);
        assert_eq!(config.rules_path, PathBuf::from("/etc/edge/rules.json"));
    }

    #[test]
    fn test_reject_unknown_mode() {
        assert!(parse(&["rules.toml", "ops@example.com", "renew"]).is_err());
    }

    #[test]
    fn test_reject_missing_arguments() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["rules.toml"]).is_err());
    }

    #[test]
    fn test_reject_blank_email() {
        let cli = parse(&["rules.toml", " "]).unwrap();
        assert!(EdgeConfig::from_cli(cli).is_err());
    }

    #[test]
    fn test_renew_interval() {
        let cli = parse(&["rules.toml", "ops@example.com", "--renew-interval-secs", "3600"]).unwrap();
        let config = EdgeConfig::from_cli(cli).unwrap();
        assert_eq!(config.renew_interval, Duration::from_secs(3600));

        let cli = parse(&["rules.toml", "ops@example.com", "--renew-interval-secs", "0"]).unwrap();
        assert!(EdgeConfig::from_cli(cli).is_err());

        assert_eq!(DEFAULT_RENEW_INTERVAL.as_millis(), 2_147_483_647);
    }

    #[test]
    fn test_reject_huge_renew_interval() {
        let max = MAX_RENEW_INTERVAL.as_secs().to_string();
        let cli = parse(&["rules.toml", "ops@example.com", "--renew-interval-secs", &max]).unwrap();
        assert_eq!(EdgeConfig::from_cli(cli).unwrap().renew_interval, MAX_RENEW_INTERVAL);

        let over = (MAX_RENEW_INTERVAL.as_secs() + 1).to_string();
        let cli = parse(&["rules.toml", "ops@example.com", "--renew-interval-secs", &over]).unwrap();
        assert!(matches!(EdgeConfig::from_cli(cli), Err(EdgeError::Config(_))));

        let cli = parse(&[
            "rules.toml",
            "ops@example.com",
            "--renew-interval-secs",
            "18446744073709551615",
        ])
        .unwrap();
        assert!(matches!(EdgeConfig::from_cli(cli), Err(EdgeError::Config(_))));
    }

    #[test]
    fn test_layout() {
        let layout = Layout::new("/srv/edge");
        assert_eq!(layout.webroot(), PathBuf::from("/srv/edge/certbot-webroot"));
        assert_eq!(
            layout.live_dir(),
            PathBuf::from("/srv/edge/certbot-config-dir/live")
        );
        assert_eq!(layout.work_dir(), PathBuf::from("/srv/edge/certbot-work-dir"));
        assert_eq!(layout.logs_dir(), PathBuf::from("/srv/edge/certbot-logs-dir"));
    }
}
