//! TLS certificate loading
//!
//! Certificates are issued by certbot into `certbot-config-dir/live/<name>/`.
//! One bundle serves every configured hostname. The acceptor can be swapped
//! after a renewal without rebinding the listening socket.

use rustls::ServerConfig;
use rustls_pemfile::{certs, Item};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::error::{EdgeError, Result};

const FULLCHAIN_FILE: &str = "fullchain.pem";
const PRIVKEY_FILE: &str = "privkey.pem";

/// Certificate chain and private key as PEM bytes
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub certificate_chain: Vec<u8>,
    pub private_key: Vec<u8>,
    /// Directory the bundle was read from
    pub source_path: PathBuf,
}

/// Locates the active bundle under certbot's `live` directory
#[derive(Debug, Clone)]
pub struct CertificateStore {
    live_dir: PathBuf,
    primary_domain: Option<String>,
}

impl CertificateStore {
    /// `primary_domain` is the first configured hostname; certbot names the
    /// lineage directory after it, so it wins when several directories exist.
    pub fn new(live_dir: impl Into<PathBuf>, primary_domain: Option<String>) -> Self {
        Self {
            live_dir: live_dir.into(),
            primary_domain,
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Load the currently active bundle
    pub fn load_active(&self) -> Result<CertificateBundle> {
        let dir = self.select_bundle_dir()?;

        let certificate_chain = read_pem(&dir.join(FULLCHAIN_FILE))?;
        let private_key = read_pem(&dir.join(PRIVKEY_FILE))?;

        Ok(CertificateBundle {
            certificate_chain,
            private_key,
            source_path: dir,
        })
    }

    fn select_bundle_dir(&self) -> Result<PathBuf> {
        let entries = match std::fs::read_dir(&self.live_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EdgeError::NoCertificate(self.live_dir.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        // certbot also drops a README next to the lineage directories
        let mut candidates: Vec<(String, PathBuf, SystemTime)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((entry.file_name().to_string_lossy().into_owned(), path, modified));
        }

        match candidates.len() {
            0 => Err(EdgeError::NoCertificate(self.live_dir.clone())),
            1 => Ok(candidates.remove(0).1),
            count => {
                let by_domain = self
                    .primary_domain
                    .as_deref()
                    .and_then(|domain| candidates.iter().position(|(name, _, _)| name == domain));

                let index = match by_domain {
                    Some(index) => index,
                    None => {
                        // Most recently modified, ties broken by name
                        candidates.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
                        0
                    }
                };

                let (name, path, _) = candidates.swap_remove(index);
                warn!(
                    live_dir = %self.live_dir.display(),
                    count,
                    selected = %name,
                    "More than one certificate in live directory"
                );
                Ok(path)
            }
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| EdgeError::Tls(format!("Failed to read {}: {}", path.display(), e)))
}

/// Build a TLS acceptor from a PEM bundle
pub fn build_acceptor(bundle: &CertificateBundle) -> Result<TlsAcceptor> {
    let server_config = build_server_config(bundle)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn build_server_config(bundle: &CertificateBundle) -> Result<ServerConfig> {
    let mut cert_reader = BufReader::new(bundle.certificate_chain.as_slice());
    let chain: Vec<rustls::Certificate> = certs(&mut cert_reader)
        .map_err(|e| EdgeError::Tls(format!("Failed to read certificates: {}", e)))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    if chain.is_empty() {
        return Err(EdgeError::Tls(format!(
            "No certificates found in {}",
            bundle.source_path.join(FULLCHAIN_FILE).display()
        )));
    }

    let key = private_key(bundle)?;

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| EdgeError::Tls(format!("TLS config error: {}", e)))?;

    // Upgrades are spliced over HTTP/1.1 connections
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

fn private_key(bundle: &CertificateBundle) -> Result<rustls::PrivateKey> {
    let mut key_reader = BufReader::new(bundle.private_key.as_slice());
    let items = rustls_pemfile::read_all(&mut key_reader)
        .map_err(|e| EdgeError::Tls(format!("Failed to read private key: {}", e)))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(der),
            _ => None,
        })
        .map(rustls::PrivateKey)
        .ok_or_else(|| {
            EdgeError::Tls(format!(
                "No private key found in {}",
                bundle.source_path.join(PRIVKEY_FILE).display()
            ))
        })
}

/// Holds the acceptor handed to each new TLS connection
pub struct TlsManager {
    store: CertificateStore,
    acceptor: RwLock<TlsAcceptor>,
    active: RwLock<PathBuf>,
}

impl TlsManager {
    /// Load the active bundle; failure here is fatal at startup
    pub fn new(store: CertificateStore) -> Result<Self> {
        let bundle = store.load_active()?;
        Self::with_bundle(store, &bundle)
    }

    /// Build from an already loaded bundle
    pub fn with_bundle(store: CertificateStore, bundle: &CertificateBundle) -> Result<Self> {
        let acceptor = build_acceptor(bundle)?;
        info!(path = %bundle.source_path.display(), "Loaded TLS certificate");

        Ok(Self {
            store,
            acceptor: RwLock::new(acceptor),
            active: RwLock::new(bundle.source_path.clone()),
        })
    }

    /// Acceptor for a newly accepted connection
    pub async fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.read().await.clone()
    }

    /// Directory of the bundle currently served
    pub async fn active_path(&self) -> PathBuf {
        self.active.read().await.clone()
    }

    /// Re-read the active bundle and swap the acceptor
    ///
    /// On error the previous acceptor stays in place. Connections already
    /// established keep the certificate they were accepted with.
    pub async fn reload(&self) -> Result<PathBuf> {
        let store = self.store.clone();
        let bundle = tokio::task::spawn_blocking(move || store.load_active())
            .await
            .map_err(|e| EdgeError::Tls(format!("Certificate reload task failed: {}", e)))??;

        let acceptor = build_acceptor(&bundle)?;
        *self.acceptor.write().await = acceptor;
        *self.active.write().await = bundle.source_path.clone();

        info!(path = %bundle.source_path.display(), "Reloaded TLS certificate");
        Ok(bundle.source_path)
    }
}
