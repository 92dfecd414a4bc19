//! ACME HTTP-01 challenge serving
//!
//! certbot runs in webroot mode and writes challenge files under
//! `certbot-webroot/.well-known/acme-challenge/`. The validating CA fetches
//! them over plain HTTP; this module maps those requests onto the files.

use axum::{
    body::{Body, Bytes},
    http::{header, Response, StatusCode},
};
use futures_util::{future, stream, StreamExt};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Path prefix of every HTTP-01 validation request
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge";

/// Invoked with the request path once a challenge file has been fully streamed
pub type DeliveryCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Serves challenge files from the webroot
#[derive(Clone)]
pub struct ChallengeResponder {
    webroot: PathBuf,
    on_delivered: Option<DeliveryCallback>,
}

impl ChallengeResponder {
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        Self {
            webroot: webroot.into(),
            on_delivered: None,
        }
    }

    /// Register the completion callback
    pub fn with_delivery_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_delivered = Some(Arc::new(callback));
        self
    }

    pub fn webroot(&self) -> &Path {
        &self.webroot
    }

    /// Whether a request path is an ACME validation probe
    pub fn is_challenge_path(path: &str) -> bool {
        path.starts_with(ACME_CHALLENGE_PREFIX)
    }

    /// Map a request path onto a file under the webroot
    ///
    /// Returns `None` for paths that would leave the webroot.
    pub fn file_path(&self, url_path: &str) -> Option<PathBuf> {
        if url_path.contains('\0') {
            return None;
        }

        let relative = Path::new(url_path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return None;
        }

        Some(self.webroot.join(relative))
    }

    /// Answer a challenge request
    ///
    /// 200 with the file as `text/plain` and its exact length, or 500 with an
    /// empty body when the file is missing or unreadable.
    pub async fn serve(&self, url_path: &str) -> Response<Body> {
        info!(path = %url_path, "certbot is requesting challenge");

        let Some(file_path) = self.file_path(url_path) else {
            warn!(path = %url_path, "Refusing challenge path outside webroot");
            return empty_error();
        };

        let file = match tokio::fs::File::open(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %file_path.display(), error = %e, "Failed to read challenge file");
                return empty_error();
            }
        };

        let len = match file.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => {
                warn!(path = %file_path.display(), "Challenge path is not a file");
                return empty_error();
            }
            Err(e) => {
                warn!(path = %file_path.display(), error = %e, "Failed to stat challenge file");
                return empty_error();
            }
        };

        let on_delivered = self.on_delivered.clone();
        let delivered = url_path.to_string();
        let finished = stream::once(async move {
            info!(path = %delivered, "Delivered challenge file to certbot");
            if let Some(callback) = on_delivered {
                callback(&delivered);
            }
        })
        .filter_map(|()| future::ready(None::<std::io::Result<Bytes>>));

        let body = Body::from_stream(ReaderStream::new(file).chain(finished));

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, len)
            .body(body)
            .unwrap_or_else(|_| empty_error())
    }
}

impl fmt::Debug for ChallengeResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeResponder")
            .field("webroot", &self.webroot)
            .field("on_delivered", &self.on_delivered.is_some())
            .finish()
    }
}

fn empty_error() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
