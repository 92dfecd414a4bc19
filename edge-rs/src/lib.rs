//! edge-rs: TLS edge proxy with certbot-driven certificates
//!
//! Terminates HTTPS for a set of hostnames and forwards each request to the
//! plain HTTP upstream configured for its `Host` header. WebSocket and other
//! upgrade requests are spliced through to the upstream. Port 80 answers
//! ACME HTTP-01 challenges and redirects everything else to HTTPS.
//!
//! Certificates come from certbot in webroot mode. A single certificate
//! covers every configured hostname and is renewed on a fixed schedule, or
//! once on demand with the `update-certs` mode.
//!
//! # Example Rules
//!
//! ```toml
//! "example.com" = "http://127.0.0.1:3000"
//! "api.example.com" = "http://127.0.0.1:8080"
//! ```
//!
//! The first hostname names the certificate lineage.

pub mod acme;
pub mod app;
pub mod config;
pub mod error;
pub mod proxy;
pub mod redirect;
pub mod renewal;
pub mod router;
pub mod tls;

pub use app::{run_manual_renewal, ManualExit, ServingMode};
pub use config::{Cli, EdgeConfig, Layout, Mode};
pub use error::{EdgeError, Result};
pub use proxy::{edge_router, EdgeServer};
pub use router::RoutingTable;
