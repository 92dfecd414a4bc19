//! Host routing table for edge-rs
//!
//! Maps the `Host` header of incoming requests onto an upstream target.
//! Matching is exact: no wildcards, no case folding, no port stripping.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{EdgeError, Result};

/// Upstream target of one routing rule
///
/// Both representations used by the forwarding engine come from the same
/// rule value: the base URL for plain requests and the bare `host:port` for
/// upgrades, which are spliced at the socket level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    base_url: String,
    authority: String,
}

impl Target {
    /// Parse a rule value such as `http://127.0.0.1:3000`
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| EdgeError::Config(format!("Invalid target URL '{}': {}", raw, e)))?;

        if url.scheme() != "http" {
            return Err(EdgeError::Config(format!(
                "Unsupported target scheme '{}' in '{}' (expected http)",
                url.scheme(),
                raw
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| EdgeError::Config(format!("Target URL '{}' has no host", raw)))?;
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            base_url: raw.trim_end_matches('/').to_string(),
            authority: format!("{}:{}", host, port),
        })
    }

    /// Base URL used for plain HTTP forwarding
    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// Scheme-stripped `host:port` used for upgrade forwarding
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Full upstream URI for a request path (with query)
    pub fn forward_uri(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

/// Immutable hostname -> target table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, Target>,
    /// Hostnames in rule-file order
    domains: Vec<String>,
}

impl RoutingTable {
    /// Build a table from (hostname, target URL) pairs
    pub fn new<I, K, V>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut routes = HashMap::new();
        let mut domains = Vec::new();

        for (host, target) in rules {
            let host = host.into();
            if host.is_empty() {
                return Err(EdgeError::Config("Empty hostname in rules".to_string()));
            }
            let target = Target::parse(target.as_ref())?;
            if routes.insert(host.clone(), target).is_some() {
                return Err(EdgeError::Config(format!("Duplicate rule for '{}'", host)));
            }
            domains.push(host);
        }

        if domains.is_empty() {
            return Err(EdgeError::Config("No routes configured".to_string()));
        }

        Ok(Self { routes, domains })
    }

    /// Load rules from a file; `.json` files are JSON, anything else is TOML
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EdgeError::Config(format!("Failed to read rules file {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Parse a TOML table of `"host" = "target"` entries
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = content
            .parse()
            .map_err(|e| EdgeError::Config(format!("Failed to parse rules: {}", e)))?;

        let rules = table
            .into_iter()
            .map(|(host, value)| match value {
                toml::Value::String(target) => Ok((host, target)),
                other => Err(EdgeError::Config(format!(
                    "Rule for '{}' must be a string, got {}",
                    host,
                    other.type_str()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(rules)
    }

    /// Parse a JSON object of `"host": "target"` entries
    pub fn from_json_str(content: &str) -> Result<Self> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(content)
            .map_err(|e| EdgeError::Config(format!("Failed to parse rules: {}", e)))?;

        let rules = object
            .into_iter()
            .map(|(host, value)| match value {
                serde_json::Value::String(target) => Ok((host, target)),
                other => Err(EdgeError::Config(format!(
                    "Rule for '{}' must be a string, got {}",
                    host, other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(rules)
    }

    /// Resolve a `Host` header value exactly as received
    pub fn resolve(&self, host: &str) -> Result<&Target> {
        self.routes
            .get(host)
            .ok_or_else(|| EdgeError::RouteNotFound(host.to_string()))
    }

    /// Configured hostnames in rule order (the certificate domain list)
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Iterate rules in rule order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Target)> {
        self.domains
            .iter()
            .filter_map(|host| self.routes.get(host).map(|t| (host.as_str(), t)))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
