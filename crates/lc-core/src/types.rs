//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConfigError, ExposeError};

/// Unique identifier for a workspace instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Create a new instance ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an instance ID coming from an untrusted caller
    pub fn parse(id: &str) -> Result<Self, ExposeError> {
        let id = id.trim();
        if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ExposeError::InvalidInstance(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    /// Create a new workspace ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an exposed port came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortSource {
    /// Requested through the local API (or another explicit caller)
    Explicit,
    /// Reported by the control plane in the instance metadata
    Discovered,
}

/// A (local port, target port) pair forwarded to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExposedPort {
    /// Port bound on the local machine
    pub local_port: u16,
    /// Port inside the workspace
    pub target_port: u16,
    /// Origin of the exposure
    pub source: PortSource,
}

impl ExposedPort {
    /// Validate an explicit request; the target defaults to the local port
    pub fn explicit(local_port: u32, target_port: Option<u32>) -> Result<Self, ExposeError> {
        let local = valid_port(local_port)?;
        let target = match target_port {
            Some(0) | None => local,
            Some(port) => valid_port(port)?,
        };
        Ok(Self {
            local_port: local,
            target_port: target,
            source: PortSource::Explicit,
        })
    }

    /// A port reported by the control plane, forwarded on the same local port
    pub fn discovered(port: u16) -> Option<Self> {
        (port != 0).then_some(Self {
            local_port: port,
            target_port: port,
            source: PortSource::Discovered,
        })
    }

    /// Whether this port was requested explicitly
    pub fn is_explicit(&self) -> bool {
        self.source == PortSource::Explicit
    }
}

fn valid_port(port: u32) -> Result<u16, ExposeError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ExposeError::InvalidPort(port)),
    }
}

/// Base URL of the control-plane deployment
///
/// Trailing slashes are trimmed on parse; they break the RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    url: String,
    host: String,
    hostname: String,
}

impl Origin {
    /// Parse and validate an origin URL
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim().trim_end_matches('/');
        let invalid = |reason: String| ConfigError::InvalidOrigin {
            origin: raw.to_string(),
            reason,
        };

        let parsed = url::Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme {:?}", other))),
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed".to_string()));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let hostname = host.to_string();
        let host = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            url: trimmed.to_string(),
            host,
            hostname,
        })
    }

    /// The origin URL without trailing slashes
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Host (and port, if explicit) of the origin
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host name of the origin, without port
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// WebSocket endpoint of the control-plane RPC API
    pub fn rpc_endpoint(&self) -> String {
        let ws = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.url.clone()
        };
        format!("{}{}", ws, lc_protocol::API_PATH)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_trims_trailing_slashes() {
        let origin = Origin::parse("https://gitpod.io//").unwrap();
        assert_eq!(origin.as_str(), "https://gitpod.io");
        assert_eq!(origin.host(), "gitpod.io");
    }

    #[test]
    fn test_origin_rpc_endpoint() {
        assert_eq!(
            Origin::parse("https://gitpod.io").unwrap().rpc_endpoint(),
            "wss://gitpod.io/api/v1"
        );
        assert_eq!(
            Origin::parse("http://localhost:3000/").unwrap().rpc_endpoint(),
            "ws://localhost:3000/api/v1"
        );
    }

    #[test]
    fn test_origin_keeps_explicit_port_in_host() {
        let origin = Origin::parse("http://gitpod.example.com:8080").unwrap();
        assert_eq!(origin.host(), "gitpod.example.com:8080");
        assert_eq!(origin.hostname(), "gitpod.example.com");
    }

    #[test]
    fn test_origin_rejects_bad_input() {
        assert!(Origin::parse("not a url").is_err());
        assert!(Origin::parse("ftp://gitpod.io").is_err());
        assert!(Origin::parse("https://gitpod.io/?x=1").is_err());
    }

    #[test]
    fn test_explicit_port_defaults_target() {
        let port = ExposedPort::explicit(8080, None).unwrap();
        assert_eq!(port.local_port, 8080);
        assert_eq!(port.target_port, 8080);
        assert!(port.is_explicit());
    }

    #[test]
    fn test_explicit_port_validation() {
        assert_eq!(
            ExposedPort::explicit(0, None),
            Err(ExposeError::InvalidPort(0))
        );
        assert_eq!(
            ExposedPort::explicit(70000, None),
            Err(ExposeError::InvalidPort(70000))
        );
        assert_eq!(
            ExposedPort::explicit(3000, Some(65536)),
            Err(ExposeError::InvalidPort(65536))
        );
        assert_eq!(ExposedPort::explicit(3000, Some(5000)).unwrap().target_port, 5000);
    }

    #[test]
    fn test_discovered_port() {
        assert!(ExposedPort::discovered(0).is_none());
        let port = ExposedPort::discovered(3000).unwrap();
        assert_eq!(port.source, PortSource::Discovered);
    }

    #[test]
    fn test_instance_id_parse() {
        assert!(InstanceId::parse("").is_err());
        assert!(InstanceId::parse("a b").is_err());
        assert_eq!(InstanceId::parse(" abc ").unwrap().as_str(), "abc");
    }
}
