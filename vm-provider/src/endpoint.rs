//! Backend endpoint addressing.

use crate::error::{ProviderError, Result};
use std::fmt;
use url::Url;

/// Which backend implementation an endpoint selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process simulated hypervisor (`sim://`).
    Simulated,
    /// Hypervisor web service (`http://` / `https://`).
    WebService,
}

/// Parsed endpoint such as `http://localhost:18083` or `sim://local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    url: Url,
    kind: BackendKind,
}

impl BackendEndpoint {
    pub const DEFAULT_WEBSERVICE: &'static str = "http://localhost:18083";

    pub fn parse(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| ProviderError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

        let kind = match url.scheme() {
            "sim" => BackendKind::Simulated,
            "http" | "https" => BackendKind::WebService,
            other => {
                return Err(ProviderError::InvalidEndpoint(format!(
                    "unsupported scheme '{other}' in {endpoint}"
                )))
            }
        };

        if kind == BackendKind::WebService && url.host_str().is_none() {
            return Err(ProviderError::InvalidEndpoint(format!(
                "missing host in {endpoint}"
            )));
        }

        Ok(Self { url, kind })
    }

    pub fn simulated() -> Self {
        Self {
            url: Url::parse("sim://local").expect("static endpoint is valid"),
            kind: BackendKind::Simulated,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl std::str::FromStr for BackendEndpoint {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webservice() {
        let endpoint = BackendEndpoint::parse(BackendEndpoint::DEFAULT_WEBSERVICE).unwrap();
        assert_eq!(endpoint.kind(), BackendKind::WebService);
        assert_eq!(endpoint.host(), Some("localhost"));
        assert_eq!(endpoint.port(), Some(18083));
    }

    #[test]
    fn test_parse_simulated() {
        let endpoint: BackendEndpoint = "sim://local".parse().unwrap();
        assert_eq!(endpoint.kind(), BackendKind::Simulated);
        assert_eq!(endpoint, BackendEndpoint::simulated());
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let err = BackendEndpoint::parse("ftp://host").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
        assert!(BackendEndpoint::parse("not a url").is_err());
    }
}
