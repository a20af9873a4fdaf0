//! Endpoints and the Endpoint Catalog
//!
//! An endpoint is one selectable exit server. The catalog is the list
//! the user picks from; it ships with a built-in set and can be replaced
//! from a TOML or JSON document.
//!
//! # Built-in Catalog
//!
//! | Label | Address |
//! |-------|---------|
//! | USA | 198.51.100.10:51820 |
//! | United Kingdom | 203.0.113.20:51820 |
//! | Germany | 192.0.2.30:51820 |
//! | Japan | 198.18.0.40:51820 |
//! | Australia | 198.18.1.50:51820 |
//! | Singapore | 198.18.2.60:51820 |
//! | Canada | 198.18.3.70:51820 |
//! | France | 198.18.4.80:51820 |

use crate::profile::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote exit server
///
/// Two endpoints are the same server when their network addresses match;
/// the label and key are descriptive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Country shown to the user (e.g. "Germany")
    pub country_label: String,
    /// `host:port` of the server
    pub network_address: String,
    /// Server public key (base64, opaque)
    pub server_public_key: String,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(
        country_label: impl Into<String>,
        network_address: impl Into<String>,
        server_public_key: impl Into<String>,
    ) -> Self {
        Self {
            country_label: country_label.into(),
            network_address: network_address.into(),
            server_public_key: server_public_key.into(),
        }
    }

    /// Same server (identity is the network address)
    pub fn same_server(&self, other: &Endpoint) -> bool {
        self.network_address == other.network_address
    }

    /// Split the network address into host and port
    ///
    /// IPv6 hosts must be bracketed (`[2001:db8::1]:51820`).
    pub fn host_port(&self) -> Result<(&str, u16), ValidationError> {
        let malformed = || ValidationError::MalformedEndpoint(self.network_address.clone());
        let addr = self.network_address.trim();

        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(malformed)?;
            (host, port)
        } else {
            let (host, port) = addr.rsplit_once(':').ok_or_else(malformed)?;
            if host.contains(':') {
                return Err(malformed());
            }
            (host, port)
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(malformed());
        }

        let port: u16 = port.parse().map_err(|_| malformed())?;
        if port == 0 {
            return Err(malformed());
        }

        Ok((host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.country_label, self.network_address)
    }
}

/// Selectable endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointCatalog {
    endpoints: Vec<Endpoint>,
}

impl EndpointCatalog {
    /// Wrap a list of endpoints
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    /// Built-in exit servers
    pub fn builtin() -> Self {
        let entries = [
            ("USA", "198.51.100.10:51820", "ServerPublicKey1ABC=="),
            ("United Kingdom", "203.0.113.20:51820", "ServerPublicKey2DEF=="),
            ("Germany", "192.0.2.30:51820", "ServerPublicKey3GHI=="),
            ("Japan", "198.18.0.40:51820", "ServerPublicKey4JKL=="),
            ("Australia", "198.18.1.50:51820", "ServerPublicKey5MNO=="),
            ("Singapore", "198.18.2.60:51820", "ServerPublicKey6PQR=="),
            ("Canada", "198.18.3.70:51820", "ServerPublicKey7STU=="),
            ("France", "198.18.4.80:51820", "ServerPublicKey8VWX=="),
        ];

        Self::new(
            entries
                .iter()
                .map(|(label, addr, key)| Endpoint::new(*label, *addr, *key))
                .collect(),
        )
    }

    /// All endpoints in catalog order
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Find by label (case-insensitive)
    pub fn find(&self, label: &str) -> Option<&Endpoint> {
        let label = label.trim();
        self.endpoints
            .iter()
            .find(|e| e.country_label.eq_ignore_ascii_case(label))
    }

    /// Find by network address
    pub fn find_by_address(&self, address: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.network_address == address)
    }

    /// First network address that appears more than once
    pub(crate) fn duplicate_address(&self) -> Option<&str> {
        self.endpoints.iter().enumerate().find_map(|(i, e)| {
            self.endpoints[..i]
                .iter()
                .any(|prev| prev.same_server(e))
                .then_some(e.network_address.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = EndpointCatalog::builtin();

        assert_eq!(catalog.len(), 8);
        assert!(catalog.duplicate_address().is_none());
        for endpoint in catalog.endpoints() {
            assert!(endpoint.host_port().is_ok(), "{}", endpoint);
        }
    }

    #[test]
    fn test_find_by_label() {
        let catalog = EndpointCatalog::builtin();

        let de = catalog.find("germany").unwrap();
        assert_eq!(de.network_address, "192.0.2.30:51820");
        assert!(catalog.find("Atlantis").is_none());
        assert!(catalog.find_by_address("198.18.0.40:51820").is_some());
    }

    #[test]
    fn test_identity_is_address() {
        let a = Endpoint::new("DE", "192.0.2.30:51820", "k1");
        let b = Endpoint::new("Germany", "192.0.2.30:51820", "k2");
        let c = Endpoint::new("DE", "192.0.2.31:51820", "k1");

        assert!(a.same_server(&b));
        assert!(!a.same_server(&c));
    }

    #[test]
    fn test_host_port() {
        let ep = Endpoint::new("DE", "vpn.example.net:51820", "k");
        assert_eq!(ep.host_port().unwrap(), ("vpn.example.net", 51820));

        let v6 = Endpoint::new("DE", "[2001:db8::1]:51820", "k");
        assert_eq!(v6.host_port().unwrap(), ("2001:db8::1", 51820));
    }

    #[test]
    fn test_malformed_addresses() {
        for bad in ["", "192.0.2.1", ":51820", "host:0", "host:99999", "2001:db8::1:51820", "[::1]51820"] {
            let ep = Endpoint::new("X", bad, "k");
            assert!(
                matches!(ep.host_port(), Err(ValidationError::MalformedEndpoint(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_duplicate_address() {
        let catalog = EndpointCatalog::new(vec![
            Endpoint::new("A", "192.0.2.1:51820", "k"),
            Endpoint::new("B", "192.0.2.1:51820", "k"),
        ]);
        assert_eq!(catalog.duplicate_address(), Some("192.0.2.1:51820"));
    }
}
