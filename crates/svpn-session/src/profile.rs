//! Tunnel Profiles
//!
//! Builds, renders and parses the WireGuard profile handed to a tunnel
//! backend. The same text is used for the live connection and for the
//! file the user downloads.
//!
//! # Format
//!
//! ```text
//! [Interface]
//! PrivateKey = <client private key>
//! Address = 10.8.0.2/24
//! DNS = 1.1.1.1, 1.0.0.1
//!
//! [Peer]
//! PublicKey = <server public key>
//! Endpoint = 192.0.2.30:51820
//! AllowedIPs = 0.0.0.0/0, ::/0
//! PersistentKeepalive = 25
//! ```
//!
//! # Client Address Policy
//!
//! [`AddressPool::allocate`] picks a host address uniformly at random from
//! the pool, excluding the network address, the gateway (first host) and
//! the broadcast address. There is no collision detection: one client per
//! session is assumed.

use crate::endpoint::Endpoint;
use crate::keys::KeyMaterial;
use rand::Rng;
use std::fmt::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default routes sent through the tunnel
pub const DEFAULT_ALLOWED_IPS: [&str; 2] = ["0.0.0.0/0", "::/0"];

/// Default persistent keepalive (seconds)
pub const DEFAULT_KEEPALIVE: u16 = 25;

/// Profile input errors (never retried)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Private key is empty")]
    EmptyPrivateKey,

    #[error("Server public key is empty")]
    EmptyServerKey,

    #[error("Malformed endpoint address: {0:?}")]
    MalformedEndpoint(String),

    #[error("Invalid address pool: {0}")]
    InvalidPool(String),

    #[error("Invalid client address: {0:?}")]
    InvalidClientAddress(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("{0} contains a line break or control character")]
    InvalidKey(&'static str),
}

/// Client tunnel address with its prefix length (`10.8.0.2/24`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientAddress {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl ClientAddress {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        Self { addr, prefix }
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for ClientAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidClientAddress(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;

        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

/// Private IPv4 range client addresses are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Addr,
    prefix: u8,
}

impl AddressPool {
    /// Create a pool, checking alignment and that the range is private
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self, ValidationError> {
        if !(8..=30).contains(&prefix) {
            return Err(ValidationError::InvalidPool(format!(
                "prefix /{} outside /8../30",
                prefix
            )));
        }
        if !network.is_private() {
            return Err(ValidationError::InvalidPool(format!(
                "{} is not a private range",
                network
            )));
        }

        let host_mask = u32::MAX >> prefix;
        if u32::from(network) & host_mask != 0 {
            return Err(ValidationError::InvalidPool(format!(
                "{}/{} has host bits set",
                network, prefix
            )));
        }

        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses the allocation policy can hand out
    pub fn capacity(&self) -> u32 {
        (1u32 << (32 - self.prefix)) - 3
    }

    /// Whether `addr` is one the policy could have produced
    pub fn is_allocatable(&self, addr: Ipv4Addr) -> bool {
        let base = u32::from(self.network);
        let size = 1u32 << (32 - self.prefix);
        let value = u32::from(addr);

        value >= base + 2 && value <= base + size - 2
    }

    /// Uniform-random pick, skipping network, gateway and broadcast
    pub fn allocate<R: Rng + ?Sized>(&self, rng: &mut R) -> ClientAddress {
        let size = 1u32 << (32 - self.prefix);
        let offset = rng.gen_range(2..=size - 2);
        let addr = Ipv4Addr::from(u32::from(self.network) + offset);

        ClientAddress::new(IpAddr::V4(addr), self.prefix)
    }
}

impl Default for AddressPool {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 8, 0, 0),
            prefix: 24,
        }
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for AddressPool {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidPool(s.to_string());
        let (network, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let network: Ipv4Addr = network.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(network, prefix)
    }
}

/// Fully rendered tunnel configuration
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelProfile {
    private_key: String,
    address: ClientAddress,
    dns: Vec<IpAddr>,
    endpoint: Endpoint,
    allowed_ips: Vec<String>,
    keepalive: Option<u16>,
}

impl TunnelProfile {
    /// Endpoint this profile connects to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Client tunnel address
    pub fn address(&self) -> ClientAddress {
        self.address
    }

    pub fn dns(&self) -> &[IpAddr] {
        &self.dns
    }

    pub fn allowed_ips(&self) -> &[String] {
        &self.allowed_ips
    }

    pub fn keepalive(&self) -> Option<u16> {
        self.keepalive
    }

    /// Render as WireGuard configuration text
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(256);

        // Writing into a String cannot fail
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", self.private_key);
        let _ = writeln!(out, "Address = {}", self.address);
        if !self.dns.is_empty() {
            let dns: Vec<String> = self.dns.iter().map(|d| d.to_string()).collect();
            let _ = writeln!(out, "DNS = {}", dns.join(", "));
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", self.endpoint.server_public_key);
        let _ = writeln!(out, "Endpoint = {}", self.endpoint.network_address);
        if !self.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", self.allowed_ips.join(", "));
        }
        if let Some(keepalive) = self.keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }

        out
    }

    /// Parse profile text rendered elsewhere (e.g. by the issuance service)
    ///
    /// `country_label` names the endpoint, since the text does not carry it.
    pub fn parse(country_label: &str, text: &str) -> Result<Self, ValidationError> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Interface,
            Peer,
        }

        let invalid = |msg: &str| ValidationError::InvalidProfile(msg.to_string());

        let mut section = Section::None;
        let mut private_key = None;
        let mut address = None;
        let mut dns = Vec::new();
        let mut public_key = None;
        let mut network_address = None;
        let mut allowed_ips = Vec::new();
        let mut keepalive = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line {
                "[Interface]" => {
                    section = Section::Interface;
                    continue;
                }
                "[Peer]" => {
                    section = Section::Peer;
                    continue;
                }
                _ => {}
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(invalid(&format!("expected key = value, got {:?}", line)));
            };
            let key = key.trim();
            let value = value.trim();

            match (&section, key) {
                (Section::Interface, "PrivateKey") => private_key = Some(value.to_string()),
                (Section::Interface, "Address") => address = Some(value.parse::<ClientAddress>()?),
                (Section::Interface, "DNS") => {
                    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        let ip = entry
                            .parse()
                            .map_err(|_| invalid(&format!("bad DNS server {:?}", entry)))?;
                        dns.push(ip);
                    }
                }
                (Section::Peer, "PublicKey") => public_key = Some(value.to_string()),
                (Section::Peer, "Endpoint") => network_address = Some(value.to_string()),
                (Section::Peer, "AllowedIPs") => {
                    allowed_ips = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                (Section::Peer, "PersistentKeepalive") => {
                    keepalive = Some(
                        value
                            .parse()
                            .map_err(|_| invalid(&format!("bad keepalive {:?}", value)))?,
                    );
                }
                (Section::None, _) => return Err(invalid("key outside of a section")),
                _ => {}
            }
        }

        let private_key = private_key.ok_or_else(|| invalid("missing PrivateKey"))?;
        let address = address.ok_or_else(|| invalid("missing Address"))?;
        let public_key = public_key.ok_or_else(|| invalid("missing PublicKey"))?;
        let network_address = network_address.ok_or_else(|| invalid("missing Endpoint"))?;

        let endpoint = Endpoint::new(country_label, network_address, public_key);
        validate_peer(&private_key, &endpoint)?;
        validate_routes(&allowed_ips)?;

        Ok(Self {
            private_key,
            address,
            dns,
            endpoint,
            allowed_ips,
            keepalive,
        })
    }

    /// Package the rendered text as a downloadable file
    pub fn export(&self, product: &str) -> ExportedProfile {
        ExportedProfile {
            file_name: export_file_name(product, &self.endpoint.country_label),
            contents: self.render(),
        }
    }
}

impl fmt::Debug for TunnelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelProfile")
            .field("private_key", &"[redacted]")
            .field("address", &self.address)
            .field("dns", &self.dns)
            .field("endpoint", &self.endpoint)
            .field("allowed_ips", &self.allowed_ips)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

/// Reject values that could add lines to the rendered text
fn check_single_line(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.chars().any(char::is_control) {
        return Err(ValidationError::InvalidKey(field));
    }
    Ok(())
}

fn validate_routes(allowed_ips: &[String]) -> Result<(), ValidationError> {
    allowed_ips
        .iter()
        .try_for_each(|route| check_single_line("AllowedIPs", route))
}

fn validate_peer(private_key: &str, endpoint: &Endpoint) -> Result<(), ValidationError> {
    check_single_line("PrivateKey", private_key)?;
    check_single_line("PublicKey", &endpoint.server_public_key)?;
    check_single_line("Endpoint", &endpoint.network_address)?;

    if private_key.trim().is_empty() {
        return Err(ValidationError::EmptyPrivateKey);
    }
    if endpoint.server_public_key.trim().is_empty() {
        return Err(ValidationError::EmptyServerKey);
    }
    endpoint.host_port()?;
    Ok(())
}

/// `<product>-<label>.conf`, lowercased, separators flattened to `-`
pub fn export_file_name(product: &str, label: &str) -> String {
    let normalize = |s: &str| -> String {
        s.trim()
            .chars()
            .map(|c| {
                if c.is_whitespace() || c == '/' || c == '\\' {
                    '-'
                } else {
                    c
                }
            })
            .collect::<String>()
            .to_lowercase()
    };

    format!("{}-{}.conf", normalize(product), normalize(label))
}

/// Profile text packaged for download
#[derive(Clone, PartialEq, Eq)]
pub struct ExportedProfile {
    pub file_name: String,
    pub contents: String,
}

impl fmt::Debug for ExportedProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedProfile")
            .field("file_name", &self.file_name)
            .field("contents", &format_args!("<{} bytes>", self.contents.len()))
            .finish()
    }
}

impl ExportedProfile {
    /// Write into `dir`, returning the full path
    pub async fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&self.file_name);
        tokio::fs::write(&path, self.contents.as_bytes()).await?;
        Ok(path)
    }
}

/// Builds profiles from keys, endpoint, client address and DNS
///
/// Holds only the routing parameters; building is pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileBuilder {
    allowed_ips: Vec<String>,
    keepalive: Option<u16>,
}

impl ProfileBuilder {
    pub fn new(allowed_ips: Vec<String>, keepalive: Option<u16>) -> Self {
        Self {
            allowed_ips,
            keepalive,
        }
    }

    /// Build a profile
    ///
    /// Identical inputs always render identical text.
    pub fn build(
        &self,
        keys: &KeyMaterial,
        endpoint: &Endpoint,
        client_address: ClientAddress,
        dns: &[IpAddr],
    ) -> Result<TunnelProfile, ValidationError> {
        validate_peer(keys.private_key(), endpoint)?;
        validate_routes(&self.allowed_ips)?;

        Ok(TunnelProfile {
            private_key: keys.private_key().to_string(),
            address: client_address,
            dns: dns.to_vec(),
            endpoint: endpoint.clone(),
            allowed_ips: self.allowed_ips.clone(),
            keepalive: self.keepalive,
        })
    }
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALLOWED_IPS.iter().map(|s| s.to_string()).collect(),
            Some(DEFAULT_KEEPALIVE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn keys() -> KeyMaterial {
        KeyMaterial::new("cHJpdmF0ZS1rZXktYnl0ZXMtMzItbG9uZy4uLi4uLi4=", "cHVibGlj")
    }

    fn germany() -> Endpoint {
        Endpoint::new("Germany", "192.0.2.30:51820", "ServerPublicKey3GHI==")
    }

    fn dns() -> Vec<IpAddr> {
        vec!["1.1.1.1".parse().unwrap(), "1.0.0.1".parse().unwrap()]
    }

    fn client() -> ClientAddress {
        "10.8.0.2/24".parse().unwrap()
    }

    #[test]
    fn test_render_format() {
        let profile = ProfileBuilder::default()
            .build(&keys(), &germany(), client(), &dns())
            .unwrap();

        let expected = "[Interface]\n\
            PrivateKey = cHJpdmF0ZS1rZXktYnl0ZXMtMzItbG9uZy4uLi4uLi4=\n\
            Address = 10.8.0.2/24\n\
            DNS = 1.1.1.1, 1.0.0.1\n\
            \n\
            [Peer]\n\
            PublicKey = ServerPublicKey3GHI==\n\
            Endpoint = 192.0.2.30:51820\n\
            AllowedIPs = 0.0.0.0/0, ::/0\n\
            PersistentKeepalive = 25\n";
        assert_eq!(profile.render(), expected);
    }

    #[test]
    fn test_deterministic() {
        let builder = ProfileBuilder::default();
        let a = builder.build(&keys(), &germany(), client(), &dns()).unwrap();
        let b = builder.build(&keys(), &germany(), client(), &dns()).unwrap();

        assert_eq!(a.render().as_bytes(), b.render().as_bytes());
    }

    #[test]
    fn test_empty_dns_omits_line() {
        let profile = ProfileBuilder::default()
            .build(&keys(), &germany(), client(), &[])
            .unwrap();
        assert!(!profile.render().contains("DNS"));
    }

    #[test]
    fn test_validation() {
        let builder = ProfileBuilder::default();

        let err = builder
            .build(&KeyMaterial::new("", "pub"), &germany(), client(), &dns())
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptyPrivateKey);

        let no_key = Endpoint::new("Germany", "192.0.2.30:51820", "");
        let err = builder.build(&keys(), &no_key, client(), &dns()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyServerKey);

        let bad_addr = Endpoint::new("Germany", "192.0.2.30", "k");
        let err = builder.build(&keys(), &bad_addr, client(), &dns()).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedEndpoint(_)));
    }

    #[test]
    fn test_line_breaks_rejected() {
        let builder = ProfileBuilder::default();

        let hostile = KeyMaterial::new("abc\nDNS = 6.6.6.6", "pub");
        let err = builder.build(&hostile, &germany(), client(), &dns()).unwrap_err();
        assert_eq!(err, ValidationError::InvalidKey("PrivateKey"));

        let hostile = KeyMaterial::new("abc\r\nPostUp = sh -c id", "pub");
        assert!(builder.build(&hostile, &germany(), client(), &dns()).is_err());

        let server = Endpoint::new("Germany", "192.0.2.30:51820", "srv==\nPostUp = id");
        let err = builder.build(&keys(), &server, client(), &dns()).unwrap_err();
        assert_eq!(err, ValidationError::InvalidKey("PublicKey"));

        let routes = ProfileBuilder::new(vec!["0.0.0.0/0\nPostUp = id".into()], None);
        let err = routes.build(&keys(), &germany(), client(), &dns()).unwrap_err();
        assert_eq!(err, ValidationError::InvalidKey("AllowedIPs"));
    }

    #[test]
    fn test_parse_rejects_control_characters() {
        let text = "[Interface]\nPrivateKey = abc\u{1b}=\nAddress = 10.8.0.2/24\n\n\
                    [Peer]\nPublicKey = k\nEndpoint = 192.0.2.30:51820\n";
        let err = TunnelProfile::parse("Germany", text).unwrap_err();
        assert_eq!(err, ValidationError::InvalidKey("PrivateKey"));
    }

    #[test]
    fn test_parse_rendered() {
        let profile = ProfileBuilder::default()
            .build(&keys(), &germany(), client(), &dns())
            .unwrap();

        let parsed = TunnelProfile::parse("Germany", &profile.render()).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn test_parse_service_output() {
        let text = "[Interface]\nPrivateKey = abc=\nAddress = 10.8.0.2/24\nDNS = 1.1.1.1, 1.0.0.1\n\n\
                    [Peer]\nPublicKey = DefaultServerKey==\nEndpoint = 198.51.100.1:51820\n\
                    AllowedIPs = 0.0.0.0/0, ::/0\nPersistentKeepalive = 25\n";

        let profile = TunnelProfile::parse("USA", text).unwrap();
        assert_eq!(profile.endpoint().network_address, "198.51.100.1:51820");
        assert_eq!(profile.endpoint().country_label, "USA");
        assert_eq!(profile.dns().len(), 2);
        assert_eq!(profile.keepalive(), Some(25));
    }

    #[test]
    fn test_parse_missing_fields() {
        let err = TunnelProfile::parse("X", "[Interface]\nPrivateKey = a\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidProfile(_)));

        let err = TunnelProfile::parse("X", "PrivateKey = a\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidProfile(_)));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let profile = ProfileBuilder::default()
            .build(&keys(), &germany(), client(), &dns())
            .unwrap();

        assert!(!format!("{:?}", profile).contains(keys().private_key()));
        assert!(!format!("{:?}", profile.export("SecureVPN")).contains(keys().private_key()));
    }

    #[test]
    fn test_export_file_name() {
        assert_eq!(export_file_name("SecureVPN", "Germany"), "securevpn-germany.conf");
        assert_eq!(
            export_file_name("SecureVPN", "United Kingdom"),
            "securevpn-united-kingdom.conf"
        );
        assert_eq!(export_file_name("SecureVPN", "a/b"), "securevpn-a-b.conf");
    }

    #[test]
    fn test_export_matches_live_text() {
        let profile = ProfileBuilder::default()
            .build(&keys(), &germany(), client(), &dns())
            .unwrap();
        let exported = profile.export("SecureVPN");

        assert_eq!(exported.contents, profile.render());
        assert_eq!(exported.file_name, "securevpn-germany.conf");
    }

    #[tokio::test]
    async fn test_export_write() {
        let dir = std::env::temp_dir().join(format!("svpn-export-{}", std::process::id()));
        let exported = ExportedProfile {
            file_name: "securevpn-japan.conf".into(),
            contents: "[Interface]\n".into(),
        };

        let path = exported.write_to(&dir).await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, "[Interface]\n");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_pool_allocation_policy() {
        let pool = AddressPool::default();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..2000 {
            let client = pool.allocate(&mut rng);
            let IpAddr::V4(v4) = client.addr else {
                panic!("pool produced {}", client);
            };
            assert_eq!(client.prefix, 24);
            assert!(pool.is_allocatable(v4), "{}", v4);
            assert_ne!(v4.octets()[3], 0);
            assert_ne!(v4.octets()[3], 1);
            assert_ne!(v4.octets()[3], 255);
        }
        assert_eq!(pool.capacity(), 253);
    }

    #[test]
    fn test_smallest_pool() {
        let pool: AddressPool = "192.168.7.0/30".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.allocate(&mut rng).to_string(), "192.168.7.2/30");
    }

    #[test]
    fn test_pool_rejects() {
        assert!("8.8.8.0/24".parse::<AddressPool>().is_err());
        assert!("10.8.0.1/24".parse::<AddressPool>().is_err());
        assert!("10.8.0.0/31".parse::<AddressPool>().is_err());
        assert!("10.0.0.0/4".parse::<AddressPool>().is_err());
        assert!("garbage".parse::<AddressPool>().is_err());
    }
}
