//! Tunnel Configuration
//!
//! Resolved, validated configuration values for one tunnel: the local
//! interface plus an ordered list of peers. A `Config` is a plain value;
//! editing goes through [`ConfigDraft`](crate::ConfigDraft) and produces a
//! new `Config`, so two tunnels never share mutable settings.

use crate::keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Largest datagram the native backend will send or accept
pub const MAX_SEGMENT_SIZE: u32 = 65535;

/// Size of a handshake initiation message before junk padding
const INIT_MESSAGE_SIZE: u32 = 148;

/// Size of a handshake response message before junk padding
const RESPONSE_MESSAGE_SIZE: u32 = 92;

/// Size of a cookie reply message before junk padding
const COOKIE_REPLY_MESSAGE_SIZE: u32 = 64;

/// Size of a transport data header (with tag) before junk padding
const TRANSPORT_MESSAGE_SIZE: u32 = 32;

/// Magic header values at or below this are the stock WireGuard types
const STOCK_MESSAGE_TYPE_MAX: u32 = 4;

/// Network endpoint (host + port)
///
/// The host is kept as written: either an IP literal or a DNS name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidEndpoint(format!("{}:{}", host, port)));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP address, when it is a literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());
        let s = s.trim();

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // [v6]:port
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            if host.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(invalid());
            }
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        let port: u16 = port.parse().map_err(|_| invalid())?;
        Self::new(host, port).map_err(|_| invalid())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Address with prefix length (CIDR notation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(ConfigError::InvalidAddress(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for IpNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidAddress(s.to_string());
        let s = s.trim();

        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Self::new(addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| invalid())?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                Self::new(addr, prefix)
            }
        }
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Message type header, either one value or an inclusive `min-max` range
///
/// Each outgoing message picks a value from the range, so a peer accepts
/// anything inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MagicHeader {
    min: u32,
    max: u32,
}

impl MagicHeader {
    pub fn new(min: u32, max: u32) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidNumber {
                field: "magic header",
                value: format!("{}-{}", min, max),
            });
        }
        Ok(Self { min, max })
    }

    pub fn single(value: u32) -> Self {
        Self { min: value, max: value }
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Whether this replaces a stock WireGuard message type
    pub fn is_custom(&self) -> bool {
        self.min > STOCK_MESSAGE_TYPE_MAX
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

impl FromStr for MagicHeader {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidNumber {
            field: "magic header",
            value: s.to_string(),
        };
        let s = s.trim();

        match s.split_once('-') {
            Some((min, max)) => {
                let min = min.trim().parse().map_err(|_| invalid())?;
                let max = max.trim().parse().map_err(|_| invalid())?;
                Self::new(min, max).map_err(|_| invalid())
            }
            None => s.parse().map(Self::single).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for MagicHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

string_serde!(Endpoint);
string_serde!(IpNetwork);
string_serde!(MagicHeader);

/// AmneziaWG obfuscation parameters
///
/// `jc`/`jmin`/`jmax` control junk packets sent before a handshake.
/// `s1`..`s4` pad the initiation, response, cookie reply and transport
/// messages, and `h1`..`h4` replace their type headers. `i1`..`i5` are
/// special junk packets described with `<tag ...>` templates that the
/// backend expands before each handshake. Unset values keep stock
/// WireGuard behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obfuscation {
    pub jc: Option<u32>,
    pub jmin: Option<u32>,
    pub jmax: Option<u32>,
    pub s1: Option<u32>,
    pub s2: Option<u32>,
    pub s3: Option<u32>,
    pub s4: Option<u32>,
    pub h1: Option<MagicHeader>,
    pub h2: Option<MagicHeader>,
    pub h3: Option<MagicHeader>,
    pub h4: Option<MagicHeader>,
    pub i1: Option<String>,
    pub i2: Option<String>,
    pub i3: Option<String>,
    pub i4: Option<String>,
    pub i5: Option<String>,
}

impl Obfuscation {
    /// Check if any parameter deviates from stock WireGuard
    pub fn is_enabled(&self) -> bool {
        *self != Self::default()
    }

    /// Magic headers in wire order, paired with their key names
    pub fn magic_headers(&self) -> [(&'static str, Option<MagicHeader>); 4] {
        [("H1", self.h1), ("H2", self.h2), ("H3", self.h3), ("H4", self.h4)]
    }

    /// Special junk templates in send order, paired with their key names
    pub fn special_junk(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("I1", self.i1.as_deref()),
            ("I2", self.i2.as_deref()),
            ("I3", self.i3.as_deref()),
            ("I4", self.i4.as_deref()),
            ("I5", self.i5.as_deref()),
        ]
    }

    /// Validate the constraints the native backend enforces
    pub fn validate(&self) -> Result<(), ConfigError> {
        let jmin = self.jmin.unwrap_or(0);
        let jmax = self.jmax.unwrap_or(0);

        if jmax >= MAX_SEGMENT_SIZE {
            return Err(ConfigError::ObfuscationOutOfRange { param: "Jmax", value: jmax });
        }
        if jmax < jmin {
            return Err(ConfigError::JunkRange { min: jmin, max: jmax });
        }

        let mut sizes = HashSet::new();
        for (param, base, junk) in [
            ("S1", INIT_MESSAGE_SIZE, self.s1),
            ("S2", RESPONSE_MESSAGE_SIZE, self.s2),
            ("S3", COOKIE_REPLY_MESSAGE_SIZE, self.s3),
            ("S4", TRANSPORT_MESSAGE_SIZE, self.s4),
        ] {
            let junk = junk.unwrap_or(0);
            let size = base.saturating_add(junk);
            if size >= MAX_SEGMENT_SIZE {
                return Err(ConfigError::ObfuscationOutOfRange { param, value: junk });
            }
            if !sizes.insert(size) {
                return Err(ConfigError::SameMessageSizes(size));
            }
        }

        let custom: Vec<MagicHeader> = self
            .magic_headers()
            .into_iter()
            .filter_map(|(_, header)| header.filter(MagicHeader::is_custom))
            .collect();
        for (i, header) in custom.iter().enumerate() {
            if let Some(other) = custom[..i].iter().find(|other| other.overlaps(header)) {
                return Err(ConfigError::DuplicateMagicHeader(header.min.max(other.min)));
            }
        }

        for (param, template) in self.special_junk() {
            if let Some(template) = template {
                if !is_junk_template(template) {
                    return Err(ConfigError::InvalidJunkTemplate {
                        param,
                        value: template.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// A junk template is one or more non-empty `<...>` tags
fn is_junk_template(text: &str) -> bool {
    let mut rest = text.trim();
    if rest.is_empty() {
        return false;
    }
    while !rest.is_empty() {
        let Some(body) = rest.strip_prefix('<') else {
            return false;
        };
        let Some((tag, tail)) = body.split_once('>') else {
            return false;
        };
        if tag.trim().is_empty() || tag.contains('<') {
            return false;
        }
        rest = tail.trim_start();
    }
    true
}

/// Local interface settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Our private key
    pub private_key: PrivateKey,
    /// Addresses assigned to the tunnel interface
    #[serde(default)]
    pub addresses: Vec<IpNetwork>,
    /// DNS servers to use inside the tunnel
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// UDP listen port (random when unset)
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    #[serde(default)]
    pub obfuscation: Obfuscation,
}

impl Interface {
    /// Create interface settings with only a private key
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            addresses: Vec::new(),
            dns: Vec::new(),
            listen_port: None,
            mtu: None,
            obfuscation: Obfuscation::default(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }
}

/// WireGuard peer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Preshared key (optional, for post-quantum resistance)
    pub preshared_key: Option<PresharedKey>,
    /// Peer's endpoint
    pub endpoint: Option<Endpoint>,
    /// Allowed IPs (what traffic to route through this peer)
    #[serde(default)]
    pub allowed_ips: Vec<IpNetwork>,
    /// Persistent keepalive interval (seconds)
    pub persistent_keepalive: Option<u16>,
}

impl Peer {
    /// Create a peer with only a public key
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub interface: Interface,
    /// Peers in the order they were written
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl Config {
    pub fn new(interface: Interface, peers: Vec<Peer>) -> Self {
        Self { interface, peers }
    }

    /// Validate configuration
    ///
    /// Fields that are individually typed are already valid; this checks the
    /// constraints that span fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interface.obfuscation.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(&peer.public_key) {
                return Err(ConfigError::DuplicatePeer(peer.public_key.to_base64()));
            }
        }

        Ok(())
    }

    /// First peer's endpoint, if any
    pub fn primary_endpoint(&self) -> Option<&Endpoint> {
        self.peers.first().and_then(|p| p.endpoint.as_ref())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field {section}.{field}")]
    MissingField {
        section: &'static str,
        field: &'static str,
    },

    #[error("Invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid value for {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    #[error("{param} out of range: {value} (must stay below 65535)")]
    ObfuscationOutOfRange { param: &'static str, value: u32 },

    #[error("Jmax ({max}) must not be smaller than Jmin ({min})")]
    JunkRange { min: u32, max: u32 },

    #[error("Two padded message types have the same size ({0})")]
    SameMessageSizes(u32),

    #[error("Magic header {0} is used more than once")]
    DuplicateMagicHeader(u32),

    #[error("Invalid junk template for {param}: {value:?}")]
    InvalidJunkTemplate { param: &'static str, value: String },

    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Unknown key {key:?} in [{section}]")]
    UnknownKey { section: &'static str, key: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn config_with_peers(peers: Vec<Peer>) -> Config {
        Config::new(Interface::new(PrivateKey::generate()), peers)
    }

    #[test]
    fn test_endpoint_parse() {
        let ep: Endpoint = "203.0.113.5:51820".parse().unwrap();
        assert_eq!(ep.host(), "203.0.113.5");
        assert_eq!(ep.port(), 51820);
        assert!(ep.ip().is_some());

        let ep: Endpoint = "vpn.example.com:443".parse().unwrap();
        assert_eq!(ep.host(), "vpn.example.com");
        assert!(ep.ip().is_none());
    }

    #[test]
    fn test_endpoint_ipv6() {
        let ep: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(ep.host(), "2001:db8::1");
        assert_eq!(ep.to_string(), "[2001:db8::1]:51820");
    }

    #[test]
    fn test_endpoint_malformed() {
        for bad in ["", "host", "host:", ":51820", "host:99999", "2001:db8::1:51820", "[nothost]:1"] {
            assert!(bad.parse::<Endpoint>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_ip_network() {
        let net: IpNetwork = "10.0.0.2/32".parse().unwrap();
        assert_eq!(net.prefix(), 32);

        let bare: IpNetwork = "fd00::2".parse().unwrap();
        assert_eq!(bare.prefix(), 128);

        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("10.0.0/8".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let public = KeyPair::generate().public;
        let config = config_with_peers(vec![Peer::new(public.clone()), Peer::new(public)]);

        assert!(matches!(config.validate(), Err(ConfigError::DuplicatePeer(_))));
    }

    #[test]
    fn test_obfuscation_defaults_valid() {
        let obf = Obfuscation::default();
        assert!(!obf.is_enabled());
        assert!(obf.validate().is_ok());
    }

    #[test]
    fn test_obfuscation_junk_range() {
        let obf = Obfuscation {
            jc: Some(4),
            jmin: Some(100),
            jmax: Some(50),
            ..Default::default()
        };
        assert_eq!(obf.validate(), Err(ConfigError::JunkRange { min: 100, max: 50 }));

        let obf = Obfuscation {
            jmax: Some(MAX_SEGMENT_SIZE),
            ..Default::default()
        };
        assert!(matches!(
            obf.validate(),
            Err(ConfigError::ObfuscationOutOfRange { param: "Jmax", .. })
        ));
    }

    #[test]
    fn test_obfuscation_message_sizes_must_differ() {
        // 148 + 0 == 92 + 56
        let obf = Obfuscation {
            s2: Some(56),
            ..Default::default()
        };
        assert_eq!(obf.validate(), Err(ConfigError::SameMessageSizes(148)));
    }

    #[test]
    fn test_obfuscation_all_padded_sizes_must_differ() {
        // 64 + 28 == 92 + 0
        let obf = Obfuscation {
            s3: Some(28),
            ..Default::default()
        };
        assert_eq!(obf.validate(), Err(ConfigError::SameMessageSizes(92)));

        // 32 + 32 == 64 + 0
        let obf = Obfuscation {
            s4: Some(32),
            ..Default::default()
        };
        assert_eq!(obf.validate(), Err(ConfigError::SameMessageSizes(64)));

        let obf = Obfuscation {
            s1: Some(15),
            s2: Some(31),
            s3: Some(10),
            s4: Some(20),
            ..Default::default()
        };
        assert!(obf.validate().is_ok());

        let obf = Obfuscation {
            s4: Some(MAX_SEGMENT_SIZE),
            ..Default::default()
        };
        assert!(matches!(
            obf.validate(),
            Err(ConfigError::ObfuscationOutOfRange { param: "S4", .. })
        ));
    }

    #[test]
    fn test_obfuscation_magic_headers() {
        let obf = Obfuscation {
            h1: Some(MagicHeader::single(1_234_567)),
            h2: Some(MagicHeader::single(1_234_567)),
            ..Default::default()
        };
        assert_eq!(obf.validate(), Err(ConfigError::DuplicateMagicHeader(1_234_567)));

        // Stock values are never treated as duplicates
        let obf = Obfuscation {
            h1: Some(MagicHeader::single(1)),
            h2: Some(MagicHeader::single(1)),
            ..Default::default()
        };
        assert!(obf.validate().is_ok());
    }

    #[test]
    fn test_magic_header_ranges() {
        let range: MagicHeader = "100-200".parse().unwrap();
        assert_eq!((range.min(), range.max()), (100, 200));
        assert_eq!(range.to_string(), "100-200");
        assert_eq!("5".parse::<MagicHeader>().unwrap().to_string(), "5");
        assert!("200-100".parse::<MagicHeader>().is_err());
        assert!("100-".parse::<MagicHeader>().is_err());

        let obf = Obfuscation {
            h1: Some(range),
            h2: Some("150-300".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(obf.validate(), Err(ConfigError::DuplicateMagicHeader(150)));

        let obf = Obfuscation {
            h1: Some(range),
            h2: Some("201-300".parse().unwrap()),
            h3: Some(MagicHeader::single(400)),
            h4: Some(MagicHeader::single(500)),
            ..Default::default()
        };
        assert!(obf.validate().is_ok());
    }

    #[test]
    fn test_junk_templates() {
        let obf = Obfuscation {
            i1: Some("<b 0xf6ab3267fa><c><t><r 10>".into()),
            i2: Some("<r 40>".into()),
            ..Default::default()
        };
        assert!(obf.is_enabled());
        assert!(obf.validate().is_ok());

        for bad in ["0xf6ab", "<b 0xf6", "<>", "<b <c>>"] {
            let obf = Obfuscation {
                i3: Some(bad.into()),
                ..Default::default()
            };
            assert!(
                matches!(obf.validate(), Err(ConfigError::InvalidJunkTemplate { param: "I3", .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_config_serde_json() {
        let mut peer = Peer::new(KeyPair::generate().public);
        peer.endpoint = Some("203.0.113.5:51820".parse().unwrap());
        peer.allowed_ips = vec!["0.0.0.0/0".parse().unwrap()];
        let config = config_with_peers(vec![peer]);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"203.0.113.5:51820\""));
        assert!(json.contains("\"0.0.0.0/0\""));

        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
