//! Config Drafts
//!
//! Editable, string-typed mirror of a [`Config`]. Front-ends bind text
//! fields to a draft and call [`ConfigDraft::resolve`] to get a validated
//! value. Resolution never touches the draft, so a failed resolve leaves
//! the user's input intact for correction.
//!
//! Peer drafts may repeat at this stage; duplicates are rejected only when
//! resolving.

use crate::config::{Config, ConfigError, Endpoint, Interface, Obfuscation, Peer};
use crate::keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

/// Editable interface settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDraft {
    pub private_key: String,
    /// Comma-separated CIDR list
    pub addresses: String,
    /// Comma-separated address list
    pub dns: String,
    pub listen_port: String,
    pub mtu: String,
    pub jc: String,
    pub jmin: String,
    pub jmax: String,
    pub s1: String,
    pub s2: String,
    pub s3: String,
    pub s4: String,
    /// Single value or `min-max` range
    pub h1: String,
    pub h2: String,
    pub h3: String,
    pub h4: String,
    pub i1: String,
    pub i2: String,
    pub i3: String,
    pub i4: String,
    pub i5: String,
}

impl InterfaceDraft {
    /// Replace the private key with a fresh one and return its public half
    pub fn generate_key_pair(&mut self) -> PublicKey {
        let pair = KeyPair::generate();
        self.private_key = pair.private.to_base64();
        pair.public
    }

    /// Public key derived from the current private key text, if it parses
    pub fn public_key(&self) -> Option<PublicKey> {
        PrivateKey::from_base64(&self.private_key)
            .ok()
            .map(|k| k.public_key())
    }

    fn resolve(&self) -> Result<Interface, ConfigError> {
        let private_key = parse_key("PrivateKey", &self.private_key, PrivateKey::from_base64)?
            .ok_or(ConfigError::MissingField {
                section: "Interface",
                field: "PrivateKey",
            })?;

        Ok(Interface {
            private_key,
            addresses: parse_list(&self.addresses)?,
            dns: parse_dns(&self.dns)?,
            listen_port: parse_number("ListenPort", &self.listen_port)?,
            mtu: parse_number("MTU", &self.mtu)?,
            obfuscation: Obfuscation {
                jc: parse_number("Jc", &self.jc)?,
                jmin: parse_number("Jmin", &self.jmin)?,
                jmax: parse_number("Jmax", &self.jmax)?,
                s1: parse_number("S1", &self.s1)?,
                s2: parse_number("S2", &self.s2)?,
                s3: parse_number("S3", &self.s3)?,
                s4: parse_number("S4", &self.s4)?,
                h1: parse_number("H1", &self.h1)?,
                h2: parse_number("H2", &self.h2)?,
                h3: parse_number("H3", &self.h3)?,
                h4: parse_number("H4", &self.h4)?,
                i1: parse_text(&self.i1),
                i2: parse_text(&self.i2),
                i3: parse_text(&self.i3),
                i4: parse_text(&self.i4),
                i5: parse_text(&self.i5),
            },
        })
    }
}

impl From<&Interface> for InterfaceDraft {
    fn from(interface: &Interface) -> Self {
        let obf = &interface.obfuscation;
        Self {
            private_key: interface.private_key.to_base64(),
            addresses: join(&interface.addresses),
            dns: join(&interface.dns),
            listen_port: opt(interface.listen_port),
            mtu: opt(interface.mtu),
            jc: opt(obf.jc),
            jmin: opt(obf.jmin),
            jmax: opt(obf.jmax),
            s1: opt(obf.s1),
            s2: opt(obf.s2),
            s3: opt(obf.s3),
            s4: opt(obf.s4),
            h1: opt(obf.h1),
            h2: opt(obf.h2),
            h3: opt(obf.h3),
            h4: opt(obf.h4),
            i1: obf.i1.clone().unwrap_or_default(),
            i2: obf.i2.clone().unwrap_or_default(),
            i3: obf.i3.clone().unwrap_or_default(),
            i4: obf.i4.clone().unwrap_or_default(),
            i5: obf.i5.clone().unwrap_or_default(),
        }
    }
}

/// Editable peer settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDraft {
    pub public_key: String,
    pub preshared_key: String,
    pub endpoint: String,
    /// Comma-separated CIDR list
    pub allowed_ips: String,
    pub persistent_keepalive: String,
}

impl PeerDraft {
    fn resolve(&self) -> Result<Peer, ConfigError> {
        let public_key = parse_key("PublicKey", &self.public_key, PublicKey::from_base64)?
            .ok_or(ConfigError::MissingField {
                section: "Peer",
                field: "PublicKey",
            })?;

        let endpoint = match self.endpoint.trim() {
            "" => None,
            text => Some(text.parse::<Endpoint>()?),
        };

        Ok(Peer {
            public_key,
            preshared_key: parse_key("PresharedKey", &self.preshared_key, PresharedKey::from_base64)?,
            endpoint,
            allowed_ips: parse_list(&self.allowed_ips)?,
            persistent_keepalive: parse_number("PersistentKeepalive", &self.persistent_keepalive)?,
        })
    }
}

impl From<&Peer> for PeerDraft {
    fn from(peer: &Peer) -> Self {
        Self {
            public_key: peer.public_key.to_base64(),
            preshared_key: peer
                .preshared_key
                .as_ref()
                .map(|k| k.to_base64())
                .unwrap_or_default(),
            endpoint: peer.endpoint.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            allowed_ips: join(&peer.allowed_ips),
            persistent_keepalive: opt(peer.persistent_keepalive),
        }
    }
}

/// Editable tunnel configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDraft {
    pub interface: InterfaceDraft,
    pub peers: Vec<PeerDraft>,
}

impl ConfigDraft {
    /// Create an empty draft
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fresh, empty peer and return it for editing
    pub fn add_peer(&mut self) -> &mut PeerDraft {
        self.peers.push(PeerDraft::default());
        let last = self.peers.len() - 1;
        &mut self.peers[last]
    }

    /// Resolve into a validated configuration
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let interface = self.interface.resolve()?;
        let peers = self
            .peers
            .iter()
            .map(PeerDraft::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        let config = Config::new(interface, peers);
        config.validate()?;
        Ok(config)
    }
}

impl From<&Config> for ConfigDraft {
    fn from(config: &Config) -> Self {
        Self {
            interface: InterfaceDraft::from(&config.interface),
            peers: config.peers.iter().map(PeerDraft::from).collect(),
        }
    }
}

fn parse_key<T>(
    field: &'static str,
    value: &str,
    parse: fn(&str) -> Result<T, KeyError>,
) -> Result<Option<T>, ConfigError> {
    match value.trim() {
        "" => Ok(None),
        text => parse(text)
            .map(Some)
            .map_err(|source| ConfigError::InvalidKey { field, source }),
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<Option<T>, ConfigError> {
    match value.trim() {
        "" => Ok(None),
        text => text.parse().map(Some).map_err(|_| ConfigError::InvalidNumber {
            field,
            value: text.to_string(),
        }),
    }
}

fn parse_text(value: &str) -> Option<String> {
    match value.trim() {
        "" => None,
        text => Some(text.to_string()),
    }
}

fn parse_list<T: FromStr<Err = ConfigError>>(value: &str) -> Result<Vec<T>, ConfigError> {
    split_list(value).map(str::parse).collect()
}

fn parse_dns(value: &str) -> Result<Vec<IpAddr>, ConfigError> {
    split_list(value)
        .map(|s| s.parse().map_err(|_| ConfigError::InvalidAddress(s.to_string())))
        .collect()
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_draft() -> ConfigDraft {
        let mut draft = ConfigDraft::new();
        draft.interface.generate_key_pair();
        draft.interface.addresses = "10.0.0.2/32".into();
        draft.interface.listen_port = "51820".into();

        let peer = draft.add_peer();
        peer.public_key = KeyPair::generate().public.to_base64();
        peer.endpoint = "203.0.113.5:51820".into();
        peer.allowed_ips = "0.0.0.0/0, ::/0".into();
        draft
    }

    #[test]
    fn test_resolve_valid() {
        let draft = valid_draft();
        let config = draft.resolve().unwrap();

        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.addresses.len(), 1);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].allowed_ips.len(), 2);
    }

    #[test]
    fn test_resolve_is_deterministic_and_pure() {
        let draft = valid_draft();
        let before = draft.clone();

        let a = draft.resolve().unwrap();
        let b = draft.resolve().unwrap();

        assert_eq!(a, b);
        assert_eq!(draft, before);
    }

    #[test]
    fn test_add_peer_preserves_order() {
        let mut draft = ConfigDraft::new();
        draft.add_peer().endpoint = "a.example:1".into();
        draft.add_peer().endpoint = "b.example:2".into();

        assert_eq!(draft.peers.len(), 2);
        assert_eq!(draft.peers[0].endpoint, "a.example:1");
        assert_eq!(draft.peers[1], PeerDraft {
            endpoint: "b.example:2".into(),
            ..Default::default()
        });
    }

    #[test]
    fn test_missing_private_key() {
        let mut draft = valid_draft();
        draft.interface.private_key.clear();

        assert_eq!(
            draft.resolve(),
            Err(ConfigError::MissingField {
                section: "Interface",
                field: "PrivateKey",
            })
        );
    }

    #[test]
    fn test_bad_key_length() {
        let mut draft = valid_draft();
        draft.peers[0].public_key = "AAAA".into();

        assert!(matches!(
            draft.resolve(),
            Err(ConfigError::InvalidKey {
                field: "PublicKey",
                source: KeyError::InvalidLength(3),
            })
        ));
    }

    #[test]
    fn test_malformed_endpoint() {
        let mut draft = valid_draft();
        draft.peers[0].endpoint = "203.0.113.5".into();

        assert!(matches!(draft.resolve(), Err(ConfigError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_duplicate_peer_rejected_at_resolve() {
        let mut draft = valid_draft();
        let copy = draft.peers[0].clone();
        draft.peers.push(copy);

        assert!(matches!(draft.resolve(), Err(ConfigError::DuplicatePeer(_))));
    }

    #[test]
    fn test_bad_number() {
        let mut draft = valid_draft();
        draft.interface.listen_port = "70000".into();

        assert_eq!(
            draft.resolve(),
            Err(ConfigError::InvalidNumber {
                field: "ListenPort",
                value: "70000".into(),
            })
        );
    }

    #[test]
    fn test_extended_obfuscation_fields() {
        let mut draft = valid_draft();
        draft.interface.s3 = "10".into();
        draft.interface.s4 = "20".into();
        draft.interface.h1 = "100-200".into();
        draft.interface.h2 = "300".into();
        draft.interface.i1 = " <b 0xf6ab3267fa><r 10> ".into();

        let config = draft.resolve().unwrap();
        let obf = &config.interface.obfuscation;
        assert_eq!(obf.s3, Some(10));
        assert_eq!(obf.h1.map(|h| (h.min(), h.max())), Some((100, 200)));
        assert_eq!(obf.i1.as_deref(), Some("<b 0xf6ab3267fa><r 10>"));
        assert_eq!(obf.i2, None);

        let back = ConfigDraft::from(&config);
        assert_eq!(back.interface.h1, "100-200");
        assert_eq!(back.interface.i1, "<b 0xf6ab3267fa><r 10>");

        draft.interface.h3 = "9-1".into();
        assert_eq!(
            draft.resolve(),
            Err(ConfigError::InvalidNumber {
                field: "H3",
                value: "9-1".into(),
            })
        );
    }

    #[test]
    fn test_draft_from_config() {
        let config = valid_draft().resolve().unwrap();
        let draft = ConfigDraft::from(&config);

        assert_eq!(draft.resolve().unwrap(), config);
        assert_eq!(draft.interface.public_key(), Some(config.interface.public_key()));
    }
}
