//! Xray proxy descriptor
//!
//! When a tunnel's traffic must ride over TCP, a local Xray instance
//! forwards the backend's datagrams to the first peer. This module renders
//! the JSON descriptor for that instance.

use crate::config::Config;
use serde_json::json;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Address the forwarder listens on
pub const LISTEN_ADDR: &str = "127.0.0.1";

/// Port the forwarder listens on
pub const LISTEN_PORT: u16 = 27182;

/// Transport used to reach the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    Udp,
    Tcp,
    #[default]
    Auto,
}

impl ProxyMode {
    /// Parse case-insensitively; anything unrecognized is `Auto`
    ///
    /// Other AmneziaWG clients match only the lowercase names and treat
    /// `"TCP"` as `Auto`; here it is `Tcp`.
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "udp" => ProxyMode::Udp,
            "tcp" => ProxyMode::Tcp,
            _ => ProxyMode::Auto,
        }
    }
}

impl FromStr for ProxyMode {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyMode::Udp => "udp",
            ProxyMode::Tcp => "tcp",
            ProxyMode::Auto => "auto",
        };
        write!(f, "{}", name)
    }
}

/// Render the forwarder descriptor
///
/// Only `Tcp` needs a forwarder. Every other mode, and a config whose first
/// peer has no endpoint, yields an empty string.
pub fn generate(config: &Config, mode: ProxyMode) -> String {
    if mode != ProxyMode::Tcp {
        return String::new();
    }

    let Some(endpoint) = config.primary_endpoint() else {
        return String::new();
    };

    let descriptor = json!({
        "inbounds": [
            {
                "listen": LISTEN_ADDR,
                "port": LISTEN_PORT,
                "protocol": "dokodemo-door",
                "settings": {
                    "address": endpoint.host(),
                    "port": endpoint.port(),
                    "network": "tcp,udp"
                }
            }
        ],
        "outbounds": [
            {
                "protocol": "freedom"
            }
        ]
    });

    serde_json::to_string_pretty(&descriptor).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Interface, Peer};
    use crate::keys::{KeyPair, PrivateKey};
    use serde_json::Value;

    fn scenario_config() -> Config {
        let mut interface = Interface::new(PrivateKey::generate());
        interface.listen_port = Some(51820);
        interface.addresses = vec!["10.0.0.2/32".parse().unwrap()];

        let mut peer = Peer::new(KeyPair::generate().public);
        peer.endpoint = Some("203.0.113.5:51820".parse().unwrap());

        Config::new(interface, vec![peer])
    }

    #[test]
    fn test_tcp_descriptor() {
        let text = generate(&scenario_config(), ProxyMode::Tcp);
        let value: Value = serde_json::from_str(&text).unwrap();

        let inbound = &value["inbounds"][0];
        assert_eq!(inbound["protocol"], "dokodemo-door");
        assert_eq!(inbound["listen"], "127.0.0.1");
        assert_eq!(inbound["port"], 27182);
        assert_eq!(inbound["settings"]["address"], "203.0.113.5");
        assert_eq!(inbound["settings"]["port"], 51820);

        assert_eq!(value["outbounds"][0]["protocol"], "freedom");
    }

    #[test]
    fn test_other_modes_are_empty() {
        let config = scenario_config();
        assert_eq!(generate(&config, ProxyMode::Udp), "");
        assert_eq!(generate(&config, ProxyMode::Auto), "");
    }

    #[test]
    fn test_no_endpoint_is_empty() {
        let mut config = scenario_config();
        config.peers[0].endpoint = None;
        assert_eq!(generate(&config, ProxyMode::Tcp), "");

        config.peers.clear();
        assert_eq!(generate(&config, ProxyMode::Tcp), "");
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(ProxyMode::parse("TCP"), ProxyMode::Tcp);
        assert_eq!(ProxyMode::parse("udp"), ProxyMode::Udp);
        assert_eq!(ProxyMode::parse("quic"), ProxyMode::Auto);
        assert_eq!("Tcp".parse::<ProxyMode>(), Ok(ProxyMode::Tcp));
        assert_eq!(ProxyMode::Tcp.to_string(), "tcp");
    }
}
