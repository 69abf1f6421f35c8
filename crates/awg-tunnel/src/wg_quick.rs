//! wg-quick configuration text
//!
//! The INI dialect read by `awg-quick`. Parsing fills a [`ConfigDraft`]
//! and resolving it yields a [`Config`], so files and interactive edits go
//! through the same validation.

use crate::config::{Config, ConfigError};
use crate::draft::{ConfigDraft, InterfaceDraft, PeerDraft};
use std::fmt::Write as _;

#[derive(Clone, Copy)]
enum Section {
    None,
    Interface,
    Peer,
}

impl ConfigDraft {
    /// Parse wg-quick text into a draft without resolving it
    pub fn parse_wg_quick(text: &str) -> Result<Self, ConfigError> {
        let mut draft = ConfigDraft::new();
        let mut section = Section::None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                section = match line.to_ascii_lowercase().as_str() {
                    "[interface]" => Section::Interface,
                    "[peer]" => {
                        draft.add_peer();
                        Section::Peer
                    }
                    _ => {
                        return Err(ConfigError::Syntax {
                            line: line_no,
                            message: format!("unknown section {}", line),
                        });
                    }
                };
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Syntax {
                line: line_no,
                message: "expected `Key = Value`".to_string(),
            })?;
            let key = key.trim();
            let value = value.trim();

            match section {
                Section::None => {
                    return Err(ConfigError::Syntax {
                        line: line_no,
                        message: format!("{} appears before any section", key),
                    });
                }
                Section::Interface => set_interface_field(&mut draft.interface, key, value)?,
                Section::Peer => {
                    if let Some(peer) = draft.peers.last_mut() {
                        set_peer_field(peer, key, value)?;
                    }
                }
            }
        }

        Ok(draft)
    }
}

impl Config {
    /// Parse and validate wg-quick text
    pub fn parse_wg_quick(text: &str) -> Result<Self, ConfigError> {
        ConfigDraft::parse_wg_quick(text)?.resolve()
    }

    /// Render as wg-quick text
    pub fn to_wg_quick(&self) -> String {
        let draft = ConfigDraft::from(self);
        let mut out = String::new();

        out.push_str("[Interface]\n");
        let i = &draft.interface;
        for (key, value) in [
            ("PrivateKey", &i.private_key),
            ("Address", &i.addresses),
            ("DNS", &i.dns),
            ("ListenPort", &i.listen_port),
            ("MTU", &i.mtu),
            ("Jc", &i.jc),
            ("Jmin", &i.jmin),
            ("Jmax", &i.jmax),
            ("S1", &i.s1),
            ("S2", &i.s2),
            ("S3", &i.s3),
            ("S4", &i.s4),
            ("H1", &i.h1),
            ("H2", &i.h2),
            ("H3", &i.h3),
            ("H4", &i.h4),
            ("I1", &i.i1),
            ("I2", &i.i2),
            ("I3", &i.i3),
            ("I4", &i.i4),
            ("I5", &i.i5),
        ] {
            write_line(&mut out, key, value);
        }

        for peer in &draft.peers {
            out.push_str("\n[Peer]\n");
            for (key, value) in [
                ("PublicKey", &peer.public_key),
                ("PresharedKey", &peer.preshared_key),
                ("AllowedIPs", &peer.allowed_ips),
                ("Endpoint", &peer.endpoint),
                ("PersistentKeepalive", &peer.persistent_keepalive),
            ] {
                write_line(&mut out, key, value);
            }
        }

        out
    }
}

fn write_line(out: &mut String, key: &str, value: &str) {
    if !value.is_empty() {
        let _ = writeln!(out, "{} = {}", key, value);
    }
}

/// List keys may repeat; later lines extend earlier ones.
fn append(field: &mut String, value: &str) {
    if field.is_empty() {
        field.push_str(value);
    } else if !value.is_empty() {
        field.push_str(", ");
        field.push_str(value);
    }
}

fn set_interface_field(draft: &mut InterfaceDraft, key: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.to_string();
    match key.to_ascii_lowercase().as_str() {
        "privatekey" => draft.private_key = value,
        "address" => append(&mut draft.addresses, &value),
        "dns" => append(&mut draft.dns, &value),
        "listenport" => draft.listen_port = value,
        "mtu" => draft.mtu = value,
        "jc" => draft.jc = value,
        "jmin" => draft.jmin = value,
        "jmax" => draft.jmax = value,
        "s1" => draft.s1 = value,
        "s2" => draft.s2 = value,
        "s3" => draft.s3 = value,
        "s4" => draft.s4 = value,
        "h1" => draft.h1 = value,
        "h2" => draft.h2 = value,
        "h3" => draft.h3 = value,
        "h4" => draft.h4 = value,
        "i1" => draft.i1 = value,
        "i2" => draft.i2 = value,
        "i3" => draft.i3 = value,
        "i4" => draft.i4 = value,
        "i5" => draft.i5 = value,
        _ => {
            return Err(ConfigError::UnknownKey {
                section: "Interface",
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

fn set_peer_field(draft: &mut PeerDraft, key: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.to_string();
    match key.to_ascii_lowercase().as_str() {
        "publickey" => draft.public_key = value,
        "presharedkey" => draft.preshared_key = value,
        "endpoint" => draft.endpoint = value,
        "allowedips" => append(&mut draft.allowed_ips, &value),
        "persistentkeepalive" => draft.persistent_keepalive = value,
        _ => {
            return Err(ConfigError::UnknownKey {
                section: "Peer",
                key: key.to_string(),
            });
        }
    }
    Ok(())
}
