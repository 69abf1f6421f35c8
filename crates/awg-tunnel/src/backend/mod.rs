//! Tunnel Backends
//!
//! A backend is what actually brings a tunnel interface up or down. The
//! manager only talks to the [`Backend`] trait; [`QuickBackend`] drives the
//! `awg-quick`/`awg` tools and [`MemoryBackend`] keeps everything in
//! process for tests and dry runs.

mod memory;
mod quick;

pub use memory::MemoryBackend;
pub use quick::{QuickBackend, parse_dump};

use crate::config::Config;
use crate::keys::PublicKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Native tunnel backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Bring a tunnel up. Starting a name that is already running replaces
    /// its configuration.
    async fn start(&self, name: &str, config: &Config) -> Result<(), BackendError>;

    /// Bring a tunnel down
    async fn stop(&self, name: &str) -> Result<(), BackendError>;

    /// Names of every tunnel the backend currently runs
    async fn running_names(&self) -> Result<BTreeSet<String>, BackendError>;

    /// Transfer counters for a running tunnel
    async fn statistics(&self, name: &str) -> Result<Statistics, BackendError>;
}

/// Per-peer transfer counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub public_key: PublicKey,
    /// Bytes received from this peer
    pub rx_bytes: u64,
    /// Bytes sent to this peer
    pub tx_bytes: u64,
    /// Unix time of the last completed handshake
    pub latest_handshake: Option<u64>,
}

/// Tunnel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub peers: Vec<PeerStats>,
}

impl Statistics {
    /// Zeroed counters for every peer of a config
    pub fn empty_for(config: &Config) -> Self {
        Self {
            peers: config
                .peers
                .iter()
                .map(|p| PeerStats {
                    public_key: p.public_key.clone(),
                    rx_bytes: 0,
                    tx_bytes: 0,
                    latest_handshake: None,
                })
                .collect(),
        }
    }

    pub fn peer(&self, key: &PublicKey) -> Option<&PeerStats> {
        self.peers.iter().find(|p| &p.public_key == key)
    }

    pub fn total_rx(&self) -> u64 {
        self.peers.iter().map(|p| p.rx_bytes).sum()
    }

    pub fn total_tx(&self) -> u64 {
        self.peers.iter().map(|p| p.tx_bytes).sum()
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB, RX: {:.2}MB, peers: {}",
            self.total_tx() as f64 / (1024.0 * 1024.0),
            self.total_rx() as f64 / (1024.0 * 1024.0),
            self.peers.len()
        )
    }
}

/// Backend errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Tunnel {0} is already up")]
    AlreadyUp(String),

    #[error("Tunnel {0} is not running")]
    NotRunning(String),

    #[error("{command} failed with {status}: {output}")]
    Command {
        command: String,
        status: String,
        output: String,
    },

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected backend output: {0}")]
    InvalidOutput(String),
}

impl BackendError {
    /// Whether the error only says the tunnel is already in the requested state
    pub fn is_already_in_state(&self) -> bool {
        matches!(self, BackendError::AlreadyUp(_) | BackendError::NotRunning(_))
    }
}
