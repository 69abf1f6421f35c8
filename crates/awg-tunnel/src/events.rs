//! Change notifications
//!
//! The manager publishes one event per observable change on a broadcast
//! channel. Events for a tunnel are sent while its operation lock is held,
//! so subscribers see them in mutation order.

use crate::backend::Statistics;
use crate::tunnel::TunnelState;
use serde::Serialize;

/// Capacity of the broadcast channel; slow subscribers lag past this
pub const EVENT_CAPACITY: usize = 256;

/// Observable change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TunnelEvent {
    Added { name: String },
    Removed { name: String },
    Renamed { old: String, new: String },
    StateChanged { name: String, state: TunnelState },
    ConfigChanged { name: String },
    StatisticsChanged { name: String, statistics: Option<Statistics> },
    LastUsedChanged { name: Option<String> },
}

impl TunnelEvent {
    /// Tunnel the event concerns, by its name after the change
    pub fn tunnel_name(&self) -> Option<&str> {
        match self {
            TunnelEvent::Added { name }
            | TunnelEvent::Removed { name }
            | TunnelEvent::StateChanged { name, .. }
            | TunnelEvent::ConfigChanged { name }
            | TunnelEvent::StatisticsChanged { name, .. } => Some(name),
            TunnelEvent::Renamed { new, .. } => Some(new),
            TunnelEvent::LastUsedChanged { name } => name.as_deref(),
        }
    }
}
