//! Tunnel
//!
//! A named configuration plus its run state. Tunnels are owned by a
//! [`TunnelManager`]; every mutation goes through it so that backend,
//! store and memory stay in step. Getters read a consistent snapshot of
//! the tunnel's data and never block on an operation in flight.

use crate::backend::Statistics;
use crate::config::Config;
use crate::manager::{Shared, TunnelError, TunnelManager};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};

/// Tunnel run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Tunnel is not running
    Down,
    /// A transition is in flight. Passed to `set_state`, asks for a toggle.
    Toggling,
    /// Tunnel is running
    Up,
}

impl TunnelState {
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelState::Up)
    }

    /// Stable state matching a backend's running flag
    pub fn from_running(running: bool) -> Self {
        if running {
            TunnelState::Up
        } else {
            TunnelState::Down
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Down => "down",
            TunnelState::Toggling => "toggling",
            TunnelState::Up => "up",
        };
        write!(f, "{}", name)
    }
}

/// Plain value of a tunnel at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    pub name: String,
    pub state: TunnelState,
    /// `None` until the config has been loaded from the store
    pub config: Option<Config>,
    /// Only present while the tunnel is up
    pub statistics: Option<Statistics>,
}

pub(crate) struct TunnelData {
    pub(crate) name: String,
    pub(crate) state: TunnelState,
    pub(crate) config: Option<Config>,
    pub(crate) statistics: Option<Statistics>,
}

/// A managed tunnel
pub struct Tunnel {
    pub(crate) data: RwLock<TunnelData>,
    /// Held for the whole of a mutation
    pub(crate) ops: Mutex<()>,
    manager: Weak<Shared>,
}

impl Tunnel {
    pub(crate) fn new(
        name: &str,
        state: TunnelState,
        config: Option<Config>,
        manager: Weak<Shared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(TunnelData {
                name: name.to_string(),
                state,
                config,
                statistics: None,
            }),
            ops: Mutex::new(()),
            manager,
        })
    }

    fn manager(&self) -> Result<TunnelManager, TunnelError> {
        self.manager
            .upgrade()
            .map(TunnelManager::from_shared)
            .ok_or(TunnelError::Detached)
    }

    pub async fn name(&self) -> String {
        self.data.read().await.name.clone()
    }

    pub async fn state(&self) -> TunnelState {
        self.data.read().await.state
    }

    /// Cached config; see [`Tunnel::load_config`] to fetch it from the store
    pub async fn config(&self) -> Option<Config> {
        self.data.read().await.config.clone()
    }

    pub async fn statistics(&self) -> Option<Statistics> {
        self.data.read().await.statistics.clone()
    }

    pub async fn snapshot(&self) -> TunnelSnapshot {
        let data = self.data.read().await;
        TunnelSnapshot {
            name: data.name.clone(),
            state: data.state,
            config: data.config.clone(),
            statistics: data.statistics.clone(),
        }
    }

    /// Request a state; `Toggling` flips between up and down.
    /// Returns the state reached.
    pub async fn set_state(&self, state: TunnelState) -> Result<TunnelState, TunnelError> {
        self.manager()?.set_tunnel_state(self, state).await
    }

    pub async fn set_config(&self, config: Config) -> Result<Config, TunnelError> {
        self.manager()?.set_tunnel_config(self, config).await
    }

    pub async fn set_name(&self, name: &str) -> Result<String, TunnelError> {
        self.manager()?.set_tunnel_name(self, name).await
    }

    /// Config from the cache, loading it from the store on first use
    pub async fn load_config(&self) -> Result<Config, TunnelError> {
        self.manager()?.tunnel_config(self).await
    }

    /// Re-read the run state from the backend
    pub async fn refresh_state(&self) -> Result<TunnelState, TunnelError> {
        self.manager()?.tunnel_state(self).await
    }

    /// Fetch fresh counters; `None` while the tunnel is not up
    pub async fn refresh_statistics(&self) -> Result<Option<Statistics>, TunnelError> {
        self.manager()?.tunnel_statistics(self).await
    }

    pub async fn delete(&self) -> Result<(), TunnelError> {
        self.manager()?.delete(self).await
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data.try_read() {
            Ok(data) => f
                .debug_struct("Tunnel")
                .field("name", &data.name)
                .field("state", &data.state)
                .finish(),
            Err(_) => f.debug_struct("Tunnel").finish_non_exhaustive(),
        }
    }
}
