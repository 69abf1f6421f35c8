//! Tunnel Manager
//!
//! Owns the registry of tunnels and coordinates the backend and config
//! store. Each mutation
//!
//! 1. applies the change to the backend (when it affects a running tunnel),
//! 2. persists it, including the saved running set when that changes,
//! 3. updates the in-memory tunnel,
//! 4. publishes an event,
//!
//! and rolls back steps 1-2 when one of them fails, so the tunnel ends in
//! its previous state and the caller gets the error.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = TunnelManager::new(store, backend, ManagerSettings::default());
//! manager.restore_state(false).await?;
//!
//! let home = manager.create("home", config).await?;
//! home.set_state(TunnelState::Up).await?;
//! ```
//!
//! # Concurrency
//!
//! At most one mutation runs per tunnel; a second one arriving meanwhile
//! fails with [`TunnelError::Busy`]. Different tunnels proceed in parallel.
//! Locks are taken in the order membership, tunnel operation, registry,
//! tunnel data.

use crate::backend::{Backend, BackendError, Statistics};
use crate::config::{Config, ConfigError};
use crate::events::{EVENT_CAPACITY, TunnelEvent};
use crate::settings::{ManagerSettings, SortOrder};
use crate::store::{ConfigStore, SavedState, StateFile, StoreError};
use crate::tunnel::{Tunnel, TunnelSnapshot, TunnelState};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard, RwLock, broadcast};
use tracing::{debug, error, info, warn};

/// Longest accepted tunnel name
pub const MAX_NAME_LEN: usize = 15;

/// Check a tunnel name: 1 to 15 of `A-Z a-z 0-9 _ = + . -`
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'))
}

fn validate_name(name: &str) -> Result<(), TunnelError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(TunnelError::InvalidName(name.to_string()))
    }
}

/// Tunnel manager errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ConfigError),

    #[error("Invalid tunnel name {0:?}")]
    InvalidName(String),

    #[error("A tunnel named {0} already exists")]
    NameConflict(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Another operation on {0} is in progress")]
    Busy(String),

    #[error("No tunnel named {0}")]
    NotFound(String),

    #[error("Tunnel manager is gone")]
    Detached,
}

/// Failures collected by [`TunnelManager::save_state`]
#[derive(Debug, thiserror::Error)]
#[error("Failed to save {} item(s)", .failures.len())]
pub struct SaveStateError {
    /// What failed (tunnel name or state file) and why
    pub failures: Vec<(String, StoreError)>,
}

/// Tunnels in insertion order
#[derive(Default)]
struct Registry {
    entries: Vec<(String, Arc<Tunnel>)>,
}

impl Registry {
    fn get(&self, name: &str) -> Option<&Arc<Tunnel>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn insert(&mut self, name: &str, tunnel: Arc<Tunnel>) {
        self.entries.push((name.to_string(), tunnel));
    }

    fn remove(&mut self, name: &str) -> Option<Arc<Tunnel>> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    fn rename(&mut self, old: &str, new: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == old) {
            entry.0 = new.to_string();
        }
    }
}

pub(crate) struct Shared {
    store: Arc<dyn ConfigStore>,
    backend: Arc<dyn Backend>,
    settings: ManagerSettings,
    state_file: StateFile,
    /// Serializes create, delete, rename and restore
    membership: Mutex<()>,
    registry: RwLock<Registry>,
    last_used: RwLock<Option<String>>,
    restored: AtomicBool,
    events: broadcast::Sender<TunnelEvent>,
}

/// Registry of tunnels
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl TunnelManager {
    /// Create a manager with an empty registry
    ///
    /// Call [`TunnelManager::restore_state`] to adopt the tunnels already
    /// in the store.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        backend: Arc<dyn Backend>,
        settings: ManagerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state_file = StateFile::new(settings.state_file.clone());

        Self {
            shared: Arc::new(Shared {
                store,
                backend,
                settings,
                state_file,
                membership: Mutex::new(()),
                registry: RwLock::new(Registry::default()),
                last_used: RwLock::new(None),
                restored: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }

    /// Receive every change published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Look up a tunnel by name
    pub async fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.shared.registry.read().await.get(name).cloned()
    }

    /// All tunnels in the configured sort order
    pub async fn get_tunnels(&self) -> Vec<Arc<Tunnel>> {
        let mut entries = self.shared.registry.read().await.entries.clone();
        if self.shared.settings.sort_order == SortOrder::Alphabetical {
            entries.sort_by_cached_key(|(name, _)| (name.to_lowercase(), name.clone()));
        }
        entries.into_iter().map(|(_, tunnel)| tunnel).collect()
    }

    /// Plain values of all tunnels, in sort order
    pub async fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut snapshots = Vec::new();
        for tunnel in self.get_tunnels().await {
            snapshots.push(tunnel.snapshot().await);
        }
        snapshots
    }

    /// Tunnel most recently brought up, if it still exists
    pub async fn last_used_tunnel(&self) -> Option<Arc<Tunnel>> {
        let name = self.shared.last_used.read().await.clone()?;
        self.get(&name).await
    }

    /// Create and persist a new tunnel. It starts out down.
    pub async fn create(&self, name: &str, config: Config) -> Result<Arc<Tunnel>, TunnelError> {
        validate_name(name)?;
        config.validate()?;

        let _membership = self.shared.membership.lock().await;

        let registered = self.shared.registry.read().await.contains(name);
        if registered || self.store_call(self.shared.store.enumerate()).await?.contains(name) {
            return Err(TunnelError::NameConflict(name.to_string()));
        }

        self.store_call(self.shared.store.save(name, &config)).await?;

        let tunnel = Tunnel::new(
            name,
            TunnelState::Down,
            Some(config),
            Arc::downgrade(&self.shared),
        );
        self.shared.registry.write().await.insert(name, tunnel.clone());

        info!("Created tunnel {}", name);
        self.emit(TunnelEvent::Added {
            name: name.to_string(),
        });
        Ok(tunnel)
    }

    /// Stop (if up), purge from the store and remove from the registry
    pub async fn delete(&self, tunnel: &Tunnel) -> Result<(), TunnelError> {
        let _membership = self.shared.membership.lock().await;
        let _op = self.begin(tunnel).await?;
        let name = self.registered_name(tunnel).await?;

        let (state, config) = {
            let data = tunnel.data.read().await;
            (data.state, data.config.clone())
        };
        let was_up = state.is_up();

        if was_up {
            self.stop_backend(&name).await?;
            self.publish_state(tunnel, &name, TunnelState::Down).await;

            if let Err(e) = self.persist_saved_state().await {
                error!("Failed to save running tunnels: {}", e);
                self.restart_after_failure(tunnel, &name, config.as_ref()).await;
                return Err(e.into());
            }
        }

        match self.store_call(self.shared.store.delete(&name)).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                error!("Failed to delete stored config of {}: {}", name, e);
                if was_up {
                    self.restart_after_failure(tunnel, &name, config.as_ref()).await;
                    if let Err(e) = self.persist_saved_state().await {
                        error!("Failed to restore saved running tunnels: {}", e);
                    }
                }
                return Err(e.into());
            }
        }

        self.shared.registry.write().await.remove(&name);

        if self.shared.last_used.read().await.as_deref() == Some(name.as_str()) {
            self.set_last_used(None).await;
        }

        info!("Deleted tunnel {}", name);
        self.emit(TunnelEvent::Removed { name });
        Ok(())
    }

    /// Move a tunnel to `requested`, or flip it when `requested` is
    /// `Toggling`. Returns the state reached.
    pub async fn set_tunnel_state(
        &self,
        tunnel: &Tunnel,
        requested: TunnelState,
    ) -> Result<TunnelState, TunnelError> {
        let _op = self.begin(tunnel).await?;
        let name = self.registered_name(tunnel).await?;

        let current = tunnel.data.read().await.state;
        let target = match requested {
            TunnelState::Toggling if current.is_up() => TunnelState::Down,
            TunnelState::Toggling => TunnelState::Up,
            state => state,
        };

        if target == current {
            debug!("Tunnel {} already {}", name, current);
            return Ok(current);
        }

        let config = match target {
            TunnelState::Up => Some(self.tunnel_config(tunnel).await?),
            _ => tunnel.data.read().await.config.clone(),
        };

        info!("Bringing tunnel {} {}", name, target);
        self.publish_state(tunnel, &name, TunnelState::Toggling).await;

        let result = match (target, &config) {
            (TunnelState::Up, Some(config)) => {
                self.backend_call(self.shared.backend.start(&name, config))
                    .await
            }
            _ => self.stop_backend(&name).await,
        };

        if let Err(e) = result {
            error!("Failed to bring tunnel {} {}: {}", name, target, e);
            self.publish_state(tunnel, &name, current).await;
            return Err(e.into());
        }

        let mut saved = self.saved_state().await;
        if target.is_up() {
            saved.running.insert(name.clone());
            saved.last_used = Some(name.clone());
        } else {
            saved.running.remove(&name);
        }

        if let Err(e) = self.store_call(self.shared.state_file.save(&saved)).await {
            error!("Failed to save running tunnels after bringing {} {}: {}", name, target, e);
            self.revert_transition(tunnel, &name, target, config.as_ref()).await;
            return Err(e.into());
        }

        self.publish_state(tunnel, &name, target).await;

        if target.is_up() {
            if let Err(e) = self.fetch_statistics(tunnel, &name).await {
                warn!("No statistics for {} after start: {}", name, e);
            }
            self.set_last_used(Some(name.clone())).await;
        }

        Ok(target)
    }

    /// Replace a tunnel's config, applying it to the backend when running
    pub async fn set_tunnel_config(
        &self,
        tunnel: &Tunnel,
        config: Config,
    ) -> Result<Config, TunnelError> {
        config.validate()?;

        let _op = self.begin(tunnel).await?;
        let name = self.registered_name(tunnel).await?;

        let (state, old) = {
            let data = tunnel.data.read().await;
            (data.state, data.config.clone())
        };

        if state.is_up() {
            self.backend_call(self.shared.backend.start(&name, &config))
                .await?;
        }

        if let Err(e) = self.store_call(self.shared.store.save(&name, &config)).await {
            error!("Failed to save config of {}: {}", name, e);
            if let (true, Some(old)) = (state.is_up(), old.as_ref()) {
                warn!("Restoring previous config of {} in backend", name);
                if let Err(e) = self.backend_call(self.shared.backend.start(&name, old)).await {
                    error!("Failed to restore previous config of {}: {}", name, e);
                }
            }
            return Err(e.into());
        }

        tunnel.data.write().await.config = Some(config.clone());

        info!("Updated config of {}", name);
        self.emit(TunnelEvent::ConfigChanged { name });
        Ok(config)
    }

    /// Rename a tunnel. A running tunnel is stopped and restarted under the
    /// new name.
    pub async fn set_tunnel_name(&self, tunnel: &Tunnel, new: &str) -> Result<String, TunnelError> {
        validate_name(new)?;

        let _membership = self.shared.membership.lock().await;
        let _op = self.begin(tunnel).await?;
        let old = self.registered_name(tunnel).await?;

        if old == new {
            return Ok(old);
        }
        if self.shared.registry.read().await.contains(new) {
            return Err(TunnelError::NameConflict(new.to_string()));
        }

        let was_up = tunnel.data.read().await.state.is_up();
        let config = if was_up {
            Some(self.tunnel_config(tunnel).await?)
        } else {
            None
        };

        if was_up {
            self.stop_backend(&old).await?;
            self.publish_state(tunnel, &old, TunnelState::Down).await;
        }

        if let Err(e) = self.store_call(self.shared.store.rename(&old, new)).await {
            error!("Failed to rename stored config {} to {}: {}", old, new, e);
            if was_up {
                self.restart_after_failure(tunnel, &old, config.as_ref()).await;
            }
            return Err(match e {
                StoreError::AlreadyExists(name) => TunnelError::NameConflict(name),
                e => e.into(),
            });
        }

        self.apply_rename(tunnel, &old, new).await;

        if let Some(config) = &config {
            let started = self
                .backend_call(self.shared.backend.start(new, config))
                .await;

            if let Err(e) = started {
                error!("Failed to restart {} as {}: {}", old, new, e);
                self.revert_rename(tunnel, &old, new, Some(config)).await;
                return Err(e.into());
            }

            self.publish_state(tunnel, new, TunnelState::Up).await;
        }

        if let Err(e) = self.persist_saved_state().await {
            error!("Failed to save running tunnels after renaming {}: {}", old, e);
            if config.is_some() {
                if let Err(e) = self.stop_backend(new).await {
                    error!("Failed to stop {}: {}", new, e);
                }
                self.publish_state(tunnel, new, TunnelState::Down).await;
            }
            self.revert_rename(tunnel, &old, new, config.as_ref()).await;
            return Err(e.into());
        }

        if config.is_some() {
            if let Err(e) = self.fetch_statistics(tunnel, new).await {
                warn!("No statistics for {} after restart: {}", new, e);
            }
        }

        info!("Renamed tunnel {} to {}", old, new);
        Ok(new.to_string())
    }

    /// A tunnel's config, loading it from the store on first use
    pub async fn tunnel_config(&self, tunnel: &Tunnel) -> Result<Config, TunnelError> {
        if let Some(config) = tunnel.data.read().await.config.clone() {
            return Ok(config);
        }

        let name = self.registered_name(tunnel).await?;
        debug!("Loading config of {}", name);
        let config = self.store_call(self.shared.store.load(&name)).await?;

        let mut data = tunnel.data.write().await;
        Ok(data.config.get_or_insert(config).clone())
    }

    /// Re-read a tunnel's run state from the backend
    pub async fn tunnel_state(&self, tunnel: &Tunnel) -> Result<TunnelState, TunnelError> {
        let _op = tunnel.ops.lock().await;
        let name = self.registered_name(tunnel).await?;

        let running = self
            .backend_call(self.shared.backend.running_names())
            .await?;
        let state = TunnelState::from_running(running.contains(&name));
        self.publish_state(tunnel, &name, state).await;
        Ok(state)
    }

    /// Fetch fresh counters for a running tunnel; `None` otherwise
    pub async fn tunnel_statistics(
        &self,
        tunnel: &Tunnel,
    ) -> Result<Option<Statistics>, TunnelError> {
        let name = self.registered_name(tunnel).await?;
        if !tunnel.data.read().await.state.is_up() {
            return Ok(None);
        }
        Ok(self.fetch_statistics(tunnel, &name).await?)
    }

    /// Align the registry with the store and backend
    ///
    /// The first call (or any call with `force`) adopts every stored
    /// tunnel, sets states from the backend's running set and, when `force`
    /// or `restore_on_boot` is set, brings back up the tunnels that were
    /// running when state was last saved. Later unforced calls do nothing.
    pub async fn restore_state(&self, force: bool) -> Result<(), TunnelError> {
        let _membership = self.shared.membership.lock().await;

        if !force && self.shared.restored.load(Ordering::Acquire) {
            debug!("State already restored");
            return Ok(());
        }

        let running = self
            .backend_call(self.shared.backend.running_names())
            .await?;
        let stored = self.store_call(self.shared.store.enumerate()).await?;
        let saved = match self.store_call(self.shared.state_file.load()).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Ignoring unreadable saved state: {}", e);
                SavedState::default()
            }
        };

        for name in running.difference(&stored) {
            warn!("Ignoring running tunnel {} with no stored config", name);
        }

        for name in &stored {
            if self.shared.registry.read().await.contains(name) {
                continue;
            }
            if !is_valid_name(name) {
                warn!("Skipping stored config with invalid name {:?}", name);
                continue;
            }

            let state = TunnelState::from_running(running.contains(name));
            let config = if state.is_up() {
                match self.store_call(self.shared.store.load(name)).await {
                    Ok(config) => Some(config),
                    Err(e) => {
                        warn!("Failed to load config of running tunnel {}: {}", name, e);
                        None
                    }
                }
            } else {
                None
            };

            let tunnel = Tunnel::new(name, state, config, Arc::downgrade(&self.shared));
            self.shared.registry.write().await.insert(name, tunnel);
            debug!("Adopted tunnel {} ({})", name, state);
            self.emit(TunnelEvent::Added { name: name.clone() });
        }

        self.align_states(&running).await;

        if self.shared.last_used.read().await.is_none() {
            if let Some(name) = saved.last_used.filter(|n| stored.contains(n)) {
                self.set_last_used(Some(name)).await;
            }
        }

        if force || self.shared.settings.restore_on_boot {
            for name in &saved.running {
                let Some(tunnel) = self.get(name).await else {
                    continue;
                };
                if tunnel.state().await.is_up() {
                    continue;
                }
                info!("Restoring tunnel {}", name);
                if let Err(e) = self.set_tunnel_state(&tunnel, TunnelState::Up).await {
                    error!("Failed to restore tunnel {}: {}", name, e);
                }
            }
        }

        self.shared.restored.store(true, Ordering::Release);
        info!(
            "Restored state: {} tunnel(s), {} running",
            self.shared.registry.read().await.entries.len(),
            running.intersection(&stored).count()
        );
        Ok(())
    }

    /// Re-read the backend's running set and align every tunnel's state
    pub async fn refresh_tunnel_states(&self) -> Result<(), TunnelError> {
        let running = self
            .backend_call(self.shared.backend.running_names())
            .await?;
        self.align_states(&running).await;
        Ok(())
    }

    /// Persist the saved state and every loaded config that differs from
    /// its stored copy, best effort
    ///
    /// Unchanged configs are left alone, so hand-written files keep their
    /// comments and layout.
    pub async fn save_state(&self) -> Result<(), SaveStateError> {
        let mut failures = Vec::new();

        let entries = self.shared.registry.read().await.entries.clone();
        for (name, tunnel) in entries {
            let Some(config) = tunnel.config().await else {
                continue;
            };
            match self.store_call(self.shared.store.load(&name)).await {
                Ok(stored) if stored == config => continue,
                Ok(_) => debug!("Stored config of {} is out of date", name),
                Err(e) => debug!("Rewriting config of {}: {}", name, e),
            }
            if let Err(e) = self.store_call(self.shared.store.save(&name, &config)).await {
                error!("Failed to save config of {}: {}", name, e);
                failures.push((name, e));
            }
        }

        if let Err(e) = self.persist_saved_state().await {
            error!("Failed to save state file: {}", e);
            failures.push(("state file".to_string(), e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SaveStateError { failures })
        }
    }

    async fn align_states(&self, running: &BTreeSet<String>) {
        for tunnel in self.get_tunnels().await {
            let _op = tunnel.ops.lock().await;
            let Ok(name) = self.registered_name(&tunnel).await else {
                continue;
            };
            let state = TunnelState::from_running(running.contains(&name));
            if tunnel.data.read().await.state != state {
                info!("Tunnel {} is {} in the backend", name, state);
            }
            self.publish_state(&tunnel, &name, state).await;
        }
    }

    /// Claim the tunnel's operation lock, or fail if a mutation is running
    async fn begin<'a>(&self, tunnel: &'a Tunnel) -> Result<MutexGuard<'a, ()>, TunnelError> {
        match tunnel.ops.try_lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(TunnelError::Busy(tunnel.name().await)),
        }
    }

    /// Name of `tunnel`, provided it is still in this registry
    async fn registered_name(&self, tunnel: &Tunnel) -> Result<String, TunnelError> {
        let name = tunnel.name().await;
        let registry = self.shared.registry.read().await;
        match registry.get(&name) {
            Some(entry) if std::ptr::eq(Arc::as_ptr(entry), tunnel) => Ok(name),
            _ => Err(TunnelError::NotFound(name)),
        }
    }

    async fn apply_rename(&self, tunnel: &Tunnel, old: &str, new: &str) {
        self.shared.registry.write().await.rename(old, new);
        tunnel.data.write().await.name = new.to_string();

        self.emit(TunnelEvent::Renamed {
            old: old.to_string(),
            new: new.to_string(),
        });

        if self.shared.last_used.read().await.as_deref() == Some(old) {
            self.set_last_used(Some(new.to_string())).await;
        }
    }

    /// Stop in the backend; a tunnel that is not running counts as stopped
    async fn stop_backend(&self, name: &str) -> Result<(), BackendError> {
        match self.backend_call(self.shared.backend.stop(name)).await {
            Err(BackendError::NotRunning(_)) => {
                warn!("Tunnel {} was not running in the backend", name);
                Ok(())
            }
            other => other,
        }
    }

    /// Bring a tunnel back up after a failed operation stopped it
    async fn restart_after_failure(&self, tunnel: &Tunnel, name: &str, config: Option<&Config>) {
        let Some(config) = config else {
            warn!("Cannot restart {}: config not loaded", name);
            return;
        };

        warn!("Restarting tunnel {}", name);
        match self.backend_call(self.shared.backend.start(name, config)).await {
            Ok(()) => self.publish_state(tunnel, name, TunnelState::Up).await,
            Err(e) => error!("Failed to restart tunnel {}: {}", name, e),
        }
    }

    async fn fetch_statistics(
        &self,
        tunnel: &Tunnel,
        name: &str,
    ) -> Result<Option<Statistics>, BackendError> {
        let statistics = self
            .backend_call(self.shared.backend.statistics(name))
            .await?;

        {
            let mut data = tunnel.data.write().await;
            if !data.state.is_up() {
                return Ok(None);
            }
            data.statistics = Some(statistics.clone());
        }

        self.emit(TunnelEvent::StatisticsChanged {
            name: name.to_string(),
            statistics: Some(statistics.clone()),
        });
        Ok(Some(statistics))
    }

    /// Record a state and notify; leaving `Up` drops the statistics
    async fn publish_state(&self, tunnel: &Tunnel, name: &str, state: TunnelState) {
        let cleared = {
            let mut data = tunnel.data.write().await;
            if data.state == state {
                return;
            }
            data.state = state;
            !state.is_up() && data.statistics.take().is_some()
        };

        self.emit(TunnelEvent::StateChanged {
            name: name.to_string(),
            state,
        });
        if cleared {
            self.emit(TunnelEvent::StatisticsChanged {
                name: name.to_string(),
                statistics: None,
            });
        }
    }

    async fn set_last_used(&self, name: Option<String>) {
        {
            let mut last_used = self.shared.last_used.write().await;
            if *last_used == name {
                return;
            }
            *last_used = name.clone();
        }
        self.emit(TunnelEvent::LastUsedChanged { name });
    }

    async fn saved_state(&self) -> SavedState {
        let entries = self.shared.registry.read().await.entries.clone();
        let mut running = BTreeSet::new();
        for (name, tunnel) in entries {
            if tunnel.state().await.is_up() {
                running.insert(name);
            }
        }

        SavedState {
            running,
            last_used: self.shared.last_used.read().await.clone(),
        }
    }

    async fn persist_saved_state(&self) -> Result<(), StoreError> {
        let state = self.saved_state().await;
        self.store_call(self.shared.state_file.save(&state)).await
    }

    /// Undo a backend transition to `reached` whose saved state could not
    /// be written
    async fn revert_transition(
        &self,
        tunnel: &Tunnel,
        name: &str,
        reached: TunnelState,
        config: Option<&Config>,
    ) {
        warn!("Reverting tunnel {} from {}", name, reached);
        if reached.is_up() {
            match self.stop_backend(name).await {
                Ok(()) => self.publish_state(tunnel, name, TunnelState::Down).await,
                Err(e) => {
                    error!("Failed to stop tunnel {}: {}", name, e);
                    self.publish_state(tunnel, name, TunnelState::Up).await;
                }
            }
        } else {
            self.publish_state(tunnel, name, TunnelState::Down).await;
            self.restart_after_failure(tunnel, name, config).await;
        }
    }

    /// Move a renamed tunnel back to `old` in the store and registry, and
    /// restart it there when `config` is given
    async fn revert_rename(&self, tunnel: &Tunnel, old: &str, new: &str, config: Option<&Config>) {
        warn!("Reverting rename of {}", old);
        if let Err(e) = self.store_call(self.shared.store.rename(new, old)).await {
            error!("Failed to restore stored config name {}: {}", old, e);
        }
        self.apply_rename(tunnel, new, old).await;
        if config.is_some() {
            self.restart_after_failure(tunnel, old, config).await;
        }
    }

    fn emit(&self, event: TunnelEvent) {
        // No subscribers is not an error
        let _ = self.shared.events.send(event);
    }

    async fn backend_call<T>(
        &self,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        let limit = self.shared.settings.operation_timeout();
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(BackendError::Timeout(limit)))
    }

    async fn store_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.shared.settings.operation_timeout();
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(limit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{Interface, Peer};
    use crate::keys::{KeyPair, PrivateKey};
    use crate::store::MemoryConfigStore;

    fn config() -> Config {
        let mut peer = Peer::new(KeyPair::generate().public);
        peer.endpoint = Some("203.0.113.5:51820".parse().unwrap());
        peer.allowed_ips = vec!["0.0.0.0/0".parse().unwrap()];
        Config::new(Interface::new(PrivateKey::generate()), vec![peer])
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            state_file: None,
            ..Default::default()
        }
    }

    fn setup() -> (TunnelManager, Arc<MemoryConfigStore>, Arc<MemoryBackend>) {
        let store = Arc::new(MemoryConfigStore::new());
        let backend = Arc::new(MemoryBackend::new());
        let manager = TunnelManager::new(store.clone(), backend.clone(), settings());
        (manager, store, backend)
    }

    #[test]
    fn test_name_validation() {
        for good in ["home", "wg0", "a", "my_vpn-1.2+=", "fifteen_chars_x"] {
            assert!(is_valid_name(good), "rejected {:?}", good);
        }
        for bad in ["", "sixteen_chars_xx", "with space", "slash/name", "ümlaut"] {
            assert!(!is_valid_name(bad), "accepted {:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_create() {
        let (manager, store, _) = setup();
        let tunnel = manager.create("home", config()).await.unwrap();

        assert_eq!(tunnel.state().await, TunnelState::Down);
        assert!(store.get("home").await.is_some());
        assert_eq!(manager.get_tunnels().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_invalid_name() {
        let (manager, store, _) = setup();
        let result = manager.create("bad name", config()).await;

        assert!(matches!(result, Err(TunnelError::InvalidName(_))));
        assert!(store.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let (manager, _, _) = setup();
        manager.create("home", config()).await.unwrap();

        assert!(matches!(
            manager.create("home", config()).await,
            Err(TunnelError::NameConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let (manager, _, _) = setup();
        let mut config = config();
        config.interface.obfuscation.s2 = Some(56);

        assert!(matches!(
            manager.create("home", config).await,
            Err(TunnelError::Validation(ConfigError::SameMessageSizes(148)))
        ));
        assert!(manager.get("home").await.is_none());
    }

    #[tokio::test]
    async fn test_create_store_failure() {
        let (manager, store, _) = setup();
        store.fail_next_save().await;

        assert!(matches!(
            manager.create("home", config()).await,
            Err(TunnelError::Storage(_))
        ));
        assert!(manager.get("home").await.is_none());
    }

    #[tokio::test]
    async fn test_toggle() {
        let (manager, _, backend) = setup();
        let tunnel = manager.create("home", config()).await.unwrap();

        assert_eq!(tunnel.set_state(TunnelState::Toggling).await.unwrap(), TunnelState::Up);
        assert!(backend.is_running("home").await);

        assert_eq!(tunnel.set_state(TunnelState::Toggling).await.unwrap(), TunnelState::Down);
        assert!(!backend.is_running("home").await);
    }

    #[tokio::test]
    async fn test_statistics_only_while_up() {
        let (manager, _, _) = setup();
        let tunnel = manager.create("home", config()).await.unwrap();
        assert_eq!(tunnel.refresh_statistics().await.unwrap(), None);

        tunnel.set_state(TunnelState::Up).await.unwrap();
        assert!(tunnel.statistics().await.is_some());

        tunnel.set_state(TunnelState::Down).await.unwrap();
        assert!(tunnel.statistics().await.is_none());
    }

    #[tokio::test]
    async fn test_statistics_failure_does_not_fail_start() {
        let (manager, _, backend) = setup();
        let tunnel = manager.create("home", config()).await.unwrap();
        backend.fail_next_statistics().await;

        assert_eq!(tunnel.set_state(TunnelState::Up).await.unwrap(), TunnelState::Up);
        assert!(tunnel.statistics().await.is_none());
    }

    #[tokio::test]
    async fn test_last_used() {
        let (manager, _, _) = setup();
        let home = manager.create("home", config()).await.unwrap();
        manager.create("work", config()).await.unwrap();
        assert!(manager.last_used_tunnel().await.is_none());

        home.set_state(TunnelState::Up).await.unwrap();
        let last = manager.last_used_tunnel().await.unwrap();
        assert_eq!(last.name().await, "home");

        home.set_state(TunnelState::Down).await.unwrap();
        home.delete().await.unwrap();
        assert!(manager.last_used_tunnel().await.is_none());
    }

    #[tokio::test]
    async fn test_sort_order() {
        let store = Arc::new(MemoryConfigStore::new());
        let backend = Arc::new(MemoryBackend::new());

        let alpha = TunnelManager::new(
            store.clone(),
            backend.clone(),
            ManagerSettings {
                sort_order: SortOrder::Alphabetical,
                ..settings()
            },
        );
        for name in ["work", "Home", "cabin"] {
            alpha.create(name, config()).await.unwrap();
        }
        let names: Vec<_> = alpha.snapshot().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["cabin", "Home", "work"]);

        let insertion = TunnelManager::new(Arc::new(MemoryConfigStore::new()), backend, settings());
        for name in ["work", "Home", "cabin"] {
            insertion.create(name, config()).await.unwrap();
        }
        let names: Vec<_> = insertion.snapshot().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["work", "Home", "cabin"]);
    }

    #[tokio::test]
    async fn test_events() {
        let (manager, _, _) = setup();
        let mut events = manager.subscribe();

        let tunnel = manager.create("home", config()).await.unwrap();
        tunnel.set_state(TunnelState::Up).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), TunnelEvent::Added { name: "home".into() });
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::StateChanged {
                name: "home".into(),
                state: TunnelState::Toggling,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::StateChanged {
                name: "home".into(),
                state: TunnelState::Up,
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            TunnelEvent::StatisticsChanged { statistics: Some(_), .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::LastUsedChanged { name: Some("home".into()) }
        );
    }

    #[tokio::test]
    async fn test_deleted_tunnel_handle() {
        let (manager, _, _) = setup();
        let tunnel = manager.create("home", config()).await.unwrap();
        tunnel.delete().await.unwrap();

        assert!(matches!(
            tunnel.set_state(TunnelState::Up).await,
            Err(TunnelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_detached_after_manager_dropped() {
        let (manager, _, _) = setup();
        let tunnel = manager.create("home", config()).await.unwrap();
        drop(manager);

        assert!(matches!(tunnel.load_config().await, Err(TunnelError::Detached)));
    }
}
