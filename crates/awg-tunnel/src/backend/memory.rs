//! In-process backend
//!
//! Keeps the running set in memory. Failures can be injected per call and
//! starts can be held at a gate, which is how the manager's rollback and
//! busy paths are exercised without touching the host.

use super::{Backend, BackendError, Statistics};
use crate::config::Config;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Default)]
struct MemoryState {
    running: BTreeMap<String, Config>,
    statistics: HashMap<String, Statistics>,
    fail_next_start: bool,
    fail_next_stop: bool,
    fail_next_statistics: bool,
    start_gate: Option<Arc<Notify>>,
    starts: usize,
    stops: usize,
}

/// Backend that runs nothing
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start` fail
    pub async fn fail_next_start(&self) {
        self.state.lock().await.fail_next_start = true;
    }

    /// Make the next `stop` fail
    pub async fn fail_next_stop(&self) {
        self.state.lock().await.fail_next_stop = true;
    }

    /// Make the next `statistics` call fail
    pub async fn fail_next_statistics(&self) {
        self.state.lock().await.fail_next_statistics = true;
    }

    /// Hold the next `start` until the returned gate is notified
    pub async fn block_next_start(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().await.start_gate = Some(gate.clone());
        gate
    }

    /// Counters reported for a tunnel instead of zeroes
    pub async fn set_statistics(&self, name: &str, statistics: Statistics) {
        self.state
            .lock()
            .await
            .statistics
            .insert(name.to_string(), statistics);
    }

    /// Mark a tunnel running without going through `start`, as if brought
    /// up by another process.
    pub async fn mark_running(&self, name: &str, config: Config) {
        self.state.lock().await.running.insert(name.to_string(), config);
    }

    /// Forget a running tunnel without going through `stop`
    pub async fn mark_stopped(&self, name: &str) {
        self.state.lock().await.running.remove(name);
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.state.lock().await.running.contains_key(name)
    }

    /// Config the tunnel was last started with
    pub async fn running_config(&self, name: &str) -> Option<Config> {
        self.state.lock().await.running.get(name).cloned()
    }

    /// Number of `start` calls that reached the backend
    pub async fn start_count(&self) -> usize {
        self.state.lock().await.starts
    }

    /// Number of `stop` calls that reached the backend
    pub async fn stop_count(&self) -> usize {
        self.state.lock().await.stops
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn start(&self, name: &str, config: &Config) -> Result<(), BackendError> {
        let gate = {
            let mut state = self.state.lock().await;
            state.starts += 1;
            state.start_gate.take()
        };

        if let Some(gate) = gate {
            debug!("Start of {} waiting at gate", name);
            gate.notified().await;
        }

        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_start) {
            return Err(BackendError::Command {
                command: format!("start {}", name),
                status: "injected failure".to_string(),
                output: String::new(),
            });
        }

        state.running.insert(name.to_string(), config.clone());
        debug!("Memory backend started {}", name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.stops += 1;

        if std::mem::take(&mut state.fail_next_stop) {
            return Err(BackendError::Command {
                command: format!("stop {}", name),
                status: "injected failure".to_string(),
                output: String::new(),
            });
        }

        if state.running.remove(name).is_none() {
            return Err(BackendError::NotRunning(name.to_string()));
        }

        state.statistics.remove(name);
        debug!("Memory backend stopped {}", name);
        Ok(())
    }

    async fn running_names(&self) -> Result<BTreeSet<String>, BackendError> {
        Ok(self.state.lock().await.running.keys().cloned().collect())
    }

    async fn statistics(&self, name: &str) -> Result<Statistics, BackendError> {
        let mut state = self.state.lock().await;

        if std::mem::take(&mut state.fail_next_statistics) {
            return Err(BackendError::Unavailable("injected failure".to_string()));
        }

        let config = state
            .running
            .get(name)
            .ok_or_else(|| BackendError::NotRunning(name.to_string()))?;

        Ok(state
            .statistics
            .get(name)
            .cloned()
            .unwrap_or_else(|| Statistics::empty_for(config)))
    }
}
