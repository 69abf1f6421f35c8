//! `awg-quick` backend
//!
//! Brings tunnels up and down by writing `<runtime_dir>/<name>.conf` and
//! invoking `awg-quick`. State and counters come from `awg show`.

use super::{Backend, BackendError, PeerStats, Statistics};
use crate::config::Config;
use crate::keys::PublicKey;
use crate::store::write_private;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Backend driving the `awg-quick` and `awg` command line tools
#[derive(Debug, Clone)]
pub struct QuickBackend {
    awg_quick: PathBuf,
    awg: PathBuf,
    runtime_dir: PathBuf,
}

impl QuickBackend {
    pub fn new(
        awg_quick: impl Into<PathBuf>,
        awg: impl Into<PathBuf>,
        runtime_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            awg_quick: awg_quick.into(),
            awg: awg.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Where the config handed to `awg-quick` is written
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}.conf", name))
    }

    async fn run<I, S>(&self, program: &Path, args: I) -> Result<String, BackendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let command = format!(
            "{} {}",
            program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        debug!("Running {}", command);

        let output = Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => BackendError::Unavailable(program.display().to_string()),
                _ => BackendError::Spawn {
                    program: program.display().to_string(),
                    source: e,
                },
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("{} failed: {} {}", command, output.status, stderr.trim());
            return Err(BackendError::Command {
                command,
                status: output.status.to_string(),
                output: format!("{}{}", stdout, stderr).trim().to_string(),
            });
        }

        Ok(stdout)
    }
}

#[async_trait]
impl Backend for QuickBackend {
    async fn start(&self, name: &str, config: &Config) -> Result<(), BackendError> {
        let path = self.config_path(name);

        if self.running_names().await?.contains(name) {
            info!("Replacing configuration of running tunnel {}", name);
            self.run(&self.awg_quick, [OsStr::new("down"), path.as_os_str()])
                .await?;
        }

        write_private(&path, config.to_wg_quick().as_bytes())
            .await
            .map_err(|e| BackendError::Spawn {
                program: path.display().to_string(),
                source: e,
            })?;

        match self.run(&self.awg_quick, [OsStr::new("up"), path.as_os_str()]).await {
            Err(BackendError::Command { output, .. }) if output.contains("already exists") => {
                Err(BackendError::AlreadyUp(name.to_string()))
            }
            other => other.map(|_| ()),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), BackendError> {
        if !self.running_names().await?.contains(name) {
            return Err(BackendError::NotRunning(name.to_string()));
        }

        let path = self.config_path(name);
        self.run(&self.awg_quick, [OsStr::new("down"), path.as_os_str()])
            .await?;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
        Ok(())
    }

    async fn running_names(&self) -> Result<BTreeSet<String>, BackendError> {
        let out = self.run(&self.awg, ["show", "interfaces"]).await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn statistics(&self, name: &str) -> Result<Statistics, BackendError> {
        let out = self.run(&self.awg, ["show", name, "dump"]).await?;
        parse_dump(&out)
    }
}

/// Parse `awg show <name> dump` output
///
/// The first line describes the interface; every following line is one
/// peer as `public-key preshared-key endpoint allowed-ips latest-handshake
/// transfer-rx transfer-tx persistent-keepalive`, tab separated.
pub fn parse_dump(text: &str) -> Result<Statistics, BackendError> {
    let mut peers = Vec::new();

    for line in text.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(BackendError::InvalidOutput(line.to_string()));
        }

        let number = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| BackendError::InvalidOutput(line.to_string()))
        };

        let public_key = PublicKey::from_base64(fields[0])
            .map_err(|_| BackendError::InvalidOutput(line.to_string()))?;
        let handshake = number(fields[4])?;

        peers.push(PeerStats {
            public_key,
            rx_bytes: number(fields[5])?,
            tx_bytes: number(fields[6])?,
            latest_handshake: (handshake != 0).then_some(handshake),
        });
    }

    Ok(Statistics { peers })
}
