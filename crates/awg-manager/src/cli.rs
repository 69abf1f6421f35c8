//! Command line interface
//!
//! Every invocation loads settings, builds the store and backend, restores
//! the registry, runs one command and finally saves state.

use anyhow::{Context, Result, anyhow};
use awg_tunnel::{
    Backend, BackendKind, Config, ConfigStore, FileConfigStore, ManagerSettings, MemoryBackend,
    ProxyMode, QuickBackend, Tunnel, TunnelManager, TunnelState, xray,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// AmneziaWG tunnel manager
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the settings file
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tunnels and their states
    List,
    /// Print a tunnel's config in wg-quick format
    Show { name: String },
    /// Create a tunnel from a wg-quick file
    Create {
        name: String,
        #[arg(short, long, value_name = "CONF")]
        file: PathBuf,
    },
    /// Delete a tunnel, stopping it first
    Delete { name: String },
    /// Bring a tunnel up
    Up { name: String },
    /// Bring a tunnel down
    Down { name: String },
    /// Flip a tunnel between up and down
    Toggle { name: String },
    /// Rename a tunnel
    Rename { old: String, new: String },
    /// Replace a tunnel's config from a wg-quick file
    SetConfig {
        name: String,
        #[arg(short, long, value_name = "CONF")]
        file: PathBuf,
    },
    /// Print transfer statistics of a running tunnel
    Stats { name: String },
    /// Re-align with the backend and bring back previously running tunnels
    Restore {
        #[arg(short, long)]
        force: bool,
    },
    /// Persist configs and the running set
    Save,
    /// Print the Xray forwarder descriptor for a tunnel
    Proxy {
        name: String,
        #[arg(short, long, default_value = "tcp")]
        mode: String,
    },
    /// Print change events and refresh statistics until interrupted
    Watch {
        /// Seconds between refreshes
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
    },
}

/// Run the CLI application
pub async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.settings.as_deref())?;
    let manager = build_manager(settings);

    manager
        .restore_state(false)
        .await
        .context("Failed to restore tunnel state")?;

    let result = execute(&manager, cli.command).await;

    if let Err(e) = manager.save_state().await {
        for (what, failure) in &e.failures {
            warn!("Failed to save {}: {}", what, failure);
        }
        if result.is_ok() {
            return Err(e.into());
        }
    }

    result
}

fn load_settings(path: Option<&Path>) -> Result<ManagerSettings> {
    match path {
        Some(path) if path.exists() => {
            debug!("Loading settings from {}", path.display());
            Ok(ManagerSettings::from_toml_file(path)?)
        }
        Some(path) => {
            warn!("Settings file {} not found, using defaults", path.display());
            Ok(ManagerSettings::default())
        }
        None => Ok(ManagerSettings::default()),
    }
}

fn build_manager(settings: ManagerSettings) -> TunnelManager {
    let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::new(&settings.config_dir));
    let backend: Arc<dyn Backend> = match settings.backend {
        BackendKind::Quick => Arc::new(QuickBackend::new(
            &settings.awg_quick_path,
            &settings.awg_path,
            &settings.runtime_dir,
        )),
        BackendKind::Memory => {
            warn!("Memory backend is a dry run: tunnels never reach the host and are forgotten on exit");
            Arc::new(MemoryBackend::new())
        }
    };

    info!(
        "Using configs in {} with {:?} backend",
        settings.config_dir.display(),
        settings.backend
    );
    TunnelManager::new(store, backend, settings)
}

async fn tunnel(manager: &TunnelManager, name: &str) -> Result<Arc<Tunnel>> {
    manager
        .get(name)
        .await
        .ok_or_else(|| anyhow!("No tunnel named {}", name))
}

async fn read_config(path: &Path) -> Result<Config> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Config::parse_wg_quick(&text).with_context(|| format!("Invalid config in {}", path.display()))
}

async fn set_state(manager: &TunnelManager, name: &str, state: TunnelState) -> Result<()> {
    let reached = tunnel(manager, name).await?.set_state(state).await?;
    println!("{}: {}", name, reached);
    Ok(())
}

async fn execute(manager: &TunnelManager, command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            let last_used = match manager.last_used_tunnel().await {
                Some(tunnel) => Some(tunnel.name().await),
                None => None,
            };
            for snapshot in manager.snapshot().await {
                let marker = if last_used.as_deref() == Some(snapshot.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {:<15} {}", marker, snapshot.name, snapshot.state);
            }
        }
        Commands::Show { name } => {
            let config = tunnel(manager, &name).await?.load_config().await?;
            print!("{}", config.to_wg_quick());
        }
        Commands::Create { name, file } => {
            let config = read_config(&file).await?;
            manager.create(&name, config).await?;
            println!("Created {}", name);
        }
        Commands::Delete { name } => {
            tunnel(manager, &name).await?.delete().await?;
            println!("Deleted {}", name);
        }
        Commands::Up { name } => set_state(manager, &name, TunnelState::Up).await?,
        Commands::Down { name } => set_state(manager, &name, TunnelState::Down).await?,
        Commands::Toggle { name } => set_state(manager, &name, TunnelState::Toggling).await?,
        Commands::Rename { old, new } => {
            tunnel(manager, &old).await?.set_name(&new).await?;
            println!("Renamed {} to {}", old, new);
        }
        Commands::SetConfig { name, file } => {
            let config = read_config(&file).await?;
            tunnel(manager, &name).await?.set_config(config).await?;
            println!("Updated {}", name);
        }
        Commands::Stats { name } => match tunnel(manager, &name).await?.refresh_statistics().await? {
            Some(stats) => {
                println!("{}", stats.format());
                for peer in &stats.peers {
                    let handshake = peer
                        .latest_handshake
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "  {}  rx {}  tx {}  handshake {}",
                        peer.public_key, peer.rx_bytes, peer.tx_bytes, handshake
                    );
                }
            }
            None => println!("{} is not up", name),
        },
        Commands::Restore { force } => {
            if force {
                manager.restore_state(true).await?;
            }
            for snapshot in manager.snapshot().await {
                println!("{:<15} {}", snapshot.name, snapshot.state);
            }
        }
        Commands::Save => {
            manager.save_state().await?;
            println!("Saved");
        }
        Commands::Proxy { name, mode } => {
            let config = tunnel(manager, &name).await?.load_config().await?;
            let descriptor = xray::generate(&config, ProxyMode::parse(&mode));
            if !descriptor.is_empty() {
                println!("{}", descriptor);
            }
        }
        Commands::Watch { interval } => watch(manager, Duration::from_secs(interval.max(1))).await?,
    }

    Ok(())
}

async fn watch(manager: &TunnelManager, interval: Duration) -> Result<()> {
    let mut events = manager.subscribe();
    let mut ticker = tokio::time::interval(interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = ticker.tick() => {
                match manager.refresh_tunnel_states().await {
                    Ok(()) => refresh_statistics(manager).await,
                    Err(e) => warn!("Failed to refresh tunnel states: {}", e),
                }
            }
        }
    }
}

async fn refresh_statistics(manager: &TunnelManager) {
    for tunnel in manager.get_tunnels().await {
        if let Err(e) = tunnel.refresh_statistics().await {
            warn!("Failed to refresh statistics: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["awg-manager", "-v", "create", "home", "--file", "home.conf"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Create { ref name, .. } if name == "home"));

        let cli = Cli::try_parse_from(["awg-manager", "restore", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Restore { force: true }));

        let cli = Cli::try_parse_from(["awg-manager", "proxy", "home"]).unwrap();
        assert!(matches!(cli.command, Commands::Proxy { ref mode, .. } if mode == "tcp"));
    }

    #[test]
    fn test_missing_settings_file_uses_defaults() {
        let settings = load_settings(Some(Path::new("/nonexistent/settings.toml"))).unwrap();
        assert_eq!(settings, ManagerSettings::default());
    }

    #[tokio::test]
    async fn test_memory_backend_session() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("home.conf");
        std::fs::write(
            &conf,
            format!(
                "[Interface]\nPrivateKey = {}\nAddress = 10.0.0.2/32\n\n[Peer]\nPublicKey = {}\nEndpoint = 203.0.113.5:51820\n",
                awg_tunnel::PrivateKey::generate().to_base64(),
                awg_tunnel::KeyPair::generate().public.to_base64(),
            ),
        )
        .unwrap();

        let settings = ManagerSettings {
            config_dir: dir.path().join("tunnels"),
            state_file: Some(dir.path().join("state.json")),
            backend: BackendKind::Memory,
            ..Default::default()
        };
        let manager = build_manager(settings);
        manager.restore_state(false).await.unwrap();

        execute(&manager, Commands::Create { name: "home".into(), file: conf })
            .await
            .unwrap();
        execute(&manager, Commands::Up { name: "home".into() }).await.unwrap();
        manager.save_state().await.unwrap();

        assert!(dir.path().join("tunnels").join("home.conf").exists());
        let state = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert!(state.contains("home"));
    }
}
