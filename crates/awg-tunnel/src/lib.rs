//! AmneziaWG tunnel manager
//!
//! Keeps named tunnel configurations, brings them up and down through a
//! native backend and exposes an observable model for front-ends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     TunnelManager                        │
//! │                                                          │
//! │  ┌──────────┐   set_state / set_config / set_name        │
//! │  │  Tunnel  │──────────────┬──────────────┐              │
//! │  └──────────┘              ▼              ▼              │
//! │        ▲            ┌────────────┐  ┌─────────────┐      │
//! │        │ events     │  Backend   │  │ ConfigStore │      │
//! │        └────────────│ (awg-quick)│  │ (*.conf)    │      │
//! │                     └────────────┘  └─────────────┘      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Per-tunnel serialization**: one mutation at a time, others get `Busy`
//! - **Rollback**: a failed backend or store step leaves the tunnel as it was
//! - **AmneziaWG obfuscation**: junk packets, padded messages, magic header ranges
//! - **wg-quick files**: configs are stored in the format `awg-quick` reads

mod backend;
mod config;
mod draft;
mod events;
mod keys;
mod manager;
mod settings;
mod store;
mod tunnel;
mod wg_quick;
pub mod xray;

pub use backend::{Backend, BackendError, MemoryBackend, PeerStats, QuickBackend, Statistics, parse_dump};
pub use config::{
    Config, ConfigError, Endpoint, Interface, IpNetwork, MAX_SEGMENT_SIZE, MagicHeader, Obfuscation,
    Peer,
};
pub use draft::{ConfigDraft, InterfaceDraft, PeerDraft};
pub use events::{EVENT_CAPACITY, TunnelEvent};
pub use keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey};
pub use manager::{MAX_NAME_LEN, SaveStateError, TunnelError, TunnelManager, is_valid_name};
pub use settings::{BackendKind, ManagerSettings, SettingsError, SortOrder};
pub use store::{
    ConfigStore, FileConfigStore, MemoryConfigStore, SavedState, StateFile, StoreError,
};
pub use tunnel::{Tunnel, TunnelSnapshot, TunnelState};
pub use xray::ProxyMode;
