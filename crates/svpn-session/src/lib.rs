//! SecureVPN Session Controller
//!
//! Client-side control of a single WireGuard-style tunnel: pick a server,
//! obtain key material, render a tunnel profile, bring the tunnel up
//! through a platform backend and report live status until disconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SessionController                        │
//! │                                                              │
//! │  ┌──────────────┐   ┌───────────────┐   ┌────────────────┐   │
//! │  │ KeyProvisioner│──▶│ ProfileBuilder│──▶│ TunnelBackend  │   │
//! │  │ (HTTP / sim) │   │ (or issued)   │   │ desktop/bridge │   │
//! │  └──────────────┘   └───────────────┘   └───────┬────────┘   │
//! │                                                 │            │
//! │  ┌──────────────┐        transfer counters      │            │
//! │  │ StatusTicker │◀──────────────────────────────┘            │
//! │  └──────┬───────┘                                            │
//! │         ▼                                                    │
//! │   watch<SessionStatus>  ──▶  status() / subscribe()          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - One connect/disconnect/switch at a time; others fail with `Busy`
//! - Every failed connect ends `Disconnected` with `last_error` set
//! - No status tick lands after `disconnect` returns
//! - Private keys never appear in `Debug` output or logs

pub mod backend;
mod config;
mod controller;
mod endpoint;
mod keys;
mod profile;
pub mod provisioner;
mod status;
mod ticker;

pub use backend::{BackendError, BackendKind, Platform, TransferCounters, TunnelBackend};
pub use config::{ConfigError, ConfigFormat, IssuanceConfig, ProfileSource, SessionConfig};
pub use controller::{ConnectError, SessionController, SessionError};
pub use endpoint::{Endpoint, EndpointCatalog};
pub use keys::KeyMaterial;
pub use profile::{
    AddressPool, ClientAddress, ExportedProfile, ProfileBuilder, TunnelProfile,
    ValidationError, DEFAULT_ALLOWED_IPS, DEFAULT_KEEPALIVE, export_file_name,
};
pub use provisioner::{KeyProvisioner, ProvisioningError};
pub use status::{SessionState, SessionStatus};
pub use ticker::{StatusTicker, TICK_PERIOD};
