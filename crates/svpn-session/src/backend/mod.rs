//! Tunnel Backends
//!
//! The platform facility that actually brings a tunnel up and down.
//! Exactly one backend is chosen at startup:
//!
//! | Platform | Backend |
//! |----------|---------|
//! | Android / iOS | [`BridgeBackend`] forwarding to the host app's VPN service |
//! | Desktop | [`DesktopBackend`] driving `wg-quick` / `wireguard.exe` |
//! | anywhere | [`SimulatedBackend`] (no tunnel, synthetic traffic) |
//!
//! Backends are only ever called by the session controller, one
//! operation at a time.

mod bridge;
mod desktop;
mod simulated;

pub use bridge::{BridgeBackend, BridgeStatus, PlatformBridge};
pub use desktop::DesktopBackend;
pub use simulated::{BackendCall, SimulatedBackend};

use crate::profile::TunnelProfile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Runtime platform family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Android,
    Ios,
    Desktop,
    Simulated,
}

impl Platform {
    /// Platform this binary was compiled for
    pub fn detect() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else {
            Platform::Desktop
        }
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self, Platform::Android | Platform::Ios)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Desktop => "desktop",
            Platform::Simulated => "simulated",
        };
        f.write_str(name)
    }
}

/// Backend choice in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Detect from the compile target
    #[default]
    Auto,
    Simulated,
    Desktop,
}

impl std::str::FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "simulated" => Ok(BackendKind::Simulated),
            "desktop" => Ok(BackendKind::Desktop),
            _ => Err(BackendError::Unavailable(format!("unknown backend {:?}", s))),
        }
    }
}

/// Cumulative traffic since the tunnel came up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Tunnel backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Tunnel backend unavailable: {0}")]
    Unavailable(String),

    #[error("Tunnel establish failed: {0}")]
    Establish(String),

    #[error("Tunnel teardown failed: {0}")]
    Teardown(String),

    #[error("Tunnel backend I/O error: {0}")]
    Io(String),
}

/// Establish/teardown capability of a platform
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Platform family this backend serves
    fn platform(&self) -> Platform;

    /// Bring up a tunnel using `profile`
    async fn establish(&self, profile: &TunnelProfile) -> Result<(), BackendError>;

    /// Tear down the active tunnel
    ///
    /// Must succeed as a no-op when nothing is established.
    async fn teardown(&self) -> Result<(), BackendError>;

    /// Traffic counters since the last successful establish, if reported
    async fn transfer(&self) -> Option<TransferCounters> {
        None
    }

    /// Whether a failed `establish` is guaranteed to leave nothing behind.
    ///
    /// When `false` the controller calls `teardown` after a failed establish.
    fn cleans_up_on_failure(&self) -> bool {
        false
    }
}

/// Pick the backend for this process
///
/// `bridge` is the host application's VPN service hook and is required
/// on Android and iOS.
pub fn select(
    kind: BackendKind,
    interface: &str,
    bridge: Option<Arc<dyn PlatformBridge>>,
) -> Result<Arc<dyn TunnelBackend>, BackendError> {
    let platform = match kind {
        BackendKind::Auto => Platform::detect(),
        BackendKind::Simulated => Platform::Simulated,
        BackendKind::Desktop => Platform::Desktop,
    };

    let backend: Arc<dyn TunnelBackend> = match platform {
        Platform::Simulated => Arc::new(SimulatedBackend::new()),
        Platform::Desktop => Arc::new(DesktopBackend::new(interface)?),
        Platform::Android | Platform::Ios => {
            let bridge = bridge.ok_or_else(|| {
                BackendError::Unavailable(format!("no VPN service bridge registered for {}", platform))
            })?;
            Arc::new(BridgeBackend::new(platform, bridge))
        }
    };

    info!("Selected {} tunnel backend", backend.platform());
    Ok(backend)
}
