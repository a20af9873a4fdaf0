//! Mobile Bridge Backend
//!
//! On Android and iOS the tunnel lives in the host app's VPN service
//! (`VpnService` / `NEPacketTunnelProvider`). The host registers a
//! [`PlatformBridge`] at startup and this backend forwards to it.

use super::{BackendError, Platform, TransferCounters, TunnelBackend};
use crate::profile::TunnelProfile;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Status reported by the host VPN service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStatus {
    pub connected: bool,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Hook into the host application's VPN service
///
/// `Err` carries the host's failure message.
#[async_trait]
pub trait PlatformBridge: Send + Sync {
    /// Start the tunnel with WireGuard profile text
    async fn connect(&self, config: &str) -> Result<(), String>;

    /// Stop the tunnel; must succeed when nothing is running
    async fn disconnect(&self) -> Result<(), String>;

    async fn status(&self) -> Result<BridgeStatus, String>;
}

/// Backend forwarding to a [`PlatformBridge`]
pub struct BridgeBackend {
    platform: Platform,
    bridge: Arc<dyn PlatformBridge>,
}

impl BridgeBackend {
    pub fn new(platform: Platform, bridge: Arc<dyn PlatformBridge>) -> Self {
        Self { platform, bridge }
    }
}

#[async_trait]
impl TunnelBackend for BridgeBackend {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn establish(&self, profile: &TunnelProfile) -> Result<(), BackendError> {
        info!(
            "Asking {} VPN service to connect to {}",
            self.platform,
            profile.endpoint().network_address
        );
        self.bridge
            .connect(&profile.render())
            .await
            .map_err(BackendError::Establish)
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        debug!("Asking {} VPN service to disconnect", self.platform);
        self.bridge.disconnect().await.map_err(BackendError::Teardown)
    }

    async fn transfer(&self) -> Option<TransferCounters> {
        match self.bridge.status().await {
            Ok(status) if status.connected => Some(TransferCounters {
                bytes_received: status.bytes_received,
                bytes_sent: status.bytes_sent,
            }),
            Ok(_) => None,
            Err(e) => {
                debug!("VPN service status unavailable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::keys::KeyMaterial;
    use crate::profile::ProfileBuilder;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeService {
        configs: Mutex<Vec<String>>,
        refuse: bool,
    }

    #[async_trait]
    impl PlatformBridge for FakeService {
        async fn connect(&self, config: &str) -> Result<(), String> {
            if self.refuse {
                return Err("VPN permission denied".into());
            }
            self.configs.lock().unwrap().push(config.to_string());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), String> {
            Ok(())
        }

        async fn status(&self) -> Result<BridgeStatus, String> {
            Ok(BridgeStatus {
                connected: !self.configs.lock().unwrap().is_empty(),
                bytes_received: 4096,
                bytes_sent: 1024,
            })
        }
    }

    fn profile() -> TunnelProfile {
        ProfileBuilder::default()
            .build(
                &KeyMaterial::new("priv", "pub"),
                &Endpoint::new("JP", "198.18.0.40:51820", "srv"),
                "10.8.0.9/24".parse().unwrap(),
                &[],
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_profile_text() {
        let service = Arc::new(FakeService::default());
        let backend = BridgeBackend::new(Platform::Android, service.clone());

        backend.establish(&profile()).await.unwrap();
        assert_eq!(service.configs.lock().unwrap()[0], profile().render());

        let counters = backend.transfer().await.unwrap();
        assert_eq!(counters.bytes_received, 4096);
    }

    #[tokio::test]
    async fn test_host_refusal() {
        let service = Arc::new(FakeService {
            refuse: true,
            ..Default::default()
        });
        let backend = BridgeBackend::new(Platform::Ios, service);

        let err = backend.establish(&profile()).await.unwrap_err();
        assert_eq!(err, BackendError::Establish("VPN permission denied".into()));
        assert!(!backend.cleans_up_on_failure());
    }
}
