//! Simulated Backend
//!
//! No tunnel is created. Used off-device and in tests so the rest of the
//! session stack runs without OS privileges.
//!
//! # Synthetic Traffic Model
//!
//! Every [`TunnelBackend::transfer`] sample while "up" adds a uniform
//! random `0..100 KiB` to the received counter and `0..50 KiB` to the sent
//! counter. Counters only grow, and restart from zero on each establish.
//! These numbers are fake and are never produced by a real backend.

use super::{BackendError, Platform, TransferCounters, TunnelBackend};
use crate::profile::TunnelProfile;
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Upper bound (exclusive) of one synthetic receive increment
pub const SYNTHETIC_RX_PER_SAMPLE: u64 = 100 * 1024;

/// Upper bound (exclusive) of one synthetic send increment
pub const SYNTHETIC_TX_PER_SAMPLE: u64 = 50 * 1024;

/// Backend operation, as recorded in the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// Establish towards this network address
    Establish(String),
    Teardown,
}

#[derive(Default)]
struct SimState {
    /// Network address of the "up" tunnel
    up: Option<String>,
    counters: TransferCounters,
    calls: Vec<BackendCall>,
    fail_establish: Option<String>,
    fail_teardown: Option<String>,
    establish_delay: Duration,
}

/// Always-succeeding backend with synthetic counters
///
/// Failures and latency can be injected for tests.
#[derive(Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following establish fail with `reason`
    pub fn fail_establish(&self, reason: impl Into<String>) {
        self.state().fail_establish = Some(reason.into());
    }

    /// Make every following teardown fail with `reason`
    pub fn fail_teardown(&self, reason: impl Into<String>) {
        self.state().fail_teardown = Some(reason.into());
    }

    /// Clear injected failures
    pub fn heal(&self) {
        let mut state = self.state();
        state.fail_establish = None;
        state.fail_teardown = None;
    }

    /// Delay each establish by `delay`
    pub fn set_establish_delay(&self, delay: Duration) {
        self.state().establish_delay = delay;
    }

    /// Whether a simulated tunnel is up
    pub fn is_up(&self) -> bool {
        self.state().up.is_some()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn establish_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Establish(_)))
            .count()
    }

    pub fn teardown_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Teardown))
            .count()
    }
}

#[async_trait]
impl TunnelBackend for SimulatedBackend {
    fn platform(&self) -> Platform {
        Platform::Simulated
    }

    async fn establish(&self, profile: &TunnelProfile) -> Result<(), BackendError> {
        let address = profile.endpoint().network_address.clone();
        let (delay, failure) = {
            let mut state = self.state();
            state.calls.push(BackendCall::Establish(address.clone()));
            (state.establish_delay, state.fail_establish.clone())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = failure {
            debug!("Simulated establish to {} failing: {}", address, reason);
            return Err(BackendError::Establish(reason));
        }

        let mut state = self.state();
        state.up = Some(address);
        state.counters = TransferCounters::default();
        debug!("Simulated tunnel up");
        Ok(())
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::Teardown);

        if let Some(reason) = state.fail_teardown.clone() {
            return Err(BackendError::Teardown(reason));
        }

        if state.up.take().is_some() {
            debug!("Simulated tunnel down");
        }
        Ok(())
    }

    async fn transfer(&self) -> Option<TransferCounters> {
        let mut state = self.state();
        state.up.as_ref()?;

        let mut rng = rand::thread_rng();
        state.counters.bytes_received += rng.gen_range(0..SYNTHETIC_RX_PER_SAMPLE);
        state.counters.bytes_sent += rng.gen_range(0..SYNTHETIC_TX_PER_SAMPLE);
        Some(state.counters)
    }

    fn cleans_up_on_failure(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::keys::KeyMaterial;
    use crate::profile::ProfileBuilder;

    fn profile() -> TunnelProfile {
        ProfileBuilder::default()
            .build(
                &KeyMaterial::new("priv", "pub"),
                &Endpoint::new("DE", "192.0.2.30:51820", "srv"),
                "10.8.0.2/24".parse().unwrap(),
                &[],
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_establish_and_teardown() {
        let backend = SimulatedBackend::new();

        backend.establish(&profile()).await.unwrap();
        assert!(backend.is_up());

        backend.teardown().await.unwrap();
        assert!(!backend.is_up());
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Establish("192.0.2.30:51820".into()), BackendCall::Teardown]
        );
    }

    #[tokio::test]
    async fn test_teardown_when_down_is_noop() {
        let backend = SimulatedBackend::new();
        assert!(backend.teardown().await.is_ok());
        assert!(backend.teardown().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_nothing_up() {
        let backend = SimulatedBackend::new();
        backend.fail_establish("permission denied");

        let err = backend.establish(&profile()).await.unwrap_err();
        assert_eq!(err, BackendError::Establish("permission denied".into()));
        assert!(!backend.is_up());

        backend.heal();
        assert!(backend.establish(&profile()).await.is_ok());
    }

    #[tokio::test]
    async fn test_synthetic_counters_monotonic() {
        let backend = SimulatedBackend::new();
        assert!(backend.transfer().await.is_none());

        backend.establish(&profile()).await.unwrap();
        let mut last = TransferCounters::default();
        for _ in 0..50 {
            let now = backend.transfer().await.unwrap();
            assert!(now.bytes_received >= last.bytes_received);
            assert!(now.bytes_sent >= last.bytes_sent);
            assert!(now.bytes_received - last.bytes_received < SYNTHETIC_RX_PER_SAMPLE);
            assert!(now.bytes_sent - last.bytes_sent < SYNTHETIC_TX_PER_SAMPLE);
            last = now;
        }

        backend.teardown().await.unwrap();
        assert!(backend.transfer().await.is_none());
    }
}
