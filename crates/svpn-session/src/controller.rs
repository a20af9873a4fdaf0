//! Session Controller
//!
//! Owns the connection state machine. Connect, disconnect and endpoint
//! switches are serialized by a single lifecycle guard; a second call
//! while one is in flight fails immediately with [`SessionError::Busy`].
//! Status is published through a watch channel, so reading it never
//! waits on a slow backend.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::new(&config, backend, provisioner)?;
//!
//! let germany = config.endpoint("Germany").unwrap().clone();
//! controller.connect(germany, None).await?;
//! println!("{}", controller.status().format());
//!
//! controller.disconnect().await?;
//! ```
//!
//! # Connect Sequence
//!
//! 1. State `Connecting`, counters zeroed
//! 2. Keys from the caller or the provisioner
//! 3. Profile built locally (pool-allocated address) or issued remotely
//! 4. Backend establish
//! 5. State `Connected`, ticker started
//!
//! Any failure tears down defensively when needed, passes through
//! `Failed` and ends in `Disconnected`.

use crate::backend::{BackendError, Platform, TunnelBackend};
use crate::config::{ConfigError, ProfileSource, SessionConfig};
use crate::endpoint::Endpoint;
use crate::keys::KeyMaterial;
use crate::profile::{AddressPool, ProfileBuilder, TunnelProfile, ValidationError};
use crate::provisioner::{KeyProvisioner, ProvisioningError};
use crate::status::{SessionState, SessionStatus};
use crate::ticker::StatusTicker;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a connect attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Session controller errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Another connect/disconnect is in progress")]
    Busy,

    #[error("Connect to {endpoint} failed: {cause}")]
    Connect {
        endpoint: String,
        #[source]
        cause: ConnectError,
    },

    #[error("Lifecycle operation aborted: {0}")]
    Interrupted(String),
}

impl SessionError {
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionError::Busy)
    }

    /// Cause of a failed connect
    pub fn connect_cause(&self) -> Option<&ConnectError> {
        match self {
            SessionError::Connect { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// The backend error behind a failed connect
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self.connect_cause() {
            Some(ConnectError::Backend(e)) => Some(e),
            _ => None,
        }
    }
}

/// State touched only while holding the lifecycle guard
struct Lifecycle {
    ticker: StatusTicker,
    /// Keys of the live session, reused when switching endpoints
    keys: Option<KeyMaterial>,
    profile: Option<TunnelProfile>,
}

struct Inner {
    backend: Arc<dyn TunnelBackend>,
    provisioner: Arc<dyn KeyProvisioner>,
    builder: ProfileBuilder,
    pool: AddressPool,
    dns: Vec<IpAddr>,
    profile_source: ProfileSource,
    connect_timeout: Duration,
    lifecycle: Arc<Mutex<Lifecycle>>,
    status: Arc<watch::Sender<SessionStatus>>,
}

/// Handle to the session state machine
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create a controller around the process's backend and provisioner
    pub fn new(
        config: &SessionConfig,
        backend: Arc<dyn TunnelBackend>,
        provisioner: Arc<dyn KeyProvisioner>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (status, _) = watch::channel(SessionStatus::default());
        let lifecycle = Lifecycle {
            ticker: StatusTicker::new(config.tick_period()),
            keys: None,
            profile: None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                provisioner,
                builder: config.profile_builder(),
                pool: config.pool()?,
                dns: config.dns.clone(),
                profile_source: config.profile_source,
                connect_timeout: config.connect_timeout(),
                lifecycle: Arc::new(Mutex::new(lifecycle)),
                status: Arc::new(status),
            }),
        })
    }

    /// Snapshot of the current status
    pub fn status(&self) -> SessionStatus {
        self.inner.snapshot()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Platform of the selected backend
    pub fn platform(&self) -> Platform {
        self.inner.backend.platform()
    }

    /// Connect to `endpoint` with the configured timeout
    ///
    /// A no-op when already connected to the same server; switches when
    /// connected elsewhere. Without `keys`, the current session's keys are
    /// reused or fresh ones are requested from the provisioner.
    pub async fn connect(
        &self,
        endpoint: Endpoint,
        keys: Option<KeyMaterial>,
    ) -> Result<(), SessionError> {
        self.connect_with_timeout(endpoint, keys, self.inner.connect_timeout)
            .await
    }

    /// Connect with an explicit deadline for provisioning + establish
    pub async fn connect_with_timeout(
        &self,
        endpoint: Endpoint,
        keys: Option<KeyMaterial>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let mut lifecycle = self.acquire()?;
        let inner = self.inner.clone();

        self.finish(tokio::spawn(async move {
            inner.connect(&mut lifecycle, endpoint, keys, timeout).await
        }))
        .await
    }

    /// Disconnect; a no-op when already disconnected
    ///
    /// Teardown failures are logged and kept in `last_error`; the session
    /// still ends Disconnected and this returns `Ok`.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let mut lifecycle = self.acquire()?;
        let inner = self.inner.clone();

        self.finish(tokio::spawn(async move {
            inner.disconnect(&mut lifecycle).await;
            Ok(())
        }))
        .await
    }

    /// Disconnect, then connect to `endpoint`, as one guarded operation
    ///
    /// Unlike [`connect`](Self::connect) this also reconnects when
    /// `endpoint` is the current server.
    pub async fn switch_endpoint(&self, endpoint: Endpoint) -> Result<(), SessionError> {
        let mut lifecycle = self.acquire()?;
        let inner = self.inner.clone();
        let timeout = self.inner.connect_timeout;

        self.finish(tokio::spawn(async move {
            let keys = lifecycle.keys.clone();
            inner.clear_error();
            inner.disconnect(&mut lifecycle).await;
            inner.bring_up(&mut lifecycle, endpoint, keys, timeout).await
        }))
        .await
    }

    /// Profile of the live session, for export
    pub fn active_profile(&self) -> Result<Option<TunnelProfile>, SessionError> {
        let lifecycle = self
            .inner
            .lifecycle
            .try_lock()
            .map_err(|_| SessionError::Busy)?;
        Ok(lifecycle.profile.clone())
    }

    fn acquire(&self) -> Result<OwnedMutexGuard<Lifecycle>, SessionError> {
        self.inner.lifecycle.clone().try_lock_owned().map_err(|_| {
            debug!("Lifecycle operation rejected: busy");
            SessionError::Busy
        })
    }

    /// Await a lifecycle task
    ///
    /// The task owns the guard, so the transition completes even if the
    /// caller stops waiting.
    async fn finish(
        &self,
        task: JoinHandle<Result<(), SessionError>>,
    ) -> Result<(), SessionError> {
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Lifecycle task aborted: {}", e);
                self.inner.status.send_modify(|s| {
                    s.state = SessionState::Disconnected;
                    s.connected_endpoint = None;
                    s.last_error = Some(e.to_string());
                });
                Err(SessionError::Interrupted(e.to_string()))
            }
        }
    }
}

impl Inner {
    fn snapshot(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Forget the previous operation's error; a new operation is starting
    fn clear_error(&self) {
        self.status.send_if_modified(|s| s.last_error.take().is_some());
    }

    async fn connect(
        &self,
        lifecycle: &mut Lifecycle,
        endpoint: Endpoint,
        keys: Option<KeyMaterial>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let current = self.snapshot();

        if current.state.is_connected() {
            let same = current
                .connected_endpoint
                .as_ref()
                .is_some_and(|e| e.same_server(&endpoint));
            if same {
                debug!("Already connected to {}", endpoint);
                return Ok(());
            }

            info!(
                "Switching from {} to {}",
                current
                    .connected_endpoint
                    .as_ref()
                    .map(|e| e.country_label.as_str())
                    .unwrap_or("-"),
                endpoint
            );
            let keys = keys.or_else(|| lifecycle.keys.clone());
            self.clear_error();
            // A teardown failure here stays in last_error
            self.disconnect(lifecycle).await;
            return self.bring_up(lifecycle, endpoint, keys, timeout).await;
        }

        self.clear_error();
        self.bring_up(lifecycle, endpoint, keys, timeout).await
    }

    async fn bring_up(
        &self,
        lifecycle: &mut Lifecycle,
        endpoint: Endpoint,
        keys: Option<KeyMaterial>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        info!("Connecting to {}", endpoint);
        self.status.send_modify(|s| {
            s.state = SessionState::Connecting;
            s.connected_endpoint = Some(endpoint.clone());
            s.reset_counters();
        });

        let cause = match tokio::time::timeout(timeout, self.establish(&endpoint, keys)).await {
            Ok(Ok((keys, profile))) => {
                // An issued profile may point at another server than requested
                let actual = profile.endpoint().clone();
                if !actual.same_server(&endpoint) {
                    warn!(
                        "Tunnel for {} goes to {}",
                        endpoint.country_label, actual.network_address
                    );
                }

                lifecycle.keys = Some(keys);
                lifecycle.profile = Some(profile);
                self.status.send_modify(|s| {
                    s.state = SessionState::Connected;
                    s.connected_endpoint = Some(actual.clone());
                    s.reset_counters();
                });
                self.start_ticker(&mut lifecycle.ticker);

                info!("Connected to {}", actual);
                return Ok(());
            }
            Ok(Err(cause)) => cause,
            Err(_) => ConnectError::Timeout(timeout),
        };

        // A timed-out establish may have been cut off halfway
        let may_be_up = match &cause {
            ConnectError::Timeout(_) => true,
            ConnectError::Backend(_) => !self.backend.cleans_up_on_failure(),
            _ => false,
        };
        if may_be_up {
            if let Err(e) = self.backend.teardown().await {
                warn!("Teardown after failed connect also failed: {}", e);
            }
        }

        error!("Connect to {} failed: {}", endpoint, cause);
        self.status.send_modify(|s| {
            s.state = SessionState::Failed;
            s.last_error = Some(cause.to_string());
        });
        self.status.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.connected_endpoint = None;
        });

        Err(SessionError::Connect {
            endpoint: endpoint.country_label,
            cause,
        })
    }

    /// Keys, profile and backend establish
    async fn establish(
        &self,
        endpoint: &Endpoint,
        keys: Option<KeyMaterial>,
    ) -> Result<(KeyMaterial, TunnelProfile), ConnectError> {
        let keys = match keys {
            Some(keys) => keys,
            None => {
                debug!("Requesting client keys");
                self.provisioner.request_keys().await?
            }
        };

        let profile = match self.profile_source {
            ProfileSource::Local => {
                let address = self.pool.allocate(&mut rand::thread_rng());
                debug!("Allocated client address {} from {}", address, self.pool);
                self.builder.build(&keys, endpoint, address, &self.dns)?
            }
            ProfileSource::Remote => {
                debug!("Requesting issued profile for {}", endpoint.country_label);
                self.provisioner.request_profile(&keys, endpoint).await?
            }
        };

        self.backend.establish(&profile).await?;
        Ok((keys, profile))
    }

    async fn disconnect(&self, lifecycle: &mut Lifecycle) {
        let current = self.snapshot();
        if current.state == SessionState::Disconnected && !lifecycle.ticker.is_running() {
            debug!("Already disconnected");
            return;
        }

        info!(
            "Disconnecting from {}",
            current
                .connected_endpoint
                .as_ref()
                .map(|e| e.country_label.as_str())
                .unwrap_or("-")
        );
        self.status
            .send_modify(|s| s.state = SessionState::Disconnecting);

        // No tick may land after teardown
        lifecycle.ticker.stop().await;
        lifecycle.keys = None;
        lifecycle.profile = None;

        let teardown = self.backend.teardown().await;
        if let Err(e) = &teardown {
            warn!("Teardown failed: {}", e);
        }

        self.status.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.connected_endpoint = None;
            if let Err(e) = &teardown {
                s.last_error = Some(e.to_string());
            }
        });
        info!("Disconnected");
    }

    fn start_ticker(&self, ticker: &mut StatusTicker) {
        let status = self.status.clone();
        let backend = self.backend.clone();

        ticker.start(move |elapsed| {
            let status = status.clone();
            let backend = backend.clone();
            async move {
                let counters = backend.transfer().await;
                status.send_modify(|s| {
                    if !s.state.is_connected() {
                        return;
                    }
                    s.duration += elapsed;
                    if let Some(c) = counters {
                        s.bytes_received = s.bytes_received.max(c.bytes_received);
                        s.bytes_sent = s.bytes_sent.max(c.bytes_sent);
                    }
                });
                debug!("Status tick ({:?})", elapsed);
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.status.borrow().state;
        if state == SessionState::Disconnected {
            return;
        }

        warn!("Session controller dropped while {}; tearing down", state);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            handle.spawn(async move {
                if let Err(e) = backend.teardown().await {
                    error!("Teardown on drop failed: {}", e);
                }
            });
        }
    }
}
