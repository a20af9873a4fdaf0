//! Key Provisioning
//!
//! Client side of the issuance service that hands out client key pairs
//! and, optionally, server-rendered profiles. Requests are never retried
//! here; the caller decides.

mod http;

pub use http::{HttpKeyProvisioner, HttpProvisionerConfig};

use crate::endpoint::Endpoint;
use crate::keys::KeyMaterial;
use crate::profile::{ClientAddress, ProfileBuilder, TunnelProfile, ValidationError};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Issuance service failures, with the cause attached
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Invalid issuance URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Issuance service returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedBody(String),

    #[error("Issued profile rejected: {0}")]
    InvalidProfile(#[from] ValidationError),
}

/// Source of client keys and server-rendered profiles
#[async_trait]
pub trait KeyProvisioner: Send + Sync {
    /// Request a fresh client key pair
    async fn request_keys(&self) -> Result<KeyMaterial, ProvisioningError>;

    /// Request a profile rendered by the service for `endpoint`
    async fn request_profile(
        &self,
        keys: &KeyMaterial,
        endpoint: &Endpoint,
    ) -> Result<TunnelProfile, ProvisioningError>;
}

/// Off-device provisioner
///
/// Keys are base64 encodings of 32 random bytes. They are placeholders
/// with no curve relationship between the halves, which is all a
/// simulated tunnel needs. Profiles are rendered locally with the
/// service's fixed client address and resolvers.
#[derive(Default)]
pub struct SimulatedProvisioner {
    failure: Mutex<Option<ProvisioningError>>,
    requests: AtomicU64,
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every following request with `error`
    pub fn fail_with(&self, error: ProvisioningError) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    pub fn heal(&self) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Requests served or refused so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), ProvisioningError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn random_key() -> String {
    BASE64.encode(rand::random::<[u8; 32]>())
}

#[async_trait]
impl KeyProvisioner for SimulatedProvisioner {
    async fn request_keys(&self) -> Result<KeyMaterial, ProvisioningError> {
        self.check()?;
        debug!("Issuing simulated key pair");
        Ok(KeyMaterial::new(random_key(), random_key()))
    }

    async fn request_profile(
        &self,
        keys: &KeyMaterial,
        endpoint: &Endpoint,
    ) -> Result<TunnelProfile, ProvisioningError> {
        self.check()?;

        let address = ClientAddress::new(IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)), 24);
        let dns = [
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
        ];
        Ok(ProfileBuilder::default().build(keys, endpoint, address, &dns)?)
    }
}
