//! Client Key Material
//!
//! WireGuard key strings as handed out by the issuance service.
//! They are never decoded here, only embedded into profile text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client key pair (private + public)
///
/// Field names match the issuance service's JSON body.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    private_key: String,
    public_key: String,
}

impl KeyMaterial {
    /// Create from the two key strings
    pub fn new(private_key: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
        }
    }

    /// Private key as issued
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Public key as issued
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Both halves present (non-blank)
    pub fn is_complete(&self) -> bool {
        !self.private_key.trim().is_empty() && !self.public_key.trim().is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("private_key", &"[redacted]")
            .field("public_key", &self.public_key)
            .finish()
    }
}
