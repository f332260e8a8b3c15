//! Provisioned credentials.
//!
//! Network name and secret are bounded byte strings persisted through the
//! [`store::CredentialStore`] capability and mirrored in memory by the
//! orchestrator. The in-memory copies are zeroed on drop.

mod store;

#[cfg(feature = "esp32")]
pub mod nvs;

pub use store::{CredentialStore, MemoryStore, StoreError};

#[cfg(feature = "esp32")]
pub use nvs::NvsStore;

use std::fmt;

use zeroize::ZeroizeOnDrop;

/// Storage namespace for all provisioning keys.
pub const STORE_NAMESPACE: &str = "provision";

/// Storage key for the network name.
pub const KEY_NETWORK_NAME: &str = "net_name";

/// Storage key for the network secret.
pub const KEY_NETWORK_SECRET: &str = "net_secret";

/// Maximum network name length (IEEE 802.11 SSID bound).
pub const MAX_NAME_LEN: usize = 32;

/// Maximum network secret length (WPA2 passphrase bound).
pub const MAX_SECRET_LEN: usize = 64;

/// In-memory copy of the provisioned credentials.
///
/// Owned by the orchestrator and refreshed from storage before each
/// connect attempt. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct StoredCredentials {
    pub name: String,
    pub secret: String,
}

impl StoredCredentials {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }
}

// Manual Debug so the secret never lands in a log line.
impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A credential write from the peer failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    Empty,
    TooLong { len: usize, max: usize },
    InvalidUtf8,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "credential is empty"),
            Self::TooLong { len, max } => {
                write!(f, "credential too long: {} bytes (max {})", len, max)
            }
            Self::InvalidUtf8 => write!(f, "credential is not valid UTF-8"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Validate a peer-written network name.
pub fn validate_name(raw: &[u8]) -> Result<&str, CredentialError> {
    validate_bounded(raw, MAX_NAME_LEN)
}

/// Validate a peer-written network secret.
pub fn validate_secret(raw: &[u8]) -> Result<&str, CredentialError> {
    validate_bounded(raw, MAX_SECRET_LEN)
}

fn validate_bounded(raw: &[u8], max: usize) -> Result<&str, CredentialError> {
    if raw.is_empty() {
        return Err(CredentialError::Empty);
    }
    if raw.len() > max {
        return Err(CredentialError::TooLong { len: raw.len(), max });
    }
    std::str::from_utf8(raw).map_err(|_| CredentialError::InvalidUtf8)
}
