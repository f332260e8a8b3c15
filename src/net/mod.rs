//! Network join capability and connectivity management.
//!
//! The actual join mechanics (association, DHCP) live behind the
//! [`NetworkJoiner`] trait; [`manager`] layers the connect serialization
//! and bounded rejoin policy on top and signals link state through the
//! connectivity gate.

pub mod manager;

#[cfg(feature = "esp32")]
pub mod wifi;

pub use manager::{ConnectError, ConnectivityManager, MAX_REJOIN_ATTEMPTS};

use std::fmt;
use std::net::IpAddr;

/// One join attempt against the target network.
///
/// Blocking; called only from the application or network-event context,
/// never from link-stack callbacks.
pub trait NetworkJoiner: Send {
    fn join(&mut self, name: &str, secret: &str) -> Result<IpAddr, JoinError>;
}

/// A join attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The network name was rejected by the driver.
    InvalidName,
    /// The secret was rejected by the driver.
    InvalidSecret,
    /// Association with the network failed.
    AssociationFailed(String),
    /// Associated but no address was acquired.
    AddressFailed(String),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid network name"),
            Self::InvalidSecret => write!(f, "invalid network secret"),
            Self::AssociationFailed(reason) => write!(f, "association failed: {}", reason),
            Self::AddressFailed(reason) => write!(f, "address acquisition failed: {}", reason),
        }
    }
}

impl std::error::Error for JoinError {}
