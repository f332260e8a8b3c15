//! Cross-context connectivity gate.
//!
//! Named boolean conditions set from one execution context (link-stack or
//! network-stack callbacks) and awaited from another (the application task).
//! Every wait takes a finite timeout; a caller that would previously have
//! stalled forever now gets a typed [`GateTimeout`] back.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Conditions the gate tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateFlag {
    /// Credentials have been read back from persistent storage.
    CredentialsLoaded,
    /// The network link is up and an address has been acquired.
    LinkUp,
}

impl GateFlag {
    fn bit(self) -> u8 {
        match self {
            Self::CredentialsLoaded => 0x01,
            Self::LinkUp => 0x02,
        }
    }
}

impl fmt::Display for GateFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialsLoaded => write!(f, "credentials-loaded"),
            Self::LinkUp => write!(f, "link-up"),
        }
    }
}

/// A bounded wait on the gate expired before the flag was set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateTimeout {
    /// The flag that was awaited.
    pub flag: GateFlag,
    /// The bound that expired.
    pub waited: Duration,
}

impl fmt::Display for GateTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out after {:?} waiting for {}", self.waited, self.flag)
    }
}

impl std::error::Error for GateTimeout {}

/// Process-wide synchronization point between the link-stack, network-stack
/// and application contexts.
///
/// One instance exists per process, shared via `Arc`.
pub struct ConnectivityGate {
    flags: Mutex<u8>,
    changed: Condvar,
}

impl ConnectivityGate {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    /// Set a flag and wake all waiters.
    pub fn set(&self, flag: GateFlag) {
        let mut flags = self.flags.lock().unwrap();
        *flags |= flag.bit();
        self.changed.notify_all();
    }

    /// Clear a flag. Waiters are woken so they can re-arm against the
    /// remaining time of their bound.
    pub fn clear(&self, flag: GateFlag) {
        let mut flags = self.flags.lock().unwrap();
        *flags &= !flag.bit();
        self.changed.notify_all();
    }

    /// Check a flag without blocking.
    pub fn is_set(&self, flag: GateFlag) -> bool {
        *self.flags.lock().unwrap() & flag.bit() != 0
    }

    /// Block until `flag` is set or `timeout` elapses.
    pub fn wait(&self, flag: GateFlag, timeout: Duration) -> Result<(), GateTimeout> {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock().unwrap();
        while *flags & flag.bit() == 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(GateTimeout { flag, waited: timeout });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(flags, deadline - now)
                .unwrap();
            flags = guard;
        }
        Ok(())
    }
}

impl Default for ConnectivityGate {
    fn default() -> Self {
        Self::new()
    }
}
