//! Credential persistence capability.
//!
//! Absence of a key is a distinct "not provisioned" condition and is
//! reported as `Ok(None)`, never folded into the failure case.

use std::collections::HashMap;
use std::fmt;

/// Access to the underlying store failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Backend-specific description.
    pub reason: String,
}

impl StoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "credential store failure: {}", self.reason)
    }
}

impl std::error::Error for StoreError {}

/// Durable key/value persistence for provisioning data.
pub trait CredentialStore: Send {
    /// Read a key. `Ok(None)` means the key was never written.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a key durably.
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store used on the host and in tests.
pub struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
    fail_reads: bool,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fail_reads: false,
            fail_writes: false,
        }
    }

    /// Make every subsequent read fail, for exercising the failure path.
    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.fail_reads {
            return Err(StoreError::new("injected read failure"));
        }
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::new("injected write failure"));
        }
        self.entries.insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}
