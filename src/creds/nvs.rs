//! NVS-backed credential store.
//!
//! Persists provisioning keys in ESP32 Non-Volatile Storage so they
//! survive reboots. Each credential lives under its own key in the
//! [`STORE_NAMESPACE`](super::STORE_NAMESPACE) namespace.

use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_sys::EspError;

use super::{CredentialStore, StoreError, MAX_SECRET_LEN, STORE_NAMESPACE};

/// Largest value any persisted key can hold; only the two credential
/// keys are stored, and the secret carries the wider bound.
const MAX_VALUE_LEN: usize = MAX_SECRET_LEN;

/// Credential store over the default NVS partition.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    /// Open (or create) the provisioning namespace on the given
    /// partition. The partition handle is shared with the link stack,
    /// so it is passed in rather than taken here.
    pub fn open(partition: EspNvsPartition<NvsDefault>) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, STORE_NAMESPACE, true)?;
        Ok(Self { nvs })
    }
}

impl CredentialStore for NvsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut buf = [0u8; MAX_VALUE_LEN];
        match self.nvs.get_raw(key, &mut buf) {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::new(format!("nvs get {}: {:?}", key, e))),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.nvs
            .set_raw(key, value)
            .map_err(|e| StoreError::new(format!("nvs set {}: {:?}", key, e)))?;
        Ok(())
    }
}
