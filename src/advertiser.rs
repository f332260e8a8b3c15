//! Link advertising lifecycle.
//!
//! The advertiser owns the advertising payload and its start/stop state.
//! Exactly one peer link is supported; whenever that peer disconnects,
//! advertising is restarted unconditionally so the companion controller
//! can find the device again.

use log::{error, info};

use crate::gatt::LinkError;

/// Data carried in the advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvPayload {
    device_name: String,
    service_uuids: Vec<u16>,
}

impl AdvPayload {
    pub fn new(device_name: impl Into<String>, service_uuids: Vec<u16>) -> Self {
        Self {
            device_name: device_name.into(),
            service_uuids,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn service_uuids(&self) -> &[u16] {
        &self.service_uuids
    }
}

/// Advertising control exposed by the link-stack backend.
pub trait AdvertisingOps {
    fn start_advertising(&mut self, payload: &AdvPayload) -> Result<(), LinkError>;
    fn stop_advertising(&mut self) -> Result<(), LinkError>;
}

/// Owns the advertising payload and tracks whether advertising is active.
pub struct Advertiser {
    payload: AdvPayload,
    active: bool,
}

impl Advertiser {
    pub fn new(payload: AdvPayload) -> Self {
        Self {
            payload,
            active: false,
        }
    }

    pub fn device_name(&self) -> &str {
        self.payload.device_name()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self, ops: &mut dyn AdvertisingOps) {
        match ops.start_advertising(&self.payload) {
            Ok(()) => {
                self.active = true;
                info!("advertising as '{}'", self.payload.device_name());
            }
            Err(e) => error!("starting advertising failed: {}", e),
        }
    }

    pub fn stop(&mut self, ops: &mut dyn AdvertisingOps) {
        if let Err(e) = ops.stop_advertising() {
            error!("stopping advertising failed: {}", e);
        }
        self.active = false;
    }

    /// Called when the peer disconnects. The restart is unconditional:
    /// the stack stops advertising on its own once a connection forms.
    pub fn restart(&mut self, ops: &mut dyn AdvertisingOps) {
        info!("peer gone, restarting advertising");
        self.start(ops);
    }
}
