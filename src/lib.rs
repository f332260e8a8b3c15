//! Provision-rs ESP32 firmware library.
//!
//! This library contains platform-independent components that can be tested
//! on the host machine without ESP32 hardware: the attribute-server model,
//! prepared-write reassembly, the connectivity gate and manager, credential
//! validation and the provisioning orchestrator. The ESP-IDF backends
//! (Bluedroid GATT, WiFi, NVS, HTTP) are gated behind the `esp32` feature.

pub mod advertiser;
pub mod creds;
pub mod delivery;
pub mod gate;
pub mod gatt;
pub mod net;
pub mod orchestrator;

// Re-export commonly used items
pub use advertiser::{AdvPayload, Advertiser, AdvertisingOps};
pub use gate::{ConnectivityGate, GateFlag, GateTimeout};
pub use gatt::registry::ServiceId;
pub use gatt::{AttributeServer, GattEvent, GattOps, WriteSink};
pub use net::{ConnectError, ConnectivityManager, NetworkJoiner, MAX_REJOIN_ATTEMPTS};
pub use orchestrator::{Orchestrator, ProvisionError, Task};
