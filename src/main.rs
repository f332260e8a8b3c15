//! Provision-rs ESP32 firmware binary.

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();

    // Initialize ESP-IDF logger for log crate integration
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("=== Provision-rs ESP32 starting ===");

    if let Err(e) = esp32::run() {
        log::error!("startup failed: {}", e);
    }
}

#[cfg(feature = "esp32")]
mod esp32 {
    use std::error::Error;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::bt::BtDriver;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::WifiEvent;
    use log::info;

    use provision_rs_esp32::creds::NvsStore;
    use provision_rs_esp32::delivery::HttpDelivery;
    use provision_rs_esp32::gatt::registry::advertised_uuids;
    use provision_rs_esp32::gatt::server::GattServer;
    use provision_rs_esp32::net::wifi::WifiJoiner;
    use provision_rs_esp32::{
        AdvPayload, Advertiser, AttributeServer, ConnectivityGate, ConnectivityManager,
        Orchestrator,
    };

    /// Name the device advertises under.
    const DEVICE_NAME: &str = "ESP32-PROVISION";

    /// Stack size for the application task; delivery runs TLS in here.
    const APP_TASK_STACK: usize = 12 * 1024;

    pub fn run() -> Result<(), Box<dyn Error>> {
        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let nvs_partition = EspDefaultNvsPartition::take()?;

        // The modem serves both radios.
        let (wifi_modem, bt_modem) = peripherals.modem.split();

        let gate = Arc::new(ConnectivityGate::new());
        let joiner = WifiJoiner::new(wifi_modem, sysloop.clone())?;
        let manager = Arc::new(ConnectivityManager::new(joiner, gate.clone()));
        let store = NvsStore::open(nvs_partition.clone())?;
        let (orchestrator, tasks) = Orchestrator::new(Box::new(store), gate, manager);

        // Established-link drops come in through the system event loop and
        // feed the bounded rejoin policy.
        let watcher = orchestrator.clone();
        let _wifi_events = sysloop.subscribe::<WifiEvent, _>(move |event| {
            if matches!(event, WifiEvent::StaDisconnected(_)) {
                watcher.notify_link_drop();
            }
        })?;

        // The application task owns every blocking wait in the system.
        let app = orchestrator.clone();
        thread::Builder::new()
            .name("provision-app".into())
            .stack_size(APP_TASK_STACK)
            .spawn(move || {
                let mut delivery = HttpDelivery::new();
                app.run(tasks, &mut delivery);
            })?;

        let driver = Arc::new(BtDriver::new(bt_modem, Some(nvs_partition))?);
        let advertiser = Advertiser::new(AdvPayload::new(DEVICE_NAME, advertised_uuids()));
        let server = AttributeServer::new(advertiser, orchestrator);
        let _gatt = GattServer::start(driver, server)?;

        info!("provisioning surface up, advertising as '{}'", DEVICE_NAME);

        loop {
            thread::sleep(Duration::from_secs(10));
            log::debug!("heartbeat");
        }
    }
}

// Host: just initialize env_logger and explain how to use the crate
#[cfg(not(feature = "esp32"))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("host build without the 'esp32' feature; no radios available");
    println!("This binary requires the 'esp32' feature.");
    println!("Use 'cargo test' for host testing.");
}
