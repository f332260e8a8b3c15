//! ESP-IDF WiFi joiner.
//!
//! Wraps the blocking ESP-IDF WiFi driver behind [`NetworkJoiner`]. Runs
//! in the application task context; the driver's own event loop delivers
//! disconnect notifications, which the bootstrap wires to
//! [`ConnectivityManager::handle_link_drop`](super::ConnectivityManager::handle_link_drop).

use esp_idf_hal::modem::WifiModemPeripheral;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::EspError;
use log::info;

use super::{JoinError, NetworkJoiner};

/// WiFi-backed network joiner.
pub struct WifiJoiner<'a> {
    wifi: BlockingWifi<EspWifi<'a>>,
    started: bool,
}

impl<'a> WifiJoiner<'a> {
    pub fn new<M: WifiModemPeripheral>(
        modem: impl Peripheral<P = M> + 'a,
        sysloop: EspSystemEventLoop,
    ) -> Result<Self, EspError> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), None)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Self {
            wifi,
            started: false,
        })
    }
}

impl<'a> NetworkJoiner for WifiJoiner<'a> {
    fn join(&mut self, name: &str, secret: &str) -> Result<std::net::IpAddr, JoinError> {
        info!("joining '{}'", name);

        let config = Configuration::Client(ClientConfiguration {
            ssid: name.try_into().map_err(|_| JoinError::InvalidName)?,
            password: secret.try_into().map_err(|_| JoinError::InvalidSecret)?,
            auth_method: AuthMethod::WPA2Personal,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&config)
            .map_err(|e| JoinError::AssociationFailed(format!("{:?}", e)))?;

        if !self.started {
            self.wifi
                .start()
                .map_err(|e| JoinError::AssociationFailed(format!("{:?}", e)))?;
            self.started = true;
        }

        self.wifi
            .connect()
            .map_err(|e| JoinError::AssociationFailed(format!("{:?}", e)))?;

        self.wifi
            .wait_netif_up()
            .map_err(|e| JoinError::AddressFailed(format!("{:?}", e)))?;

        let ip_info = self
            .wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map_err(|e| JoinError::AddressFailed(format!("{:?}", e)))?;

        info!("joined '{}', address {}", name, ip_info.ip);
        Ok(std::net::IpAddr::V4(ip_info.ip))
    }
}
