//! Bluedroid GATT backend.
//!
//! Implements the [`GattOps`]/[`AdvertisingOps`] boundary over ESP-IDF's
//! Bluedroid bindings and translates raw stack callbacks into
//! [`GattEvent`]s for the [`AttributeServer`]. Callbacks run in the
//! Bluedroid task; everything here must return quickly, which the server
//! guarantees by handing blocking work to the application task.
//!
//! Requires sdkconfig: `CONFIG_BT_ENABLED=y`, `CONFIG_BT_BLUEDROID_ENABLED=y`,
//! `CONFIG_BTDM_CTRL_MODE_BLE_ONLY=y`.

use std::sync::{Arc, Mutex};

use esp_idf_svc::bt::ble::gap::{AdvConfiguration, BleGapEvent, EspBleGap};
use esp_idf_svc::bt::ble::gatt::server::{EspGatts, GattsEvent};
use esp_idf_svc::bt::ble::gatt::{
    AutoResponse, GattCharacteristic, GattDescriptor, GattId, GattResponse, GattServiceId,
    GattStatus, Permission, Property,
};
use esp_idf_svc::bt::{BdAddr, Ble, BtDriver, BtUuid};
use esp_idf_sys::{esp, EspError};
use log::{debug, error, warn};

use super::reassembly::{FragmentAck, WriteStatus, PREPARE_BUF_CAPACITY};
use super::{AttributeServer, ConnParams, GattEvent, GattOps, LinkError};
use crate::advertiser::{AdvPayload, AdvertisingOps};

/// Attribute table slots reserved per service (service + characteristic
/// + client-config descriptor, with headroom).
const HANDLES_PER_SERVICE: u16 = 8;

type Driver = Arc<BtDriver<'static, Ble>>;

fn link_err(op: &'static str) -> impl Fn(EspError) -> LinkError {
    move |e| LinkError { op, code: e.code() }
}

fn to_gatt_status(status: WriteStatus) -> GattStatus {
    match status {
        WriteStatus::Success => GattStatus::Ok,
        WriteStatus::InvalidLength => GattStatus::InvalidAttrLen,
        WriteStatus::InsufficientResources => GattStatus::InsufResource,
        WriteStatus::NotPermitted => GattStatus::WriteNotPermit,
    }
}

/// Link-stack surface backed by Bluedroid GAP + GATTS.
pub struct EspLinkStack {
    gap: Arc<EspBleGap<'static, Ble, Driver>>,
    gatts: Arc<EspGatts<'static, Ble, Driver>>,
    /// Address of the single supported peer, kept for connection
    /// parameter updates.
    peer: Mutex<Option<BdAddr>>,
}

impl GattOps for EspLinkStack {
    fn register_app(&mut self, app_id: u16) -> Result<(), LinkError> {
        self.gatts
            .register_app(app_id)
            .map_err(link_err("register_app"))
    }

    fn set_device_name(&mut self, name: &str) -> Result<(), LinkError> {
        self.gap
            .set_device_name(name)
            .map_err(link_err("set_device_name"))
    }

    fn create_service(&mut self, interface: u16, uuid: u16, _app_id: u16) -> Result<(), LinkError> {
        let service_id = GattServiceId {
            id: GattId {
                uuid: BtUuid::uuid16(uuid),
                inst_id: 0,
            },
            is_primary: true,
        };
        self.gatts
            .create_service(interface as _, &service_id, HANDLES_PER_SERVICE)
            .map_err(link_err("create_service"))
    }

    fn start_service(&mut self, service_handle: u16) -> Result<(), LinkError> {
        self.gatts
            .start_service(service_handle)
            .map_err(link_err("start_service"))
    }

    fn add_characteristic(&mut self, service_handle: u16, uuid: u16) -> Result<(), LinkError> {
        let characteristic = GattCharacteristic::new(
            BtUuid::uuid16(uuid),
            Permission::Write,
            Property::Write,
            PREPARE_BUF_CAPACITY,
            AutoResponse::ByApp,
        );
        // Placeholder value; the attribute is write-only.
        self.gatts
            .add_characteristic(service_handle, &characteristic, &[0])
            .map_err(link_err("add_characteristic"))
    }

    fn add_descriptor(&mut self, service_handle: u16, uuid: u16) -> Result<(), LinkError> {
        let descriptor = GattDescriptor::new(
            BtUuid::uuid16(uuid),
            Permission::Read | Permission::Write,
        );
        self.gatts
            .add_descriptor(service_handle, &descriptor)
            .map_err(link_err("add_descriptor"))
    }

    fn send_write_response(
        &mut self,
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        status: WriteStatus,
        ack: Option<FragmentAck>,
    ) -> Result<(), LinkError> {
        let mut response = GattResponse::new();
        if let Some(ack) = &ack {
            response
                .attr_handle(ack.handle)
                .auth_req(0)
                .offset(ack.offset)
                .value(&ack.value)
                .map_err(link_err("build_response"))?;
        }
        self.gatts
            .send_response(
                interface as _,
                conn_id as _,
                trans_id as _,
                to_gatt_status(status),
                ack.as_ref().map(|_| &response),
            )
            .map_err(link_err("send_response"))
    }

    fn update_conn_params(&mut self, _conn_id: u16, params: &ConnParams) -> Result<(), LinkError> {
        let Some(peer) = *self.peer.lock().unwrap() else {
            return Err(LinkError {
                op: "update_conn_params",
                code: 0,
            });
        };
        let raw = esp_idf_sys::esp_ble_conn_update_params_t {
            bda: peer.into(),
            min_int: params.min_interval,
            max_int: params.max_interval,
            latency: params.latency,
            timeout: params.supervision_timeout,
        };
        esp!(unsafe {
            esp_idf_sys::esp_ble_gap_update_conn_params(&raw as *const _ as *mut _)
        })
        .map_err(link_err("update_conn_params"))
    }
}

impl AdvertisingOps for EspLinkStack {
    fn start_advertising(&mut self, payload: &AdvPayload) -> Result<(), LinkError> {
        // Advertising proper starts when the configured event arrives.
        self.gap
            .set_adv_conf(&AdvConfiguration {
                include_name: true,
                include_txpower: true,
                flag: 2,
                service_uuid: payload.service_uuids().first().map(|&u| BtUuid::uuid16(u)),
                ..Default::default()
            })
            .map_err(link_err("set_adv_conf"))
    }

    fn stop_advertising(&mut self) -> Result<(), LinkError> {
        self.gap
            .stop_advertising()
            .map_err(link_err("stop_advertising"))
    }
}

/// The attribute server bound to the Bluedroid stack.
pub struct GattServer {
    stack: Arc<Mutex<EspLinkStack>>,
    server: Arc<Mutex<AttributeServer>>,
}

impl GattServer {
    /// Bring up GAP and GATTS, subscribe the callbacks and start the
    /// attribute server.
    pub fn start(driver: Driver, server: AttributeServer) -> Result<Arc<Self>, EspError> {
        let gap = Arc::new(EspBleGap::new(driver.clone())?);
        let gatts = Arc::new(EspGatts::new(driver)?);

        let this = Arc::new(Self {
            stack: Arc::new(Mutex::new(EspLinkStack {
                gap: gap.clone(),
                gatts: gatts.clone(),
                peer: Mutex::new(None),
            })),
            server: Arc::new(Mutex::new(server)),
        });

        let gap_server = this.clone();
        gap.subscribe(move |event| gap_server.on_gap_event(event))?;

        let gatts_server = this.clone();
        gatts.subscribe(move |(gatt_if, event)| {
            gatts_server.on_gatts_event(gatt_if as u16, event)
        })?;

        let mut stack = this.stack.lock().unwrap();
        this.server.lock().unwrap().start(&mut *stack);
        drop(stack);

        Ok(this)
    }

    fn on_gap_event(&self, event: BleGapEvent) {
        if let BleGapEvent::AdvertisingConfigured(status) = event {
            if status.is_ok() {
                if let Err(e) = self.stack.lock().unwrap().gap.start_advertising() {
                    error!("starting advertising failed: {:?}", e);
                }
            } else {
                error!("advertising configuration failed: {:?}", status);
            }
        }
    }

    fn on_gatts_event(&self, interface: u16, event: GattsEvent) {
        let Some(translated) = self.translate(interface, event) else {
            return;
        };
        let mut stack = self.stack.lock().unwrap();
        self.server
            .lock()
            .unwrap()
            .handle_event(&mut *stack, translated);
    }

    fn translate(&self, interface: u16, event: GattsEvent) -> Option<GattEvent> {
        match event {
            GattsEvent::ServiceRegistered { status, app_id } => {
                if status != GattStatus::Ok {
                    error!("registration of app {} failed: {:?}", app_id, status);
                    return None;
                }
                Some(GattEvent::Registered { app_id, interface })
            }
            GattsEvent::ServiceCreated {
                status,
                service_handle,
                ..
            } => {
                if status != GattStatus::Ok {
                    error!("service creation failed: {:?}", status);
                    return None;
                }
                Some(GattEvent::ServiceCreated {
                    interface,
                    service_handle,
                })
            }
            GattsEvent::CharacteristicAdded {
                status, attr_handle, ..
            } => {
                if status != GattStatus::Ok {
                    error!("characteristic add failed: {:?}", status);
                    return None;
                }
                Some(GattEvent::CharacteristicAdded {
                    interface,
                    attr_handle,
                })
            }
            GattsEvent::DescriptorAdded {
                status, attr_handle, ..
            } => {
                if status != GattStatus::Ok {
                    error!("descriptor add failed: {:?}", status);
                    return None;
                }
                Some(GattEvent::DescriptorAdded {
                    interface,
                    attr_handle,
                })
            }
            GattsEvent::PeerConnected { conn_id, addr, .. } => {
                *self.stack.lock().unwrap().peer.lock().unwrap() = Some(addr);
                Some(GattEvent::Connected {
                    conn_id: conn_id as u16,
                })
            }
            GattsEvent::PeerDisconnected { conn_id, .. } => {
                *self.stack.lock().unwrap().peer.lock().unwrap() = None;
                Some(GattEvent::Disconnected {
                    conn_id: conn_id as u16,
                })
            }
            GattsEvent::Write {
                conn_id,
                trans_id,
                handle,
                offset,
                need_rsp,
                is_prep,
                value,
                ..
            } => Some(GattEvent::Write {
                interface,
                conn_id: conn_id as u16,
                trans_id: trans_id as u32,
                attr_handle: handle,
                offset,
                value: value.to_vec(),
                is_prepared: is_prep,
                response_needed: need_rsp,
            }),
            GattsEvent::ExecWrite {
                conn_id,
                trans_id,
                canceled,
                ..
            } => Some(GattEvent::ExecuteWrite {
                interface,
                conn_id: conn_id as u16,
                trans_id: trans_id as u32,
                commit: !canceled,
                response_needed: true,
            }),
            GattsEvent::Mtu { mtu, .. } => {
                debug!("peer negotiated mtu {}", mtu);
                None
            }
            other => {
                warn!("unhandled gatts event: {:?}", other);
                None
            }
        }
    }
}
