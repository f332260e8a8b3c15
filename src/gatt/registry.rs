//! Attribute registry and per-service setup state machine.
//!
//! Each logical service is registered with the link stack as its own
//! application, identified by a stable small integer id that doubles as the
//! registration correlation token. Handles arrive one at a time through
//! asynchronous completion events and are bound in a fixed order:
//!
//! ```text
//! Unregistered → Registered → Created → CharAdded → Ready
//! ```
//!
//! A transition never runs if the handle from the previous event is
//! missing. Completions are correlated through explicit maps populated at
//! request time rather than by scanning descriptors for a matching
//! interface.

use std::collections::HashMap;

use log::{debug, error, info, warn};

use super::{ConnParams, GattEvent, GattOps};

/// Logical services exposed over the link, one writable attribute each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    /// Network name (SSID) to join.
    NetworkName,
    /// Network secret (passphrase).
    NetworkSecret,
    /// Message payload to deliver once the link is up.
    Message,
    /// Join trigger; the write payload is ignored.
    ConnectTrigger,
}

impl ServiceId {
    /// All services in registration order.
    pub const ALL: [ServiceId; 4] = [
        ServiceId::NetworkName,
        ServiceId::NetworkSecret,
        ServiceId::Message,
        ServiceId::ConnectTrigger,
    ];

    /// Stable small integer id, used as the registration correlation
    /// token. Never reused.
    pub fn logical_id(self) -> u16 {
        match self {
            Self::NetworkName => 0,
            Self::NetworkSecret => 1,
            Self::Message => 2,
            Self::ConnectTrigger => 3,
        }
    }

    fn index(self) -> usize {
        self.logical_id() as usize
    }
}

/// Client-configuration descriptor UUID, shared by every service.
pub const CLIENT_CONFIG_UUID: u16 = 0x2902;

/// Fixed 16-bit identifiers per service: (service UUID, characteristic UUID).
const UUID_TABLE: [(ServiceId, u16, u16); 4] = [
    (ServiceId::NetworkName, 0x00A0, 0x00A1),
    (ServiceId::NetworkSecret, 0x00B0, 0x00B1),
    (ServiceId::Message, 0x00C0, 0x00C1),
    (ServiceId::ConnectTrigger, 0x00D0, 0x00D1),
];

/// Service UUIDs carried in the advertisement payload.
pub fn advertised_uuids() -> Vec<u16> {
    UUID_TABLE.iter().map(|&(_, service, _)| service).collect()
}

/// Connection parameters negotiated on every peer connect.
pub const PEER_CONN_PARAMS: ConnParams = ConnParams {
    min_interval: 0x10,
    max_interval: 0x20,
    latency: 0,
    supervision_timeout: 400,
};

/// Setup progress of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SetupState {
    Unregistered,
    Registered,
    Created,
    CharAdded,
    Ready,
}

/// One logical service and its asynchronously assigned handles.
///
/// Owned exclusively by the [`ServiceRegistry`]; callers read descriptors,
/// lifecycle fields are only mutated by registry event handling.
#[derive(Debug)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub service_uuid: u16,
    pub characteristic_uuid: u16,
    pub descriptor_uuid: u16,
    state: SetupState,
    interface: Option<u16>,
    service_handle: Option<u16>,
    characteristic_handle: Option<u16>,
    descriptor_handle: Option<u16>,
    connection: Option<u16>,
}

impl ServiceDescriptor {
    fn new(id: ServiceId, service_uuid: u16, characteristic_uuid: u16) -> Self {
        Self {
            id,
            service_uuid,
            characteristic_uuid,
            descriptor_uuid: CLIENT_CONFIG_UUID,
            state: SetupState::Unregistered,
            interface: None,
            service_handle: None,
            characteristic_handle: None,
            descriptor_handle: None,
            connection: None,
        }
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    pub fn interface(&self) -> Option<u16> {
        self.interface
    }

    pub fn service_handle(&self) -> Option<u16> {
        self.service_handle
    }

    pub fn characteristic_handle(&self) -> Option<u16> {
        self.characteristic_handle
    }

    pub fn descriptor_handle(&self) -> Option<u16> {
        self.descriptor_handle
    }

    /// Connection id of the active peer link, if any.
    pub fn connection(&self) -> Option<u16> {
        self.connection
    }

    /// Writes are accepted once setup has run to completion.
    pub fn is_ready(&self) -> bool {
        self.state == SetupState::Ready
    }
}

/// Owned table of service descriptors plus the correlation state for
/// in-flight setup requests.
pub struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
    /// Correlation token → service, populated when registration is
    /// requested.
    pending_registration: HashMap<u16, ServiceId>,
    /// Interface handle → service, populated when registration completes.
    by_interface: HashMap<u16, ServiceId>,
    device_name: String,
    name_set: bool,
}

impl ServiceRegistry {
    pub fn new(device_name: impl Into<String>) -> Self {
        let services = UUID_TABLE
            .iter()
            .map(|&(id, service_uuid, char_uuid)| ServiceDescriptor::new(id, service_uuid, char_uuid))
            .collect();
        Self {
            services,
            pending_registration: HashMap::new(),
            by_interface: HashMap::new(),
            device_name: device_name.into(),
            name_set: false,
        }
    }

    /// Request registration of every service, once, at startup.
    ///
    /// A failed registration call is logged and that service stays
    /// `Unregistered`; the remaining services still register.
    pub fn register_all(&mut self, ops: &mut dyn GattOps) {
        for id in ServiceId::ALL {
            let app_id = id.logical_id();
            self.pending_registration.insert(app_id, id);
            if let Err(e) = ops.register_app(app_id) {
                error!("registration request for {:?} failed: {}", id, e);
                self.pending_registration.remove(&app_id);
            }
        }
    }

    pub fn descriptor(&self, id: ServiceId) -> &ServiceDescriptor {
        &self.services[id.index()]
    }

    /// Resolve the owning service of an event by its interface handle.
    pub fn resolve_interface(&self, interface: u16) -> Option<ServiceId> {
        self.by_interface.get(&interface).copied()
    }

    /// Advance the setup state machine for one completion event.
    ///
    /// Connection events are cross-cutting and recorded against every
    /// service; a single physical link serves all of them.
    pub fn handle_event(&mut self, ops: &mut dyn GattOps, event: &GattEvent) {
        match *event {
            GattEvent::Registered { app_id, interface } => {
                self.on_registered(ops, app_id, interface)
            }
            GattEvent::ServiceCreated {
                interface,
                service_handle,
            } => self.on_service_created(ops, interface, service_handle),
            GattEvent::CharacteristicAdded {
                interface,
                attr_handle,
            } => self.on_characteristic_added(ops, interface, attr_handle),
            GattEvent::DescriptorAdded {
                interface,
                attr_handle,
            } => self.on_descriptor_added(interface, attr_handle),
            GattEvent::Connected { conn_id } => self.on_connected(ops, conn_id),
            GattEvent::Disconnected { conn_id } => self.on_disconnected(conn_id),
            // Write traffic is handled by the attribute server, not here.
            GattEvent::Write { .. } | GattEvent::ExecuteWrite { .. } => {}
        }
    }

    fn on_registered(&mut self, ops: &mut dyn GattOps, app_id: u16, interface: u16) {
        let Some(id) = self.pending_registration.remove(&app_id) else {
            warn!("registration completion for unknown app id {}", app_id);
            return;
        };

        let service = &mut self.services[id.index()];
        if service.state != SetupState::Unregistered {
            warn!("{:?}: duplicate registration completion ignored", id);
            return;
        }
        service.interface = Some(interface);
        service.state = SetupState::Registered;
        self.by_interface.insert(interface, id);
        debug!("{:?}: registered, interface {}", id, interface);

        // The link name belongs to the device, not a service; set it on
        // the first registration only.
        if !self.name_set {
            if let Err(e) = ops.set_device_name(&self.device_name) {
                error!("setting device name failed: {}", e);
            } else {
                self.name_set = true;
            }
        }

        let (uuid, app_id) = (self.services[id.index()].service_uuid, id.logical_id());
        if let Err(e) = ops.create_service(interface, uuid, app_id) {
            error!("{:?}: service creation request failed: {}", id, e);
        }
    }

    fn on_service_created(&mut self, ops: &mut dyn GattOps, interface: u16, handle: u16) {
        let Some(id) = self.resolve_interface(interface) else {
            warn!("service-created for unknown interface {}", interface);
            return;
        };

        let service = &mut self.services[id.index()];
        if service.state != SetupState::Registered {
            warn!(
                "{:?}: service-created in state {:?} ignored",
                id, service.state
            );
            return;
        }
        service.service_handle = Some(handle);
        service.state = SetupState::Created;
        debug!("{:?}: service handle {}", id, handle);

        if let Err(e) = ops.start_service(handle) {
            error!("{:?}: service start failed: {}", id, e);
            return;
        }
        let char_uuid = self.services[id.index()].characteristic_uuid;
        if let Err(e) = ops.add_characteristic(handle, char_uuid) {
            error!("{:?}: characteristic add request failed: {}", id, e);
        }
    }

    fn on_characteristic_added(&mut self, ops: &mut dyn GattOps, interface: u16, handle: u16) {
        let Some(id) = self.resolve_interface(interface) else {
            warn!("characteristic-added for unknown interface {}", interface);
            return;
        };

        let service = &mut self.services[id.index()];
        if service.state != SetupState::Created {
            warn!(
                "{:?}: characteristic-added in state {:?} ignored",
                id, service.state
            );
            return;
        }
        let Some(service_handle) = service.service_handle else {
            // State machine guarantees this; refuse to advance without it.
            error!("{:?}: characteristic-added with no service handle", id);
            return;
        };
        service.characteristic_handle = Some(handle);
        service.state = SetupState::CharAdded;
        debug!("{:?}: characteristic handle {}", id, handle);

        if let Err(e) = ops.add_descriptor(service_handle, CLIENT_CONFIG_UUID) {
            error!("{:?}: descriptor add request failed: {}", id, e);
        }
    }

    fn on_descriptor_added(&mut self, interface: u16, handle: u16) {
        let Some(id) = self.resolve_interface(interface) else {
            warn!("descriptor-added for unknown interface {}", interface);
            return;
        };

        let service = &mut self.services[id.index()];
        if service.state != SetupState::CharAdded {
            warn!(
                "{:?}: descriptor-added in state {:?} ignored",
                id, service.state
            );
            return;
        }
        service.descriptor_handle = Some(handle);
        service.state = SetupState::Ready;
        info!("{:?}: ready, accepting writes", id);
    }

    fn on_connected(&mut self, ops: &mut dyn GattOps, conn_id: u16) {
        info!("peer connected, conn id {}", conn_id);
        for service in &mut self.services {
            service.connection = Some(conn_id);
        }
        if let Err(e) = ops.update_conn_params(conn_id, &PEER_CONN_PARAMS) {
            error!("connection parameter update failed: {}", e);
        }
    }

    fn on_disconnected(&mut self, conn_id: u16) {
        info!("peer disconnected, conn id {}", conn_id);
        for service in &mut self.services {
            service.connection = None;
        }
    }
}
