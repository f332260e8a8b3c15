//! Attribute server core.
//!
//! Platform-independent model of the GATT-side provisioning surface: the
//! per-service setup state machine ([`registry`]), prepared-write
//! reassembly ([`reassembly`]) and the event pump that ties them to the
//! advertiser and the write dispatcher ([`AttributeServer`]).
//!
//! The link stack itself is reached only through the [`GattOps`] and
//! [`crate::advertiser::AdvertisingOps`] traits; on device these are
//! implemented over ESP-IDF's Bluedroid bindings ([`server`], esp32 only),
//! on the host by test fakes.

pub mod reassembly;
pub mod registry;

#[cfg(feature = "esp32")]
pub mod server;

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::advertiser::{Advertiser, AdvertisingOps};
use reassembly::{FragmentAck, PrepareBuffer, SubmitOutcome, WriteStatus};
use registry::{ServiceId, ServiceRegistry};

/// A link-stack API call reported non-success.
///
/// Per the error policy this aborts the one setup step that issued the
/// call; it is logged and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    /// The API call that failed.
    pub op: &'static str,
    /// Stack-specific status code.
    pub code: i32,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link stack call {} failed with code {}", self.op, self.code)
    }
}

impl std::error::Error for LinkError {}

/// Connection parameters requested after a peer connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

/// Completion notifications and peer traffic delivered by the link stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Registration completed; carries the correlation token and the
    /// assigned interface handle.
    Registered { app_id: u16, interface: u16 },
    /// Service creation completed.
    ServiceCreated { interface: u16, service_handle: u16 },
    /// Characteristic addition completed.
    CharacteristicAdded { interface: u16, attr_handle: u16 },
    /// Client-config descriptor addition completed.
    DescriptorAdded { interface: u16, attr_handle: u16 },
    /// Peer link established.
    Connected { conn_id: u16 },
    /// Peer link torn down.
    Disconnected { conn_id: u16 },
    /// Attribute write from the peer, simple or prepared.
    Write {
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        attr_handle: u16,
        offset: u16,
        value: Vec<u8>,
        is_prepared: bool,
        response_needed: bool,
    },
    /// Execute-write closing a prepared sequence.
    ExecuteWrite {
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        commit: bool,
        response_needed: bool,
    },
}

/// Requests the attribute server issues to the link stack.
pub trait GattOps {
    fn register_app(&mut self, app_id: u16) -> Result<(), LinkError>;
    fn set_device_name(&mut self, name: &str) -> Result<(), LinkError>;
    fn create_service(&mut self, interface: u16, uuid: u16, app_id: u16) -> Result<(), LinkError>;
    fn start_service(&mut self, service_handle: u16) -> Result<(), LinkError>;
    /// Add the writable characteristic. The backend supplies write
    /// permission and a placeholder value.
    fn add_characteristic(&mut self, service_handle: u16, uuid: u16) -> Result<(), LinkError>;
    fn add_descriptor(&mut self, service_handle: u16, uuid: u16) -> Result<(), LinkError>;
    fn send_write_response(
        &mut self,
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        status: WriteStatus,
        ack: Option<FragmentAck>,
    ) -> Result<(), LinkError>;
    fn update_conn_params(&mut self, conn_id: u16, params: &ConnParams) -> Result<(), LinkError>;
}

/// Combined link-stack surface: GATT requests plus advertising control.
pub trait LinkStack: GattOps + AdvertisingOps {}

impl<T: GattOps + AdvertisingOps> LinkStack for T {}

/// Receives completed writes, resolved to their logical service.
///
/// Implementations must not block: the call happens in the link-stack
/// callback context. Action failures are the implementation's to log.
pub trait WriteSink: Send + Sync {
    fn on_write(&self, service: ServiceId, value: &[u8]);
}

/// The multi-service attribute server.
///
/// Pumps link-stack events through the registry and the prepared-write
/// buffer, forwards completed writes to the sink and keeps advertising
/// alive across disconnects.
pub struct AttributeServer {
    registry: ServiceRegistry,
    buffer: PrepareBuffer,
    advertiser: Advertiser,
    sink: Arc<dyn WriteSink>,
}

impl AttributeServer {
    pub fn new(advertiser: Advertiser, sink: Arc<dyn WriteSink>) -> Self {
        Self {
            registry: ServiceRegistry::new(advertiser.device_name().to_owned()),
            buffer: PrepareBuffer::new(),
            advertiser,
            sink,
        }
    }

    /// Startup: register every service and begin advertising.
    pub fn start(&mut self, stack: &mut dyn LinkStack) {
        self.registry.register_all(stack);
        self.advertiser.start(stack);
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Handle one event from the link-stack callback context.
    pub fn handle_event(&mut self, stack: &mut dyn LinkStack, event: GattEvent) {
        match event {
            GattEvent::Write {
                interface,
                conn_id,
                trans_id,
                attr_handle,
                offset,
                ref value,
                is_prepared,
                response_needed,
            } => {
                if is_prepared {
                    self.handle_fragment(
                        stack,
                        interface,
                        conn_id,
                        trans_id,
                        attr_handle,
                        offset,
                        value,
                        response_needed,
                    );
                } else {
                    self.handle_simple_write(
                        stack,
                        interface,
                        conn_id,
                        trans_id,
                        value,
                        response_needed,
                    );
                }
            }
            GattEvent::ExecuteWrite {
                interface,
                conn_id,
                trans_id,
                commit,
                response_needed,
            } => {
                self.handle_execute(stack, interface, conn_id, trans_id, commit, response_needed);
            }
            GattEvent::Disconnected { .. } => {
                self.registry.handle_event(stack, &event);
                // Per-connection state must not leak into the next link.
                self.buffer.reset();
                self.advertiser.restart(stack);
            }
            ref other => self.registry.handle_event(stack, other),
        }
    }

    fn handle_simple_write(
        &mut self,
        stack: &mut dyn LinkStack,
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        value: &[u8],
        response_needed: bool,
    ) {
        let status = match self.registry.resolve_interface(interface) {
            Some(id) => {
                self.sink.on_write(id, value);
                WriteStatus::Success
            }
            None => {
                warn!("write for unknown interface {}", interface);
                WriteStatus::NotPermitted
            }
        };
        if response_needed {
            self.respond(stack, interface, conn_id, trans_id, status, None);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_fragment(
        &mut self,
        stack: &mut dyn LinkStack,
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        attr_handle: u16,
        offset: u16,
        value: &[u8],
        response_needed: bool,
    ) {
        if self.registry.resolve_interface(interface).is_none() {
            warn!("prepared write for unknown interface {}", interface);
            if response_needed {
                self.respond(
                    stack,
                    interface,
                    conn_id,
                    trans_id,
                    WriteStatus::NotPermitted,
                    None,
                );
            }
            return;
        }

        match self.buffer.submit(attr_handle, offset as usize, value) {
            SubmitOutcome::Accepted(ack) => {
                if response_needed {
                    self.respond(
                        stack,
                        interface,
                        conn_id,
                        trans_id,
                        WriteStatus::Success,
                        Some(ack),
                    );
                }
            }
            SubmitOutcome::Rejected(status) => {
                // The rejection status still goes back to the peer.
                if response_needed {
                    self.respond(stack, interface, conn_id, trans_id, status, None);
                }
            }
        }
    }

    fn handle_execute(
        &mut self,
        stack: &mut dyn LinkStack,
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        commit: bool,
        response_needed: bool,
    ) {
        if commit {
            match self.buffer.take_committed() {
                Some(content) => match self.registry.resolve_interface(interface) {
                    Some(id) => self.sink.on_write(id, &content),
                    None => warn!("execute-write for unknown interface {}", interface),
                },
                None => debug!("execute-write with empty reassembly buffer"),
            }
        } else {
            self.buffer.reset();
        }
        if response_needed {
            self.respond(stack, interface, conn_id, trans_id, WriteStatus::Success, None);
        }
    }

    fn respond(
        &mut self,
        stack: &mut dyn LinkStack,
        interface: u16,
        conn_id: u16,
        trans_id: u32,
        status: WriteStatus,
        ack: Option<FragmentAck>,
    ) {
        if let Err(e) = stack.send_write_response(interface, conn_id, trans_id, status, ack) {
            warn!("write response failed: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{GattCall, RecordingStack};
    use super::*;
    use crate::advertiser::AdvPayload;
    use std::sync::Mutex;

    /// Sink that records every dispatched write.
    struct CollectingSink {
        writes: Mutex<Vec<(ServiceId, Vec<u8>)>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
            })
        }

        fn writes(&self) -> Vec<(ServiceId, Vec<u8>)> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl WriteSink for CollectingSink {
        fn on_write(&self, service: ServiceId, value: &[u8]) {
            self.writes.lock().unwrap().push((service, value.to_vec()));
        }
    }

    fn server_with_ready_service(
        ops: &mut RecordingStack,
    ) -> (AttributeServer, Arc<CollectingSink>) {
        let sink = CollectingSink::new();
        let advertiser = Advertiser::new(AdvPayload::new("test-node", vec![0x00A0]));
        let mut server = AttributeServer::new(advertiser, sink.clone());
        server.start(ops);

        // Bring NetworkName up to Ready on interface 10.
        server.handle_event(
            ops,
            GattEvent::Registered {
                app_id: ServiceId::NetworkName.logical_id(),
                interface: 10,
            },
        );
        server.handle_event(
            ops,
            GattEvent::ServiceCreated {
                interface: 10,
                service_handle: 40,
            },
        );
        server.handle_event(
            ops,
            GattEvent::CharacteristicAdded {
                interface: 10,
                attr_handle: 42,
            },
        );
        server.handle_event(
            ops,
            GattEvent::DescriptorAdded {
                interface: 10,
                attr_handle: 43,
            },
        );
        (server, sink)
    }

    fn simple_write(value: &[u8], response_needed: bool) -> GattEvent {
        GattEvent::Write {
            interface: 10,
            conn_id: 1,
            trans_id: 100,
            attr_handle: 42,
            offset: 0,
            value: value.to_vec(),
            is_prepared: false,
            response_needed,
        }
    }

    fn fragment(trans_id: u32, offset: u16, value: &[u8]) -> GattEvent {
        GattEvent::Write {
            interface: 10,
            conn_id: 1,
            trans_id,
            attr_handle: 42,
            offset,
            value: value.to_vec(),
            is_prepared: true,
            response_needed: true,
        }
    }

    #[test]
    fn test_start_registers_and_advertises() {
        let mut ops = RecordingStack::new();
        let (_server, _sink) = server_with_ready_service(&mut ops);
        assert_eq!(ops.adv_starts, 1);
        assert!(ops.calls.contains(&GattCall::RegisterApp(0)));
    }

    #[test]
    fn test_simple_write_dispatches_and_acks() {
        let mut ops = RecordingStack::new();
        let (mut server, sink) = server_with_ready_service(&mut ops);

        server.handle_event(&mut ops, simple_write(b"lab-net", true));

        assert_eq!(
            sink.writes(),
            vec![(ServiceId::NetworkName, b"lab-net".to_vec())]
        );
        assert_eq!(ops.responses.len(), 1);
        assert_eq!(ops.responses[0].status, WriteStatus::Success);
        assert_eq!(ops.responses[0].ack, None);
    }

    #[test]
    fn test_simple_write_without_response_request_sends_none() {
        let mut ops = RecordingStack::new();
        let (mut server, sink) = server_with_ready_service(&mut ops);

        server.handle_event(&mut ops, simple_write(b"lab-net", false));

        assert_eq!(sink.writes().len(), 1);
        assert!(ops.responses.is_empty());
    }

    #[test]
    fn test_write_for_unknown_interface_not_dispatched() {
        let mut ops = RecordingStack::new();
        let (mut server, sink) = server_with_ready_service(&mut ops);

        server.handle_event(
            &mut ops,
            GattEvent::Write {
                interface: 99,
                conn_id: 1,
                trans_id: 5,
                attr_handle: 42,
                offset: 0,
                value: b"x".to_vec(),
                is_prepared: false,
                response_needed: true,
            },
        );

        assert!(sink.writes().is_empty());
        assert_eq!(ops.responses[0].status, WriteStatus::NotPermitted);
    }

    #[test]
    fn test_fragments_acked_individually_then_committed() {
        let mut ops = RecordingStack::new();
        let (mut server, sink) = server_with_ready_service(&mut ops);

        server.handle_event(&mut ops, fragment(200, 0, b"hello "));
        server.handle_event(&mut ops, fragment(201, 6, b"world"));

        // One ack per fragment, echoing handle/offset/value.
        assert_eq!(ops.responses.len(), 2);
        assert_eq!(
            ops.responses[0].ack,
            Some(reassembly::FragmentAck {
                handle: 42,
                offset: 0,
                value: b"hello ".to_vec(),
            })
        );
        assert_eq!(
            ops.responses[1].ack,
            Some(reassembly::FragmentAck {
                handle: 42,
                offset: 6,
                value: b"world".to_vec(),
            })
        );
        // Nothing dispatched until the execute arrives.
        assert!(sink.writes().is_empty());

        server.handle_event(
            &mut ops,
            GattEvent::ExecuteWrite {
                interface: 10,
                conn_id: 1,
                trans_id: 202,
                commit: true,
                response_needed: true,
            },
        );

        assert_eq!(
            sink.writes(),
            vec![(ServiceId::NetworkName, b"hello world".to_vec())]
        );
        assert_eq!(ops.responses.last().unwrap().status, WriteStatus::Success);
    }

    #[test]
    fn test_overflowing_fragment_rejected_with_status() {
        let mut ops = RecordingStack::new();
        let (mut server, sink) = server_with_ready_service(&mut ops);

        server.handle_event(
            &mut ops,
            fragment(300, (reassembly::PREPARE_BUF_CAPACITY - 1) as u16, &[0u8; 8]),
        );

        assert_eq!(ops.responses.len(), 1);
        assert_eq!(ops.responses[0].status, WriteStatus::InvalidLength);
        assert_eq!(ops.responses[0].ack, None);

        // The rejected fragment was not applied.
        server.handle_event(
            &mut ops,
            GattEvent::ExecuteWrite {
                interface: 10,
                conn_id: 1,
                trans_id: 301,
                commit: true,
                response_needed: true,
            },
        );
        assert!(sink.writes().is_empty());
    }

    #[test]
    fn test_execute_cancel_discards_fragments() {
        let mut ops = RecordingStack::new();
        let (mut server, sink) = server_with_ready_service(&mut ops);

        server.handle_event(&mut ops, fragment(400, 0, b"discarded"));
        server.handle_event(
            &mut ops,
            GattEvent::ExecuteWrite {
                interface: 10,
                conn_id: 1,
                trans_id: 401,
                commit: false,
                response_needed: true,
            },
        );

        assert!(sink.writes().is_empty());

        // A later, unrelated sequence sees an empty buffer.
        server.handle_event(&mut ops, fragment(402, 0, b"fresh"));
        server.handle_event(
            &mut ops,
            GattEvent::ExecuteWrite {
                interface: 10,
                conn_id: 1,
                trans_id: 403,
                commit: true,
                response_needed: true,
            },
        );
        assert_eq!(sink.writes(), vec![(ServiceId::NetworkName, b"fresh".to_vec())]);
    }

    #[test]
    fn test_disconnect_resets_buffer_and_restarts_advertising() {
        let mut ops = RecordingStack::new();
        let (mut server, sink) = server_with_ready_service(&mut ops);

        server.handle_event(&mut ops, GattEvent::Connected { conn_id: 1 });
        server.handle_event(&mut ops, fragment(500, 0, b"half-written"));
        server.handle_event(&mut ops, GattEvent::Disconnected { conn_id: 1 });

        // Advertising restarted unconditionally.
        assert_eq!(ops.adv_starts, 2);
        // Connection id cleared everywhere.
        assert_eq!(
            server.registry().descriptor(ServiceId::NetworkName).connection(),
            None
        );

        // Stale fragments must not survive into the next connection.
        server.handle_event(&mut ops, GattEvent::Connected { conn_id: 2 });
        server.handle_event(
            &mut ops,
            GattEvent::ExecuteWrite {
                interface: 10,
                conn_id: 2,
                trans_id: 501,
                commit: true,
                response_needed: true,
            },
        );
        assert!(sink.writes().is_empty());
    }
}
