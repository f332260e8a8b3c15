//! Provisioning orchestrator.
//!
//! Receives completed writes from the attribute server, persists
//! credentials, and drives the connect-then-deliver sequence. Dispatch
//! runs in the link-stack callback context and never blocks; anything
//! that has to wait (joining the network, awaiting link-up, delivering)
//! is handed to the application task through a channel, which owns the
//! only blocking point in the system.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use crate::creds::{
    validate_name, validate_secret, CredentialError, CredentialStore, StoreError,
    StoredCredentials, KEY_NETWORK_NAME, KEY_NETWORK_SECRET,
};
use crate::delivery::{encode_body, DeliveryClient, DeliveryError};
use crate::gate::{ConnectivityGate, GateFlag, GateTimeout};
use crate::gatt::registry::ServiceId;
use crate::gatt::WriteSink;
use crate::net::{ConnectError, ConnectivityManager, NetworkJoiner};

/// Bound on waiting for link-up before a delivery is reported failed.
pub const DEFAULT_LINK_WAIT: Duration = Duration::from_secs(30);

/// Work handed from the dispatch context to the application task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Join the network with the stored credentials.
    Connect,
    /// Ensure the link is up, then deliver the pending message.
    ConnectAndDeliver,
    /// Re-establish a dropped link.
    Rejoin,
}

/// Failures of orchestrated operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// A peer-written credential failed validation.
    Credential(CredentialError),
    /// The credential store failed; the dependent operation is abandoned
    /// and stale in-memory values are retained.
    Storage(StoreError),
    /// A required credential was never provisioned. Distinct from a
    /// store failure; joining with empty credentials is refused.
    NotProvisioned,
    /// The connect attempt failed.
    Connect(ConnectError),
    /// The link did not come up within the configured bound.
    LinkWait(GateTimeout),
    /// The remote delivery failed.
    Delivery(DeliveryError),
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential(e) => write!(f, "invalid credential: {}", e),
            Self::Storage(e) => write!(f, "{}", e),
            Self::NotProvisioned => write!(f, "network credentials not provisioned"),
            Self::Connect(e) => write!(f, "{}", e),
            Self::LinkWait(e) => write!(f, "{}", e),
            Self::Delivery(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProvisionError {}

impl From<CredentialError> for ProvisionError {
    fn from(e: CredentialError) -> Self {
        Self::Credential(e)
    }
}

impl From<StoreError> for ProvisionError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConnectError> for ProvisionError {
    fn from(e: ConnectError) -> Self {
        Self::Connect(e)
    }
}

impl From<GateTimeout> for ProvisionError {
    fn from(e: GateTimeout) -> Self {
        Self::LinkWait(e)
    }
}

impl From<DeliveryError> for ProvisionError {
    fn from(e: DeliveryError) -> Self {
        Self::Delivery(e)
    }
}

/// Core control logic between the attribute server, the credential store,
/// the connectivity manager and the delivery client.
pub struct Orchestrator<J: NetworkJoiner> {
    store: Mutex<Box<dyn CredentialStore>>,
    /// In-memory copy of the provisioned credentials, refreshed from
    /// storage before each connect attempt.
    creds: Mutex<StoredCredentials>,
    pending_message: Mutex<Vec<u8>>,
    gate: Arc<ConnectivityGate>,
    manager: Arc<ConnectivityManager<J>>,
    tasks: Mutex<Sender<Task>>,
    link_wait: Duration,
}

impl<J: NetworkJoiner> Orchestrator<J> {
    /// Build the orchestrator and the receiving end of its task queue.
    ///
    /// The receiver belongs to the application task; see [`run`](Self::run).
    pub fn new(
        store: Box<dyn CredentialStore>,
        gate: Arc<ConnectivityGate>,
        manager: Arc<ConnectivityManager<J>>,
    ) -> (Arc<Self>, Receiver<Task>) {
        Self::with_link_wait(store, gate, manager, DEFAULT_LINK_WAIT)
    }

    /// Same as [`new`](Self::new) with an explicit link-up wait bound.
    pub fn with_link_wait(
        store: Box<dyn CredentialStore>,
        gate: Arc<ConnectivityGate>,
        manager: Arc<ConnectivityManager<J>>,
        link_wait: Duration,
    ) -> (Arc<Self>, Receiver<Task>) {
        let (tx, rx) = mpsc::channel();
        let orchestrator = Arc::new(Self {
            store: Mutex::new(store),
            creds: Mutex::new(StoredCredentials::new("", "")),
            pending_message: Mutex::new(Vec::new()),
            gate,
            manager,
            tasks: Mutex::new(tx),
            link_wait,
        });
        (orchestrator, rx)
    }

    /// Dispatch one completed write. Non-blocking; runs in the link-stack
    /// callback context.
    pub fn handle_write(&self, service: ServiceId, value: &[u8]) -> Result<(), ProvisionError> {
        match service {
            ServiceId::NetworkName => {
                let name = validate_name(value)?.to_owned();
                self.persist(KEY_NETWORK_NAME, value)?;
                self.creds.lock().unwrap().name = name;
                info!("network name provisioned");
                Ok(())
            }
            ServiceId::NetworkSecret => {
                let secret = validate_secret(value)?.to_owned();
                self.persist(KEY_NETWORK_SECRET, value)?;
                self.creds.lock().unwrap().secret = secret;
                info!("network secret provisioned");
                Ok(())
            }
            ServiceId::ConnectTrigger => {
                // The write payload is ignored; only the trigger matters.
                self.enqueue(Task::Connect);
                Ok(())
            }
            ServiceId::Message => {
                *self.pending_message.lock().unwrap() = value.to_vec();
                info!("message staged, {} bytes", value.len());
                self.enqueue(Task::ConnectAndDeliver);
                Ok(())
            }
        }
    }

    /// Application task loop: owns every blocking wait in the system.
    pub fn run(&self, tasks: Receiver<Task>, delivery: &mut dyn DeliveryClient) {
        for task in tasks {
            if let Err(e) = self.process(task, delivery) {
                error!("{:?} failed: {}", task, e);
            }
        }
    }

    /// Execute one queued task. Split out of [`run`](Self::run) so the
    /// outcome stays observable.
    pub fn process(
        &self,
        task: Task,
        delivery: &mut dyn DeliveryClient,
    ) -> Result<(), ProvisionError> {
        match task {
            Task::Connect => {
                let creds = self.load_credentials()?;
                self.manager.connect(&creds)?;
                Ok(())
            }
            Task::ConnectAndDeliver => {
                if !self.gate.is_set(GateFlag::LinkUp) {
                    // One connect attempt before the gate is awaited. A
                    // join failure is not terminal here: the link may
                    // still come up through the rejoin path.
                    let creds = self.load_credentials()?;
                    if let Err(e) = self.manager.connect(&creds) {
                        warn!("connect before delivery failed: {}", e);
                    }
                }

                self.gate.wait(GateFlag::LinkUp, self.link_wait)?;

                let body = encode_body(&self.pending_message.lock().unwrap());
                delivery.deliver(&body)?;
                Ok(())
            }
            Task::Rejoin => {
                let creds = self.cached_credentials();
                if creds.name.is_empty() || creds.secret.is_empty() {
                    return Err(ProvisionError::NotProvisioned);
                }
                self.manager.handle_link_drop(&creds)?;
                Ok(())
            }
        }
    }

    /// Called from the network-stack event context when an established
    /// link drops. Non-blocking; the bounded rejoin runs on the
    /// application task.
    pub fn notify_link_drop(&self) {
        if !self.gate.is_set(GateFlag::LinkUp) {
            // Disconnect noise during an initial connect attempt; the
            // rejoin policy only covers established links.
            return;
        }
        self.enqueue(Task::Rejoin);
    }

    /// Snapshot of the in-memory credential copy.
    pub fn cached_credentials(&self) -> StoredCredentials {
        self.creds.lock().unwrap().clone()
    }

    /// Refresh the in-memory credentials from storage.
    ///
    /// A missing name or secret is a strict "not provisioned" condition;
    /// a join is never attempted with empty credentials. On a store
    /// failure the stale in-memory copy is left untouched.
    fn load_credentials(&self) -> Result<StoredCredentials, ProvisionError> {
        let store = self.store.lock().unwrap();
        let name = store
            .get(KEY_NETWORK_NAME)?
            .ok_or(ProvisionError::NotProvisioned)?;
        let secret = store
            .get(KEY_NETWORK_SECRET)?
            .ok_or(ProvisionError::NotProvisioned)?;
        drop(store);

        let name = String::from_utf8(name).map_err(|_| CredentialError::InvalidUtf8)?;
        let secret = String::from_utf8(secret).map_err(|_| CredentialError::InvalidUtf8)?;

        let loaded = StoredCredentials::new(name, secret);
        *self.creds.lock().unwrap() = loaded.clone();
        self.gate.set(GateFlag::CredentialsLoaded);
        Ok(loaded)
    }

    fn persist(&self, key: &str, value: &[u8]) -> Result<(), ProvisionError> {
        self.store.lock().unwrap().set(key, value)?;
        Ok(())
    }

    fn enqueue(&self, task: Task) {
        if self.tasks.lock().unwrap().send(task).is_err() {
            error!("application task gone, {:?} dropped", task);
        }
    }
}

impl<J: NetworkJoiner> WriteSink for Orchestrator<J> {
    fn on_write(&self, service: ServiceId, value: &[u8]) {
        if let Err(e) = self.handle_write(service, value) {
            // Dispatch failures are observed here; the peer still gets
            // its protocol-level acknowledgement from the server.
            error!("write to {:?} not applied: {}", service, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::MemoryStore;
    use crate::net::JoinError;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::mpsc::TryRecvError;

    struct CountingJoiner {
        succeed: bool,
        calls: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl CountingJoiner {
        fn new(succeed: bool) -> (Self, Arc<Mutex<Vec<(String, String)>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    succeed,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl NetworkJoiner for CountingJoiner {
        fn join(&mut self, name: &str, secret: &str) -> Result<IpAddr, JoinError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_owned(), secret.to_owned()));
            if self.succeed {
                Ok(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
            } else {
                Err(JoinError::AssociationFailed("fake".into()))
            }
        }
    }

    struct CountingDelivery {
        bodies: Vec<Vec<u8>>,
        fail: bool,
    }

    impl CountingDelivery {
        fn new() -> Self {
            Self {
                bodies: Vec::new(),
                fail: false,
            }
        }
    }

    impl DeliveryClient for CountingDelivery {
        fn deliver(&mut self, body: &[u8]) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Rejected(500));
            }
            self.bodies.push(body.to_vec());
            Ok(())
        }
    }

    type Setup = (
        Arc<Orchestrator<CountingJoiner>>,
        Receiver<Task>,
        Arc<Mutex<Vec<(String, String)>>>,
        Arc<ConnectivityGate>,
    );

    fn setup(join_succeeds: bool) -> Setup {
        setup_with_store(join_succeeds, MemoryStore::new())
    }

    fn setup_with_store(join_succeeds: bool, store: MemoryStore) -> Setup {
        let gate = Arc::new(ConnectivityGate::new());
        let (joiner, calls) = CountingJoiner::new(join_succeeds);
        let manager = Arc::new(ConnectivityManager::new(joiner, gate.clone()));
        let (orchestrator, rx) = Orchestrator::with_link_wait(
            Box::new(store),
            gate.clone(),
            manager,
            Duration::from_millis(50),
        );
        (orchestrator, rx, calls, gate)
    }

    fn provision(orchestrator: &Orchestrator<CountingJoiner>) {
        orchestrator
            .handle_write(ServiceId::NetworkName, b"lab-net")
            .unwrap();
        orchestrator
            .handle_write(ServiceId::NetworkSecret, b"s3cr3t!")
            .unwrap();
    }

    #[test]
    fn test_trigger_joins_once_with_provisioned_credentials() {
        let (orchestrator, rx, calls, _gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        provision(&orchestrator);
        orchestrator
            .handle_write(ServiceId::ConnectTrigger, b"ignored payload")
            .unwrap();

        let task = rx.try_recv().unwrap();
        assert_eq!(task, Task::Connect);
        orchestrator.process(task, &mut delivery).unwrap();

        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[("lab-net".to_owned(), "s3cr3t!".to_owned())]
        );
        assert!(delivery.bodies.is_empty());
    }

    #[test]
    fn test_trigger_without_credentials_is_not_provisioned() {
        let (orchestrator, rx, calls, _gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        orchestrator
            .handle_write(ServiceId::ConnectTrigger, b"")
            .unwrap();
        let result = orchestrator.process(rx.try_recv().unwrap(), &mut delivery);

        assert_eq!(result, Err(ProvisionError::NotProvisioned));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_message_connects_once_then_delivers_once() {
        let (orchestrator, rx, calls, gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        provision(&orchestrator);
        assert!(!gate.is_set(GateFlag::LinkUp));
        orchestrator
            .handle_write(ServiceId::Message, b"hello, gcp")
            .unwrap();

        orchestrator
            .process(rx.try_recv().unwrap(), &mut delivery)
            .unwrap();

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(delivery.bodies, vec![br#"{"message":"hello, gcp"}"#.to_vec()]);
    }

    #[test]
    fn test_message_skips_connect_when_link_already_up() {
        let (orchestrator, rx, calls, gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        provision(&orchestrator);
        gate.set(GateFlag::LinkUp);
        orchestrator
            .handle_write(ServiceId::Message, b"already up")
            .unwrap();
        orchestrator
            .process(rx.try_recv().unwrap(), &mut delivery)
            .unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(delivery.bodies.len(), 1);
    }

    #[test]
    fn test_delivery_uses_most_recent_message() {
        let (orchestrator, rx, _calls, gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        provision(&orchestrator);
        gate.set(GateFlag::LinkUp);
        orchestrator
            .handle_write(ServiceId::Message, b"first")
            .unwrap();
        orchestrator
            .handle_write(ServiceId::Message, b"second")
            .unwrap();

        orchestrator
            .process(rx.try_recv().unwrap(), &mut delivery)
            .unwrap();

        assert_eq!(delivery.bodies[0], br#"{"message":"second"}"#.to_vec());
    }

    #[test]
    fn test_gate_timeout_surfaces_as_delivery_failure() {
        let (orchestrator, rx, calls, _gate) = setup(false);
        let mut delivery = CountingDelivery::new();

        provision(&orchestrator);
        orchestrator
            .handle_write(ServiceId::Message, b"never sent")
            .unwrap();

        let result = orchestrator.process(rx.try_recv().unwrap(), &mut delivery);

        assert!(matches!(result, Err(ProvisionError::LinkWait(_))));
        // One connect attempt was made before awaiting the gate.
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(delivery.bodies.is_empty());
    }

    #[test]
    fn test_storage_write_failure_keeps_stale_memory_copy() {
        let mut store = MemoryStore::new();
        store.set(KEY_NETWORK_NAME, b"lab-net").unwrap();
        store.set(KEY_NETWORK_SECRET, b"s3cr3t!").unwrap();
        store.fail_writes(true);
        let (orchestrator, _rx, _calls, _gate) = setup_with_store(true, store);

        // Populate the in-memory copy from storage.
        orchestrator.load_credentials().unwrap();

        let result = orchestrator.handle_write(ServiceId::NetworkName, b"other-net");
        assert!(matches!(result, Err(ProvisionError::Storage(_))));
        assert_eq!(orchestrator.cached_credentials().name, "lab-net");
    }

    #[test]
    fn test_storage_read_failure_distinct_from_not_provisioned() {
        let mut store = MemoryStore::new();
        store.fail_reads(true);
        let (orchestrator, rx, _calls, _gate) = setup_with_store(true, store);
        let mut delivery = CountingDelivery::new();

        orchestrator
            .handle_write(ServiceId::ConnectTrigger, b"")
            .unwrap();
        let result = orchestrator.process(rx.try_recv().unwrap(), &mut delivery);
        assert!(matches!(result, Err(ProvisionError::Storage(_))));
    }

    #[test]
    fn test_credentials_loaded_flag_set_after_load() {
        let (orchestrator, rx, _calls, gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        provision(&orchestrator);
        assert!(!gate.is_set(GateFlag::CredentialsLoaded));
        orchestrator
            .handle_write(ServiceId::ConnectTrigger, b"")
            .unwrap();
        orchestrator
            .process(rx.try_recv().unwrap(), &mut delivery)
            .unwrap();
        assert!(gate.is_set(GateFlag::CredentialsLoaded));
    }

    #[test]
    fn test_invalid_name_write_rejected_and_not_queued() {
        let (orchestrator, rx, _calls, _gate) = setup(true);

        let result = orchestrator.handle_write(ServiceId::NetworkName, &[0xFF; 4]);
        assert!(matches!(
            result,
            Err(ProvisionError::Credential(CredentialError::InvalidUtf8))
        ));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_write_sink_does_not_panic_on_error() {
        let (orchestrator, _rx, _calls, _gate) = setup(true);
        orchestrator.on_write(ServiceId::NetworkName, b"");
    }

    #[test]
    fn test_link_drop_queues_rejoin_only_when_link_was_up() {
        let (orchestrator, rx, _calls, gate) = setup(true);

        // Noise before the link is established is ignored.
        orchestrator.notify_link_drop();
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        gate.set(GateFlag::LinkUp);
        orchestrator.notify_link_drop();
        assert_eq!(rx.try_recv(), Ok(Task::Rejoin));
    }

    #[test]
    fn test_rejoin_uses_cached_credentials() {
        let (orchestrator, _rx, calls, gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        provision(&orchestrator);
        gate.set(GateFlag::LinkUp);
        orchestrator.process(Task::Rejoin, &mut delivery).unwrap();

        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[("lab-net".to_owned(), "s3cr3t!".to_owned())]
        );
        assert!(gate.is_set(GateFlag::LinkUp));
    }

    #[test]
    fn test_rejoin_without_credentials_refused() {
        let (orchestrator, _rx, calls, _gate) = setup(true);
        let mut delivery = CountingDelivery::new();

        let result = orchestrator.process(Task::Rejoin, &mut delivery);
        assert_eq!(result, Err(ProvisionError::NotProvisioned));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_delivery_failure_propagates() {
        let (orchestrator, rx, _calls, gate) = setup(true);
        let mut delivery = CountingDelivery::new();
        delivery.fail = true;

        provision(&orchestrator);
        gate.set(GateFlag::LinkUp);
        orchestrator
            .handle_write(ServiceId::Message, b"doomed")
            .unwrap();
        let result = orchestrator.process(rx.try_recv().unwrap(), &mut delivery);
        assert!(matches!(result, Err(ProvisionError::Delivery(_))));
    }
}
