//! Connectivity manager.
//!
//! Wraps a [`NetworkJoiner`] with the two policies the rest of the system
//! relies on:
//!
//! - exactly one outstanding connect attempt; a second request while one
//!   is in flight is rejected with [`ConnectError::Busy`], not queued;
//! - a drop of an already-established link is retried a bounded number of
//!   times before being reported as terminal. An initial failed connect
//!   is never retried.
//!
//! Success and drop are signalled to the rest of the system through the
//! [`ConnectivityGate`]'s `LinkUp` flag.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::creds::StoredCredentials;
use crate::gate::{ConnectivityGate, GateFlag};
use crate::net::{JoinError, NetworkJoiner};

/// Rejoin attempts after a dropped link before giving up.
pub const MAX_REJOIN_ATTEMPTS: usize = 10;

/// A connect request could not produce a usable link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Another connect attempt is already outstanding.
    Busy,
    /// The join itself failed.
    Join(JoinError),
    /// A dropped link could not be re-established within the retry bound.
    RejoinExhausted(JoinError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "a connect attempt is already in flight"),
            Self::Join(e) => write!(f, "join failed: {}", e),
            Self::RejoinExhausted(e) => write!(
                f,
                "link not re-established after {} attempts: {}",
                MAX_REJOIN_ATTEMPTS, e
            ),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Serializes join attempts and keeps the gate's `LinkUp` flag in sync
/// with the real link state.
pub struct ConnectivityManager<J: NetworkJoiner> {
    joiner: Mutex<J>,
    gate: Arc<ConnectivityGate>,
    in_flight: AtomicBool,
}

impl<J: NetworkJoiner> ConnectivityManager<J> {
    pub fn new(joiner: J, gate: Arc<ConnectivityGate>) -> Self {
        Self {
            joiner: Mutex::new(joiner),
            gate,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Perform one join attempt with the given credentials.
    ///
    /// On success `LinkUp` is set on the gate. A failed initial attempt is
    /// reported as-is and not retried.
    pub fn connect(&self, creds: &StoredCredentials) -> Result<IpAddr, ConnectError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("connect rejected: attempt already in flight");
            return Err(ConnectError::Busy);
        }

        let result = {
            let mut joiner = self.joiner.lock().unwrap();
            joiner.join(&creds.name, &creds.secret)
        };
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(addr) => {
                info!("joined '{}', address {}", creds.name, addr);
                self.gate.set(GateFlag::LinkUp);
                Ok(addr)
            }
            Err(e) => {
                error!("join of '{}' failed: {}", creds.name, e);
                Err(ConnectError::Join(e))
            }
        }
    }

    /// React to an unexpected drop of an established link.
    ///
    /// Clears `LinkUp`, then retries the join up to
    /// [`MAX_REJOIN_ATTEMPTS`] times. The exhausted case is terminal; it
    /// is not silently retried again.
    pub fn handle_link_drop(&self, creds: &StoredCredentials) -> Result<IpAddr, ConnectError> {
        warn!("link to '{}' dropped", creds.name);
        self.gate.clear(GateFlag::LinkUp);

        let mut joiner = self.joiner.lock().unwrap();
        let mut last_error = None;
        for attempt in 1..=MAX_REJOIN_ATTEMPTS {
            match joiner.join(&creds.name, &creds.secret) {
                Ok(addr) => {
                    info!("rejoined '{}' on attempt {}, address {}", creds.name, attempt, addr);
                    self.gate.set(GateFlag::LinkUp);
                    return Ok(addr);
                }
                Err(e) => {
                    warn!(
                        "rejoin attempt {}/{} failed: {}",
                        attempt, MAX_REJOIN_ATTEMPTS, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let e = last_error.unwrap_or(JoinError::AssociationFailed("no attempt ran".into()));
        error!("giving up on '{}' after {} attempts", creds.name, MAX_REJOIN_ATTEMPTS);
        Err(ConnectError::RejoinExhausted(e))
    }

    /// Whether the link is currently up, as seen through the gate.
    pub fn is_link_up(&self) -> bool {
        self.gate.is_set(GateFlag::LinkUp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Joiner that follows a script of results and counts attempts.
    struct ScriptedJoiner {
        script: Vec<Result<IpAddr, JoinError>>,
        pub calls: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl ScriptedJoiner {
        fn new(script: Vec<Result<IpAddr, JoinError>>) -> Self {
            Self {
                script,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn always_failing() -> Self {
            Self {
                script: Vec::new(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl NetworkJoiner for ScriptedJoiner {
        fn join(&mut self, name: &str, secret: &str) -> Result<IpAddr, JoinError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_owned(), secret.to_owned()));
            if self.script.is_empty() {
                return Err(JoinError::AssociationFailed("scripted failure".into()));
            }
            self.script.remove(0)
        }
    }

    fn some_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))
    }

    fn creds() -> StoredCredentials {
        StoredCredentials::new("lab-net", "s3cr3t!")
    }

    #[test]
    fn test_connect_success_sets_link_up() {
        let gate = Arc::new(ConnectivityGate::new());
        let manager = ConnectivityManager::new(ScriptedJoiner::new(vec![Ok(some_ip())]), gate.clone());

        let addr = manager.connect(&creds()).unwrap();
        assert_eq!(addr, some_ip());
        assert!(gate.is_set(GateFlag::LinkUp));
    }

    #[test]
    fn test_connect_passes_stored_credentials() {
        let gate = Arc::new(ConnectivityGate::new());
        let joiner = ScriptedJoiner::new(vec![Ok(some_ip())]);
        let calls = joiner.calls.clone();
        let manager = ConnectivityManager::new(joiner, gate);

        manager.connect(&creds()).unwrap();
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[("lab-net".to_owned(), "s3cr3t!".to_owned())]
        );
    }

    #[test]
    fn test_initial_failure_not_retried() {
        let gate = Arc::new(ConnectivityGate::new());
        let joiner = ScriptedJoiner::always_failing();
        let calls = joiner.calls.clone();
        let manager = ConnectivityManager::new(joiner, gate.clone());

        let result = manager.connect(&creds());
        assert!(matches!(result, Err(ConnectError::Join(_))));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!gate.is_set(GateFlag::LinkUp));
    }

    #[test]
    fn test_drop_retries_bounded_then_terminal() {
        let gate = Arc::new(ConnectivityGate::new());
        gate.set(GateFlag::LinkUp);
        let joiner = ScriptedJoiner::always_failing();
        let calls = joiner.calls.clone();
        let manager = ConnectivityManager::new(joiner, gate.clone());

        let result = manager.handle_link_drop(&creds());
        assert!(matches!(result, Err(ConnectError::RejoinExhausted(_))));
        assert_eq!(calls.lock().unwrap().len(), MAX_REJOIN_ATTEMPTS);
        assert!(!gate.is_set(GateFlag::LinkUp));
    }

    #[test]
    fn test_drop_recovers_within_bound() {
        let gate = Arc::new(ConnectivityGate::new());
        gate.set(GateFlag::LinkUp);
        let script = vec![
            Err(JoinError::AssociationFailed("1".into())),
            Err(JoinError::AssociationFailed("2".into())),
            Err(JoinError::AssociationFailed("3".into())),
            Ok(some_ip()),
        ];
        let joiner = ScriptedJoiner::new(script);
        let calls = joiner.calls.clone();
        let manager = ConnectivityManager::new(joiner, gate.clone());

        let addr = manager.handle_link_drop(&creds()).unwrap();
        assert_eq!(addr, some_ip());
        assert_eq!(calls.lock().unwrap().len(), 4);
        assert!(gate.is_set(GateFlag::LinkUp));
    }

    /// Joiner that blocks until released, to hold a connect in flight.
    struct BlockingJoiner {
        release: mpsc::Receiver<()>,
    }

    impl NetworkJoiner for BlockingJoiner {
        fn join(&mut self, _name: &str, _secret: &str) -> Result<IpAddr, JoinError> {
            self.release.recv().ok();
            Ok(some_ip())
        }
    }

    #[test]
    fn test_second_connect_rejected_while_in_flight() {
        let gate = Arc::new(ConnectivityGate::new());
        let (release_tx, release_rx) = mpsc::channel();
        let manager = Arc::new(ConnectivityManager::new(
            BlockingJoiner { release: release_rx },
            gate,
        ));

        let background = manager.clone();
        let handle = thread::spawn(move || background.connect(&creds()));

        // Wait until the first attempt is actually in flight.
        while !manager.in_flight.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(manager.connect(&creds()), Err(ConnectError::Busy));

        release_tx.send(()).unwrap();
        assert!(handle.join().unwrap().is_ok());
    }
}
