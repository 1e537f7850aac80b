//! Scripted in-process dial service
//!
//! Replays a configurable notification sequence on its own thread, the way
//! the OS dial service delivers progress on a thread it owns. The phonebook,
//! device list, hang-up behavior and statistics are all scriptable so tests
//! can drive every path of the dial state machine, including the abort race
//! and the bounded hang-up retry.

use crate::core::dial_service::{
    ActiveConnection, ConnectState, ConnectionHandle, DeviceKind, DialNotice, DialParams,
    DialService, HangupOutcome, LinkCounters, LinkStatusInfo, NotificationSink, PhonebookEntry,
    TransportDevice, VpnStrategy,
};
use crate::core::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a scripted dial attempt unfolds
#[derive(Debug, Clone)]
pub enum DialScript {
    /// Normal progress ending in the connected state
    Connect,
    /// Normal progress ending in an error notification with this code
    FailWith(u32),
    /// Exact notification sequence to replay
    Steps(Vec<(ConnectState, Option<u32>)>),
}

impl DialScript {
    fn steps(&self) -> Vec<(ConnectState, Option<u32>)> {
        match self {
            DialScript::Connect => vec![
                (ConnectState::OpenPort, None),
                (ConnectState::ConnectDevice, None),
                (ConnectState::Authenticate, None),
                (ConnectState::Connected, None),
            ],
            DialScript::FailWith(code) => vec![
                (ConnectState::OpenPort, None),
                (ConnectState::ConnectDevice, None),
                (ConnectState::Authenticate, Some(*code)),
            ],
            DialScript::Steps(steps) => steps.clone(),
        }
    }
}

struct SimConnection {
    handle: ConnectionHandle,
    connected: bool,
    alive: bool,
}

struct SimState {
    phonebook: Mutex<HashMap<String, PhonebookEntry>>,
    devices: Mutex<Vec<TransportDevice>>,
    script: Mutex<DialScript>,
    step_delay: Mutex<Duration>,
    connections: Mutex<Vec<SimConnection>>,
    counters: Mutex<LinkCounters>,
    next_handle: AtomicU64,
    dial_count: AtomicU32,
    hangup_calls: AtomicU32,
    stubborn_hangup: AtomicBool,
    stat_error: AtomicBool,
    enum_error: AtomicBool,
}

/// Scripted dial service; clones share state
#[derive(Clone)]
pub struct SimDialService {
    state: Arc<SimState>,
}

impl Default for SimDialService {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDialService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState {
                phonebook: Mutex::new(HashMap::new()),
                devices: Mutex::new(vec![
                    TransportDevice {
                        name: "Standard Modem".to_string(),
                        kind: DeviceKind::Modem,
                    },
                    TransportDevice {
                        name: "WAN Miniport (PPTP)".to_string(),
                        kind: DeviceKind::Vpn,
                    },
                    TransportDevice {
                        name: "WAN Miniport (IKEv2)".to_string(),
                        kind: DeviceKind::Vpn,
                    },
                ]),
                script: Mutex::new(DialScript::Connect),
                step_delay: Mutex::new(Duration::from_millis(2)),
                connections: Mutex::new(Vec::new()),
                counters: Mutex::new(LinkCounters::default()),
                next_handle: AtomicU64::new(1),
                dial_count: AtomicU32::new(0),
                hangup_calls: AtomicU32::new(0),
                stubborn_hangup: AtomicBool::new(false),
                stat_error: AtomicBool::new(false),
                enum_error: AtomicBool::new(false),
            }),
        }
    }

    /// The phonebook entry written under `name`, if any
    pub fn entry(&self, name: &str) -> Option<PhonebookEntry> {
        self.state.phonebook.lock().unwrap().get(name).cloned()
    }

    pub fn set_transport_devices(&self, devices: Vec<TransportDevice>) {
        *self.state.devices.lock().unwrap() = devices;
    }

    pub fn set_script(&self, script: DialScript) {
        *self.state.script.lock().unwrap() = script;
    }

    pub fn set_step_delay(&self, delay: Duration) {
        *self.state.step_delay.lock().unwrap() = delay;
    }

    /// When set, hang-up always reports the connection still active
    pub fn set_stubborn_hangup(&self, stubborn: bool) {
        self.state.stubborn_hangup.store(stubborn, Ordering::SeqCst);
    }

    pub fn set_stat_error(&self, fail: bool) {
        self.state.stat_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_enumeration_error(&self, fail: bool) {
        self.state.enum_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_counters(&self, counters: LinkCounters) {
        *self.state.counters.lock().unwrap() = counters;
    }

    /// Number of dial submissions accepted so far
    pub fn dial_count(&self) -> u32 {
        self.state.dial_count.load(Ordering::SeqCst)
    }

    /// Total hang-up calls across all handles
    pub fn hangup_calls(&self) -> u32 {
        self.state.hangup_calls.load(Ordering::SeqCst)
    }

    /// Registers an already-connected session without dialing, for
    /// statistics and disconnect tests
    pub fn mark_connected(&self, entry_name: &str) -> ConnectionHandle {
        let handle = ConnectionHandle {
            id: self.state.next_handle.fetch_add(1, Ordering::SeqCst),
            entry_name: entry_name.to_string(),
        };
        self.state.connections.lock().unwrap().push(SimConnection {
            handle: handle.clone(),
            connected: true,
            alive: true,
        });
        handle
    }
}

impl DialService for SimDialService {
    fn template_entry(&self) -> Result<PhonebookEntry> {
        Ok(PhonebookEntry {
            remote_host: String::new(),
            transport_device: "WAN Miniport (L2TP)".to_string(),
            device_kind: DeviceKind::Other,
            strategy: VpnStrategy::Negotiated,
        })
    }

    fn validate_entry_name(&self, name: &str) -> Result<()> {
        crate::validators::validate_device_name(name)
    }

    fn transport_devices(&self) -> Result<Vec<TransportDevice>> {
        Ok(self.state.devices.lock().unwrap().clone())
    }

    fn write_entry(&self, name: &str, entry: &PhonebookEntry) -> Result<()> {
        self.state
            .phonebook
            .lock()
            .unwrap()
            .insert(name.to_string(), entry.clone());
        Ok(())
    }

    fn entry_dial_params(&self, name: &str) -> Result<DialParams> {
        if !self.state.phonebook.lock().unwrap().contains_key(name) {
            return Err(Error::PropertyWriteFailed {
                name: name.to_string(),
                message: "no such phonebook entry".to_string(),
            });
        }
        Ok(DialParams {
            entry_name: name.to_string(),
            username: String::new(),
            password: String::new(),
        })
    }

    fn dial(&self, params: &DialParams, sink: NotificationSink) -> Result<ConnectionHandle> {
        self.state.dial_count.fetch_add(1, Ordering::SeqCst);

        let handle = ConnectionHandle {
            id: self.state.next_handle.fetch_add(1, Ordering::SeqCst),
            entry_name: params.entry_name.clone(),
        };
        self.state.connections.lock().unwrap().push(SimConnection {
            handle: handle.clone(),
            connected: false,
            alive: true,
        });

        let steps = self.state.script.lock().unwrap().steps();
        let delay = *self.state.step_delay.lock().unwrap();
        let state = Arc::clone(&self.state);
        let thread_handle = handle.clone();

        // The notification thread stands in for the thread the OS dial
        // service owns; it must never be the caller's thread.
        std::thread::spawn(move || {
            for (connect_state, error) in steps {
                std::thread::sleep(delay);
                if connect_state == ConnectState::Connected && error.is_none() {
                    let mut connections = state.connections.lock().unwrap();
                    if let Some(conn) = connections
                        .iter_mut()
                        .find(|c| c.handle.id == thread_handle.id)
                    {
                        conn.connected = true;
                    }
                }
                sink(DialNotice {
                    handle: thread_handle.clone(),
                    state: connect_state,
                    error,
                });
            }
        });

        Ok(handle)
    }

    fn active_connections(&self) -> Result<Vec<ActiveConnection>> {
        if self.state.enum_error.load(Ordering::SeqCst) {
            return Err(Error::Internal(
                "scripted connection enumeration failure".to_string(),
            ));
        }
        Ok(self
            .state
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.alive)
            .map(|c| ActiveConnection {
                handle: c.handle.clone(),
            })
            .collect())
    }

    fn connect_status(&self, handle: &ConnectionHandle) -> Result<LinkStatusInfo> {
        if self.state.stat_error.load(Ordering::SeqCst) {
            return Err(Error::StatQueryFailed(
                "scripted status failure".to_string(),
            ));
        }
        let connections = self.state.connections.lock().unwrap();
        let Some(conn) = connections
            .iter()
            .find(|c| c.handle.id == handle.id && c.alive)
        else {
            return Ok(LinkStatusInfo {
                state: ConnectState::Disconnected,
                remote_host: String::new(),
            });
        };

        let remote_host = self
            .state
            .phonebook
            .lock()
            .unwrap()
            .get(&conn.handle.entry_name)
            .map(|entry| entry.remote_host.clone())
            .unwrap_or_default();

        Ok(LinkStatusInfo {
            state: if conn.connected {
                ConnectState::Connected
            } else {
                ConnectState::Disconnected
            },
            remote_host,
        })
    }

    fn link_counters(&self, handle: &ConnectionHandle) -> Result<LinkCounters> {
        if self.state.stat_error.load(Ordering::SeqCst) {
            return Err(Error::StatQueryFailed(
                "scripted counter failure".to_string(),
            ));
        }
        let _ = handle;
        Ok(*self.state.counters.lock().unwrap())
    }

    fn hang_up(&self, handle: &ConnectionHandle) -> Result<HangupOutcome> {
        self.state.hangup_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.stubborn_hangup.load(Ordering::SeqCst) {
            return Ok(HangupOutcome::StillActive);
        }
        let mut connections = self.state.connections.lock().unwrap();
        if let Some(conn) = connections.iter_mut().find(|c| c.handle.id == handle.id) {
            conn.alive = false;
            conn.connected = false;
        }
        Ok(HangupOutcome::Disconnected)
    }
}
