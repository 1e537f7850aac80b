//! Collaborator trait for the OS dial subsystem
//!
//! Mirrors the capability surface the dial lifecycle needs: phonebook entry
//! management, transport-device enumeration, non-blocking dial submission
//! with a progress-notification sink, active-connection enumeration, status
//! and statistics queries, and hang-up by connection handle.
//!
//! [`crate::platform::windows::ras`] binds this to the RAS API;
//! [`crate::sim::dial`] provides a scripted in-process service for tests.
//!
//! The notification sink is invoked on a thread owned by the dial service,
//! concurrently with the caller's thread. Implementations must deliver
//! notices for one dial attempt in order, but nothing else is guaranteed.

use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a dial-capable transport device
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum DeviceKind {
    #[strum(serialize = "vpn")]
    Vpn,
    #[strum(serialize = "modem")]
    Modem,
    #[strum(serialize = "other")]
    Other,
}

/// Tunneling protocol strategy pinned on a phonebook entry
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum VpnStrategy {
    /// Let the dial service negotiate a protocol
    #[default]
    #[strum(serialize = "default")]
    Negotiated,
    /// IKEv2 only, no fallback
    #[strum(serialize = "ikev2-only")]
    Ikev2Only,
}

/// A named, persisted dial-up connection profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhonebookEntry {
    /// Remote endpoint the entry dials
    pub remote_host: String,
    /// Underlying transport device name, resolved from the enumerated
    /// device list
    pub transport_device: String,
    pub device_kind: DeviceKind,
    pub strategy: VpnStrategy,
}

/// One dial-capable device reported by the service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportDevice {
    pub name: String,
    pub kind: DeviceKind,
}

/// Parameters for one dial submission. Credentials live only for the
/// duration of the attempt and are never persisted by this crate.
#[derive(Clone)]
pub struct DialParams {
    pub entry_name: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialParams")
            .field("entry_name", &self.entry_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque handle to one submitted or active connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: u64,
    pub entry_name: String,
}

/// Progress states reported by the dial service
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ConnectState {
    #[strum(serialize = "open-port")]
    OpenPort,
    #[strum(serialize = "port-opened")]
    PortOpened,
    #[strum(serialize = "connect-device")]
    ConnectDevice,
    #[strum(serialize = "device-connected")]
    DeviceConnected,
    #[strum(serialize = "authenticate")]
    Authenticate,
    #[strum(serialize = "authenticated")]
    Authenticated,
    #[strum(serialize = "connected")]
    Connected,
    #[strum(serialize = "disconnected")]
    Disconnected,
}

/// One progress notification, delivered on the service-owned thread
#[derive(Debug, Clone)]
pub struct DialNotice {
    pub handle: ConnectionHandle,
    pub state: ConnectState,
    /// Present when the attempt failed; the code space is the OS-native one
    pub error: Option<u32>,
}

/// Callback invoked for every progress notification of a dial attempt
pub type NotificationSink = Box<dyn Fn(DialNotice) + Send + Sync>;

/// What a hang-up call observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupOutcome {
    /// The service no longer reports an active connection for the handle
    Disconnected,
    /// The connection is still alive; callers retry with a bounded loop
    StillActive,
}

/// Connection status for one active connection
#[derive(Debug, Clone)]
pub struct LinkStatusInfo {
    pub state: ConnectState,
    pub remote_host: String,
}

/// Raw byte/throughput/duration counters for one active connection
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCounters {
    pub bytes_transmitted: u64,
    pub bytes_received: u64,
    pub bps: u64,
    pub connect_duration_ms: u64,
}

/// An entry in the active-connection enumeration
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub handle: ConnectionHandle,
}

/// Capability surface of the OS dial subsystem
pub trait DialService: Send + Sync {
    /// Reads the default/template phonebook entry properties
    fn template_entry(&self) -> Result<PhonebookEntry>;

    /// Validates phonebook entry name syntax.
    ///
    /// # Errors
    ///
    /// Returns [`crate::core::error::Error::InvalidName`] on a malformed
    /// name.
    fn validate_entry_name(&self, name: &str) -> Result<()>;

    /// Enumerates available dial-capable transport devices
    fn transport_devices(&self) -> Result<Vec<TransportDevice>>;

    /// Writes a phonebook entry under the given name, creating or
    /// overwriting it
    fn write_entry(&self, name: &str, entry: &PhonebookEntry) -> Result<()>;

    /// Fetches default dial parameters for an entry (credentials are blank
    /// and injected by the caller)
    fn entry_dial_params(&self, name: &str) -> Result<DialParams>;

    /// Submits a non-blocking dial. Returns as soon as the request is
    /// accepted; progress arrives through the sink on a service-owned
    /// thread.
    fn dial(&self, params: &DialParams, sink: NotificationSink) -> Result<ConnectionHandle>;

    /// Enumerates currently active connections
    fn active_connections(&self) -> Result<Vec<ActiveConnection>>;

    /// Queries connect status for an active connection
    fn connect_status(&self, handle: &ConnectionHandle) -> Result<LinkStatusInfo>;

    /// Queries byte/duration counters for an active connection
    fn link_counters(&self, handle: &ConnectionHandle) -> Result<LinkCounters>;

    /// Issues one synchronous hang-up against the handle and reports
    /// whether the connection is still active afterwards
    fn hang_up(&self, handle: &ConnectionHandle) -> Result<HangupOutcome>;
}
