//! Dial session controller: drives the asynchronous IKEv2 connect state
//! machine
//!
//! One attempt moves `Idle → Dialing → {Connected, Failed, Aborted}`; all
//! three end states are terminal for that attempt. Submission is
//! non-blocking: [`Dialer::connect`] returns as soon as the dial service has
//! accepted the request, and progress notifications arrive on a thread owned
//! by the service.
//!
//! Each notification is evaluated in a fixed priority order (abort flag,
//! then error code, then the connected state), so an abort requested
//! concurrently with an in-flight error is reported as an abort. The
//! terminal [`DialOutcome`] is delivered exactly once through a oneshot
//! channel; callers block or await on it instead of juggling callbacks.
//!
//! Only one attempt may be in flight per [`Dialer`]; a second connect is
//! rejected with [`Error::DialInProgress`] rather than overwriting the
//! abort flag and completion slot of the first.

use crate::core::dial_service::{
    ConnectState, ConnectionHandle, DialNotice, DialService, HangupOutcome, LinkCounters,
};
use crate::core::error::{Error, Result};
use crate::core::provision;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Dial-service error code for rejected credentials
pub const ERROR_AUTHENTICATION_FAILURE: u32 = 691;
/// EAP layer code for a rejected username/password
pub const EAP_E_USER_NAME_PASSWORD_REJECTED: u32 = 0x8042_0112;

/// Maximum hang-up attempts before reporting [`Error::HangupFailed`]
pub const HANGUP_ATTEMPTS: u32 = 50;
/// Fixed delay between hang-up attempts
pub const HANGUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// True when a dial failure code means the credentials were rejected
pub fn is_auth_failure(code: u32) -> bool {
    code == ERROR_AUTHENTICATION_FAILURE || code == EAP_E_USER_NAME_PASSWORD_REJECTED
}

/// Terminal result of one dial attempt, delivered exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Connected,
    /// The attempt failed with an OS-native error code; the half-open
    /// connection was hung up before this was delivered
    Failed(u32),
    Aborted,
}

impl fmt::Display for DialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialOutcome::Connected => write!(f, "connected"),
            DialOutcome::Failed(code) if is_auth_failure(*code) => {
                write!(f, "failed: authentication failure ({code:#x})")
            }
            DialOutcome::Failed(code) => write!(f, "failed with code {code:#x}"),
            DialOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Whether a connection is up, as reported in a statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum LinkStatus {
    #[default]
    #[strum(serialize = "disconnected")]
    Disconnected,
    #[strum(serialize = "connected")]
    Connected,
}

/// Freshly queried connection statistics snapshot; never cached
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub status: LinkStatus,
    pub bytes_transmitted: u64,
    pub bytes_received: u64,
    pub bps: u64,
    pub connect_duration: Duration,
    pub remote_host: String,
}

impl ConnectionStats {
    /// Zeroed snapshot used when no matching active connection exists
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Arguments to [`Dialer::connect`]
#[derive(Clone)]
pub struct ConnectRequest {
    pub device_name: String,
    pub hostname: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("device_name", &self.device_name)
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A submitted dial attempt; resolves to exactly one [`DialOutcome`]
#[derive(Debug)]
pub struct DialAttempt {
    handle: ConnectionHandle,
    outcome: oneshot::Receiver<DialOutcome>,
}

impl DialAttempt {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Awaits the terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the dialer was dropped before the
    /// attempt resolved.
    pub async fn outcome(self) -> Result<DialOutcome> {
        self.outcome
            .await
            .map_err(|_| Error::Internal("dial attempt dropped before resolving".to_string()))
    }

    /// Blocks the calling thread until the terminal outcome arrives. Must
    /// not be called from inside an async runtime; use [`Self::outcome`]
    /// there.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the dialer was dropped before the
    /// attempt resolved.
    pub fn outcome_blocking(self) -> Result<DialOutcome> {
        self.outcome
            .blocking_recv()
            .map_err(|_| Error::Internal("dial attempt dropped before resolving".to_string()))
    }
}

/// Shared state between the caller's thread and the notification sink
struct AttemptState {
    abort: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    sender: Mutex<Option<oneshot::Sender<DialOutcome>>>,
}

impl AttemptState {
    /// Delivers the terminal outcome exactly once and releases the
    /// in-flight slot
    fn resolve(&self, outcome: DialOutcome) {
        let Some(sender) = self.sender.lock().expect("sender lock poisoned").take() else {
            return;
        };
        self.in_flight.store(false, Ordering::SeqCst);
        info!(%outcome, "dial attempt resolved");
        let _ = sender.send(outcome);
    }
}

/// Drives connect/abort/disconnect/statistics against a dial service
pub struct Dialer<D> {
    service: Arc<D>,
    abort: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    hangup_delay: Duration,
}

impl<D: DialService + 'static> Dialer<D> {
    pub fn new(service: D) -> Self {
        Self {
            service: Arc::new(service),
            abort: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicBool::new(false)),
            hangup_delay: HANGUP_RETRY_DELAY,
        }
    }

    /// Overrides the hang-up retry delay; used by tests to keep the bounded
    /// retry loop fast
    pub fn with_hangup_delay(mut self, delay: Duration) -> Self {
        self.hangup_delay = delay;
        self
    }

    pub fn service(&self) -> &D {
        &self.service
    }

    /// Provisions the device and submits a non-blocking dial.
    ///
    /// Returns as soon as the request is accepted; the returned
    /// [`DialAttempt`] resolves to the terminal outcome. Provisioning
    /// failures (including [`Error::InvalidName`]) are returned immediately
    /// and no dial is ever submitted.
    ///
    /// # Errors
    ///
    /// - [`Error::DialInProgress`] when an attempt is already outstanding
    /// - any provisioning error, before submission
    /// - [`Error::DialSubmitFailed`] when the service rejects the request
    pub fn connect(&self, request: &ConnectRequest) -> Result<DialAttempt> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::DialInProgress);
        }

        match self.submit(request) {
            Ok(attempt) => Ok(attempt),
            Err(err) => {
                self.in_flight.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn submit(&self, request: &ConnectRequest) -> Result<DialAttempt> {
        // Create or update the device first; a provisioning failure must
        // never start a dial.
        provision::provision(&*self.service, &request.device_name, &request.hostname)?;

        self.abort.store(false, Ordering::SeqCst);

        let mut params = self.service.entry_dial_params(&request.device_name)?;
        params.username = request.username.clone();
        params.password = request.password.clone();

        let (sender, receiver) = oneshot::channel();
        let state = Arc::new(AttemptState {
            abort: Arc::clone(&self.abort),
            in_flight: Arc::clone(&self.in_flight),
            sender: Mutex::new(Some(sender)),
        });

        let service = Arc::clone(&self.service);
        let sink = Box::new(move |notice: DialNotice| {
            handle_notice(&*service, &state, &notice);
        });

        info!(entry = %request.device_name, host = %request.hostname, "submitting dial");
        let handle = self.service.dial(&params, sink)?;

        Ok(DialAttempt {
            handle,
            outcome: receiver,
        })
    }

    /// Requests cancellation of the outstanding attempt. Takes effect on
    /// the next progress notification, not synchronously; wait on the
    /// attempt's outcome for the confirming [`DialOutcome::Aborted`].
    pub fn abort(&self) {
        info!("dial abort requested");
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Clears a previously requested abort without affecting an in-progress
    /// dial. Call before a fresh connect when a prior abort was never
    /// consumed.
    pub fn reset_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    /// Hangs up every active connection whose entry name matches, retrying
    /// each up to [`HANGUP_ATTEMPTS`] times.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HangupFailed`] when a connection still reports
    /// active after the final attempt; its state is then uncertain.
    pub fn disconnect(&self, device_name: &str) -> Result<()> {
        let connections = self.service.active_connections()?;
        for conn in connections
            .iter()
            .filter(|c| c.handle.entry_name.eq_ignore_ascii_case(device_name))
        {
            self.hang_up_with_retry(&conn.handle)?;
        }
        info!(entry = device_name, "disconnected");
        Ok(())
    }

    fn hang_up_with_retry(&self, handle: &ConnectionHandle) -> Result<()> {
        for attempt in 1..=HANGUP_ATTEMPTS {
            match self.service.hang_up(handle)? {
                HangupOutcome::Disconnected => {
                    debug!(entry = %handle.entry_name, attempt, "hang-up confirmed");
                    return Ok(());
                }
                HangupOutcome::StillActive => {
                    if attempt < HANGUP_ATTEMPTS {
                        std::thread::sleep(self.hangup_delay);
                    }
                }
            }
        }
        warn!(entry = %handle.entry_name, "hang-up retries exhausted");
        Err(Error::HangupFailed {
            attempts: HANGUP_ATTEMPTS,
        })
    }

    /// Queries a fresh statistics snapshot for the named device.
    ///
    /// Absence of a matching active connection is not an error: the
    /// snapshot comes back zeroed and disconnected. Per-connection query
    /// failures degrade the same way instead of propagating.
    ///
    /// # Errors
    ///
    /// Returns an error only when active connections cannot be enumerated.
    pub fn statistics(&self, device_name: &str) -> Result<ConnectionStats> {
        let connections = self.service.active_connections()?;
        let Some(conn) = connections
            .iter()
            .find(|c| c.handle.entry_name.eq_ignore_ascii_case(device_name))
        else {
            return Ok(ConnectionStats::disconnected());
        };

        let status = match self.service.connect_status(&conn.handle) {
            Ok(status) => status,
            Err(err) => {
                warn!(entry = device_name, error = %err, "status query failed");
                return Ok(ConnectionStats::disconnected());
            }
        };

        let counters = match self.service.link_counters(&conn.handle) {
            Ok(counters) => counters,
            Err(err) => {
                warn!(entry = device_name, error = %err, "counter query failed");
                LinkCounters::default()
            }
        };

        Ok(ConnectionStats {
            status: if status.state == ConnectState::Connected {
                LinkStatus::Connected
            } else {
                LinkStatus::Disconnected
            },
            bytes_transmitted: counters.bytes_transmitted,
            bytes_received: counters.bytes_received,
            bps: counters.bps,
            connect_duration: Duration::from_millis(counters.connect_duration_ms),
            remote_host: status.remote_host,
        })
    }
}

/// Evaluates one progress notification in priority order: abort flag first,
/// then an error code, then the connected state. Runs on the service-owned
/// notification thread.
fn handle_notice<D: DialService + ?Sized>(
    service: &D,
    state: &AttemptState,
    notice: &DialNotice,
) {
    if state.abort.load(Ordering::SeqCst) {
        debug!(state = %notice.state, "abort flag set, hanging up");
        let _ = service.hang_up(&notice.handle);
        state.abort.store(false, Ordering::SeqCst);
        state.resolve(DialOutcome::Aborted);
        return;
    }

    if let Some(code) = notice.error {
        // Always hang up the partially-formed connection before reporting
        let _ = service.hang_up(&notice.handle);
        state.resolve(DialOutcome::Failed(code));
        return;
    }

    if notice.state == ConnectState::Connected {
        state.resolve(DialOutcome::Connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_codes() {
        assert!(is_auth_failure(ERROR_AUTHENTICATION_FAILURE));
        assert!(is_auth_failure(EAP_E_USER_NAME_PASSWORD_REJECTED));
        assert!(!is_auth_failure(0));
        assert!(!is_auth_failure(678));
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(DialOutcome::Connected.to_string(), "connected");
        assert_eq!(DialOutcome::Aborted.to_string(), "aborted");
        assert!(DialOutcome::Failed(691).to_string().contains("authentication"));
        assert!(DialOutcome::Failed(0x274c).to_string().contains("0x274c"));
    }

    #[test]
    fn test_connect_request_debug_redacts_password() {
        let request = ConnectRequest {
            device_name: "vpn".to_string(),
            hostname: "vpn.example.com".to_string(),
            username: "user".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{request:?}").contains("hunter2"));
    }

    #[test]
    fn test_disconnected_snapshot_is_zeroed() {
        let stats = ConnectionStats::disconnected();
        assert_eq!(stats.status, LinkStatus::Disconnected);
        assert_eq!(stats.bytes_transmitted, 0);
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.connect_duration, Duration::ZERO);
        assert!(stats.remote_host.is_empty());
    }
}
