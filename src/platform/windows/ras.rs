//! RAS dial subsystem backend for the dial-service trait
//!
//! The dial notification callback carries no user context, so the sink of
//! the one in-flight attempt lives in a process-wide slot, installed before
//! submission and cleared when a new dial replaces it. The dial controller
//! guarantees a single outstanding attempt.

use crate::core::dial_service::{
    ActiveConnection, ConnectState, ConnectionHandle, DeviceKind, DialNotice, DialParams,
    DialService, HangupOutcome, LinkCounters, LinkStatusInfo, NotificationSink, PhonebookEntry,
    TransportDevice, VpnStrategy,
};
use crate::core::error::{Error, Result};
use std::ffi::c_void;
use std::sync::Mutex;
use tracing::{debug, warn};
use windows::core::PCWSTR;
use windows::Win32::NetworkManagement::Rras::*;

const ERROR_SUCCESS: u32 = 0;
const ERROR_BUFFER_TOO_SMALL: u32 = 603;
const ERROR_INVALID_NAME: u32 = 123;
const ERROR_ALREADY_EXISTS: u32 = 183;
const ERROR_NO_CONNECTION: u32 = 668;

/// `RASENTRYW.dwVpnStrategy` value pinning the entry to IKEv2 with no
/// fallback
const VS_IKEV2_ONLY: u32 = 7;

const RASDT_VPN: &str = "vpn";

/// Notifier type for a `RasDialFunc1`-style callback
const NOTIFIER_TYPE_FUNC1: u32 = 1;

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|c| *c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

fn copy_wide(dst: &mut [u16], src: &str) {
    let mut n = 0;
    for unit in src.encode_utf16().take(dst.len() - 1) {
        dst[n] = unit;
        n += 1;
    }
    dst[n] = 0;
}

fn map_state(state: RASCONNSTATE) -> ConnectState {
    match state {
        RASCS_OpenPort => ConnectState::OpenPort,
        RASCS_PortOpened => ConnectState::PortOpened,
        RASCS_ConnectDevice => ConnectState::ConnectDevice,
        RASCS_DeviceConnected => ConnectState::DeviceConnected,
        RASCS_Authenticate => ConnectState::Authenticate,
        RASCS_Authenticated => ConnectState::Authenticated,
        RASCS_Connected => ConnectState::Connected,
        RASCS_Disconnected => ConnectState::Disconnected,
        _ => ConnectState::ConnectDevice,
    }
}

struct SinkEntry {
    entry_name: String,
    sink: NotificationSink,
}

/// The sink of the in-flight attempt; RAS invokes the notification callback
/// without user context
static ACTIVE_SINK: Mutex<Option<SinkEntry>> = Mutex::new(None);

unsafe extern "system" fn ras_dial_notify(
    conn: HRASCONN,
    _msg: u32,
    state: RASCONNSTATE,
    error: u32,
    _extended_error: u32,
) {
    let guard = ACTIVE_SINK.lock().expect("dial sink lock poisoned");
    if let Some(entry) = guard.as_ref() {
        let notice = DialNotice {
            handle: ConnectionHandle {
                id: conn.0 as u64,
                entry_name: entry.entry_name.clone(),
            },
            state: map_state(state),
            error: (error != ERROR_SUCCESS).then_some(error),
        };
        (entry.sink)(notice);
    }
}

/// Reads the template (or named) phonebook entry into a raw buffer sized by
/// the double-call protocol. The buffer layout is a `RASENTRYW` possibly
/// followed by extension data the API versions behind `dwSize`; u64 backing
/// keeps the struct cast aligned.
fn read_entry_buffer(name: &str) -> Result<(Vec<u64>, u32)> {
    let wide_name = to_wide(name);
    let mut size: u32 = 0;
    let status = unsafe {
        RasGetEntryPropertiesW(
            PCWSTR::null(),
            PCWSTR(wide_name.as_ptr()),
            None,
            &mut size,
            None,
            None,
        )
    };
    if status != ERROR_SUCCESS && status != ERROR_BUFFER_TOO_SMALL {
        return Err(Error::PropertyWriteFailed {
            name: name.to_string(),
            message: format!("RasGetEntryPropertiesW sizing failed: {status:#010x}"),
        });
    }

    let mut buffer = vec![0u64; (size as usize).div_ceil(8)];
    {
        let entry = buffer.as_mut_ptr().cast::<RASENTRYW>();
        unsafe {
            (*entry).dwSize = size;
        }
    }
    let status = unsafe {
        RasGetEntryPropertiesW(
            PCWSTR::null(),
            PCWSTR(wide_name.as_ptr()),
            Some(buffer.as_mut_ptr().cast()),
            &mut size,
            None,
            None,
        )
    };
    if status != ERROR_SUCCESS {
        return Err(Error::PropertyWriteFailed {
            name: name.to_string(),
            message: format!("RasGetEntryPropertiesW failed: {status:#010x}"),
        });
    }
    Ok((buffer, size))
}

/// RAS dial subsystem
#[derive(Clone, Copy, Default)]
pub struct RasDialService;

impl RasDialService {
    pub fn new() -> Self {
        Self
    }
}

impl DialService for RasDialService {
    fn template_entry(&self) -> Result<PhonebookEntry> {
        let (buffer, _) = read_entry_buffer("")?;
        let entry = unsafe { &*buffer.as_ptr().cast::<RASENTRYW>() };
        let device_type = from_wide(&entry.szDeviceType);
        Ok(PhonebookEntry {
            remote_host: from_wide(&entry.szLocalPhoneNumber),
            transport_device: from_wide(&entry.szDeviceName),
            device_kind: if device_type.eq_ignore_ascii_case(RASDT_VPN) {
                DeviceKind::Vpn
            } else {
                DeviceKind::Other
            },
            strategy: if entry.dwVpnStrategy == VS_IKEV2_ONLY {
                VpnStrategy::Ikev2Only
            } else {
                VpnStrategy::Negotiated
            },
        })
    }

    fn validate_entry_name(&self, name: &str) -> Result<()> {
        let wide = to_wide(name);
        let status =
            unsafe { RasValidateEntryNameW(PCWSTR::null(), PCWSTR(wide.as_ptr())) };
        match status {
            // An existing entry is fine: provisioning overwrites it
            ERROR_SUCCESS | ERROR_ALREADY_EXISTS => Ok(()),
            ERROR_INVALID_NAME => Err(Error::InvalidName(name.to_string())),
            status => Err(Error::InvalidName(format!("{name} ({status:#010x})"))),
        }
    }

    fn transport_devices(&self) -> Result<Vec<TransportDevice>> {
        let mut size: u32 = 0;
        let mut count: u32 = 0;
        let status = unsafe { RasEnumDevicesW(None, &mut size, &mut count) };
        if status != ERROR_SUCCESS && status != ERROR_BUFFER_TOO_SMALL {
            return Err(Error::DeviceEnumerationFailed(format!(
                "RasEnumDevicesW sizing failed: {status:#010x}"
            )));
        }

        let entries = size as usize / std::mem::size_of::<RASDEVINFOW>() + 1;
        let mut devices = vec![RASDEVINFOW::default(); entries];
        devices[0].dwSize = u32::try_from(std::mem::size_of::<RASDEVINFOW>()).unwrap();
        let status =
            unsafe { RasEnumDevicesW(Some(devices.as_mut_ptr()), &mut size, &mut count) };
        if status != ERROR_SUCCESS {
            return Err(Error::DeviceEnumerationFailed(format!(
                "RasEnumDevicesW failed: {status:#010x}"
            )));
        }

        Ok(devices
            .iter()
            .take(count as usize)
            .map(|dev| {
                let kind = if from_wide(&dev.szDeviceType).eq_ignore_ascii_case(RASDT_VPN) {
                    DeviceKind::Vpn
                } else {
                    DeviceKind::Other
                };
                TransportDevice {
                    name: from_wide(&dev.szDeviceName),
                    kind,
                }
            })
            .collect())
    }

    fn write_entry(&self, name: &str, entry: &PhonebookEntry) -> Result<()> {
        // Start from the template buffer so every versioned field the API
        // expects is populated, then overlay our values
        let (mut buffer, size) = read_entry_buffer("")?;
        {
            let native = unsafe { &mut *buffer.as_mut_ptr().cast::<RASENTRYW>() };
            copy_wide(&mut native.szLocalPhoneNumber, &entry.remote_host);
            copy_wide(&mut native.szDeviceType, RASDT_VPN);
            copy_wide(&mut native.szDeviceName, &entry.transport_device);
            if entry.strategy == VpnStrategy::Ikev2Only {
                native.dwVpnStrategy = VS_IKEV2_ONLY;
            }
        }

        let wide_name = to_wide(name);
        let status = unsafe {
            RasSetEntryPropertiesW(
                PCWSTR::null(),
                PCWSTR(wide_name.as_ptr()),
                buffer.as_ptr().cast(),
                size,
                None,
                0,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(Error::PropertyWriteFailed {
                name: name.to_string(),
                message: format!("RasSetEntryPropertiesW failed: {status:#010x}"),
            });
        }
        debug!(entry = name, "phonebook entry written");
        Ok(())
    }

    fn entry_dial_params(&self, name: &str) -> Result<DialParams> {
        let mut params = RASDIALPARAMSW {
            dwSize: u32::try_from(std::mem::size_of::<RASDIALPARAMSW>()).unwrap(),
            ..Default::default()
        };
        copy_wide(&mut params.szEntryName, name);

        let mut password_returned = windows::Win32::Foundation::BOOL(0);
        let status =
            unsafe { RasGetEntryDialParamsW(PCWSTR::null(), &mut params, &mut password_returned) };
        if status != ERROR_SUCCESS {
            return Err(Error::PropertyWriteFailed {
                name: name.to_string(),
                message: format!("RasGetEntryDialParamsW failed: {status:#010x}"),
            });
        }

        Ok(DialParams {
            entry_name: name.to_string(),
            username: from_wide(&params.szUserName),
            password: String::new(),
        })
    }

    fn dial(&self, params: &DialParams, sink: NotificationSink) -> Result<ConnectionHandle> {
        let mut native = RASDIALPARAMSW {
            dwSize: u32::try_from(std::mem::size_of::<RASDIALPARAMSW>()).unwrap(),
            ..Default::default()
        };
        copy_wide(&mut native.szEntryName, &params.entry_name);
        copy_wide(&mut native.szUserName, &params.username);
        copy_wide(&mut native.szPassword, &params.password);

        // Install the sink before submission; the first notification can
        // arrive before RasDialW returns
        *ACTIVE_SINK.lock().expect("dial sink lock poisoned") = Some(SinkEntry {
            entry_name: params.entry_name.clone(),
            sink,
        });

        let mut conn = HRASCONN::default();
        let status = unsafe {
            RasDialW(
                None,
                PCWSTR::null(),
                &native,
                NOTIFIER_TYPE_FUNC1,
                Some(ras_dial_notify as *const c_void),
                &mut conn,
            )
        };
        if status != ERROR_SUCCESS {
            *ACTIVE_SINK.lock().expect("dial sink lock poisoned") = None;
            if !conn.is_invalid() {
                unsafe {
                    let _ = RasHangUpW(conn);
                }
            }
            return Err(Error::DialSubmitFailed(status));
        }

        debug!(entry = %params.entry_name, "dial submitted");
        Ok(ConnectionHandle {
            id: conn.0 as u64,
            entry_name: params.entry_name.clone(),
        })
    }

    fn active_connections(&self) -> Result<Vec<ActiveConnection>> {
        let mut connections = vec![RASCONNW {
            dwSize: u32::try_from(std::mem::size_of::<RASCONNW>()).unwrap(),
            ..Default::default()
        }];
        let mut size = u32::try_from(std::mem::size_of::<RASCONNW>()).unwrap();
        let mut count: u32 = 0;

        let mut status =
            unsafe { RasEnumConnectionsW(Some(connections.as_mut_ptr()), &mut size, &mut count) };
        if status == ERROR_BUFFER_TOO_SMALL {
            let entries = size as usize / std::mem::size_of::<RASCONNW>() + 1;
            connections = vec![RASCONNW::default(); entries];
            connections[0].dwSize = u32::try_from(std::mem::size_of::<RASCONNW>()).unwrap();
            status = unsafe {
                RasEnumConnectionsW(Some(connections.as_mut_ptr()), &mut size, &mut count)
            };
        }
        if status != ERROR_SUCCESS {
            return Err(Error::Internal(format!(
                "RasEnumConnectionsW failed: {status:#010x}"
            )));
        }

        Ok(connections
            .iter()
            .take(count as usize)
            .map(|conn| ActiveConnection {
                handle: ConnectionHandle {
                    id: conn.hrasconn.0 as u64,
                    entry_name: from_wide(&conn.szEntryName),
                },
            })
            .collect())
    }

    fn connect_status(&self, handle: &ConnectionHandle) -> Result<LinkStatusInfo> {
        let mut status_buf = RASCONNSTATUSW {
            dwSize: u32::try_from(std::mem::size_of::<RASCONNSTATUSW>()).unwrap(),
            ..Default::default()
        };
        let status = unsafe {
            RasGetConnectStatusW(HRASCONN(handle.id as isize), &mut status_buf)
        };
        if status != ERROR_SUCCESS {
            return Err(Error::StatQueryFailed(format!(
                "RasGetConnectStatusW failed: {status:#010x}"
            )));
        }
        Ok(LinkStatusInfo {
            state: map_state(status_buf.rasconnstate),
            remote_host: from_wide(&status_buf.szPhoneNumber),
        })
    }

    fn link_counters(&self, handle: &ConnectionHandle) -> Result<LinkCounters> {
        let mut stats = RAS_STATS {
            dwSize: u32::try_from(std::mem::size_of::<RAS_STATS>()).unwrap(),
            ..Default::default()
        };
        let status =
            unsafe { RasGetConnectionStatistics(HRASCONN(handle.id as isize), &mut stats) };
        if status != ERROR_SUCCESS {
            return Err(Error::StatQueryFailed(format!(
                "RasGetConnectionStatistics failed: {status:#010x}"
            )));
        }
        Ok(LinkCounters {
            bytes_transmitted: u64::from(stats.dwBytesXmited),
            bytes_received: u64::from(stats.dwBytesRcved),
            bps: u64::from(stats.dwBps),
            connect_duration_ms: u64::from(stats.dwConnectDuration),
        })
    }

    fn hang_up(&self, handle: &ConnectionHandle) -> Result<HangupOutcome> {
        let status = unsafe { RasHangUpW(HRASCONN(handle.id as isize)) };
        match status {
            // The call reached a live connection; teardown may still be in
            // progress, so the caller's bounded retry loop polls again
            ERROR_SUCCESS => Ok(HangupOutcome::StillActive),
            ERROR_NO_CONNECTION => Ok(HangupOutcome::Disconnected),
            status => {
                warn!(entry = %handle.entry_name, code = status, "hang-up failed");
                Ok(HangupOutcome::Disconnected)
            }
        }
    }
}
