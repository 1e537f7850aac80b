//! Shared test utilities for core module tests
//!
//! Only compiled in test mode. Integration tests under `tests/` build their
//! own fixtures from the public `sim` module.

use crate::core::dial::{ConnectRequest, Dialer};
use crate::core::filter::InterfaceLuid;
use crate::core::killswitch::EngageParams;
use crate::sim::dial::SimDialService;
use std::time::Duration;

/// Engage parameters with one remote and one local allowlist entry, a
/// tunnel adapter and a tunnel process, exercising every condition kind
pub fn full_engage_params() -> EngageParams {
    EngageParams {
        remote_allow: vec!["10.0.0.1/32".parse().unwrap()],
        local_allow: vec!["192.168.1.10/32".parse().unwrap()],
        tunnel_adapter: Some(InterfaceLuid(7)),
        tunnel_process: Some(r"C:\Program Files\vpn\tunnel.exe".into()),
        persist: false,
        display_name: "test kill switch".to_string(),
    }
}

/// A standard connect request against the sim dial service
pub fn connect_request() -> ConnectRequest {
    ConnectRequest {
        device_name: "Test IKEv2".to_string(),
        hostname: "vpn.example.com".to_string(),
        username: "user".to_string(),
        password: "secret".to_string(),
    }
}

/// A dialer over a fresh sim service with the hang-up delay zeroed so the
/// bounded retry loop runs instantly
pub fn fast_dialer() -> Dialer<SimDialService> {
    Dialer::new(SimDialService::new()).with_hangup_delay(Duration::ZERO)
}
