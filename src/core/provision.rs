//! VPN device provisioner: creates or updates the named IKEv2 phonebook
//! entry
//!
//! Provisioning is create-or-overwrite; there is no separate update path.
//! The entry persists in the OS phonebook until explicitly removed or
//! overwritten by the next provisioning call.

use crate::core::dial_service::{DeviceKind, DialService, VpnStrategy};
use crate::core::error::Result;
use tracing::{debug, info};

/// Substring identifying an IKEv2-capable transport device in the
/// enumerated device list
const IKEV2_DEVICE_MARKER: &str = "IKEv2";

/// Creates or overwrites the phonebook entry `device_name`, dialing
/// `hostname` over IKEv2 only.
///
/// Transport device selection is first-match over the enumerated devices
/// whose kind is VPN and whose name contains "IKEv2". With several
/// IKEv2-capable adapters present the first one wins; the template's device
/// is kept when none matches.
///
/// # Errors
///
/// - [`crate::core::error::Error::InvalidName`] for a malformed entry name;
///   nothing is written
/// - [`crate::core::error::Error::DeviceEnumerationFailed`] when the device
///   list cannot be read
/// - [`crate::core::error::Error::PropertyWriteFailed`] when the entry
///   cannot be stored
pub fn provision<D: DialService + ?Sized>(
    service: &D,
    device_name: &str,
    hostname: &str,
) -> Result<()> {
    let mut entry = service.template_entry()?;

    service.validate_entry_name(device_name)?;

    let devices = service.transport_devices()?;
    match devices
        .iter()
        .find(|dev| dev.kind == DeviceKind::Vpn && dev.name.contains(IKEV2_DEVICE_MARKER))
    {
        Some(device) => {
            debug!(device = %device.name, "selected IKEv2 transport device");
            entry.transport_device = device.name.clone();
        }
        None => {
            debug!("no IKEv2 transport device enumerated, keeping template device");
        }
    }

    entry.remote_host = hostname.to_string();
    entry.device_kind = DeviceKind::Vpn;
    entry.strategy = VpnStrategy::Ikev2Only;

    service.write_entry(device_name, &entry)?;

    info!(entry = device_name, host = hostname, "provisioned IKEv2 phonebook entry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::sim::dial::SimDialService;

    #[test]
    fn test_provision_writes_ikev2_entry() {
        let service = SimDialService::new();
        provision(&service, "Acme VPN", "vpn.example.com").unwrap();

        let entry = service.entry("Acme VPN").expect("entry written");
        assert_eq!(entry.remote_host, "vpn.example.com");
        assert_eq!(entry.strategy, VpnStrategy::Ikev2Only);
        assert_eq!(entry.device_kind, DeviceKind::Vpn);
        assert!(entry.transport_device.contains("IKEv2"));
    }

    #[test]
    fn test_provision_overwrites_existing_entry() {
        let service = SimDialService::new();
        provision(&service, "Acme VPN", "old.example.com").unwrap();
        provision(&service, "Acme VPN", "new.example.com").unwrap();

        let entry = service.entry("Acme VPN").unwrap();
        assert_eq!(entry.remote_host, "new.example.com");
    }

    #[test]
    fn test_provision_rejects_invalid_name() {
        let service = SimDialService::new();
        let err = provision(&service, "bad\\name", "vpn.example.com").unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
        assert!(service.entry("bad\\name").is_none());
    }

    #[test]
    fn test_provision_keeps_template_device_without_ikev2() {
        let service = SimDialService::new();
        service.set_transport_devices(vec![crate::core::dial_service::TransportDevice {
            name: "WAN Miniport (PPTP)".to_string(),
            kind: DeviceKind::Vpn,
        }]);
        provision(&service, "Acme VPN", "vpn.example.com").unwrap();

        let entry = service.entry("Acme VPN").unwrap();
        // Template device survives; strategy is still pinned to IKEv2
        assert_eq!(entry.strategy, VpnStrategy::Ikev2Only);
    }
}
