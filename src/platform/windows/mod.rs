//! Windows backends: WFP filter engine and RAS dial subsystem

pub mod ras;
pub mod wfp;

use crate::core::error::{Error, Result};
use crate::core::filter::InterfaceLuid;
use windows::Win32::NetworkManagement::IpHelper::ConvertInterfaceIndexToLuid;
use windows::Win32::NetworkManagement::Ndis::NET_LUID_LH;

/// Resolves an interface index (as shown by `vpnguard interfaces`) to the
/// LUID the filter engine conditions on.
pub fn adapter_luid(index: u32) -> Result<InterfaceLuid> {
    let mut luid = NET_LUID_LH::default();
    let status = unsafe { ConvertInterfaceIndexToLuid(index, &mut luid) };
    if status.is_err() {
        return Err(Error::Internal(format!(
            "no LUID for interface index {index}"
        )));
    }
    Ok(InterfaceLuid(unsafe { luid.Value }))
}
