//! Windows Filtering Platform backend for the filter-engine traits
//!
//! One [`WfpSession`] wraps one open engine handle; the handle is closed in
//! `Drop`, so it is released on every exit path. Filter objects are
//! translated field for field from the crate's declarative descriptors;
//! backing storage for condition values lives in a [`ConditionStorage`]
//! that outlives the engine call.

use crate::core::engine::{FilterEngine, FilterSession};
use crate::core::error::{Error, Result};
use crate::core::filter::{FilterRule, Layer, MatchCondition, RuleAction, Sublayer};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::Path;
use std::ptr;
use tracing::debug;
use uuid::Uuid;
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::*;

// RPC authentication constant
const RPC_C_AUTHN_DEFAULT: u32 = 0xFFFF_FFFF;

fn guid_of(key: Uuid) -> GUID {
    GUID::from_u128(key.as_u128())
}

fn uuid_of(guid: &GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn layer_guid(layer: Layer) -> GUID {
    match layer {
        Layer::OutboundConnectV4 => FWPM_LAYER_ALE_AUTH_CONNECT_V4,
        Layer::OutboundConnectV6 => FWPM_LAYER_ALE_AUTH_CONNECT_V6,
    }
}

/// Owns every value the engine receives by pointer, for the lifetime of one
/// add call
#[derive(Default)]
struct ConditionStorage {
    u64s: Vec<Box<u64>>,
    v4_masks: Vec<Box<FWP_V4_ADDR_AND_MASK>>,
    v6_masks: Vec<Box<FWP_V6_ADDR_AND_MASK>>,
    ranges: Vec<Box<FWP_RANGE0>>,
    byte_arrays: Vec<Box<FWP_BYTE_ARRAY16>>,
    app_ids: Vec<*mut FWP_BYTE_BLOB>,
    wide_strings: Vec<Vec<u16>>,
}

impl ConditionStorage {
    fn keep_u64(&mut self, value: u64) -> *mut u64 {
        self.u64s.push(Box::new(value));
        ptr::from_mut(self.u64s.last_mut().unwrap().as_mut())
    }

    fn keep_v4_mask(&mut self, net: &IpNetwork) -> *mut FWP_V4_ADDR_AND_MASK {
        let (addr, mask) = match net {
            IpNetwork::V4(v4) => (u32::from(v4.ip()), u32::from(v4.mask())),
            IpNetwork::V6(_) => (0, 0),
        };
        self.v4_masks.push(Box::new(FWP_V4_ADDR_AND_MASK { addr, mask }));
        ptr::from_mut(self.v4_masks.last_mut().unwrap().as_mut())
    }

    fn keep_v6_mask(&mut self, net: &IpNetwork) -> *mut FWP_V6_ADDR_AND_MASK {
        let (addr, prefix) = match net {
            IpNetwork::V6(v6) => (v6.ip().octets(), v6.prefix()),
            IpNetwork::V4(_) => ([0u8; 16], 0),
        };
        self.v6_masks.push(Box::new(FWP_V6_ADDR_AND_MASK {
            addr,
            prefixLength: prefix,
        }));
        ptr::from_mut(self.v6_masks.last_mut().unwrap().as_mut())
    }

    fn keep_byte_array(&mut self, octets: [u8; 16]) -> *mut FWP_BYTE_ARRAY16 {
        self.byte_arrays
            .push(Box::new(FWP_BYTE_ARRAY16 { byteArray16: octets }));
        ptr::from_mut(self.byte_arrays.last_mut().unwrap().as_mut())
    }

    fn keep_range(&mut self, lo: IpAddr, hi: IpAddr) -> *mut FWP_RANGE0 {
        let mut range = FWP_RANGE0::default();
        match (lo, hi) {
            (IpAddr::V4(l), IpAddr::V4(h)) => {
                range.valueLow.r#type = FWP_UINT32;
                range.valueLow.Anonymous.uint32 = u32::from(l);
                range.valueHigh.r#type = FWP_UINT32;
                range.valueHigh.Anonymous.uint32 = u32::from(h);
            }
            (IpAddr::V6(l), IpAddr::V6(h)) => {
                range.valueLow.r#type = FWP_BYTE_ARRAY16_TYPE;
                range.valueLow.Anonymous.byteArray16 = self.keep_byte_array(l.octets());
                range.valueHigh.r#type = FWP_BYTE_ARRAY16_TYPE;
                range.valueHigh.Anonymous.byteArray16 = self.keep_byte_array(h.octets());
            }
            _ => {}
        }
        self.ranges.push(Box::new(range));
        ptr::from_mut(self.ranges.last_mut().unwrap().as_mut())
    }

    fn keep_app_id(&mut self, engine: HANDLE, path: &Path) -> Result<*mut FWP_BYTE_BLOB> {
        let _ = engine;
        let wide = to_wide(&path.to_string_lossy());
        let mut blob: *mut FWP_BYTE_BLOB = ptr::null_mut();
        let status = unsafe { FwpmGetAppIdFromFileName0(PCWSTR(wide.as_ptr()), &mut blob) };
        if status != 0 {
            return Err(Error::Internal(format!(
                "no application identity for {}: {status:#010x}",
                path.display()
            )));
        }
        self.app_ids.push(blob);
        Ok(blob)
    }

    fn keep_wide(&mut self, s: &str) -> PWSTR {
        self.wide_strings.push(to_wide(s));
        PWSTR(self.wide_strings.last_mut().unwrap().as_mut_ptr())
    }
}

impl Drop for ConditionStorage {
    fn drop(&mut self) {
        for blob in &mut self.app_ids {
            unsafe {
                FwpmFreeMemory0(ptr::from_mut(blob).cast());
            }
        }
    }
}

/// Windows Filtering Platform engine factory
#[derive(Clone, Copy, Default)]
pub struct WfpEngine;

impl WfpEngine {
    pub fn new() -> Self {
        Self
    }
}

impl FilterEngine for WfpEngine {
    type Session = WfpSession;

    fn open(&self) -> Result<Self::Session> {
        let mut handle = HANDLE::default();
        let status = unsafe {
            FwpmEngineOpen0(None, RPC_C_AUTHN_DEFAULT, None, None, &mut handle)
        };
        if status != 0 {
            return Err(Error::EngineUnavailable(format!(
                "FwpmEngineOpen0 failed: {status:#010x}"
            )));
        }
        debug!("filter engine session opened");
        Ok(WfpSession { handle })
    }
}

/// One open WFP engine handle
pub struct WfpSession {
    handle: HANDLE,
}

// SAFETY: the engine handle is a thin pointer and the WFP API is
// thread-safe per session
unsafe impl Send for WfpSession {}

impl Drop for WfpSession {
    fn drop(&mut self) {
        if !self.handle.is_invalid() {
            unsafe {
                let _ = FwpmEngineClose0(self.handle);
            }
            debug!("filter engine session closed");
        }
    }
}

impl WfpSession {
    fn build_condition(
        &self,
        cond: &MatchCondition,
        storage: &mut ConditionStorage,
    ) -> Result<FWPM_FILTER_CONDITION0> {
        let mut out = FWPM_FILTER_CONDITION0::default();
        match cond {
            MatchCondition::NotLoopback => {
                out.fieldKey = FWPM_CONDITION_FLAGS;
                out.matchType = FWP_MATCH_FLAGS_NONE_SET;
                out.conditionValue.r#type = FWP_UINT32;
                out.conditionValue.Anonymous.uint32 = FWP_CONDITION_FLAG_IS_LOOPBACK;
            }
            MatchCondition::NotInterface(luid) => {
                out.fieldKey = FWPM_CONDITION_IP_LOCAL_INTERFACE;
                out.matchType = FWP_MATCH_NOT_EQUAL;
                out.conditionValue.r#type = FWP_UINT64;
                out.conditionValue.Anonymous.uint64 = storage.keep_u64(luid.0);
            }
            MatchCondition::NotApplication(path) => {
                out.fieldKey = FWPM_CONDITION_ALE_APP_ID;
                out.matchType = FWP_MATCH_NOT_EQUAL;
                out.conditionValue.r#type = FWP_BYTE_BLOB_TYPE;
                out.conditionValue.Anonymous.byteBlob = storage.keep_app_id(self.handle, path)?;
            }
            MatchCondition::RemoteNetwork(net) => {
                out.fieldKey = FWPM_CONDITION_IP_REMOTE_ADDRESS;
                out.matchType = FWP_MATCH_EQUAL;
                if net.is_ipv4() {
                    out.conditionValue.r#type = FWP_V4_ADDR_MASK;
                    out.conditionValue.Anonymous.v4AddrMask = storage.keep_v4_mask(net);
                } else {
                    out.conditionValue.r#type = FWP_V6_ADDR_MASK;
                    out.conditionValue.Anonymous.v6AddrMask = storage.keep_v6_mask(net);
                }
            }
            MatchCondition::LocalNetwork(net) => {
                out.fieldKey = FWPM_CONDITION_IP_LOCAL_ADDRESS;
                out.matchType = FWP_MATCH_EQUAL;
                if net.is_ipv4() {
                    out.conditionValue.r#type = FWP_V4_ADDR_MASK;
                    out.conditionValue.Anonymous.v4AddrMask = storage.keep_v4_mask(net);
                } else {
                    out.conditionValue.r#type = FWP_V6_ADDR_MASK;
                    out.conditionValue.Anonymous.v6AddrMask = storage.keep_v6_mask(net);
                }
            }
            MatchCondition::RemoteRange(lo, hi) => {
                out.fieldKey = FWPM_CONDITION_IP_REMOTE_ADDRESS;
                out.matchType = FWP_MATCH_RANGE;
                out.conditionValue.r#type = FWP_RANGE_TYPE;
                out.conditionValue.Anonymous.rangeValue = storage.keep_range(*lo, *hi);
            }
            MatchCondition::RemotePort(port) => {
                out.fieldKey = FWPM_CONDITION_IP_REMOTE_PORT;
                out.matchType = FWP_MATCH_EQUAL;
                out.conditionValue.r#type = FWP_UINT16;
                out.conditionValue.Anonymous.uint16 = *port;
            }
        }
        Ok(out)
    }
}

impl FilterSession for WfpSession {
    fn add_sublayer(&mut self, sublayer: &Sublayer) -> Result<()> {
        let mut storage = ConditionStorage::default();
        let mut native = FWPM_SUBLAYER0 {
            subLayerKey: guid_of(sublayer.key),
            weight: sublayer.weight,
            ..Default::default()
        };
        native.displayData.name = storage.keep_wide(&sublayer.name);
        native.displayData.description = storage.keep_wide(&sublayer.description);
        if sublayer.persistent {
            native.flags = FWPM_SUBLAYER_FLAG_PERSISTENT;
        }

        let status = unsafe { FwpmSubLayerAdd0(self.handle, &native, None) };
        match status {
            0 => Ok(()),
            s if s == FWP_E_ALREADY_EXISTS.0 as u32 => Err(Error::RuleConflict(sublayer.key)),
            s => Err(Error::Internal(format!(
                "FwpmSubLayerAdd0 failed: {s:#010x}"
            ))),
        }
    }

    fn delete_sublayer(&mut self, key: Uuid) -> Result<()> {
        let status = unsafe { FwpmSubLayerDeleteByKey0(self.handle, &guid_of(key)) };
        match status {
            0 => Ok(()),
            s if s == FWP_E_SUBLAYER_NOT_FOUND.0 as u32 => Ok(()),
            s => Err(Error::Internal(format!(
                "FwpmSubLayerDeleteByKey0 failed: {s:#010x}"
            ))),
        }
    }

    fn add_rule(&mut self, rule: &FilterRule) -> Result<()> {
        let mut storage = ConditionStorage::default();

        let mut conditions = Vec::with_capacity(rule.conditions.len());
        for cond in &rule.conditions {
            conditions.push(self.build_condition(cond, &mut storage)?);
        }

        let mut native = FWPM_FILTER0 {
            filterKey: guid_of(rule.key),
            layerKey: layer_guid(rule.layer),
            subLayerKey: guid_of(crate::core::filter::SUBLAYER),
            numFilterConditions: u32::try_from(conditions.len()).unwrap_or(0),
            filterCondition: conditions.as_mut_ptr(),
            ..Default::default()
        };
        native.displayData.name = storage.keep_wide(&rule.name);
        if let Some(ref description) = rule.description {
            native.displayData.description = storage.keep_wide(description);
        }
        native.action.r#type = match rule.action {
            RuleAction::Block => FWP_ACTION_BLOCK,
            RuleAction::Permit => FWP_ACTION_PERMIT,
        };
        // Block rules carry an explicit 64-bit weight of zero so they sort
        // below every permit; permits fit in the 8-bit weight band
        if rule.weight == 0 {
            native.weight.r#type = FWP_UINT64;
            native.weight.Anonymous.uint64 = storage.keep_u64(0);
        } else {
            native.weight.r#type = FWP_UINT8;
            native.weight.Anonymous.uint8 = u8::try_from(rule.weight).unwrap_or(u8::MAX);
        }
        if rule.persistent {
            native.flags = FWPM_FILTER_FLAG_PERSISTENT;
        }

        let mut filter_id: u64 = 0;
        let status =
            unsafe { FwpmFilterAdd0(self.handle, &native, None, Some(&mut filter_id)) };
        match status {
            0 => {
                debug!(key = %rule.key, filter_id, "filter installed");
                Ok(())
            }
            s if s == FWP_E_ALREADY_EXISTS.0 as u32 => Err(Error::RuleConflict(rule.key)),
            s => Err(Error::Internal(format!("FwpmFilterAdd0 failed: {s:#010x}"))),
        }
    }

    fn delete_rule(&mut self, key: Uuid) -> Result<()> {
        let status = unsafe { FwpmFilterDeleteByKey0(self.handle, &guid_of(key)) };
        match status {
            0 => Ok(()),
            s if s == FWP_E_FILTER_NOT_FOUND.0 as u32 => Ok(()),
            s => Err(Error::Internal(format!(
                "FwpmFilterDeleteByKey0 failed: {s:#010x}"
            ))),
        }
    }

    fn find_rule(&self, key: Uuid) -> Result<bool> {
        let mut filter: *mut FWPM_FILTER0 = ptr::null_mut();
        let status = unsafe { FwpmFilterGetByKey0(self.handle, &guid_of(key), &mut filter) };
        if !filter.is_null() {
            debug_assert_eq!(uuid_of(&unsafe { *filter }.filterKey), key);
            unsafe {
                FwpmFreeMemory0(ptr::from_mut(&mut filter).cast());
            }
        }
        match status {
            0 => Ok(true),
            s if s == FWP_E_FILTER_NOT_FOUND.0 as u32 => Ok(false),
            s => Err(Error::Internal(format!(
                "FwpmFilterGetByKey0 failed: {s:#010x}"
            ))),
        }
    }
}
