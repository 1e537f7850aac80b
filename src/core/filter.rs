//! Filter rule data structures for the kill-switch rule engine
//!
//! This module defines the declarative descriptor for one firewall rule as
//! handed to the filtering engine:
//!
//! - A stable [`Uuid`] identity, reused across re-engagements so stale rules
//!   from a previous run (or a crash) can be found and deleted by key
//! - The traffic [`Layer`] the rule hooks (outbound connect, IPv4 or IPv6)
//! - A block/permit [`RuleAction`] and an evaluation weight (higher wins)
//! - A persistence flag (survive reboot, an engine-side property)
//! - An ordered list of [`MatchCondition`]s
//!
//! # Condition semantics
//!
//! The engine ANDs conditions on *different* fields and ORs conditions on the
//! *same* field. A permit rule carrying eight `RemotePort` conditions matches
//! traffic to any one of those ports; a block rule carrying `NotLoopback` and
//! `NotInterface` applies only to traffic that is neither loopback nor on the
//! exempted interface.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// Identity of the legacy block filter installed by pre-IKEv2 builds.
/// Deleted on every disengage and honoured by the engagement query so an
/// upgrade never leaves the old filter behind.
pub const LEGACY_BLOCK_RULE: Uuid = Uuid::from_u128(0xcd69ac10_275d_43a0_b369_a250fb886769);

/// Block-all outbound IPv4 connects (the rule whose presence defines
/// "engaged")
pub const BLOCK_ALL_V4: Uuid = Uuid::from_u128(0x68a634d6_ee7b_43be_8596_7e665b91e550);
/// Permit the IPv4 multicast range
pub const ALLOW_MULTICAST_V4: Uuid = Uuid::from_u128(0xb984250c_303b_4d45_b30a_29cd724a32eb);
/// Permit the fixed outbound port set (IKE/NAT-T/DHCP/SSDP/mDNS)
pub const ALLOW_PORTS_V4: Uuid = Uuid::from_u128(0x182cf284_d352_4642_9777_4ab1ed6397e8);
/// Permit caller-supplied remote addresses
pub const ALLOW_REMOTE_V4: Uuid = Uuid::from_u128(0x4a662297_0732_4447_9fdd_978e21bea71d);
/// Permit caller-supplied local addresses
pub const ALLOW_LOCAL_V4: Uuid = Uuid::from_u128(0xc352c8f7_1c3e_457f_992c_bd16023bf6a4);

/// Block-all outbound IPv6 connects
pub const BLOCK_ALL_V6: Uuid = Uuid::from_u128(0x42d15e5e_9d38_41ea_a043_91cb258a9f4e);
/// Permit IPv6 link-local destinations
pub const ALLOW_LINK_LOCAL_V6: Uuid = Uuid::from_u128(0x45ae7951_6cc7_47e6_aea2_4b8de1a62436);
/// Permit the IPv6 loopback address
pub const ALLOW_LOOPBACK_V6: Uuid = Uuid::from_u128(0xc81d01d1_8a99_46d6_adac_a92d2eff49da);
/// Permit the IPv6 multicast range
pub const ALLOW_MULTICAST_V6: Uuid = Uuid::from_u128(0x079c0fe3_9137_4820_b881_534296f797bc);

/// The sub-layer grouping every rule this crate installs
pub const SUBLAYER: Uuid = Uuid::from_u128(0x11466786_e3fe_4af2_9444_eae7b3f3cd25);

/// Every rule identity this crate has ever installed, in teardown order.
/// Disengage deletes each of these unconditionally; absence is not an error.
pub const KNOWN_RULE_IDENTITIES: [Uuid; 10] = [
    LEGACY_BLOCK_RULE,
    BLOCK_ALL_V4,
    ALLOW_MULTICAST_V4,
    ALLOW_PORTS_V4,
    ALLOW_REMOTE_V4,
    ALLOW_LOCAL_V4,
    BLOCK_ALL_V6,
    ALLOW_LINK_LOCAL_V6,
    ALLOW_LOOPBACK_V6,
    ALLOW_MULTICAST_V6,
];

/// Evaluation weight of the sub-layer itself relative to other sub-layers
pub const SUBLAYER_WEIGHT: u16 = 0x100;

/// Traffic hook a rule is attached to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Layer {
    /// Outbound connect authorization, IPv4
    #[strum(serialize = "outbound-connect-v4")]
    OutboundConnectV4,
    /// Outbound connect authorization, IPv6
    #[strum(serialize = "outbound-connect-v6")]
    OutboundConnectV6,
}

/// What happens to traffic matched by a rule
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
pub enum RuleAction {
    #[strum(serialize = "block")]
    Block,
    #[strum(serialize = "permit")]
    Permit,
}

/// Locally unique identifier of a network interface, used to exempt the
/// tunnel adapter from the block-all rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InterfaceLuid(pub u64);

impl fmt::Display for InterfaceLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "luid:{:#x}", self.0)
    }
}

/// Fields a condition can test. Conditions on the same field are ORed by the
/// engine, conditions across fields are ANDed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionField {
    Flags,
    LocalInterface,
    Application,
    RemoteAddress,
    LocalAddress,
    RemotePort,
}

/// One match condition of a filter rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchCondition {
    /// Rule applies only to traffic without the loopback flag
    NotLoopback,
    /// Rule applies only to traffic not bound to this interface
    NotInterface(InterfaceLuid),
    /// Rule applies only to traffic not originated by this executable
    /// (application identity derived from the file path by the engine)
    NotApplication(PathBuf),
    /// Remote address matches the network's address under its mask
    RemoteNetwork(IpNetwork),
    /// Local address matches the network's address under its mask
    LocalNetwork(IpNetwork),
    /// Remote address falls inside the inclusive range
    RemoteRange(IpAddr, IpAddr),
    /// Remote port equals the given port
    RemotePort(u16),
}

impl MatchCondition {
    /// The engine field this condition tests, used for OR-grouping
    pub const fn field(&self) -> ConditionField {
        match self {
            MatchCondition::NotLoopback => ConditionField::Flags,
            MatchCondition::NotInterface(_) => ConditionField::LocalInterface,
            MatchCondition::NotApplication(_) => ConditionField::Application,
            MatchCondition::RemoteNetwork(_) | MatchCondition::RemoteRange(_, _) => {
                ConditionField::RemoteAddress
            }
            MatchCondition::LocalNetwork(_) => ConditionField::LocalAddress,
            MatchCondition::RemotePort(_) => ConditionField::RemotePort,
        }
    }
}

impl fmt::Display for MatchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchCondition::NotLoopback => write!(f, "not loopback"),
            MatchCondition::NotInterface(luid) => write!(f, "not interface {luid}"),
            MatchCondition::NotApplication(path) => {
                write!(f, "not application {}", path.display())
            }
            MatchCondition::RemoteNetwork(net) => write!(f, "remote {net}"),
            MatchCondition::LocalNetwork(net) => write!(f, "local {net}"),
            MatchCondition::RemoteRange(lo, hi) => write!(f, "remote {lo}-{hi}"),
            MatchCondition::RemotePort(port) => write!(f, "remote port {port}"),
        }
    }
}

/// Declarative record of one firewall rule, as handed to the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterRule {
    /// Stable identity, globally unique per logical rule purpose
    pub key: Uuid,
    /// Display name shown by engine tooling
    pub name: String,
    /// Optional longer description
    pub description: Option<String>,
    pub layer: Layer,
    pub action: RuleAction,
    /// Tie-break priority within the sub-layer; higher evaluates first
    pub weight: u64,
    /// Survive reboot (engine-side property)
    pub persistent: bool,
    pub conditions: Vec<MatchCondition>,
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} w{}] {} {}",
            self.layer, self.weight, self.action, self.name
        )?;
        for cond in &self.conditions {
            write!(f, ", {cond}")?;
        }
        Ok(())
    }
}

/// A named priority bucket grouping related rules for coordinated evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sublayer {
    pub key: Uuid,
    pub name: String,
    pub description: String,
    pub weight: u16,
    pub persistent: bool,
}

impl Sublayer {
    /// The sub-layer this crate installs all of its rules under
    pub fn kill_switch(display_name: &str, persistent: bool) -> Self {
        Self {
            key: SUBLAYER,
            name: display_name.to_string(),
            description: "Kill switch filter sub-layer".to_string(),
            weight: SUBLAYER_WEIGHT,
            persistent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_known_identities_are_distinct() {
        let set: HashSet<Uuid> = KNOWN_RULE_IDENTITIES.iter().copied().collect();
        assert_eq!(set.len(), KNOWN_RULE_IDENTITIES.len());
        assert!(!set.contains(&SUBLAYER));
    }

    #[test]
    fn test_block_all_identity_is_stable() {
        // The engagement check keys off this exact value; changing it would
        // orphan rules installed by released builds.
        assert_eq!(
            BLOCK_ALL_V4.to_string(),
            "68a634d6-ee7b-43be-8596-7e665b91e550"
        );
        assert_eq!(SUBLAYER.to_string(), "11466786-e3fe-4af2-9444-eae7b3f3cd25");
    }

    #[test]
    fn test_remote_conditions_share_a_field() {
        let net: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let range = MatchCondition::RemoteRange("224.0.0.0".parse().unwrap(), "239.255.255.255".parse().unwrap());
        assert_eq!(
            MatchCondition::RemoteNetwork(net).field(),
            range.field()
        );
        assert_ne!(
            MatchCondition::RemotePort(500).field(),
            range.field()
        );
    }

    #[test]
    fn test_condition_serde_round_trip() {
        let cond = MatchCondition::NotInterface(InterfaceLuid(7));
        let json = serde_json::to_string(&cond).unwrap();
        let back: MatchCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(cond, back);
    }
}
