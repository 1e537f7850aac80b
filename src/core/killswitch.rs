//! Kill-switch controller: composes the fixed filter rule set and drives
//! engage/disengage/status through the filtering engine
//!
//! The rule set blocks all outbound connects on IPv4 and IPv6 except:
//!
//! - loopback traffic and the tunnel adapter (exemptions on the block rules)
//! - the tunnel process itself, by application identity (IPv4)
//! - multicast ranges, IPv6 link-local and loopback
//! - a fixed outbound port set used by IKE/NAT-T/DHCP/SSDP/mDNS
//! - caller-supplied remote and local address allowlists
//!
//! # Weights
//!
//! Weight assignment guarantees the block-all rule evaluates last among
//! same-layer rules (weight 0) and every permit rule evaluates before it,
//! so exceptions win regardless of insertion order.
//!
//! # Failure handling
//!
//! Engage always starts with a full teardown, making it idempotent and safe
//! to call over a partially-installed state left by a crash. Rule install is
//! transactional within one call: on failure, every rule added by that call
//! is deleted before the error is returned.

use crate::core::engine::{FilterEngine, FilterSession};
use crate::core::error::{Error, Result};
use crate::core::filter::{
    self, FilterRule, InterfaceLuid, Layer, MatchCondition, RuleAction, Sublayer,
};
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound remote ports that stay reachable while the switch is engaged:
/// DHCP (67, 68), IKE (500), NAT-T (4500), SSDP (1900), NAT-PMP/PCP
/// (5350, 5351), mDNS (5353)
pub const ALLOWED_OUTBOUND_PORTS: [u16; 8] = [67, 68, 500, 4500, 1900, 5350, 5351, 5353];

/// Block-all rules sit at the bottom of the sub-layer
const BLOCK_WEIGHT: u64 = 0;
const MULTICAST_V4_WEIGHT: u64 = 2;
const PORTS_WEIGHT: u64 = 3;
const REMOTE_ALLOW_WEIGHT: u64 = 3;
const LOCAL_ALLOW_WEIGHT: u64 = 4;
const ALLOW_V6_WEIGHT: u64 = 4;

const BLOCK_DESCRIPTION: &str = "Prevents IP leaks when unexpectedly disconnected";

/// Arguments to [`KillSwitch::engage`], mirroring the exported boundary
#[derive(Debug, Clone)]
pub struct EngageParams {
    /// Remote addresses (exact or masked) that stay reachable
    pub remote_allow: Vec<IpNetwork>,
    /// Local addresses traffic may still originate from
    pub local_allow: Vec<IpNetwork>,
    /// Tunnel adapter to exempt from blocking, by LUID
    pub tunnel_adapter: Option<InterfaceLuid>,
    /// Tunnel process to exempt from blocking, by executable path
    pub tunnel_process: Option<PathBuf>,
    /// Ask the engine to keep the rules across reboots
    pub persist: bool,
    /// Display name stamped on every installed filter object
    pub display_name: String,
}

impl Default for EngageParams {
    fn default() -> Self {
        Self {
            remote_allow: Vec::new(),
            local_allow: Vec::new(),
            tunnel_adapter: None,
            tunnel_process: None,
            persist: false,
            display_name: "vpnguard kill switch".to_string(),
        }
    }
}

/// Result of the engagement query.
///
/// `Indeterminate` means the engine could not be consulted; it is reported
/// separately so callers never mistake an engine failure for "not engaged".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngagedState {
    Engaged,
    NotEngaged,
    Indeterminate(String),
}

impl EngagedState {
    /// True only for a confirmed engagement
    pub fn is_engaged(&self) -> bool {
        matches!(self, EngagedState::Engaged)
    }
}

impl fmt::Display for EngagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngagedState::Engaged => write!(f, "engaged"),
            EngagedState::NotEngaged => write!(f, "not engaged"),
            EngagedState::Indeterminate(reason) => write!(f, "indeterminate ({reason})"),
        }
    }
}

/// Builds the ordered rule plan for one engagement.
///
/// Rules appear in install order: IPv4 block-all, multicast, outbound ports,
/// remote allowlist, local allowlist, then IPv6 block-all, link-local,
/// loopback, multicast. Allowlist rules with no entries are omitted; a rule
/// with an empty condition list would match all traffic at its layer and
/// silently permit everything.
pub fn rule_plan(params: &EngageParams) -> Vec<FilterRule> {
    let mut plan = Vec::with_capacity(9);

    // IPv4: block everything except loopback, the tunnel adapter and the
    // tunnel process
    let mut block_conditions = vec![MatchCondition::NotLoopback];
    if let Some(luid) = params.tunnel_adapter {
        block_conditions.push(MatchCondition::NotInterface(luid));
    }
    if let Some(ref path) = params.tunnel_process {
        block_conditions.push(MatchCondition::NotApplication(path.clone()));
    }
    plan.push(FilterRule {
        key: filter::BLOCK_ALL_V4,
        name: params.display_name.clone(),
        description: Some(BLOCK_DESCRIPTION.to_string()),
        layer: Layer::OutboundConnectV4,
        action: RuleAction::Block,
        weight: BLOCK_WEIGHT,
        persistent: params.persist,
        conditions: block_conditions,
    });

    plan.push(FilterRule {
        key: filter::ALLOW_MULTICAST_V4,
        name: params.display_name.clone(),
        description: None,
        layer: Layer::OutboundConnectV4,
        action: RuleAction::Permit,
        weight: MULTICAST_V4_WEIGHT,
        persistent: params.persist,
        conditions: vec![MatchCondition::RemoteRange(
            IpAddr::V4("224.0.0.0".parse().unwrap()),
            IpAddr::V4("239.255.255.255".parse().unwrap()),
        )],
    });

    plan.push(FilterRule {
        key: filter::ALLOW_PORTS_V4,
        name: params.display_name.clone(),
        description: None,
        layer: Layer::OutboundConnectV4,
        action: RuleAction::Permit,
        weight: PORTS_WEIGHT,
        persistent: params.persist,
        conditions: ALLOWED_OUTBOUND_PORTS
            .iter()
            .map(|port| MatchCondition::RemotePort(*port))
            .collect(),
    });

    if !params.remote_allow.is_empty() {
        plan.push(FilterRule {
            key: filter::ALLOW_REMOTE_V4,
            name: params.display_name.clone(),
            description: None,
            layer: Layer::OutboundConnectV4,
            action: RuleAction::Permit,
            weight: REMOTE_ALLOW_WEIGHT,
            persistent: params.persist,
            conditions: params
                .remote_allow
                .iter()
                .map(|net| MatchCondition::RemoteNetwork(*net))
                .collect(),
        });
    }

    if !params.local_allow.is_empty() {
        plan.push(FilterRule {
            key: filter::ALLOW_LOCAL_V4,
            name: params.display_name.clone(),
            description: None,
            layer: Layer::OutboundConnectV4,
            action: RuleAction::Permit,
            weight: LOCAL_ALLOW_WEIGHT,
            persistent: params.persist,
            conditions: params
                .local_allow
                .iter()
                .map(|net| MatchCondition::LocalNetwork(*net))
                .collect(),
        });
    }

    // IPv6: block everything except loopback and the tunnel adapter; permit
    // link-local, loopback and multicast destinations
    let mut block_v6_conditions = vec![MatchCondition::NotLoopback];
    if let Some(luid) = params.tunnel_adapter {
        block_v6_conditions.push(MatchCondition::NotInterface(luid));
    }
    plan.push(FilterRule {
        key: filter::BLOCK_ALL_V6,
        name: params.display_name.clone(),
        description: Some(BLOCK_DESCRIPTION.to_string()),
        layer: Layer::OutboundConnectV6,
        action: RuleAction::Block,
        weight: BLOCK_WEIGHT,
        persistent: params.persist,
        conditions: block_v6_conditions,
    });

    plan.push(FilterRule {
        key: filter::ALLOW_LINK_LOCAL_V6,
        name: params.display_name.clone(),
        description: None,
        layer: Layer::OutboundConnectV6,
        action: RuleAction::Permit,
        weight: ALLOW_V6_WEIGHT,
        persistent: params.persist,
        conditions: vec![MatchCondition::RemoteRange(
            IpAddr::V6("fe80::".parse().unwrap()),
            IpAddr::V6("fe80::ffff:ffff:ffff:ffff".parse().unwrap()),
        )],
    });

    plan.push(FilterRule {
        key: filter::ALLOW_LOOPBACK_V6,
        name: params.display_name.clone(),
        description: None,
        layer: Layer::OutboundConnectV6,
        action: RuleAction::Permit,
        weight: ALLOW_V6_WEIGHT,
        persistent: params.persist,
        conditions: vec![MatchCondition::RemoteNetwork(
            "::1/128".parse().unwrap(),
        )],
    });

    plan.push(FilterRule {
        key: filter::ALLOW_MULTICAST_V6,
        name: params.display_name.clone(),
        description: None,
        layer: Layer::OutboundConnectV6,
        action: RuleAction::Permit,
        weight: ALLOW_V6_WEIGHT,
        persistent: params.persist,
        conditions: vec![MatchCondition::RemoteRange(
            IpAddr::V6("ff00::".parse().unwrap()),
            IpAddr::V6("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap()),
        )],
    });

    plan
}

/// Renders a rule plan as human-readable text for preview
pub fn plan_text(plan: &[FilterRule]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "# kill-switch rule plan ({} rules)", plan.len());
    for rule in plan {
        let _ = writeln!(out, "{rule}");
    }
    out
}

/// Drives engage/disengage/status against a filtering engine
pub struct KillSwitch<E> {
    engine: E,
}

impl<E: FilterEngine> KillSwitch<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Engages the kill switch: tears down any previous rule set, recreates
    /// the sub-layer, and installs the full plan.
    ///
    /// # Errors
    ///
    /// Returns the first engine error. Rules already added by this call are
    /// deleted before returning, so a failed engage leaves no partial state.
    pub fn engage(&self, params: &EngageParams) -> Result<()> {
        info!(
            remote = params.remote_allow.len(),
            local = params.local_allow.len(),
            adapter = ?params.tunnel_adapter,
            persist = params.persist,
            "engaging kill switch"
        );

        // Enabling is always preceded by a full teardown so a re-engage or a
        // partially-installed state from a crash never conflicts by identity.
        self.disengage()?;

        let plan = rule_plan(params);
        let mut session = self.engine.open()?;

        let sublayer = Sublayer::kill_switch(&params.display_name, params.persist);
        match session.add_sublayer(&sublayer) {
            Ok(()) => {}
            Err(Error::RuleConflict(_)) => {
                debug!("sub-layer already present, recreating");
                session.delete_sublayer(filter::SUBLAYER)?;
                session.add_sublayer(&sublayer)?;
            }
            Err(err) => return Err(err),
        }

        let mut installed: Vec<Uuid> = Vec::with_capacity(plan.len());
        for rule in &plan {
            if let Err(err) = session.add_rule(rule) {
                warn!(rule = %rule.name, key = %rule.key, error = %err, "rule install failed, rolling back");
                for key in installed.iter().rev() {
                    if let Err(undo_err) = session.delete_rule(*key) {
                        warn!(key = %key, error = %undo_err, "rollback delete failed");
                    }
                }
                return Err(err);
            }
            installed.push(rule.key);
        }

        info!(rules = installed.len(), "kill switch engaged");
        Ok(())
    }

    /// Disengages the kill switch by deleting every rule identity this crate
    /// has ever installed. Deletion is best-effort: absence of a rule is not
    /// an error and a delete failure does not stop the remaining deletes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineUnavailable`] if no session could be opened.
    pub fn disengage(&self) -> Result<()> {
        let mut session = self.engine.open()?;

        for key in filter::KNOWN_RULE_IDENTITIES {
            if let Err(err) = session.delete_rule(key) {
                warn!(key = %key, error = %err, "rule delete failed, continuing teardown");
            }
        }

        info!("kill switch disengaged");
        Ok(())
    }

    /// Queries the engine for the well-known block-all identity. No state is
    /// cached; every call round-trips to the engine, so an external reset is
    /// always observed.
    pub fn status(&self) -> EngagedState {
        let session = match self.engine.open() {
            Ok(session) => session,
            Err(err) => return EngagedState::Indeterminate(err.to_string()),
        };

        match session.find_rule(filter::BLOCK_ALL_V4) {
            Ok(true) => EngagedState::Engaged,
            Ok(false) => match session.find_rule(filter::LEGACY_BLOCK_RULE) {
                Ok(true) => EngagedState::Engaged,
                Ok(false) => EngagedState::NotEngaged,
                Err(err) => EngagedState::Indeterminate(err.to_string()),
            },
            Err(err) => EngagedState::Indeterminate(err.to_string()),
        }
    }
}
