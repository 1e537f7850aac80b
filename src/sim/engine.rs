//! In-memory filtering engine
//!
//! Stores sub-layers and rules keyed by identity, enforces the same
//! identity-conflict behavior as the OS engine, and evaluates simulated
//! packets against the installed rule set: conditions on the same field are
//! ORed, conditions across fields are ANDed, and rules are tried in
//! weight-descending order with the first match deciding the verdict.

use crate::core::engine::{FilterEngine, FilterSession};
use crate::core::error::{Error, Result};
use crate::core::filter::{
    ConditionField, FilterRule, InterfaceLuid, Layer, MatchCondition, RuleAction, Sublayer,
};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What the engine would do with a simulated packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Permit,
    Block,
}

/// A simulated outbound connect, matched against the installed rules
#[derive(Debug, Clone)]
pub struct SimPacket {
    pub layer: Layer,
    pub remote: IpAddr,
    pub local: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub loopback: bool,
    pub interface: Option<InterfaceLuid>,
    pub application: Option<PathBuf>,
}

impl SimPacket {
    pub fn outbound_v4(remote: Ipv4Addr) -> Self {
        Self {
            layer: Layer::OutboundConnectV4,
            remote: IpAddr::V4(remote),
            local: None,
            remote_port: None,
            loopback: false,
            interface: None,
            application: None,
        }
    }

    pub fn outbound_v6(remote: Ipv6Addr) -> Self {
        Self {
            layer: Layer::OutboundConnectV6,
            remote: IpAddr::V6(remote),
            local: None,
            remote_port: None,
            loopback: false,
            interface: None,
            application: None,
        }
    }

    pub fn to_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn from_local(mut self, local: IpAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn on_interface(mut self, luid: InterfaceLuid) -> Self {
        self.interface = Some(luid);
        self
    }

    pub fn from_application(mut self, path: impl Into<PathBuf>) -> Self {
        self.application = Some(path.into());
        self
    }

    pub fn loopback(mut self) -> Self {
        self.loopback = true;
        self
    }
}

#[derive(Default)]
struct EngineState {
    rules: Mutex<HashMap<Uuid, FilterRule>>,
    sublayers: Mutex<HashMap<Uuid, Sublayer>>,
    /// When set, `open()` fails with `EngineUnavailable`
    open_error: Mutex<Option<String>>,
    /// Keys whose install is scripted to fail
    failing_adds: Mutex<HashSet<Uuid>>,
}

/// In-memory filtering engine; clones share state
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<EngineState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts every subsequent `open()` to fail, as when the OS service is
    /// down or the caller lacks permissions
    pub fn set_open_error(&self, message: impl Into<String>) {
        *self.state.open_error.lock().unwrap() = Some(message.into());
    }

    pub fn clear_open_error(&self) {
        *self.state.open_error.lock().unwrap() = None;
    }

    /// Scripts the install of the given identity to fail
    pub fn fail_add_of(&self, key: Uuid) {
        self.state.failing_adds.lock().unwrap().insert(key);
    }

    /// Installed rule identities, for enumeration-based assertions
    pub fn installed_keys(&self) -> HashSet<Uuid> {
        self.state.rules.lock().unwrap().keys().copied().collect()
    }

    /// Snapshot of the installed rules
    pub fn rules(&self) -> Vec<FilterRule> {
        self.state.rules.lock().unwrap().values().cloned().collect()
    }

    pub fn has_sublayer(&self, key: Uuid) -> bool {
        self.state.sublayers.lock().unwrap().contains_key(&key)
    }

    /// Pre-seeds a sub-layer, as left behind by an earlier run
    pub fn seed_sublayer(&self, sublayer: Sublayer) {
        self.state
            .sublayers
            .lock()
            .unwrap()
            .insert(sublayer.key, sublayer);
    }

    /// Pre-seeds a rule, as left behind by a crash mid-install
    pub fn seed_rule(&self, rule: FilterRule) {
        self.state.rules.lock().unwrap().insert(rule.key, rule);
    }

    /// Evaluates a simulated packet against the installed rules. Higher
    /// weight evaluates first; the first matching rule decides. With no
    /// match the sub-layer abstains, which the engine treats as permit.
    pub fn evaluate(&self, packet: &SimPacket) -> Verdict {
        let rules = self.state.rules.lock().unwrap();
        let mut candidates: Vec<&FilterRule> = rules
            .values()
            .filter(|rule| rule.layer == packet.layer)
            .collect();
        candidates.sort_by_key(|rule| Reverse(rule.weight));

        for rule in candidates {
            if rule_matches(rule, packet) {
                return match rule.action {
                    RuleAction::Permit => Verdict::Permit,
                    RuleAction::Block => Verdict::Block,
                };
            }
        }
        Verdict::Permit
    }
}

/// A rule applies when, for every field it conditions on, at least one of
/// that field's conditions matches
fn rule_matches(rule: &FilterRule, packet: &SimPacket) -> bool {
    let mut fields: HashMap<ConditionField, bool> = HashMap::new();
    for cond in &rule.conditions {
        let hit = condition_matches(cond, packet);
        let slot = fields.entry(cond.field()).or_insert(false);
        *slot = *slot || hit;
    }
    fields.values().all(|hit| *hit)
}

fn condition_matches(cond: &MatchCondition, packet: &SimPacket) -> bool {
    match cond {
        MatchCondition::NotLoopback => !packet.loopback,
        MatchCondition::NotInterface(luid) => packet.interface != Some(*luid),
        MatchCondition::NotApplication(path) => {
            packet.application.as_deref() != Some(path.as_path())
        }
        MatchCondition::RemoteNetwork(net) => net.contains(packet.remote),
        MatchCondition::LocalNetwork(net) => packet.local.is_some_and(|local| net.contains(local)),
        MatchCondition::RemoteRange(lo, hi) => address_in_range(packet.remote, *lo, *hi),
        MatchCondition::RemotePort(port) => packet.remote_port == Some(*port),
    }
}

fn address_in_range(addr: IpAddr, lo: IpAddr, hi: IpAddr) -> bool {
    match (addr, lo, hi) {
        (IpAddr::V4(a), IpAddr::V4(l), IpAddr::V4(h)) => l <= a && a <= h,
        (IpAddr::V6(a), IpAddr::V6(l), IpAddr::V6(h)) => l <= a && a <= h,
        _ => false,
    }
}

/// One open session against the in-memory engine
pub struct MemorySession {
    state: Arc<EngineState>,
}

impl FilterEngine for MemoryEngine {
    type Session = MemorySession;

    fn open(&self) -> Result<Self::Session> {
        if let Some(message) = self.state.open_error.lock().unwrap().clone() {
            return Err(Error::EngineUnavailable(message));
        }
        Ok(MemorySession {
            state: Arc::clone(&self.state),
        })
    }
}

impl FilterSession for MemorySession {
    fn add_sublayer(&mut self, sublayer: &Sublayer) -> Result<()> {
        let mut sublayers = self.state.sublayers.lock().unwrap();
        if sublayers.contains_key(&sublayer.key) {
            return Err(Error::RuleConflict(sublayer.key));
        }
        sublayers.insert(sublayer.key, sublayer.clone());
        Ok(())
    }

    fn delete_sublayer(&mut self, key: Uuid) -> Result<()> {
        self.state.sublayers.lock().unwrap().remove(&key);
        Ok(())
    }

    fn add_rule(&mut self, rule: &FilterRule) -> Result<()> {
        if self.state.failing_adds.lock().unwrap().contains(&rule.key) {
            return Err(Error::Internal(format!(
                "scripted install failure for {}",
                rule.key
            )));
        }
        let mut rules = self.state.rules.lock().unwrap();
        if rules.contains_key(&rule.key) {
            return Err(Error::RuleConflict(rule.key));
        }
        rules.insert(rule.key, rule.clone());
        Ok(())
    }

    fn delete_rule(&mut self, key: Uuid) -> Result<()> {
        self.state.rules.lock().unwrap().remove(&key);
        Ok(())
    }

    fn find_rule(&self, key: Uuid) -> Result<bool> {
        Ok(self.state.rules.lock().unwrap().contains_key(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter;

    fn permit_rule(key: Uuid, weight: u64, conditions: Vec<MatchCondition>) -> FilterRule {
        FilterRule {
            key,
            name: "test".to_string(),
            description: None,
            layer: Layer::OutboundConnectV4,
            action: RuleAction::Permit,
            weight,
            persistent: false,
            conditions,
        }
    }

    #[test]
    fn test_add_conflict_by_identity() {
        let engine = MemoryEngine::new();
        let mut session = engine.open().unwrap();
        let rule = permit_rule(filter::ALLOW_PORTS_V4, 3, vec![MatchCondition::RemotePort(500)]);
        session.add_rule(&rule).unwrap();
        assert!(matches!(
            session.add_rule(&rule),
            Err(Error::RuleConflict(_))
        ));
    }

    #[test]
    fn test_delete_absent_rule_is_ok() {
        let engine = MemoryEngine::new();
        let mut session = engine.open().unwrap();
        session.delete_rule(filter::BLOCK_ALL_V4).unwrap();
        assert!(!session.find_rule(filter::BLOCK_ALL_V4).unwrap());
    }

    #[test]
    fn test_open_error_is_engine_unavailable() {
        let engine = MemoryEngine::new();
        engine.set_open_error("access denied");
        assert!(matches!(
            engine.open().err(),
            Some(Error::EngineUnavailable(_))
        ));
    }

    #[test]
    fn test_same_field_conditions_are_ored() {
        let engine = MemoryEngine::new();
        let mut session = engine.open().unwrap();
        session
            .add_rule(&permit_rule(
                filter::ALLOW_PORTS_V4,
                3,
                vec![
                    MatchCondition::RemotePort(500),
                    MatchCondition::RemotePort(4500),
                ],
            ))
            .unwrap();

        let hit = SimPacket::outbound_v4("1.2.3.4".parse().unwrap()).to_port(4500);
        let miss = SimPacket::outbound_v4("1.2.3.4".parse().unwrap()).to_port(443);
        assert_eq!(engine.evaluate(&hit), Verdict::Permit);
        // Port 443 only matches no rule at all, so the sub-layer abstains
        assert_eq!(engine.evaluate(&miss), Verdict::Permit);
    }

    #[test]
    fn test_higher_weight_wins() {
        let engine = MemoryEngine::new();
        let mut session = engine.open().unwrap();
        session
            .add_rule(&FilterRule {
                action: RuleAction::Block,
                ..permit_rule(filter::BLOCK_ALL_V4, 0, vec![MatchCondition::NotLoopback])
            })
            .unwrap();
        session
            .add_rule(&permit_rule(
                filter::ALLOW_REMOTE_V4,
                3,
                vec![MatchCondition::RemoteNetwork("10.0.0.1/32".parse().unwrap())],
            ))
            .unwrap();

        let allowed = SimPacket::outbound_v4("10.0.0.1".parse().unwrap());
        let blocked = SimPacket::outbound_v4("93.184.216.34".parse().unwrap());
        assert_eq!(engine.evaluate(&allowed), Verdict::Permit);
        assert_eq!(engine.evaluate(&blocked), Verdict::Block);
    }

    #[test]
    fn test_range_condition_respects_family() {
        let lo: IpAddr = "224.0.0.0".parse().unwrap();
        let hi: IpAddr = "239.255.255.255".parse().unwrap();
        assert!(address_in_range("224.0.0.251".parse().unwrap(), lo, hi));
        assert!(!address_in_range("8.8.8.8".parse().unwrap(), lo, hi));
        assert!(!address_in_range("ff02::fb".parse().unwrap(), lo, hi));
    }
}
