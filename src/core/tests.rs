use crate::core::dial::{DialOutcome, Dialer, HANGUP_ATTEMPTS, LinkStatus};
use crate::core::dial_service::{ConnectState, DialService, LinkCounters};
use crate::core::error::Error;
use crate::core::filter::{self, InterfaceLuid, Layer};
use crate::core::killswitch::{EngageParams, EngagedState, KillSwitch, rule_plan};
use crate::core::test_helpers::{connect_request, fast_dialer, full_engage_params};
use crate::sim::dial::{DialScript, SimDialService};
use crate::sim::engine::{MemoryEngine, SimPacket, Verdict};
use std::time::Duration;

// ─── kill switch ────────────────────────────────────────────────────────────

#[test]
fn test_engage_installs_plan_and_sublayer() {
    let engine = MemoryEngine::new();
    let switch = KillSwitch::new(engine.clone());

    switch.engage(&full_engage_params()).unwrap();

    let expected: std::collections::HashSet<_> = rule_plan(&full_engage_params())
        .iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(engine.installed_keys(), expected);
    assert!(engine.has_sublayer(filter::SUBLAYER));
    assert!(switch.status().is_engaged());
}

#[test]
fn test_engage_twice_is_idempotent() {
    let engine = MemoryEngine::new();
    let switch = KillSwitch::new(engine.clone());
    let params = full_engage_params();

    switch.engage(&params).unwrap();
    let first = engine.installed_keys();
    switch.engage(&params).unwrap();

    // Verified via rule enumeration, not just the return code
    assert_eq!(engine.installed_keys(), first);
    assert_eq!(engine.rules().len(), first.len());
}

#[test]
fn test_disengage_is_noop_safe() {
    let engine = MemoryEngine::new();
    let switch = KillSwitch::new(engine.clone());

    switch.disengage().unwrap();
    assert!(engine.installed_keys().is_empty());
    assert_eq!(switch.status(), EngagedState::NotEngaged);
}

#[test]
fn test_engage_cleans_stale_crash_state() {
    let engine = MemoryEngine::new();
    let plan = rule_plan(&full_engage_params());
    // A crash mid-install left two rules and the sub-layer behind
    engine.seed_rule(plan[0].clone());
    engine.seed_rule(plan[2].clone());
    engine.seed_sublayer(crate::core::filter::Sublayer::kill_switch("stale", true));

    let switch = KillSwitch::new(engine.clone());
    switch.engage(&full_engage_params()).unwrap();

    assert_eq!(engine.installed_keys().len(), plan.len());
    assert!(engine.has_sublayer(filter::SUBLAYER));
}

#[test]
fn test_failed_engage_rolls_back() {
    let engine = MemoryEngine::new();
    engine.fail_add_of(filter::BLOCK_ALL_V6);

    let switch = KillSwitch::new(engine.clone());
    let err = switch.engage(&full_engage_params()).unwrap_err();
    assert!(matches!(err, Error::Internal(_)));

    // Every rule added by the failing call was deleted again
    assert!(engine.installed_keys().is_empty());
    assert_eq!(switch.status(), EngagedState::NotEngaged);
}

#[test]
fn test_status_fails_distinguishably_when_engine_down() {
    let engine = MemoryEngine::new();
    let switch = KillSwitch::new(engine.clone());
    switch.engage(&full_engage_params()).unwrap();

    engine.set_open_error("access denied");
    match switch.status() {
        EngagedState::Indeterminate(reason) => assert!(reason.contains("access denied")),
        other => panic!("expected indeterminate, got {other:?}"),
    }

    engine.clear_open_error();
    assert!(switch.status().is_engaged());
}

#[test]
fn test_legacy_block_rule_counts_as_engaged() {
    let engine = MemoryEngine::new();
    let mut legacy = rule_plan(&EngageParams::default())[0].clone();
    legacy.key = filter::LEGACY_BLOCK_RULE;
    engine.seed_rule(legacy);

    let switch = KillSwitch::new(engine.clone());
    assert!(switch.status().is_engaged());

    // Disengage removes it like any other known identity
    switch.disengage().unwrap();
    assert_eq!(switch.status(), EngagedState::NotEngaged);
}

// ─── policy-level packet checks ─────────────────────────────────────────────

fn engaged_engine() -> MemoryEngine {
    let engine = MemoryEngine::new();
    KillSwitch::new(engine.clone())
        .engage(&full_engage_params())
        .unwrap();
    engine
}

#[test]
fn test_allowlisted_remote_is_permitted() {
    let engine = engaged_engine();
    let packet = SimPacket::outbound_v4("10.0.0.1".parse().unwrap()).to_port(443);
    assert_eq!(engine.evaluate(&packet), Verdict::Permit);
}

#[test]
fn test_unlisted_remote_is_blocked() {
    let engine = engaged_engine();
    let packet = SimPacket::outbound_v4("93.184.216.34".parse().unwrap()).to_port(443);
    assert_eq!(engine.evaluate(&packet), Verdict::Block);
}

#[test]
fn test_loopback_is_exempt_from_block() {
    let engine = engaged_engine();
    let packet = SimPacket::outbound_v4("127.0.0.1".parse().unwrap()).loopback();
    assert_eq!(engine.evaluate(&packet), Verdict::Permit);
}

#[test]
fn test_tunnel_adapter_is_exempt_from_block() {
    let engine = engaged_engine();
    let packet = SimPacket::outbound_v4("93.184.216.34".parse().unwrap())
        .on_interface(InterfaceLuid(7));
    assert_eq!(engine.evaluate(&packet), Verdict::Permit);

    let other = SimPacket::outbound_v4("93.184.216.34".parse().unwrap())
        .on_interface(InterfaceLuid(8));
    assert_eq!(engine.evaluate(&other), Verdict::Block);
}

#[test]
fn test_tunnel_process_is_exempt_from_block() {
    let engine = engaged_engine();
    let packet = SimPacket::outbound_v4("93.184.216.34".parse().unwrap())
        .from_application(r"C:\Program Files\vpn\tunnel.exe");
    assert_eq!(engine.evaluate(&packet), Verdict::Permit);
}

#[test]
fn test_ike_ports_stay_reachable() {
    let engine = engaged_engine();
    for port in [500u16, 4500, 67, 68, 5353] {
        let packet = SimPacket::outbound_v4("203.0.113.50".parse().unwrap()).to_port(port);
        assert_eq!(engine.evaluate(&packet), Verdict::Permit, "port {port}");
    }
    let packet = SimPacket::outbound_v4("203.0.113.50".parse().unwrap()).to_port(53);
    assert_eq!(engine.evaluate(&packet), Verdict::Block);
}

#[test]
fn test_multicast_stays_reachable() {
    let engine = engaged_engine();
    let packet = SimPacket::outbound_v4("239.255.255.250".parse().unwrap()).to_port(1900);
    assert_eq!(engine.evaluate(&packet), Verdict::Permit);
}

#[test]
fn test_local_allowlist_permits_source() {
    let engine = engaged_engine();
    let packet = SimPacket::outbound_v4("93.184.216.34".parse().unwrap())
        .from_local("192.168.1.10".parse().unwrap());
    assert_eq!(engine.evaluate(&packet), Verdict::Permit);
}

#[test]
fn test_v6_policy() {
    let engine = engaged_engine();

    let global = SimPacket::outbound_v6("2606:2800:220:1::1".parse().unwrap());
    assert_eq!(engine.evaluate(&global), Verdict::Block);

    let link_local = SimPacket::outbound_v6("fe80::1".parse().unwrap());
    assert_eq!(engine.evaluate(&link_local), Verdict::Permit);

    let loopback = SimPacket::outbound_v6("::1".parse().unwrap());
    assert_eq!(engine.evaluate(&loopback), Verdict::Permit);

    let multicast = SimPacket::outbound_v6("ff02::fb".parse().unwrap());
    assert_eq!(engine.evaluate(&multicast), Verdict::Permit);

    let on_tunnel = SimPacket::outbound_v6("2606:2800:220:1::1".parse().unwrap())
        .on_interface(InterfaceLuid(7));
    assert_eq!(engine.evaluate(&on_tunnel), Verdict::Permit);
}

#[test]
fn test_spec_scenario_engage_query_disengage() {
    // remoteAllowlist = [10.0.0.1/255.255.255.255], localAllowlist = [],
    // adapter LUID 7, persist = false
    let engine = MemoryEngine::new();
    let switch = KillSwitch::new(engine.clone());
    let params = EngageParams {
        remote_allow: vec!["10.0.0.1/32".parse().unwrap()],
        local_allow: vec![],
        tunnel_adapter: Some(InterfaceLuid(7)),
        tunnel_process: None,
        persist: false,
        display_name: "scenario".to_string(),
    };

    switch.engage(&params).unwrap();
    assert!(switch.status().is_engaged());
    switch.disengage().unwrap();
    assert!(!switch.status().is_engaged());
    assert!(engine.installed_keys().is_empty());
}

// ─── dial lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_resolves_connected() {
    let dialer = fast_dialer();
    let attempt = dialer.connect(&connect_request()).unwrap();
    let outcome = attempt.outcome().await.unwrap();
    assert_eq!(outcome, DialOutcome::Connected);

    // The provisioned entry is in place and pinned to IKEv2
    let entry = dialer.service().entry("Test IKEv2").unwrap();
    assert_eq!(entry.remote_host, "vpn.example.com");
}

#[tokio::test]
async fn test_dial_error_hangs_up_and_fails() {
    let dialer = fast_dialer();
    dialer.service().set_script(DialScript::FailWith(678));

    let attempt = dialer.connect(&connect_request()).unwrap();
    let outcome = attempt.outcome().await.unwrap();
    assert_eq!(outcome, DialOutcome::Failed(678));
    // The partially-formed connection was hung up before the outcome
    assert!(dialer.service().hangup_calls() >= 1);
}

#[tokio::test]
async fn test_auth_failure_code_is_recognised() {
    let dialer = fast_dialer();
    dialer.service().set_script(DialScript::FailWith(691));

    let attempt = dialer.connect(&connect_request()).unwrap();
    match attempt.outcome().await.unwrap() {
        DialOutcome::Failed(code) => assert!(crate::core::dial::is_auth_failure(code)),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_invalid_name_never_submits_a_dial() {
    let dialer = fast_dialer();
    let mut request = connect_request();
    request.device_name = "bad\\name".to_string();

    let err = dialer.connect(&request).unwrap_err();
    assert!(matches!(err, Error::InvalidName(_)));
    assert_eq!(dialer.service().dial_count(), 0);
}

#[tokio::test]
async fn test_second_connect_is_rejected_while_in_flight() {
    let dialer = fast_dialer();
    dialer.service().set_step_delay(Duration::from_millis(50));

    let attempt = dialer.connect(&connect_request()).unwrap();
    let err = dialer.connect(&connect_request()).unwrap_err();
    assert!(matches!(err, Error::DialInProgress));
    assert_eq!(dialer.service().dial_count(), 1);

    assert_eq!(attempt.outcome().await.unwrap(), DialOutcome::Connected);

    // The slot frees up once the attempt resolves
    let again = dialer.connect(&connect_request()).unwrap();
    assert_eq!(again.outcome().await.unwrap(), DialOutcome::Connected);
}

#[tokio::test]
async fn test_abort_races_connected_notification() {
    let dialer = fast_dialer();
    // One notification, "connected", after a delay long enough for the
    // abort to land first
    dialer
        .service()
        .set_script(DialScript::Steps(vec![(ConnectState::Connected, None)]));
    dialer.service().set_step_delay(Duration::from_millis(50));

    let attempt = dialer.connect(&connect_request()).unwrap();
    dialer.abort();

    // Exactly one outcome, and it is the abort
    let outcome = attempt.outcome().await.unwrap();
    assert_eq!(outcome, DialOutcome::Aborted);
    assert!(dialer.service().hangup_calls() >= 1);
}

#[tokio::test]
async fn test_reset_abort_clears_stale_flag() {
    let dialer = fast_dialer();

    // An abort requested with nothing in flight would otherwise cancel the
    // next attempt on its first notification
    dialer.abort();
    dialer.reset_abort();

    let attempt = dialer.connect(&connect_request()).unwrap();
    assert_eq!(attempt.outcome().await.unwrap(), DialOutcome::Connected);
}

#[test]
fn test_disconnect_retry_bound() {
    let dialer = fast_dialer();
    dialer.service().set_stubborn_hangup(true);
    dialer.service().mark_connected("Test IKEv2");

    let err = dialer.disconnect("Test IKEv2").unwrap_err();
    assert!(matches!(err, Error::HangupFailed { attempts } if attempts == HANGUP_ATTEMPTS));
    // Terminates after exactly the bounded number of attempts
    assert_eq!(dialer.service().hangup_calls(), HANGUP_ATTEMPTS);
}

#[test]
fn test_disconnect_without_connection_is_ok() {
    let dialer = fast_dialer();
    dialer.disconnect("Test IKEv2").unwrap();
    assert_eq!(dialer.service().hangup_calls(), 0);
}

#[test]
fn test_disconnect_matches_entry_name_case_insensitively() {
    let dialer = fast_dialer();
    dialer.service().mark_connected("Test IKEv2");
    dialer.disconnect("test ikev2").unwrap();
    assert!(dialer.service().active_connections().unwrap().is_empty());
}

// ─── statistics ─────────────────────────────────────────────────────────────

#[test]
fn test_statistics_absent_connection_is_zeroed() {
    let dialer = fast_dialer();
    let stats = dialer.statistics("Test IKEv2").unwrap();
    assert_eq!(stats.status, LinkStatus::Disconnected);
    assert_eq!(stats.bytes_received, 0);
    assert!(stats.remote_host.is_empty());
}

#[test]
fn test_statistics_snapshot_of_live_connection() {
    let service = SimDialService::new();
    crate::core::provision::provision(&service, "Test IKEv2", "vpn.example.com").unwrap();
    service.mark_connected("Test IKEv2");
    service.set_counters(LinkCounters {
        bytes_transmitted: 1_000,
        bytes_received: 2_000,
        bps: 128_000,
        connect_duration_ms: 65_000,
    });

    let dialer = Dialer::new(service);
    let stats = dialer.statistics("Test IKEv2").unwrap();
    assert_eq!(stats.status, LinkStatus::Connected);
    assert_eq!(stats.bytes_transmitted, 1_000);
    assert_eq!(stats.bytes_received, 2_000);
    assert_eq!(stats.connect_duration, Duration::from_secs(65));
    assert_eq!(stats.remote_host, "vpn.example.com");
}

#[test]
fn test_statistics_query_failure_degrades_to_zeroed() {
    let dialer = fast_dialer();
    dialer.service().mark_connected("Test IKEv2");
    dialer.service().set_stat_error(true);

    let stats = dialer.statistics("Test IKEv2").unwrap();
    assert_eq!(stats.status, LinkStatus::Disconnected);
    assert_eq!(stats.bytes_transmitted, 0);
}

#[test]
fn test_statistics_enumeration_failure_propagates() {
    let dialer = fast_dialer();
    dialer.service().set_enumeration_error(true);
    assert!(dialer.statistics("Test IKEv2").is_err());
}

// ─── properties ─────────────────────────────────────────────────────────────

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn arb_v4_network() -> impl Strategy<Value = ipnetwork::IpNetwork> {
        (any::<u32>(), 0u8..=32).prop_map(|(addr, prefix)| {
            ipnetwork::IpNetwork::V4(
                ipnetwork::Ipv4Network::new(std::net::Ipv4Addr::from(addr), prefix).unwrap(),
            )
        })
    }

    fn arb_params() -> impl Strategy<Value = EngageParams> {
        (
            proptest::collection::vec(arb_v4_network(), 0..8),
            proptest::collection::vec(arb_v4_network(), 0..8),
            proptest::option::of(any::<u64>()),
            any::<bool>(),
        )
            .prop_map(|(remote_allow, local_allow, luid, persist)| EngageParams {
                remote_allow,
                local_allow,
                tunnel_adapter: luid.map(InterfaceLuid),
                tunnel_process: None,
                persist,
                display_name: "prop".to_string(),
            })
    }

    proptest! {
        #[test]
        fn prop_permit_weight_exceeds_block_weight(params in arb_params()) {
            let plan = rule_plan(&params);
            for layer in [Layer::OutboundConnectV4, Layer::OutboundConnectV6] {
                let block = plan
                    .iter()
                    .find(|r| r.layer == layer && r.action == crate::core::filter::RuleAction::Block)
                    .expect("block rule present on every layer");
                for permit in plan
                    .iter()
                    .filter(|r| r.layer == layer && r.action == crate::core::filter::RuleAction::Permit)
                {
                    prop_assert!(permit.weight > block.weight);
                }
            }
        }

        #[test]
        fn prop_plan_identities_are_unique_and_known(params in arb_params()) {
            let plan = rule_plan(&params);
            let mut seen = std::collections::HashSet::new();
            for rule in &plan {
                prop_assert!(seen.insert(rule.key), "duplicate identity {}", rule.key);
                prop_assert!(filter::KNOWN_RULE_IDENTITIES.contains(&rule.key));
            }
        }

        #[test]
        fn prop_rules_never_ship_without_conditions(params in arb_params()) {
            for rule in rule_plan(&params) {
                prop_assert!(!rule.conditions.is_empty());
            }
        }

        #[test]
        fn prop_persist_flag_reaches_every_rule(params in arb_params()) {
            for rule in rule_plan(&params) {
                prop_assert_eq!(rule.persistent, params.persist);
            }
        }
    }
}
