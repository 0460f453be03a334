//! Coordinator-level scenarios driven through the in-memory platform:
//! enter/exit round trips, port contention, crash recovery, and the
//! command-reply semantics around them.

#![allow(clippy::unwrap_used)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use proctor_agent::coordinator::{Coordinator, LockdownState};
use proctor_agent::ipc::{Command, Reply};
use proctor_agent::settings::Settings;
use proctor_bin_shared::platform::{
    AdapterDns, OutboundPolicy, RuleProtocol, RuleSpec, ServiceState,
};
use proctor_bin_shared::test_utils::FakePlatform;

const ADAPTER: &str = "Ethernet";
const GUID: &str = "{E34DC156-0000-4000-8000-000000000001}";

fn test_settings() -> Settings {
    Settings {
        // An ephemeral port so tests need no privilege and never collide.
        dns_bind: "127.0.0.1:0".parse().unwrap(),
        upstream_dns: "127.0.0.1:1".parse().unwrap(),
        ..Settings::default()
    }
}

/// A host with one active adapter (statically configured DNS) and answers
/// for the default resolve set.
fn host() -> Arc<FakePlatform> {
    let platform = Arc::new(FakePlatform::new());
    platform.add_simple_adapter(ADAPTER, GUID);
    platform.set_original_dns(GUID, AdapterDns::Static(vec!["192.168.1.1".parse().unwrap()]));
    script_provider_dns(&platform, &["172.67.68.254", "104.26.6.164"]);
    platform
}

fn script_provider_dns(platform: &FakePlatform, ips: &[&str]) {
    let ips: Vec<Ipv4Addr> = ips.iter().map(|ip| ip.parse().unwrap()).collect();
    for domain in ["codeforces.com", "www.codeforces.com", "st.codeforces.com"] {
        platform.script_dns(domain, &ips);
    }
}

fn proctor_rules(platform: &FakePlatform) -> Vec<String> {
    platform
        .rule_names()
        .into_iter()
        .filter(|name| name.starts_with("Proctor_"))
        .collect()
}

#[tokio::test]
async fn cold_enter_exit_round_trip() {
    let platform = host();
    let mut coordinator = Coordinator::new(platform.clone(), test_settings(), false);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);

    assert_eq!(coordinator.state(), LockdownState::Active);
    assert!(coordinator.firewall().is_lockdown_active());
    assert_eq!(platform.policy(), OutboundPolicy::Block);
    assert_eq!(
        platform.current_dns(ADAPTER),
        Some(AdapterDns::Static(vec![Ipv4Addr::LOCALHOST]))
    );
    assert!(platform.has_rule("Proctor_CF_172_67_68_254_HTTPS"));
    assert!(platform.has_rule("Proctor_CF_104_26_6_164_HTTP"));
    assert!(platform.flush_count() >= 1);

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);

    assert_eq!(coordinator.state(), LockdownState::Inactive);
    assert!(!coordinator.firewall().is_lockdown_active());
    assert_eq!(proctor_rules(&platform), Vec::<String>::new());
    assert_eq!(platform.policy(), OutboundPolicy::Allow);
    assert_eq!(
        platform.current_dns(ADAPTER),
        Some(AdapterDns::Static(vec!["192.168.1.1".parse().unwrap()]))
    );
    assert_eq!(platform.flush_count(), 2);
}

#[tokio::test]
async fn enter_while_active_is_a_no_op_ok() {
    let platform = host();
    let mut coordinator = Coordinator::new(platform, test_settings(), false);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Active);

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
}

#[tokio::test]
async fn exit_without_enter_is_ok() {
    let mut coordinator = Coordinator::new(host(), test_settings(), false);

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Inactive);
}

#[tokio::test]
async fn status_reports_in_any_state_without_mutating() {
    let platform = host();
    let mut coordinator = Coordinator::new(platform.clone(), test_settings(), false);

    assert_eq!(coordinator.dispatch(Command::Status).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Inactive);
    assert_eq!(proctor_rules(&platform), Vec::<String>::new());

    coordinator.dispatch(Command::Enter).await;
    assert_eq!(coordinator.dispatch(Command::Status).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Active);

    coordinator.dispatch(Command::Exit).await;
}

#[tokio::test]
async fn refresh_outside_lockdown_is_an_error() {
    let mut coordinator = Coordinator::new(host(), test_settings(), false);

    assert_eq!(coordinator.dispatch(Command::Refresh).await, Reply::Error);
}

#[tokio::test]
async fn refresh_reconciles_allowlist_churn() {
    let platform = host();
    let mut coordinator = Coordinator::new(platform.clone(), test_settings(), false);
    coordinator.dispatch(Command::Enter).await;
    assert!(platform.has_rule("Proctor_CF_172_67_68_254_HTTP"));

    // The provider moves to new edge addresses.
    script_provider_dns(&platform, &["104.26.6.164", "188.114.99.224"]);

    assert_eq!(coordinator.dispatch(Command::Refresh).await, Reply::Ok);

    assert!(!platform.has_rule("Proctor_CF_172_67_68_254_HTTP"));
    assert!(!platform.has_rule("Proctor_CF_172_67_68_254_HTTPS"));
    assert!(platform.has_rule("Proctor_CF_104_26_6_164_HTTP"));
    assert!(platform.has_rule("Proctor_CF_188_114_99_224_HTTPS"));

    coordinator.dispatch(Command::Exit).await;
}

#[tokio::test]
async fn port_contention_stops_dnscache_and_exit_restarts_it() {
    let platform = host();

    // The system DNS cache service holds the port the filter wants.
    let held = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let contended = held.local_addr().unwrap();
    platform.dnscache_holds(held);

    let settings = Settings {
        dns_bind: contended,
        ..test_settings()
    };
    let mut coordinator = Coordinator::new(platform.clone(), settings, false);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    assert_eq!(platform.stopped_services(), ["Dnscache"]);

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
    assert_eq!(platform.started_services(), ["Dnscache"]);
    assert_eq!(platform.service_state_of("Dnscache"), ServiceState::Running);
}

#[tokio::test]
async fn failed_enter_unwinds_to_a_clean_host() {
    let platform = host();
    platform.fail_add_rule(true);
    let mut coordinator = Coordinator::new(platform.clone(), test_settings(), false);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Error);

    assert_eq!(coordinator.state(), LockdownState::Inactive);
    assert_eq!(proctor_rules(&platform), Vec::<String>::new());
    assert_eq!(platform.policy(), OutboundPolicy::Allow);
    // The adapter override from step 2 must have been rolled back.
    assert_eq!(
        platform.current_dns(ADAPTER),
        Some(AdapterDns::Static(vec!["192.168.1.1".parse().unwrap()]))
    );
}

#[tokio::test]
async fn startup_cleanup_recovers_from_a_crashed_lockdown() {
    let platform = host();
    // A previous run died mid-lockdown: tagged rules everywhere, outbound
    // policy still block.
    platform.seed_rule(RuleSpec::allow("Proctor_AllowLoopback").remote_ip("127.0.0.0/8"));
    platform.seed_rule(
        RuleSpec::block("Proctor_BlockHTTPS")
            .protocol(RuleProtocol::Tcp)
            .remote_port(443),
    );
    platform.seed_rule(
        RuleSpec::allow("Proctor_CF_1_1_1_1_HTTP")
            .protocol(RuleProtocol::Tcp)
            .remote_ip("1.1.1.1")
            .remote_port(80),
    );
    platform.seed_policy(OutboundPolicy::Block);

    let coordinator = Coordinator::new(platform.clone(), test_settings(), false);
    coordinator.startup_cleanup();

    assert_eq!(proctor_rules(&platform), Vec::<String>::new());
    assert_eq!(platform.policy(), OutboundPolicy::Allow);
}
