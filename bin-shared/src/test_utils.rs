//! In-memory [`Platform`] for the test suites.
//!
//! Holds the whole "host" behind one mutex: firewall rule book, outbound
//! policy, adapters, process table, service states, scripted DNS answers,
//! and system probe fixtures. Tests seed it, run the subsystem under test,
//! then assert on the recorded effects.

// Test support code; a poisoned lock here should abort the test anyway.
#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{bail, Context as _, Result};

use crate::platform::{
    Adapter, AdapterDns, OutboundPolicy, Platform, ProcessEntry, RuleSpec, ServiceState,
    SystemProbe,
};

pub struct FakePlatform {
    state: Mutex<State>,
}

struct State {
    rules: BTreeMap<String, RuleSpec>,
    policy: OutboundPolicy,
    fail_add_rule: bool,

    adapters: Vec<Adapter>,
    original_dns: BTreeMap<String, AdapterDns>,
    current_dns: BTreeMap<String, AdapterDns>,
    disabled_adapters: Vec<String>,
    flush_count: usize,

    processes: Vec<ProcessEntry>,
    killed: Vec<ProcessEntry>,
    deny_kill: BTreeSet<u32>,
    pid: u32,

    services: BTreeMap<String, ServiceState>,
    stopped_services: Vec<String>,
    started_services: Vec<String>,
    /// Dropped when the `Dnscache` service is stopped, releasing whatever
    /// port the test bound to it.
    dnscache_socket: Option<std::net::UdpSocket>,

    dns_answers: BTreeMap<String, Vec<Ipv4Addr>>,
    route_table: String,
    probe: SystemProbe,
    registry_keys: BTreeSet<String>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                rules: BTreeMap::new(),
                policy: OutboundPolicy::Allow,
                fail_add_rule: false,
                adapters: Vec::new(),
                original_dns: BTreeMap::new(),
                current_dns: BTreeMap::new(),
                disabled_adapters: Vec::new(),
                flush_count: 0,
                processes: Vec::new(),
                killed: Vec::new(),
                deny_kill: BTreeSet::new(),
                pid: 1000,
                services: BTreeMap::new(),
                stopped_services: Vec::new(),
                started_services: Vec::new(),
                dnscache_socket: None,
                dns_answers: BTreeMap::new(),
                route_table: String::new(),
                probe: SystemProbe::default(),
                registry_keys: BTreeSet::new(),
            }),
        }
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding

    pub fn add_adapter(&self, adapter: Adapter) {
        self.state.lock().unwrap().adapters.push(adapter);
    }

    /// A plain up ethernet adapter, for tests that don't care about details.
    pub fn add_simple_adapter(&self, name: &str, guid: &str) {
        self.add_adapter(Adapter {
            name: name.to_string(),
            guid: guid.to_string(),
            description: "Intel(R) Ethernet Connection I219-V".to_string(),
            up: true,
            dns_servers: Vec::new(),
            mac: None,
        });
    }

    pub fn set_original_dns(&self, guid: &str, dns: AdapterDns) {
        self.state
            .lock()
            .unwrap()
            .original_dns
            .insert(guid.to_string(), dns);
    }

    pub fn add_process(&self, pid: u32, name: &str) {
        self.state.lock().unwrap().processes.push(ProcessEntry {
            pid,
            name: name.to_string(),
        });
    }

    pub fn deny_kill(&self, pid: u32) {
        self.state.lock().unwrap().deny_kill.insert(pid);
    }

    pub fn set_pid(&self, pid: u32) {
        self.state.lock().unwrap().pid = pid;
    }

    pub fn set_service(&self, name: &str, state: ServiceState) {
        self.state
            .lock()
            .unwrap()
            .services
            .insert(name.to_string(), state);
    }

    /// Models the system DNS cache service sitting on a UDP port: the socket
    /// is released when `Dnscache` is stopped.
    pub fn dnscache_holds(&self, socket: std::net::UdpSocket) {
        let mut state = self.state.lock().unwrap();
        state
            .services
            .insert("Dnscache".to_string(), ServiceState::Running);
        state.dnscache_socket = Some(socket);
    }

    pub fn script_dns(&self, domain: &str, ips: &[Ipv4Addr]) {
        self.state
            .lock()
            .unwrap()
            .dns_answers
            .insert(domain.to_string(), ips.to_vec());
    }

    pub fn fail_add_rule(&self, fail: bool) {
        self.state.lock().unwrap().fail_add_rule = fail;
    }

    pub fn seed_rule(&self, rule: RuleSpec) {
        let mut state = self.state.lock().unwrap();
        state.rules.insert(rule.name.clone(), rule);
    }

    pub fn seed_policy(&self, policy: OutboundPolicy) {
        self.state.lock().unwrap().policy = policy;
    }

    pub fn set_route_table(&self, table: &str) {
        self.state.lock().unwrap().route_table = table.to_string();
    }

    pub fn set_probe(&self, probe: SystemProbe) {
        self.state.lock().unwrap().probe = probe;
    }

    pub fn add_registry_key(&self, hklm_subkey: &str) {
        self.state
            .lock()
            .unwrap()
            .registry_keys
            .insert(hklm_subkey.to_string());
    }

    // Inspection

    pub fn rule_names(&self) -> Vec<String> {
        self.state.lock().unwrap().rules.keys().cloned().collect()
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.state.lock().unwrap().rules.contains_key(name)
    }

    pub fn policy(&self) -> OutboundPolicy {
        self.state.lock().unwrap().policy
    }

    pub fn current_dns(&self, adapter: &str) -> Option<AdapterDns> {
        self.state.lock().unwrap().current_dns.get(adapter).cloned()
    }

    pub fn disabled_adapters(&self) -> Vec<String> {
        self.state.lock().unwrap().disabled_adapters.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap().flush_count
    }

    pub fn killed_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .killed
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn stopped_services(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped_services.clone()
    }

    pub fn service_state_of(&self, name: &str) -> ServiceState {
        self.state
            .lock()
            .unwrap()
            .services
            .get(name)
            .copied()
            .unwrap_or(ServiceState::NotFound)
    }

    pub fn started_services(&self) -> Vec<String> {
        self.state.lock().unwrap().started_services.clone()
    }
}

impl Platform for FakePlatform {
    fn add_firewall_rule(&self, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_add_rule {
            bail!("Access is denied.");
        }
        state.rules.insert(rule.name.clone(), rule.clone());

        Ok(())
    }

    fn delete_firewall_rule(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().rules.remove(name);

        Ok(())
    }

    fn delete_firewall_rules_by_prefix(&self, prefix: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .rules
            .retain(|name, _| !name.starts_with(prefix));

        Ok(())
    }

    fn firewall_rule_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().rules.contains_key(name))
    }

    fn set_outbound_policy(&self, policy: OutboundPolicy) -> Result<()> {
        self.state.lock().unwrap().policy = policy;

        Ok(())
    }

    fn adapters(&self) -> Result<Vec<Adapter>> {
        Ok(self.state.lock().unwrap().adapters.clone())
    }

    fn adapter_dns_config(&self, guid: &str) -> Result<AdapterDns> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .original_dns
            .get(guid)
            .cloned()
            .unwrap_or(AdapterDns::Dhcp))
    }

    fn set_adapter_dns(&self, adapter: &str, dns: &AdapterDns) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .current_dns
            .insert(adapter.to_string(), dns.clone());

        Ok(())
    }

    fn flush_dns_cache(&self) -> Result<()> {
        self.state.lock().unwrap().flush_count += 1;

        Ok(())
    }

    fn disable_adapter(&self, adapter: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .disabled_adapters
            .push(adapter.to_string());

        Ok(())
    }

    fn processes(&self) -> Result<Vec<ProcessEntry>> {
        Ok(self.state.lock().unwrap().processes.clone())
    }

    fn kill_process_tree(&self, pid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.deny_kill.contains(&pid) {
            bail!("Access is denied.");
        }
        let index = state
            .processes
            .iter()
            .position(|p| p.pid == pid)
            .with_context(|| format!("No process with pid {pid}"))?;
        let process = state.processes.remove(index);
        state.killed.push(process);

        Ok(())
    }

    fn current_pid(&self) -> u32 {
        self.state.lock().unwrap().pid
    }

    fn service_state(&self, name: &str) -> Result<ServiceState> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(name)
            .copied()
            .unwrap_or(ServiceState::NotFound))
    }

    fn stop_service(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.services.insert(name.to_string(), ServiceState::Stopped);
        state.stopped_services.push(name.to_string());
        if name == "Dnscache" {
            state.dnscache_socket.take();
        }

        Ok(())
    }

    fn start_service(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.services.insert(name.to_string(), ServiceState::Running);
        state.started_services.push(name.to_string());

        Ok(())
    }

    fn route_table(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().route_table.clone())
    }

    fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dns_answers
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    fn system_probe(&self) -> Result<SystemProbe> {
        Ok(self.state.lock().unwrap().probe.clone())
    }

    fn registry_key_exists(&self, hklm_subkey: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .registry_keys
            .contains(hklm_subkey)
    }
}
