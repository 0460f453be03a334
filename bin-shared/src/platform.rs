//! Abstraction over the OS facilities the agent touches.
//!
//! Every subprocess invocation and system query goes through [`Platform`], so
//! the subsystems built on top can be exercised against the in-memory
//! [`crate::test_utils::FakePlatform`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::Result;

#[cfg(windows)]
pub mod windows;

/// Default outbound disposition of the host firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPolicy {
    Allow,
    Block,
}

impl OutboundPolicy {
    /// Value accepted by `netsh advfirewall set allprofiles firewallpolicy`.
    pub fn netsh_value(self) -> &'static str {
        match self {
            OutboundPolicy::Allow => "allowoutbound,allowinbound",
            OutboundPolicy::Block => "blockoutbound,allowinbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleProtocol {
    Tcp,
    Udp,
}

/// One outbound firewall rule, named so it can be found and deleted by tag
/// later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub name: String,
    pub action: RuleAction,
    pub protocol: Option<RuleProtocol>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub program: Option<PathBuf>,
}

impl RuleSpec {
    pub fn allow(name: impl Into<String>) -> Self {
        Self::new(name, RuleAction::Allow)
    }

    pub fn block(name: impl Into<String>) -> Self {
        Self::new(name, RuleAction::Block)
    }

    fn new(name: impl Into<String>, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            action,
            protocol: None,
            remote_ip: None,
            remote_port: None,
            program: None,
        }
    }

    pub fn protocol(mut self, protocol: RuleProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Accepts a single address, a CIDR range, or a comma-separated list;
    /// `netsh` understands all three.
    pub fn remote_ip(mut self, ip: impl fmt::Display) -> Self {
        self.remote_ip = Some(ip.to_string());
        self
    }

    pub fn remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn program(mut self, path: impl Into<PathBuf>) -> Self {
        self.program = Some(path.into());
        self
    }

    /// Arguments to `netsh` that create this rule.
    pub fn add_args(&self) -> Vec<String> {
        let action = match self.action {
            RuleAction::Allow => "allow",
            RuleAction::Block => "block",
        };
        let mut args = vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "add".to_string(),
            "rule".to_string(),
            format!("name={}", self.name),
            "dir=out".to_string(),
            format!("action={action}"),
            "enable=yes".to_string(),
        ];
        if let Some(protocol) = self.protocol {
            let protocol = match protocol {
                RuleProtocol::Tcp => "TCP",
                RuleProtocol::Udp => "UDP",
            };
            args.push(format!("protocol={protocol}"));
        }
        if let Some(ip) = &self.remote_ip {
            args.push(format!("remoteip={ip}"));
        }
        if let Some(port) = self.remote_port {
            args.push(format!("remoteport={port}"));
        }
        if let Some(program) = &self.program {
            args.push(format!("program={}", program.display()));
        }

        args
    }
}

/// Per-adapter DNS configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterDns {
    /// Servers assigned by DHCP.
    Dhcp,
    Static(Vec<Ipv4Addr>),
}

/// A network adapter as seen by the agent.
#[derive(Debug, Clone)]
pub struct Adapter {
    /// Connection alias, e.g. `Ethernet 2`. This is the name `netsh` takes.
    pub name: String,
    /// Adapter GUID, the registry key name under the Tcpip service.
    pub guid: String,
    /// Driver description, e.g. `TAP-Windows Adapter V9`.
    pub description: String,
    pub up: bool,
    pub dns_servers: Vec<IpAddr>,
    /// `XX-XX-XX-XX-XX-XX`, upper-case.
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Image base name, e.g. `chrome.exe`.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    NotFound,
}

/// Raw facts the VM detector scores.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe {
    pub bios_vendor: Option<String>,
    pub bios_version: Option<String>,
    pub system_manufacturer: Option<String>,
    pub system_model: Option<String>,
    pub cpu_name: Option<String>,
    pub hypervisor_present: bool,
    pub mac_addresses: Vec<String>,
}

/// The single substitution point between the agent and the OS.
pub trait Platform: Send + Sync {
    // Firewall
    fn add_firewall_rule(&self, rule: &RuleSpec) -> Result<()>;
    fn delete_firewall_rule(&self, name: &str) -> Result<()>;
    fn delete_firewall_rules_by_prefix(&self, prefix: &str) -> Result<()>;
    fn firewall_rule_exists(&self, name: &str) -> Result<bool>;
    fn set_outbound_policy(&self, policy: OutboundPolicy) -> Result<()>;

    // Adapters & DNS
    fn adapters(&self) -> Result<Vec<Adapter>>;
    /// The DNS servers configured on the adapter itself, or [`AdapterDns::Dhcp`]
    /// if none are statically set.
    fn adapter_dns_config(&self, guid: &str) -> Result<AdapterDns>;
    fn set_adapter_dns(&self, adapter: &str, dns: &AdapterDns) -> Result<()>;
    fn flush_dns_cache(&self) -> Result<()>;
    fn disable_adapter(&self, adapter: &str) -> Result<()>;

    // Processes
    fn processes(&self) -> Result<Vec<ProcessEntry>>;
    fn kill_process_tree(&self, pid: u32) -> Result<()>;
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    // Services
    fn service_state(&self, name: &str) -> Result<ServiceState>;
    fn stop_service(&self, name: &str) -> Result<()>;
    fn start_service(&self, name: &str) -> Result<()>;

    // Network facts
    fn route_table(&self) -> Result<String>;
    /// A-record lookup through the OS resolver.
    fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>>;

    // System probes
    fn system_probe(&self) -> Result<SystemProbe>;
    fn registry_key_exists(&self, hklm_subkey: &str) -> bool;
}

/// Parses `tasklist /FO CSV /NH` output.
///
/// Lines that don't look like a process row (headers, status messages) are
/// skipped rather than treated as errors.
pub fn parse_tasklist_csv(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix('"')?;
            let (name, rest) = rest.split_once("\",\"")?;
            let (pid, _) = rest.split_once('"')?;
            let pid = pid.parse().ok()?;

            Some(ProcessEntry {
                pid,
                name: name.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn add_args_for_port_block() {
        let rule = RuleSpec::block("Proctor_BlockHTTPS")
            .protocol(RuleProtocol::Tcp)
            .remote_port(443);

        assert_eq!(
            rule.add_args(),
            [
                "advfirewall",
                "firewall",
                "add",
                "rule",
                "name=Proctor_BlockHTTPS",
                "dir=out",
                "action=block",
                "enable=yes",
                "protocol=TCP",
                "remoteport=443",
            ]
        );
    }

    #[test]
    fn add_args_for_ip_allow() {
        let rule = RuleSpec::allow("Proctor_CF_1_1_1_1_HTTP")
            .protocol(RuleProtocol::Tcp)
            .remote_ip("1.1.1.1")
            .remote_port(80);

        assert_eq!(
            rule.add_args(),
            [
                "advfirewall",
                "firewall",
                "add",
                "rule",
                "name=Proctor_CF_1_1_1_1_HTTP",
                "dir=out",
                "action=allow",
                "enable=yes",
                "protocol=TCP",
                "remoteip=1.1.1.1",
                "remoteport=80",
            ]
        );
    }

    #[test]
    fn add_args_for_program_allow() {
        let rule = RuleSpec::allow("Proctor_AllowServiceHost")
            .program(r"C:\Windows\System32\svchost.exe");

        assert_eq!(
            *rule.add_args().last().unwrap(),
            r"program=C:\Windows\System32\svchost.exe",
        );
    }

    #[test_case(OutboundPolicy::Allow => "allowoutbound,allowinbound")]
    #[test_case(OutboundPolicy::Block => "blockoutbound,allowinbound")]
    fn policy_values(policy: OutboundPolicy) -> &'static str {
        policy.netsh_value()
    }

    #[test]
    fn tasklist_csv() {
        let output = concat!(
            "\"System Idle Process\",\"0\",\"Services\",\"0\",\"8 K\"\r\n",
            "\"chrome.exe\",\"4532\",\"Console\",\"1\",\"211,012 K\"\r\n",
            "INFO: No tasks are running which match the specified criteria.\r\n",
        );

        let processes = parse_tasklist_csv(output);

        assert_eq!(
            processes,
            [
                ProcessEntry {
                    pid: 0,
                    name: "System Idle Process".to_string()
                },
                ProcessEntry {
                    pid: 4532,
                    name: "chrome.exe".to_string()
                },
            ]
        );
    }

    #[test]
    fn tasklist_csv_ignores_garbage() {
        assert_eq!(parse_tasklist_csv("no csv here\n\n"), []);
    }
}
