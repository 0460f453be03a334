//! Firewall controller: owns every `Proctor_`-tagged rule on the host and
//! never touches anything outside that tag.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use proctor_bin_shared::platform::{OutboundPolicy, Platform, RuleProtocol, RuleSpec};

use crate::settings::{self, TAG};

/// Presence of this rule is the canonical "a lockdown reached the firewall
/// step" marker, checked by `is_lockdown_active` and the startup cleanup.
const MARKER_RULE: &str = "Proctor_BlockHTTPS";

pub struct FirewallController {
    platform: Arc<dyn Platform>,
    allowed: Mutex<BTreeSet<Ipv4Addr>>,
}

impl FirewallController {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            allowed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn is_lockdown_active(&self) -> bool {
        self.platform
            .firewall_rule_exists(MARKER_RULE)
            .unwrap_or(false)
    }

    /// Crash recovery on service start: tagged rules are always swept, but
    /// the outbound policy is only reset when the marker shows a previous
    /// run actually reached the policy step.
    pub fn startup_cleanup(&self) {
        let had_marker = self.is_lockdown_active();
        if let Err(error) = self.platform.delete_firewall_rules_by_prefix(TAG) {
            tracing::warn!("Startup rule sweep failed: {error:#}");
        }
        if had_marker {
            tracing::info!("Found rules from an interrupted lockdown; restoring outbound policy");
            if let Err(error) = self.platform.set_outbound_policy(OutboundPolicy::Allow) {
                tracing::warn!("Failed to restore outbound policy: {error:#}");
            }
        }
    }

    /// Deny-by-default outbound with the narrow static allows. Idempotent:
    /// stale tagged rules from a crashed run are deleted first.
    pub fn enable_lockdown(&self) -> Result<()> {
        self.platform
            .delete_firewall_rules_by_prefix(TAG)
            .context("Failed to delete stale tagged rules")?;
        self.platform.set_outbound_policy(OutboundPolicy::Block)?;
        for rule in static_rules() {
            self.platform.add_firewall_rule(&rule)?;
        }
        tracing::info!("Firewall lockdown enabled");

        Ok(())
    }

    /// Reconciles the per-IP allow rules with `new_set`, touching only the
    /// difference so IPs present in both sets never lose connectivity.
    pub fn update_allowed_ips(&self, new_set: &BTreeSet<Ipv4Addr>) -> Result<()> {
        let mut allowed = self.allowed.lock().unwrap_or_else(|e| e.into_inner());

        let removed: Vec<_> = allowed.difference(new_set).copied().collect();
        let added: Vec<_> = new_set.difference(&allowed).copied().collect();

        for ip in removed {
            self.platform.delete_firewall_rule(&ip_rule_name(ip, "HTTP"))?;
            self.platform.delete_firewall_rule(&ip_rule_name(ip, "HTTPS"))?;
            allowed.remove(&ip);
        }
        for ip in added {
            self.platform.add_firewall_rule(
                &RuleSpec::allow(ip_rule_name(ip, "HTTP"))
                    .protocol(RuleProtocol::Tcp)
                    .remote_ip(ip)
                    .remote_port(80),
            )?;
            self.platform.add_firewall_rule(
                &RuleSpec::allow(ip_rule_name(ip, "HTTPS"))
                    .protocol(RuleProtocol::Tcp)
                    .remote_ip(ip)
                    .remote_port(443),
            )?;
            allowed.insert(ip);
        }

        Ok(())
    }

    /// Best-effort teardown. Never fails; whatever couldn't be undone is
    /// logged and left for the startup cleanup of the next run.
    pub fn disable_lockdown(&self) {
        if let Err(error) = self.platform.delete_firewall_rules_by_prefix(TAG) {
            tracing::warn!("Failed to delete tagged rules: {error:#}");
        }
        if let Err(error) = self.platform.set_outbound_policy(OutboundPolicy::Allow) {
            tracing::warn!("Failed to restore outbound policy: {error:#}");
        }
        self.allowed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::info!("Firewall lockdown disabled");
    }

    pub fn allowed_ips(&self) -> BTreeSet<Ipv4Addr> {
        self.allowed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Installed in order on lockdown: the narrow allows, then the explicit web
/// blocks that the per-IP allows are carved out of.
fn static_rules() -> Vec<RuleSpec> {
    vec![
        RuleSpec::allow("Proctor_AllowLoopback").remote_ip("127.0.0.0/8"),
        RuleSpec::allow("Proctor_AllowDnsUdp")
            .protocol(RuleProtocol::Udp)
            .remote_port(53),
        RuleSpec::allow("Proctor_AllowDnsTcp")
            .protocol(RuleProtocol::Tcp)
            .remote_port(53),
        RuleSpec::allow("Proctor_AllowServiceHost").program(settings::SVCHOST_PATH),
        RuleSpec::allow("Proctor_AllowConnectivity")
            .remote_ip(settings::OS_CONNECTIVITY_IPS.join(",")),
        RuleSpec::block("Proctor_BlockHTTP")
            .protocol(RuleProtocol::Tcp)
            .remote_port(80),
        RuleSpec::block(MARKER_RULE)
            .protocol(RuleProtocol::Tcp)
            .remote_port(443),
    ]
}

fn ip_rule_name(ip: Ipv4Addr, scheme: &str) -> String {
    format!("{TAG}CF_{}_{scheme}", ip.to_string().replace('.', "_"))
}
