//! Compile-time policy tables and the runtime override surface.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix on every firewall rule the agent owns. Removal is by this prefix,
/// so nothing else on the host may use it.
pub const TAG: &str = "Proctor_";

/// Base-name prefix marking agent-owned processes; the watchdog never
/// touches these.
pub const RESERVED_PROCESS_PREFIX: &str = "proctor";

/// Request pipe; a client writes one command line here.
pub const COMMAND_PIPE: &str = "Proctor";

/// Response pipe; the agent writes `OK` or `ERROR` here after dispatch.
pub const RESPONSE_PIPE: &str = "Proctor_Response";

/// The system DNS cache service, which sits on UDP/53 until stopped.
pub const DNSCACHE_SERVICE: &str = "Dnscache";

/// Connectivity-check endpoints Windows probes to decide "internet: yes".
/// Blocking these makes the OS nag the examinee with captive-portal popups.
pub const OS_CONNECTIVITY_IPS: &[&str] = &["13.107.4.52", "131.107.255.255"];

pub const SVCHOST_PATH: &str = r"C:\Windows\System32\svchost.exe";

const DEFAULT_ALLOW_DOMAINS: &[&str] = &["codeforces.com", "msftconnecttest.com", "msftncsi.com"];

/// The exam provider plus the edge hosts its pages actually pull from.
/// Not the same set as [`DEFAULT_ALLOW_DOMAINS`]: this one is what gets
/// resolved into per-IP firewall rules.
const DEFAULT_RESOLVE_DOMAINS: &[&str] =
    &["codeforces.com", "www.codeforces.com", "st.codeforces.com"];

const DEFAULT_BROWSERS: &[&str] = &["msedge.exe", "chrome.exe", "firefox.exe"];

/// Base names (lower-case) of processes the watchdog leaves alone: kernel,
/// session and security infrastructure, shell, printing, audio, Defender,
/// updates, and the usual vendor agents. Browsers come from configuration
/// and agent processes are covered by [`RESERVED_PROCESS_PREFIX`].
const BASE_PROCESS_WHITELIST: &[&str] = &[
    "system",
    "system idle process",
    "secure system",
    "registry",
    "memory compression",
    "smss.exe",
    "csrss.exe",
    "wininit.exe",
    "winlogon.exe",
    "services.exe",
    "lsass.exe",
    "lsaiso.exe",
    "svchost.exe",
    "fontdrvhost.exe",
    "dwm.exe",
    "explorer.exe",
    "taskmgr.exe",
    "sihost.exe",
    "ctfmon.exe",
    "conhost.exe",
    "dllhost.exe",
    "runtimebroker.exe",
    "taskhostw.exe",
    "searchindexer.exe",
    "shellexperiencehost.exe",
    "startmenuexperiencehost.exe",
    "applicationframehost.exe",
    "systemsettings.exe",
    "wmiprvse.exe",
    "wudfhost.exe",
    "spoolsv.exe",
    "printfilterpipelinesvc.exe",
    "audiodg.exe",
    "msmpeng.exe",
    "nissrv.exe",
    "mpdefendercoreservice.exe",
    "securityhealthservice.exe",
    "securityhealthsystray.exe",
    "wuauclt.exe",
    "usoclient.exe",
    "tiworker.exe",
    "trustedinstaller.exe",
    "werfault.exe",
    "rtkauduservice64.exe",
    "igfxem.exe",
    "nvcontainer.exe",
];

/// Substrings (lower-case) that mark an adapter description as a tunnel.
pub const VPN_INTERFACE_KEYWORDS: &[&str] = &[
    "tap", "tun", "vpn", "wireguard", "openvpn", "wintun", "hamachi", "zerotier", "tailscale",
    "nordlynx", "proton",
];

/// SCM names of consumer VPN services.
pub const VPN_SERVICES: &[&str] = &[
    "OpenVPNService",
    "OpenVPNServiceInteractive",
    "OpenVPNServiceLegacy",
    "WireGuardManager",
    "WireGuardTunnel",
    "Tailscale",
    "ZeroTier One",
    "ExpressVPNService",
    "NordVPN Service",
    "ProtonVPN Service",
    "Hamachi2Svc",
    "SurfsharkService",
];

/// Base names (lower-case) of consumer VPN processes.
pub const VPN_PROCESSES: &[&str] = &[
    "openvpn.exe",
    "openvpn-gui.exe",
    "openvpnserv.exe",
    "wireguard.exe",
    "tailscaled.exe",
    "tailscale-ipn.exe",
    "zerotier-one_x64.exe",
    "nordvpn.exe",
    "protonvpn.exe",
    "protonvpn.client.exe",
    "expressvpn.exe",
    "hamachi-2.exe",
    "surfshark.exe",
    "windscribe.exe",
];

/// Everything the coordinator and its subsystems need to know, resolved from
/// defaults and CLI/env overrides before the service starts.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Names (and their subdomains) the DNS filter forwards upstream.
    pub allow_domains: Vec<String>,
    /// Names the allowlist refresher resolves into per-IP firewall rules.
    pub resolve_domains: Vec<String>,
    pub upstream_dns: SocketAddr,
    pub dns_bind: SocketAddr,
    pub refresh_interval: Duration,
    pub watchdog_interval: Duration,
    pub sentry_interval: Duration,
    /// Lower-case base names the watchdog must not terminate.
    pub process_whitelist: BTreeSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        AgentArgs::default().settings()
    }
}

/// CLI args common to `run` and `run-debug`.
#[derive(clap::Args, Default)]
pub struct AgentArgs {
    /// File logging directory. Should be a path that's writeable by the
    /// service account.
    #[arg(short, long, env = "PROCTOR_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Upstream resolver the DNS filter forwards allowed queries to.
    #[arg(long, env = "PROCTOR_UPSTREAM_DNS")]
    pub upstream_dns: Option<SocketAddr>,

    /// Socket address the DNS filter binds.
    #[arg(long, env = "PROCTOR_DNS_BIND")]
    pub dns_bind: Option<SocketAddr>,

    /// Domain (or suffix) the DNS filter will forward. Repeatable.
    #[arg(long = "allow-domain")]
    pub allow_domains: Vec<String>,

    /// Domain resolved into the firewall's IP allowlist. Repeatable.
    #[arg(long = "resolve-domain")]
    pub resolve_domains: Vec<String>,

    /// Browser executable the watchdog must leave alone. Repeatable.
    #[arg(
        long = "allow-browser",
        env = "PROCTOR_ALLOW_BROWSERS",
        value_delimiter = ','
    )]
    pub allow_browsers: Vec<String>,

    /// How often the IP allowlist is re-resolved. Accepts human times,
    /// e.g. "90s" or "3m".
    #[arg(long, env = "PROCTOR_REFRESH_INTERVAL")]
    pub refresh_interval: Option<humantime::Duration>,
}

impl AgentArgs {
    pub fn settings(&self) -> Settings {
        let allow_domains = defaulted(&self.allow_domains, DEFAULT_ALLOW_DOMAINS);
        let resolve_domains = defaulted(&self.resolve_domains, DEFAULT_RESOLVE_DOMAINS);
        let browsers = defaulted(&self.allow_browsers, DEFAULT_BROWSERS);

        let mut process_whitelist: BTreeSet<String> = BASE_PROCESS_WHITELIST
            .iter()
            .map(|name| name.to_string())
            .collect();
        process_whitelist.extend(browsers.iter().map(|name| name.to_lowercase()));

        Settings {
            allow_domains,
            resolve_domains,
            upstream_dns: self.upstream_dns.unwrap_or_else(|| {
                "8.8.8.8:53".parse().expect("hard-coded address parses")
            }),
            dns_bind: self.dns_bind.unwrap_or_else(|| {
                "0.0.0.0:53".parse().expect("hard-coded address parses")
            }),
            refresh_interval: self
                .refresh_interval
                .map_or(Duration::from_secs(180), Into::into),
            watchdog_interval: Duration::from_secs(2),
            sentry_interval: Duration::from_secs(2),
            process_whitelist,
        }
    }
}

fn defaulted(overrides: &[String], defaults: &[&str]) -> Vec<String> {
    if overrides.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        overrides.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.refresh_interval, Duration::from_secs(180));
        assert!(settings
            .allow_domains
            .iter()
            .any(|d| d == "codeforces.com"));
        assert!(settings.process_whitelist.contains("explorer.exe"));
        assert!(settings.process_whitelist.contains("chrome.exe"));
    }

    #[test]
    fn browser_override_replaces_the_default_set() {
        let args = AgentArgs {
            allow_browsers: vec!["Brave.exe".to_string()],
            ..Default::default()
        };

        let settings = args.settings();

        assert!(settings.process_whitelist.contains("brave.exe"));
        assert!(!settings.process_whitelist.contains("chrome.exe"));
    }
}
