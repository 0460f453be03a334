//! The real adapter, backed by `netsh`, `tasklist`, the SCM, and the registry.
//!
//! Console tools are spawned with `CREATE_NO_WINDOW` so nothing flashes on the
//! examinee's desktop while the agent works.

use std::net::{IpAddr, Ipv4Addr};
use std::os::windows::process::CommandExt as _;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use windows_service::service::ServiceAccess;
use windows_service::service::ServiceState as ScmState;
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
use winreg::enums::HKEY_LOCAL_MACHINE;
use winreg::RegKey;

use super::{
    parse_tasklist_csv, Adapter, AdapterDns, OutboundPolicy, Platform, ProcessEntry, RuleSpec,
    ServiceState, SystemProbe,
};

/// Prevents the child process from opening a console window.
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

const SERVICE_STOP_WAIT: Duration = Duration::from_secs(10);
const SERVICE_START_WAIT: Duration = Duration::from_secs(15);
const SERVICE_POLL: Duration = Duration::from_millis(250);

const TCPIP_INTERFACES_KEY: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters\Interfaces";
const BIOS_KEY: &str = r"HARDWARE\DESCRIPTION\System\BIOS";
const CPU_KEY: &str = r"HARDWARE\DESCRIPTION\System\CentralProcessor\0";

pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn add_firewall_rule(&self, rule: &RuleSpec) -> Result<()> {
        netsh(&rule.add_args()).with_context(|| format!("Failed to add rule `{}`", rule.name))
    }

    fn delete_firewall_rule(&self, name: &str) -> Result<()> {
        netsh(&[
            "advfirewall".to_string(),
            "firewall".to_string(),
            "delete".to_string(),
            "rule".to_string(),
            format!("name={name}"),
        ])
        .with_context(|| format!("Failed to delete rule `{name}`"))
    }

    fn delete_firewall_rules_by_prefix(&self, prefix: &str) -> Result<()> {
        // `netsh` can't wildcard rule names, PowerShell can.
        powershell(&format!(
            "Remove-NetFirewallRule -DisplayName '{prefix}*' -ErrorAction SilentlyContinue"
        ))
        .with_context(|| format!("Failed to delete rules tagged `{prefix}`"))
    }

    fn firewall_rule_exists(&self, name: &str) -> Result<bool> {
        // `netsh` exits non-zero when no rule matches the name.
        let status = Command::new("netsh")
            .creation_flags(CREATE_NO_WINDOW)
            .args(["advfirewall", "firewall", "show", "rule"])
            .arg(format!("name={name}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("Failed to run `netsh advfirewall firewall show rule`")?;

        Ok(status.success())
    }

    fn set_outbound_policy(&self, policy: OutboundPolicy) -> Result<()> {
        netsh(&[
            "advfirewall".to_string(),
            "set".to_string(),
            "allprofiles".to_string(),
            "firewallpolicy".to_string(),
            policy.netsh_value().to_string(),
        ])
        .context("Failed to set default outbound policy")
    }

    fn adapters(&self) -> Result<Vec<Adapter>> {
        let adapters = ipconfig::get_adapters()
            .context("Failed to enumerate network adapters")?
            .into_iter()
            .filter(|adapter| adapter.if_type() != ipconfig::IfType::SoftwareLoopback)
            .map(|adapter| Adapter {
                name: adapter.friendly_name().to_string(),
                guid: adapter.adapter_name().to_string(),
                description: adapter.description().to_string(),
                up: adapter.oper_status() == ipconfig::OperStatus::IfOperStatusUp,
                dns_servers: adapter.dns_servers().to_vec(),
                mac: adapter.physical_address().map(format_mac),
            })
            .collect();

        Ok(adapters)
    }

    fn adapter_dns_config(&self, guid: &str) -> Result<AdapterDns> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm
            .open_subkey(format!(r"{TCPIP_INTERFACES_KEY}\{guid}"))
            .with_context(|| format!("No Tcpip interface key for adapter `{guid}`"))?;

        // `NameServer` holds statically configured servers; empty means DHCP.
        let configured: String = key.get_value("NameServer").unwrap_or_default();
        let servers = configured
            .split([',', ' '])
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Ipv4Addr>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Unparseable NameServer value `{configured}`"))?;

        if servers.is_empty() {
            Ok(AdapterDns::Dhcp)
        } else {
            Ok(AdapterDns::Static(servers))
        }
    }

    fn set_adapter_dns(&self, adapter: &str, dns: &AdapterDns) -> Result<()> {
        match dns {
            AdapterDns::Dhcp => netsh(&[
                "interface".to_string(),
                "ipv4".to_string(),
                "set".to_string(),
                "dns".to_string(),
                format!("name={adapter}"),
                "source=dhcp".to_string(),
            ])
            .with_context(|| format!("Failed to restore DHCP DNS on `{adapter}`")),
            AdapterDns::Static(servers) => {
                let Some((first, rest)) = servers.split_first() else {
                    bail!("Static DNS configuration needs at least one server");
                };
                // `validate=no`, or netsh blocks for seconds probing each server.
                netsh(&[
                    "interface".to_string(),
                    "ipv4".to_string(),
                    "set".to_string(),
                    "dns".to_string(),
                    format!("name={adapter}"),
                    "source=static".to_string(),
                    format!("address={first}"),
                    "register=primary".to_string(),
                    "validate=no".to_string(),
                ])
                .with_context(|| format!("Failed to set DNS on `{adapter}`"))?;
                for (i, server) in rest.iter().enumerate() {
                    netsh(&[
                        "interface".to_string(),
                        "ipv4".to_string(),
                        "add".to_string(),
                        "dns".to_string(),
                        format!("name={adapter}"),
                        format!("address={server}"),
                        format!("index={}", i + 2),
                        "validate=no".to_string(),
                    ])
                    .with_context(|| format!("Failed to add DNS server on `{adapter}`"))?;
                }
                Ok(())
            }
        }
    }

    fn flush_dns_cache(&self) -> Result<()> {
        run_checked("ipconfig", &["/flushdns".to_string()]).context("Failed to flush DNS cache")
    }

    fn disable_adapter(&self, adapter: &str) -> Result<()> {
        netsh(&[
            "interface".to_string(),
            "set".to_string(),
            "interface".to_string(),
            adapter.to_string(),
            "admin=disabled".to_string(),
        ])
        .with_context(|| format!("Failed to disable adapter `{adapter}`"))
    }

    fn processes(&self) -> Result<Vec<ProcessEntry>> {
        let output = Command::new("tasklist")
            .creation_flags(CREATE_NO_WINDOW)
            .args(["/FO", "CSV", "/NH"])
            .output()
            .context("Failed to run `tasklist`")?;
        if !output.status.success() {
            bail!("`tasklist` exited with {}", output.status);
        }

        Ok(parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout)))
    }

    fn kill_process_tree(&self, pid: u32) -> Result<()> {
        // `/T` takes the descendants down with it, `/F` skips the WM_CLOSE
        // grace period; taskkill returns once the tree is gone.
        let output = Command::new("taskkill")
            .creation_flags(CREATE_NO_WINDOW)
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .context("Failed to run `taskkill`")?;
        if !output.status.success() {
            bail!(
                "`taskkill` on pid {pid} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    fn service_state(&self, name: &str) -> Result<ServiceState> {
        let manager =
            ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
                .context("Failed to connect to the service manager")?;
        let Ok(service) = manager.open_service(name, ServiceAccess::QUERY_STATUS) else {
            return Ok(ServiceState::NotFound);
        };
        let status = service
            .query_status()
            .with_context(|| format!("Failed to query service `{name}`"))?;

        Ok(match status.current_state {
            ScmState::Stopped => ServiceState::Stopped,
            _ => ServiceState::Running,
        })
    }

    fn stop_service(&self, name: &str) -> Result<()> {
        let manager =
            ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
                .context("Failed to connect to the service manager")?;
        let service = manager
            .open_service(name, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS)
            .with_context(|| format!("Failed to open service `{name}`"))?;

        if service.query_status()?.current_state == ScmState::Stopped {
            return Ok(());
        }
        service
            .stop()
            .with_context(|| format!("Failed to stop service `{name}`"))?;

        let deadline = Instant::now() + SERVICE_STOP_WAIT;
        while service.query_status()?.current_state != ScmState::Stopped {
            if Instant::now() > deadline {
                bail!("Service `{name}` did not stop within {SERVICE_STOP_WAIT:?}");
            }
            std::thread::sleep(SERVICE_POLL);
        }

        Ok(())
    }

    fn start_service(&self, name: &str) -> Result<()> {
        let manager =
            ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
                .context("Failed to connect to the service manager")?;
        let service = manager
            .open_service(name, ServiceAccess::START | ServiceAccess::QUERY_STATUS)
            .with_context(|| format!("Failed to open service `{name}`"))?;

        if service.query_status()?.current_state == ScmState::Running {
            return Ok(());
        }
        service
            .start(&[] as &[&std::ffi::OsStr])
            .with_context(|| format!("Failed to start service `{name}`"))?;

        let deadline = Instant::now() + SERVICE_START_WAIT;
        while service.query_status()?.current_state != ScmState::Running {
            if Instant::now() > deadline {
                bail!("Service `{name}` did not start within {SERVICE_START_WAIT:?}");
            }
            std::thread::sleep(SERVICE_POLL);
        }

        Ok(())
    }

    fn route_table(&self) -> Result<String> {
        let output = Command::new("route")
            .creation_flags(CREATE_NO_WINDOW)
            .args(["print", "-4"])
            .output()
            .context("Failed to run `route print`")?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        let addresses = dns_lookup::lookup_host(domain)
            .with_context(|| format!("Failed to resolve `{domain}`"))?
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        Ok(addresses)
    }

    fn system_probe(&self) -> Result<SystemProbe> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);

        let (bios_vendor, bios_version, system_manufacturer, system_model) =
            match hklm.open_subkey(BIOS_KEY) {
                Ok(key) => (
                    key.get_value::<String, _>("BIOSVendor").ok(),
                    key.get_value::<String, _>("BIOSVersion").ok(),
                    key.get_value::<String, _>("SystemManufacturer").ok(),
                    key.get_value::<String, _>("SystemProductName").ok(),
                ),
                Err(_) => (None, None, None, None),
            };
        let cpu_name = hklm
            .open_subkey(CPU_KEY)
            .ok()
            .and_then(|key| key.get_value::<String, _>("ProcessorNameString").ok());
        let mac_addresses = self
            .adapters()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|adapter| adapter.mac)
            .collect();

        Ok(SystemProbe {
            bios_vendor,
            bios_version,
            system_manufacturer,
            system_model,
            cpu_name,
            hypervisor_present: hypervisor_present(),
            mac_addresses,
        })
    }

    fn registry_key_exists(&self, hklm_subkey: &str) -> bool {
        RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey(hklm_subkey)
            .is_ok()
    }
}

/// True if our process token carries admin privilege.
pub fn is_elevated() -> Result<bool> {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    let mut token = HANDLE::default();
    // SAFETY: We only pass pointers to our local vars, and Win32 doesn't
    // store them anywhere.
    unsafe {
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
            .context("OpenProcessToken failed")?;

        let mut elevation = TOKEN_ELEVATION::default();
        let mut len = std::mem::size_of::<TOKEN_ELEVATION>() as u32;
        let result = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            len,
            &mut len,
        );
        let _ = CloseHandle(token);
        result.context("GetTokenInformation failed")?;

        Ok(elevation.TokenIsElevated != 0)
    }
}

fn hypervisor_present() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        // CPUID leaf 1, ECX bit 31: set when running under a hypervisor.
        let leaf = unsafe { std::arch::x86_64::__cpuid(1) };
        leaf.ecx & (1 << 31) != 0
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}

fn netsh(args: &[String]) -> Result<()> {
    run_checked("netsh", args)
}

fn powershell(command: &str) -> Result<()> {
    run_checked(
        "powershell",
        &[
            "-NoProfile".to_string(),
            "-Command".to_string(),
            command.to_string(),
        ],
    )
}

fn run_checked(program: &str, args: &[String]) -> Result<()> {
    let output = Command::new(program)
        .creation_flags(CREATE_NO_WINDOW)
        .args(args)
        .output()
        .with_context(|| format!("Failed to spawn `{program}`"))?;
    if !output.status.success() {
        bail!(
            "`{program} {}` exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}
