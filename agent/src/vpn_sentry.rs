//! VPN sentry: spots and neutralises tunnel software while lockdown holds.
//!
//! Four vectors per sweep: adapter descriptions, SCM services, process
//! names, and a read-only look at the routing table. Everything is
//! best-effort; a vector that fails is logged and retried on the next tick.

use std::sync::Arc;

use proctor_bin_shared::platform::{Platform, ServiceState};

use crate::settings::{VPN_INTERFACE_KEYWORDS, VPN_PROCESSES, VPN_SERVICES};

pub struct VpnSentry {
    platform: Arc<dyn Platform>,
}

impl VpnSentry {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub fn sweep(&self) {
        self.sweep_interfaces();
        self.sweep_services();
        self.sweep_processes();
        self.scan_routes();
    }

    fn sweep_interfaces(&self) {
        let adapters = match self.platform.adapters() {
            Ok(adapters) => adapters,
            Err(error) => {
                tracing::warn!("Adapter enumeration failed: {error:#}");
                return;
            }
        };
        for adapter in adapters {
            if !adapter.up || !interface_is_vpn(&adapter.description) {
                continue;
            }
            match self.platform.disable_adapter(&adapter.name) {
                Ok(()) => tracing::info!(
                    name = %adapter.name,
                    description = %adapter.description,
                    "Disabled VPN adapter"
                ),
                Err(error) => tracing::warn!(
                    name = %adapter.name,
                    "Failed to disable VPN adapter: {error:#}"
                ),
            }
        }
    }

    fn sweep_services(&self) {
        for service in VPN_SERVICES {
            match self.platform.service_state(service) {
                Ok(ServiceState::Running) => match self.platform.stop_service(service) {
                    Ok(()) => tracing::info!(%service, "Stopped VPN service"),
                    Err(error) => {
                        tracing::warn!(%service, "Failed to stop VPN service: {error:#}")
                    }
                },
                Ok(_) => {}
                Err(error) => tracing::debug!(%service, "Service query failed: {error:#}"),
            }
        }
    }

    fn sweep_processes(&self) {
        let processes = match self.platform.processes() {
            Ok(processes) => processes,
            Err(error) => {
                tracing::warn!("Process enumeration failed: {error:#}");
                return;
            }
        };
        for process in processes {
            if !process_is_vpn(&process.name) {
                continue;
            }
            match self.platform.kill_process_tree(process.pid) {
                Ok(()) => {
                    tracing::info!(pid = process.pid, name = %process.name, "Killed VPN process")
                }
                Err(error) => tracing::warn!(
                    pid = process.pid,
                    name = %process.name,
                    "Failed to kill VPN process: {error:#}"
                ),
            }
        }
    }

    /// Observation only: rewriting routes under the firewall's feet causes
    /// more trouble than the evidence is worth.
    fn scan_routes(&self) {
        let table = match self.platform.route_table() {
            Ok(table) => table,
            Err(error) => {
                tracing::debug!("Could not read the routing table: {error:#}");
                return;
            }
        };
        for line in table.lines() {
            let trimmed = line.trim();
            if !trimmed.starts_with("0.0.0.0") {
                continue;
            }
            let lower = trimmed.to_lowercase();
            if lower.contains("tap") || lower.contains("tun") {
                tracing::warn!(route = trimmed, "Default route through a tunnel device");
            }
        }
    }
}

pub fn interface_is_vpn(description: &str) -> bool {
    let description = description.to_lowercase();

    VPN_INTERFACE_KEYWORDS
        .iter()
        .any(|keyword| description.contains(keyword))
}

pub fn process_is_vpn(name: &str) -> bool {
    let name = name.to_lowercase();

    VPN_PROCESSES.iter().any(|process| *process == name)
}
