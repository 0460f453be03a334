//! One-shot VM heuristics. Pure observation: the verdict goes into the
//! report, nothing is ever killed or reconfigured because of it.

use proctor_bin_shared::platform::{Platform, SystemProbe};

const FIRMWARE_MARKERS: &[&str] = &[
    "vmware",
    "virtualbox",
    "vbox",
    "qemu",
    "bochs",
    "xen",
    "seabios",
    "innotek",
    "parallels",
    "ovmf",
    "virtual machine",
];

const CPU_MARKERS: &[&str] = &["qemu", "kvm", "virtual cpu"];

const VM_TOOL_PROCESSES: &[&str] = &[
    "vmtoolsd.exe",
    "vm3dservice.exe",
    "vboxservice.exe",
    "vboxtray.exe",
    "vmwaretray.exe",
    "vmwareuser.exe",
    "qemu-ga.exe",
    "prl_tools.exe",
    "prl_cc.exe",
    "xenservice.exe",
];

const VM_REGISTRY_KEYS: &[&str] = &[
    r"SOFTWARE\VMware, Inc.\VMware Tools",
    r"SOFTWARE\Oracle\VirtualBox Guest Additions",
    r"HARDWARE\ACPI\DSDT\VBOX__",
    r"SYSTEM\CurrentControlSet\Services\VBoxGuest",
    r"SYSTEM\CurrentControlSet\Services\vmicheartbeat",
];

/// Well-known OUIs of virtual NICs (VMware, VirtualBox, Hyper-V, KVM,
/// Parallels, Xen).
const VM_MAC_PREFIXES: &[&str] = &[
    "00-05-69", "00-0C-29", "00-1C-14", "00-50-56", "08-00-27", "00-15-5D", "52-54-00", "00-1C-42",
    "00-16-3E",
];

/// Everything `detect` scores, collected up front so the scoring is pure.
#[derive(Debug, Default)]
pub struct Probe {
    pub system: SystemProbe,
    /// Lower-case process base names.
    pub process_names: Vec<String>,
    pub registry_hits: Vec<String>,
}

/// Best-effort collection; a probe that fails contributes nothing.
pub fn collect(platform: &dyn Platform) -> Probe {
    let system = platform.system_probe().unwrap_or_else(|error| {
        tracing::debug!("System probe failed: {error:#}");
        SystemProbe::default()
    });
    let process_names = platform
        .processes()
        .map(|processes| {
            processes
                .into_iter()
                .map(|process| process.name.to_lowercase())
                .collect()
        })
        .unwrap_or_else(|error| {
            tracing::debug!("Process probe failed: {error:#}");
            Vec::new()
        });
    let registry_hits = VM_REGISTRY_KEYS
        .iter()
        .filter(|key| platform.registry_key_exists(key))
        .map(|key| key.to_string())
        .collect();

    Probe {
        system,
        process_names,
        registry_hits,
    }
}

#[derive(Debug)]
pub struct Verdict {
    pub is_vm: bool,
    /// Which heuristics fired, for the report log.
    pub indicators: Vec<String>,
}

pub fn detect(probe: &Probe) -> Verdict {
    let mut indicators = Vec::new();

    let firmware_fields = [
        &probe.system.bios_vendor,
        &probe.system.bios_version,
        &probe.system.system_manufacturer,
        &probe.system.system_model,
    ];
    for value in firmware_fields.into_iter().flatten() {
        let lower = value.to_lowercase();
        if FIRMWARE_MARKERS.iter().any(|marker| lower.contains(marker)) {
            indicators.push(format!("firmware: {value}"));
        }
    }

    if let Some(cpu) = &probe.system.cpu_name {
        let lower = cpu.to_lowercase();
        if CPU_MARKERS.iter().any(|marker| lower.contains(marker)) {
            indicators.push(format!("cpu: {cpu}"));
        }
    }

    if probe.system.hypervisor_present {
        indicators.push("hypervisor bit set".to_string());
    }

    for name in &probe.process_names {
        if VM_TOOL_PROCESSES.contains(&name.as_str()) {
            indicators.push(format!("process: {name}"));
        }
    }

    for key in &probe.registry_hits {
        indicators.push(format!("registry: {key}"));
    }

    for mac in &probe.system.mac_addresses {
        if VM_MAC_PREFIXES
            .iter()
            .any(|prefix| mac.to_uppercase().starts_with(prefix))
        {
            indicators.push(format!("mac: {mac}"));
        }
    }

    Verdict {
        is_vm: !indicators.is_empty(),
        indicators,
    }
}
