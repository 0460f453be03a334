//! Process watchdog: during lockdown, anything off the whitelist dies.

use std::collections::BTreeSet;
use std::sync::Arc;

use proctor_bin_shared::platform::Platform;

use crate::settings::RESERVED_PROCESS_PREFIX;

pub struct Watchdog {
    platform: Arc<dyn Platform>,
    /// Lower-case base names.
    whitelist: BTreeSet<String>,
}

impl Watchdog {
    pub fn new(platform: Arc<dyn Platform>, whitelist: BTreeSet<String>) -> Self {
        Self {
            platform,
            whitelist,
        }
    }

    /// One enumeration pass. Each kill is independent; one stubborn process
    /// must not shield the rest of the table.
    pub fn sweep(&self) {
        let processes = match self.platform.processes() {
            Ok(processes) => processes,
            Err(error) => {
                tracing::warn!("Process enumeration failed: {error:#}");
                return;
            }
        };
        let own_pid = self.platform.current_pid();

        for process in processes {
            if !should_terminate(&process.name, process.pid, own_pid, &self.whitelist) {
                continue;
            }
            match self.platform.kill_process_tree(process.pid) {
                Ok(()) => tracing::info!(
                    pid = process.pid,
                    name = %process.name,
                    "Terminated non-whitelisted process"
                ),
                // Protected OS processes refuse the kill; expected, not alarming.
                Err(error) => tracing::debug!(
                    pid = process.pid,
                    name = %process.name,
                    "Could not terminate: {error:#}"
                ),
            }
        }
    }
}

/// The kill decision, kept pure so the policy is table-testable.
///
/// Never true for the agent itself or for anything carrying the reserved
/// name prefix (the launcher, the GUI, sibling tooling).
pub fn should_terminate(name: &str, pid: u32, own_pid: u32, whitelist: &BTreeSet<String>) -> bool {
    if pid == own_pid {
        return false;
    }
    let name = name.to_lowercase();
    if name.starts_with(RESERVED_PROCESS_PREFIX) {
        return false;
    }

    !whitelist.contains(&name)
}
