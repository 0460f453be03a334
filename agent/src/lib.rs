//! Lockdown enforcement engine for the exam-proctoring agent.
//!
//! A privileged background service that, on command, re-homes all DNS
//! through an in-process filter, flips the host firewall to deny-by-default
//! outbound with a narrow dynamic allowlist, polices running processes, and
//! neutralises VPN tooling - then puts everything back the way it was.
//!
//! Built as a library plus a thin service binary so the whole engine can be
//! driven by tests through the platform adapter.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod allowlist;
pub mod coordinator;
pub mod dns_filter;
pub mod firewall;
pub mod ipc;
pub mod service;
pub mod settings;
pub mod vm_detect;
pub mod vpn_sentry;
pub mod watchdog;
mod worker;

/// Wires the coordinator to the IPC endpoint and runs until `terminate`
/// resolves. If lockdown is active at that point, the coordinator restores
/// the host before this returns.
#[cfg(windows)]
pub async fn run_agent(
    settings: settings::Settings,
    platform: std::sync::Arc<dyn proctor_bin_shared::platform::Platform>,
    terminate: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    use anyhow::Context as _;
    use std::sync::Arc;

    let probe = vm_detect::collect(&*platform);
    let verdict = vm_detect::detect(&probe);
    tracing::info!(
        is_vm = verdict.is_vm,
        indicators = ?verdict.indicators,
        "Environment report"
    );

    let coordinator =
        coordinator::Coordinator::new(Arc::clone(&platform), settings, verdict.is_vm);
    coordinator.startup_cleanup();

    let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel(1);
    let coordinator_task = tokio::spawn(coordinator.run(dispatch_rx));

    tokio::select! {
        () = terminate => tracing::info!("Caught terminate signal; shutting down"),
        impossible = ipc::platform::serve(dispatch_tx.clone()) => match impossible {},
    }

    // Closing the dispatch channel ends the coordinator's loop; it restores
    // the host first if lockdown is still up.
    drop(dispatch_tx);
    coordinator_task.await.context("Coordinator task failed")?;

    Ok(())
}
