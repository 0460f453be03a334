//! The lockdown state machine.
//!
//! Owns every subsystem and drives the enter/exit sequences from the
//! serialized dispatch path. Ordering matters on the way in: the DNS filter
//! must be live before the firewall tightens, or the filter's own upstream
//! path gets denied. The way out is the mirror image, each step best-effort.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Result;
use proctor_bin_shared::platform::{AdapterDns, Platform};
use tokio::sync::{mpsc, oneshot};

use crate::allowlist::{self, AllowlistRefresher, RefresherHandle};
use crate::dns_filter::{DnsFilter, FilterConfig, StartError};
use crate::firewall::FirewallController;
use crate::ipc::{Command, Reply};
use crate::settings::{Settings, DNSCACHE_SERVICE};
use crate::vpn_sentry::VpnSentry;
use crate::watchdog::Watchdog;
use crate::worker::{self, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownState {
    Inactive,
    Entering,
    Active,
    Exiting,
}

impl fmt::Display for LockdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which enter step failed. Any of these aborts the sequence; the
/// coordinator then runs the full exit sequence to unwind the steps that
/// did succeed.
#[derive(Debug, thiserror::Error)]
pub enum EnterError {
    #[error("failed to start the DNS filter: {0:#}")]
    DnsFilter(anyhow::Error),
    #[error("failed to re-home adapter DNS: {0:#}")]
    AdapterDns(anyhow::Error),
    #[error("failed to flush the DNS cache: {0:#}")]
    FlushCache(anyhow::Error),
    #[error("failed to enable the firewall lockdown: {0:#}")]
    Firewall(anyhow::Error),
    #[error("initial allowlist refresh failed: {0:#}")]
    Allowlist(anyhow::Error),
}

/// What the exit sequence couldn't undo. Exit is best-effort by design, so
/// this is a report, not an error: reaching `Inactive` is what the IPC
/// reply conveys.
#[derive(Debug, Default)]
#[must_use]
pub struct ExitReport {
    pub failures: Vec<anyhow::Error>,
}

impl ExitReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: &str, result: Result<()>) {
        if let Err(error) = result {
            tracing::warn!("Exit step `{step}` failed: {error:#}");
            self.failures.push(error.context(step.to_string()));
        }
    }
}

pub struct Coordinator {
    platform: Arc<dyn Platform>,
    settings: Settings,
    firewall: Arc<FirewallController>,
    state: LockdownState,
    is_vm: bool,

    /// Captured per adapter on the first override; `Dhcp` when nothing was
    /// statically configured.
    original_dns: Vec<(String, AdapterDns)>,
    /// True if the enter sequence had to stop the system DNS cache service
    /// to free UDP/53; exit restarts it then.
    dnscache_stopped: bool,

    dns_filter: Option<DnsFilter>,
    refresher: Option<RefresherHandle>,
    watchdog: Option<WorkerHandle>,
    sentry: Option<WorkerHandle>,
}

impl Coordinator {
    pub fn new(platform: Arc<dyn Platform>, settings: Settings, is_vm: bool) -> Self {
        let firewall = Arc::new(FirewallController::new(Arc::clone(&platform)));

        Self {
            platform,
            settings,
            firewall,
            state: LockdownState::Inactive,
            is_vm,
            original_dns: Vec::new(),
            dnscache_stopped: false,
            dns_filter: None,
            refresher: None,
            watchdog: None,
            sentry: None,
        }
    }

    /// Idempotent crash recovery, run once before the first command is
    /// accepted (P7).
    pub fn startup_cleanup(&self) {
        self.firewall.startup_cleanup();
    }

    pub fn state(&self) -> LockdownState {
        self.state
    }

    pub fn firewall(&self) -> &Arc<FirewallController> {
        &self.firewall
    }

    /// Consumes commands until the channel closes. If the service is being
    /// stopped mid-lockdown, the host is restored before this returns.
    pub async fn run(mut self, mut commands: mpsc::Receiver<(Command, oneshot::Sender<Reply>)>) {
        while let Some((command, reply_tx)) = commands.recv().await {
            let reply = self.dispatch(command).await;
            let _ = reply_tx.send(reply);
        }

        if matches!(
            self.state,
            LockdownState::Active | LockdownState::Entering
        ) {
            tracing::info!("Service stopping during lockdown; restoring the host");
            let _report = self.run_exit_sequence().await;
            self.state = LockdownState::Inactive;
        }
    }

    pub async fn dispatch(&mut self, command: Command) -> Reply {
        tracing::info!(%command, state = %self.state, "Dispatching");

        match (self.state, command) {
            (LockdownState::Inactive, Command::Enter) => {
                self.state = LockdownState::Entering;
                match self.run_enter_sequence().await {
                    Ok(()) => {
                        self.state = LockdownState::Active;
                        tracing::info!("Lockdown active");
                        Reply::Ok
                    }
                    Err(error) => {
                        tracing::error!("Enter sequence failed: {error}");
                        let _report = self.run_exit_sequence().await;
                        self.state = LockdownState::Inactive;
                        Reply::Error
                    }
                }
            }
            // A second ENTER from a racing client is a no-op, not a fault.
            (LockdownState::Active, Command::Enter) => {
                tracing::debug!("Already locked down");
                Reply::Ok
            }
            (LockdownState::Active, Command::Exit) => {
                self.state = LockdownState::Exiting;
                let report = self.run_exit_sequence().await;
                self.state = LockdownState::Inactive;
                if !report.is_clean() {
                    tracing::warn!(
                        failures = report.failures.len(),
                        "Exited lockdown with unrestored state"
                    );
                }
                // The state machine reached Inactive; that's what the reply
                // conveys. Partial restore failures live in the logs.
                Reply::Ok
            }
            (LockdownState::Inactive, Command::Exit) => {
                tracing::debug!("Not locked down; nothing to exit");
                Reply::Ok
            }
            (_, Command::Status) => {
                tracing::info!(
                    state = %self.state,
                    is_vm = self.is_vm,
                    lockdown_rules_present = self.firewall.is_lockdown_active(),
                    "Status report"
                );
                Reply::Ok
            }
            (LockdownState::Active, Command::Refresh) => {
                let Some(refresher) = self.refresher.as_ref() else {
                    tracing::error!("Active without a refresher; refusing REFRESH");
                    return Reply::Error;
                };
                match refresher.refresh_now().await {
                    Ok(()) => Reply::Ok,
                    Err(error) => {
                        tracing::error!("On-demand refresh failed: {error:#}");
                        Reply::Error
                    }
                }
            }
            (_, Command::Refresh) => {
                tracing::warn!("REFRESH outside of lockdown");
                Reply::Error
            }
            // Unreachable while dispatch is serialized; the check stays
            // explicit regardless.
            (LockdownState::Entering | LockdownState::Exiting, Command::Enter | Command::Exit) => {
                tracing::warn!(%command, state = %self.state, "Rejected during transition");
                Reply::Error
            }
        }
    }

    async fn run_enter_sequence(&mut self) -> Result<(), EnterError> {
        // 1. DNS filter first: once the firewall tightens, the filter is the
        //    only sanctioned path to the upstream resolver.
        let filter_config = FilterConfig::from_settings(&self.settings);
        let filter = match DnsFilter::start(filter_config.clone()).await {
            Ok(filter) => filter,
            Err(StartError::PortInUse(addr)) => {
                tracing::info!(%addr, "DNS port taken; stopping the system DNS cache service");
                self.platform
                    .stop_service(DNSCACHE_SERVICE)
                    .map_err(EnterError::DnsFilter)?;
                self.dnscache_stopped = true;
                DnsFilter::start(filter_config)
                    .await
                    .map_err(|error| EnterError::DnsFilter(error.into()))?
            }
            Err(error) => return Err(EnterError::DnsFilter(error.into())),
        };
        self.dns_filter = Some(filter);

        // 2. Re-home every active adapter onto the filter, remembering what
        //    was there before.
        let adapters = self
            .platform
            .adapters()
            .map_err(EnterError::AdapterDns)?;
        for adapter in adapters.into_iter().filter(|adapter| adapter.up) {
            let original = self
                .platform
                .adapter_dns_config(&adapter.guid)
                .unwrap_or_else(|error| {
                    tracing::debug!(adapter = %adapter.name, "Couldn't read DNS config, assuming DHCP: {error:#}");
                    AdapterDns::Dhcp
                });
            self.platform
                .set_adapter_dns(&adapter.name, &AdapterDns::Static(vec![Ipv4Addr::LOCALHOST]))
                .map_err(EnterError::AdapterDns)?;
            self.original_dns.push((adapter.name, original));
        }

        // 3. Drop every answer cached before the filter took over.
        self.platform
            .flush_dns_cache()
            .map_err(EnterError::FlushCache)?;

        // 4.
        self.firewall
            .enable_lockdown()
            .map_err(EnterError::Firewall)?;

        // 5. First refresh runs synchronously: ENTER must not report OK
        //    while the firewall still lacks the provider's addresses.
        let mut refresher = AllowlistRefresher::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.firewall),
            self.settings.resolve_domains.clone(),
        );
        refresher.refresh().map_err(EnterError::Allowlist)?;
        self.refresher = Some(allowlist::spawn(refresher, self.settings.refresh_interval));

        // 6.
        let watchdog = Watchdog::new(
            Arc::clone(&self.platform),
            self.settings.process_whitelist.clone(),
        );
        self.watchdog = Some(worker::spawn_periodic(
            "watchdog",
            self.settings.watchdog_interval,
            move || watchdog.sweep(),
        ));
        let sentry = VpnSentry::new(Arc::clone(&self.platform));
        self.sentry = Some(worker::spawn_periodic(
            "vpn-sentry",
            self.settings.sentry_interval,
            move || sentry.sweep(),
        ));

        Ok(())
    }

    /// The reverse of the enter sequence, continuing past failures.
    async fn run_exit_sequence(&mut self) -> ExitReport {
        let mut report = ExitReport::default();

        // 1. Quiesce the periodic subsystems so nothing re-adds state
        //    behind the teardown.
        if let Some(sentry) = self.sentry.take() {
            sentry.stop().await;
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop().await;
        }
        if let Some(refresher) = self.refresher.take() {
            refresher.stop().await;
        }

        // 2. Tagged rules out, outbound policy back to allow.
        self.firewall.disable_lockdown();

        // 3. Put adapter DNS back the way we found it.
        for (adapter, original) in std::mem::take(&mut self.original_dns) {
            report.record(
                "restore adapter DNS",
                self.platform.set_adapter_dns(&adapter, &original),
            );
        }

        // 4. Drop anything resolved through the filter.
        report.record("flush DNS cache", self.platform.flush_dns_cache());

        // 5. Release UDP/53, then bring the system resolver service back if
        //    we were the ones who stopped it.
        if let Some(filter) = self.dns_filter.take() {
            filter.stop().await;
        }
        if self.dnscache_stopped {
            report.record(
                "restart DNS cache service",
                self.platform.start_service(DNSCACHE_SERVICE),
            );
            self.dnscache_stopped = false;
        }

        if report.is_clean() {
            tracing::info!("Host restored");
        }

        report
    }
}
