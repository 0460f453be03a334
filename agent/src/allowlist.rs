//! Keeps the firewall's per-IP allowlist converged with live DNS.
//!
//! The refresher owns the allowed-IP set. The firewall controller is handed
//! a snapshot on each change; it never reaches back.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use proctor_bin_shared::platform::Platform;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::firewall::FirewallController;

pub struct AllowlistRefresher {
    platform: Arc<dyn Platform>,
    firewall: Arc<FirewallController>,
    domains: Vec<String>,
    allowed: BTreeSet<Ipv4Addr>,
}

impl AllowlistRefresher {
    pub fn new(
        platform: Arc<dyn Platform>,
        firewall: Arc<FirewallController>,
        domains: Vec<String>,
    ) -> Self {
        Self {
            platform,
            firewall,
            domains,
            allowed: BTreeSet::new(),
        }
    }

    /// One reconciliation pass.
    ///
    /// Resolution trouble is transient: the current set stays authoritative
    /// and the next tick retries. Only a failed firewall reconcile is an
    /// error, since at that point rules and DNS disagree.
    pub fn refresh(&mut self) -> Result<()> {
        let mut new_set = BTreeSet::new();
        for domain in &self.domains {
            match self.platform.resolve_ipv4(domain) {
                Ok(ips) => new_set.extend(ips),
                Err(error) => tracing::warn!(%domain, "Resolution failed: {error:#}"),
            }
        }

        if new_set.is_empty() {
            tracing::warn!(
                retained = self.allowed.len(),
                "Refresh resolved no addresses; keeping the current allowlist"
            );
            return Ok(());
        }
        if new_set == self.allowed {
            return Ok(());
        }

        tracing::info!(
            added = new_set.difference(&self.allowed).count(),
            removed = self.allowed.difference(&new_set).count(),
            "IP allowlist changed; reconciling firewall"
        );
        self.firewall.update_allowed_ips(&new_set)?;
        self.allowed = new_set;

        Ok(())
    }

    pub fn allowed(&self) -> &BTreeSet<Ipv4Addr> {
        &self.allowed
    }
}

pub struct RefresherHandle {
    refresh_tx: mpsc::Sender<oneshot::Sender<Result<()>>>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// On-demand refresh, awaited to completion. Backs the `REFRESH` command.
    pub async fn refresh_now(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.refresh_tx
            .send(reply_tx)
            .await
            .map_err(|_| anyhow!("Allowlist refresher is gone"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("Allowlist refresher dropped the request"))?
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Starts the periodic refresh task. The caller is expected to have run one
/// synchronous [`AllowlistRefresher::refresh`] already; the first timed tick
/// fires a full period from now.
pub fn spawn(mut refresher: AllowlistRefresher, period: Duration) -> RefresherHandle {
    let (refresh_tx, mut refresh_rx) = mpsc::channel::<oneshot::Sender<Result<()>>>(1);
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(reply) = refresh_rx.recv() => {
                    let _ = reply.send(refresher.refresh());
                }
                _ = ticker.tick() => {
                    if let Err(error) = refresher.refresh() {
                        tracing::error!("Periodic allowlist refresh failed: {error:#}");
                    }
                }
            }
        }
        tracing::debug!("Allowlist refresher stopped");
    });

    RefresherHandle {
        refresh_tx,
        shutdown_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_bin_shared::test_utils::FakePlatform;

    fn fixture(domains: &[&str]) -> (Arc<FakePlatform>, AllowlistRefresher) {
        let platform = Arc::new(FakePlatform::new());
        let firewall = Arc::new(FirewallController::new(platform.clone()));
        let refresher = AllowlistRefresher::new(
            platform.clone(),
            firewall,
            domains.iter().map(|d| d.to_string()).collect(),
        );
        (platform, refresher)
    }

    #[test]
    fn unions_answers_across_domains() {
        let (platform, mut refresher) = fixture(&["a.example", "b.example"]);
        platform.script_dns("a.example", &["1.1.1.1".parse().unwrap()]);
        platform.script_dns("b.example", &["2.2.2.2".parse().unwrap(), "1.1.1.1".parse().unwrap()]);

        refresher.refresh().unwrap();

        assert_eq!(
            platform.rule_names(),
            [
                "Proctor_CF_1_1_1_1_HTTP",
                "Proctor_CF_1_1_1_1_HTTPS",
                "Proctor_CF_2_2_2_2_HTTP",
                "Proctor_CF_2_2_2_2_HTTPS",
            ]
        );
    }

    #[test]
    fn empty_resolution_keeps_the_current_set() {
        let (platform, mut refresher) = fixture(&["a.example"]);
        platform.script_dns("a.example", &["1.1.1.1".parse().unwrap()]);
        refresher.refresh().unwrap();

        // The provider's DNS goes dark; the allowlist must not collapse.
        platform.script_dns("a.example", &[]);
        refresher.refresh().unwrap();

        assert_eq!(refresher.allowed().len(), 1);
        assert!(platform.has_rule("Proctor_CF_1_1_1_1_HTTP"));
    }

    #[test]
    fn unchanged_answers_skip_the_firewall() {
        let (platform, mut refresher) = fixture(&["a.example"]);
        platform.script_dns("a.example", &["1.1.1.1".parse().unwrap()]);
        refresher.refresh().unwrap();

        // Any rule addition would now fail, proving no reconcile happens.
        platform.fail_add_rule(true);
        refresher.refresh().unwrap();
    }

    #[tokio::test]
    async fn handle_serves_on_demand_refreshes() {
        let (platform, refresher) = fixture(&["a.example"]);
        platform.script_dns("a.example", &["9.9.9.9".parse().unwrap()]);
        let handle = spawn(refresher, Duration::from_secs(3600));

        handle.refresh_now().await.unwrap();

        assert!(platform.has_rule("Proctor_CF_9_9_9_9_HTTPS"));
        handle.stop().await;
    }
}
