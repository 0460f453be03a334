//! Binary surface: CLI subcommands, logging bootstrap, service entry.

use anyhow::Result;
use clap::Parser;

use crate::settings::AgentArgs;

#[cfg(windows)]
#[path = "service/windows.rs"]
mod platform;

/// Default log filter for the agent service
#[cfg(all(windows, debug_assertions))]
const SERVICE_RUST_LOG: &str = "debug";

/// Default log filter for the agent service
#[cfg(all(windows, not(debug_assertions)))]
const SERVICE_RUST_LOG: &str = "info";

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,

    #[command(flatten)]
    args: AgentArgs,
}

#[derive(clap::Subcommand)]
enum Cmd {
    /// Register the agent with the service manager. Meant for the installer.
    Install,
    /// Remove the service registration.
    Uninstall,
    /// Run under the service host. Not useful in a terminal.
    Run,
    /// Run in the foreground with logs on stdout.
    RunDebug,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(windows)]
    {
        match cli.command.unwrap_or(Cmd::Run) {
            Cmd::Install => platform::install_service(),
            Cmd::Uninstall => platform::uninstall_service(),
            Cmd::Run => platform::run_service(cli.args),
            Cmd::RunDebug => run_debug(cli.args),
        }
    }
    #[cfg(not(windows))]
    {
        let _ = cli;
        anyhow::bail!("The lockdown agent only supports Windows hosts");
    }
}

#[cfg(windows)]
fn run_debug(args: AgentArgs) -> Result<()> {
    use anyhow::{bail, Context as _};
    use std::sync::Arc;
    use tracing_subscriber::{fmt, layer::SubscriberExt as _, Layer as _, Registry};

    let directives = log_filter();
    let layer = fmt::layer().with_filter(
        proctor_logging::try_filter(&directives).context("Couldn't parse log directives")?,
    );
    proctor_logging::init(Registry::default().with(layer))?;
    tracing::info!(
        arch = std::env::consts::ARCH,
        version = env!("CARGO_PKG_VERSION"),
    );

    if !proctor_bin_shared::platform::windows::is_elevated()? {
        bail!("The agent failed its elevation check; run it from an elevated shell");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut terminate = proctor_bin_shared::signals::Terminate::new()?;
        crate::run_agent(
            args.settings(),
            Arc::new(proctor_bin_shared::platform::windows::WindowsPlatform),
            async move { terminate.recv().await },
        )
        .await
    })
}

/// Starts logging for the production service: a file under ProgramData plus
/// stdout (the SCM discards stdout, but `run` in a terminal still shows it).
///
/// The returned handle must be kept alive; dropping it flushes the file.
#[cfg(windows)]
pub(crate) fn setup_logging(
    log_dir: Option<std::path::PathBuf>,
) -> Result<proctor_logging::file::Handle> {
    use anyhow::Context as _;
    use tracing_subscriber::{fmt, layer::SubscriberExt as _, Layer as _, Registry};

    let log_dir = log_dir
        .or_else(proctor_bin_shared::known_dirs::service_logs)
        .context("Can't compute the service log directory")?;
    std::fs::create_dir_all(&log_dir).context("Failed to create the log directory")?;

    let directives = log_filter();
    let (file_layer, handle) = proctor_logging::file::layer(&log_dir, "agent");
    let subscriber = Registry::default()
        .with(file_layer.with_filter(
            proctor_logging::try_filter(&directives).context("Couldn't parse log directives")?,
        ))
        .with(fmt::layer().with_filter(
            proctor_logging::try_filter(&directives).context("Couldn't parse log directives")?,
        ));
    proctor_logging::init(subscriber)?;

    tracing::info!(
        arch = std::env::consts::ARCH,
        version = env!("CARGO_PKG_VERSION"),
        %directives,
        log_dir = %log_dir.display(),
    );

    Ok(handle)
}

/// `RUST_LOG` if set, the build-profile default otherwise.
#[cfg(windows)]
fn log_filter() -> String {
    std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV)
        .unwrap_or_else(|_| SERVICE_RUST_LOG.to_string())
}

#[cfg(test)]
mod tests {
    use super::{Cli, Cmd};
    use clap::Parser;
    use std::path::PathBuf;

    const EXE_NAME: &str = "proctor-agent";

    // The installer and launcher scripts hard-code these invocations; this
    // pins the arg surface they depend on.
    #[test]
    fn cli() {
        let actual =
            Cli::try_parse_from([EXE_NAME, "--log-dir", "exam_logs", "run-debug"]).unwrap();
        assert!(matches!(actual.command, Some(Cmd::RunDebug)));
        assert_eq!(actual.args.log_dir, Some(PathBuf::from("exam_logs")));

        let actual = Cli::try_parse_from([EXE_NAME, "run"]).unwrap();
        assert!(matches!(actual.command, Some(Cmd::Run)));

        let actual = Cli::try_parse_from([EXE_NAME]).unwrap();
        assert!(actual.command.is_none());

        let actual = Cli::try_parse_from([
            EXE_NAME,
            "--allow-domain",
            "codeforces.com",
            "--allow-domain",
            "polygon.codeforces.com",
            "run-debug",
        ])
        .unwrap();
        assert_eq!(actual.args.allow_domains.len(), 2);
    }
}
