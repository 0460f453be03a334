//! Windows service integration.
//!
//! Try not to panic in here. Windows doesn't consider the service stopped
//! just because its only process ended; we must report `Stopped` through
//! the status handle ourselves on every path out.

use std::ffi::OsString;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, Result};
use proctor_bin_shared::platform::windows::WindowsPlatform;
use tokio::sync::mpsc;
use windows_service::service::{
    ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
    ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

use crate::settings::{AgentArgs, Settings};

const SERVICE_NAME: &str = "proctor_agent";
const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;

/// The SCM entry takes no arguments worth trusting (see `service_run`), so
/// the parsed CLI config is stashed here for it.
static CONFIG: OnceLock<(Option<std::path::PathBuf>, Settings)> = OnceLock::new();

pub(crate) fn install_service() -> Result<()> {
    let manager_access = ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE;
    let service_manager = ServiceManager::local_computer(None::<&str>, manager_access)?;

    let name = OsString::from(SERVICE_NAME);

    // Un-install an existing registration first if needed
    if let Ok(service) = service_manager.open_service(&name, ServiceAccess::DELETE) {
        let _ = service.delete();
    }

    let executable_path = std::env::current_exe()?;
    let service_info = ServiceInfo {
        name,
        display_name: OsString::from("Proctor Lockdown Agent"),
        service_type: SERVICE_TYPE,
        // The privileged launcher starts it for the duration of a sitting.
        start_type: ServiceStartType::OnDemand,
        error_control: ServiceErrorControl::Normal,
        executable_path,
        launch_arguments: vec!["run".into()],
        dependencies: vec![],
        account_name: None, // LocalSystem
        account_password: None,
    };
    let service = service_manager.create_service(&service_info, ServiceAccess::CHANGE_CONFIG)?;
    service.set_description(
        "Enforces exam lockdown: DNS filtering, outbound firewall allowlist, process policing.",
    )?;

    Ok(())
}

pub(crate) fn uninstall_service() -> Result<()> {
    let service_manager =
        ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
    let service = service_manager.open_service(SERVICE_NAME, ServiceAccess::DELETE)?;
    service.delete()?;

    Ok(())
}

pub(crate) fn run_service(args: AgentArgs) -> Result<()> {
    CONFIG.set((args.log_dir.clone(), args.settings())).ok();
    windows_service::service_dispatcher::start(SERVICE_NAME, ffi_service_run).context(
        "windows_service::service_dispatcher failed. This isn't running in an interactive terminal, right?",
    )
}

// Generates `ffi_service_run` from `service_run`
windows_service::define_windows_service!(ffi_service_run, service_run);

fn service_run(_arguments: Vec<OsString>) {
    // The arguments the SCM passes here don't match the process args at
    // all; use the config stashed by `run_service`.
    let (log_dir, settings) = CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| (None, Settings::default()));

    let Ok(logging_handle) = super::setup_logging(log_dir) else {
        // Nowhere to report this; the SCM will see the service die.
        return;
    };
    if let Err(error) = fallible_service_run(settings, logging_handle) {
        tracing::error!("`fallible_service_run` returned an error: {error:#}");
    }
}

// Most of the Windows-specific service stuff goes through here. If the SCM
// stops us gracefully, this function may never return.
fn fallible_service_run(
    settings: Settings,
    logging_handle: proctor_logging::file::Handle,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    let event_handler = move |control_event| -> ServiceControlHandlerResult {
        tracing::debug!(?control_event);
        match control_event {
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            ServiceControl::Shutdown | ServiceControl::Stop => {
                if shutdown_tx.blocking_send(()).is_err() {
                    tracing::error!("Should be able to send shutdown signal");
                }
                ServiceControlHandlerResult::NoError
            }
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    };

    // Tell Windows that we're running
    let status_handle = service_control_handler::register(SERVICE_NAME, event_handler)?;
    status_handle.set_service_status(ServiceStatus {
        service_type: SERVICE_TYPE,
        current_state: ServiceState::Running,
        controls_accepted: ServiceControlAccept::SHUTDOWN | ServiceControlAccept::STOP,
        exit_code: ServiceExitCode::Win32(0),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    })?;

    // Nothing below works without privilege; refuse up front instead of
    // failing on the first netsh call mid-enter.
    let result = match proctor_bin_shared::platform::windows::is_elevated() {
        Ok(true) => rt.block_on(crate::run_agent(
            settings,
            Arc::new(WindowsPlatform),
            async move {
                shutdown_rx.recv().await;
            },
        )),
        Ok(false) => Err(anyhow::anyhow!(
            "The agent failed its elevation check; the service account lacks admin privilege"
        )),
        Err(error) => Err(error),
    };
    if let Err(error) = &result {
        tracing::error!("Agent failed: {error:#}");
    }

    // Drop the logging handle so it flushes the file before Windows kills
    // our process.
    std::mem::drop(logging_handle);

    // Tell Windows that we're stopping. Per the docs, Windows will reap the
    // process shortly after.
    status_handle
        .set_service_status(ServiceStatus {
            service_type: SERVICE_TYPE,
            current_state: ServiceState::Stopped,
            controls_accepted: ServiceControlAccept::empty(),
            exit_code: ServiceExitCode::Win32(u32::from(result.is_err())),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        })
        .context("Should be able to tell Windows we're stopping")?;

    Ok(())
}
