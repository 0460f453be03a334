//! Named-pipe transport for the command protocol.
//!
//! Two pipes: `\\.\pipe\Proctor` carries the request, `\\.\pipe\Proctor_Response`
//! carries the verdict. The response pipe is only created after dispatch
//! returns, so a client that can connect to it knows its command has been
//! acted on. Each request gets fresh pipe instances.

use std::convert::Infallible;
use std::ffi::c_void;
use std::os::windows::io::AsRawHandle as _;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::windows::named_pipe;
use tokio_util::codec::{Framed, LinesCodec};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Security as WinSec;
use windows::Win32::System::Pipes::GetNamedPipeClientProcessId;

use super::{Command, Dispatch, Reply};
use crate::settings::{COMMAND_PIPE, RESPONSE_PIPE};

const RECREATE_BACKOFF: Duration = Duration::from_millis(500);

/// Longest line a well-formed client can send (`REFRESH\n` plus slack).
const MAX_LINE: usize = 64;

/// Serves the command protocol for the life of the process. Endpoint
/// failures are logged, the endpoint is recreated after a back-off, and the
/// loop continues.
pub async fn serve(dispatch: Dispatch) -> Infallible {
    let command_path = pipe_path(COMMAND_PIPE);
    let response_path = pipe_path(RESPONSE_PIPE);

    loop {
        if let Err(error) = serve_one(&dispatch, &command_path, &response_path).await {
            tracing::warn!("IPC endpoint failed: {error:#}; recreating");
            tokio::time::sleep(RECREATE_BACKOFF).await;
        }
    }
}

/// One request-response cycle: accept on the command pipe, read one line,
/// dispatch, then open the response pipe and deliver the verdict.
///
/// The paths are parameters so tests can run against throwaway pipes.
async fn serve_one(dispatch: &Dispatch, command_path: &str, response_path: &str) -> Result<()> {
    let server = bind_to_pipe(command_path).await?;
    server
        .connect()
        .await
        .context("Couldn't accept a connection on the command pipe")?;
    log_client_pid(&server);

    let mut lines = Framed::new(server, LinesCodec::new_with_max_length(MAX_LINE));
    let line = match lines.next().await {
        Some(Ok(line)) => line,
        Some(Err(error)) => return Err(error).context("Couldn't read the command line"),
        // Client connected and closed without writing; same as an empty command.
        None => String::new(),
    };
    drop(lines);

    let reply = match line.parse::<Command>() {
        Ok(command) => super::dispatch(dispatch, command).await,
        Err(error) => {
            tracing::warn!("{error}");
            Reply::Error
        }
    };

    let server = bind_to_pipe(response_path).await?;
    server
        .connect()
        .await
        .context("Couldn't accept a connection on the response pipe")?;
    let mut lines = Framed::new(server, LinesCodec::new());
    lines
        .send(reply.to_string())
        .await
        .context("Couldn't write the reply")?;

    Ok(())
}

/// Sends one command and waits for the verdict. This is the client side the
/// operator GUI links against; the smoke tests use it too.
pub async fn send_command(command: Command) -> Result<Reply> {
    send_command_at(command, &pipe_path(COMMAND_PIPE), &pipe_path(RESPONSE_PIPE)).await
}

async fn send_command_at(
    command: Command,
    command_path: &str,
    response_path: &str,
) -> Result<Reply> {
    let client = connect_with_retry(command_path).await?;
    let mut lines = Framed::new(client, LinesCodec::new());
    lines
        .send(command.to_string())
        .await
        .context("Couldn't write the command")?;
    drop(lines);

    // The response pipe only exists once dispatch has finished; poll for it.
    let client = connect_with_retry(response_path).await?;
    let mut lines = Framed::new(client, LinesCodec::new_with_max_length(MAX_LINE));
    let line = lines
        .next()
        .await
        .context("Response pipe closed without a verdict")?
        .context("Couldn't read the verdict")?;
    match line.as_str() {
        "OK" => Ok(Reply::Ok),
        "ERROR" => Ok(Reply::Error),
        other => bail!("Unexpected verdict `{other}`"),
    }
}

async fn connect_with_retry(path: &str) -> Result<named_pipe::NamedPipeClient> {
    // ENTER legitimately holds dispatch for tens of seconds before the
    // response pipe appears, hence the generous budget.
    const ATTEMPTS: usize = 300;

    for _ in 0..ATTEMPTS {
        match named_pipe::ClientOptions::new().open(path) {
            Ok(client) => return Ok(client),
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    bail!("Couldn't connect to `{path}` within {ATTEMPTS} attempts");
}

async fn bind_to_pipe(path: &str) -> Result<named_pipe::NamedPipeServer> {
    const NUM_ITERS: usize = 10;

    // If we just dropped the previous instance, Tokio may not have released
    // the pipe yet; yielding usually suffices, the loop catches the rest.
    tokio::task::yield_now().await;

    for i in 0..NUM_ITERS {
        match create_pipe_server(path) {
            Ok(server) => return Ok(server),
            Err(PipeError::AccessDenied) => {
                tracing::warn!(?path, "Named pipe busy, sleeping... (attempt {i})");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(PipeError::Other(error)) => return Err(error),
        }
    }
    bail!("Tried {NUM_ITERS} times to bind `{path}` and failed");
}

#[derive(Debug, thiserror::Error)]
enum PipeError {
    #[error("Access denied - is another process using this pipe path?")]
    AccessDenied,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn create_pipe_server(pipe_path: &str) -> Result<named_pipe::NamedPipeServer, PipeError> {
    let mut server_options = named_pipe::ServerOptions::new();
    server_options
        .first_pipe_instance(true)
        .pipe_mode(named_pipe::PipeMode::Message);

    // The agent runs as LocalSystem; a NULL DACL lets authenticated desktop
    // users connect to the pipe anyway.
    let mut sd = WinSec::SECURITY_DESCRIPTOR::default();
    let psd = WinSec::PSECURITY_DESCRIPTOR(&mut sd as *mut _ as *mut c_void);
    // SAFETY: We only pass pointers to our local vars to Win32, and Win32
    // doesn't save them anywhere.
    unsafe {
        WinSec::InitializeSecurityDescriptor(
            psd,
            windows::Win32::System::SystemServices::SECURITY_DESCRIPTOR_REVISION,
        )
        .context("InitializeSecurityDescriptor failed")
        .map_err(PipeError::Other)?;
        WinSec::SetSecurityDescriptorDacl(psd, true, None, false)
            .context("SetSecurityDescriptorDacl failed")
            .map_err(PipeError::Other)?;
    }

    let mut sa = WinSec::SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<WinSec::SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: psd.0,
        bInheritHandle: false.into(),
    };

    let sa_ptr = &mut sa as *mut _ as *mut c_void;
    // SAFETY: As above, Win32 reads the attributes during the call only.
    match unsafe { server_options.create_with_security_attributes_raw(pipe_path, sa_ptr) } {
        Ok(server) => Ok(server),
        Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(PipeError::AccessDenied)
        }
        Err(error) => Err(PipeError::Other(error.into())),
    }
}

fn log_client_pid(server: &named_pipe::NamedPipeServer) {
    let handle = HANDLE(server.as_raw_handle());
    let mut client_pid = 0u32;
    // SAFETY: The handle comes straight from Tokio and outlives the call.
    if unsafe { GetNamedPipeClientProcessId(handle, &mut client_pid) }.is_ok() {
        tracing::debug!(client_pid, "Accepted IPC connection");
    }
}

fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn pipe_paths() {
        assert_eq!(pipe_path(COMMAND_PIPE), r"\\.\pipe\Proctor");
        assert_eq!(pipe_path(RESPONSE_PIPE), r"\\.\pipe\Proctor_Response");
    }

    /// One full cycle against an echo coordinator.
    #[tokio::test]
    async fn smoke() {
        let _guard = proctor_logging::test("debug");
        // Unique names so tests can run in parallel.
        let command_path = pipe_path("ProctorTestSmoke");
        let response_path = pipe_path("ProctorTestSmoke_Response");
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(1);

        let coordinator = tokio::spawn(async move {
            let (command, reply_tx) = dispatch_rx.recv().await.expect("should get a command");
            assert_eq!(command, Command::Status);
            reply_tx.send(Reply::Ok).ok();
        });
        let server = {
            let (command_path, response_path) = (command_path.clone(), response_path.clone());
            tokio::spawn(async move {
                serve_one(&dispatch_tx, &command_path, &response_path)
                    .await
                    .expect("cycle should complete");
            })
        };

        let reply = send_command_at(Command::Status, &command_path, &response_path)
            .await
            .expect("should get a verdict");

        assert_eq!(reply, Reply::Ok);
        coordinator.await.expect("coordinator should finish");
        server.await.expect("server should finish");
    }

    /// An unknown command never reaches the coordinator and yields `ERROR`.
    #[tokio::test]
    async fn unknown_command_is_rejected_at_the_endpoint() {
        let _guard = proctor_logging::test("debug");
        let command_path = pipe_path("ProctorTestUnknown");
        let response_path = pipe_path("ProctorTestUnknown_Response");
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(1);

        let server = {
            let (command_path, response_path) = (command_path.clone(), response_path.clone());
            tokio::spawn(async move {
                serve_one(&dispatch_tx, &command_path, &response_path)
                    .await
                    .expect("cycle should complete");
            })
        };

        let client = connect_with_retry(&command_path)
            .await
            .expect("should connect");
        let mut lines = Framed::new(client, LinesCodec::new());
        lines.send("FOO").await.expect("should write");
        drop(lines);

        let client = connect_with_retry(&response_path)
            .await
            .expect("should connect");
        let mut lines = Framed::new(client, LinesCodec::new());
        let verdict = lines
            .next()
            .await
            .expect("should get a line")
            .expect("line should decode");

        assert_eq!(verdict, "ERROR");
        assert!(dispatch_rx.try_recv().is_err());
        server.await.expect("server should finish");
    }
}
