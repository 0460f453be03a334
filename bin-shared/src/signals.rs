//! Process termination signals, wrapped so callers get the same shape on
//! every target.

use anyhow::Result;

#[cfg(windows)]
pub struct Terminate {
    sigint: tokio::signal::windows::CtrlC,
}

#[cfg(windows)]
impl Terminate {
    pub fn new() -> Result<Self> {
        let sigint = tokio::signal::windows::ctrl_c()?;

        Ok(Self { sigint })
    }

    /// Waits for Ctrl+C.
    pub async fn recv(&mut self) {
        self.sigint.recv().await;
    }
}

#[cfg(unix)]
pub struct Terminate {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Terminate {
    pub fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let sigint = signal(SignalKind::interrupt())?;
        let sigterm = signal(SignalKind::terminate())?;

        Ok(Self { sigint, sigterm })
    }

    /// Waits for SIGINT or SIGTERM.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {}
            _ = self.sigterm.recv() => {}
        }
    }
}
