//! Well-known directories for service artifacts.
//!
//! Uses `known_folders`, which asks Windows instead of trusting environment
//! variables; the agent runs as LocalSystem where `%APPDATA%`-style shortcuts
//! point at surprising places.

pub use imp::service_logs;

#[cfg(windows)]
mod imp {
    use known_folders::{get_known_folder_path, KnownFolder};
    use std::path::PathBuf;

    /// e.g. `C:\ProgramData\dev.proctor.agent\logs`
    pub fn service_logs() -> Option<PathBuf> {
        Some(
            get_known_folder_path(KnownFolder::ProgramData)?
                .join(crate::BUNDLE_ID)
                .join("logs"),
        )
    }
}

#[cfg(not(windows))]
mod imp {
    use std::path::PathBuf;

    /// The agent only ships on Windows; debug builds elsewhere log to stdout.
    pub fn service_logs() -> Option<PathBuf> {
        None
    }
}
