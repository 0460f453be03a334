#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod known_dirs;
pub mod platform;
pub mod signals;
pub mod test_utils;

/// Identifier the agent uses for directories it owns on the host.
pub const BUNDLE_ID: &str = "dev.proctor.agent";
