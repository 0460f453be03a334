//! Service binary for the lockdown agent.
//!
//! Exit code 0 is a clean stop; anything else is a fatal initialization
//! failure (the launcher surfaces those to the operator).

fn main() -> anyhow::Result<()> {
    proctor_agent::service::run()
}
