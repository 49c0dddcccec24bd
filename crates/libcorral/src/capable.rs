// crates/libcorral/src/capable.rs

use anyhow::{Context, Result};
use caps::{CapSet, Capability};
use log::debug;

/// Raise the listed capabilities in the effective set and hand back a guard
/// that clears the effective set again when dropped.
///
/// The guard must stay alive for exactly the privileged syscalls it covers;
/// every exit path, including errors, runs the drop and returns the process
/// to its permitted-only state.
pub fn make_capable(wanted: &[Capability]) -> Result<CapGuard> {
    for &cap in wanted {
        caps::raise(None, CapSet::Effective, cap)
            .with_context(|| format!("cannot raise {cap} in the effective set"))?;
    }
    debug!("raised {wanted:?}");
    Ok(CapGuard { _private: () })
}

/// Drop every effective capability. Failing to shed privilege is fatal.
pub fn reset_capabilities() -> Result<()> {
    caps::clear(None, CapSet::Effective).context("cannot clear the effective capability set")
}

pub struct CapGuard {
    _private: (),
}

impl Drop for CapGuard {
    fn drop(&mut self) {
        // A process that cannot shed privilege must not keep running.
        if let Err(e) = reset_capabilities() {
            eprintln!("corral: {e:#}");
            std::process::exit(1);
        }
    }
}
