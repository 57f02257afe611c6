//! Process-wide environment state for the resolved toolchain.
//!
//! Lifecycle: resolve once, inject once, safe to repeat. Re-injecting the same
//! handle leaves `PATH` untouched; directories are appended only when absent.

use std::{
    env,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use tracing::{debug, warn};

use super::ToolchainHandle;

pub const DECODER_PATH_VAR: &str = "FFMPEG_PATH";
pub const PROBER_PATH_VAR: &str = "FFPROBE_PATH";

static INJECTED: Mutex<Option<ToolchainHandle>> = Mutex::new(None);

/// Append the toolchain directories to `PATH` and export the binary paths.
/// Returns true when the environment changed.
pub fn inject(handle: &ToolchainHandle) -> bool {
    let mut slot = INJECTED.lock().unwrap_or_else(PoisonError::into_inner);
    let mut changed = false;

    let current = env::var_os("PATH").unwrap_or_default();
    let mut entries: Vec<PathBuf> = if current.is_empty() {
        Vec::new()
    } else {
        env::split_paths(&current).collect()
    };
    let mut appended = false;
    for dir in handle.dirs() {
        if !entries.iter().any(|e| *e == dir) {
            entries.push(dir);
            appended = true;
        }
    }
    if appended {
        match env::join_paths(&entries) {
            Ok(joined) => {
                env::set_var("PATH", joined);
                changed = true;
            }
            Err(e) => warn!(error = %e, "toolchain directory cannot be added to PATH"),
        }
    }

    for (var, path) in [
        (DECODER_PATH_VAR, handle.decoder()),
        (PROBER_PATH_VAR, handle.prober()),
    ] {
        if env::var_os(var).as_deref() != Some(path.as_os_str()) {
            env::set_var(var, path);
            changed = true;
        }
    }

    debug!(changed, decoder = %handle.decoder().display(), "toolchain environment injected");
    *slot = Some(handle.clone());
    changed
}

/// The handle most recently injected into this process, if any.
pub fn injected() -> Option<ToolchainHandle> {
    INJECTED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
