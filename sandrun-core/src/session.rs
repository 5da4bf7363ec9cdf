//! `EngineSession` (spec.md §9 design notes): the handful of process-global
//! resources the platform backends share across every spawn — the fork
//! lock being the one that matters on every platform, a desktop handle on
//! Windows, a cgroup root on Linux.

use std::sync::{Mutex, OnceLock};

static FORK_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// The process-wide lock a backend must hold while forking/spawning and
/// closing "after start" handles (spec.md §4.4: "Acquire the fork lock ...
/// release fork lock"). A single unkeyed `Mutex` is sufficient: the fork
/// lock only needs to serialize *spawns*, not any other resource.
pub fn fork_lock() -> &'static Mutex<()> {
    FORK_LOCK.get_or_init(|| Mutex::new(()))
}

/// Holds whatever process-lifetime state a platform backend needs beyond
/// the fork lock: on Windows, the window-station/desktop pair created for
/// UI-restricted jobs; on Linux, the cgroup mount root. Exists so a caller
/// that runs many subprocesses in the same session can amortize that setup
/// instead of redoing it per spawn.
pub struct EngineSession {
    #[cfg(windows)]
    desktop: Option<crate::platform::windows::DesktopHandle>,
}

impl EngineSession {
    #[cfg(unix)]
    pub fn new() -> EngineSession {
        EngineSession {}
    }

    #[cfg(windows)]
    pub fn new() -> EngineSession {
        EngineSession { desktop: None }
    }

    #[cfg(windows)]
    pub fn desktop(&mut self) -> crate::error::Result<&crate::platform::windows::DesktopHandle> {
        if self.desktop.is_none() {
            self.desktop = Some(crate::platform::windows::DesktopHandle::create()?);
        }
        Ok(self.desktop.as_ref().unwrap())
    }
}

impl Default for EngineSession {
    fn default() -> EngineSession {
        EngineSession::new()
    }
}
