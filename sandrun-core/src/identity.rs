//! The identity a subprocess should run under (spec.md §3, "identity").

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Login identity for the subprocess, platform-specific in shape.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Identity {
    /// Windows: a username and optional password for `CreateProcessWithLogonW`
    /// / `CreateProcessAsUserW`.
    Windows { username: String, password: Option<String> },

    /// Linux: the uid to drop privileges to before `execve`.
    Linux { uid: u32 },
}

impl Identity {
    /// `true` when this identity requires the Windows logon path.
    pub fn is_windows(&self) -> bool {
        matches!(self, Identity::Windows { .. })
    }
}
