//! Frozen creator (spec.md §4.4): the public entry point that atomically
//! creates a process in FROZEN state with every redirect bound and every
//! limit pre-installed.

use crate::error::Result;
use crate::process::FrozenProcess;
use crate::spec::SubprocessSpec;

/// Create `spec` as a process in the FROZEN state.
///
/// Postcondition (spec.md §4.4): the returned process has all redirects
/// bound, all limits applied via job object or cgroup, and any requested
/// DLLs injected; no instruction of the submitted program has executed yet.
pub fn create_frozen(spec: &SubprocessSpec) -> Result<FrozenProcess> {
    FrozenProcess::create(spec)
}
