//! Error taxonomy for the sandboxed execution engine.
//!
//! Every layer annotates the error it propagates rather than swallowing it; a
//! [`ErrorKind::UserError`] anywhere in the chain is sticky and reclassifies the
//! terminal verdict of a run to `CRASH` (see [`crate::classify`]).

use std::fmt;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        /// A direct system call failure, not attributable to the submitted program.
        OsError(syscall: &'static str, errno: i32) {
            description("operating system call failed")
            display("syscall `{}` failed with errno {}", syscall, errno)
        }

        /// An OS-level failure attributable to the submitted program itself, e.g. a
        /// malformed executable or a missing redirect target. Sticky: once this
        /// variant appears anywhere in an error chain, the run's verdict is `CRASH`.
        UserError(cause: String) {
            description("submitted program caused the failure")
            display("user error: {}", cause)
        }

        /// The subprocess specification was invalid before any process was created.
        ConfigurationError(reason: String) {
            description("invalid subprocess configuration")
            display("invalid configuration: {}", reason)
        }

        /// An engine invariant was violated (e.g. job-object creation refused while
        /// `fail_on_job_creation_failure` is set). Surfaces as verdict `FAIL`.
        InternalFailure(reason: String) {
            description("internal sandbox failure")
            display("internal failure: {}", reason)
        }

        /// The daemon/monitor thread could not be joined.
        MonitorJoinFailed {
            description("failed to join monitor thread")
        }

        /// A DLL failed to load into the frozen process (Windows only).
        InjectionFailed(path: String) {
            description("DLL injection failed")
            display("failed to inject \"{}\"", path)
        }
    }
}

/// Returns `true` if `err` (or anything it wraps) is tagged [`ErrorKind::UserError`].
pub fn is_user_error(err: &Error) -> bool {
    let mut cur: &dyn std::error::Error = err;
    loop {
        if let Some(e) = cur.downcast_ref::<Error>() {
            if matches!(e.kind(), ErrorKind::UserError(..)) {
                return true;
            }
        }
        match std::error::Error::source(cur) {
            Some(next) => cur = next,
            None => return false,
        }
    }
}

/// Helper for wrapping a raw OS error code coming from a named syscall.
pub fn os_error(syscall: &'static str, errno: i32) -> Error {
    Error::from(ErrorKind::OsError(syscall, errno))
}

/// Helper for promoting an [`std::io::Error`] to a sticky [`ErrorKind::UserError`],
/// used whenever a failure is attributable to the submitted program rather than to
/// the sandbox itself (e.g. `ERROR_BAD_EXE_FORMAT`, `ENOENT` on the target executable).
pub fn user_error<T: fmt::Display>(cause: T) -> Error {
    Error::from(ErrorKind::UserError(cause.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_error_is_sticky_through_chain_err() {
        let base = user_error("bad exe format");
        let wrapped: Result<()> = Err(base).chain_err(|| "while spawning judgee");
        let err = wrapped.unwrap_err();
        assert!(is_user_error(&err));
    }

    #[test]
    fn os_error_is_not_user_error() {
        let err = os_error("execve", 2);
        assert!(!is_user_error(&err));
    }
}
