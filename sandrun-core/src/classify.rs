//! Result classifier (spec.md §4.7): derives a verdict tag from a finished
//! [`ResultRecord`], or from the sandbox's own failure when no record could
//! be produced at all.

use crate::error::{is_user_error, Error};
use crate::limits::SuccessCode;
use crate::result::ResultRecord;

/// The terminal verdict of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    IdlenessLimitExceeded,
    SecurityViolation,
    RuntimeError,
    /// The submitted program itself misbehaved in a way attributable to it
    /// rather than to the sandbox (spec.md §4.1, "UserError").
    Crash,
    /// The sandbox failed to do its job; not attributable to the child.
    Fail,
}

/// Classify a completed run per spec.md §4.7's first-matching-rule table.
pub fn classify(record: &ResultRecord) -> Verdict {
    let code = record.success_code;

    if code.intersects(SuccessCode::TIME_LIMIT_HIT | SuccessCode::USER_TIME_LIMIT_HIT) {
        Verdict::TimeLimitExceeded
    } else if code.contains(SuccessCode::MEMORY_LIMIT_HIT) {
        Verdict::MemoryLimitExceeded
    } else if code.contains(SuccessCode::IDLENESS_LIMIT_HIT) {
        Verdict::IdlenessLimitExceeded
    } else if code.contains(SuccessCode::PROCESS_LIMIT_HIT) {
        Verdict::SecurityViolation
    } else if record.exit_code != 0 && record.is_normal() {
        Verdict::RuntimeError
    } else {
        Verdict::Ok
    }
}

/// Classify a run that never produced a result record because something
/// failed before or during creation/monitoring. `UserError`s are
/// attributable to the submitted program and classify as `Crash`; anything
/// else is a sandbox failure and classifies as `Fail`.
pub fn classify_failure(err: &Error) -> Verdict {
    if is_user_error(err) {
        Verdict::Crash
    } else {
        Verdict::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    fn record_with(success_code: SuccessCode, exit_code: u32) -> ResultRecord {
        ResultRecord {
            success_code,
            exit_code,
            ..ResultRecord::default()
        }
    }

    #[test]
    fn time_limit_beats_everything_else() {
        let record = record_with(
            SuccessCode::TIME_LIMIT_HIT | SuccessCode::MEMORY_LIMIT_HIT,
            0,
        );
        assert_eq!(classify(&record), Verdict::TimeLimitExceeded);
    }

    #[test]
    fn user_time_limit_hit_also_maps_to_time_limit_exceeded() {
        let record = record_with(SuccessCode::USER_TIME_LIMIT_HIT, 0);
        assert_eq!(classify(&record), Verdict::TimeLimitExceeded);
    }

    #[test]
    fn memory_limit_without_time_limit() {
        let record = record_with(SuccessCode::MEMORY_LIMIT_HIT, 0);
        assert_eq!(classify(&record), Verdict::MemoryLimitExceeded);
    }

    #[test]
    fn idleness_limit_is_checked_after_time_and_memory() {
        let record = record_with(SuccessCode::IDLENESS_LIMIT_HIT, 0);
        assert_eq!(classify(&record), Verdict::IdlenessLimitExceeded);
    }

    #[test]
    fn process_limit_hit_is_a_security_violation() {
        let record = record_with(SuccessCode::PROCESS_LIMIT_HIT, 0);
        assert_eq!(classify(&record), Verdict::SecurityViolation);
    }

    #[test]
    fn nonzero_exit_with_normal_success_code_is_runtime_error() {
        let record = record_with(SuccessCode::NORMAL, 42);
        assert_eq!(classify(&record), Verdict::RuntimeError);
    }

    #[test]
    fn zero_exit_with_normal_success_code_is_ok() {
        let record = record_with(SuccessCode::NORMAL, 0);
        assert_eq!(classify(&record), Verdict::Ok);
    }

    #[test]
    fn killed_with_zero_exit_code_is_still_ok_by_this_table() {
        // KILLED alone matches none of rules 1-4, and rule 5 requires a
        // NORMAL success code, so this falls through to OK. The KILLED bit
        // itself is still visible to callers via `success_code`.
        let record = record_with(SuccessCode::KILLED, 0);
        assert_eq!(classify(&record), Verdict::Ok);
    }

    #[test]
    fn user_error_failure_classifies_as_crash() {
        let err = Error::from(ErrorKind::UserError("bad executable format".to_owned()));
        assert_eq!(classify_failure(&err), Verdict::Crash);
    }

    #[test]
    fn non_user_error_failure_classifies_as_fail() {
        let err = Error::from(ErrorKind::InternalFailure("cgroup mount missing".to_owned()));
        assert_eq!(classify_failure(&err), Verdict::Fail);
    }
}
