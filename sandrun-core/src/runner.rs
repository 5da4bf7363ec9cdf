//! Runner / bottom-half (spec.md §4.5): unfreezes a process, polls its
//! resource usage on a quantum, evaluates the running-state checks, forces
//! termination when a limit is hit, reaps, and finalizes the result record.

use std::time::{Duration, Instant};

use crate::creator;
use crate::error::{self, Result};
use crate::limits::{wall_time_ceiling, ResourceLimits, SuccessCode, IDLENESS_GRACE_PERIOD};
#[cfg(test)]
use crate::memory::MemorySize;
use crate::platform::{ExitObservation, Usage};
use crate::redirect::StdStream;
use crate::result::ResultRecord;
use crate::spec::SubprocessSpec;

/// Tracks the idleness heuristic across polling iterations: wall time
/// growing while user time stays flat, for longer than the grace period.
struct IdleTracker {
    last_user_time: Duration,
    idle_since: Option<Instant>,
}

impl IdleTracker {
    fn new() -> IdleTracker {
        IdleTracker {
            last_user_time: Duration::default(),
            idle_since: None,
        }
    }

    /// `true` once the process has looked idle for at least the grace
    /// period. A process "looks idle" when user time hasn't advanced since
    /// the previous poll.
    fn observe(&mut self, now: Instant, user_time: Duration) -> bool {
        if user_time > self.last_user_time {
            self.last_user_time = user_time;
            self.idle_since = None;
            return false;
        }

        let since = *self.idle_since.get_or_insert(now);
        now.duration_since(since) >= IDLENESS_GRACE_PERIOD
    }
}

/// Run `spec` to completion: create it FROZEN, resume it, monitor and
/// enforce limits, and return the finished [`ResultRecord`].
pub fn run(spec: &SubprocessSpec) -> Result<ResultRecord> {
    let frozen = creator::create_frozen(spec)?;
    let running = frozen.resume()?;
    let start = Instant::now();

    let mut success_code = SuccessCode::NORMAL;
    let mut last_usage = Usage::default();
    let mut idle_tracker = IdleTracker::new();

    let exit = loop {
        match running.poll_exit()? {
            ExitObservation::StillRunning => {
                std::thread::sleep(spec.time_quantum);

                let usage = running.poll_usage()?;
                last_usage = usage;
                let wall = start.elapsed();

                if let Some(violation) = check_running_state(&spec.limits, &usage, wall, &mut idle_tracker) {
                    success_code |= violation;
                    break None;
                }
            }
            other => break Some(other),
        }
    };

    if let Some(ExitObservation::StartupFailed) = exit {
        // The child never reached the user program; nothing to reap but the
        // pipes/cgroup. Join the drainers so their threads don't leak, then
        // report this as a run the submission itself caused (spec.md §4.1,
        // §8 scenario 6), not a normal signal death.
        let _ = running.reap();
        return Err(error::user_error("child process failed to start before exec"));
    }

    let (exit_code, kill_signal, stop_signal) = match exit {
        Some(ExitObservation::Exited { exit_code }) => (exit_code, None, None),
        Some(ExitObservation::KilledBySignal { signal }) => {
            success_code |= SuccessCode::KILLED_BY_OTHER;
            (0, Some(signal), None)
        }
        Some(ExitObservation::Stopped { signal }) => {
            success_code |= SuccessCode::STOPPED;
            running.terminate()?;
            (0, None, Some(signal))
        }
        Some(ExitObservation::StillRunning) | None => {
            // A limit was hit (or we observed "still running" one last
            // time racing the child's real exit); force termination.
            success_code |= SuccessCode::KILLED;
            running.terminate()?;
            (0, None, None)
        }
        Some(ExitObservation::StartupFailed) => unreachable!("handled above"),
    };

    // Finalization (spec.md §4.5): one last usage refresh from post-mortem
    // sources before `reap()` tears down the cgroup/job that usage is read
    // from. Covers the common fast-exit case where the process finished
    // before the first in-loop poll ever ran.
    if let Ok(usage) = running.poll_usage() {
        last_usage = usage;
    }

    let outputs = running.reap()?;

    apply_post_limit_checks(&spec.limits, &last_usage, &mut success_code);

    let mut output = None;
    let mut error = None;
    for (stream, bytes) in outputs {
        match stream {
            StdStream::Stdout => output = Some(bytes),
            StdStream::Stderr => error = Some(bytes),
            StdStream::Stdin => (),
        }
    }

    Ok(ResultRecord {
        wall_time: start.elapsed(),
        user_time: last_usage.user_time,
        kernel_time: last_usage.kernel_time,
        peak_memory: last_usage.peak_memory,
        total_processes: last_usage.total_processes,
        exit_code,
        success_code,
        output,
        error,
        kill_signal,
        stop_signal,
    })
}

/// Running-state checks (spec.md §4.5): evaluated every quantum while the
/// child is still alive. Returns the bit to set and break on, if any.
fn check_running_state(
    limits: &ResourceLimits,
    usage: &Usage,
    wall: Duration,
    idle_tracker: &mut IdleTracker,
) -> Option<SuccessCode> {
    if let Some(time_limit) = limits.time_limit {
        if usage.user_time > time_limit {
            return Some(SuccessCode::USER_TIME_LIMIT_HIT);
        }

        if wall > wall_time_ceiling(time_limit) {
            return Some(SuccessCode::TIME_LIMIT_HIT);
        }
    }

    if let Some(memory_limit) = limits.memory_limit {
        if usage.peak_memory > memory_limit {
            return Some(SuccessCode::MEMORY_LIMIT_HIT);
        }
    }

    if limits.process_limit.map_or(false, |cap| usage.total_processes > cap) {
        return Some(SuccessCode::PROCESS_LIMIT_HIT);
    }

    if limits.check_idleness && idle_tracker.observe(Instant::now(), usage.user_time) {
        return Some(SuccessCode::IDLENESS_LIMIT_HIT);
    }

    None
}

/// Post-limit checks (spec.md §4.5): make sure a limit that the OS itself
/// enforced (job-object/cgroup hard cap) is still reflected in
/// `success_code`, even when the runner's own quantum poll never caught it.
fn apply_post_limit_checks(limits: &ResourceLimits, usage: &Usage, success_code: &mut SuccessCode) {
    if let Some(memory_limit) = limits.memory_limit {
        if !memory_limit.is_zero() && usage.peak_memory >= memory_limit {
            *success_code |= SuccessCode::MEMORY_LIMIT_HIT;
        }
    }
    if let Some(time_limit) = limits.time_limit {
        if usage.user_time >= time_limit {
            *success_code |= SuccessCode::USER_TIME_LIMIT_HIT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage_with_user_time(user_time: Duration) -> Usage {
        Usage {
            user_time,
            kernel_time: Duration::default(),
            peak_memory: MemorySize::Bytes(0),
            total_processes: 1,
        }
    }

    #[test]
    fn idle_tracker_fires_only_after_grace_period_of_no_progress() {
        let mut tracker = IdleTracker::new();
        let t0 = Instant::now();
        assert!(!tracker.observe(t0, Duration::from_millis(100)));
        assert!(!tracker.observe(t0 + Duration::from_millis(500), Duration::from_millis(100)));
        assert!(tracker.observe(t0 + IDLENESS_GRACE_PERIOD + Duration::from_millis(1), Duration::from_millis(100)));
    }

    #[test]
    fn idle_tracker_resets_on_user_time_progress() {
        let mut tracker = IdleTracker::new();
        let t0 = Instant::now();
        tracker.observe(t0, Duration::from_millis(100));
        assert!(!tracker.observe(
            t0 + IDLENESS_GRACE_PERIOD + Duration::from_millis(1),
            Duration::from_millis(200)
        ));
    }

    #[test]
    fn user_time_over_limit_sets_user_time_bit() {
        let mut limits = ResourceLimits::default();
        limits.time_limit = Some(Duration::from_secs(1));
        let usage = usage_with_user_time(Duration::from_secs(2));
        let mut tracker = IdleTracker::new();
        assert_eq!(
            check_running_state(&limits, &usage, Duration::from_millis(10), &mut tracker),
            Some(SuccessCode::USER_TIME_LIMIT_HIT)
        );
    }

    #[test]
    fn wall_time_over_ceiling_sets_time_limit_bit() {
        let mut limits = ResourceLimits::default();
        limits.time_limit = Some(Duration::from_secs(1));
        let usage = usage_with_user_time(Duration::from_millis(10));
        let mut tracker = IdleTracker::new();
        assert_eq!(
            check_running_state(&limits, &usage, Duration::from_secs(120), &mut tracker),
            Some(SuccessCode::TIME_LIMIT_HIT)
        );
    }

    #[test]
    fn post_limit_check_sets_memory_bit_when_os_already_killed_it() {
        let mut limits = ResourceLimits::default();
        limits.memory_limit = Some(MemorySize::MegaBytes(64));
        let usage = Usage {
            peak_memory: MemorySize::MegaBytes(64),
            ..usage_with_user_time(Duration::default())
        };
        let mut code = SuccessCode::KILLED;
        apply_post_limit_checks(&limits, &usage, &mut code);
        assert!(code.contains(SuccessCode::MEMORY_LIMIT_HIT));
    }
}
