//! Subprocess builder (spec.md §4.3): accumulates the spec for one process to
//! launch and validates it into an immutable [`SubprocessSpec`] handed to the
//! [`crate::creator`].

use std::path::PathBuf;
use std::time::Duration;

use crate::command::Command;
use crate::error::{Error, ErrorKind, Result};
use crate::identity::Identity;
use crate::limits::ResourceLimits;
use crate::limits::DEFAULT_TIME_QUANTUM;
use crate::redirect::{RedirectSpec, Redirects};

/// A DLL to inject into the frozen process before resume (Windows only).
#[derive(Clone, Debug)]
pub struct Injection {
    pub dll_path: PathBuf,
}

/// The validated, immutable specification of one process to launch
/// (spec.md §3, "Subprocess spec"). Produced by [`ProcessBuilder::build`],
/// consumed by [`crate::creator::create_frozen`].
pub struct SubprocessSpec {
    pub command: Command,
    pub cwd: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    pub redirects: Redirects,
    pub limits: ResourceLimits,
    pub identity: Option<Identity>,
    pub injections: Vec<Injection>,
    pub time_quantum: Duration,
}

/// Accumulates a [`SubprocessSpec`] one field at a time, matching the rest
/// of the crate's "builder, then validate" shape.
pub struct ProcessBuilder {
    command: Command,
    cwd: Option<PathBuf>,
    env_entries: Vec<(String, String)>,
    redirects: Redirects,
    limits: ResourceLimits,
    identity: Option<Identity>,
    injections: Vec<Injection>,
    time_quantum: Duration,
}

impl ProcessBuilder {
    /// Start a builder for the given executable path, with no arguments yet.
    pub fn new<S: Into<String>>(path: S) -> ProcessBuilder {
        ProcessBuilder {
            command: Command::from_path(path, Vec::new()),
            cwd: None,
            env_entries: Vec::new(),
            redirects: Redirects::default(),
            limits: ResourceLimits::default(),
            identity: None,
            injections: Vec::new(),
            time_quantum: DEFAULT_TIME_QUANTUM,
        }
    }

    /// Start a builder from a pre-joined command line.
    pub fn from_command_line<S: Into<String>>(line: S) -> ProcessBuilder {
        ProcessBuilder {
            command: Command::CommandLine(line.into()),
            cwd: None,
            env_entries: Vec::new(),
            redirects: Redirects::default(),
            limits: ResourceLimits::default(),
            identity: None,
            injections: Vec::new(),
            time_quantum: DEFAULT_TIME_QUANTUM,
        }
    }

    pub fn arg<S: Into<String>>(&mut self, arg: S) -> &mut Self {
        if let Command::Explicit { args, .. } = &mut self.command {
            args.push(arg.into());
        }
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) -> &mut Self {
        self.env_entries.push((name.into(), value.into()));
        self
    }

    /// Copy every variable from the calling process's own environment.
    pub fn inherit_env(&mut self) -> &mut Self {
        for (name, value) in std::env::vars() {
            self.env_entries.push((name, value));
        }
        self
    }

    pub fn cwd<P: Into<PathBuf>>(&mut self, dir: P) -> &mut Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(&mut self, spec: RedirectSpec) -> &mut Self {
        self.redirects.stdin = Some(spec);
        self
    }

    pub fn stdout(&mut self, spec: RedirectSpec) -> &mut Self {
        self.redirects.stdout = Some(spec);
        self
    }

    pub fn stderr(&mut self, spec: RedirectSpec) -> &mut Self {
        self.redirects.stderr = Some(spec);
        self
    }

    pub fn join_stderr_to_stdout(&mut self, join: bool) -> &mut Self {
        self.redirects.join_stderr_to_stdout = join;
        self
    }

    pub fn limits(&mut self, limits: ResourceLimits) -> &mut Self {
        self.limits = limits;
        self
    }

    pub fn identity(&mut self, identity: Identity) -> &mut Self {
        self.identity = Some(identity);
        self
    }

    pub fn inject(&mut self, dll_path: PathBuf) -> &mut Self {
        self.injections.push(Injection { dll_path });
        self
    }

    pub fn time_quantum(&mut self, quantum: Duration) -> &mut Self {
        self.time_quantum = quantum;
        self
    }

    /// Validate the accumulated state and produce an immutable spec
    /// (spec.md §4.3). Mutually exclusive flags are resolved here: `no_job`
    /// together with any hard limit is allowed but logged as a warning,
    /// since `no_job` disables every job-enforced limit.
    pub fn build(self) -> Result<SubprocessSpec> {
        self.command.validate()?;

        if let Some(process_limit) = self.limits.process_limit {
            if process_limit == 0 {
                return Err(Error::from(ErrorKind::ConfigurationError(
                    "process_limit must be at least 1".to_owned(),
                )));
            }
        }

        if self.limits.no_job
            && (self.limits.hard_time_limit.is_some()
                || self.limits.hard_memory_limit.is_some()
                || self.limits.process_limit.is_some())
        {
            log::warn!(
                "no_job is set but a job-enforced hard limit was also configured; \
                 the hard limit will not be enforced"
            );
        }

        let environment = crate::env::merge(self.env_entries);

        Ok(SubprocessSpec {
            command: self.command,
            cwd: self.cwd,
            environment,
            redirects: self.redirects,
            limits: self.limits,
            identity: self.identity,
            injections: self.injections,
            time_quantum: self.time_quantum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_builder_produces_a_spec() {
        let spec = ProcessBuilder::new("/bin/echo").build().unwrap();
        assert_eq!(spec.command.argv(), vec!["/bin/echo".to_owned()]);
    }

    #[test]
    fn empty_path_fails_validation() {
        assert!(ProcessBuilder::new("").build().is_err());
    }

    #[test]
    fn zero_process_limit_is_rejected() {
        let mut limits = ResourceLimits::default();
        limits.process_limit = Some(0);
        let mut builder = ProcessBuilder::new("/bin/true");
        builder.limits(limits);
        assert!(builder.build().is_err());
    }

    #[test]
    fn env_entries_are_merged_case_insensitively() {
        let mut builder = ProcessBuilder::new("/bin/true");
        builder.env("PATH", "/usr/bin").env("path", "/bin");
        let spec = builder.build().unwrap();
        assert_eq!(spec.environment, vec![("PATH".to_owned(), "/bin".to_owned())]);
    }

    #[test]
    fn no_job_with_hard_limit_still_builds() {
        let mut limits = ResourceLimits::default();
        limits.no_job = true;
        limits.hard_memory_limit = Some(crate::memory::MemorySize::MegaBytes(256));
        let mut builder = ProcessBuilder::new("/bin/true");
        builder.limits(limits);
        assert!(builder.build().is_ok());
    }
}
