//! The "command" slot of a subprocess spec (spec.md §3): either an explicit
//! executable path with optional argv, or a pre-joined command line string,
//! or both. At least one of the two must be present.

use crate::error::{Error, ErrorKind, Result};

/// What to launch and how to present it to `argv[0]`/the Windows command
/// line builder.
#[derive(Clone, Debug)]
pub enum Command {
    /// An explicit executable path, with an optional argv. When `args` is
    /// empty, argv is synthesized as `[path]`.
    Explicit {
        path: String,
        args: Vec<String>,
    },

    /// A pre-joined command line, parsed/split by the platform's own
    /// convention (`CreateProcessW`'s command-line parsing on Windows,
    /// whitespace-split on Linux).
    CommandLine(String),
}

impl Command {
    /// Build a `Command` from an explicit path, synthesizing argv as
    /// `[path]` when none was given (spec.md §3, "if only path is given,
    /// argv is synthesized").
    pub fn from_path<S: Into<String>>(path: S, args: Vec<String>) -> Command {
        Command::Explicit {
            path: path.into(),
            args,
        }
    }

    /// The effective argv for this command: for `Explicit`, `path` followed
    /// by `args` (or `[path]` alone if `args` is empty); for `CommandLine`,
    /// a naive whitespace split, good enough for validation purposes — the
    /// platform backend is responsible for the real parse.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Command::Explicit { path, args } => {
                let mut argv = Vec::with_capacity(1 + args.len());
                argv.push(path.clone());
                argv.extend(args.iter().cloned());
                argv
            }
            Command::CommandLine(line) => line.split_whitespace().map(str::to_owned).collect(),
        }
    }

    /// Validate this command per spec.md §4.3: the executable name must be
    /// non-empty, and no argv entry may contain an embedded NUL (which
    /// would truncate the C string the platform layer builds from it).
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::Explicit { path, .. } if path.is_empty() => Err(Error::from(
                ErrorKind::ConfigurationError("executable path must not be empty".to_owned()),
            )),
            Command::CommandLine(line) if line.trim().is_empty() => Err(Error::from(
                ErrorKind::ConfigurationError("command line must not be empty".to_owned()),
            )),
            _ => {
                for arg in self.argv() {
                    if arg.as_bytes().contains(&0) {
                        return Err(Error::from(ErrorKind::ConfigurationError(format!(
                            "argv entry \"{}\" contains an embedded NUL",
                            arg
                        ))));
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_is_synthesized_from_bare_path() {
        let cmd = Command::from_path("/usr/bin/true", Vec::new());
        assert_eq!(cmd.argv(), vec!["/usr/bin/true".to_owned()]);
    }

    #[test]
    fn argv_appends_explicit_args() {
        let cmd = Command::from_path("/bin/echo", vec!["hello".to_owned(), "world".to_owned()]);
        assert_eq!(
            cmd.argv(),
            vec!["/bin/echo".to_owned(), "hello".to_owned(), "world".to_owned()]
        );
    }

    #[test]
    fn empty_path_is_rejected() {
        let cmd = Command::from_path("", Vec::new());
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn embedded_nul_in_argv_is_rejected() {
        let cmd = Command::from_path("/bin/echo", vec!["bad\0arg".to_owned()]);
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn blank_command_line_is_rejected() {
        let cmd = Command::CommandLine("   ".to_owned());
        assert!(cmd.validate().is_err());
    }
}
