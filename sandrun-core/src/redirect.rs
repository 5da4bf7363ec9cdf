//! Redirect plumbing (spec.md §4.2): converts a logical redirect spec into an
//! OS file handle plus the bookkeeping needed to close parent-owned handles
//! "after start" and to drain `Memory` redirects in the background.

use std::fs::File;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, ErrorKind, Result};

/// Which direction a file redirect opens in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

/// One logical redirect. A `None` slot in [`Redirects`] means "use the
/// sandbox's own default" (typically `/dev/null` equivalent on most engines,
/// but here simply "inherit" to match spec.md's description of the absent
/// case as equivalent to one of the four named variants).
pub enum RedirectSpec {
    /// Open `path` in the given mode and hand the resulting file to the child.
    File { path: std::path::PathBuf, mode: FileMode },

    /// Hand a pre-opened pipe end directly to the child. Used by
    /// [`crate::interconnect`] to wire two subprocesses together.
    Pipe(File),

    /// Capture the stream into an in-memory buffer drained by a background
    /// thread. Invalid for stdin (validated in [`crate::spec::ProcessBuilder`]).
    Memory,

    /// Inherit the sandbox's own standard stream.
    Inherit,
}

impl std::fmt::Debug for RedirectSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedirectSpec::File { path, mode } => {
                write!(f, "File {{ path: {:?}, mode: {:?} }}", path, mode)
            }
            RedirectSpec::Pipe(_) => write!(f, "Pipe(..)"),
            RedirectSpec::Memory => write!(f, "Memory"),
            RedirectSpec::Inherit => write!(f, "Inherit"),
        }
    }
}

/// The three standard stream redirect slots plus the stderr-to-stdout
/// collapse flag (spec.md §3).
#[derive(Default)]
pub struct Redirects {
    pub stdin: Option<RedirectSpec>,
    pub stdout: Option<RedirectSpec>,
    pub stderr: Option<RedirectSpec>,
    pub join_stderr_to_stdout: bool,
}

/// Which standard stream a redirect is being resolved for; `Memory` on
/// stdin is rejected regardless of caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

/// A background thread that copies a `Memory`-redirected stream into an
/// in-memory buffer. Joined by the runner during finalization (spec.md §4.5,
/// "Await all output drainers to quiesce").
pub struct Drainer {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer").finish_non_exhaustive()
    }
}

impl Drainer {
    fn spawn(mut source: File) -> Drainer {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let buffer_for_thread = buffer.clone();
        let handle = std::thread::spawn(move || {
            let mut chunk = [0u8; 64 * 1024];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        buffer_for_thread
                            .lock()
                            .expect("drainer buffer mutex poisoned")
                            .extend_from_slice(&chunk[..n]);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });

        Drainer {
            buffer,
            handle: Some(handle),
        }
    }

    /// Wait for the drainer thread to observe EOF and return the bytes it
    /// captured. The output/error buffers are frozen at this point, matching
    /// the REAPED invariant in spec.md §3.
    pub fn join(mut self) -> Vec<u8> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Arc::try_unwrap(self.buffer)
            .map(|m| m.into_inner().expect("drainer buffer mutex poisoned"))
            .unwrap_or_else(|arc| arc.lock().expect("drainer buffer mutex poisoned").clone())
    }
}

/// The outcome of resolving one logical redirect: the file to hand the
/// child (if any — `Inherit` uses the sandbox's own descriptor instead),
/// handles the parent must close once the child has started, and a drainer
/// thread for `Memory` redirects.
#[derive(Debug)]
pub struct Resolved {
    pub child_file: Option<File>,
    pub close_after_start: Vec<File>,
    pub drainer: Option<Drainer>,
}

/// Resolve one [`RedirectSpec`] slot for the given stream.
pub fn resolve(spec: &Option<RedirectSpec>, stream: StdStream) -> Result<Resolved> {
    match spec {
        None | Some(RedirectSpec::Inherit) => Ok(Resolved {
            child_file: None,
            close_after_start: Vec::new(),
            drainer: None,
        }),

        Some(RedirectSpec::File { path, mode }) => {
            let file = match mode {
                FileMode::Read => std::fs::OpenOptions::new().read(true).open(path),
                FileMode::Write => std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path),
            }
            .map_err(|e| {
                Error::from(ErrorKind::UserError(format!(
                    "cannot open redirect target \"{}\": {}",
                    path.display(),
                    e
                )))
            })?;

            Ok(Resolved {
                child_file: Some(file),
                close_after_start: Vec::new(),
                drainer: None,
            })
        }

        Some(RedirectSpec::Pipe(file)) => {
            let duplicated = file.try_clone()?;
            Ok(Resolved {
                child_file: Some(duplicated),
                close_after_start: Vec::new(),
                drainer: None,
            })
        }

        Some(RedirectSpec::Memory) => {
            if stream == StdStream::Stdin {
                return Err(Error::from(ErrorKind::ConfigurationError(
                    "Memory redirect is not valid for stdin".to_owned(),
                )));
            }

            let (read_end, write_end) = make_pipe()?;
            let drainer = Drainer::spawn(read_end);
            Ok(Resolved {
                child_file: Some(write_end),
                close_after_start: Vec::new(),
                drainer: Some(drainer),
            })
        }
    }
}

#[cfg(unix)]
pub(crate) fn make_pipe() -> Result<(File, File)> {
    use std::os::unix::io::FromRawFd;

    let (read_fd, write_fd) = nix::unistd::pipe().map_err(|e| {
        let errno = e.as_errno().map(|errno| errno as i32).unwrap_or(-1);
        crate::error::os_error("pipe", errno)
    })?;
    unsafe {
        Ok((File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)))
    }
}

#[cfg(windows)]
pub(crate) fn make_pipe() -> Result<(File, File)> {
    use std::os::windows::io::FromRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::System::Pipes::CreatePipe;

    unsafe {
        let mut read_handle: HANDLE = std::ptr::null_mut();
        let mut write_handle: HANDLE = std::ptr::null_mut();
        let ok = CreatePipe(&mut read_handle, &mut write_handle, std::ptr::null(), 0);
        if ok == 0 {
            return Err(crate::error::os_error(
                "CreatePipe",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            ));
        }
        Ok((
            File::from_raw_handle(read_handle as *mut _),
            File::from_raw_handle(write_handle as *mut _),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_redirect_on_stdin_is_rejected() {
        let err = resolve(&Some(RedirectSpec::Memory), StdStream::Stdin).unwrap_err();
        match err.kind() {
            ErrorKind::ConfigurationError(..) => (),
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn inherit_and_absent_resolve_to_no_child_file() {
        let resolved = resolve(&None, StdStream::Stdout).unwrap();
        assert!(resolved.child_file.is_none());
        assert!(resolved.drainer.is_none());

        let resolved = resolve(&Some(RedirectSpec::Inherit), StdStream::Stdout).unwrap();
        assert!(resolved.child_file.is_none());
    }

    #[test]
    fn memory_redirect_captures_bytes_written_to_child_end() {
        let resolved = resolve(&Some(RedirectSpec::Memory), StdStream::Stdout).unwrap();
        let mut child_file = resolved.child_file.expect("child file");
        child_file.write_all(b"hello").unwrap();
        drop(child_file);

        let captured = resolved.drainer.unwrap().join();
        assert_eq!(captured, b"hello");
    }
}
