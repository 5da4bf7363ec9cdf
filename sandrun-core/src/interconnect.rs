//! Interconnect (spec.md §4.6): wires a program and an interactor together
//! through two pipes, with optional tee-to-file on either direction, and
//! runs both concurrently.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;

use crate::error::Result;
use crate::redirect::{self, RedirectSpec};
use crate::result::ResultRecord;
use crate::runner;
use crate::spec::SubprocessSpec;

/// Which side of an interconnected pair a completion report came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessType {
    Program,
    Interactor,
}

pub struct Completion {
    pub process_type: ProcessType,
    pub result: Result<ResultRecord>,
}

/// The joined outcome of running a program/interactor pair to completion.
pub struct InterconnectOutcome {
    pub program: Result<ResultRecord>,
    pub interactor: Result<ResultRecord>,
}

/// Spawn a thread that copies `source` to `destination` a chunk at a time,
/// optionally mirroring every chunk to `record`. Bounded by the OS pipe's
/// own buffer (backpressure comes for free: a stalled reader blocks the
/// writer at the `write` syscall rather than growing an in-process queue).
fn spawn_tee(mut source: File, mut destination: File, mut record: Option<File>) {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if destination.write_all(&chunk[..n]).is_err() {
                        break;
                    }
                    if let Some(record) = record.as_mut() {
                        let _ = record.write_all(&chunk[..n]);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn open_record_file(path: &Option<PathBuf>) -> Result<Option<File>> {
    match path {
        None => Ok(None),
        Some(path) => Ok(Some(
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        )),
    }
}

/// Run `program` and `interactor` as an interconnected pair (spec.md §4.6).
pub fn run(
    mut program: SubprocessSpec,
    mut interactor: SubprocessSpec,
    record_input: Option<PathBuf>,
    record_output: Option<PathBuf>,
) -> Result<InterconnectOutcome> {
    // Pipe A carries interactor -> program; pipe B carries program -> interactor.
    let (a_read, a_write) = redirect::make_pipe()?;
    let (b_read, b_write) = redirect::make_pipe()?;

    let record_input_file = open_record_file(&record_input)?;
    let record_output_file = open_record_file(&record_output)?;

    let program_stdin = if let Some(record) = record_input_file {
        let (tee_read, tee_write) = redirect::make_pipe()?;
        spawn_tee(a_read, tee_write, Some(record));
        tee_read
    } else {
        a_read
    };

    let program_stdout = if let Some(record) = record_output_file {
        let (tee_read, tee_write) = redirect::make_pipe()?;
        spawn_tee(tee_read, b_write, Some(record));
        tee_write
    } else {
        b_write
    };

    program.redirects.stdin = Some(RedirectSpec::Pipe(program_stdin));
    program.redirects.stdout = Some(RedirectSpec::Pipe(program_stdout));
    interactor.redirects.stdin = Some(RedirectSpec::Pipe(b_read));
    interactor.redirects.stdout = Some(RedirectSpec::Pipe(a_write));

    let (tx, rx) = mpsc::channel();

    let program_tx = tx.clone();
    let program_handle = std::thread::spawn(move || {
        let result = runner::run(&program);
        let _ = program_tx.send(Completion {
            process_type: ProcessType::Program,
            result,
        });
    });

    let interactor_handle = std::thread::spawn(move || {
        let result = runner::run(&interactor);
        let _ = tx.send(Completion {
            process_type: ProcessType::Interactor,
            result,
        });
    });

    // Termination rule (spec.md §4.6): when one side exits, its output pipe
    // end closes and the other side observes EOF on its stdin, driving its
    // own runner to finalization independently. We simply wait for both
    // completion reports.
    let mut program_result = None;
    let mut interactor_result = None;
    for completion in rx.iter().take(2) {
        match completion.process_type {
            ProcessType::Program => program_result = Some(completion.result),
            ProcessType::Interactor => interactor_result = Some(completion.result),
        }
    }

    let _ = program_handle.join();
    let _ = interactor_handle.join();

    Ok(InterconnectOutcome {
        program: program_result.expect("program completion missing"),
        interactor: interactor_result.expect("interactor completion missing"),
    })
}
