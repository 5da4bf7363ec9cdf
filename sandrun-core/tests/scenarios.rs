//! End-to-end scenarios against real child processes. Linux-only: the
//! engine's Windows backend needs a Win32 host to exercise meaningfully, so
//! these are gated to the platform this sandbox actually runs its CI on.

#![cfg(unix)]

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use sandrun_core::classify::{classify, classify_failure, Verdict};
use sandrun_core::redirect::RedirectSpec;
use sandrun_core::{Command, ProcessBuilder, ResourceLimits};

fn run(builder: ProcessBuilder) -> sandrun_core::Result<sandrun_core::ResultRecord> {
    let spec = builder.build()?;
    sandrun_core::runner::run(&spec)
}

#[test]
fn echo_hello_with_no_limits() {
    let mut builder = ProcessBuilder::new("/bin/echo");
    builder.arg("hello");
    builder.stdout(RedirectSpec::Memory);

    let result = run(builder).expect("echo should run");
    assert_eq!(result.exit_code, 0);
    assert!(result.success_code.is_empty());
    assert_eq!(classify(&result), Verdict::Ok);
    assert_eq!(result.output.as_deref(), Some(b"hello\n".as_ref()));
    assert!(result.user_time < Duration::from_secs(1));
}

#[test]
fn busy_loop_hits_time_limit() {
    let mut builder = ProcessBuilder::new("/bin/sh");
    builder.args(vec!["-c".to_owned(), "while true; do :; done".to_owned()]);

    let mut limits = ResourceLimits::default();
    limits.time_limit = Some(Duration::from_millis(500));
    builder.limits(limits);
    builder.time_quantum(Duration::from_millis(200));

    let result = run(builder).expect("busy loop should be terminated, not error");
    assert_eq!(classify(&result), Verdict::TimeLimitExceeded);
    assert!(result.success_code.contains(sandrun_core::SuccessCode::KILLED));
}

#[test]
fn allocator_hits_memory_limit() {
    // Needs a real allocator; skip gracefully where python3 isn't installed
    // rather than fail the suite on environment shape.
    if !Path::new("/usr/bin/python3").exists() && !Path::new("/usr/local/bin/python3").exists() {
        return;
    }

    let mut builder = ProcessBuilder::new("/usr/bin/python3");
    builder.args(vec![
        "-c".to_owned(),
        "b = bytearray(128 * 1024 * 1024); import time; time.sleep(2)".to_owned(),
    ]);

    let mut limits = ResourceLimits::default();
    limits.memory_limit = Some(sandrun_core::MemorySize::MegaBytes(64));
    builder.limits(limits);
    builder.time_quantum(Duration::from_millis(50));

    let result = run(builder).expect("allocator should be terminated, not error");
    assert_eq!(classify(&result), Verdict::MemoryLimitExceeded);
}

#[test]
fn exit_code_propagates_to_runtime_error() {
    let mut builder = ProcessBuilder::new("/bin/sh");
    builder.args(vec!["-c".to_owned(), "exit 42".to_owned()]);

    let result = run(builder).expect("exit 42 should run");
    assert_eq!(result.exit_code, 42);
    assert!(result.success_code.is_empty());
    assert_eq!(classify(&result), Verdict::RuntimeError);
}

#[test]
fn memory_redirect_round_trips_bytes_exactly() {
    let mut builder = ProcessBuilder::new("/bin/printf");
    builder.args(vec!["%s".to_owned(), "no-newline-here".to_owned()]);
    builder.stdout(RedirectSpec::Memory);

    let result = run(builder).expect("printf should run");
    assert_eq!(result.output.as_deref(), Some(b"no-newline-here".as_ref()));
}

#[test]
fn nonexistent_executable_is_a_crash() {
    let builder = ProcessBuilder::new("/does/not/exist/at/all");
    let spec = builder.build().expect("path is non-empty, so this validates");
    let err = sandrun_core::runner::run(&spec).expect_err("spawn of a missing path must fail");
    assert_eq!(classify_failure(&err), Verdict::Crash);
}

#[test]
fn interactor_pair_exchanges_lines_and_records_them() {
    let record_dir = std::env::temp_dir().join(format!("sandrun-test-{}", std::process::id()));
    std::fs::create_dir_all(&record_dir).unwrap();
    let record_input = record_dir.join("input.log");
    let record_output = record_dir.join("output.log");

    // Program: read a line, print "pong".
    let mut program = ProcessBuilder::new("/bin/sh");
    program.args(vec!["-c".to_owned(), "read line; echo pong".to_owned()]);

    // Interactor: print "ping", read a line.
    let mut interactor = ProcessBuilder::new("/bin/sh");
    interactor.args(vec!["-c".to_owned(), "echo ping; read line".to_owned()]);

    let program_spec = program.build().unwrap();
    let interactor_spec = interactor.build().unwrap();

    let outcome = sandrun_core::interconnect::run(
        program_spec,
        interactor_spec,
        Some(record_input.clone()),
        Some(record_output.clone()),
    )
    .expect("interconnected pair should run");

    let program_result = outcome.program.expect("program should finish cleanly");
    let interactor_result = outcome.interactor.expect("interactor should finish cleanly");

    assert_eq!(classify(&program_result), Verdict::Ok);
    assert_eq!(classify(&interactor_result), Verdict::Ok);

    let mut recorded_input = String::new();
    std::fs::File::open(&record_input)
        .unwrap()
        .read_to_string(&mut recorded_input)
        .unwrap();
    assert_eq!(recorded_input, "ping\n");

    let mut recorded_output = String::new();
    std::fs::File::open(&record_output)
        .unwrap()
        .read_to_string(&mut recorded_output)
        .unwrap();
    assert_eq!(recorded_output, "pong\n");

    let _ = std::fs::remove_dir_all(&record_dir);
}

#[test]
fn command_line_variant_is_split_and_validated() {
    let builder = ProcessBuilder::from_command_line("/bin/echo from-command-line");
    let spec = builder.build().expect("non-blank command line validates");
    match &spec.command {
        Command::CommandLine(line) => assert_eq!(line, "/bin/echo from-command-line"),
        _ => panic!("expected CommandLine variant"),
    }
}
