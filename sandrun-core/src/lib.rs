//! A sandboxed subprocess execution engine for judging contest submissions.
//!
//! Launches an untrusted program under CPU-time, wall-time, memory,
//! process-count, and UI-access limits; records its resource consumption
//! and exit disposition; and, through [`interconnect`], can run it wired to
//! a second "interactor" program over piped standard streams.
//!
//! The pipeline: a [`spec::ProcessBuilder`] validates into a
//! [`spec::SubprocessSpec`], [`creator::create_frozen`] creates it in the
//! FROZEN state, [`runner::run`] unfreezes, monitors and reaps it into a
//! [`result::ResultRecord`], and [`classify::classify`] derives a verdict.

#[macro_use]
extern crate error_chain;
extern crate libc;
#[cfg(unix)]
extern crate nix;

pub mod classify;
pub mod command;
pub mod creator;
pub mod env;
pub mod error;
pub mod identity;
pub mod interconnect;
pub mod limits;
pub mod memory;
pub mod platform;
pub mod process;
pub mod redirect;
pub mod result;
pub mod runner;
pub mod session;
pub mod spec;

pub use classify::{classify, classify_failure, Verdict};
pub use command::Command;
pub use error::{Error, ErrorKind, Result};
pub use identity::Identity;
pub use interconnect::{InterconnectOutcome, ProcessType};
pub use limits::{ResourceLimits, SuccessCode};
pub use memory::MemorySize;
pub use redirect::{FileMode, RedirectSpec};
pub use result::ResultRecord;
pub use session::EngineSession;
pub use spec::{Injection, ProcessBuilder, SubprocessSpec};
