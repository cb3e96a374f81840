//! Error types for the supervision, expect, FSM, and reactor subsystems.

use std::os::fd::RawFd;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the process supervisor.
///
/// Spawn-time failures (program not found, fork/exec failure, PTY
/// allocation) are reported synchronously from the spawning call. Failures
/// of the child after a successful spawn are never reported here; they
/// surface only through the recorded [`ExitStatus`](crate::ExitStatus).
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be found on the search path.
    #[error("program not found on search path: {program}")]
    NotFound {
        /// Program name as given on the command line.
        program: String,
    },

    /// The command line was empty or the child could not be created.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// PTY allocation or manipulation failed.
    #[error("PTY error: {0}")]
    Pty(String),

    /// `wait()` was called again after the exit status was already
    /// collected. The status recorded by the first call is unaffected.
    #[error("process {pid} has already been reaped")]
    AlreadyReaped {
        /// Process id of the handle.
        pid: u32,
    },

    /// Signal delivery failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// Target process id.
        pid: u32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// The reaping path failed to collect an exit status.
    #[error("reaping failed: {0}")]
    Reap(String),

    /// I/O error on a process stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during expect operations.
///
/// A [`Timeout`](ExpectError::Timeout) is recoverable: the caller may retry
/// or abort the session. An [`UnexpectedEof`](ExpectError::UnexpectedEof)
/// means the process died mid-dialog and is reported distinctly so callers
/// can tell "program hung" from "program died". Both carry the output read
/// so far to aid diagnosis of protocol mismatches.
#[derive(Error, Debug)]
pub enum ExpectError {
    /// The deadline elapsed before any pattern matched.
    #[error("timed out waiting for pattern (after {duration:?})")]
    Timeout {
        /// How long was waited before giving up.
        duration: Duration,
        /// Everything read from the process up to the timeout.
        buffered: String,
    },

    /// End of stream before a pattern matched: the process exited or closed
    /// its output mid-dialog.
    #[error("end of stream before pattern matched")]
    UnexpectedEof {
        /// Everything read from the process before the stream ended.
        buffered: String,
    },

    /// An invalid pattern was supplied.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    /// The dialog engine had no transition for an observed input.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FsmError),

    /// The underlying process handle failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// I/O error on the process streams.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the FSM engine.
#[derive(Error, Debug)]
pub enum FsmError {
    /// No rule, including defaults, matched the input in the current
    /// state. The current state is left unchanged.
    #[error("no transition from state {state} on input {symbol:?}")]
    NoTransition {
        /// Debug rendering of the state the machine was in.
        state: String,
        /// The offending input symbol.
        symbol: String,
    },

    /// A transition action aborted the dialog.
    #[error("dialog aborted: {0}")]
    Aborted(String),
}

/// Errors raised by the I/O reactor.
#[derive(Error, Debug)]
pub enum ReactorError {
    /// A handler for this descriptor is already registered.
    #[error("descriptor {fd} is already registered")]
    AlreadyRegistered {
        /// The conflicting descriptor.
        fd: RawFd,
    },

    /// The descriptor has no registration.
    #[error("descriptor {fd} is not registered")]
    NotRegistered {
        /// The unknown descriptor.
        fd: RawFd,
    },

    /// Readiness polling failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to pattern construction.
#[derive(Error, Debug)]
pub enum PatternError {
    /// Invalid regular expression syntax.
    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// Invalid glob syntax.
    #[error("invalid glob: {0}")]
    InvalidGlob(String),

    /// Patterns must be non-empty.
    #[error("pattern cannot be empty")]
    Empty,
}
