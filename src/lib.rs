//! Marionette: process supervision and protocol-dialog automation.
//!
//! Marionette provides the substrate for driving interactive programs and
//! building text-protocol sessions: a process [`Supervisor`] that spawns
//! children over pipes or pseudo-terminals and reaps them asynchronously,
//! an [`Expect`] controller for pattern-driven interactive automation, a
//! deterministic [`Fsm`](fsm::Fsm) engine shared by parsers and protocol
//! dialogs, and a single-threaded [`Reactor`] that multiplexes many
//! [`ProtocolWorker`] sessions without one task per connection.
//!
//! # Features
//!
//! - **Supervised spawning**: pipe or PTY transport, stderr merging,
//!   environment overrides, log sinks, exit callbacks, zombie-free reaping
//! - **Expect automation**: exact / regex / glob patterns, deadline-bounded
//!   waits, login dialogs, diagnostics carrying everything read so far
//! - **FSM engine**: one transition table usable for both character-level
//!   parsing and token-level protocol stepping
//! - **Cooperative reactor**: readiness dispatch over non-blocking
//!   descriptors, with FSM-driven workers for client and server roles
//!
//! # Quick start
//!
//! ```rust,no_run
//! use marionette::{Expect, Pattern, Supervisor, Transport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = Supervisor::new();
//!
//!     // Spawn an interactive program on a PTY.
//!     let handle = supervisor
//!         .command("python3 -i")
//!         .transport(Transport::Pty)
//!         .spawn()?;
//!
//!     let mut session = Expect::new(handle);
//!     session.set_timeout(Duration::from_secs(30));
//!     session.set_prompt(Pattern::exact(">>> "));
//!
//!     session.wait_for_prompt().await?;
//!     session.send_line("print('Hello, World!')").await?;
//!     let result = session.wait_for_prompt().await?;
//!     println!("output: {}", result.before);
//!
//!     let status = session.into_handle().wait().await?;
//!     assert!(status.success());
//!     Ok(())
//! }
//! ```
//!
//! # Protocol dialogs
//!
//! Both the blocking-style [`Expect`] path and the event-driven
//! [`ProtocolWorker`] path drive the same FSM engine; the transition table
//! is the protocol definition:
//!
//! ```rust
//! use marionette::fsm::{action, Fsm};
//!
//! let mut fsm = Fsm::new(0);
//! fsm.add_exact("GREETINGS", 0, action(|_, r| Ok(r.emit_line("WELCOME"))), 1);
//! fsm.add_regex("^250 (.*)", 1, None, 2).unwrap();
//! fsm.set_default_transition(None, 0);
//! ```
//!
//! # Concurrency model
//!
//! [`Expect::expect`] and [`ProcessHandle::wait`] are the only suspension
//! points; everything the [`Reactor`] drives is non-blocking by contract.
//! The reactor, its handlers, and each FSM are single-threaded: workers
//! are owned by exactly one reactor and an FSM applies transitions in
//! strict input order.

#![warn(missing_docs)]

mod buffer;
mod expect;
pub mod fsm;
mod pattern;
mod reactor;
mod result;
mod supervisor;
mod worker;

// Public API exports
pub use expect::{Controller, Expect, LoginProfile};
pub use pattern::Pattern;
pub use reactor::{EventHandler, Flow, Interest, Reactor};
pub use result::{
    ExpectError, FsmError, MatchResult, PatternError, ProcessError, ReactorError,
};
pub use supervisor::{
    ExitCallback, ExitStatus, Lifecycle, LogSink, ProcessHandle, SpawnBuilder, Supervisor,
    Transport,
};
pub use worker::{ProtocolWorker, SessionMonitor, SessionPhase};

// Re-export the signal type used by kill so callers need not depend on nix.
pub use nix::sys::signal::Signal;
