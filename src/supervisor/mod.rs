//! Process supervision: spawning, tracking, signalling, and reaping.
//!
//! A [`Supervisor`] owns the set of children it spawned. Every spawn
//! attaches a dedicated reaper, a blocking `waitpid` pushed onto the
//! runtime's blocking pool, that records the exit status exactly once,
//! delivers the handle's exit callback, and moves the pid into a graveyard
//! so late status queries still answer. Children are reaped whether or not
//! anyone calls [`ProcessHandle::wait`], so zombies never accumulate.
//!
//! There is deliberately no global manager singleton: create one
//! `Supervisor` at startup and hand references to the components that
//! spawn processes.
//!
//! ```no_run
//! use marionette::Supervisor;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let supervisor = Supervisor::new();
//! let mut handle = supervisor.command("echo hello").spawn()?;
//! let status = handle.wait().await?;
//! assert!(status.success());
//! # Ok(())
//! # }
//! ```

mod handle;
mod spawn;

pub use handle::{ExitCallback, ExitStatus, Lifecycle, LogSink, ProcessHandle};
pub use spawn::{SpawnBuilder, Transport};

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::result::ProcessError;
use handle::ProcShared;

/// Spawns and supervises child processes.
///
/// Cloning is cheap and shares the same registry, so a supervisor can be
/// handed to several components while remaining "one per process" in
/// effect.
#[derive(Clone, Default)]
pub struct Supervisor {
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    procs: Mutex<HashMap<u32, Arc<ProcShared>>>,
    graveyard: Mutex<HashMap<u32, ExitStatus>>,
}

impl Supervisor {
    /// Create an empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start configuring a spawn of `cmdline` (program plus
    /// whitespace-separated arguments).
    pub fn command(&self, cmdline: &str) -> SpawnBuilder<'_> {
        SpawnBuilder::new(self, cmdline)
    }

    /// Fork a coprocess: a copy of this process that runs `f` instead of
    /// exec'ing a program, its stdio connected to the returned handle and
    /// its exit status taken from `f`'s return value.
    ///
    /// The callable runs in the forked child, so it must not rely on
    /// threads or locks owned by the parent at fork time. Must be called
    /// from within a tokio runtime.
    pub fn spawn_callable<F>(&self, name: &str, f: F) -> Result<ProcessHandle, ProcessError>
    where
        F: FnOnce() -> i32,
    {
        spawn::spawn_coprocess(self, name, f)
    }

    /// Pids currently tracked (spawned, not yet reaped).
    pub fn pids(&self) -> Vec<u32> {
        self.registry.procs.lock().unwrap().keys().copied().collect()
    }

    /// Status of an already-reaped child, if any.
    pub fn reaped_status(&self, pid: u32) -> Option<ExitStatus> {
        self.registry.graveyard.lock().unwrap().get(&pid).copied()
    }

    /// Signal every tracked child. Delivery failures are logged, not
    /// propagated.
    pub fn kill_all(&self, signal: Signal) {
        let procs: Vec<Arc<ProcShared>> = self
            .registry
            .procs
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for proc in procs {
            if proc.status().is_some() {
                continue;
            }
            let pid = proc.pid();
            if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
                if e != Errno::ESRCH {
                    warn!(pid, errno = %e, "failed to signal child");
                }
            }
        }
    }

    /// Register a freshly spawned child and attach its reaper.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn adopt(
        &self,
        pid: u32,
        cmdline: String,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        stderr: Option<Box<dyn Read + Send>>,
        log: Option<LogSink>,
        pty: Option<portable_pty::PtyPair>,
    ) -> ProcessHandle {
        let shared = ProcShared::new(pid, cmdline);
        debug!(pid, cmdline = shared.cmdline(), "spawned child");
        self.registry
            .procs
            .lock()
            .unwrap()
            .insert(pid, Arc::clone(&shared));
        shared.mark_running();
        self.watch(Arc::clone(&shared));
        ProcessHandle::assemble(shared, reader, writer, stderr, log, pty)
    }

    fn watch(&self, shared: Arc<ProcShared>) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let pid = shared.pid();
            let outcome = tokio::task::spawn_blocking(move || reap_blocking(pid)).await;
            registry.procs.lock().unwrap().remove(&pid);
            match outcome {
                Ok(Ok(status)) => {
                    debug!(pid, %status, "reaped child");
                    registry.graveyard.lock().unwrap().insert(pid, status);
                    shared.record_exit(status);
                }
                Ok(Err(errno)) => warn!(pid, errno = %errno, "waitpid failed"),
                Err(join) => warn!(pid, error = %join, "reaper task failed"),
            }
        });
    }
}

/// Block until the child terminates, folding the wait status into the
/// shell-style encoding.
fn reap_blocking(pid: u32) -> Result<ExitStatus, Errno> {
    let pid = Pid::from_raw(pid as i32);
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ExitStatus::signaled(signal as i32))
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}
