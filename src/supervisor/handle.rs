//! Process handles: exclusive stream endpoints plus lifecycle state.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{watch, Mutex};
use tracing::trace;

use crate::result::ProcessError;

/// Callback invoked at most once with the final exit status.
pub type ExitCallback = Box<dyn FnOnce(u32, ExitStatus) + Send + 'static>;

/// Sink receiving a copy of every byte exchanged with the child.
pub type LogSink = Arc<StdMutex<dyn Write + Send>>;

/// Lifecycle of a supervised process. Transitions are monotonic: a handle
/// never moves backwards (no `Exited` → `Running`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// Child created, reaper not yet watching.
    Spawned,
    /// Reaper attached, child presumed live.
    Running,
    /// Child exited on its own.
    Exited,
    /// Child was terminated by a signal.
    Killed,
}

/// Final status of a child process, shell-style.
///
/// Zero means a normal exit, a positive value is the child's abnormal exit
/// code, and a negative value means the child was terminated by signal
/// `-code`. Only zero counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(i32);

impl ExitStatus {
    pub(crate) fn exited(code: i32) -> Self {
        ExitStatus(code)
    }

    pub(crate) fn signaled(signal: i32) -> Self {
        ExitStatus(-signal)
    }

    /// The encoded status value.
    pub fn code(&self) -> i32 {
        self.0
    }

    /// True only for a normal, zero exit.
    pub fn success(&self) -> bool {
        self.0 == 0
    }

    /// The terminating signal, if the child died from one.
    pub fn signal(&self) -> Option<i32> {
        if self.0 < 0 {
            Some(-self.0)
        } else {
            None
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal() {
            Some(sig) => write!(f, "terminated by signal {sig}"),
            None => write!(f, "exited with status {}", self.0),
        }
    }
}

/// State shared between a [`ProcessHandle`] and the supervisor's reaper.
pub(crate) struct ProcShared {
    pid: u32,
    cmdline: String,
    lifecycle: StdMutex<Lifecycle>,
    callback: StdMutex<CallbackSlot>,
    status_tx: watch::Sender<Option<ExitStatus>>,
}

struct CallbackSlot {
    cb: Option<ExitCallback>,
    delivered: bool,
}

impl ProcShared {
    pub(crate) fn new(pid: u32, cmdline: String) -> Arc<Self> {
        Arc::new(Self {
            pid,
            cmdline,
            lifecycle: StdMutex::new(Lifecycle::Spawned),
            callback: StdMutex::new(CallbackSlot {
                cb: None,
                delivered: false,
            }),
            status_tx: watch::channel(None).0,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub(crate) fn status(&self) -> Option<ExitStatus> {
        *self.status_tx.borrow()
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.status_tx.subscribe()
    }

    pub(crate) fn mark_running(&self) {
        self.advance(Lifecycle::Running);
    }

    fn advance(&self, next: Lifecycle) {
        let mut current = self.lifecycle.lock().unwrap();
        if *current < next {
            *current = next;
        }
    }

    /// Record the final status and deliver the callback. Called exactly
    /// once, from the reaping path.
    pub(crate) fn record_exit(&self, status: ExitStatus) {
        self.advance(if status.signal().is_some() {
            Lifecycle::Killed
        } else {
            Lifecycle::Exited
        });
        self.status_tx.send_replace(Some(status));
        let cb = {
            let mut slot = self.callback.lock().unwrap();
            slot.delivered = true;
            slot.cb.take()
        };
        if let Some(cb) = cb {
            cb(self.pid, status);
        }
    }

    pub(crate) fn install_callback(&self, cb: ExitCallback) {
        let mut slot = self.callback.lock().unwrap();
        if slot.delivered {
            drop(slot);
            if let Some(status) = self.status() {
                cb(self.pid, status);
            }
        } else {
            slot.cb = Some(cb);
        }
    }
}

/// A supervised child process with exclusively owned stream endpoints.
///
/// Handles are produced by [`Supervisor`](crate::Supervisor) spawn calls.
/// All stream I/O funnels through the handle (no other component touches
/// the descriptors), and every byte read or written is copied to the log
/// sink when one was configured at spawn time.
///
/// Dropping a handle does not kill the child; the supervisor keeps reaping
/// it so no zombie is left behind.
pub struct ProcessHandle {
    shared: Arc<ProcShared>,
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    stderr: Option<Arc<Mutex<Box<dyn Read + Send>>>>,
    log: Option<LogSink>,
    // Keeps the PTY master alive for the lifetime of the handle.
    _pty: Option<portable_pty::PtyPair>,
    waited: bool,
}

impl ProcessHandle {
    pub(crate) fn assemble(
        shared: Arc<ProcShared>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        stderr: Option<Box<dyn Read + Send>>,
        log: Option<LogSink>,
        pty: Option<portable_pty::PtyPair>,
    ) -> Self {
        Self {
            shared,
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            stderr: stderr.map(|r| Arc::new(Mutex::new(r))),
            log,
            _pty: pty,
            waited: false,
        }
    }

    /// Process id of the child.
    pub fn pid(&self) -> u32 {
        self.shared.pid()
    }

    /// The command line the child was spawned from.
    pub fn command_line(&self) -> &str {
        self.shared.cmdline()
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// The recorded exit status, if the child has been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.shared.status()
    }

    /// Whether the child has not yet been reaped.
    pub fn is_alive(&self) -> bool {
        self.shared.status().is_none()
    }

    /// Whether a separate stderr channel exists (pipe transport without
    /// stderr merging).
    pub fn has_stderr(&self) -> bool {
        self.stderr.is_some()
    }

    /// Read from the child's output stream.
    ///
    /// Returns `Ok(0)` at end of stream. A PTY that reports `EIO` after
    /// the child went away is treated as end of stream as well.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None).await
    }

    /// Read from the child's output stream, giving up after `timeout`.
    ///
    /// On expiry the error kind is [`io::ErrorKind::TimedOut`]. Expiry does
    /// not consume data: whatever the child writes later is picked up by
    /// the next read.
    pub async fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let reader = Arc::clone(&self.reader);
        let wanted = buf.len();
        let read_task = tokio::task::spawn_blocking(move || {
            let mut reader = reader.blocking_lock();
            let mut chunk = vec![0u8; wanted];
            reader.read(&mut chunk).map(|n| {
                chunk.truncate(n);
                chunk
            })
        });

        let joined = match timeout {
            Some(limit) => tokio::time::timeout(limit, read_task)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
            None => read_task.await,
        };

        let chunk = match joined.map_err(io::Error::other)? {
            Ok(chunk) => chunk,
            Err(e) if is_pty_hangup(&e) => Vec::new(),
            Err(e) => return Err(e),
        };
        buf[..chunk.len()].copy_from_slice(&chunk);
        self.log_bytes(&chunk);
        Ok(chunk.len())
    }

    /// Read from the child's separate stderr channel. Returns `Ok(0)` when
    /// no such channel exists (PTY transport, or stderr merged).
    pub async fn read_err(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stderr) = self.stderr.as_ref() else {
            return Ok(0);
        };
        let reader = Arc::clone(stderr);
        let wanted = buf.len();
        let chunk = tokio::task::spawn_blocking(move || {
            let mut reader = reader.blocking_lock();
            let mut chunk = vec![0u8; wanted];
            reader.read(&mut chunk).map(|n| {
                chunk.truncate(n);
                chunk
            })
        })
        .await
        .map_err(io::Error::other)??;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Write to the child's input stream and flush.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = Arc::clone(&self.writer);
        let owned = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.blocking_lock();
            writer.write_all(&owned)?;
            writer.flush()
        })
        .await
        .map_err(io::Error::other)??;
        self.log_bytes(data);
        Ok(())
    }

    /// Close the child's input stream, signalling end of input. Further
    /// writes are silently discarded.
    pub async fn close_stdin(&mut self) -> io::Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.blocking_lock();
            // Dropping the previous endpoint closes the descriptor.
            *writer = Box::new(io::sink());
        })
        .await
        .map_err(io::Error::other)
    }

    /// Wait for the child to exit and return its status.
    ///
    /// # Errors
    ///
    /// A second call fails with [`ProcessError::AlreadyReaped`]; the status
    /// recorded by the first call is never altered.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        if self.waited {
            return Err(ProcessError::AlreadyReaped {
                pid: self.shared.pid(),
            });
        }
        let mut rx = self.shared.subscribe();
        let status = match rx.wait_for(|s| s.is_some()).await {
            Ok(guard) => match *guard {
                Some(status) => status,
                None => return Err(ProcessError::Reap("empty status after wait".into())),
            },
            Err(_) => return Err(ProcessError::Reap("status channel closed".into())),
        };
        self.waited = true;
        Ok(status)
    }

    /// Send a signal to the child. A no-op once the child has exited.
    pub fn kill(&self, signal: Signal) -> Result<(), ProcessError> {
        if self.shared.status().is_some() {
            return Ok(());
        }
        let pid = self.shared.pid();
        trace!(pid, ?signal, "delivering signal");
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(()),
            // The child beat us to the exit; the reaper will record it.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    /// Send SIGTERM.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        self.kill(Signal::SIGTERM)
    }

    /// Send SIGINT.
    pub fn interrupt(&self) -> Result<(), ProcessError> {
        self.kill(Signal::SIGINT)
    }

    /// Register a callback invoked with `(pid, status)` when the child
    /// exits. Invoked at most once; if the child already exited it runs
    /// immediately on the calling thread.
    pub fn set_exit_callback(&self, cb: impl FnOnce(u32, ExitStatus) + Send + 'static) {
        self.shared.install_callback(Box::new(cb));
    }

    fn log_bytes(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(log) = self.log.as_ref() {
            let _ = log.lock().unwrap().write_all(bytes);
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.shared.pid())
            .field("cmdline", &self.shared.cmdline())
            .field("lifecycle", &self.shared.lifecycle())
            .finish()
    }
}

fn is_pty_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_encoding() {
        assert!(ExitStatus::exited(0).success());
        assert!(!ExitStatus::exited(2).success());
        assert_eq!(ExitStatus::signaled(15).code(), -15);
        assert_eq!(ExitStatus::signaled(15).signal(), Some(15));
        assert_eq!(ExitStatus::exited(2).signal(), None);
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let shared = ProcShared::new(1, "true".into());
        shared.mark_running();
        shared.record_exit(ExitStatus::exited(0));
        shared.mark_running();
        assert_eq!(shared.lifecycle(), Lifecycle::Exited);
    }

    #[test]
    fn late_callback_fires_immediately() {
        let shared = ProcShared::new(1, "true".into());
        shared.record_exit(ExitStatus::exited(3));
        let seen = std::sync::Arc::new(StdMutex::new(None));
        let sink = seen.clone();
        shared.install_callback(Box::new(move |pid, status| {
            *sink.lock().unwrap() = Some((pid, status.code()));
        }));
        assert_eq!(*seen.lock().unwrap(), Some((1, 3)));
    }
}
