//! Spawn configuration and the pipe / PTY / coprocess launch paths.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::unistd::{access, AccessFlags};
use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};

use super::handle::LogSink;
use super::Supervisor;
use crate::result::ProcessError;
use crate::ProcessHandle;

const DEFAULT_PTY_ROWS: u16 = 24;
const DEFAULT_PTY_COLS: u16 = 80;

/// How the child's stdio is connected to the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain pipes. Stderr can be kept separate or merged onto stdout.
    Pipe,
    /// A pseudo-terminal; the child sees an interactive terminal. Stderr is
    /// inherently merged.
    Pty,
}

/// Fluent spawn configuration, created by
/// [`Supervisor::command`](crate::Supervisor::command).
///
/// Defaults: pipe transport, stderr merged onto stdout, inherited
/// environment, no working-directory change, no log sink, 24x80 PTY.
///
/// # Examples
///
/// ```no_run
/// use marionette::{Supervisor, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let supervisor = Supervisor::new();
/// let mut handle = supervisor
///     .command("ssh -T build-host uname -a")
///     .transport(Transport::Pty)
///     .env("LANG", "C")
///     .spawn()?;
/// let status = handle.wait().await?;
/// assert!(status.success());
/// # Ok(())
/// # }
/// ```
pub struct SpawnBuilder<'a> {
    supervisor: &'a Supervisor,
    cmdline: String,
    transport: Transport,
    merge_stderr: bool,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    log: Option<LogSink>,
    pty_size: (u16, u16),
}

impl<'a> SpawnBuilder<'a> {
    pub(crate) fn new(supervisor: &'a Supervisor, cmdline: &str) -> Self {
        Self {
            supervisor,
            cmdline: cmdline.to_string(),
            transport: Transport::Pipe,
            merge_stderr: true,
            env: Vec::new(),
            cwd: None,
            log: None,
            pty_size: (DEFAULT_PTY_ROWS, DEFAULT_PTY_COLS),
        }
    }

    /// Select pipe or PTY transport.
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Duplicate the child's stderr onto its output stream (default), or
    /// keep it as a separate channel. Ignored for PTY transport, which
    /// merges by nature.
    pub fn merge_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    /// Override one environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Working directory for the child.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Sink receiving a copy of every byte exchanged with the child.
    pub fn log(mut self, sink: LogSink) -> Self {
        self.log = Some(sink);
        self
    }

    /// Terminal dimensions for PTY transport.
    pub fn pty_size(mut self, rows: u16, cols: u16) -> Self {
        self.pty_size = (rows, cols);
        self
    }

    /// Resolve the program, create the transport, and launch the child.
    ///
    /// Must be called from within a tokio runtime: the supervisor attaches
    /// a reaper task to the new child.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the command line is empty, the program is not
    /// on the search path, or the transport/child cannot be created. A
    /// child that crashes later is reported only through its exit status.
    pub fn spawn(self) -> Result<ProcessHandle, ProcessError> {
        let argv: Vec<String> = self
            .cmdline
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        if argv.is_empty() {
            return Err(ProcessError::Spawn("empty command line".into()));
        }
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let program = which(argv_refs[0])?;

        match self.transport {
            Transport::Pipe => spawn_pipe(self, &program, &argv_refs),
            Transport::Pty => spawn_pty(self, &program, &argv_refs),
        }
    }
}

fn spawn_pipe(
    builder: SpawnBuilder<'_>,
    program: &Path,
    argv: &[&str],
) -> Result<ProcessHandle, ProcessError> {
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]).stdin(Stdio::piped());
    for (key, value) in &builder.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &builder.cwd {
        cmd.current_dir(dir);
    }

    // Merging duplicates one pipe's write end onto both stdout and stderr,
    // the parent reading from the single read end.
    let mut merged_read: Option<OwnedFd> = None;
    if builder.merge_stderr {
        let (read_end, write_end) =
            nix::unistd::pipe().map_err(|e| ProcessError::Spawn(format!("pipe: {e}")))?;
        let write_dup = write_end.try_clone()?;
        cmd.stdout(Stdio::from(write_end));
        cmd.stderr(Stdio::from(write_dup));
        merged_read = Some(read_end);
    } else {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ProcessError::NotFound {
            program: argv[0].to_string(),
        },
        _ => ProcessError::Spawn(e.to_string()),
    })?;
    let pid = child.id();

    let writer: Box<dyn Write + Send> = Box::new(
        child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::Spawn("child stdin unavailable".into()))?,
    );
    let reader: Box<dyn Read + Send> = match merged_read {
        Some(fd) => Box::new(File::from(fd)),
        None => Box::new(
            child
                .stdout
                .take()
                .ok_or_else(|| ProcessError::Spawn("child stdout unavailable".into()))?,
        ),
    };
    let stderr: Option<Box<dyn Read + Send>> = child
        .stderr
        .take()
        .map(|s| Box::new(s) as Box<dyn Read + Send>);

    // The supervisor reaps through waitpid; the std handle is only a fd
    // holder and is dropped here without waiting.
    drop(child);

    Ok(builder.supervisor.adopt(
        pid,
        builder.cmdline.clone(),
        reader,
        writer,
        stderr,
        builder.log.clone(),
        None,
    ))
}

fn spawn_pty(
    builder: SpawnBuilder<'_>,
    program: &Path,
    argv: &[&str],
) -> Result<ProcessHandle, ProcessError> {
    let pty_system = native_pty_system();
    let (rows, cols) = builder.pty_size;
    let pair: PtyPair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ProcessError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(program);
    for arg in &argv[1..] {
        cmd.arg(arg);
    }
    for (key, value) in &builder.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &builder.cwd {
        cmd.cwd(dir.as_os_str());
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ProcessError::Spawn(e.to_string()))?;
    let pid = child
        .process_id()
        .ok_or_else(|| ProcessError::Spawn("PTY child has no pid".into()))?;

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ProcessError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ProcessError::Pty(e.to_string()))?;

    // Reaped through waitpid like every other child.
    drop(child);

    Ok(builder.supervisor.adopt(
        pid,
        builder.cmdline.clone(),
        reader,
        writer,
        None,
        builder.log.clone(),
        Some(pair),
    ))
}

/// Fork-based coprocess launch: the child runs `f` with its stdio wired to
/// pipes and exits with the callable's return value.
pub(crate) fn spawn_coprocess<F>(
    supervisor: &Supervisor,
    name: &str,
    f: F,
) -> Result<ProcessHandle, ProcessError>
where
    F: FnOnce() -> i32,
{
    let (child_stdin, parent_writer) =
        nix::unistd::pipe().map_err(|e| ProcessError::Spawn(format!("pipe: {e}")))?;
    let (parent_reader, child_stdout) =
        nix::unistd::pipe().map_err(|e| ProcessError::Spawn(format!("pipe: {e}")))?;

    // SAFETY: the child branch only duplicates descriptors, runs the
    // callable, and _exits without returning into the runtime. Callers must
    // not rely on locks held by other threads at fork time.
    match unsafe { nix::unistd::fork() }.map_err(|e| ProcessError::Spawn(format!("fork: {e}")))? {
        nix::unistd::ForkResult::Child => {
            let code = coprocess_child(&child_stdin, &child_stdout, f);
            unsafe { nix::libc::_exit(code) }
        }
        nix::unistd::ForkResult::Parent { child } => {
            drop(child_stdin);
            drop(child_stdout);
            let reader: Box<dyn Read + Send> = Box::new(File::from(parent_reader));
            let writer: Box<dyn Write + Send> = Box::new(File::from(parent_writer));
            Ok(supervisor.adopt(
                child.as_raw() as u32,
                format!("<callable {name}>"),
                reader,
                writer,
                None,
                None,
                None,
            ))
        }
    }
}

fn coprocess_child<F: FnOnce() -> i32>(stdin: &OwnedFd, stdout: &OwnedFd, f: F) -> i32 {
    if nix::unistd::dup2(stdin.as_raw_fd(), 0).is_err() {
        return 127;
    }
    if nix::unistd::dup2(stdout.as_raw_fd(), 1).is_err() {
        return 127;
    }
    if nix::unistd::dup2(stdout.as_raw_fd(), 2).is_err() {
        return 127;
    }
    f()
}

/// Resolve a program name on `$PATH`, Bourne-shell style. Names containing
/// a slash are checked as given.
pub(crate) fn which(program: &str) -> Result<PathBuf, ProcessError> {
    let not_found = || ProcessError::NotFound {
        program: program.to_string(),
    };

    if program.contains('/') {
        let path = PathBuf::from(program);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(not_found())
        };
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(not_found())
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_sh() {
        let path = which("sh").unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn which_rejects_missing_program() {
        let err = which("no-such-program-zz9").unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
    }

    #[test]
    fn which_accepts_explicit_path() {
        assert!(which("/bin/sh").is_ok());
        assert!(which("/bin/definitely-missing").is_err());
    }
}
