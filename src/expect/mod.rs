//! Expect-style automation: drive an interactive process by waiting for
//! output patterns before sending the next input.
//!
//! [`Expect`] wraps a [`ProcessHandle`] and applies patterns to the
//! accumulated output. `expect` suspends the calling task until a pattern
//! matches or the deadline passes; the deadline is re-checked against a
//! monotonic clock on every read iteration, so a match found first always
//! wins and nothing matches after expiry. Timeout and process-death are
//! reported as distinct errors, both carrying the output read so far.

use std::fmt::Debug;
use std::hash::Hash;
use std::io;
use std::slice;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::trace;

use crate::buffer::DialogBuffer;
use crate::fsm::Fsm;
use crate::pattern::{Finder, Pattern};
use crate::result::{ExpectError, MatchResult};
use crate::supervisor::ProcessHandle;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BUFFER_LIMIT: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

/// Prompt patterns used by [`Expect::login`].
///
/// Protocol variants (a telnet login, a serial console, an ssh password
/// prompt) are captured as data rather than subclasses: build a profile
/// with the right patterns and install it with
/// [`Expect::set_login_profile`].
#[derive(Debug, Clone)]
pub struct LoginProfile {
    /// Pattern announcing the username prompt.
    pub username_prompt: Pattern,
    /// Pattern announcing the password prompt.
    pub password_prompt: Pattern,
}

impl Default for LoginProfile {
    fn default() -> Self {
        Self {
            username_prompt: Pattern::Regex(
                regex::Regex::new(r"(?i)(login|username): ?").expect("static regex"),
            ),
            password_prompt: Pattern::Regex(
                regex::Regex::new(r"(?i)password: ?").expect("static regex"),
            ),
        }
    }
}

/// Capability interface for protocol-specific interactive controllers.
///
/// Implementations wrap an [`Expect`] session plus whatever constants the
/// protocol needs (prompt, escape sequence). [`Expect`] itself implements
/// the trait with shell-style behavior.
#[async_trait(?Send)]
pub trait Controller {
    /// Send a command line and return the output up to the next prompt.
    async fn command(&mut self, cmd: &str) -> Result<String, ExpectError>;

    /// Authenticate against a login/password dialog.
    async fn login(&mut self, user: &str, password: &str) -> Result<(), ExpectError>;

    /// Send the session's break/interrupt sequence.
    async fn send_break(&mut self) -> Result<(), ExpectError>;
}

/// Synchronous-style dialog automation over a supervised process.
///
/// # Examples
///
/// ```no_run
/// use marionette::{Expect, Pattern, Supervisor, Transport};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let supervisor = Supervisor::new();
/// let handle = supervisor
///     .command("python3 -i")
///     .transport(Transport::Pty)
///     .spawn()?;
///
/// let mut session = Expect::new(handle);
/// session.set_timeout(Duration::from_secs(10));
/// session.set_prompt(Pattern::exact(">>> "));
///
/// session.wait_for_prompt().await?;
/// session.send_line("6 * 7").await?;
/// let result = session.wait_for_prompt().await?;
/// assert!(result.before.contains("42"));
/// # Ok(())
/// # }
/// ```
pub struct Expect {
    proc: ProcessHandle,
    buffer: DialogBuffer,
    prompt: Pattern,
    profile: LoginProfile,
    timeout: Option<Duration>,
    eof: bool,
}

impl Expect {
    /// Wrap a process handle with the default prompt (`"$ "`), a 30 second
    /// timeout, and the default login profile.
    pub fn new(proc: ProcessHandle) -> Self {
        Self {
            proc,
            buffer: DialogBuffer::new(DEFAULT_BUFFER_LIMIT),
            prompt: Pattern::exact("$ "),
            profile: LoginProfile::default(),
            timeout: Some(DEFAULT_TIMEOUT),
            eof: false,
        }
    }

    /// Set the prompt pattern used by [`wait_for_prompt`](Self::wait_for_prompt)
    /// and [`run_dialog`](Self::run_dialog).
    pub fn set_prompt(&mut self, prompt: Pattern) {
        self.prompt = prompt;
    }

    /// Set the default expect deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Wait indefinitely by default.
    pub fn no_timeout(&mut self) {
        self.timeout = None;
    }

    /// Install the login dialog profile.
    pub fn set_login_profile(&mut self, profile: LoginProfile) {
        self.profile = profile;
    }

    /// The wrapped process handle.
    pub fn handle(&self) -> &ProcessHandle {
        &self.proc
    }

    /// Mutable access to the wrapped process handle.
    pub fn handle_mut(&mut self) -> &mut ProcessHandle {
        &mut self.proc
    }

    /// Give the process handle back, dropping the session buffer.
    pub fn into_handle(self) -> ProcessHandle {
        self.proc
    }

    /// Write raw bytes to the process's input stream.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ExpectError> {
        self.proc.write_all(data).await?;
        Ok(())
    }

    /// Write a line (newline appended).
    pub async fn send_line(&mut self, line: &str) -> Result<(), ExpectError> {
        self.send(line.as_bytes()).await?;
        self.send(b"\n").await
    }

    /// Write one byte at a time with a pause between each, for programs
    /// that drop input arriving faster than a human types.
    pub async fn send_slow(&mut self, data: &[u8], pace: Duration) -> Result<(), ExpectError> {
        for byte in data {
            self.send(slice::from_ref(byte)).await?;
            tokio::time::sleep(pace).await;
        }
        Ok(())
    }

    /// Wait until `pattern` appears in the output, using the default
    /// deadline.
    pub async fn expect(&mut self, pattern: &Pattern) -> Result<MatchResult, ExpectError> {
        self.expect_deadline(slice::from_ref(pattern), self.timeout)
            .await
    }

    /// Wait until `pattern` appears, with an explicit deadline.
    pub async fn expect_timeout(
        &mut self,
        pattern: &Pattern,
        timeout: Duration,
    ) -> Result<MatchResult, ExpectError> {
        self.expect_deadline(slice::from_ref(pattern), Some(timeout))
            .await
    }

    /// Wait until any of `patterns` matches; the result's `pattern_index`
    /// names the winner. [`Pattern::Eof`] and [`Pattern::Timeout`] entries
    /// convert those conditions into matches instead of errors.
    pub async fn expect_any(&mut self, patterns: &[Pattern]) -> Result<MatchResult, ExpectError> {
        self.expect_deadline(patterns, self.timeout).await
    }

    /// Read until `pattern` matches and return the output ahead of the
    /// match.
    pub async fn read_until(&mut self, pattern: &Pattern) -> Result<String, ExpectError> {
        Ok(self.expect(pattern).await?.before)
    }

    /// Read until the configured prompt appears at the stream position.
    pub async fn wait_for_prompt(&mut self) -> Result<MatchResult, ExpectError> {
        let prompt = self.prompt.clone();
        self.expect(&prompt).await
    }

    /// Drive a login dialog: wait for the username prompt, send `user`,
    /// wait for the password prompt, send `password`, then wait for the
    /// shell prompt.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), ExpectError> {
        let profile = self.profile.clone();
        self.expect(&profile.username_prompt).await?;
        self.send_line(user).await?;
        self.expect(&profile.password_prompt).await?;
        self.send_line(password).await?;
        self.wait_for_prompt().await?;
        Ok(())
    }

    /// Drive `fsm` with prompt-delimited chunks until it reaches
    /// `terminal`: pending output from the machine's outbox is written
    /// first (seed it through [`Fsm::registers_mut`] to open the
    /// conversation), then each chunk read up to the prompt is fed as one
    /// token. Empty chunks (the bare first prompt) are skipped. The
    /// machine is not reset here; the caller owns reuse between dialogs.
    ///
    /// # Errors
    ///
    /// A missing transition surfaces as [`ExpectError::Protocol`]; the
    /// process dying mid-dialog as [`ExpectError::UnexpectedEof`].
    pub async fn run_dialog<S>(&mut self, fsm: &mut Fsm<S>, terminal: S) -> Result<(), ExpectError>
    where
        S: Copy + Eq + Hash + Debug,
    {
        loop {
            for out in fsm.take_output() {
                self.send(&out).await?;
            }
            if fsm.state() == terminal {
                return Ok(());
            }
            let chunk = self.wait_for_prompt().await?.before;
            let token = chunk.trim();
            if !token.is_empty() {
                fsm.process(token)?;
            }
        }
    }

    async fn expect_deadline(
        &mut self,
        patterns: &[Pattern],
        timeout: Option<Duration>,
    ) -> Result<MatchResult, ExpectError> {
        let mut finders: Vec<(usize, Box<dyn Finder>)> = Vec::new();
        let mut eof_index = None;
        let mut timeout_index = None;
        for (index, pattern) in patterns.iter().enumerate() {
            match pattern {
                Pattern::Eof => eof_index = Some(index),
                Pattern::Timeout => timeout_index = Some(index),
                other => {
                    if let Some(finder) = other.compile()? {
                        finders.push((index, finder));
                    }
                }
            }
        }

        let started = Instant::now();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            // Compaction may shift buffer offsets between iterations, so the
            // origin of this wait is re-read from the consumed mark (it only
            // advances when a match returns).
            let origin = self.buffer.consumed();
            for (index, finder) in &finders {
                if let Some(found) = finder.find(self.buffer.pending()) {
                    let start = origin + found.start;
                    let end = origin + found.end;
                    let matched =
                        String::from_utf8_lossy(&self.buffer.bytes()[start..end]).into_owned();
                    let before =
                        String::from_utf8_lossy(&self.buffer.bytes()[origin..start]).into_owned();
                    self.buffer.consume_to(end);
                    trace!(pattern_index = *index, start, end, "expect matched");
                    return Ok(MatchResult {
                        pattern_index: *index,
                        matched,
                        start,
                        end,
                        before,
                        captures: found.captures,
                    });
                }
            }

            if self.eof {
                if let Some(index) = eof_index {
                    return Ok(self.end_of_stream_match(index));
                }
                return Err(ExpectError::UnexpectedEof {
                    buffered: self.buffer.snapshot(),
                });
            }

            let remaining = match timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        if let Some(index) = timeout_index {
                            return Ok(self.end_of_stream_match(index));
                        }
                        return Err(ExpectError::Timeout {
                            duration: limit,
                            buffered: self.buffer.snapshot(),
                        });
                    }
                    Some(limit - elapsed)
                }
                None => None,
            };

            match self.proc.read_with_timeout(&mut chunk, remaining).await {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    // Deadline accounting happens at the top of the loop.
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(ExpectError::Io(e)),
            }
        }
    }

    fn end_of_stream_match(&self, pattern_index: usize) -> MatchResult {
        let end = self.buffer.len();
        MatchResult {
            pattern_index,
            matched: String::new(),
            start: end,
            end,
            before: String::from_utf8_lossy(self.buffer.pending()).into_owned(),
            captures: Vec::new(),
        }
    }
}

#[async_trait(?Send)]
impl Controller for Expect {
    async fn command(&mut self, cmd: &str) -> Result<String, ExpectError> {
        self.send_line(cmd).await?;
        Ok(self.wait_for_prompt().await?.before)
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), ExpectError> {
        Expect::login(self, user, password).await
    }

    async fn send_break(&mut self) -> Result<(), ExpectError> {
        // ETX, what ^C sends on a terminal.
        self.send(&[0x03]).await
    }
}
