//! Shared result and error types.

mod error;

pub use error::{ExpectError, FsmError, PatternError, ProcessError, ReactorError};

/// Result of a successful pattern match against a process's output.
///
/// Positions are byte offsets into the dialog buffer at the time of the
/// match. `before` holds everything that was read ahead of the match, which
/// is usually the interesting part when matching on a prompt.
///
/// # Examples
///
/// ```no_run
/// use marionette::{Expect, Pattern, Supervisor};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let supervisor = Supervisor::new();
/// let handle = supervisor.command("uname -s").spawn()?;
/// let mut session = Expect::new(handle);
///
/// let result = session.expect(&Pattern::regex(r"(Linux|Darwin)")?).await?;
/// println!("kernel: {}", result.matched);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Index of the pattern that matched when using
    /// [`expect_any`](crate::Expect::expect_any); 0 for single-pattern calls.
    pub pattern_index: usize,

    /// The matched text.
    pub matched: String,

    /// Byte offset where the match starts.
    pub start: usize,

    /// Byte offset one past the end of the match.
    pub end: usize,

    /// Output that accumulated before the match.
    pub before: String,

    /// Capture groups for regex patterns: index 0 is the whole match,
    /// higher indices are the numbered groups. Empty for other pattern
    /// kinds.
    pub captures: Vec<String>,
}
