//! Patterns applied to process output during expect operations.

mod matcher;

pub use matcher::{Finder, Found};

use crate::result::PatternError;
use matcher::{ExactFinder, GlobFinder, RegexFinder};
use regex::Regex;

/// A pattern to wait for in a process's output stream.
///
/// Three textual kinds are supported, mirroring the classic expect match
/// types: exact substrings (fastest), regular expressions (most powerful,
/// with capture groups), and shell-style globs (matched against whole
/// output lines). Two special kinds, [`Pattern::Eof`] and
/// [`Pattern::Timeout`], never match text; they let
/// [`expect_any`](crate::Expect::expect_any) treat end-of-stream or an
/// elapsed deadline as a successful branch of the dialog instead of an
/// error.
///
/// # Examples
///
/// ```
/// use marionette::Pattern;
///
/// let prompt = Pattern::exact("$ ");
/// let reply = Pattern::regex(r"^250 (.*)").unwrap();
/// let listing = Pattern::glob("*.tar.gz");
/// ```
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Exact substring match.
    Exact(String),
    /// Regular expression match; captures are reported in the result.
    Regex(Regex),
    /// Shell-style glob, matched against each full line of output.
    Glob(String),
    /// Matches when the process closes its output stream.
    Eof,
    /// Matches when the expect deadline elapses.
    Timeout,
}

impl Pattern {
    /// Exact substring pattern.
    pub fn exact(s: impl Into<String>) -> Self {
        Pattern::Exact(s.into())
    }

    /// Regular expression pattern.
    ///
    /// # Errors
    ///
    /// Fails on invalid regex syntax.
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        Ok(Pattern::Regex(Regex::new(pattern)?))
    }

    /// Shell-style glob pattern (`*`, `?`, character classes).
    pub fn glob(pattern: &str) -> Self {
        Pattern::Glob(pattern.to_string())
    }

    /// Compile the pattern into a [`Finder`]. Special patterns (EOF,
    /// timeout) have no finder and yield `None`.
    pub(crate) fn compile(&self) -> Result<Option<Box<dyn Finder>>, PatternError> {
        match self {
            Pattern::Exact(s) => Ok(Some(Box::new(ExactFinder::new(s.as_bytes())?))),
            Pattern::Regex(re) => Ok(Some(Box::new(RegexFinder::new(re.clone())))),
            Pattern::Glob(g) => Ok(Some(Box::new(GlobFinder::new(g)?))),
            Pattern::Eof | Pattern::Timeout => Ok(None),
        }
    }
}
