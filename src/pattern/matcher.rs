//! Finder implementations for the textual pattern kinds.

use crate::result::PatternError;
use globset::{Glob, GlobMatcher};
use regex::Regex;

/// Location of a successful find, as byte offsets into the searched slice.
#[derive(Debug, Clone)]
pub struct Found {
    /// Start of the matched span.
    pub start: usize,
    /// One past the end of the matched span.
    pub end: usize,
    /// Regex capture groups; empty for exact and glob finders.
    pub captures: Vec<String>,
}

/// Searches a byte buffer for the first occurrence of a pattern.
pub trait Finder {
    /// Return the first match in `haystack`, if any.
    fn find(&self, haystack: &[u8]) -> Option<Found>;
}

/// Exact substring search using the Boyer-Moore-Horspool skip table.
pub(crate) struct ExactFinder {
    needle: Vec<u8>,
    skip: [usize; 256],
}

impl ExactFinder {
    pub(crate) fn new(needle: &[u8]) -> Result<Self, PatternError> {
        if needle.is_empty() {
            return Err(PatternError::Empty);
        }
        let mut skip = [needle.len(); 256];
        for (i, &b) in needle.iter().enumerate().take(needle.len() - 1) {
            skip[b as usize] = needle.len() - 1 - i;
        }
        Ok(Self {
            needle: needle.to_vec(),
            skip,
        })
    }
}

impl Finder for ExactFinder {
    fn find(&self, haystack: &[u8]) -> Option<Found> {
        let n = self.needle.len();
        let mut pos = 0;
        while pos + n <= haystack.len() {
            if haystack[pos..pos + n] == self.needle[..] {
                return Some(Found {
                    start: pos,
                    end: pos + n,
                    captures: Vec::new(),
                });
            }
            let last = haystack[pos + n - 1];
            pos += self.skip[last as usize];
        }
        None
    }
}

/// Regular expression search. The haystack must be valid UTF-8 for a match
/// to be found; invalid bytes simply report no match until more (or
/// different) data arrives.
pub(crate) struct RegexFinder {
    regex: Regex,
}

impl RegexFinder {
    pub(crate) fn new(regex: Regex) -> Self {
        Self { regex }
    }
}

impl Finder for RegexFinder {
    fn find(&self, haystack: &[u8]) -> Option<Found> {
        let text = std::str::from_utf8(haystack).ok()?;
        let caps = self.regex.captures(text)?;
        let whole = caps.get(0)?;
        let captures = caps
            .iter()
            .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect();
        Some(Found {
            start: whole.start(),
            end: whole.end(),
            captures,
        })
    }
}

/// Glob search, applied line by line: the finder reports the first full
/// line of output that the glob matches. The trailing partial line is
/// considered too, so prompts without a newline still match.
pub(crate) struct GlobFinder {
    matcher: GlobMatcher,
}

impl GlobFinder {
    pub(crate) fn new(pattern: &str) -> Result<Self, PatternError> {
        let glob = Glob::new(pattern).map_err(|e| PatternError::InvalidGlob(e.to_string()))?;
        Ok(Self {
            matcher: glob.compile_matcher(),
        })
    }
}

impl Finder for GlobFinder {
    fn find(&self, haystack: &[u8]) -> Option<Found> {
        let text = std::str::from_utf8(haystack).ok()?;
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if self.matcher.is_match(trimmed) {
                return Some(Found {
                    start: offset,
                    end: offset + trimmed.len(),
                    captures: Vec::new(),
                });
            }
            offset += line.len();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_finds_first_occurrence() {
        let finder = ExactFinder::new(b"ssword:").unwrap();
        let found = finder.find(b"login ok\nPassword: ").unwrap();
        assert_eq!(&b"login ok\nPassword: "[found.start..found.end], b"ssword:");
    }

    #[test]
    fn exact_rejects_empty_needle() {
        assert!(ExactFinder::new(b"").is_err());
    }

    #[test]
    fn exact_misses_when_absent() {
        let finder = ExactFinder::new(b"prompt").unwrap();
        assert!(finder.find(b"nothing interesting here").is_none());
    }

    #[test]
    fn exact_matches_at_both_ends() {
        let finder = ExactFinder::new(b"ab").unwrap();
        assert_eq!(finder.find(b"abxxab").unwrap().start, 0);
        let tail = ExactFinder::new(b"xab").unwrap();
        assert_eq!(tail.find(b"abxxab").unwrap().end, 6);
    }

    #[test]
    fn regex_reports_captures() {
        let finder = RegexFinder::new(Regex::new(r"^(\d+) (\w+)").unwrap());
        let found = finder.find(b"250 OK\n").unwrap();
        assert_eq!(found.captures, vec!["250 OK", "250", "OK"]);
        assert_eq!((found.start, found.end), (0, 6));
    }

    #[test]
    fn regex_ignores_invalid_utf8() {
        let finder = RegexFinder::new(Regex::new("x").unwrap());
        assert!(finder.find(&[0xff, 0xfe, b'x']).is_none());
    }

    #[test]
    fn glob_matches_full_lines() {
        let finder = GlobFinder::new("*.tar.gz").unwrap();
        let found = finder.find(b"README\nbackup.tar.gz\nother\n").unwrap();
        assert_eq!(found.start, 7);
        assert_eq!(found.end, 7 + "backup.tar.gz".len());
    }

    #[test]
    fn glob_matches_trailing_partial_line() {
        let finder = GlobFinder::new("bash-*$").unwrap();
        assert!(finder.find(b"motd\nbash-5.2$").is_some());
    }

    #[test]
    fn glob_does_not_match_inside_line() {
        let finder = GlobFinder::new("core").unwrap();
        assert!(finder.find(b"corefile\n").is_none());
    }
}
