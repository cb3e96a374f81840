//! Rolling buffer of process output consumed by expect matching.

use bytes::BytesMut;

/// Oldest fraction of the buffer discarded when the size limit is reached.
const DISCARD_DENOMINATOR: usize = 3;

/// Accumulates everything read from a process and tracks how far pattern
/// matches have consumed it.
///
/// Matches are applied to the unconsumed tail; once a pattern matches, the
/// buffer is consumed up to the end of the match so the same output is not
/// matched twice. When the buffer outgrows its limit the oldest third is
/// discarded, but never unconsumed data.
pub(crate) struct DialogBuffer {
    data: BytesMut,
    consumed: usize,
    limit: usize,
}

impl DialogBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(limit.min(64 * 1024)),
            consumed: 0,
            limit,
        }
    }

    /// Append freshly read bytes, compacting first if needed.
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        if self.data.len() + chunk.len() > self.limit {
            self.compact();
        }
        self.data.extend_from_slice(chunk);
    }

    /// The unconsumed tail that patterns are applied to.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    /// Offset of the unconsumed tail within the whole buffer.
    pub(crate) fn consumed(&self) -> usize {
        self.consumed
    }

    /// Mark everything up to `end` (a whole-buffer offset) as consumed.
    pub(crate) fn consume_to(&mut self, end: usize) {
        self.consumed = end.min(self.data.len());
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bytes ahead of a whole-buffer offset.
    pub(crate) fn before(&self, pos: usize) -> &[u8] {
        &self.data[..pos.min(self.data.len())]
    }

    /// Lossy text rendering of the whole buffer, for error reports.
    pub(crate) fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    fn compact(&mut self) {
        let cut = (self.limit / DISCARD_DENOMINATOR).min(self.consumed);
        if cut == 0 {
            return;
        }
        let _ = self.data.split_to(cut);
        self.consumed -= cut;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pending() {
        let mut buf = DialogBuffer::new(1024);
        buf.push(b"hello ");
        buf.push(b"world");
        assert_eq!(buf.pending(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn consume_moves_the_tail() {
        let mut buf = DialogBuffer::new(1024);
        buf.push(b"prompt$ output");
        buf.consume_to(8);
        assert_eq!(buf.pending(), b"output");
        assert_eq!(buf.before(8), b"prompt$ ");
    }

    #[test]
    fn compaction_never_drops_unconsumed_data() {
        let mut buf = DialogBuffer::new(90);
        buf.push(&[b'a'; 60]);
        buf.consume_to(10);
        buf.push(&[b'b'; 60]);
        // Only the consumed prefix may be discarded.
        let pending = buf.pending().to_vec();
        assert_eq!(&pending[pending.len() - 60..], &[b'b'; 60][..]);
        assert!(pending[..pending.len() - 60].iter().all(|&b| b == b'a'));
    }

    #[test]
    fn snapshot_is_lossy() {
        let mut buf = DialogBuffer::new(64);
        buf.push(b"ok\xff");
        assert!(buf.snapshot().starts_with("ok"));
    }
}
