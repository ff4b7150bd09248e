//! Newline framing.
//!
//! Bytes arrive in arbitrary chunks. `LineBuffer` accumulates them, hands
//! back every complete line, and keeps the trailing partial line for the
//! next chunk. Splitting happens on raw bytes, so a multi-byte UTF-8
//! character cut across two reads is reassembled intact.

use tracing::warn;

/// Maximum length of a single line (8MB) to bound memory from a misbehaving peer.
pub const MAX_LINE_LEN: usize = 8 * 1024 * 1024;

/// Reassembles newline-delimited frames from a byte stream.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_len: usize,
    /// Set while skipping the remainder of an oversized line
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_line_len(MAX_LINE_LEN)
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_len,
            discarding: false,
        }
    }

    /// Feed a chunk and return the complete lines it finished, in order.
    ///
    /// Returned lines exclude the `\n`. Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.pending.extend_from_slice(head);
            let line = std::mem::take(&mut self.pending);
            if line.len() > self.max_line_len {
                warn!("Dropping oversized line ({} > {} bytes)", line.len(), self.max_line_len);
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            lines.push(line);
        }

        if !self.discarding {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > self.max_line_len {
                warn!(
                    "Line exceeds {} bytes without a delimiter, discarding until next newline",
                    self.max_line_len
                );
                self.pending.clear();
                self.discarding = true;
            }
        }

        lines
    }

    /// Number of buffered bytes belonging to an unfinished line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_complete_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"one\ntwo\nthree\n");
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_keeps_trailing_partial_line() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"one\ntw"), vec![b"one".to_vec()]);
        assert_eq!(buf.pending_len(), 2);
        assert_eq!(buf.push(b"o\n"), vec![b"two".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_single_byte_chunks() {
        let stream = b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n";
        let mut buf = LineBuffer::new();
        let mut lines = Vec::new();
        for byte in stream.iter() {
            lines.extend(buf.push(std::slice::from_ref(byte)));
        }
        assert_eq!(
            lines,
            vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec(), b"{\"c\":3}".to_vec()]
        );
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let text = "caf\u{e9}\n".as_bytes();
        let mut buf = LineBuffer::new();
        // Cut inside the two-byte encoding of 'é'
        assert!(buf.push(&text[..4]).is_empty());
        let lines = buf.push(&text[4..]);
        assert_eq!(String::from_utf8(lines[0].clone()).unwrap(), "caf\u{e9}");
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"\n\n  \nx\n"), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_oversized_line_dropped_within_chunk() {
        let mut buf = LineBuffer::with_max_line_len(4);
        let lines = buf.push(b"toolong\nok\n");
        assert_eq!(lines, vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_oversized_line_discarded_across_chunks() {
        let mut buf = LineBuffer::with_max_line_len(4);
        assert!(buf.push(b"abcdef").is_empty());
        assert_eq!(buf.pending_len(), 0);
        // Remainder of the oversized line is skipped, next line survives
        assert_eq!(buf.push(b"gh\nok\n"), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut buf = LineBuffer::new();
        buf.push(b"partial");
        buf.clear();
        assert_eq!(buf.push(b"\nnext\n"), vec![b"next".to_vec()]);
    }
}
