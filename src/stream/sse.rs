use bytes::BytesMut;
use memchr::memchr_iter;

// Consumed prefixes beyond this size are reclaimed even while the carry is
// still the minority of the buffer.
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Incremental SSE line splitter.
///
/// Feed it raw byte chunks arriving on arbitrary boundaries and it invokes
/// the callback once per complete line, without the terminating newline. A
/// trailing partial line stays buffered until a later chunk completes it, so
/// a `data:` record split across two reads is never seen as two broken
/// lines.
pub struct SseLineScanner {
    buffer: BytesMut,
    read_offset: usize,
}

impl SseLineScanner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            read_offset: 0,
        }
    }

    /// Feed raw bytes and invoke `on_line` for every completed line.
    pub fn feed(&mut self, chunk: &[u8], mut on_line: impl FnMut(&[u8])) {
        self.buffer.extend_from_slice(chunk);
        let scan_start = self.read_offset;
        let mut processed_up_to = self.read_offset;
        for rel_pos in memchr_iter(b'\n', &self.buffer[scan_start..]) {
            let line_end = scan_start + rel_pos;
            on_line(&self.buffer[processed_up_to..line_end]);
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        self.compact();
    }

    // Reclaim consumed bytes, keeping the carry contiguous at offset zero.
    fn compact(&mut self) {
        if self.read_offset == 0 {
            return;
        }
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
        } else if self.read_offset * 2 >= self.buffer.len()
            || self.read_offset >= COMPACT_THRESHOLD
        {
            let _ = self.buffer.split_to(self.read_offset);
        } else {
            return;
        }
        self.read_offset = 0;
    }

    /// Deliver a buffered trailing line that never saw its newline.
    ///
    /// Call this when the upstream body ends cleanly. On error or cancel
    /// paths the carry must be dropped with the scanner instead, so a half
    /// record is never processed as if it were complete.
    pub fn finish(&mut self, mut on_line: impl FnMut(&[u8])) {
        if self.read_offset < self.buffer.len() {
            on_line(&self.buffer[self.read_offset..]);
        }
        self.buffer.clear();
        self.read_offset = 0;
    }

    /// Bytes buffered and waiting for a newline.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer[self.read_offset..]
    }
}

impl Default for SseLineScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_lines(scanner: &mut SseLineScanner, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        scanner.feed(chunk, |line| lines.push(line.to_vec()));
        lines
    }

    #[test]
    fn test_single_line() {
        let mut scanner = SseLineScanner::new();
        let lines = collect_lines(&mut scanner, b"data: hello\n");
        assert_eq!(lines, vec![b"data: hello".to_vec()]);
        assert!(scanner.pending().is_empty());
    }

    #[test]
    fn test_multiple_lines_one_chunk() {
        let mut scanner = SseLineScanner::new();
        let lines = collect_lines(&mut scanner, b"data: a\n\ndata: b\n");
        assert_eq!(
            lines,
            vec![b"data: a".to_vec(), b"".to_vec(), b"data: b".to_vec()]
        );
    }

    #[test]
    fn test_partial_line_carries_over() {
        let mut scanner = SseLineScanner::new();
        assert!(collect_lines(&mut scanner, b"data: {\"id\":").is_empty());
        assert_eq!(scanner.pending(), b"data: {\"id\":");

        let lines = collect_lines(&mut scanner, b"\"c1\"}\n");
        assert_eq!(lines, vec![b"data: {\"id\":\"c1\"}".to_vec()]);
        assert!(scanner.pending().is_empty());
    }

    #[test]
    fn test_split_inside_data_marker() {
        let mut scanner = SseLineScanner::new();
        assert!(collect_lines(&mut scanner, b"da").is_empty());
        assert!(collect_lines(&mut scanner, b"ta: x").is_empty());
        let lines = collect_lines(&mut scanner, b"\n");
        assert_eq!(lines, vec![b"data: x".to_vec()]);
    }

    #[test]
    fn test_crlf_line_keeps_carriage_return() {
        let mut scanner = SseLineScanner::new();
        let lines = collect_lines(&mut scanner, b"data: a\r\n");
        assert_eq!(lines, vec![b"data: a\r".to_vec()]);
    }

    #[test]
    fn test_finish_drains_trailing_line() {
        let mut scanner = SseLineScanner::new();
        assert!(collect_lines(&mut scanner, b"data: tail").is_empty());

        let mut lines = Vec::new();
        scanner.finish(|line| lines.push(line.to_vec()));
        assert_eq!(lines, vec![b"data: tail".to_vec()]);
        assert!(scanner.pending().is_empty());
    }

    #[test]
    fn test_finish_without_carry_emits_nothing() {
        let mut scanner = SseLineScanner::new();
        scanner.feed(b"data: a\n", |_| {});

        let mut called = false;
        scanner.finish(|_| called = true);
        assert!(!called);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_feed() {
        let input: &[u8] = b"data: first\n\ndata: second\r\ndata: third\n";

        let mut whole = SseLineScanner::new();
        let mut whole_lines = Vec::new();
        whole.feed(input, |line| whole_lines.push(line.to_vec()));

        let mut split = SseLineScanner::new();
        let mut split_lines = Vec::new();
        for byte in input {
            split.feed(std::slice::from_ref(byte), |line| {
                split_lines.push(line.to_vec());
            });
        }

        assert_eq!(whole_lines, split_lines);
    }

    #[test]
    fn test_compaction_keeps_carry_intact() {
        let mut scanner = SseLineScanner::new();
        let long_line = vec![b'x'; 9000];
        let mut chunk = long_line.clone();
        chunk.push(b'\n');
        chunk.extend_from_slice(b"carry");

        let lines = collect_lines(&mut scanner, &chunk);
        assert_eq!(lines, vec![long_line]);
        assert_eq!(scanner.pending(), b"carry");

        let lines = collect_lines(&mut scanner, b" over\n");
        assert_eq!(lines, vec![b"carry over".to_vec()]);
    }
}
