//! Record framing for chunked HTTP bodies.
//!
//! Chunk boundaries from `bytes_stream()` fall anywhere, including inside a
//! multi-byte character, so records are only decoded once their delimiter
//! has arrived.

#[derive(Debug)]
pub struct RecordBuffer {
    delimiters: Vec<u8>,
    pending: Vec<u8>,
}

impl RecordBuffer {
    pub fn new(delimiter: u8) -> Self {
        Self::any_of(&[delimiter])
    }

    /// Records end at any of `delimiters`.
    pub fn any_of(delimiters: &[u8]) -> Self {
        Self { delimiters: delimiters.to_vec(), pending: Vec::new() }
    }

    /// Newline-delimited records (NDJSON, SSE).
    pub fn lines() -> Self {
        Self::new(b'\n')
    }

    /// Appends a chunk and returns every record it completed. Records are
    /// trimmed of trailing `\r`; empty records are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| self.delimiters.contains(b)) {
            let record: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(text) = decode(&record[..record.len() - 1]) {
                records.push(text);
            }
        }
        records
    }

    /// Whatever is left once the body ends without a final delimiter.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        decode(&rest)
    }
}

fn decode(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_split_across_chunks() {
        let mut buf = RecordBuffer::lines();
        assert!(buf.push(b"{\"output\":").is_empty());
        assert_eq!(buf.push(b" \"hi\"}\n{\"status\"").len(), 1);
        assert_eq!(buf.push(b":\"COMPLETED\"}\r\n"), vec!["{\"status\":\"COMPLETED\"}".to_string()]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_multibyte_char_split_between_chunks() {
        let bytes = "héllo\n".as_bytes();
        let mut buf = RecordBuffer::lines();
        assert!(buf.push(&bytes[..2]).is_empty());
        assert_eq!(buf.push(&bytes[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_nul_delimiter_and_trailing_record() {
        let mut buf = RecordBuffer::new(0);
        assert_eq!(buf.push(b"a\0\0b"), vec!["a".to_string()]);
        assert_eq!(buf.finish(), Some("b".to_string()));
    }

    #[test]
    fn test_any_of_splits_on_each_delimiter() {
        let mut buf = RecordBuffer::any_of(b"\0\n");
        assert_eq!(buf.push(b"a\0b\nc"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(buf.finish(), Some("c".to_string()));
    }
}
