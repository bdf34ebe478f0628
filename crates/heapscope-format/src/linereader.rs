//! Line-oriented record reader.
//!
//! Parses the `tag field field ...` records of both the raw and the
//! resolved stream. Field accessors return `None` on malformed input so
//! callers can log and skip a bad record without ever panicking.

use std::io::{self, BufRead};

/// Reusable reader for one record line at a time.
///
/// The internal buffer is recycled across [`LineReader::next_line`] calls,
/// so a full parse does not allocate per record.
pub struct LineReader {
    line: String,
    pos: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self {
            line: String::with_capacity(256),
            pos: 0,
        }
    }

    /// Read the next non-empty line. Returns `Ok(false)` at end of input.
    pub fn next_line(&mut self, input: &mut dyn BufRead) -> io::Result<bool> {
        loop {
            self.line.clear();
            self.pos = 0;
            let read = input.read_line(&mut self.line)?;
            if read == 0 {
                return Ok(false);
            }
            while self.line.ends_with('\n') || self.line.ends_with('\r') {
                self.line.pop();
            }
            if !self.line.is_empty() {
                // fields start after "<tag> "
                self.pos = if self.line.len() > 1 { 2 } else { 1 };
                return Ok(true);
            }
        }
    }

    /// Record tag, the first byte of the line.
    pub fn tag(&self) -> u8 {
        self.line.as_bytes().first().copied().unwrap_or(0)
    }

    /// The whole current line, without the trailing newline.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Everything after the tag, with the leading separator stripped.
    pub fn rest(&self) -> &str {
        self.line.get(self.pos..).unwrap_or("")
    }

    /// Next field parsed as hex.
    pub fn hex(&mut self) -> Option<u64> {
        let word = self.raw_word()?;
        u64::from_str_radix(word, 16).ok()
    }

    /// Next field parsed as a decimal integer.
    pub fn dec(&mut self) -> Option<i64> {
        self.raw_word()?.parse().ok()
    }

    /// Next whitespace-delimited field, verbatim.
    pub fn word(&mut self) -> Option<String> {
        self.raw_word().map(str::to_owned)
    }

    fn raw_word(&mut self) -> Option<&str> {
        let bytes = self.line.as_bytes();
        let mut start = self.pos;
        while start < bytes.len() && bytes[start] == b' ' {
            start += 1;
        }
        if start >= bytes.len() {
            return None;
        }
        let mut end = start;
        while end < bytes.len() && bytes[end] != b' ' {
            end += 1;
        }
        self.pos = end;
        Some(&self.line[start..end])
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader_over(input: &str) -> (LineReader, Cursor<Vec<u8>>) {
        (LineReader::new(), Cursor::new(input.as_bytes().to_vec()))
    }

    #[test]
    fn test_parses_hex_fields() {
        let (mut reader, mut input) = reader_over("+ 20 1 deadbeef\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.tag(), b'+');
        assert_eq!(reader.hex(), Some(0x20));
        assert_eq!(reader.hex(), Some(0x1));
        assert_eq!(reader.hex(), Some(0xdeadbeef));
        assert_eq!(reader.hex(), None);
    }

    #[test]
    fn test_decimal_timestamp() {
        let (mut reader, mut input) = reader_over("c 1042\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.dec(), Some(1042));
    }

    #[test]
    fn test_malformed_field_yields_none() {
        let (mut reader, mut input) = reader_over("t zz 0 0\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.hex(), None);
    }

    #[test]
    fn test_skips_empty_lines_and_stops_at_eof() {
        let (mut reader, mut input) = reader_over("\n\nR 40\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.tag(), b'R');
        assert!(!reader.next_line(&mut input).unwrap());
    }

    #[test]
    fn test_rest_preserves_spaces() {
        let (mut reader, mut input) = reader_over("X /bin/app --flag value\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.rest(), "/bin/app --flag value");
    }

    #[test]
    fn test_tag_only_line() {
        let (mut reader, mut input) = reader_over("A\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.tag(), b'A');
        assert_eq!(reader.hex(), None);
    }
}
