//! JSON-lines parser for the collector's append-only logs.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Records decoded from a JSON-lines buffer.
#[derive(Debug)]
pub struct Parsed<T> {
    pub records: Vec<T>,
    /// Non-empty lines that failed to decode.
    pub skipped: usize,
    /// Newline-terminated lines in the buffer, blank ones included. A tail
    /// without a newline is not counted so it is read again once complete.
    pub complete_lines: usize,
}

/// Decodes one JSON object per line, skipping blank and malformed lines.
///
/// The collector appends while we read, so an unterminated final line that
/// does not decode is still being written: it is left for the next read
/// without a warning and is not counted as skipped.
///
/// # Errors
///
/// Returns an error if the bytes are not valid UTF-8.
pub fn parse_lines<T: DeserializeOwned>(bytes: &[u8]) -> Result<Parsed<T>> {
    parse_lines_after(bytes, 0)
}

/// Like [`parse_lines`], but ignores the first `skip` lines. Used to tail a
/// log that was already partly consumed.
pub fn parse_lines_after<T: DeserializeOwned>(bytes: &[u8], skip: usize) -> Result<Parsed<T>> {
    let text = std::str::from_utf8(bytes).context("log is not valid UTF-8")?;
    let complete_lines = text.matches('\n').count();
    let mut parsed = Parsed {
        records: Vec::new(),
        skipped: 0,
        complete_lines,
    };

    for (idx, line) in text.lines().enumerate() {
        if idx < skip {
            continue;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => parsed.records.push(record),
            Err(e) if idx >= complete_lines => {
                debug!(line = idx + 1, error = %e, "Tail line incomplete, leaving it for the next read");
            }
            Err(e) => {
                warn!(line = idx + 1, error = %e, "Skipping malformed log line");
                parsed.skipped += 1;
            }
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Line {
        n: u32,
    }

    #[test]
    fn test_parse_empty_bytes_returns_nothing() {
        let parsed = parse_lines::<Line>(&[]).unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.complete_lines, 0);
    }

    #[test]
    fn test_parse_invalid_utf8() {
        let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
        assert!(parse_lines::<Line>(&invalid_bytes).is_err());
    }

    #[test]
    fn test_malformed_and_blank_lines_are_skipped() {
        let input = b"{\"n\": 1}\n\nnot json\n{\"n\": 2}\n{\"n\": ";
        let parsed = parse_lines::<Line>(input).unwrap();
        assert_eq!(parsed.records, vec![Line { n: 1 }, Line { n: 2 }]);
        // the unterminated tail is pending, not malformed
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.complete_lines, 4);
    }

    #[test]
    fn test_partial_tail_is_read_once_complete() {
        let partial = b"{\"n\": 1}\n{\"n\": ";
        let first = parse_lines::<Line>(partial).unwrap();
        assert_eq!(first.records, vec![Line { n: 1 }]);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.complete_lines, 1);

        let completed = b"{\"n\": 1}\n{\"n\": 2}\n";
        let second = parse_lines_after::<Line>(completed, first.complete_lines).unwrap();
        assert_eq!(second.records, vec![Line { n: 2 }]);
        assert_eq!(second.skipped, 0);
    }

    #[test]
    fn test_unterminated_complete_line_is_decoded() {
        let parsed = parse_lines::<Line>(b"{\"n\": 1}\n{\"n\": 2}").unwrap();
        assert_eq!(parsed.records, vec![Line { n: 1 }, Line { n: 2 }]);
        assert_eq!(parsed.complete_lines, 1);
    }

    #[test]
    fn test_parse_after_skips_consumed_lines() {
        let input = b"{\"n\": 1}\n{\"n\": 2}\n{\"n\": 3}\n";
        let parsed = parse_lines_after::<Line>(input, 2).unwrap();
        assert_eq!(parsed.records, vec![Line { n: 3 }]);
        assert_eq!(parsed.complete_lines, 3);
    }
}
