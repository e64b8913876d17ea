//! Log Entry - Line Format, Encoder, Decoder
//!
//! ## Line Layout
//!
//! ```text
//! [2026-10-16 12:00:00.123] sensors/temp: 21.5\n
//!  └──── timestamp ──────┘  └─ topic ─┘  └payload┘
//! ```
//!
//! One entry per line, so the file stays readable and appendable by hand.
//! Escaping keeps every entry on a single line:
//!
//! - UTF-8 payloads: `\` `\n` `\r` `\t` are escaped, other control chars
//!   become `\u{..}`, everything else is verbatim
//! - non-UTF-8 payloads: printable ASCII verbatim, everything else `\xNN`
//! - topics: as UTF-8 payloads, plus `:` becomes `\x3a` so the first `": "`
//!   always ends the topic

use bytes::Bytes;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::fmt::Write as _;

/// Timestamp format (local wall clock, millisecond precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A single received message as persisted in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Wall-clock capture at receipt
    pub timestamp: DateTime<Local>,
    pub topic: String,
    pub payload: Bytes,
}

impl LogEntry {
    /// Create an entry stamped with the current local time
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::with_timestamp(Local::now(), topic, payload)
    }

    pub fn with_timestamp(
        timestamp: DateTime<Local>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        LogEntry {
            timestamp,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Encode as one newline-terminated line
    pub fn encode_line(&self) -> Vec<u8> {
        let mut line = String::with_capacity(32 + self.topic.len() + self.payload.len());
        line.push('[');
        let _ = write!(line, "{}", self.timestamp.format(TIMESTAMP_FORMAT));
        line.push_str("] ");
        escape_text(&self.topic, true, &mut line);
        line.push_str(": ");
        match std::str::from_utf8(&self.payload) {
            Ok(text) => escape_text(text, false, &mut line),
            Err(_) => escape_binary(&self.payload, &mut line),
        }
        line.push('\n');

        debug_assert_eq!(
            line.bytes().filter(|b| *b == b'\n').count(),
            1,
            "Postcondition: an encoded entry is exactly one line"
        );

        line.into_bytes()
    }

    /// Decode one line (with or without its trailing newline).
    /// Returns None for anything that is not a well-formed entry.
    pub fn decode_line(line: &[u8]) -> Option<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = std::str::from_utf8(line).ok()?;

        let rest = line.strip_prefix('[')?;
        let (ts, rest) = rest.split_once("] ")?;
        let (topic, payload) = rest.split_once(": ")?;

        let naive = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?;
        let timestamp = Local.from_local_datetime(&naive).earliest()?;

        let topic = String::from_utf8(unescape(topic)?).ok()?;
        let payload = Bytes::from(unescape(payload)?);

        Some(LogEntry {
            timestamp,
            topic,
            payload,
        })
    }

    /// Payload as text, lossy for binary payloads
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Split raw log bytes into entries. Malformed lines are skipped.
pub fn decode_lines(data: &[u8]) -> Vec<LogEntry> {
    data.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(LogEntry::decode_line)
        .collect()
}

fn escape_text(text: &str, escape_colon: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ':' if escape_colon => out.push_str("\\x3a"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{{{:x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
}

fn escape_binary(data: &[u8], out: &mut String) {
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{:02x}", b);
            }
        }
    }
}

fn unescape(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            '\\' => out.push(b'\\'),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'x' => {
                let hi = chars.next()?.to_digit(16)?;
                let lo = chars.next()?.to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
            }
            'u' => {
                if chars.next()? != '{' {
                    return None;
                }
                let mut code = 0u32;
                loop {
                    let d = chars.next()?;
                    if d == '}' {
                        break;
                    }
                    code = code.checked_mul(16)?.checked_add(d.to_digit(16)?)?;
                }
                let ch = char::from_u32(code)?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            _ => return None,
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time() -> DateTime<Local> {
        let naive = NaiveDateTime::parse_from_str("2026-10-16 12:00:00.123", TIMESTAMP_FORMAT)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    #[test]
    fn test_encode_matches_bridge_format() {
        let entry = LogEntry::with_timestamp(fixed_time(), "sensors/temp", "21.5");
        let line = String::from_utf8(entry.encode_line()).unwrap();
        assert_eq!(line, "[2026-10-16 12:00:00.123] sensors/temp: 21.5\n");
    }

    #[test]
    fn test_decode_plain_line() {
        let entry =
            LogEntry::decode_line(b"[2026-10-16 12:00:00.123] sensors/humidity: 60\n").unwrap();
        assert_eq!(entry.timestamp, fixed_time());
        assert_eq!(entry.topic, "sensors/humidity");
        assert_eq!(&entry.payload[..], b"60");
    }

    #[test]
    fn test_multiline_payload_stays_on_one_line() {
        let entry = LogEntry::with_timestamp(fixed_time(), "sensors/raw", "a\nb\\c\r\u{7}");
        let line = entry.encode_line();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(LogEntry::decode_line(&line).unwrap(), entry);
    }

    #[test]
    fn test_binary_payload_survives() {
        let payload: Vec<u8> = vec![0x00, 0xff, b'\n', b'A', 0x80, b'\\'];
        let entry = LogEntry::with_timestamp(fixed_time(), "sensors/bin", payload.clone());
        let line = String::from_utf8(entry.encode_line()).unwrap();
        assert!(line.contains("\\x00\\xff\\nA\\x80\\\\"));
        let decoded = LogEntry::decode_line(line.as_bytes()).unwrap();
        assert_eq!(&decoded.payload[..], &payload[..]);
    }

    #[test]
    fn test_colon_in_topic_and_payload() {
        let entry = LogEntry::with_timestamp(fixed_time(), "a:b/c", "x: y: z");
        let line = String::from_utf8(entry.encode_line()).unwrap();
        assert!(line.contains("a\\x3ab/c: x: y: z"));
        assert_eq!(LogEntry::decode_line(line.as_bytes()).unwrap(), entry);
    }

    #[test]
    fn test_non_ascii_text_verbatim() {
        let entry = LogEntry::with_timestamp(fixed_time(), "sensores/temperatura", "21.5°C");
        let line = String::from_utf8(entry.encode_line()).unwrap();
        assert!(line.ends_with("21.5°C\n"));
    }

    #[test]
    fn test_empty_payload() {
        let entry = LogEntry::with_timestamp(fixed_time(), "sensors/empty", Bytes::new());
        let decoded = LogEntry::decode_line(&entry.encode_line()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(LogEntry::decode_line(b"").is_none());
        assert!(LogEntry::decode_line(b"no brackets here").is_none());
        assert!(LogEntry::decode_line(b"[not a time] t: p").is_none());
        assert!(LogEntry::decode_line(b"[2026-10-16 12:00:00.123] t: bad\\q").is_none());
        assert!(LogEntry::decode_line(b"[2026-10-16 12:00:00.123] t: trailing\\").is_none());
    }

    #[test]
    fn test_decode_lines_skips_torn_tail() {
        let a = LogEntry::with_timestamp(fixed_time(), "s/a", "1");
        let b = LogEntry::with_timestamp(fixed_time(), "s/b", "2");
        let mut data = a.encode_line();
        data.extend_from_slice(&b.encode_line());
        data.extend_from_slice(b"[2026-10-16 12:0");
        let entries = decode_lines(&data);
        assert_eq!(entries, vec![a, b]);
    }
}
