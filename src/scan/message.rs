//! Framing of a byte stream into messages.
//!
//! Three framings are supported:
//!
//! ```text
//! separator at end      "12.5,3\r\n" "12.6,3\r\n" ...   emit when the separator
//!                                                        completes a message
//! separator at start    "$GPGGA,..." "$GPRMC,..." ...   emit the previous message
//!                                                        when the next one starts
//! fixed length          "\x02\x10\x22\x01" ...           emit every `length` bytes
//! ```
//!
//! A separator combined with a length means the separator is only searched
//! for once `length` bytes have been collected (end framing), or that the
//! message is complete `length` bytes after the separator (start framing).
//!
//! Each message is time tagged with the estimated arrival of its first byte:
//! bytes of one read are assumed to have arrived back to back at the line
//! rate (`usecs_per_byte`, 0 for sockets), the last one at the read time.
//! Text messages, whose separator ends in CR or LF, get a trailing NUL.

use crate::config::MessageConfig;
use crate::error::{DaqError, Result};
use crate::sample::{Sample, SampleRef, Timetag};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;

/// Longest message; a longer one is emitted as is and counted as an overflow.
pub const MAX_MESSAGE_LENGTH: usize = 8192;

/// Streaming message framer.
#[derive(Debug)]
pub struct MessageScanner {
    separator: Vec<u8>,
    at_eom: bool,
    length: usize,
    usecs_per_byte: i64,
    nul_terminate: bool,
    buf: BytesMut,
    msg_time: Timetag,
    // Start framing: a separator has been seen and buf holds a message.
    synced: bool,
    overflows: u64,
}

impl MessageScanner {
    /// Build from configuration; `name` is used in errors.
    pub fn new(name: &str, config: &MessageConfig) -> Result<Self> {
        let separator = super::unescape(&config.separator);
        Self::with_separator(name, separator, config.separator_at_eom, config.length)
    }

    /// Build from an already expanded separator.
    pub fn with_separator(
        name: &str,
        separator: Vec<u8>,
        at_eom: bool,
        length: usize,
    ) -> Result<Self> {
        if separator.is_empty() && length == 0 {
            return Err(DaqError::configuration(
                name,
                "no message separator and message length of 0",
            ));
        }
        if length > MAX_MESSAGE_LENGTH {
            return Err(DaqError::configuration(
                name,
                format!("message length {} exceeds {}", length, MAX_MESSAGE_LENGTH),
            ));
        }
        let nul_terminate = matches!(separator.last(), Some(b'\n') | Some(b'\r'));
        Ok(Self {
            separator,
            at_eom,
            length,
            usecs_per_byte: 0,
            nul_terminate,
            buf: BytesMut::with_capacity(256),
            msg_time: 0,
            synced: false,
            overflows: 0,
        })
    }

    /// Expanded separator bytes.
    #[must_use]
    pub fn separator(&self) -> &[u8] {
        &self.separator
    }

    /// Whether the separator ends a message.
    #[must_use]
    pub fn separator_at_eom(&self) -> bool {
        self.at_eom
    }

    /// Fixed message length, 0 if none.
    #[must_use]
    pub fn message_length(&self) -> usize {
        self.length
    }

    /// Line time per byte used for time tag back-dating.
    pub fn set_usecs_per_byte(&mut self, usecs: i64) {
        self.usecs_per_byte = usecs.max(0);
    }

    /// Number of over-long messages emitted.
    #[must_use]
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Drop any partial message, e.g. after a reopen.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.synced = false;
    }

    fn emit(&mut self, id: u32, len: usize, out: &mut Vec<SampleRef>) {
        let mut msg = self.buf.split_to(len);
        if self.nul_terminate {
            msg.put_u8(0);
        }
        out.push(Arc::new(Sample::raw(id, self.msg_time, msg.freeze())));
    }

    /// Feed bytes read at `tread`, appending completed messages to `out`.
    pub fn scan(&mut self, data: &[u8], tread: Timetag, id: u32, out: &mut Vec<SampleRef>) {
        let n = data.len() as i64;
        let tfirst = tread - (n - 1).max(0) * self.usecs_per_byte;
        for (i, &b) in data.iter().enumerate() {
            let tbyte = tfirst + i as i64 * self.usecs_per_byte;
            if self.at_eom || self.separator.is_empty() {
                self.scan_eom(b, tbyte, id, out);
            } else {
                self.scan_bom(b, tbyte, id, out);
            }
        }
    }

    fn scan_eom(&mut self, b: u8, tbyte: Timetag, id: u32, out: &mut Vec<SampleRef>) {
        if self.buf.is_empty() {
            self.msg_time = tbyte;
        }
        self.buf.put_u8(b);
        let len = self.buf.len();
        let sep = self.separator.len();

        let complete = if sep == 0 {
            len == self.length
        } else {
            len >= self.length + sep && self.buf.ends_with(&self.separator)
        };
        if complete {
            self.emit(id, len, out);
        } else if len >= MAX_MESSAGE_LENGTH {
            self.overflows += 1;
            self.emit(id, len, out);
        }
    }

    fn scan_bom(&mut self, b: u8, tbyte: Timetag, id: u32, out: &mut Vec<SampleRef>) {
        let sep = self.separator.len();
        let sep_start = tbyte - (sep as i64 - 1) * self.usecs_per_byte;
        self.buf.put_u8(b);

        if !self.synced {
            if self.buf.ends_with(&self.separator) {
                let junk = self.buf.len() - sep;
                let _ = self.buf.split_to(junk);
                self.msg_time = sep_start;
                self.synced = true;
            } else if self.buf.len() >= sep {
                // Keep only what could still begin a separator.
                let junk = self.buf.len() + 1 - sep;
                let _ = self.buf.split_to(junk);
            }
            return;
        }

        let len = self.buf.len();
        if self.length > 0 {
            if len == sep + self.length {
                self.emit(id, len, out);
                self.synced = false;
            }
            return;
        }

        if len >= 2 * sep && self.buf.ends_with(&self.separator) {
            self.emit(id, len - sep, out);
            // The separator just seen starts the next message.
            self.msg_time = sep_start;
        } else if len >= MAX_MESSAGE_LENGTH {
            self.overflows += 1;
            self.emit(id, len, out);
            self.synced = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eom(sep: &str, length: usize) -> MessageScanner {
        MessageScanner::new(
            "test",
            &MessageConfig {
                separator: sep.to_string(),
                separator_at_eom: true,
                length,
            },
        )
        .unwrap()
    }

    fn bom(sep: &str, length: usize) -> MessageScanner {
        MessageScanner::new(
            "test",
            &MessageConfig {
                separator: sep.to_string(),
                separator_at_eom: false,
                length,
            },
        )
        .unwrap()
    }

    fn feed(scanner: &mut MessageScanner, data: &[u8], t: Timetag) -> Vec<SampleRef> {
        let mut out = Vec::new();
        scanner.scan(data, t, 7, &mut out);
        out
    }

    #[test]
    fn test_end_separator_across_reads() {
        let mut sc = eom("\\r\\n", 0);
        assert!(feed(&mut sc, b"1.5,", 100).is_empty());
        let out = feed(&mut sc, b"2.5\r\n3.0", 200);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 7);
        assert_eq!(out[0].time, 100);
        assert_eq!(out[0].as_bytes(), Some(&b"1.5,2.5\r\n\0"[..]));

        let out = feed(&mut sc, b"\r\n", 300);
        assert_eq!(out[0].time, 200);
        assert_eq!(out[0].as_bytes(), Some(&b"3.0\r\n\0"[..]));
    }

    #[test]
    fn test_binary_separator_not_terminated() {
        let mut sc = eom("\\x03", 0);
        let out = feed(&mut sc, b"ab\x03", 0);
        assert_eq!(out[0].as_bytes(), Some(&b"ab\x03"[..]));
    }

    #[test]
    fn test_end_separator_with_length() {
        // The separator byte may appear inside the fixed-length body.
        let mut sc = eom("\\n", 3);
        let out = feed(&mut sc, b"a\nb\nc\n", 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_bytes(), Some(&b"a\nb\n\0"[..]));
    }

    #[test]
    fn test_fixed_length() {
        let mut sc = eom("", 4);
        let out = feed(&mut sc, b"\x01\x02\x03\x04\x05\x06", 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 4);
        let out = feed(&mut sc, b"\x07\x08", 0);
        assert_eq!(out[0].as_bytes(), Some(&b"\x05\x06\x07\x08"[..]));
    }

    #[test]
    fn test_start_separator() {
        let mut sc = bom("$", 0);
        // Leading junk before the first separator is dropped.
        assert!(feed(&mut sc, b"xx$GGA,1", 10).is_empty());
        let out = feed(&mut sc, b"$RMC,2$", 20);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_bytes(), Some(&b"$GGA,1"[..]));
        assert_eq!(out[0].time, 10);
        assert_eq!(out[1].as_bytes(), Some(&b"$RMC,2"[..]));
        assert_eq!(out[1].time, 20);
    }

    #[test]
    fn test_start_separator_with_length() {
        let mut sc = bom("\\xaa\\x55", 2);
        let out = feed(&mut sc, b"\x00\xaa\x55\x01\x02\xaa\x55\x03", 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_bytes(), Some(&b"\xaa\x55\x01\x02"[..]));
        let out = feed(&mut sc, b"\x04", 0);
        assert_eq!(out[0].as_bytes(), Some(&b"\xaa\x55\x03\x04"[..]));
    }

    #[test]
    fn test_time_back_dating() {
        let mut sc = eom("\\n", 0);
        sc.set_usecs_per_byte(1000);
        // 4 bytes, the last read at t=10000: the first arrived 3 ms earlier.
        let out = feed(&mut sc, b"1\n2\n", 10_000);
        assert_eq!(out[0].time, 7_000);
        assert_eq!(out[1].time, 9_000);
    }

    #[test]
    fn test_overflow() {
        let mut sc = eom("\\n", 0);
        let data = vec![b'x'; MAX_MESSAGE_LENGTH + 10];
        let out = feed(&mut sc, &data, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(sc.overflows(), 1);
        sc.reset();
        assert_eq!(feed(&mut sc, b"ok\n", 0).len(), 1);
    }

    #[test]
    fn test_requires_separator_or_length() {
        let err = MessageScanner::new(
            "dev",
            &MessageConfig {
                separator: String::new(),
                separator_at_eom: true,
                length: 0,
            },
        )
        .unwrap_err();
        assert!(!err.is_recoverable());
    }
}
