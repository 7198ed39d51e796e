//! Turning byte streams into values.
//!
//! [`message::MessageScanner`] frames a continuous byte stream into
//! timestamped messages; [`format::FormatScanner`] extracts numeric fields
//! from one message with a scanf-style conversion string.
//!
//! Configured strings (formats, separators, prompts, init strings) may carry
//! backslash sequences, expanded by [`unescape`] and produced by [`escape`].

pub mod format;
pub mod message;

pub use format::{FieldKind, FormatScanner, FormatSpec};
pub use message::MessageScanner;

/// Expand backslash sequences.
///
/// Recognized: `\n \r \t \e \0 \\`, `\xHH` (one or two hex digits) and
/// `\ooo` (one to three octal digits). Any other sequence is kept as is.
#[must_use]
pub fn unescape(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' || i + 1 == bytes.len() {
            out.push(b);
            i += 1;
            continue;
        }
        let c = bytes[i + 1];
        i += 2;
        match c {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'e' => out.push(0x1b),
            b'\\' => out.push(b'\\'),
            b'x' => {
                let mut val: u32 = 0;
                let mut n = 0;
                while n < 2 && i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    val = val * 16 + (bytes[i] as char).to_digit(16).unwrap_or(0);
                    i += 1;
                    n += 1;
                }
                if n == 0 {
                    out.extend_from_slice(b"\\x");
                } else {
                    out.push(val as u8);
                }
            }
            b'0'..=b'7' => {
                let mut val: u32 = u32::from(c - b'0');
                let mut n = 1;
                while n < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    val = val * 8 + u32::from(bytes[i] - b'0');
                    i += 1;
                    n += 1;
                }
                out.push((val & 0xff) as u8);
            }
            _ => {
                out.push(b'\\');
                out.push(c);
            }
        }
    }
    out
}

/// Render bytes with backslash sequences for non-printable characters.
#[must_use]
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            0x1b => out.push_str("\\e"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("\\r\\n"), b"\r\n");
        assert_eq!(unescape("R\\e\\x41\\101"), b"R\x1bAA");
        assert_eq!(unescape("a\\\\b"), b"a\\b");
        assert_eq!(unescape("\\0"), b"\0");
        assert_eq!(unescape("keep\\q"), b"keep\\q");
        assert_eq!(unescape("trailing\\"), b"trailing\\");
        assert_eq!(unescape("\\xg"), b"\\xg");
    }

    #[test]
    fn test_escape_inverts_unescape() {
        for s in ["\\r\\n", "#\\x02data\\x03", "tab\\there", "\\e"] {
            assert_eq!(escape(&unescape(s)), s);
        }
    }
}
