//! Escape sequences in the client-to-sensor byte stream.
//!
//! | bytes                  | meaning                                   |
//! |------------------------|-------------------------------------------|
//! | `ESC ESC`              | one literal ESC                           |
//! | `ESC b<digits>`        | set baud rate (`B` also accepted)         |
//! | `ESC p`                | toggle prompting                          |
//! | `ESC t<secs>`          | read timeout until the next reopen        |
//! | `ESC T<secs>`          | permanent read timeout                    |
//! | `ESC <other>`          | both bytes passed through                 |
//!
//! Numeric arguments end at the first byte that cannot continue them; spaces,
//! CR and LF directly following are consumed. An escape split across reads
//! is held until the rest arrives.

/// The escape character.
pub const ESC: u8 = 0x1b;

/// Longest escape sequence held while waiting for its end.
const MAX_PENDING: usize = 64;

/// One decoded element of the client stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EscapeAction {
    /// Bytes for the sensor.
    Data(Vec<u8>),
    /// Change the baud rate.
    SetBaud(u32),
    /// Toggle prompting.
    TogglePrompting,
    /// Change the read timeout; 0 disables it.
    SetTimeout {
        /// New timeout, ms
        millis: u64,
        /// Whether it survives a reopen
        permanent: bool,
    },
    /// Recognized command with a malformed argument. Nothing after it is
    /// decoded.
    Invalid(String),
}

/// Incremental escape decoder.
#[derive(Debug, Default)]
pub struct EscapeParser {
    pending: Vec<u8>,
}

fn is_arg_end(b: u8) -> bool {
    matches!(b, b' ' | b'\r' | b'\n')
}

enum Step {
    /// Escape consumed up to the index, with an optional action.
    Done(usize, Option<EscapeAction>),
    /// Need more input.
    Incomplete,
}

impl EscapeParser {
    /// New decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held from an incomplete escape.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Decode `input`, returning actions in stream order.
    pub fn feed(&mut self, input: &[u8]) -> Vec<EscapeAction> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(input);

        let mut actions = Vec::new();
        let mut data = Vec::new();
        let mut i = 0;
        while i < buf.len() {
            if buf[i] != ESC {
                data.push(buf[i]);
                i += 1;
                continue;
            }
            match Self::escape(&buf, i) {
                Step::Incomplete => {
                    if buf.len() - i > MAX_PENDING {
                        flush(&mut data, &mut actions);
                        actions.push(EscapeAction::Invalid("escape sequence too long".into()));
                        return actions;
                    }
                    self.pending = buf[i..].to_vec();
                    break;
                }
                Step::Done(next, None) => {
                    data.extend_from_slice(&buf[i..next]);
                    i = next;
                }
                Step::Done(next, Some(EscapeAction::Data(bytes))) => {
                    data.extend_from_slice(&bytes);
                    i = next;
                }
                Step::Done(next, Some(action)) => {
                    flush(&mut data, &mut actions);
                    let invalid = matches!(action, EscapeAction::Invalid(_));
                    actions.push(action);
                    if invalid {
                        return actions;
                    }
                    i = next;
                }
            }
        }
        flush(&mut data, &mut actions);
        actions
    }

    fn escape(buf: &[u8], start: usize) -> Step {
        let Some(&cmd) = buf.get(start + 1) else {
            return Step::Incomplete;
        };
        let arg = start + 2;
        match cmd {
            ESC => Step::Done(arg, Some(EscapeAction::Data(vec![ESC]))),
            b'p' => Step::Done(arg, Some(EscapeAction::TogglePrompting)),
            b'b' | b'B' => {
                let end = skip_digits(buf, arg);
                if end == buf.len() {
                    return Step::Incomplete;
                }
                let action = std::str::from_utf8(&buf[arg..end])
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
                    .filter(|&baud| baud > 0)
                    .map_or_else(
                        || {
                            EscapeAction::Invalid(format!(
                                "invalid baud rate \"{}\"",
                                String::from_utf8_lossy(&buf[arg..end])
                            ))
                        },
                        EscapeAction::SetBaud,
                    );
                Step::Done(skip_arg_end(buf, end), Some(action))
            }
            b't' | b'T' => {
                let mut end = skip_digits(buf, arg);
                if buf.get(end) == Some(&b'.') {
                    end = skip_digits(buf, end + 1);
                }
                if end == buf.len() {
                    return Step::Incomplete;
                }
                let text = String::from_utf8_lossy(&buf[arg..end]);
                let action = match text.parse::<f64>() {
                    Ok(secs) if secs.is_finite() && secs >= 0.0 => EscapeAction::SetTimeout {
                        millis: (secs * 1000.0).round() as u64,
                        permanent: cmd == b'T',
                    },
                    _ => EscapeAction::Invalid(format!("invalid timeout \"{}\"", text)),
                };
                Step::Done(skip_arg_end(buf, end), Some(action))
            }
            _ => Step::Done(arg, None),
        }
    }
}

fn skip_digits(buf: &[u8], mut i: usize) -> usize {
    while i < buf.len() && buf[i].is_ascii_digit() {
        i += 1;
    }
    i
}

fn skip_arg_end(buf: &[u8], mut i: usize) -> usize {
    while i < buf.len() && is_arg_end(buf[i]) {
        i += 1;
    }
    i
}

fn flush(data: &mut Vec<u8>, actions: &mut Vec<EscapeAction>) {
    if !data.is_empty() {
        actions.push(EscapeAction::Data(std::mem::take(data)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(input: &[u8]) -> Vec<EscapeAction> {
        EscapeParser::new().feed(input)
    }

    #[test]
    fn test_plain_data() {
        assert_eq!(feed(b"hello\r\n"), vec![EscapeAction::Data(b"hello\r\n".to_vec())]);
        assert!(feed(b"").is_empty());
    }

    #[test]
    fn test_literal_escape() {
        assert_eq!(
            feed(b"a\x1b\x1bb"),
            vec![EscapeAction::Data(b"a\x1bb".to_vec())]
        );
    }

    #[test]
    fn test_baud() {
        assert_eq!(
            feed(b"x\x1bb19200\r\ny"),
            vec![
                EscapeAction::Data(b"x".to_vec()),
                EscapeAction::SetBaud(19200),
                EscapeAction::Data(b"y".to_vec()),
            ]
        );
        assert_eq!(feed(b"\x1bB9600 "), vec![EscapeAction::SetBaud(9600)]);
    }

    #[test]
    fn test_bad_baud_is_invalid() {
        let actions = feed(b"\x1bb\r\nmore");
        assert!(matches!(actions.as_slice(), [EscapeAction::Invalid(_)]));
        let actions = feed(b"\x1bb0 ");
        assert!(matches!(actions.as_slice(), [EscapeAction::Invalid(_)]));
    }

    #[test]
    fn test_prompting_and_timeouts() {
        assert_eq!(feed(b"\x1bp"), vec![EscapeAction::TogglePrompting]);
        assert_eq!(
            feed(b"\x1bt2.5\n"),
            vec![EscapeAction::SetTimeout {
                millis: 2500,
                permanent: false
            }]
        );
        assert_eq!(
            feed(b"\x1bT0\n"),
            vec![EscapeAction::SetTimeout {
                millis: 0,
                permanent: true
            }]
        );
        assert!(matches!(
            feed(b"\x1bt.\n").as_slice(),
            [EscapeAction::Invalid(_)]
        ));
    }

    #[test]
    fn test_unknown_escape_passes_through() {
        assert_eq!(feed(b"\x1b[A"), vec![EscapeAction::Data(b"\x1b[A".to_vec())]);
    }

    #[test]
    fn test_split_escape_is_held() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.feed(b"ab\x1b"), vec![EscapeAction::Data(b"ab".to_vec())]);
        assert_eq!(parser.pending(), b"\x1b");
        assert!(parser.feed(b"b96").is_empty());
        assert_eq!(parser.pending(), b"\x1bb96");
        assert_eq!(
            parser.feed(b"00\rz"),
            vec![EscapeAction::SetBaud(9600), EscapeAction::Data(b"z".to_vec())]
        );
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_runaway_argument() {
        let mut parser = EscapeParser::new();
        let mut input = b"\x1bb".to_vec();
        input.extend(std::iter::repeat(b'1').take(100));
        assert!(matches!(
            parser.feed(&input).as_slice(),
            [EscapeAction::Invalid(_)]
        ));
    }
}
