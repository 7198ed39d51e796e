//! scanf-style field extraction.
//!
//! A conversion string is compiled once into a [`FormatSpec`] and then
//! executed against each message. Supported conversions are
//! `%f %e %g %d %i %o %x %u %c` with an optional `*` (suppress assignment),
//! a decimal width and an `hh`/`h`/`l`/`ll`/`L` size modifier; `%%` matches
//! a literal percent sign and any whitespace in the format matches any run
//! (including none) of input whitespace.
//!
//! Every extracted value is stored as `f64`. The declared C type only governs
//! extraction: `%hd` wraps to 16 bits, `%f` rounds through `f32`, `%lf`
//! keeps full precision.
//!
//! Scanning stops at the first directive that fails to match, at the first
//! NUL byte or at the end of the message, and reports the values assigned
//! so far.

use crate::error::{DaqError, Result};

/// Conversion class of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `%f %e %g` and their upper-case forms.
    Float,
    /// `%d`
    Decimal,
    /// `%i`: base from prefix (`0x` hex, `0` octal, else decimal).
    Integer,
    /// `%o`
    Octal,
    /// `%x`
    Hex,
    /// `%u`
    Unsigned,
    /// `%c`
    Char,
}

/// Length modifier of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeModifier {
    /// none
    Default,
    /// `hh`
    Byte,
    /// `h`
    Short,
    /// `l`
    Long,
    /// `ll`
    LongLong,
    /// `L`
    LongDouble,
}

/// One compiled conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Conversion class
    pub kind: FieldKind,
    /// Length modifier
    pub size: SizeModifier,
    /// Maximum input characters, if given
    pub width: Option<usize>,
    /// `*`: matched but not assigned
    pub suppressed: bool,
}

impl Field {
    /// Size in bytes of the C type this field would be stored in.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        match (self.kind, self.size) {
            (FieldKind::Char, _) => 1,
            (FieldKind::Float, SizeModifier::Long) => 8,
            (FieldKind::Float, SizeModifier::LongDouble | SizeModifier::LongLong) => 16,
            (FieldKind::Float, _) => 4,
            (_, SizeModifier::Byte) => 1,
            (_, SizeModifier::Short) => 2,
            (_, SizeModifier::Long | SizeModifier::LongLong | SizeModifier::LongDouble) => 8,
            (_, SizeModifier::Default) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Space,
    Literal(u8),
    Percent,
    Convert(Field),
}

/// A compiled conversion string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    directives: Vec<Directive>,
    fields: Vec<Field>,
}

fn format_error(format: &str, offset: usize, message: impl Into<String>) -> DaqError {
    DaqError::Format {
        format: format.to_string(),
        offset,
        message: message.into(),
    }
}

impl FormatSpec {
    /// Compile `bytes`. `display` is used in error messages.
    pub fn compile(bytes: &[u8], display: &str) -> Result<Self> {
        let mut directives = Vec::new();
        let mut fields = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            if b.is_ascii_whitespace() {
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                directives.push(Directive::Space);
                continue;
            }
            if b != b'%' {
                directives.push(Directive::Literal(b));
                i += 1;
                continue;
            }

            let start = i;
            i += 1;
            if i == bytes.len() {
                return Err(format_error(display, start, "dangling '%'"));
            }
            if bytes[i] == b'%' {
                directives.push(Directive::Percent);
                i += 1;
                continue;
            }

            let suppressed = bytes[i] == b'*';
            if suppressed {
                i += 1;
            }

            let mut width = None;
            if i < bytes.len() && bytes[i].is_ascii_digit() {
                let mut w: usize = 0;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    w = w.saturating_mul(10).saturating_add(usize::from(bytes[i] - b'0'));
                    i += 1;
                }
                if w == 0 {
                    return Err(format_error(display, start, "zero field width"));
                }
                width = Some(w);
            }

            let mut size = SizeModifier::Default;
            if i < bytes.len() {
                match bytes[i] {
                    b'h' if bytes.get(i + 1) == Some(&b'h') => {
                        size = SizeModifier::Byte;
                        i += 2;
                    }
                    b'h' => {
                        size = SizeModifier::Short;
                        i += 1;
                    }
                    b'l' if bytes.get(i + 1) == Some(&b'l') => {
                        size = SizeModifier::LongLong;
                        i += 2;
                    }
                    b'l' | b'j' | b'z' | b't' => {
                        size = SizeModifier::Long;
                        i += 1;
                    }
                    b'L' | b'q' => {
                        size = SizeModifier::LongDouble;
                        i += 1;
                    }
                    _ => {}
                }
            }

            let Some(&conv) = bytes.get(i) else {
                let message = if size == SizeModifier::Default {
                    "incomplete conversion"
                } else {
                    "missing conversion after size modifier"
                };
                return Err(format_error(display, start, message));
            };
            let kind = match conv {
                b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => FieldKind::Float,
                b'd' => FieldKind::Decimal,
                b'i' => FieldKind::Integer,
                b'o' => FieldKind::Octal,
                b'x' | b'X' => FieldKind::Hex,
                b'u' => FieldKind::Unsigned,
                b'c' => FieldKind::Char,
                other => {
                    return Err(format_error(
                        display,
                        i,
                        format!("unknown conversion '{}'", other as char),
                    ))
                }
            };
            i += 1;

            // ll/L on an integer behave the same.
            if kind != FieldKind::Float && size == SizeModifier::LongDouble {
                size = SizeModifier::LongLong;
            }

            let field = Field {
                kind,
                size,
                width,
                suppressed,
            };
            if !suppressed {
                fields.push(field);
            }
            directives.push(Directive::Convert(field));
        }

        Ok(Self { directives, fields })
    }

    /// Assigned (non-suppressed) fields, in order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of assigned fields.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Execute against `msg`, returning the assigned values.
    #[must_use]
    pub fn scan(&self, msg: &[u8]) -> Vec<f64> {
        let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
        let s = &msg[..end];
        let mut pos = 0;
        let mut out = Vec::with_capacity(self.fields.len());

        for directive in &self.directives {
            match directive {
                Directive::Space => pos = skip_space(s, pos),
                Directive::Literal(c) => {
                    if s.get(pos) != Some(c) {
                        break;
                    }
                    pos += 1;
                }
                Directive::Percent => {
                    pos = skip_space(s, pos);
                    if s.get(pos) != Some(&b'%') {
                        break;
                    }
                    pos += 1;
                }
                Directive::Convert(field) => {
                    if field.kind != FieldKind::Char {
                        pos = skip_space(s, pos);
                    }
                    if pos >= s.len() {
                        break;
                    }
                    let limit = match field.width {
                        Some(w) => (pos + w).min(s.len()),
                        None if field.kind == FieldKind::Char => pos + 1,
                        None => s.len(),
                    };
                    let Some((value, used)) = convert(field, &s[pos..limit]) else {
                        break;
                    };
                    pos += used;
                    if !field.suppressed {
                        out.push(value);
                    }
                }
            }
        }
        out
    }
}

fn skip_space(s: &[u8], mut pos: usize) -> usize {
    while pos < s.len() && s[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

fn convert(field: &Field, s: &[u8]) -> Option<(f64, usize)> {
    match field.kind {
        FieldKind::Char => Some((f64::from(s[0]), s.len())),
        FieldKind::Float => {
            let (text, used) = parse_float(s)?;
            let v = match field.size {
                SizeModifier::Long | SizeModifier::LongLong | SizeModifier::LongDouble => {
                    text.parse::<f64>().ok()?
                }
                _ => f64::from(text.parse::<f32>().ok()?),
            };
            Some((v, used))
        }
        FieldKind::Decimal | FieldKind::Integer => {
            let radix = if field.kind == FieldKind::Decimal { 10 } else { 0 };
            let (neg, mag, used) = parse_int(s, radix)?;
            let mag = mag.min(i128::MAX as u128) as i128;
            let v = if neg { -mag } else { mag };
            let v = match field.size {
                SizeModifier::Byte => f64::from(v as i8),
                SizeModifier::Short => f64::from(v as i16),
                SizeModifier::Default => f64::from(v as i32),
                _ => (v as i64) as f64,
            };
            Some((v, used))
        }
        FieldKind::Octal | FieldKind::Hex | FieldKind::Unsigned => {
            let radix = match field.kind {
                FieldKind::Octal => 8,
                FieldKind::Hex => 16,
                _ => 10,
            };
            let (neg, mag, used) = parse_int(s, radix)?;
            let v = if neg { mag.wrapping_neg() } else { mag };
            let v = match field.size {
                SizeModifier::Byte => f64::from(v as u8),
                SizeModifier::Short => f64::from(v as u16),
                SizeModifier::Default => f64::from(v as u32),
                _ => (v as u64) as f64,
            };
            Some((v, used))
        }
    }
}

fn digit_value(b: u8, radix: u32) -> Option<u32> {
    (b as char).to_digit(radix)
}

/// Parse an integer with optional sign. `radix == 0` selects the base from
/// the prefix. Returns (negative, magnitude, bytes consumed).
fn parse_int(s: &[u8], radix: u32) -> Option<(bool, u128, usize)> {
    let mut i = 0;
    let mut neg = false;
    if let Some(&c) = s.first() {
        if c == b'+' || c == b'-' {
            neg = c == b'-';
            i += 1;
        }
    }

    let has_hex_prefix = |i: usize| {
        s.get(i) == Some(&b'0')
            && matches!(s.get(i + 1), Some(b'x') | Some(b'X'))
            && s.get(i + 2).is_some_and(|b| b.is_ascii_hexdigit())
    };

    let radix = match radix {
        0 if has_hex_prefix(i) => {
            i += 2;
            16
        }
        0 if s.get(i) == Some(&b'0') => 8,
        0 => 10,
        16 if has_hex_prefix(i) => {
            i += 2;
            16
        }
        r => r,
    };

    let start = i;
    let mut mag: u128 = 0;
    while let Some(d) = s.get(i).and_then(|&b| digit_value(b, radix)) {
        mag = mag
            .saturating_mul(u128::from(radix))
            .saturating_add(u128::from(d));
        i += 1;
    }
    if i == start {
        return None;
    }
    Some((neg, mag, i))
}

fn starts_with_ignore_case(s: &[u8], word: &[u8]) -> bool {
    s.len() >= word.len() && s[..word.len()].eq_ignore_ascii_case(word)
}

/// Find the longest float prefix of `s`, returned normalized for `str::parse`.
fn parse_float(s: &[u8]) -> Option<(String, usize)> {
    let mut i = 0;
    let mut neg = false;
    if let Some(&c) = s.first() {
        if c == b'+' || c == b'-' {
            neg = c == b'-';
            i += 1;
        }
    }
    let sign = if neg { "-" } else { "" };

    let rest = &s[i..];
    if starts_with_ignore_case(rest, b"nan") {
        return Some(("NaN".to_string(), i + 3));
    }
    if starts_with_ignore_case(rest, b"infinity") {
        return Some((format!("{}inf", sign), i + 8));
    }
    if starts_with_ignore_case(rest, b"inf") {
        return Some((format!("{}inf", sign), i + 3));
    }

    let int_start = i;
    while s.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    let int_digits = &s[int_start..i];

    let mut frac_digits: &[u8] = &[];
    if s.get(i) == Some(&b'.') {
        let frac_start = i + 1;
        let mut j = frac_start;
        while s.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        if int_digits.is_empty() && j == frac_start {
            return None;
        }
        frac_digits = &s[frac_start..j];
        i = j;
    } else if int_digits.is_empty() {
        return None;
    }

    let mut exp_digits: &[u8] = &[];
    let mut exp_neg = false;
    if matches!(s.get(i), Some(b'e') | Some(b'E')) {
        let mut j = i + 1;
        if matches!(s.get(j), Some(b'+') | Some(b'-')) {
            exp_neg = s[j] == b'-';
            j += 1;
        }
        let exp_start = j;
        while s.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        if j > exp_start {
            exp_digits = &s[exp_start..j];
            i = j;
        }
    }

    let mut text = String::with_capacity(i + 4);
    if neg {
        text.push('-');
    }
    text.push_str(std::str::from_utf8(int_digits).ok()?);
    if int_digits.is_empty() {
        text.push('0');
    }
    if !frac_digits.is_empty() {
        text.push('.');
        text.push_str(std::str::from_utf8(frac_digits).ok()?);
    }
    if !exp_digits.is_empty() {
        text.push('e');
        if exp_neg {
            text.push('-');
        }
        text.push_str(std::str::from_utf8(exp_digits).ok()?);
    }
    Some((text, i))
}

/// A compiled format ready to scan messages.
#[derive(Debug, Clone)]
pub struct FormatScanner {
    format: String,
    spec: FormatSpec,
}

impl FormatScanner {
    /// Expand backslash sequences in `format` and compile it.
    pub fn new(format: &str) -> Result<Self> {
        let bytes = super::unescape(format);
        let spec = FormatSpec::compile(&bytes, format)?;
        Ok(Self {
            format: format.to_string(),
            spec,
        })
    }

    /// The format as configured.
    #[must_use]
    pub fn format(&self) -> &str {
        &self.format
    }

    /// The compiled spec.
    #[must_use]
    pub fn spec(&self) -> &FormatSpec {
        &self.spec
    }

    /// Number of assigned fields.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.spec.num_fields()
    }

    /// Scan one message.
    #[must_use]
    pub fn scan(&self, msg: &[u8]) -> Vec<f64> {
        self.spec.scan(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scan(format: &str, msg: &str) -> Vec<f64> {
        FormatScanner::new(format).unwrap().scan(msg.as_bytes())
    }

    #[test]
    fn test_two_floats() {
        assert_eq!(scan("%f,%f", "1.5,2.5\n"), vec![1.5, 2.5]);
        assert_eq!(scan("%f,%f", "1.5\n"), vec![1.5]);
        assert!(scan("%f,%f", "abc").is_empty());
    }

    #[test]
    fn test_float_precision() {
        assert_eq!(scan("%f", "0.1")[0], f64::from(0.1f32));
        assert_eq!(scan("%lf", "0.1")[0], 0.1);
        assert_eq!(scan("%le", "-2.5e-3")[0], -2.5e-3);
        assert_eq!(scan("%lg", ".5")[0], 0.5);
        assert_eq!(scan("%lf", "7.")[0], 7.0);
        assert!(scan("%f", "nan")[0].is_nan());
        assert_eq!(scan("%f", "-inf")[0], f64::NEG_INFINITY);
        // Exponent without digits is not consumed.
        assert_eq!(scan("%lfe%d", "3e5")[0], 300000.0);
        assert_eq!(scan("%lfe%d", "3ex")[0], 3.0);
    }

    #[test]
    fn test_integer_sizes() {
        assert_eq!(scan("%hd", "70000"), vec![4464.0]);
        assert_eq!(scan("%d", "-42"), vec![-42.0]);
        assert_eq!(scan("%hhd", "300"), vec![44.0]);
        assert_eq!(scan("%ld", "5000000000"), vec![5_000_000_000.0]);
        assert_eq!(scan("%u", "-1"), vec![f64::from(u32::MAX)]);
        assert_eq!(scan("%hu", "65537"), vec![1.0]);
    }

    #[test]
    fn test_integer_bases() {
        assert_eq!(scan("%x", "ff"), vec![255.0]);
        assert_eq!(scan("%x", "0x1F"), vec![31.0]);
        assert_eq!(scan("%o", "17"), vec![15.0]);
        assert_eq!(scan("%i", "0x1F"), vec![31.0]);
        assert_eq!(scan("%i", "017"), vec![15.0]);
        assert_eq!(scan("%i", "17"), vec![17.0]);
        assert_eq!(scan("%i", "0"), vec![0.0]);
    }

    #[test]
    fn test_width_and_suppression() {
        assert_eq!(scan("%2d%3d", "12345"), vec![12.0, 345.0]);
        assert_eq!(scan("%*d,%f", "7,1.25"), vec![1.25]);
        assert_eq!(scan("%3f", "1.2345"), vec![f64::from(1.2f32)]);
    }

    #[test]
    fn test_literals_and_whitespace() {
        assert_eq!(scan("A%d", "A42\n"), vec![42.0]);
        assert!(scan("A%d", "B42").is_empty());
        assert_eq!(scan("T= %f", "T=   3.5"), vec![3.5]);
        assert_eq!(scan("%d %d", "1\t\t2"), vec![1.0, 2.0]);
        assert_eq!(scan("%d%%", "50%"), vec![50.0]);
        assert_eq!(scan("%d %c", "1 Z"), vec![1.0, f64::from(b'Z')]);
    }

    #[test]
    fn test_stops_at_nul() {
        let sc = FormatScanner::new("%f,%f").unwrap();
        assert_eq!(sc.scan(b"1.5\0,2.5"), vec![1.5]);
        assert_eq!(sc.scan(b"1.5,2.5\n\0"), vec![1.5, 2.5]);
    }

    #[test]
    fn test_backslash_in_format() {
        let sc = FormatScanner::new("\\x02%d\\x03").unwrap();
        assert_eq!(sc.scan(b"\x0299\x03"), vec![99.0]);
    }

    #[test]
    fn test_compile_errors() {
        for bad in ["%q", "abc%", "%0d", "%l", "%5", "%s", "%[a]", "%*"] {
            let err = FormatScanner::new(bad).unwrap_err();
            assert!(
                matches!(err, DaqError::Format { .. }),
                "{} gave {:?}",
                bad,
                err
            );
            assert!(!err.is_recoverable());
        }
    }

    #[test]
    fn test_field_list() {
        let sc = FormatScanner::new("%*d %5lf %hx %c").unwrap();
        let fields = sc.spec().fields();
        assert_eq!(sc.num_fields(), 3);
        assert_eq!(fields[0].kind, FieldKind::Float);
        assert_eq!(fields[0].width, Some(5));
        assert_eq!(fields[0].byte_size(), 8);
        assert_eq!(fields[1].byte_size(), 2);
        assert_eq!(fields[2].byte_size(), 1);
    }

    proptest! {
        #[test]
        fn prop_scan_recovers_values(
            f in -1.0e6f32..1.0e6f32,
            d in any::<i32>(),
            x in any::<u16>(),
        ) {
            let msg = format!("{},{} {:x}\r\n", f, d, x);
            let vals = FormatScanner::new("%f,%d %hx").unwrap().scan(msg.as_bytes());
            prop_assert_eq!(vals.len(), 3);
            prop_assert_eq!(vals[0] as f32, f);
            prop_assert_eq!(vals[1], f64::from(d));
            prop_assert_eq!(vals[2], f64::from(x));
        }

        #[test]
        fn prop_never_more_values_than_fields(msg in "[0-9., a-z-]{0,40}") {
            let sc = FormatScanner::new("%f %d,%x %*f %c").unwrap();
            prop_assert!(sc.scan(msg.as_bytes()).len() <= sc.num_fields());
        }
    }
}
