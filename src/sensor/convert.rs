//! Value converters applied to scanned fields.

use crate::config::{CalEntryConfig, ConverterConfig};
use crate::error::{DaqError, Result};
use crate::sample::Timetag;
use chrono::DateTime;
use std::path::Path;

fn polynomial(coefs: &[f64], x: f64) -> f64 {
    if coefs.is_empty() {
        return f64::NAN;
    }
    coefs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Calibration coefficients keyed by start of validity.
#[derive(Debug, Clone, PartialEq)]
pub struct CalTable {
    entries: Vec<(Timetag, Vec<f64>)>,
}

impl CalTable {
    /// Build from entries in any order.
    pub fn new(mut entries: Vec<(Timetag, Vec<f64>)>) -> Self {
        entries.sort_by_key(|(t, _)| *t);
        Self { entries }
    }

    /// Parse a calibration file.
    ///
    /// One record per line: an RFC 3339 time followed by whitespace-separated
    /// coefficients, constant term first. Blank lines and `#` comments are
    /// skipped.
    pub fn parse(name: &str, text: &str) -> Result<Vec<(Timetag, Vec<f64>)>> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let bad = |what: &str| {
                DaqError::configuration(name, format!("line {}: {}", lineno + 1, what))
            };
            let time = tokens
                .next()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .ok_or_else(|| bad("invalid time"))?;
            let coefs = tokens
                .map(|t| t.parse::<f64>())
                .collect::<std::result::Result<Vec<f64>, _>>()
                .map_err(|e| bad(&e.to_string()))?;
            if coefs.is_empty() {
                return Err(bad("no coefficients"));
            }
            entries.push((time.timestamp_micros(), coefs));
        }
        Ok(entries)
    }

    /// Coefficients in effect at `t`: the latest entry starting at or before
    /// `t`, or the first entry if `t` precedes them all.
    #[must_use]
    pub fn lookup(&self, t: Timetag) -> Option<&[f64]> {
        let idx = self.entries.partition_point(|(start, _)| *start <= t);
        let idx = idx.saturating_sub(1);
        self.entries.get(idx).map(|(_, c)| c.as_slice())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Converter from a scanned value to engineering units.
#[derive(Debug, Clone, PartialEq)]
pub enum Converter {
    /// `intercept + slope * x`
    Linear {
        /// Slope
        slope: f64,
        /// Intercept
        intercept: f64,
    },
    /// Polynomial, constant term first.
    Polynomial(Vec<f64>),
    /// Polynomial whose coefficients depend on the sample time.
    Calibration(CalTable),
}

impl Converter {
    /// Build from configuration, reading a calibration file if one is named.
    pub fn from_config(name: &str, config: &ConverterConfig) -> Result<Self> {
        match config {
            ConverterConfig::Linear { slope, intercept } => Ok(Converter::Linear {
                slope: *slope,
                intercept: *intercept,
            }),
            ConverterConfig::Polynomial { coefs } => {
                if coefs.is_empty() {
                    return Err(DaqError::configuration(name, "polynomial without coefficients"));
                }
                Ok(Converter::Polynomial(coefs.clone()))
            }
            ConverterConfig::Calibration { entries, file } => {
                let mut all: Vec<(Timetag, Vec<f64>)> = entries
                    .iter()
                    .map(|CalEntryConfig { time, coefs }| (time.timestamp_micros(), coefs.clone()))
                    .collect();
                if let Some(path) = file {
                    all.extend(Self::load_file(name, path)?);
                }
                if all.is_empty() {
                    return Err(DaqError::configuration(name, "calibration without entries"));
                }
                Ok(Converter::Calibration(CalTable::new(all)))
            }
        }
    }

    fn load_file(name: &str, path: &Path) -> Result<Vec<(Timetag, Vec<f64>)>> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::configuration(name, format!("{}: {}", path.display(), e))
        })?;
        CalTable::parse(&format!("{}: {}", name, path.display()), &text)
    }

    /// Convert `x` sampled at `t`.
    #[must_use]
    pub fn convert(&self, t: Timetag, x: f64) -> f64 {
        match self {
            Converter::Linear { slope, intercept } => intercept + slope * x,
            Converter::Polynomial(coefs) => polynomial(coefs, x),
            Converter::Calibration(table) => match table.lookup(t) {
                Some(coefs) => polynomial(coefs, x),
                None => f64::NAN,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DAY: i64 = 86_400 * 1_000_000;

    #[test]
    fn test_linear_and_polynomial() {
        let lin = Converter::Linear {
            slope: 2.0,
            intercept: 1.0,
        };
        assert_eq!(lin.convert(0, 3.0), 7.0);

        let poly = Converter::Polynomial(vec![1.0, 0.0, 2.0]);
        assert_eq!(poly.convert(0, 3.0), 19.0);
        assert!(Converter::Polynomial(vec![]).convert(0, 1.0).is_nan());
    }

    #[test]
    fn test_calibration_lookup() {
        let table = CalTable::new(vec![(10 * DAY, vec![0.0, 2.0]), (0, vec![0.0, 1.0])]);
        let conv = Converter::Calibration(table);
        assert_eq!(conv.convert(-DAY, 5.0), 5.0);
        assert_eq!(conv.convert(0, 5.0), 5.0);
        assert_eq!(conv.convert(10 * DAY - 1, 5.0), 5.0);
        assert_eq!(conv.convert(10 * DAY, 5.0), 10.0);
        assert_eq!(conv.convert(20 * DAY, 5.0), 10.0);
    }

    #[test]
    fn test_calibration_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# time            c0   c1").unwrap();
        writeln!(file, "2024-01-01T00:00:00Z 0.5 2.0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "2023-01-01T00:00:00Z 0.0 1.0  # older").unwrap();

        let conv = Converter::from_config(
            "T",
            &ConverterConfig::Calibration {
                entries: vec![],
                file: Some(file.path().to_path_buf()),
            },
        )
        .unwrap();
        let Converter::Calibration(table) = &conv else {
            panic!("expected calibration");
        };
        assert_eq!(table.len(), 2);

        let t2024 = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .timestamp_micros();
        assert_eq!(conv.convert(t2024, 1.0), 2.5);
    }

    #[test]
    fn test_calibration_file_errors() {
        assert!(CalTable::parse("x", "notatime 1.0").is_err());
        assert!(CalTable::parse("x", "2024-01-01T00:00:00Z").is_err());
        assert!(CalTable::parse("x", "2024-01-01T00:00:00Z 1.0 abc").is_err());
        let err = Converter::from_config(
            "x",
            &ConverterConfig::Calibration {
                entries: vec![],
                file: Some("/nonexistent/cal.dat".into()),
            },
        )
        .unwrap_err();
        assert!(!err.is_recoverable());
    }
}
