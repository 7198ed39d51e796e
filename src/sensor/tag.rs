//! Sample tags, variables and prompts.

use super::convert::Converter;
use crate::config::{PromptConfig, SampleTagConfig, SmoothingConfig, VariableConfig};
use crate::error::{DaqError, Result};
use crate::sample::Timetag;
use crate::scan::unescape;

/// A string sent to the sensor at a fixed rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// Prompt as configured, backslash sequences intact
    pub text: String,
    /// Bytes sent
    pub bytes: Vec<u8>,
    /// Prompts per second; 0 sends once after each open
    pub rate: f64,
    /// Phase offset, seconds
    pub offset: f64,
}

impl Prompt {
    /// Build from configuration.
    pub fn from_config(config: &PromptConfig) -> Self {
        Self {
            text: config.string.clone(),
            bytes: unescape(&config.string),
            rate: config.rate,
            offset: config.offset,
        }
    }

    /// Period in milliseconds, 0 for one-shot prompts.
    #[must_use]
    pub fn period_ms(&self) -> u64 {
        if self.rate <= 0.0 {
            return 0;
        }
        ((1000.0 / self.rate).round() as u64).max(1)
    }

    /// Offset in milliseconds, reduced into the period.
    #[must_use]
    pub fn offset_ms(&self) -> u64 {
        let period = self.period_ms();
        if period == 0 {
            return 0;
        }
        ((self.offset.max(0.0) * 1000.0).round() as u64) % period
    }
}

/// One scanned variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Name
    pub name: String,
    /// Units
    pub units: String,
    /// Value meaning "missing"
    pub missing_value: Option<f64>,
    /// Lowest valid value
    pub min: Option<f64>,
    /// Highest valid value
    pub max: Option<f64>,
    /// Conversion to engineering units
    pub converter: Option<Converter>,
}

impl Variable {
    /// Build from configuration; `name` prefixes errors.
    pub fn from_config(name: &str, config: &VariableConfig) -> Result<Self> {
        let converter = config
            .converter
            .as_ref()
            .map(|c| Converter::from_config(&format!("{}:{}", name, config.name), c))
            .transpose()?;
        Ok(Self {
            name: config.name.clone(),
            units: config.units.clone(),
            missing_value: config.missing_value,
            min: config.min,
            max: config.max,
            converter,
        })
    }

    /// Apply missing-value and range checks, then the converter.
    #[must_use]
    pub fn apply(&self, t: Timetag, x: f64) -> f64 {
        if x.is_nan() || self.missing_value == Some(x) {
            return f64::NAN;
        }
        if self.min.is_some_and(|min| x < min) || self.max.is_some_and(|max| x > max) {
            return f64::NAN;
        }
        match &self.converter {
            Some(conv) => conv.convert(t, x),
            None => x,
        }
    }
}

/// A group of variables reported in one message.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTag {
    /// Id of the processed samples
    pub id: u32,
    /// Expected rate, samples per second
    pub rate: f64,
    /// scanf-style format
    pub format: Option<String>,
    /// Prompt soliciting this tag's message
    pub prompt: Option<Prompt>,
    /// Time tag smoothing
    pub smoothing: Option<SmoothingConfig>,
    /// Variables in scan order
    pub variables: Vec<Variable>,
}

impl SampleTag {
    /// Build from configuration; `name` prefixes errors.
    pub fn from_config(name: &str, config: &SampleTagConfig) -> Result<Self> {
        let variables = config
            .variables
            .iter()
            .map(|v| Variable::from_config(name, v))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: config.id,
            rate: config.rate,
            format: config.format.clone(),
            prompt: config.prompt.as_ref().map(Prompt::from_config),
            smoothing: config.smoothing.clone(),
            variables,
        })
    }

    /// Check rate, prompt and smoothing parameters.
    pub fn validate(&self, name: &str) -> Result<()> {
        let ctx = format!("{} tag {}", name, self.id);
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(DaqError::configuration(ctx, format!("invalid rate {}", self.rate)));
        }
        if let Some(prompt) = &self.prompt {
            if prompt.rate.is_nan() || prompt.rate <= 0.0 {
                return Err(DaqError::configuration(
                    ctx,
                    format!("prompt rate {} must be greater than 0", prompt.rate),
                ));
            }
        }
        if let Some(smoothing) = &self.smoothing {
            if self.rate <= 0.0 {
                return Err(DaqError::configuration(
                    ctx,
                    "time tag smoothing requires a rate greater than 0",
                ));
            }
            if smoothing.period.is_zero() || smoothing.gap < 1.0 {
                return Err(DaqError::configuration(
                    ctx,
                    "smoothing needs a non-zero period and a gap of at least 1",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn var(min: Option<f64>, max: Option<f64>, missing: Option<f64>) -> Variable {
        Variable {
            name: "x".to_string(),
            units: String::new(),
            missing_value: missing,
            min,
            max,
            converter: Some(Converter::Linear {
                slope: 2.0,
                intercept: 0.0,
            }),
        }
    }

    #[test]
    fn test_variable_checks_before_conversion() {
        let v = var(Some(0.0), Some(10.0), Some(-99.0));
        assert_eq!(v.apply(0, 4.0), 8.0);
        assert!(v.apply(0, -99.0).is_nan());
        assert!(v.apply(0, 11.0).is_nan());
        assert!(v.apply(0, -1.0).is_nan());
        assert!(v.apply(0, f64::NAN).is_nan());
        // 6 converts to 12, beyond max, but the range applies to the raw value.
        assert_eq!(v.apply(0, 6.0), 12.0);
    }

    #[test]
    fn test_prompt_timing() {
        let p = Prompt::from_config(&PromptConfig {
            string: "R\\r".to_string(),
            rate: 4.0,
            offset: 1.1,
        });
        assert_eq!(p.bytes, b"R\r");
        assert_eq!(p.period_ms(), 250);
        assert_eq!(p.offset_ms(), 100);

        let once = Prompt::from_config(&PromptConfig {
            string: "INIT".to_string(),
            rate: 0.0,
            offset: 0.0,
        });
        assert_eq!(once.period_ms(), 0);
    }

    #[test]
    fn test_tag_validation() {
        let mut tag = SampleTag {
            id: 3,
            rate: 0.0,
            format: None,
            prompt: Some(Prompt::from_config(&PromptConfig {
                string: "?".to_string(),
                rate: 0.0,
                offset: 0.0,
            })),
            smoothing: None,
            variables: vec![],
        };
        assert!(tag.validate("s").is_err());

        tag.prompt = None;
        tag.smoothing = Some(SmoothingConfig {
            period: Duration::from_secs(60),
            gap: 1.5,
        });
        assert!(tag.validate("s").is_err());

        tag.rate = 1.0;
        assert!(tag.validate("s").is_ok());
    }
}
