//! Readings and samples.
//!
//! A [`Reading`] is everything the ADC measured at one instant: a timestamp in
//! milliseconds since the UNIX epoch and one [`Sample`] per enabled channel.
//! Samples carry no time of their own, so every sample in a reading shares the
//! reading's timestamp.
//!
//! Readings have four textual forms, all used on the wire or in log files:
//!
//! - list: `[time, v1, v2, ...]`
//! - CSV line: `time,v1,v2,...`
//! - whitespace line: `time v1 v2 ...`
//! - JSON: `{"reading_time": t, "channels": [..], "samples": [{"channel": c, "value": v, "unit": u}, ..]}`

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unit of a sample value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SampleUnit {
    /// Raw ADC counts.
    #[default]
    Counts,
    /// Volts, after applying the unit's calibration factor.
    Volts,
    /// Any other unit produced by an external conversion.
    Other(String),
}

impl From<String> for SampleUnit {
    fn from(value: String) -> Self {
        match value.as_str() {
            "counts" => Self::Counts,
            "volts" => Self::Volts,
            _ => Self::Other(value),
        }
    }
}

impl From<SampleUnit> for String {
    fn from(unit: SampleUnit) -> Self {
        unit.to_string()
    }
}

impl fmt::Display for SampleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counts => f.write_str("counts"),
            Self::Volts => f.write_str("volts"),
            Self::Other(unit) => f.write_str(unit),
        }
    }
}

/// One channel's value within a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Channel number.
    pub channel: u8,
    /// Measured value.
    pub value: f64,
    /// Unit of `value`.
    #[serde(default)]
    pub unit: SampleUnit,
}

impl Sample {
    /// A sample in ADC counts.
    pub fn new(channel: u8, value: f64) -> Self {
        Self {
            channel,
            value,
            unit: SampleUnit::Counts,
        }
    }

    /// A sample in the given unit.
    pub fn with_unit(channel: u8, value: f64, unit: SampleUnit) -> Self {
        Self {
            channel,
            value,
            unit,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel {} value: {}", self.channel, self.value)
    }
}

/// One sample flattened together with its reading's timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    /// Channel number.
    pub channel: u8,
    /// Measured value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: SampleUnit,
    /// Reading time, ms since epoch.
    pub timestamp: i64,
}

/// A timestamped set of channel samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ReadingRepr", into = "ReadingRepr")]
pub struct Reading {
    reading_time: i64,
    samples: Vec<Sample>,
}

/// JSON shape of a reading. The channel list duplicates the samples' channels.
#[derive(Serialize, Deserialize)]
struct ReadingRepr {
    reading_time: i64,
    channels: Vec<u8>,
    samples: Vec<Sample>,
}

impl TryFrom<ReadingRepr> for Reading {
    type Error = DaqError;

    fn try_from(repr: ReadingRepr) -> Result<Self, Self::Error> {
        if repr.channels.len() != repr.samples.len() {
            return Err(DaqError::LengthMismatch {
                channels: repr.channels.len(),
                values: repr.samples.len(),
            });
        }
        let samples = repr
            .channels
            .into_iter()
            .zip(repr.samples)
            .map(|(channel, sample)| Sample { channel, ..sample })
            .collect();
        Ok(Reading {
            reading_time: repr.reading_time,
            samples,
        })
    }
}

impl From<Reading> for ReadingRepr {
    fn from(reading: Reading) -> Self {
        ReadingRepr {
            reading_time: reading.reading_time,
            channels: reading.channels(),
            samples: reading.samples,
        }
    }
}

impl Reading {
    /// Builds a reading from parallel channel and value lists.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::LengthMismatch`] if the lists differ in length.
    pub fn new(reading_time: i64, channels: &[u8], values: &[f64]) -> AppResult<Self> {
        Self::with_unit(reading_time, channels, values, SampleUnit::Counts)
    }

    /// Builds a reading whose samples all have the given unit.
    pub fn with_unit(
        reading_time: i64,
        channels: &[u8],
        values: &[f64],
        unit: SampleUnit,
    ) -> AppResult<Self> {
        if channels.len() != values.len() {
            return Err(DaqError::LengthMismatch {
                channels: channels.len(),
                values: values.len(),
            });
        }
        let samples = channels
            .iter()
            .zip(values)
            .map(|(&channel, &value)| Sample::with_unit(channel, value, unit.clone()))
            .collect();
        Ok(Self {
            reading_time,
            samples,
        })
    }

    /// Builds a reading from already constructed samples.
    pub fn from_samples(reading_time: i64, samples: Vec<Sample>) -> Self {
        Self {
            reading_time,
            samples,
        }
    }

    /// Parses a CSV line (`time,v1,v2,...`) against a known channel list.
    pub fn from_csv_line(line: &str, channels: &[u8]) -> AppResult<Self> {
        let mut fields = line.trim().split(',');
        let time = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DaqError::Serialization("empty CSV line".to_string()))?;
        let reading_time = time
            .trim()
            .parse::<i64>()
            .map_err(|e| DaqError::Serialization(format!("bad reading time '{}': {}", time, e)))?;
        let values = fields
            .map(|field| {
                field.trim().parse::<f64>().map_err(|e| {
                    DaqError::Serialization(format!("bad sample value '{}': {}", field, e))
                })
            })
            .collect::<AppResult<Vec<f64>>>()?;
        Self::new(reading_time, channels, &values)
    }

    /// Parses the JSON form of a reading.
    pub fn from_json(json: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reading time, ms since epoch.
    pub fn reading_time(&self) -> i64 {
        self.reading_time
    }

    /// Reading time as a UTC date. Out-of-range times map to the epoch.
    pub fn reading_date(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.reading_time).unwrap_or_default()
    }

    /// Samples in channel order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Channels present in this reading.
    pub fn channels(&self) -> Vec<u8> {
        self.samples.iter().map(|s| s.channel).collect()
    }

    /// Sample values in channel order.
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    /// Whether this is driver padding: zero time and every value zero.
    pub fn is_blank(&self) -> bool {
        self.reading_time == 0 && self.samples.iter().all(|s| s.value == 0.0)
    }

    /// Replaces sample values with the output of `conversion`.
    ///
    /// Outputs are matched to samples by position; surplus samples keep their
    /// value.
    pub fn apply<F>(&mut self, conversion: F)
    where
        F: FnOnce(&[Sample]) -> Vec<f64>,
    {
        let output = conversion(&self.samples);
        for (sample, value) in self.samples.iter_mut().zip(output) {
            sample.value = value;
        }
    }

    /// Converts counts samples to volts using per-channel factors.
    ///
    /// Samples already in another unit, or on channels without a factor, are
    /// left as they are.
    pub fn convert_to_volts(&mut self, factors: &HashMap<u8, f64>) {
        for sample in &mut self.samples {
            if sample.unit != SampleUnit::Counts {
                continue;
            }
            if let Some(factor) = factors.get(&sample.channel) {
                sample.value *= factor;
                sample.unit = SampleUnit::Volts;
            }
        }
    }

    /// Copy restricted to `channels`. `None` if no sample matches.
    pub fn project(&self, channels: &[u8]) -> Option<Self> {
        let samples: Vec<Sample> = self
            .samples
            .iter()
            .filter(|s| channels.contains(&s.channel))
            .cloned()
            .collect();
        (!samples.is_empty()).then(|| Self {
            reading_time: self.reading_time,
            samples,
        })
    }

    /// Each sample as a standalone record carrying the reading time.
    pub fn per_sample_records(&self) -> impl Iterator<Item = SampleRecord> + '_ {
        self.samples.iter().map(move |s| SampleRecord {
            channel: s.channel,
            value: s.value,
            unit: s.unit.clone(),
            timestamp: self.reading_time,
        })
    }

    /// `[time, v1, v2, ...]`
    pub fn to_list(&self) -> Vec<f64> {
        std::iter::once(self.reading_time as f64)
            .chain(self.samples.iter().map(|s| s.value))
            .collect()
    }

    /// `time,v1,v2,...`
    pub fn to_csv_line(&self) -> String {
        self.join_with(",")
    }

    /// `time v1 v2 ...`
    pub fn to_whitespace_line(&self) -> String {
        self.join_with(" ")
    }

    /// JSON object form.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn join_with(&self, separator: &str) -> String {
        let mut line = self.reading_time.to_string();
        for sample in &self.samples {
            line.push_str(separator);
            line.push_str(&sample.value.to_string());
        }
        line
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv_line())
    }
}
