//! PicoLog ADC-24 device wrapper.
//!
//! Turns the driver's status booleans and error-code queries into
//! [`DaqError`] values, tracks which channels are enabled and on which range,
//! and converts raw sample buffers into [`Reading`]s stamped with wall-clock
//! time.

use super::hrdl::constants::{
    Channel, ConversionTime, InfoType, InputType, SampleMethod, SettingsError, UnitError,
    VoltageRange,
};
use super::hrdl::driver::{HANDLE_UNIT_NOT_FOUND, HANDLE_UNIT_NOT_OPENED};
use super::hrdl::{is_valid_handle, Handle, HrdlDriver};
use super::Adc;
use crate::clock::Clock;
use crate::config::{DeviceConfig, OutputUnit};
use crate::data::{Reading, SampleUnit};
use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Number of analog inputs on the unit.
pub const NUM_CHANNELS: usize = 16;

/// Values collected per poll before `configure` sets one.
const DEFAULT_SAMPLE_BUF_LEN: usize = 1000;

/// A PicoLog ADC-24 reached through driver `D`.
#[derive(Debug)]
pub struct PicoLogAdc24<D: HrdlDriver> {
    driver: D,
    clock: Arc<dyn Clock>,
    handle: Option<Handle>,
    sample_buf_len: usize,
    output_unit: OutputUnit,
    channel_ranges: BTreeMap<u8, VoltageRange>,
    channel_types: BTreeMap<u8, InputType>,
    stream_start_timestamp: Option<i64>,
    sample_time: Option<u32>,
}

impl<D: HrdlDriver> PicoLogAdc24<D> {
    /// Wraps `driver`; no unit is opened yet.
    pub fn new(driver: D, clock: Arc<dyn Clock>) -> Self {
        Self {
            driver,
            clock,
            handle: None,
            sample_buf_len: DEFAULT_SAMPLE_BUF_LEN,
            output_unit: OutputUnit::Counts,
            channel_ranges: BTreeMap::new(),
            channel_types: BTreeMap::new(),
            stream_start_timestamp: None,
            sample_time: None,
        }
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn handle(&self) -> AppResult<Handle> {
        self.handle.ok_or(DaqError::UnitNotOpen)
    }

    /// Configures one analog input.
    ///
    /// A differential input can only be set on the odd (primary) channel of a
    /// pair; setting it on an even channel is passed to the unit with a warning.
    pub fn set_analog_in_channel(
        &mut self,
        channel: Channel,
        enabled: bool,
        range: VoltageRange,
        input_type: InputType,
    ) -> AppResult<()> {
        let handle = self.handle()?;

        if input_type == InputType::Differential && !channel.is_primary() {
            warn!(
                channel = channel.number(),
                "Setting a differential input on a secondary channel is not possible. \
                 Instead set the input on the primary channel number."
            );
        }

        let ok = self.driver.set_analog_in_channel(
            handle,
            i16::from(channel.number()),
            enabled,
            range.code(),
            input_type.code(),
        );
        if !ok {
            self.check_settings_error()?;
            return Err(DaqError::Device(format!(
                "setting channel {} failed",
                channel
            )));
        }

        let number = channel.number();
        if enabled {
            self.channel_ranges.insert(number, range);
            self.channel_types.insert(number, input_type);
        } else {
            self.channel_ranges.remove(&number);
            self.channel_types.remove(&number);
        }

        debug!(
            channel = number,
            enabled,
            ?range,
            ?input_type,
            "Analog input channel set"
        );
        Ok(())
    }

    /// Sets the time the unit has to sample every enabled channel.
    ///
    /// `sample_time_ms` must leave room for each enabled channel to convert in
    /// turn: `sample_time_ms >= conversion_time × enabled channels`.
    pub fn set_sample_time(
        &mut self,
        sample_time_ms: u32,
        conversion_time: ConversionTime,
    ) -> AppResult<()> {
        let handle = self.handle()?;
        let interval = i32::try_from(sample_time_ms).map_err(|_| {
            DaqError::Settings(SettingsError::SampleIntervalOutOfRange)
        })?;

        if !self
            .driver
            .set_interval(handle, interval, conversion_time.code())
        {
            self.check_settings_error()?;
            return Err(DaqError::Device("setting sample time failed".to_string()));
        }

        self.sample_time = Some(sample_time_ms);
        debug!(
            sample_time_ms,
            conversion_time_ms = conversion_time.millis(),
            "Sample time set"
        );
        Ok(())
    }

    fn run(&mut self, method: SampleMethod) -> AppResult<()> {
        let handle = self.handle()?;
        let n_values = i32::try_from(self.sample_buf_len).unwrap_or(i32::MAX);
        if !self.driver.run(handle, n_values, method) {
            self.check_unit_error()?;
            self.check_settings_error()?;
            return Err(DaqError::Device(format!("run ({:?}) failed", method)));
        }
        Ok(())
    }

    /// Last unit error code.
    pub fn last_error(&self) -> AppResult<UnitError> {
        let code = self.unit_info_code(InfoType::Error)?;
        UnitError::from_code(code)
            .ok_or_else(|| DaqError::Device(format!("unknown unit error code {}", code)))
    }

    /// Last settings error code.
    pub fn last_settings_error(&self) -> AppResult<SettingsError> {
        let code = self.unit_info_code(InfoType::SettingsError)?;
        SettingsError::from_code(code)
            .ok_or_else(|| DaqError::Device(format!("unknown settings error code {}", code)))
    }

    fn unit_info_code(&self, info: InfoType) -> AppResult<i16> {
        let text = self.unit_info(info)?;
        text.trim()
            .parse()
            .map_err(|_| DaqError::Device(format!("{} is not a code: '{}'", info.label(), text)))
    }

    /// Fails with the unit's last error, if it reports one.
    pub fn check_unit_error(&self) -> AppResult<()> {
        debug!("Checking for error");
        match self.last_error()? {
            error if error.is_error() => Err(DaqError::UnitError(error)),
            _ => Ok(()),
        }
    }

    /// Fails with the unit's last settings error, if it reports one.
    pub fn check_settings_error(&self) -> AppResult<()> {
        debug!("Checking for settings error");
        match self.last_settings_error()? {
            error if error.is_error() => Err(DaqError::Settings(error)),
            _ => Ok(()),
        }
    }

    /// Number of channels the unit reports as enabled.
    pub fn enabled_channel_count(&self) -> AppResult<usize> {
        let handle = self.handle()?;
        let count = self
            .driver
            .enabled_channel_count(handle)
            .ok_or_else(|| DaqError::Device("Invalid handle passed to unit".to_string()))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Minimum and maximum counts the unit reports for `channel`.
    pub fn min_max_adc_counts(&self, channel: u8) -> AppResult<(i32, i32)> {
        let handle = self.handle()?;
        debug!(channel, "Fetching min/max ADC counts");
        self.driver
            .min_max_adc_counts(handle, i16::from(channel))
            .ok_or_else(|| DaqError::Device("Invalid handle passed to unit".to_string()))
    }

    /// Maximum input voltage of an enabled channel.
    pub fn channel_max_voltage(&self, channel: u8) -> AppResult<f64> {
        self.channel_ranges
            .get(&channel)
            .map(|range| range.max_voltage())
            .ok_or_else(|| DaqError::Device(format!("channel {} is not enabled", channel)))
    }

    /// Volts per count: the range's maximum voltage over the maximum count.
    pub fn calibration(&self, channel: u8) -> AppResult<f64> {
        let max_voltage = self.channel_max_voltage(channel)?;
        let (_, max_counts) = self.min_max_adc_counts(channel)?;
        if max_counts <= 0 {
            return Err(DaqError::Device(format!(
                "unit reported no positive count range for channel {}",
                channel
            )));
        }
        Ok(max_voltage / f64::from(max_counts))
    }

    /// Converts a raw count on `channel` to volts.
    pub fn counts_to_volts(&self, channel: u8, counts: i32) -> AppResult<f64> {
        Ok(f64::from(counts) * self.calibration(channel)?)
    }

    /// Collects waiting sample sets as `(ms since stream start, values)`.
    ///
    /// Each call asks for `sample_buf_len / enabled channels` sets. The first
    /// time may be zero; any later zero time is buffer padding and ends the
    /// payload.
    fn get_payload(&mut self) -> AppResult<Vec<(i32, Vec<i32>)>> {
        let handle = self.handle()?;
        let channel_count = self.channel_ranges.len();
        if channel_count == 0 {
            return Err(DaqError::Device("no channels enabled".to_string()));
        }
        let samples_per_channel = (self.sample_buf_len / channel_count).max(1);

        let raw = self
            .driver
            .times_and_values(handle, samples_per_channel)
            .ok_or_else(|| DaqError::Device("Call failed or no values available".to_string()))?;
        if raw.overflow != 0 {
            warn!(overflow = raw.overflow, "Input over range on one or more channels");
        }

        let mut payload = Vec::with_capacity(raw.times.len());
        for (i, &time) in raw.times.iter().enumerate() {
            if i > 0 && time == 0 {
                break;
            }
            let start = i * channel_count;
            let Some(values) = raw.values.get(start..start + channel_count) else {
                break;
            };
            payload.push((time, values.to_vec()));
        }
        Ok(payload)
    }
}

impl<D: HrdlDriver> Adc for PicoLogAdc24<D> {
    fn open(&mut self) -> AppResult<()> {
        if self.handle.is_some() {
            return Err(DaqError::UnitAlreadyOpen);
        }

        let handle = self.driver.open_unit();
        if !is_valid_handle(handle) {
            return Err(match handle {
                HANDLE_UNIT_NOT_FOUND => DaqError::UnitNotFound,
                HANDLE_UNIT_NOT_OPENED => DaqError::UnitNotOpened,
                other => DaqError::Device(format!("unknown invalid handle status {}", other)),
            });
        }

        self.handle = Some(handle);
        info!(handle, "Unit opened");
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        let handle = self.handle()?;
        if !self.driver.close_unit(handle) {
            return Err(DaqError::Device("Invalid handle passed to unit".to_string()));
        }
        self.handle = None;
        self.stream_start_timestamp = None;
        self.channel_ranges.clear();
        self.channel_types.clear();
        info!("Unit closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn configure(&mut self, device: &DeviceConfig) -> AppResult<()> {
        self.sample_buf_len = device.sample_buf_len;
        self.output_unit = device.output_unit;
        self.set_sample_time(device.sample_time_ms, device.conversion_time)?;
        for channel in &device.channels {
            self.set_analog_in_channel(channel.number, true, channel.range, channel.input_type)?;
        }
        info!(
            channels = ?self.enabled_channels(),
            sample_time_ms = device.sample_time_ms,
            "Unit configured"
        );
        Ok(())
    }

    fn stream(&mut self) -> AppResult<()> {
        info!("Starting unit streaming");
        self.run(SampleMethod::Stream)?;
        self.stream_start_timestamp = Some(self.clock.now_millis());
        Ok(())
    }

    fn ready(&mut self) -> bool {
        match self.handle {
            Some(handle) => self.driver.ready(handle),
            None => false,
        }
    }

    fn get_readings(&mut self) -> AppResult<Vec<Reading>> {
        let stream_start = self
            .stream_start_timestamp
            .ok_or_else(|| DaqError::Device("unit is not streaming".to_string()))?;
        let payload = self.get_payload()?;
        let channels = self.enabled_channels();

        let (factors, unit) = match self.output_unit {
            OutputUnit::Counts => (vec![1.0; channels.len()], SampleUnit::Counts),
            OutputUnit::Volts => (
                channels
                    .iter()
                    .map(|&c| self.calibration(c))
                    .collect::<AppResult<Vec<f64>>>()?,
                SampleUnit::Volts,
            ),
        };

        payload
            .into_iter()
            .map(|(time, counts)| {
                let values: Vec<f64> = counts
                    .iter()
                    .zip(&factors)
                    .map(|(&count, factor)| f64::from(count) * factor)
                    .collect();
                Reading::with_unit(
                    stream_start + i64::from(time),
                    &channels,
                    &values,
                    unit.clone(),
                )
            })
            .collect()
    }

    fn unit_info(&self, info: InfoType) -> AppResult<String> {
        let handle = self.handle()?;
        self.driver.unit_info(handle, info).ok_or_else(|| {
            DaqError::Device("Info type out of range or null message pointer".to_string())
        })
    }

    fn stream_start_timestamp(&self) -> Option<i64> {
        self.stream_start_timestamp
    }

    fn sample_time(&self) -> Option<u32> {
        self.sample_time
    }

    fn enabled_channels(&self) -> Vec<u8> {
        self.channel_ranges.keys().copied().collect()
    }

    fn volts_conversion(&self, channel: u8) -> AppResult<f64> {
        self.calibration(channel)
    }
}
