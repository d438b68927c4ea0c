//! Simulated HRDL driver.
//!
//! Behaves like a single ADC-24 attached to the host: it validates settings the
//! way the unit does and, while streaming, produces one set of uniformly random
//! counts per sample interval. Time is read from an injected [`Clock`], so a
//! test can advance it by hand and know exactly how many sample sets exist.

use super::constants::{
    Channel, ConversionTime, InfoType, SampleMethod, SettingsError, UnitError, VoltageRange,
};
use super::driver::{is_valid_handle, Handle, HrdlDriver, TimesAndValues};
use crate::clock::Clock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle given to the simulated unit.
const SIM_HANDLE: Handle = 1;

/// Longest sample interval the unit accepts, in ms.
pub const MAX_SAMPLE_TIME_MS: i32 = 16_000;

/// Lowest count the simulated unit reports.
pub const MIN_COUNT: i32 = 0;

/// Highest count the simulated unit reports (24-bit converter).
pub const MAX_COUNT: i32 = (1 << 24) - 1;

/// Sample interval before `set_interval` is called, in ms.
const DEFAULT_SAMPLE_TIME_MS: i32 = 1_000;

/// In-process stand-in for the vendor library.
#[derive(Debug)]
pub struct SimulatedDriver {
    clock: Arc<dyn Clock>,
    rng: StdRng,
    handle: Option<Handle>,
    enabled: BTreeSet<i16>,
    sample_time_ms: i32,
    streaming: bool,
    stream_start: i64,
    last_generation: i64,
    buffer: VecDeque<(i32, Vec<i32>)>,
    settings_error: SettingsError,
}

impl SimulatedDriver {
    /// Creates a driver with an entropy-seeded generator.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(clock, StdRng::from_entropy())
    }

    /// Creates a driver whose sample values are reproducible.
    pub fn with_seed(clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::with_rng(clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        warn!("Simulated PicoLog ADC-24 driver in use");
        Self {
            clock,
            rng,
            handle: None,
            enabled: BTreeSet::new(),
            sample_time_ms: DEFAULT_SAMPLE_TIME_MS,
            streaming: false,
            stream_start: 0,
            last_generation: 0,
            buffer: VecDeque::new(),
            settings_error: SettingsError::Ok,
        }
    }

    fn owns(&self, handle: Handle) -> bool {
        is_valid_handle(handle) && self.handle == Some(handle)
    }

    fn reject(&mut self, error: SettingsError) -> bool {
        debug!(?error, "Simulated unit rejected setting");
        self.settings_error = error;
        false
    }

    /// Buffers one sample set per full interval elapsed since the last call.
    fn generate_samples(&mut self) {
        let now = self.clock.now_millis();
        let interval = i64::from(self.sample_time_ms);
        let elapsed = now - self.last_generation;
        let count = elapsed / interval;
        if count <= 0 {
            return;
        }

        let start_offset = self.last_generation - self.stream_start;
        let channels = self.enabled.len();
        for t in 0..count {
            let time = start_offset + interval * t;
            let values = (0..channels)
                .map(|_| self.rng.gen_range(MIN_COUNT..=MAX_COUNT))
                .collect();
            self.buffer
                .push_back((i32::try_from(time).unwrap_or(i32::MAX), values));
        }

        self.last_generation += count * interval;
    }
}

impl HrdlDriver for SimulatedDriver {
    fn open_unit(&mut self) -> Handle {
        self.handle = Some(SIM_HANDLE);
        SIM_HANDLE
    }

    fn close_unit(&mut self, handle: Handle) -> bool {
        if !self.owns(handle) {
            return false;
        }
        self.handle = None;
        self.streaming = false;
        self.buffer.clear();
        self.enabled.clear();
        true
    }

    fn ready(&mut self, handle: Handle) -> bool {
        if !self.owns(handle) || !self.streaming {
            return false;
        }
        self.generate_samples();
        !self.buffer.is_empty()
    }

    fn unit_info(&self, handle: Handle, info: InfoType) -> Option<String> {
        if !self.owns(handle) {
            return None;
        }
        // Examples from the hardware manual
        let text = match info {
            InfoType::DriverVersion => "Fake HRDL Driver, 1.0.0.0".to_string(),
            InfoType::UsbVersion => "USB 1.1".to_string(),
            InfoType::HardwareVersion => "1".to_string(),
            InfoType::VariantInfo => "24".to_string(),
            InfoType::BatchAndSerial => "CMY02/116".to_string(),
            InfoType::CalDate => "29Jul15".to_string(),
            InfoType::KernelDriverVersion => "PICOPP.SYS V1.0".to_string(),
            InfoType::Error => UnitError::Ok.code().to_string(),
            InfoType::SettingsError => self.settings_error.code().to_string(),
        };
        Some(text)
    }

    fn set_analog_in_channel(
        &mut self,
        handle: Handle,
        channel: i16,
        enabled: bool,
        range: i16,
        _input_type: i16,
    ) -> bool {
        if !self.owns(handle) {
            return false;
        }
        let valid_channel = u8::try_from(channel).ok().and_then(Channel::new);
        if valid_channel.is_none() {
            return self.reject(SettingsError::InvalidChannel);
        }
        if VoltageRange::from_code(range).is_none() {
            return self.reject(SettingsError::InvalidVoltageRange);
        }

        if enabled {
            self.enabled.insert(channel);
        } else {
            self.enabled.remove(&channel);
        }
        self.settings_error = SettingsError::Ok;
        true
    }

    fn set_interval(
        &mut self,
        handle: Handle,
        sample_interval_ms: i32,
        conversion_time: i16,
    ) -> bool {
        if !self.owns(handle) {
            return false;
        }
        let Some(conversion) = ConversionTime::from_code(conversion_time) else {
            return self.reject(SettingsError::ConversionTimeOutOfRange);
        };

        let budget = self.enabled.len() as i64 * i64::from(conversion.millis());
        if budget > i64::from(sample_interval_ms) {
            return self.reject(SettingsError::ConversionTimeTooSlow);
        }
        if sample_interval_ms <= 0 || sample_interval_ms > MAX_SAMPLE_TIME_MS {
            return self.reject(SettingsError::SampleIntervalOutOfRange);
        }

        self.sample_time_ms = sample_interval_ms;
        self.settings_error = SettingsError::Ok;
        true
    }

    fn run(&mut self, handle: Handle, n_values: i32, method: SampleMethod) -> bool {
        if !self.owns(handle) {
            return false;
        }
        if method != SampleMethod::Stream || n_values <= 0 {
            return self.reject(SettingsError::InvalidParameter);
        }

        let now = self.clock.now_millis();
        self.streaming = true;
        self.stream_start = now;
        self.last_generation = now;
        self.buffer.clear();
        self.settings_error = SettingsError::Ok;
        true
    }

    fn times_and_values(
        &mut self,
        handle: Handle,
        samples_per_channel: usize,
    ) -> Option<TimesAndValues> {
        if !self.owns(handle) || self.buffer.is_empty() || samples_per_channel == 0 {
            return None;
        }

        let count = samples_per_channel.min(self.buffer.len());
        let mut payload = TimesAndValues::default();
        for (time, values) in self.buffer.drain(..count) {
            payload.times.push(time);
            payload.values.extend(values);
        }
        Some(payload)
    }

    fn enabled_channel_count(&self, handle: Handle) -> Option<i16> {
        self.owns(handle)
            .then(|| i16::try_from(self.enabled.len()).unwrap_or(i16::MAX))
    }

    fn min_max_adc_counts(&self, handle: Handle, channel: i16) -> Option<(i32, i32)> {
        let valid_channel = u8::try_from(channel).ok().and_then(Channel::new);
        (self.owns(handle) && valid_channel.is_some()).then_some((MIN_COUNT, MAX_COUNT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn driver() -> (SimulatedDriver, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (SimulatedDriver::with_seed(Arc::new(clock.clone()), 7), clock)
    }

    #[test]
    fn rejects_invalid_channel_and_range() {
        let (mut drv, _) = driver();
        let h = drv.open_unit();
        assert!(!drv.set_analog_in_channel(h, 17, true, 0, 1));
        assert_eq!(
            drv.unit_info(h, InfoType::SettingsError).as_deref(),
            Some("4")
        );
        assert!(!drv.set_analog_in_channel(h, 1, true, 9, 1));
        assert_eq!(
            drv.unit_info(h, InfoType::SettingsError).as_deref(),
            Some("5")
        );
        assert!(drv.set_analog_in_channel(h, 1, true, 0, 1));
        assert_eq!(
            drv.unit_info(h, InfoType::SettingsError).as_deref(),
            Some("9")
        );
    }

    #[test]
    fn conversion_budget_is_enforced() {
        let (mut drv, _) = driver();
        let h = drv.open_unit();
        for ch in 1..=4 {
            assert!(drv.set_analog_in_channel(h, ch, true, 0, 1));
        }
        // 4 channels x 660 ms > 1000 ms
        assert!(!drv.set_interval(h, 1_000, ConversionTime::Time660ms.code()));
        assert_eq!(drv.settings_error, SettingsError::ConversionTimeTooSlow);
        assert!(!drv.set_interval(h, 20_000, 0));
        assert_eq!(drv.settings_error, SettingsError::SampleIntervalOutOfRange);
        assert!(drv.set_interval(h, 1_000, 0));
    }

    #[test]
    fn only_stream_method_is_supported() {
        let (mut drv, _) = driver();
        let h = drv.open_unit();
        assert!(!drv.run(h, 1_000, SampleMethod::Block));
        assert_eq!(drv.settings_error, SettingsError::InvalidParameter);
        assert!(drv.run(h, 1_000, SampleMethod::Stream));
    }

    #[test]
    fn generates_one_set_per_interval() {
        let (mut drv, clock) = driver();
        let h = drv.open_unit();
        assert!(drv.set_analog_in_channel(h, 1, true, 0, 1));
        assert!(drv.set_analog_in_channel(h, 3, true, 0, 1));
        // 2 channels x 60 ms fits in 200 ms
        assert!(drv.set_interval(h, 200, 0));
        assert!(drv.run(h, 1_000, SampleMethod::Stream));

        assert!(!drv.ready(h));
        clock.advance(700);
        assert!(drv.ready(h));

        let payload = drv.times_and_values(h, 10).unwrap();
        assert_eq!(payload.times, vec![0, 200, 400]);
        assert_eq!(payload.values.len(), 6);
        assert!(payload
            .values
            .iter()
            .all(|v| (MIN_COUNT..=MAX_COUNT).contains(v)));

        // remainder of the partial interval carries over
        clock.advance(100);
        assert!(drv.ready(h));
        let payload = drv.times_and_values(h, 10).unwrap();
        assert_eq!(payload.times, vec![600]);
        assert!(drv.times_and_values(h, 10).is_none());
    }

    #[test]
    fn drains_at_most_requested_sets() {
        let (mut drv, clock) = driver();
        let h = drv.open_unit();
        assert!(drv.set_analog_in_channel(h, 2, true, 0, 1));
        assert!(drv.set_interval(h, 100, 0));
        assert!(drv.run(h, 1_000, SampleMethod::Stream));
        clock.advance(1_000);
        assert!(drv.ready(h));
        assert_eq!(drv.times_and_values(h, 4).unwrap().times.len(), 4);
        assert_eq!(drv.times_and_values(h, 100).unwrap().times.len(), 6);
    }

    #[test]
    fn closed_handle_is_invalid() {
        let (mut drv, _) = driver();
        let h = drv.open_unit();
        assert!(drv.close_unit(h));
        assert!(!drv.close_unit(h));
        assert!(drv.unit_info(h, InfoType::DriverVersion).is_none());
        assert!(drv.enabled_channel_count(h).is_none());
    }
}
