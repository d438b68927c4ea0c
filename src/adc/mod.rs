//! ADC devices.
//!
//! [`Adc`] is the interface the poll loop drives: open, configure, stream, then
//! repeatedly check [`Adc::ready`] and collect [`Adc::get_readings`]. The calls
//! are synchronous because driver calls return immediately with whatever the
//! unit has buffered. The poll loop owns its device exclusively, so no locking
//! is involved.
//!
//! [`PicoLogAdc24`] implements it over any [`hrdl::HrdlDriver`]. Which driver is
//! used is chosen by [`AdcKind`] from configuration.

pub mod hrdl;
pub mod picolog;

pub use picolog::PicoLogAdc24;

use crate::clock::Clock;
use crate::config::{AdcConfig, DeviceConfig};
use crate::data::Reading;
use crate::error::{AppResult, DaqError};
use hrdl::constants::InfoType;
use hrdl::SimulatedDriver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A data acquisition unit producing timestamped multi-channel readings.
pub trait Adc: Send {
    /// Opens the unit for communication.
    fn open(&mut self) -> AppResult<()>;

    /// Closes the unit.
    fn close(&mut self) -> AppResult<()>;

    /// Whether the unit is open.
    fn is_open(&self) -> bool;

    /// Applies sample timing and channel settings.
    fn configure(&mut self, device: &DeviceConfig) -> AppResult<()>;

    /// Starts continuous sampling.
    fn stream(&mut self) -> AppResult<()>;

    /// Whether readings are waiting to be collected.
    fn ready(&mut self) -> bool;

    /// Collects waiting readings in chronological order.
    fn get_readings(&mut self) -> AppResult<Vec<Reading>>;

    /// One piece of unit information, unformatted.
    fn unit_info(&self, info: InfoType) -> AppResult<String>;

    /// Unit information prefixed with its label.
    fn formatted_unit_info(&self, info: InfoType) -> AppResult<String> {
        Ok(info.format(&self.unit_info(info)?))
    }

    /// Every piece of unit information, one labelled line each.
    fn full_unit_info(&self) -> AppResult<String> {
        let lines = InfoType::ALL
            .iter()
            .map(|&info| self.formatted_unit_info(info))
            .collect::<AppResult<Vec<String>>>()?;
        Ok(lines.join("\n"))
    }

    /// When streaming started, ms since epoch.
    fn stream_start_timestamp(&self) -> Option<i64>;

    /// Configured sample time, ms.
    fn sample_time(&self) -> Option<u32>;

    /// Enabled channels, ascending.
    fn enabled_channels(&self) -> Vec<u8>;

    /// Volts represented by one ADC count on `channel`.
    fn volts_conversion(&self, channel: u8) -> AppResult<f64>;

    /// Volts-per-count factor of every enabled channel.
    fn volts_conversions(&self) -> AppResult<BTreeMap<u8, f64>> {
        self.enabled_channels()
            .into_iter()
            .map(|channel| Ok((channel, self.volts_conversion(channel)?)))
            .collect()
    }
}

/// Unit types that can be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdcKind {
    /// PicoLog ADC-24 through the vendor library.
    #[serde(rename = "picolog24")]
    PicoLog24,
    /// PicoLog ADC-24 simulated in process.
    #[default]
    #[serde(rename = "picolog24_sim")]
    PicoLog24Sim,
}

impl AdcKind {
    /// Builds the configured unit.
    ///
    /// # Errors
    ///
    /// [`DaqError::FeatureNotEnabled`] for [`AdcKind::PicoLog24`], which needs
    /// a binding to the vendor library that this build does not provide.
    pub fn from_config(config: &AdcConfig, clock: Arc<dyn Clock>) -> AppResult<Box<dyn Adc>> {
        info!(kind = ?config.kind, "Loading ADC driver");
        match config.kind {
            AdcKind::PicoLog24Sim => {
                let driver = SimulatedDriver::new(clock.clone());
                Ok(Box::new(PicoLogAdc24::new(driver, clock)))
            }
            AdcKind::PicoLog24 => Err(DaqError::FeatureNotEnabled("vendor driver".to_string())),
        }
    }
}

/// Opens `adc`, retrying with quadratic backoff (`base_delay × attempt²`).
///
/// An already open unit is not retried.
pub async fn open_with_retry(
    adc: &mut dyn Adc,
    attempts: u32,
    base_delay: Duration,
) -> AppResult<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match adc.open() {
            Ok(()) => return Ok(()),
            Err(DaqError::UnitAlreadyOpen) => return Err(DaqError::UnitAlreadyOpen),
            Err(e) if attempt < attempts => {
                let delay = retry_delay(base_delay, attempt);
                warn!(attempt, ?delay, error = %e, "Could not open unit, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `base_delay × attempt²`, saturating at `Duration::MAX`.
fn retry_delay(base_delay: Duration, attempt: u32) -> Duration {
    attempt
        .checked_mul(attempt)
        .and_then(|factor| base_delay.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    /// Fails to open a set number of times.
    struct FlakyAdc {
        failures_left: u32,
        opens: u32,
    }

    impl Adc for FlakyAdc {
        fn open(&mut self) -> AppResult<()> {
            self.opens += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(DaqError::UnitNotOpened);
            }
            Ok(())
        }
        fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.failures_left == 0
        }
        fn configure(&mut self, _device: &DeviceConfig) -> AppResult<()> {
            Ok(())
        }
        fn stream(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn ready(&mut self) -> bool {
            false
        }
        fn get_readings(&mut self) -> AppResult<Vec<Reading>> {
            Ok(Vec::new())
        }
        fn unit_info(&self, info: InfoType) -> AppResult<String> {
            Ok(format!("{}", info.code()))
        }
        fn stream_start_timestamp(&self) -> Option<i64> {
            None
        }
        fn sample_time(&self) -> Option<u32> {
            None
        }
        fn enabled_channels(&self) -> Vec<u8> {
            vec![1, 2]
        }
        fn volts_conversion(&self, channel: u8) -> AppResult<f64> {
            Ok(f64::from(channel))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_quadratically() {
        let mut adc = FlakyAdc {
            failures_left: 2,
            opens: 0,
        };
        let start = tokio::time::Instant::now();
        open_with_retry(&mut adc, 5, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(adc.opens, 3);
        // 100 ms x 1 + 100 ms x 4
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn retry_delay_saturates() {
        assert_eq!(
            retry_delay(Duration::from_millis(100), 3),
            Duration::from_millis(900)
        );
        assert_eq!(retry_delay(Duration::from_secs(u64::MAX / 2 + 1), 2), Duration::MAX);
        assert_eq!(retry_delay(Duration::from_millis(1), u32::MAX), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up() {
        let mut adc = FlakyAdc {
            failures_left: 10,
            opens: 0,
        };
        let err = open_with_retry(&mut adc, 3, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::UnitNotOpened));
        assert_eq!(adc.opens, 3);
    }

    #[test]
    fn default_info_methods() {
        let adc = FlakyAdc {
            failures_left: 0,
            opens: 0,
        };
        assert_eq!(
            adc.formatted_unit_info(InfoType::CalDate).unwrap(),
            "Calibration date: 5"
        );
        assert_eq!(adc.full_unit_info().unwrap().lines().count(), 9);
        let factors = adc.volts_conversions().unwrap();
        assert_eq!(factors.get(&2), Some(&2.0));
    }

    #[test]
    fn vendor_driver_is_not_built() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let config = AdcConfig {
            kind: AdcKind::PicoLog24,
            ..AdcConfig::default()
        };
        assert!(matches!(
            AdcKind::from_config(&config, clock.clone()),
            Err(DaqError::FeatureNotEnabled(_))
        ));
        assert!(AdcKind::from_config(&AdcConfig::default(), clock).is_ok());
    }
}
