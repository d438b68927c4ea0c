//! Call surface of the HRDL vendor library.
//!
//! The trait mirrors the C API one call per method, keeping its conventions: a
//! handle is returned from `open_unit`, most calls report success with a plain
//! boolean, and the reason for a failure must be fetched afterwards through
//! [`HrdlDriver::unit_info`] with [`InfoType::Error`] or
//! [`InfoType::SettingsError`]. Translating those conventions into
//! [`DaqError`](crate::error::DaqError) values is the job of
//! [`PicoLogAdc24`](crate::adc::PicoLogAdc24), so a driver implementation stays a
//! thin shim over whatever actually talks to the hardware.

use super::constants::{InfoType, SampleMethod};

/// Handle identifying an open unit.
pub type Handle = i16;

/// Handle value returned when no unit was found.
pub const HANDLE_UNIT_NOT_FOUND: Handle = 0;

/// Handle value returned when a unit was found but could not be opened.
pub const HANDLE_UNIT_NOT_OPENED: Handle = -1;

/// Whether a handle returned by `open_unit` refers to an open unit.
pub fn is_valid_handle(handle: Handle) -> bool {
    handle > 0
}

/// Raw sample buffers filled by [`HrdlDriver::times_and_values`].
///
/// `times[i]` is the time of sample set `i` in milliseconds since the stream was
/// started. The values of that set occupy
/// `values[i * channels..(i + 1) * channels]`, in ascending channel order.
/// Drivers may pad both buffers with zeros past the last real sample set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimesAndValues {
    /// Sample times, ms since stream start.
    pub times: Vec<i32>,
    /// Sample values in ADC counts, one run of enabled channels per time.
    pub values: Vec<i32>,
    /// Bit field of channels that went over range.
    pub overflow: u16,
}

/// The vendor driver's functions for one family of units.
///
/// Implementations are driven from a single task at a time and must be movable
/// between threads.
pub trait HrdlDriver: Send {
    /// Opens the first available unit.
    ///
    /// Returns a positive handle on success, [`HANDLE_UNIT_NOT_FOUND`] or
    /// [`HANDLE_UNIT_NOT_OPENED`] otherwise.
    fn open_unit(&mut self) -> Handle;

    /// Closes a unit. Returns false for an invalid handle.
    fn close_unit(&mut self, handle: Handle) -> bool;

    /// Whether the unit has samples waiting to be collected.
    ///
    /// Indistinguishable from an invalid handle, which also returns false.
    fn ready(&mut self, handle: Handle) -> bool;

    /// Reads one piece of unit information. Returns `None` if the info type is
    /// out of range or the handle is invalid.
    fn unit_info(&self, handle: Handle, info: InfoType) -> Option<String>;

    /// Configures one analog input.
    ///
    /// `range` and `input_type` are raw driver codes so out-of-range values reach
    /// the unit and are reported through the settings error.
    fn set_analog_in_channel(
        &mut self,
        handle: Handle,
        channel: i16,
        enabled: bool,
        range: i16,
        input_type: i16,
    ) -> bool;

    /// Sets the time to sample every enabled channel and the per-channel
    /// conversion time code.
    fn set_interval(&mut self, handle: Handle, sample_interval_ms: i32, conversion_time: i16)
        -> bool;

    /// Starts collecting samples into a buffer of `n_values` entries.
    fn run(&mut self, handle: Handle, n_values: i32, method: SampleMethod) -> bool;

    /// Collects up to `samples_per_channel` sample sets. Returns `None` if the
    /// call failed or no values were available.
    fn times_and_values(
        &mut self,
        handle: Handle,
        samples_per_channel: usize,
    ) -> Option<TimesAndValues>;

    /// Number of enabled channels, or `None` for an invalid handle.
    fn enabled_channel_count(&self, handle: Handle) -> Option<i16>;

    /// Minimum and maximum ADC counts for a channel, or `None` for an invalid
    /// handle.
    fn min_max_adc_counts(&self, handle: Handle, channel: i16) -> Option<(i32, i32)>;
}
