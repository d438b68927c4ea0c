//! Typed values for the HRDL (high resolution data logger) driver interface.
//!
//! The vendor library exchanges plain C shorts for channels, ranges and status
//! codes. These types validate the raw values once at the edge so the rest of the
//! crate only handles settings the unit can accept.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Analog input channel, numbered 1 to 16 like the unit's front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
    /// Lowest analog channel number.
    pub const MIN: u8 = 1;
    /// Highest analog channel number.
    pub const MAX: u8 = 16;

    /// Validates a raw channel number.
    pub fn new(number: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX)
            .contains(&number)
            .then_some(Self(number))
    }

    /// The raw channel number.
    pub fn number(self) -> u8 {
        self.0
    }

    /// Odd channels are the primary input of a differential pair.
    pub fn is_primary(self) -> bool {
        self.0 % 2 == 1
    }

    /// Every analog channel, ascending.
    pub fn all() -> impl Iterator<Item = Channel> {
        (Self::MIN..=Self::MAX).map(Channel)
    }
}

impl TryFrom<u8> for Channel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Channel::new(value).ok_or_else(|| {
            format!(
                "channel {} outside {}..={}",
                value,
                Channel::MIN,
                Channel::MAX
            )
        })
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input voltage range of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoltageRange {
    /// ±2500 mV
    #[serde(rename = "2500mv")]
    Range2500mV,
    /// ±1250 mV
    #[serde(rename = "1250mv")]
    Range1250mV,
    /// ±625 mV
    #[serde(rename = "625mv")]
    Range625mV,
    /// ±313 mV
    #[serde(rename = "313mv")]
    Range313mV,
    /// ±156 mV
    #[serde(rename = "156mv")]
    Range156mV,
    /// ±78 mV
    #[serde(rename = "78mv")]
    Range78mV,
    /// ±39 mV
    #[serde(rename = "39mv")]
    Range39mV,
}

impl VoltageRange {
    /// Driver code for this range.
    pub fn code(self) -> i16 {
        match self {
            Self::Range2500mV => 0,
            Self::Range1250mV => 1,
            Self::Range625mV => 2,
            Self::Range313mV => 3,
            Self::Range156mV => 4,
            Self::Range78mV => 5,
            Self::Range39mV => 6,
        }
    }

    /// Parses a driver code.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Range2500mV),
            1 => Some(Self::Range1250mV),
            2 => Some(Self::Range625mV),
            3 => Some(Self::Range313mV),
            4 => Some(Self::Range156mV),
            5 => Some(Self::Range78mV),
            6 => Some(Self::Range39mV),
            _ => None,
        }
    }

    /// Maximum input voltage on one side of the input, in volts.
    pub fn max_voltage(self) -> f64 {
        match self {
            Self::Range2500mV => 2.5,
            Self::Range1250mV => 1.25,
            Self::Range625mV => 0.625,
            Self::Range313mV => 0.313,
            Self::Range156mV => 0.156,
            Self::Range78mV => 0.078,
            Self::Range39mV => 0.039,
        }
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self::Range2500mV
    }
}

/// Channel input wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Differential between a primary channel and its even neighbour.
    Differential,
    /// Single ended.
    #[default]
    Single,
}

impl InputType {
    /// Driver code. Any non-zero short means single ended.
    pub fn code(self) -> i16 {
        match self {
            Self::Differential => 0,
            Self::Single => 1,
        }
    }

    /// Parses a driver code.
    pub fn from_code(code: i16) -> Self {
        if code == 0 {
            Self::Differential
        } else {
            Self::Single
        }
    }
}

/// Time a single channel has to convert its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionTime {
    /// 60 ms
    #[serde(rename = "60ms")]
    Time60ms,
    /// 100 ms
    #[serde(rename = "100ms")]
    Time100ms,
    /// 180 ms
    #[serde(rename = "180ms")]
    Time180ms,
    /// 340 ms
    #[serde(rename = "340ms")]
    Time340ms,
    /// 660 ms
    #[serde(rename = "660ms")]
    Time660ms,
}

impl ConversionTime {
    /// Driver code for this conversion time.
    pub fn code(self) -> i16 {
        match self {
            Self::Time60ms => 0,
            Self::Time100ms => 1,
            Self::Time180ms => 2,
            Self::Time340ms => 3,
            Self::Time660ms => 4,
        }
    }

    /// Parses a driver code.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Time60ms),
            1 => Some(Self::Time100ms),
            2 => Some(Self::Time180ms),
            3 => Some(Self::Time340ms),
            4 => Some(Self::Time660ms),
            _ => None,
        }
    }

    /// Conversion time in milliseconds.
    pub fn millis(self) -> u32 {
        match self {
            Self::Time60ms => 60,
            Self::Time100ms => 100,
            Self::Time180ms => 180,
            Self::Time340ms => 340,
            Self::Time660ms => 660,
        }
    }
}

impl Default for ConversionTime {
    fn default() -> Self {
        Self::Time60ms
    }
}

/// How the unit collects samples after `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleMethod {
    /// One block, then stop.
    Block,
    /// Rolling window over the most recent samples.
    Window,
    /// Continuous collection, drained by the host.
    Stream,
}

impl SampleMethod {
    /// Driver code for this method.
    pub fn code(self) -> i16 {
        match self {
            Self::Block => 0,
            Self::Window => 1,
            Self::Stream => 2,
        }
    }
}

/// Information the unit can report about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoType {
    /// Driver version string.
    DriverVersion,
    /// USB version.
    UsbVersion,
    /// Hardware revision.
    HardwareVersion,
    /// Unit variant, e.g. "24".
    VariantInfo,
    /// Batch and serial number.
    BatchAndSerial,
    /// Calibration date.
    CalDate,
    /// Kernel driver version.
    KernelDriverVersion,
    /// Last unit error code.
    Error,
    /// Last settings error code.
    SettingsError,
}

impl InfoType {
    /// Every info type, in driver order.
    pub const ALL: [InfoType; 9] = [
        Self::DriverVersion,
        Self::UsbVersion,
        Self::HardwareVersion,
        Self::VariantInfo,
        Self::BatchAndSerial,
        Self::CalDate,
        Self::KernelDriverVersion,
        Self::Error,
        Self::SettingsError,
    ];

    /// Driver code for this info type.
    pub fn code(self) -> i16 {
        match self {
            Self::DriverVersion => 0,
            Self::UsbVersion => 1,
            Self::HardwareVersion => 2,
            Self::VariantInfo => 3,
            Self::BatchAndSerial => 4,
            Self::CalDate => 5,
            Self::KernelDriverVersion => 6,
            Self::Error => 7,
            Self::SettingsError => 8,
        }
    }

    /// Human-readable label used when formatting unit info.
    pub fn label(self) -> &'static str {
        match self {
            Self::DriverVersion => "Driver version",
            Self::UsbVersion => "USB version",
            Self::HardwareVersion => "Hardware version",
            Self::VariantInfo => "Unit variant",
            Self::BatchAndSerial => "Batch and serial",
            Self::CalDate => "Calibration date",
            Self::KernelDriverVersion => "Kernel driver version",
            Self::Error => "Error code",
            Self::SettingsError => "Settings error",
        }
    }

    /// Formats a raw info string with its label.
    pub fn format(self, info: &str) -> String {
        format!("{}: {}", self.label(), info)
    }
}

/// Unit error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitError {
    /// No error.
    Ok,
    /// Kernel driver too old.
    KernelDriverTooOld,
    /// Unit not found.
    UnitNotFound,
    /// Firmware configuration failed.
    FirmwareConfigFail,
    /// Operating system not supported.
    OsNotSupported,
    /// Maximum number of devices already open.
    MaxDevicesAlreadyOpen,
}

impl UnitError {
    /// Parses a driver code.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::KernelDriverTooOld),
            2 => Some(Self::UnitNotFound),
            3 => Some(Self::FirmwareConfigFail),
            4 => Some(Self::OsNotSupported),
            5 => Some(Self::MaxDevicesAlreadyOpen),
            _ => None,
        }
    }

    /// Driver code.
    pub fn code(self) -> i16 {
        match self {
            Self::Ok => 0,
            Self::KernelDriverTooOld => 1,
            Self::UnitNotFound => 2,
            Self::FirmwareConfigFail => 3,
            Self::OsNotSupported => 4,
            Self::MaxDevicesAlreadyOpen => 5,
        }
    }

    /// Whether this code indicates a fault.
    ///
    /// The driver reports "kernel driver too old" on working installations, so
    /// it is not treated as an error.
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Ok | Self::KernelDriverTooOld)
    }

    /// Driver's message for this code.
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::KernelDriverTooOld => "Kernel driver too old",
            Self::UnitNotFound => "Unit not found",
            Self::FirmwareConfigFail => "Firmware config failure",
            Self::OsNotSupported => "OS not supported",
            Self::MaxDevicesAlreadyOpen => "Maximum devices already open",
        }
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Settings error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsError {
    /// Conversion time parameter out of range.
    ConversionTimeOutOfRange,
    /// Sample interval out of range.
    SampleIntervalOutOfRange,
    /// Conversion time too slow for the enabled channels.
    ConversionTimeTooSlow,
    /// Channel valid but not available.
    ChannelNotAvailable,
    /// Channel not valid for this unit.
    InvalidChannel,
    /// Voltage range not valid for this unit.
    InvalidVoltageRange,
    /// One or more parameters invalid.
    InvalidParameter,
    /// A conversion is in progress.
    ConversionInProgress,
    /// Communication with the unit failed.
    CommunicationFailed,
    /// All settings applied.
    Ok,
}

impl SettingsError {
    /// Parses a driver code.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::ConversionTimeOutOfRange),
            1 => Some(Self::SampleIntervalOutOfRange),
            2 => Some(Self::ConversionTimeTooSlow),
            3 => Some(Self::ChannelNotAvailable),
            4 => Some(Self::InvalidChannel),
            5 => Some(Self::InvalidVoltageRange),
            6 => Some(Self::InvalidParameter),
            7 => Some(Self::ConversionInProgress),
            8 => Some(Self::CommunicationFailed),
            9 => Some(Self::Ok),
            _ => None,
        }
    }

    /// Driver code.
    pub fn code(self) -> i16 {
        match self {
            Self::ConversionTimeOutOfRange => 0,
            Self::SampleIntervalOutOfRange => 1,
            Self::ConversionTimeTooSlow => 2,
            Self::ChannelNotAvailable => 3,
            Self::InvalidChannel => 4,
            Self::InvalidVoltageRange => 5,
            Self::InvalidParameter => 6,
            Self::ConversionInProgress => 7,
            Self::CommunicationFailed => 8,
            Self::Ok => 9,
        }
    }

    /// Whether this code indicates a rejected setting.
    pub fn is_error(self) -> bool {
        self != Self::Ok
    }

    /// Driver's message for this code.
    pub fn message(self) -> &'static str {
        match self {
            Self::ConversionTimeOutOfRange => "The conversion time parameter is out of range",
            Self::SampleIntervalOutOfRange => "The sample time interval is out of range",
            Self::ConversionTimeTooSlow => {
                "The conversion time chosen is not fast enough to convert all channels within the sample interval"
            }
            Self::ChannelNotAvailable => {
                "The channel being set is valid but not currently available"
            }
            Self::InvalidChannel => "The channel being set is not valid for this device",
            Self::InvalidVoltageRange => "The voltage range being set for this device is not valid",
            Self::InvalidParameter => "One or more parameters are invalid",
            Self::ConversionInProgress => {
                "A conversion is in progress for a single asynchronous operation"
            }
            Self::CommunicationFailed => "Communication failed",
            Self::Ok => "All settings have been completed successfully",
        }
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
