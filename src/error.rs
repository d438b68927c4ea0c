//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur, from configuration issues to ADC unit faults
//! and malformed network requests.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the following sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax problems or
//!   values of the wrong type.
//! - **`Configuration`**: Semantic errors in a configuration that parsed correctly
//!   (an unknown log level, a sample time too short for the enabled channels).
//! - **`Io`**: Wraps `std::io::Error`, covering file and socket I/O.
//! - **Device variants** (`UnitNotFound`, `UnitError`, `Settings`, ...): failures
//!   reported by the ADC driver. Settings errors carry the driver's own code so
//!   callers can match on it.
//! - **Data variants** (`LengthMismatch`, `OutOfOrder`, `Serialization`): invariants
//!   of readings and of the data store.
//! - **`Protocol`**: malformed or unexpected traffic on the network socket.
//! - **`FeatureNotEnabled`**: functionality not compiled in or with no backend in this
//!   build, such as the native vendor driver.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use crate::adc::hrdl::constants::{SettingsError, UnitError};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by the datalog crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver found no unit to open.
    #[error("Unit not found")]
    UnitNotFound,

    /// The driver found a unit but could not open it.
    #[error("Unit found but not opened")]
    UnitNotOpened,

    /// An operation required an open unit.
    #[error("No unit is currently open")]
    UnitNotOpen,

    /// Only one unit may be held open by a wrapper at a time.
    #[error("A unit is already open")]
    UnitAlreadyOpen,

    /// The unit reported an error code.
    #[error("Unit error: {0}")]
    UnitError(UnitError),

    /// The unit rejected a setting.
    #[error("Settings error: {0}")]
    Settings(SettingsError),

    /// A device operation failed without a more specific cause.
    #[error("Device error: {0}")]
    Device(String),

    /// Reading construction received a different number of channels and values.
    #[error("{channels} channels specified for {values} sample values")]
    LengthMismatch {
        /// Number of channels supplied.
        channels: usize,
        /// Number of values supplied.
        values: usize,
    },

    /// A reading was not later than the newest reading already stored.
    #[error("Reading time {reading_time} is not later than the last stored time {last_time}")]
    OutOfOrder {
        /// Timestamp of the rejected reading.
        reading_time: i64,
        /// Timestamp of the newest stored reading.
        last_time: i64,
    },

    /// JSON or CSV (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A network peer sent something the protocol does not allow.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered a request with an error message.
    #[error("Server error: {0}")]
    Remote(String),

    /// A network operation timed out.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Functionality that has no backend in this build.
    #[error("Feature '{0}' is not enabled in this build")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(err: serde_json::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_error_message_comes_from_driver_code() {
        let err = DaqError::Settings(SettingsError::ConversionTimeTooSlow);
        assert!(err
            .to_string()
            .contains("not fast enough to convert all channels"));
    }

    #[test]
    fn out_of_order_names_both_times() {
        let err = DaqError::OutOfOrder {
            reading_time: 10,
            last_time: 20,
        };
        let message = err.to_string();
        assert!(message.contains("10"));
        assert!(message.contains("20"));
    }

    #[test]
    fn json_errors_convert_to_serialization() {
        let err: DaqError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        match err {
            DaqError::Serialization(msg) => assert!(!msg.is_empty()),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
