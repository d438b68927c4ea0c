//! # datalog
//!
//! Continuous acquisition from a PicoLog ADC-24 style data logger, with the
//! readings held in memory and served to clients over TCP.
//!
//! ## Crate Structure
//!
//! - **`adc`**: The `Adc` trait and the PicoLog ADC-24 unit built on a
//!   pluggable `hrdl::HrdlDriver`, including an in-process simulated driver.
//! - **`clock`**: Millisecond wall clock, swappable for a manual clock in tests.
//! - **`config`**: Layered configuration (defaults, TOML file, `DATALOG_*`
//!   environment) with validation. See `config::Settings`.
//! - **`data`**: Readings, the bounded `DataStore` and the CSV log.
//! - **`error`**: The `DaqError` enum shared by every module.
//! - **`fetch`**: The poll loop moving readings from a unit into the store.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`network`**: Text protocol, data server and client.

pub mod adc;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod network;
