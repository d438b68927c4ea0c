//! PicoLog high resolution data logger (HRDL) driver layer.

pub mod constants;
pub mod driver;
pub mod sim;

pub use driver::{is_valid_handle, Handle, HrdlDriver, TimesAndValues};
pub use sim::SimulatedDriver;
