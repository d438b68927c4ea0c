//! Readings, the in-memory store and the CSV log.
pub mod reading;
pub mod storage;
pub mod store;

pub use reading::{Reading, Sample, SampleRecord, SampleUnit};
pub use storage::{spawn_csv_logger, CsvLog};
pub use store::{
    Conversion, DataStore, Pivot, ReadingQuery, Selection, SharedDataStore, DEFAULT_AMOUNT,
    DEFAULT_SIZE, MAX_AMOUNT,
};
