//! Append-only CSV log of readings.
//!
//! Each row is `reading_time,v1,v2,...`. A header naming the channels is written
//! when the log starts a new file; appending to an existing log continues
//! without one.
use crate::data::Reading;
use crate::error::{AppResult, DaqError};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(feature = "storage_csv")]
use std::fs::{File, OpenOptions};

/// Writer appending readings to a CSV file.
#[cfg(feature = "storage_csv")]
pub struct CsvLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    needs_header: bool,
    rows: usize,
}

/// Placeholder when CSV support is compiled out.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvLog {
    path: PathBuf,
}

#[cfg(feature = "storage_csv")]
impl CsvLog {
    /// Opens `path` for appending, creating it and its directory if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_header = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(file);
        info!("CSV log will be written to '{}'.", path.display());
        Ok(Self {
            path,
            writer,
            needs_header,
            rows: 0,
        })
    }

    /// Appends readings and flushes. Returns the number of rows written.
    pub fn append(&mut self, readings: &[Reading]) -> AppResult<usize> {
        for reading in readings {
            if self.needs_header {
                let channels = reading.channels();
                let header = std::iter::once("reading_time".to_string())
                    .chain(channels.iter().map(|c| format!("channel_{}", c)));
                self.writer.write_record(header)?;
                self.needs_header = false;
            }
            let values = reading.values();
            let row = std::iter::once(reading.reading_time().to_string())
                .chain(values.iter().map(f64::to_string));
            self.writer.write_record(row)?;
            self.rows += 1;
        }
        self.writer.flush()?;
        Ok(readings.len())
    }

    /// Rows written by this writer.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(not(feature = "storage_csv"))]
impl CsvLog {
    /// CSV logging is unavailable in this build.
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let _ = path.as_ref().to_path_buf();
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// CSV logging is unavailable in this build.
    pub fn append(&mut self, _readings: &[Reading]) -> AppResult<usize> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// Always zero.
    pub fn rows(&self) -> usize {
        0
    }

    /// Path the log would have used.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Writes every reading received on `readings` to `log` until `shutdown`
/// turns true or the store goes away. Readings already queued when shutdown
/// is seen are still written. Resolves to the number of rows written.
pub fn spawn_csv_logger(
    mut log: CsvLog,
    mut readings: broadcast::Receiver<Reading>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<AppResult<usize>> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = readings.recv() => match received {
                    Ok(reading) => {
                        log.append(std::slice::from_ref(&reading))?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "CSV log fell behind; readings were not written");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        drain_queued(&mut log, &mut readings)?;
                        break;
                    }
                }
            }
        }
        debug!(rows = log.rows(), path = %log.path().display(), "CSV log closed");
        Ok::<usize, DaqError>(log.rows())
    })
}

fn drain_queued(log: &mut CsvLog, readings: &mut broadcast::Receiver<Reading>) -> AppResult<()> {
    use broadcast::error::TryRecvError;
    loop {
        match readings.try_recv() {
            Ok(reading) => {
                log.append(std::slice::from_ref(&reading))?;
            }
            Err(TryRecvError::Lagged(missed)) => {
                warn!(missed, "CSV log fell behind; readings were not written");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
        }
    }
}
