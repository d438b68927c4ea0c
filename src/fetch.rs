//! Device poll loop.
//!
//! A [`Retriever`] owns an [`Adc`] and a handle to the shared [`DataStore`]. Once
//! spawned it polls the unit every `poll_time`, moving whatever readings the
//! unit has buffered into the store. Failures during a poll are logged and
//! counted but never end the loop; only [`RetrieverHandle::stop`] does. Stopping
//! keeps polling until the unit has nothing left buffered, so readings waiting
//! at shutdown are not lost, then closes the unit.
//!
//! Progress is published as an [`AdcStatus`] on a `tokio::sync::watch` channel,
//! which the network server reads to answer status commands.
//!
//! [`DataStore`]: crate::data::DataStore

use crate::adc::Adc;
use crate::config::DeviceConfig;
use crate::data::SharedDataStore;
use crate::error::{AppResult, DaqError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Snapshot of the device and poll loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdcStatus {
    /// Whether the poll loop is running.
    pub streaming: bool,
    /// When the unit started streaming, ms since epoch.
    pub stream_start_timestamp: Option<i64>,
    /// Time to sample every enabled channel, ms.
    pub sample_time_ms: Option<u32>,
    /// Enabled channels, ascending.
    pub enabled_channels: Vec<u8>,
    /// Volts per count for each enabled channel.
    pub volts_conversions: BTreeMap<u8, f64>,
    /// Labelled unit information lines.
    pub unit_info: Option<String>,
    /// Polls performed.
    pub polls: u64,
    /// Readings stored.
    pub readings_stored: u64,
    /// Failed polls.
    pub errors: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

/// Moves readings from an ADC into a data store on a fixed interval.
pub struct Retriever {
    adc: Box<dyn Adc>,
    store: SharedDataStore,
    poll_time: Duration,
    device: DeviceConfig,
}

impl Retriever {
    /// Creates a retriever using the default device settings.
    pub fn new(adc: Box<dyn Adc>, store: SharedDataStore, poll_time: Duration) -> Self {
        Self {
            adc,
            store,
            poll_time,
            device: DeviceConfig::default(),
        }
    }

    /// Device settings applied when the retriever starts.
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Opens the unit if needed, configures it, starts streaming and spawns the
    /// poll loop. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Any failure opening, configuring or starting the unit. The unit is
    /// closed again if it was opened here.
    pub fn spawn(mut self) -> AppResult<RetrieverHandle> {
        let opened_here = !self.adc.is_open();
        if opened_here {
            self.adc.open()?;
        }

        if let Err(e) = self.adc.configure(&self.device).and_then(|_| self.adc.stream()) {
            if opened_here {
                if let Err(close_err) = self.adc.close() {
                    warn!(error = %close_err, "Failed to close unit after setup error");
                }
            }
            return Err(e);
        }

        let status = AdcStatus {
            streaming: true,
            stream_start_timestamp: self.adc.stream_start_timestamp(),
            sample_time_ms: self.adc.sample_time(),
            enabled_channels: self.adc.enabled_channels(),
            volts_conversions: self.adc.volts_conversions().unwrap_or_default(),
            unit_info: self.adc.full_unit_info().ok(),
            ..AdcStatus::default()
        };
        info!(
            poll_time_ms = self.poll_time.as_millis() as u64,
            channels = ?status.enabled_channels,
            "Retriever started"
        );

        let (status_tx, status_rx) = watch::channel(status);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(
            self.run(status_tx, shutdown_rx)
                .instrument(info_span!("retriever")),
        );

        Ok(RetrieverHandle {
            status: status_rx,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn run(
        mut self,
        status: watch::Sender<AdcStatus>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> AppResult<()> {
        let mut ticker = interval(self.poll_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => { self.poll(&status).await; }
            }
        }

        debug!("Draining unit before shutdown");
        // A poll moves at most one buffer; stop early if the unit keeps failing
        while self.adc.ready() && self.poll(&status).await {}

        let closed = self.adc.close();
        status.send_modify(|s| s.streaming = false);
        info!("Retriever stopped");
        closed
    }

    /// One poll. Returns whether readings were fetched without error.
    async fn poll(&mut self, status: &watch::Sender<AdcStatus>) -> bool {
        let mut fetched = 0usize;
        let mut stored = 0u64;
        let mut failure = None;

        if self.adc.ready() {
            match self.adc.get_readings() {
                Ok(readings) if readings.is_empty() => {}
                Ok(readings) => {
                    fetched = readings.len();
                    let mut store = self.store.write().await;
                    match store.insert(readings) {
                        Ok(n) => stored = n as u64,
                        Err(e) => failure = Some(e),
                    }
                    debug!(fetched, stored, "Fetched readings");
                }
                Err(e) => failure = Some(e),
            }
        }

        if let Some(e) = &failure {
            warn!(error = %e, "Poll failed");
        }
        let progressed = fetched > 0 && failure.is_none();

        status.send_modify(|s| {
            s.polls += 1;
            s.readings_stored += stored;
            if let Some(e) = failure {
                s.errors += 1;
                s.last_error = Some(e.to_string());
            }
        });
        progressed
    }
}

/// Running poll loop.
pub struct RetrieverHandle {
    status: watch::Receiver<AdcStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<AppResult<()>>,
}

impl RetrieverHandle {
    /// Receiver following the loop's status.
    pub fn status(&self) -> watch::Receiver<AdcStatus> {
        self.status.clone()
    }

    /// Current status snapshot.
    pub fn current_status(&self) -> AdcStatus {
        self.status.borrow().clone()
    }

    /// Whether the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop after draining the unit, closes the unit and waits for the
    /// task to finish.
    pub async fn stop(mut self) -> AppResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            // The loop may already have ended
            let _ = shutdown.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DaqError::Device(format!("retriever task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::hrdl::constants::{Channel, ConversionTime};
    use crate::adc::hrdl::SimulatedDriver;
    use crate::adc::PicoLogAdc24;
    use crate::clock::{Clock, ManualClock};
    use crate::config::ChannelConfig;
    use crate::data::{DataStore, ReadingQuery};
    use std::sync::Arc;

    fn device(channels: &[u8]) -> DeviceConfig {
        DeviceConfig {
            sample_time_ms: 1000,
            conversion_time: ConversionTime::Time60ms,
            channels: channels
                .iter()
                .map(|&n| ChannelConfig::new(Channel::new(n).unwrap()))
                .collect(),
            ..DeviceConfig::default()
        }
    }

    fn sim(clock: &ManualClock) -> Box<dyn Adc> {
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        Box::new(PicoLogAdc24::new(
            SimulatedDriver::with_seed(shared.clone(), 3),
            shared,
        ))
    }

    #[tokio::test]
    async fn final_drain_collects_everything() {
        let clock = ManualClock::new(10_000);
        let store = DataStore::new(100).into_shared();
        let handle = Retriever::new(sim(&clock), store.clone(), Duration::from_millis(20))
            .with_device(device(&[1, 2]))
            .spawn()
            .unwrap();

        assert!(handle.current_status().streaming);
        assert_eq!(handle.current_status().enabled_channels, vec![1, 2]);

        clock.advance(5_000);
        handle.stop().await.unwrap();

        let store = store.read().await;
        let times: Vec<i64> = store
            .get_readings(&ReadingQuery::new())
            .iter()
            .map(|r| r.reading_time())
            .collect();
        assert_eq!(times, vec![10_000, 11_000, 12_000, 13_000, 14_000]);
    }

    #[tokio::test]
    async fn final_drain_empties_a_backlog_larger_than_one_buffer() {
        let clock = ManualClock::new(1_000);
        let store = DataStore::new(100).into_shared();
        let mut small_buffer = device(&[1]);
        small_buffer.sample_buf_len = 2;
        let handle = Retriever::new(sim(&clock), store.clone(), Duration::from_secs(3600))
            .with_device(small_buffer)
            .spawn()
            .unwrap();

        clock.advance(10_000);
        handle.stop().await.unwrap();

        let store = store.read().await;
        assert_eq!(store.len(), 10);
        assert_eq!(store.last_reading_time(), Some(10_000));
    }

    #[tokio::test]
    async fn status_counts_polls_and_readings() {
        let clock = ManualClock::new(0);
        let store = DataStore::new(100).into_shared();
        let handle = Retriever::new(sim(&clock), store, Duration::from_millis(10))
            .with_device(device(&[5]))
            .spawn()
            .unwrap();
        let mut status = handle.status();

        clock.advance(3_000);
        status
            .wait_for(|s| s.readings_stored == 3)
            .await
            .unwrap();
        let snapshot = handle.current_status();
        assert!(snapshot.polls >= 1);
        assert_eq!(snapshot.errors, 0);
        assert!(snapshot.volts_conversions.contains_key(&5));
        assert!(snapshot
            .unit_info
            .as_deref()
            .unwrap_or_default()
            .contains("CMY02/116"));

        handle.stop().await.unwrap();
        assert!(!status.borrow().streaming);
    }

    #[tokio::test]
    async fn out_of_order_inserts_are_counted_not_fatal() {
        let clock = ManualClock::new(1_000);
        let mut prefilled = DataStore::new(100);
        prefilled
            .insert(vec![crate::data::Reading::new(50_000, &[1], &[1.0]).unwrap()])
            .unwrap();
        let store = prefilled.into_shared();

        let handle = Retriever::new(sim(&clock), store.clone(), Duration::from_millis(10))
            .with_device(device(&[1]))
            .spawn()
            .unwrap();
        let mut status = handle.status();

        clock.advance(2_000);
        status.wait_for(|s| s.errors >= 1).await.unwrap();
        assert!(!handle.is_finished());
        assert!(handle
            .current_status()
            .last_error
            .unwrap_or_default()
            .contains("not later than"));

        handle.stop().await.unwrap();
        assert_eq!(store.read().await.len(), 1);
    }

    #[tokio::test]
    async fn setup_failure_closes_unit() {
        let clock = ManualClock::new(0);
        let store = DataStore::new(10).into_shared();
        let mut bad = device(&[1]);
        bad.sample_time_ms = 50_000;
        let result = Retriever::new(sim(&clock), store, Duration::from_millis(10))
            .with_device(bad)
            .spawn();
        assert!(matches!(result, Err(DaqError::Settings(_))));
    }
}
