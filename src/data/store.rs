//! In-memory reading store.
//!
//! The store keeps readings in time order, bounded to `max_size` entries, and
//! fans every newly stored reading out on a broadcast channel. The poll loop is
//! the only writer; the network server and CSV logger read from it.

use super::reading::{Reading, SampleRecord};
use crate::error::{AppResult, DaqError};
use chrono::NaiveDate;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

/// Default number of readings held.
pub const DEFAULT_SIZE: usize = 1000;

/// Default number of readings returned by a query.
pub const DEFAULT_AMOUNT: i64 = 1000;

/// Largest number of readings a single query returns.
pub const MAX_AMOUNT: i64 = 1000;

/// Capacity of the new-reading broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Callback applied to every reading as it is stored.
///
/// Receives the reading's samples and returns the replacement values.
pub type Conversion = Arc<dyn Fn(&[super::reading::Sample]) -> Vec<f64> + Send + Sync>;

/// A store shared between the poll loop and its readers.
pub type SharedDataStore = Arc<RwLock<DataStore>>;

/// Which side of a pivot time to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pivot {
    /// Readings strictly after the time.
    After(i64),
    /// Readings at or before the time.
    Before(i64),
}

/// Which end of the matching readings to return when more than `amount` match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// The oldest readings.
    #[default]
    Earliest,
    /// The newest readings.
    Latest,
}

/// Filters for [`DataStore::get_readings`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingQuery {
    /// Maximum readings to return; `None` means [`DEFAULT_AMOUNT`].
    pub amount: Option<i64>,
    /// End of the result set to keep.
    pub selection: Selection,
    /// Optional pivot time.
    pub pivot: Option<Pivot>,
    /// Inclusive lower bound on reading time.
    pub from: Option<i64>,
    /// Inclusive upper bound on reading time.
    pub until: Option<i64>,
    /// Channels to keep; `None` keeps all.
    pub channels: Option<Vec<u8>>,
}

impl ReadingQuery {
    /// Query with every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of readings.
    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Prefer the oldest readings.
    pub fn earliest(mut self) -> Self {
        self.selection = Selection::Earliest;
        self
    }

    /// Prefer the newest readings.
    pub fn latest(mut self) -> Self {
        self.selection = Selection::Latest;
        self
    }

    /// Readings strictly after `time`.
    pub fn after(mut self, time: i64) -> Self {
        self.pivot = Some(Pivot::After(time));
        self
    }

    /// Readings at or before `time`.
    pub fn before(mut self, time: i64) -> Self {
        self.pivot = Some(Pivot::Before(time));
        self
    }

    /// Readings within `[from, until]`.
    pub fn between(mut self, from: i64, until: i64) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    /// Restrict samples to these channels.
    pub fn channels(mut self, channels: Vec<u8>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Effective amount after defaulting and clamping to `0..=MAX_AMOUNT`.
    pub fn effective_amount(&self) -> usize {
        let amount = self.amount.unwrap_or(DEFAULT_AMOUNT).clamp(0, MAX_AMOUNT);
        usize::try_from(amount).unwrap_or(0)
    }

    fn keeps(&self, reading: &Reading) -> bool {
        let time = reading.reading_time();
        let pivot_ok = match self.pivot {
            Some(Pivot::After(t)) => time > t.max(0),
            Some(Pivot::Before(t)) => time <= t.max(0),
            None => true,
        };
        pivot_ok
            && self.from.map_or(true, |from| time >= from)
            && self.until.map_or(true, |until| time <= until)
    }
}

/// Ordered, bounded, append-only sequence of readings.
pub struct DataStore {
    max_size: usize,
    readings: VecDeque<Reading>,
    conversions: Vec<Conversion>,
    sender: broadcast::Sender<Reading>,
}

impl fmt::Debug for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("max_size", &self.max_size)
            .field("len", &self.readings.len())
            .field("conversions", &self.conversions.len())
            .finish()
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE)
    }
}

impl DataStore {
    /// Creates an empty store holding at most `max_size` readings.
    pub fn new(max_size: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            max_size,
            readings: VecDeque::with_capacity(max_size.min(DEFAULT_SIZE)),
            conversions: Vec::new(),
            sender,
        }
    }

    /// Adds a conversion applied to every reading stored from now on.
    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversions.push(conversion);
        self
    }

    /// Wraps the store for sharing between tasks.
    pub fn into_shared(self) -> SharedDataStore {
        Arc::new(RwLock::new(self))
    }

    /// Rebuilds a store from a JSON array of readings, sized to fit them.
    pub fn from_json(json: &str) -> AppResult<Self> {
        let readings: Vec<Reading> = serde_json::from_str(json)?;
        let mut store = Self::new(readings.len().max(1));
        store.insert(readings)?;
        Ok(store)
    }

    /// A new store with the same capacity holding `readings`.
    pub fn with_readings(&self, readings: Vec<Reading>) -> AppResult<Self> {
        let mut store = Self::new(self.max_size);
        store.insert(readings)?;
        Ok(store)
    }

    /// Maximum number of readings held.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of readings held.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Whether the store holds no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Time of the newest reading.
    pub fn last_reading_time(&self) -> Option<i64> {
        self.readings.back().map(Reading::reading_time)
    }

    /// Receiver for readings stored after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.sender.subscribe()
    }

    /// Appends readings in order.
    ///
    /// Driver padding (zero time, all values zero) is skipped. Readings are
    /// stored one by one, so those preceding an out-of-order reading remain
    /// stored when the error is returned. Returns the number stored.
    ///
    /// # Errors
    ///
    /// [`DaqError::OutOfOrder`] if a reading is not later than the newest
    /// stored reading.
    pub fn insert<I>(&mut self, readings: I) -> AppResult<usize>
    where
        I: IntoIterator<Item = Reading>,
    {
        let mut stored = 0;
        for reading in readings {
            if reading.is_blank() {
                trace!("Skipping blank reading");
                continue;
            }
            if let Some(last_time) = self.last_reading_time() {
                if reading.reading_time() <= last_time {
                    return Err(DaqError::OutOfOrder {
                        reading_time: reading.reading_time(),
                        last_time,
                    });
                }
            }
            self.push(reading);
            stored += 1;
        }
        Ok(stored)
    }

    fn push(&mut self, mut reading: Reading) {
        for conversion in &self.conversions {
            reading.apply(|samples| conversion(samples));
        }

        // No subscribers is fine
        let _ = self.sender.send(reading.clone());
        self.readings.push_back(reading);

        while self.readings.len() > self.max_size {
            self.readings.pop_front();
        }
    }

    /// Readings matching `query`, always in chronological order.
    pub fn get_readings(&self, query: &ReadingQuery) -> Vec<Reading> {
        let matching: Vec<Reading> = self
            .readings
            .iter()
            .filter(|r| query.keeps(r))
            .filter_map(|r| match &query.channels {
                Some(channels) => r.project(channels),
                None => Some(r.clone()),
            })
            .collect();

        let amount = query.effective_amount();
        match query.selection {
            Selection::Earliest => matching.into_iter().take(amount).collect(),
            Selection::Latest => {
                let skip = matching.len().saturating_sub(amount);
                matching.into_iter().skip(skip).collect()
            }
        }
    }

    /// Matching readings grouped by UTC calendar day.
    pub fn group_by_day(&self, query: &ReadingQuery) -> BTreeMap<NaiveDate, Vec<Reading>> {
        let mut groups: BTreeMap<NaiveDate, Vec<Reading>> = BTreeMap::new();
        for reading in self.get_readings(query) {
            groups
                .entry(reading.reading_date().date_naive())
                .or_default()
                .push(reading);
        }
        groups
    }

    /// Every stored sample as a flat record.
    pub fn sample_records(&self) -> impl Iterator<Item = SampleRecord> + '_ {
        self.readings.iter().flat_map(Reading::per_sample_records)
    }

    /// Matching readings as CSV lines.
    pub fn to_lines(&self, query: &ReadingQuery) -> Vec<String> {
        self.get_readings(query)
            .iter()
            .map(Reading::to_csv_line)
            .collect()
    }

    /// Matching readings as newline-separated CSV.
    pub fn to_csv(&self, query: &ReadingQuery) -> String {
        self.to_lines(query).join("\n")
    }

    /// Matching readings as a JSON array.
    pub fn to_json(&self, query: &ReadingQuery) -> AppResult<String> {
        Ok(serde_json::to_string(&self.get_readings(query))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(time: i64) -> Reading {
        Reading::new(time, &[1, 2], &[time as f64, 1.0]).unwrap()
    }

    fn store_with(times: &[i64]) -> DataStore {
        let mut store = DataStore::new(100);
        store
            .insert(times.iter().map(|&t| reading(t)))
            .unwrap();
        store
    }

    #[test]
    fn skips_blank_padding() {
        let mut store = DataStore::default();
        let blank = Reading::new(0, &[1, 2], &[0.0, 0.0]).unwrap();
        assert_eq!(store.insert(vec![blank, reading(5)]).unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn out_of_order_keeps_earlier_batch_members() {
        let mut store = store_with(&[10]);
        let err = store
            .insert(vec![reading(20), reading(30), reading(30), reading(40)])
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::OutOfOrder {
                reading_time: 30,
                last_time: 30
            }
        ));
        assert_eq!(store.len(), 3);
        assert_eq!(store.last_reading_time(), Some(30));
    }

    #[test]
    fn evicts_oldest_past_max_size() {
        let mut store = DataStore::new(3);
        store.insert((1..=5).map(reading)).unwrap();
        let times: Vec<i64> = store
            .get_readings(&ReadingQuery::new())
            .iter()
            .map(Reading::reading_time)
            .collect();
        assert_eq!(times, vec![3, 4, 5]);
    }

    #[test]
    fn conversions_run_on_insert() {
        let mut store = DataStore::new(10)
            .with_conversion(Arc::new(|s| s.iter().map(|x| x.value + 1.0).collect()))
            .with_conversion(Arc::new(|s| s.iter().map(|x| x.value * 10.0).collect()));
        store.insert(vec![reading(2)]).unwrap();
        assert_eq!(store.get_readings(&ReadingQuery::new())[0].values(), vec![30.0, 20.0]);
    }

    #[test]
    fn pivot_semantics() {
        let store = store_with(&[10, 20, 30, 40]);
        let after: Vec<i64> = store
            .get_readings(&ReadingQuery::new().after(20))
            .iter()
            .map(Reading::reading_time)
            .collect();
        assert_eq!(after, vec![30, 40]);

        let before: Vec<i64> = store
            .get_readings(&ReadingQuery::new().before(20))
            .iter()
            .map(Reading::reading_time)
            .collect();
        assert_eq!(before, vec![10, 20]);

        // negative pivot clamps to zero
        assert_eq!(store.get_readings(&ReadingQuery::new().after(-5)).len(), 4);
        assert!(store.get_readings(&ReadingQuery::new().before(-5)).is_empty());
    }

    #[test]
    fn latest_is_chronological() {
        let store = store_with(&[1, 2, 3, 4, 5]);
        let latest: Vec<i64> = store
            .get_readings(&ReadingQuery::new().latest().amount(2))
            .iter()
            .map(Reading::reading_time)
            .collect();
        assert_eq!(latest, vec![4, 5]);

        let earliest: Vec<i64> = store
            .get_readings(&ReadingQuery::new().amount(2))
            .iter()
            .map(Reading::reading_time)
            .collect();
        assert_eq!(earliest, vec![1, 2]);
    }

    #[test]
    fn amount_is_clamped() {
        let mut store = DataStore::new(2000);
        store.insert((1..=1500).map(reading)).unwrap();
        assert_eq!(store.get_readings(&ReadingQuery::new()).len(), 1000);
        assert_eq!(store.get_readings(&ReadingQuery::new().amount(5000)).len(), 1000);
        assert!(store.get_readings(&ReadingQuery::new().amount(-3)).is_empty());
    }

    #[test]
    fn range_and_channel_filters() {
        let store = store_with(&[10, 20, 30, 40]);
        let result = store.get_readings(&ReadingQuery::new().between(20, 30).channels(vec![2]));
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|r| r.channels() == vec![2]));

        assert!(store
            .get_readings(&ReadingQuery::new().channels(vec![9]))
            .is_empty());
    }

    #[test]
    fn serialization_forms() {
        let store = store_with(&[10, 20]);
        assert_eq!(store.to_csv(&ReadingQuery::new()), "10,10,1\n20,20,1");
        assert_eq!(store.to_lines(&ReadingQuery::new().latest().amount(1)), vec!["20,20,1"]);

        let json = store.to_json(&ReadingQuery::new()).unwrap();
        let rebuilt = DataStore::from_json(&json).unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.max_size(), 2);
    }

    #[test]
    fn with_readings_keeps_capacity() {
        let store = DataStore::new(7);
        let copy = store.with_readings(vec![reading(1), reading(2)]).unwrap();
        assert_eq!(copy.max_size(), 7);
        assert_eq!(copy.len(), 2);
    }

    #[test]
    fn groups_by_day() {
        let day = 86_400_000;
        let store = store_with(&[1, 2, day + 1]);
        let groups = store.group_by_day(&ReadingQuery::new());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.values().next().map(Vec::len), Some(2));
    }

    #[test]
    fn sample_records_flatten_all_channels() {
        let store = store_with(&[10, 20]);
        assert_eq!(store.sample_records().count(), 4);
    }

    #[tokio::test]
    async fn subscribers_see_new_readings() {
        let mut store = DataStore::new(10);
        let mut rx = store.subscribe();
        store.insert(vec![reading(7)]).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.reading_time(), 7);
    }
}
