//! Committed scans, keyed by location id.

use crate::data_container::{ScanRecord, ScanTableRow};
use crate::error::StoreError;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct SpatialResultStore {
    records: BTreeMap<u64, ScanRecord>,
    next_id: u64,
}

impl SpatialResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out location ids in increasing order.
    pub fn next_location_id(&mut self) -> u64 {
        let id = self.peek_location_id();
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    /// Id the next recorded scan will get, without reserving it.
    pub fn peek_location_id(&self) -> u64 {
        self.next_id
    }

    /// Inserts a record, replacing any previous record for the same location. Returns the
    /// replaced record.
    pub fn record(&mut self, record: ScanRecord) -> Option<ScanRecord> {
        let id = record.location_id;
        self.next_id = self.next_id.max(id.saturating_add(1));
        let previous = self.records.insert(id, record);
        if previous.is_some() {
            log::info!("replaced scan at location {id}");
        }
        previous
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ScanRecord> {
        self.records.values()
    }

    /// Mean shift of the scan at `location_id`.
    pub fn aggregate_shift(&self, location_id: u64) -> Result<f64, StoreError> {
        self.records
            .get(&location_id)
            .ok_or(StoreError::UnknownLocation(location_id))?
            .average_shift()
    }

    /// Table rows for every location with a usable shift, in id order.
    pub fn table(&self) -> Vec<ScanTableRow> {
        self.records()
            .filter_map(|r| r.table_row().ok())
            .collect()
    }

    /// Relative coordinate to aggregate shift for every location with a non-empty profile.
    ///
    /// If two locations share a coordinate, the one with the larger id wins.
    pub fn all_points(&self) -> BTreeMap<[i64; 2], f64> {
        let mut points = BTreeMap::new();
        for (&id, record) in &self.records {
            match self.aggregate_shift(id) {
                Ok(shift) => {
                    points.insert(record.relative_coordinate, shift);
                }
                Err(err) => log::warn!("skipping location in map: {err}"),
            }
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(id: u64, coordinate: [i64; 2], shifts: &[f64]) -> ScanRecord {
        ScanRecord {
            location_id: id,
            relative_coordinate: coordinate,
            shift_profile: shifts
                .iter()
                .enumerate()
                .map(|(i, s)| (25 * i as i64, *s))
                .collect(),
            image_stack: vec![],
            start_position: 0,
            length: 25 * shifts.len() as i64,
            num_steps: shifts.len() as u32,
        }
    }

    #[test]
    fn test_aggregate_shift_is_mean() {
        let mut store = SpatialResultStore::new();
        let id = store.next_location_id();
        store.record(record(id, [10, 20], &[5.0, 5.1, 5.2, 5.3]));
        assert_relative_eq!(store.aggregate_shift(id).unwrap(), 5.15, epsilon = 1e-12);
        assert_eq!(store.aggregate_shift(7), Err(StoreError::UnknownLocation(7)));
    }

    #[test]
    fn test_empty_profile_is_an_error_and_not_plotted() {
        let mut store = SpatialResultStore::new();
        store.record(record(0, [0, 0], &[]));
        store.record(record(1, [5, 5], &[4.9]));
        assert_eq!(store.aggregate_shift(0), Err(StoreError::EmptyProfile(0)));
        let points = store.all_points();
        assert_eq!(points.len(), 1);
        assert_relative_eq!(points[&[5, 5]], 4.9);
        assert_eq!(store.table().len(), 1);
    }

    #[test]
    fn test_record_overwrites_location() {
        let mut store = SpatialResultStore::new();
        assert!(store.record(record(2, [1, 1], &[5.0])).is_none());
        let previous = store.record(record(2, [1, 1], &[6.0])).unwrap();
        assert_eq!(previous.shift_profile, vec![(0, 5.0)]);
        assert_eq!(store.len(), 1);
        assert_relative_eq!(store.aggregate_shift(2).unwrap(), 6.0);
        // ids handed out afterwards never collide with recorded ones
        assert_eq!(store.next_location_id(), 3);
    }

    #[test]
    fn test_largest_location_id_does_not_overflow() {
        let mut store = SpatialResultStore::new();
        store.record(record(u64::MAX, [0, 0], &[5.0]));
        assert_eq!(store.next_location_id(), u64::MAX);
        assert_eq!(store.next_location_id(), u64::MAX);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_location_ids_increase() {
        let mut store = SpatialResultStore::new();
        let ids: Vec<u64> = (0..4).map(|_| store.next_location_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
