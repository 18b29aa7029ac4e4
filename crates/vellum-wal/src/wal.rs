//! Fixed-capacity WAL ring.

use std::collections::VecDeque;

use tracing::debug;
use vellum_error::{Result, VellumError};
use vellum_types::Lsn;

use crate::record::{WalRecord, WalRecordType};

/// Default ring capacity for persistent namespaces.
pub const DEFAULT_WAL_SIZE: usize = 4_000_000;

/// Ring buffer of WAL records keyed by a monotonically increasing LSN
/// counter; a full ring overwrites the oldest record.
#[derive(Debug, Clone)]
pub struct WalTracker {
    records: VecDeque<WalRecord>,
    capacity: usize,
    /// Counter the next appended record receives.
    next_counter: i64,
    server_id: i16,
}

impl WalTracker {
    #[must_use]
    pub fn new(capacity: usize, server_id: i16) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            next_counter: 0,
            server_id,
        }
    }

    #[must_use]
    pub fn server_id(&self) -> i16 {
        self.server_id
    }

    pub fn set_server_id(&mut self, server_id: i16) {
        self.server_id = server_id;
    }

    /// Initialize the counter window after loading items from storage.
    pub fn init(&mut self, min_lsn: Lsn, max_lsn: Lsn) {
        self.records.clear();
        self.next_counter = if max_lsn.is_empty() {
            0
        } else {
            max_lsn.counter() + 1
        };
        debug!(
            min = %min_lsn,
            max = %max_lsn,
            next = self.next_counter,
            "wal initialized"
        );
    }

    /// Counter of the oldest record still in the ring; `-1` when empty.
    #[must_use]
    pub fn first_counter(&self) -> i64 {
        self.records.front().map_or(-1, |r| r.lsn.counter())
    }

    /// Counter the next record will receive.
    #[must_use]
    pub fn next_counter(&self) -> i64 {
        self.next_counter
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record, assigning the next LSN. At capacity the oldest
    /// record is dropped.
    pub fn add(&mut self, kind: WalRecordType, data: Vec<u8>) -> Lsn {
        let lsn = Lsn::new(self.next_counter, self.server_id);
        self.next_counter += 1;
        self.records.push_back(WalRecord { kind, data, lsn });
        if self.records.len() > self.capacity {
            self.records.pop_front();
        }
        lsn
    }

    /// Append a record replicated from a leader, keeping its origin LSN
    /// counter as our own position.
    pub fn add_replicated(&mut self, kind: WalRecordType, data: Vec<u8>, origin: Lsn) -> Lsn {
        let lsn = Lsn::new(origin.counter(), self.server_id);
        self.next_counter = origin.counter() + 1;
        self.records.push_back(WalRecord { kind, data, lsn });
        if self.records.len() > self.capacity {
            self.records.pop_front();
        }
        lsn
    }

    /// Fetch one record by counter; counters outside the ring window are
    /// `NotValid` (the follower must resync).
    pub fn get(&self, counter: i64) -> Result<&WalRecord> {
        let first = self.first_counter();
        if first < 0 || counter < first || counter >= self.next_counter {
            return Err(VellumError::not_valid(format!(
                "lsn {counter} is outside the wal window [{first}, {})",
                self.next_counter
            )));
        }
        let offset = usize::try_from(counter - first)
            .map_err(|_| VellumError::not_valid("bad wal offset"))?;
        self.records
            .get(offset)
            .ok_or_else(|| VellumError::not_valid(format!("wal record {counter} missing")))
    }

    /// Iterate records with counters in `[from, next)`.
    pub fn iter_from(&self, from: i64) -> Result<impl Iterator<Item = &WalRecord> + '_> {
        let first = self.first_counter();
        if from < first && !(self.records.is_empty() && from == 0) {
            return Err(VellumError::not_valid(format!(
                "lsn {from} already left the wal ring (first is {first})"
            )));
        }
        let skip = if first < 0 {
            0
        } else {
            usize::try_from((from - first).max(0)).unwrap_or(0)
        };
        Ok(self.records.iter().skip(skip))
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.records.iter().map(WalRecord::mem_usage).sum()
    }
}

impl Default for WalTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WAL_SIZE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_counters_are_contiguous() {
        let mut wal = WalTracker::new(100, 3);
        let lsns: Vec<Lsn> = (0..5)
            .map(|_| wal.add(WalRecordType::ItemUpdate, vec![1]))
            .collect();
        for (i, lsn) in lsns.iter().enumerate() {
            assert_eq!(lsn.counter(), i as i64);
            assert_eq!(lsn.server_id(), 3);
        }
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut wal = WalTracker::new(3, 0);
        for i in 0..5 {
            wal.add(WalRecordType::ItemUpdate, vec![i]);
        }
        assert_eq!(wal.len(), 3);
        assert_eq!(wal.first_counter(), 2);
        assert!(wal.get(1).is_err());
        assert_eq!(wal.get(2).unwrap().data, vec![2]);
        assert_eq!(wal.get(4).unwrap().data, vec![4]);
    }

    #[test]
    fn out_of_window_read_is_not_valid() {
        let mut wal = WalTracker::new(2, 0);
        for i in 0..4 {
            wal.add(WalRecordType::ItemUpdate, vec![i]);
        }
        let err = wal.get(0).unwrap_err();
        assert_eq!(err.code(), vellum_error::ErrorCode::NotValid);
        let err = wal.iter_from(0).err().unwrap();
        assert_eq!(err.code(), vellum_error::ErrorCode::NotValid);
    }

    #[test]
    fn iter_from_returns_tail() {
        let mut wal = WalTracker::new(10, 0);
        for i in 0..5 {
            wal.add(WalRecordType::ItemUpdate, vec![i]);
        }
        let tail: Vec<u8> = wal.iter_from(3).unwrap().map(|r| r.data[0]).collect();
        assert_eq!(tail, vec![3, 4]);
    }

    #[test]
    fn init_from_loaded_window() {
        let mut wal = WalTracker::new(10, 1);
        wal.init(Lsn::new(5, 1), Lsn::new(9, 1));
        let lsn = wal.add(WalRecordType::ItemUpdate, vec![]);
        assert_eq!(lsn.counter(), 10);
    }

    #[test]
    fn replicated_records_follow_origin() {
        let mut wal = WalTracker::new(10, 2);
        let lsn = wal.add_replicated(WalRecordType::ItemUpdate, vec![], Lsn::new(41, 1));
        assert_eq!(lsn.counter(), 41);
        assert_eq!(lsn.server_id(), 2);
        let next = wal.add(WalRecordType::ItemUpdate, vec![]);
        assert_eq!(next.counter(), 42);
    }
}
