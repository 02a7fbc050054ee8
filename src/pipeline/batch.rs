use parking_lot::Mutex;

use crate::packet::BatchRecord;

/// Default number of records per flushed batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Bounded, ordered accumulator of capture records.
///
/// Appending and the extract-and-reset that happens when the batch fills are
/// one critical section: concurrent appenders never observe more than
/// `capacity` records, and an extracted batch is owned exclusively by the
/// caller that received it.
pub struct RecordBatch {
    records: Mutex<Vec<BatchRecord>>,
    capacity: usize,
}

impl RecordBatch {
    /// Creates an empty batch. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends a record. Returns the full batch when this append filled it.
    pub fn append(&self, record: BatchRecord) -> Option<Vec<BatchRecord>> {
        let mut records = self.records.lock();
        records.push(record);

        if records.len() >= self.capacity {
            return Some(std::mem::replace(
                &mut *records,
                Vec::with_capacity(self.capacity),
            ));
        }

        None
    }

    /// Extracts whatever is buffered, possibly nothing.
    pub fn drain(&self) -> Vec<BatchRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RecordBatch {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}
