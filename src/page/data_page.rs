//! The heap page: a fixed-capacity bucket of [`Record`]s.

use crate::record::{Record, RECORD_SIZE};

use super::PagePointer;

/// A fixed-capacity bucket of records; the unit of heap I/O.
///
/// Unlike `IndexPage`, a `DataPage`'s on-disk layout is simply its
/// records written back-to-back with empty-slot sentinels filling any
/// remaining capacity — there is no pointer/parent bookkeeping.
#[derive(Debug, Clone)]
pub struct DataPage {
    pub page_number: PagePointer,
    capacity: usize,
    pub records: Vec<Record>,
    dirty: bool,
}

impl DataPage {
    pub fn new(capacity: usize, page_number: PagePointer) -> DataPage {
        DataPage {
            page_number,
            capacity,
            records: Vec::with_capacity(capacity),
            dirty: true,
        }
    }

    pub fn byte_size(capacity: usize) -> usize {
        capacity * RECORD_SIZE
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Append a record. Caller must have checked `!is_full()`.
    pub fn add_record(&mut self, record: Record) {
        debug_assert!(!self.is_full());
        self.records.push(record);
        self.dirty = true;
    }

    /// Remove the record with the given key, if present.
    pub fn remove_record(&mut self, key: i32) -> bool {
        if let Some(idx) = self.records.iter().position(|r| r.key == key) {
            self.records.remove(idx);
            self.dirty = true;
            true
        } else {
            false
        }
    }

    pub fn find(&self, key: i32) -> Option<&Record> {
        self.records.iter().find(|r| r.key == key)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.capacity * RECORD_SIZE);
        for record in &self.records {
            buf.extend_from_slice(&record.to_bytes());
        }
        for _ in self.records.len()..self.capacity {
            buf.extend_from_slice(&Record::empty_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8], capacity: usize, page_number: PagePointer) -> DataPage {
        let mut records = Vec::new();
        for i in 0..capacity {
            let slot: [u8; RECORD_SIZE] = buf[i * RECORD_SIZE..(i + 1) * RECORD_SIZE]
                .try_into()
                .unwrap();
            if let Some(record) = Record::from_bytes(&slot) {
                records.push(record);
            }
        }
        DataPage {
            page_number,
            capacity,
            records,
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_partial_page() {
        let mut page = DataPage::new(4, 1);
        page.add_record(Record::new(1, "a").unwrap());
        page.add_record(Record::new(2, "bb").unwrap());
        let bytes = page.to_bytes();
        assert_eq!(bytes.len(), DataPage::byte_size(4));

        let back = DataPage::from_bytes(&bytes, 4, 1);
        assert_eq!(back.records.len(), 2);
        assert_eq!(back.records[0].key, 1);
        assert_eq!(back.records[1].payload, "bb");
    }

    #[test]
    fn remove_record_marks_dirty_and_shrinks() {
        let mut page = DataPage::new(2, 1);
        page.add_record(Record::new(1, "a").unwrap());
        page.mark_clean();
        assert!(page.remove_record(1));
        assert!(page.is_dirty());
        assert!(page.records.is_empty());
        assert!(!page.remove_record(1));
    }
}
