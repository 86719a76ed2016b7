//! The B-tree node: an ordered list of `IndexRecord`s interleaved with
//! child page ids, plus a back-pointer to the parent page.

use crate::record::SENTINEL;

use super::PagePointer;

/// A `(key, data_page_id)` entry stored inside an index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: i32,
    pub data_page_id: PagePointer,
}

/// A B-tree node of order `d`.
///
/// `records` holds `n in [0, 2d]` entries sorted ascending by key.
/// `pointers` is either empty (a leaf) or has exactly `records.len() + 1`
/// entries (an internal node): `pointers[i]` is the subtree holding keys
/// less than `records[i].key` and greater than or equal to
/// `records[i-1].key`.
#[derive(Debug, Clone)]
pub struct IndexPage {
    pub page_number: PagePointer,
    pub records: Vec<IndexRecord>,
    pub pointers: Vec<PagePointer>,
    pub parent_page_id: Option<PagePointer>,
    dirty: bool,
}

impl IndexPage {
    pub fn new(page_number: PagePointer) -> IndexPage {
        IndexPage {
            page_number,
            records: Vec::new(),
            pointers: Vec::new(),
            parent_page_id: None,
            dirty: true,
        }
    }

    /// Bytes on disk for order `d`: `24d + 8`, i.e. `6d + 2` big-endian
    /// i32 words (`p0`, then `d` triples, then `parent`).
    pub fn byte_size(order: usize) -> usize {
        24 * order + 8
    }

    pub fn is_leaf(&self) -> bool {
        self.pointers.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.pointers.is_empty() && self.parent_page_id.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn add_record(&mut self, position: usize, record: IndexRecord) {
        self.records.insert(position, record);
        self.dirty = true;
    }

    pub fn remove_record_at(&mut self, position: usize) -> IndexRecord {
        self.dirty = true;
        self.records.remove(position)
    }

    pub fn set_record(&mut self, position: usize, record: IndexRecord) {
        self.records[position] = record;
        self.dirty = true;
    }

    pub fn set_records(&mut self, records: Vec<IndexRecord>) {
        self.records = records;
        self.dirty = true;
    }

    pub fn add_pointer(&mut self, position: usize, pointer: PagePointer) {
        self.pointers.insert(position, pointer);
        self.dirty = true;
    }

    pub fn remove_pointer_value(&mut self, pointer: PagePointer) {
        if let Some(idx) = self.pointers.iter().position(|&p| p == pointer) {
            self.pointers.remove(idx);
            self.dirty = true;
        }
    }

    pub fn set_pointers(&mut self, pointers: Vec<PagePointer>) {
        self.pointers = pointers;
        self.dirty = true;
    }

    pub fn set_parent(&mut self, parent: Option<PagePointer>) {
        self.parent_page_id = parent;
        self.dirty = true;
    }

    pub fn to_bytes(&self, order: usize) -> Vec<u8> {
        let capacity = 2 * order;
        let mut words: Vec<i32> = Vec::with_capacity(6 * order + 2);

        words.push(self.pointers.first().copied().unwrap_or(SENTINEL));
        for i in 0..capacity {
            if i < self.records.len() {
                words.push(self.records[i].key);
                words.push(self.records[i].data_page_id);
            } else {
                words.push(SENTINEL);
                words.push(SENTINEL);
            }
            words.push(self.pointers.get(i + 1).copied().unwrap_or(SENTINEL));
        }
        words.push(self.parent_page_id.unwrap_or(SENTINEL));

        let mut buf = Vec::with_capacity(words.len() * 4);
        for word in words {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        buf
    }

    /// Decode a page from its raw bytes. Mirrors the original's
    /// `load_index_page`: every pointer slot in the stream (the leading
    /// `p0` and each record's trailing pointer) is kept only if it isn't
    /// the sentinel, so a leaf's pointer list ends up empty and an
    /// internal node's ends up exactly `records.len() + 1` long, in
    /// stream order.
    pub fn from_bytes(buf: &[u8], order: usize, page_number: PagePointer) -> IndexPage {
        let capacity = 2 * order;
        let word_count = 6 * order + 2;
        let mut words = Vec::with_capacity(word_count);
        for i in 0..word_count {
            words.push(i32::from_be_bytes(buf[i * 4..(i + 1) * 4].try_into().unwrap()));
        }

        let mut pointers = Vec::new();
        let mut records = Vec::new();

        if words[0] != SENTINEL {
            pointers.push(words[0]);
        }

        let mut idx = 1;
        for _ in 0..capacity {
            let key = words[idx];
            let data_page_id = words[idx + 1];
            let pointer = words[idx + 2];
            idx += 3;

            if key != SENTINEL || data_page_id != SENTINEL {
                records.push(IndexRecord { key, data_page_id });
            }
            if pointer != SENTINEL {
                pointers.push(pointer);
            }
        }

        let parent_page_id = if words[idx] != SENTINEL {
            Some(words[idx])
        } else {
            None
        };

        IndexPage {
            page_number,
            records,
            pointers,
            parent_page_id,
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_leaf_page() {
        let mut page = IndexPage::new(3);
        page.add_record(0, IndexRecord { key: 10, data_page_id: 7 });
        page.add_record(1, IndexRecord { key: 20, data_page_id: 8 });

        let bytes = page.to_bytes(2);
        assert_eq!(bytes.len(), IndexPage::byte_size(2));

        let back = IndexPage::from_bytes(&bytes, 2, 3);
        assert!(back.is_leaf());
        assert_eq!(back.records.len(), 2);
        assert_eq!(back.records[1].key, 20);
        assert!(back.parent_page_id.is_none());
    }

    #[test]
    fn round_trips_internal_page_with_parent() {
        let mut page = IndexPage::new(5);
        page.set_records(vec![IndexRecord { key: 30, data_page_id: SENTINEL }]);
        page.set_pointers(vec![1, 2]);
        page.set_parent(Some(9));

        let bytes = page.to_bytes(2);
        let back = IndexPage::from_bytes(&bytes, 2, 5);
        assert!(!back.is_leaf());
        assert_eq!(back.pointers, vec![1, 2]);
        assert_eq!(back.parent_page_id, Some(9));
    }

    #[test]
    fn empty_page_round_trips_to_empty() {
        let page = IndexPage::new(1);
        let bytes = page.to_bytes(2);
        let back = IndexPage::from_bytes(&bytes, 2, 1);
        assert!(back.is_empty());
    }
}
