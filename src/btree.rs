//! The algorithmic layer: insertion with compensation-before-split,
//! deletion with compensation-before-merge, internal-node deletion via
//! leaf predecessor/successor, and root collapse. Consumes `PageStore`
//! for all persistence; never touches the files directly.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{BTreeError, BTreeResult};
use crate::page::{IndexPage, IndexRecord, PagePointer};
use crate::record::Record;
use crate::store::PageStore;

/// IO counters plus tree height, as surfaced after every public
/// operation. Mirrors the original's always-printed
/// `print_reads_and_writes` output without baking stdout into the
/// library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationReport {
    pub index_reads: u32,
    pub index_writes: u32,
    pub data_reads: u32,
    pub data_writes: u32,
    pub height: usize,
}

impl std::fmt::Display for OperationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "index(reads={}, writes={}) data(reads={}, writes={}) height={}",
            self.index_reads, self.index_writes, self.data_reads, self.data_writes, self.height
        )
    }
}

/// A disk-resident B-tree index of order `d`: every non-root page holds
/// between `d` and `2d` index records.
pub struct BTree {
    store: PageStore,
    order: usize,
    root: Option<PagePointer>,
    height: usize,
}

impl BTree {
    /// Create a fresh tree of order `d`, truncating both files.
    pub fn new(order: usize, index_path: impl AsRef<Path>, data_path: impl AsRef<Path>) -> BTreeResult<BTree> {
        assert!(order > 0, "tree order must be positive");
        let store = PageStore::new(order, index_path, data_path)?;
        Ok(BTree { store, order, root: None, height: 0 })
    }

    /// Reopen a tree previously flushed to disk. Since neither the root
    /// page id nor the height is part of the on-disk format, both are
    /// rediscovered by scanning the index file (see
    /// `PageStore::discover_root`).
    pub fn open(order: usize, index_path: impl AsRef<Path>, data_path: impl AsRef<Path>) -> BTreeResult<BTree> {
        assert!(order > 0, "tree order must be positive");
        let mut store = PageStore::open(order, index_path, data_path)?;
        let (root, height) = store.discover_root()?;
        Ok(BTree { store, order, root, height })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn dump_index_file(&mut self) -> BTreeResult<String> {
        self.store.dump_index_file()
    }

    pub fn dump_data_file(&mut self) -> BTreeResult<String> {
        self.store.dump_data_file()
    }

    fn report(&self) -> OperationReport {
        OperationReport {
            index_reads: self.store.index_reads,
            index_writes: self.store.index_writes,
            data_reads: self.store.data_reads,
            data_writes: self.store.data_writes,
            height: self.height,
        }
    }

    // ---- public operations -----------------------------------------

    /// Insert `record`. Fails with `DuplicateKey` if the key is found
    /// anywhere on the descent path.
    ///
    /// The data record is appended to the tail data page *before* the
    /// descent discovers a duplicate. On `DuplicateKey` this append is
    /// left in place and the operation returns without flushing, so the
    /// next operation's `reset_io_counters` silently drops the orphaned
    /// slot — preserved from the original rather than patched, per the
    /// open question it documents.
    pub fn insert(&mut self, record: Record) -> BTreeResult<OperationReport> {
        self.store.reset_io_counters();
        let key = record.key;
        let data_page_id = self.store.add_record_to_data_file(record)?;
        let index_record = IndexRecord { key, data_page_id };

        let root = match self.root {
            Some(r) => r,
            None => self.create_root(None, None)?,
        };

        match self.insert_into_node(index_record, root) {
            Ok((Some(promoted), Some(new_child))) => {
                self.create_root(Some(promoted), Some(new_child))?;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(key, %err, "insert rejected");
                return Err(err);
            }
        }

        self.store.flush_buffers()?;
        debug!(key, height = self.height, "insert committed");
        Ok(self.report())
    }

    /// Report whether `key` is present.
    pub fn search(&mut self, key: i32) -> BTreeResult<(bool, OperationReport)> {
        self.store.reset_io_counters();
        let found = self.search_by_key(key, self.root)?;
        self.store.flush_buffers()?;
        Ok((found, self.report()))
    }

    /// Delete the record with key `key`. Fails with `KeyNotFound` if the
    /// descent terminates at a leaf without a match, or `EmptyTree` if
    /// the tree has no root.
    pub fn remove(&mut self, key: i32) -> BTreeResult<OperationReport> {
        self.store.reset_io_counters();
        let root = match self.root {
            Some(r) => r,
            None => return Err(BTreeError::EmptyTree),
        };

        let data_page_number = self.remove_from_node(key, root)?;
        match data_page_number {
            Some(page) => {
                self.store.remove_record_from_data_file(page, key)?;
                self.store.flush_buffers()?;
                debug!(key, height = self.height, "remove committed");
                Ok(self.report())
            }
            None => {
                warn!(key, "remove found no matching key");
                Err(BTreeError::KeyNotFound(key))
            }
        }
    }

    /// `remove(old_key)` followed by `insert(new_record)`. Not atomic:
    /// if the insert fails after a successful remove, the old record is
    /// gone — kept this way to match the original's `update`.
    pub fn update(&mut self, old_key: i32, new_record: Record) -> BTreeResult<OperationReport> {
        self.remove(old_key)?;
        self.insert(new_record)
    }

    /// Parenthesized in-order traversal. With `with_payloads`, each key
    /// is followed by its record's payload (fetched from the data
    /// file); otherwise just the keys are printed, one pair of
    /// parentheses per internal node.
    pub fn print(&mut self, with_payloads: bool) -> BTreeResult<(String, OperationReport)> {
        self.store.reset_io_counters();
        let root = self.root.ok_or(BTreeError::EmptyTree)?;
        let mut out = String::new();
        self.visit_node(root, with_payloads, &mut out)?;
        self.store.flush_buffers()?;
        Ok((out, self.report()))
    }

    // ---- search ------------------------------------------------------

    fn search_by_key(&mut self, key: i32, page: Option<PagePointer>) -> BTreeResult<bool> {
        let page_number = match page {
            Some(p) => p,
            None => return Ok(false),
        };
        let node = self.store.get_index_page(page_number)?;

        let mut i = 0;
        while i < node.records.len() && key > node.records[i].key {
            i += 1;
        }
        if i < node.records.len() && key == node.records[i].key {
            return Ok(true);
        }
        if node.is_leaf() {
            return Ok(false);
        }
        self.search_by_key(key, Some(node.pointers[i]))
    }

    // ---- traversal -----------------------------------------------------

    fn visit_node(&mut self, page_number: PagePointer, with_payloads: bool, out: &mut String) -> BTreeResult<()> {
        let node = self.store.get_index_page(page_number)?;
        if !with_payloads {
            out.push_str("( ");
        }

        for i in 0..node.records.len() {
            if !node.is_leaf() {
                self.visit_node(node.pointers[i], with_payloads, out)?;
            }
            if !with_payloads {
                out.push_str(&format!("{} ", node.records[i].key));
            } else {
                let data_page = self.store.get_data_page(node.records[i].data_page_id)?;
                if let Some(record) = data_page.find(node.records[i].key) {
                    out.push_str(&format!(" {}:\"{}\"", record.key, record.payload));
                }
            }
        }
        if !node.is_leaf() {
            self.visit_node(node.pointers[node.records.len()], with_payloads, out)?;
        }

        if !with_payloads {
            out.push_str(") ");
        }
        Ok(())
    }

    // ---- insertion -----------------------------------------------------

    fn create_root(&mut self, record: Option<IndexRecord>, new_child_pointer: Option<PagePointer>) -> BTreeResult<PagePointer> {
        self.height += 1;
        let previous_root = match self.root {
            Some(r) => Some(self.store.get_index_page(r)?),
            None => None,
        };

        let mut root_node = self.store.create_new_index_page()?;
        self.root = Some(root_node.page_number);

        match (record, new_child_pointer, previous_root) {
            (Some(record), Some(new_child_pointer), Some(previous_root)) => {
                root_node.add_record(0, record);
                root_node.add_pointer(0, previous_root.page_number);
                root_node.add_pointer(1, new_child_pointer);
                let root_id = root_node.page_number;
                self.store.put_index_page(root_node)?;
                self.update_parent(&[previous_root.page_number, new_child_pointer], Some(root_id))?;
            }
            _ => {
                self.store.put_index_page(root_node)?;
            }
        }

        debug!(root = self.root.unwrap(), height = self.height, "new root created");
        Ok(self.root.unwrap())
    }

    /// Descend from `page_number`, inserting `record`. Returns
    /// `(Some(record), Some(new_child))` when the node overflowed and
    /// had to split (or the parent must still absorb the promotion);
    /// `(None, None)` when the insert was fully absorbed below this
    /// point (leaf insert, or compensation satisfied the overflow).
    fn insert_into_node(
        &mut self,
        record: IndexRecord,
        page_number: PagePointer,
    ) -> BTreeResult<(Option<IndexRecord>, Option<PagePointer>)> {
        let node = self.store.get_index_page(page_number)?;
        let i = find_position(&node, record.key);
        if i < node.records.len() && node.records[i].key == record.key {
            return Err(BTreeError::DuplicateKey(record.key));
        }

        if !node.is_leaf() {
            let child = node.pointers[i];
            let (promoted, new_child) = self.insert_into_node(record, child)?;

            let (promoted, new_child) = match (promoted, new_child) {
                (Some(p), Some(c)) => (p, c),
                _ => return Ok((None, None)),
            };

            let mut node = self.store.get_index_page(page_number)?;
            if node.records.len() < 2 * self.order {
                node.add_record(i, promoted);
                node.add_pointer(i + 1, new_child);
                self.store.put_index_page(node)?;
                Ok((None, None))
            } else if self.try_compensation(page_number, promoted, Some(new_child))? {
                Ok((None, None))
            } else {
                let (record_for_parent, new_node) = self.split(page_number, i, promoted, Some(new_child))?;
                Ok((Some(record_for_parent), Some(new_node)))
            }
        } else if node.records.len() < 2 * self.order {
            let mut node = node;
            node.add_record(i, record);
            self.store.put_index_page(node)?;
            Ok((None, None))
        } else if self.try_compensation(page_number, record, None)? {
            Ok((None, None))
        } else {
            let (record_for_parent, new_node) = self.split(page_number, i, record, None)?;
            Ok((Some(record_for_parent), Some(new_node)))
        }
    }

    /// Probe the left sibling then the right sibling (same parent) for
    /// spare capacity; redistribute through the parent separator if one
    /// is found. A probed-but-unusable sibling is demoted via
    /// `reduce_usage` — the read happened, it just didn't help.
    fn try_compensation(
        &mut self,
        page_number: PagePointer,
        record: IndexRecord,
        child_pointer: Option<PagePointer>,
    ) -> BTreeResult<bool> {
        let node = self.store.get_index_page(page_number)?;
        let parent_id = match node.parent_page_id {
            Some(p) => p,
            None => return Ok(false),
        };
        let parent = self.store.get_index_page(parent_id)?;
        let index = sibling_index(&parent, page_number);
        let mut can_compensate = false;

        if index >= 1 {
            let left_id = parent.pointers[index - 1];
            let left = self.store.get_index_page(left_id)?;
            if left.records.len() < 2 * self.order {
                self.compensation(left_id, page_number, parent_id, index - 1, record, child_pointer)?;
                can_compensate = true;
            } else {
                self.store.reduce_usage(left_id);
            }
        }

        if !can_compensate && index + 1 < parent.pointers.len() {
            let right_id = parent.pointers[index + 1];
            let right = self.store.get_index_page(right_id)?;
            if right.records.len() < 2 * self.order {
                self.compensation(page_number, right_id, parent_id, index, record, child_pointer)?;
                can_compensate = true;
            } else {
                self.store.reduce_usage(right_id);
            }
        }

        Ok(can_compensate)
    }

    /// Concatenate `left.records ++ [parent.records[i]] ++ right.records`,
    /// insert `record` at its sorted position, and redistribute the
    /// result (and, for non-leaves, the pointer lists) around the
    /// middle element, which becomes the new separator.
    fn compensation(
        &mut self,
        left_id: PagePointer,
        right_id: PagePointer,
        parent_id: PagePointer,
        i: usize,
        record: IndexRecord,
        child_pointer: Option<PagePointer>,
    ) -> BTreeResult<()> {
        let mut left = self.store.get_index_page(left_id)?;
        let mut right = self.store.get_index_page(right_id)?;
        let mut parent = self.store.get_index_page(parent_id)?;

        let mut distribution = left.records.clone();
        distribution.push(parent.records[i]);
        distribution.extend(right.records.clone());

        let mut j = distribution.len();
        while j > 0 && record.key < distribution[j - 1].key {
            j -= 1;
        }
        distribution.insert(j, record);

        let middle = distribution.len() / 2;
        let middle_record = distribution[middle];
        let is_leaf = left.is_leaf();

        left.set_records(distribution[0..middle].to_vec());
        right.set_records(distribution[middle + 1..].to_vec());
        parent.set_record(i, middle_record);

        if is_leaf {
            self.store.put_index_page(left)?;
            self.store.put_index_page(right)?;
            self.store.put_index_page(parent)?;
            debug!(left_id, right_id, parent_id, "leaf compensation applied");
            return Ok(());
        }

        let mut pointer_distribution = left.pointers.clone();
        pointer_distribution.extend(right.pointers.clone());
        pointer_distribution.insert(j + 1, child_pointer.expect("non-leaf compensation requires a child pointer"));

        let left_pointers = pointer_distribution[0..middle + 1].to_vec();
        let right_pointers = pointer_distribution[middle + 1..].to_vec();
        left.set_pointers(left_pointers.clone());
        right.set_pointers(right_pointers.clone());

        self.store.put_index_page(left)?;
        self.store.put_index_page(right)?;
        self.store.put_index_page(parent)?;

        self.update_parent(&left_pointers, Some(left_id))?;
        self.update_parent(&right_pointers, Some(right_id))?;
        debug!(left_id, right_id, parent_id, "internal compensation applied");
        Ok(())
    }

    /// Temporarily insert `record`, promote the element at index `d` to
    /// the parent, and move everything after it into a freshly
    /// allocated page to the right of `node`.
    fn split(
        &mut self,
        page_number: PagePointer,
        index: usize,
        record: IndexRecord,
        child_pointer: Option<PagePointer>,
    ) -> BTreeResult<(IndexRecord, PagePointer)> {
        let mut node = self.store.get_index_page(page_number)?;
        let new_node_id = self.store.create_new_index_page()?.page_number;

        let middle = self.order;
        node.add_record(index, record);
        let record_for_parent = node.records[middle];

        let mut new_node = self.store.get_index_page(new_node_id)?;
        new_node.set_records(node.records[middle + 1..].to_vec());
        new_node.set_parent(node.parent_page_id);

        let is_leaf = node.is_leaf();
        node.set_records(node.records[0..middle].to_vec());

        if !is_leaf {
            node.add_pointer(index + 1, child_pointer.expect("non-leaf split requires a child pointer"));
            let moved_pointers = node.pointers[middle + 1..].to_vec();
            new_node.set_pointers(moved_pointers.clone());
            node.set_pointers(node.pointers[0..middle + 1].to_vec());
            self.store.put_index_page(node)?;
            self.store.put_index_page(new_node)?;
            self.update_parent(&moved_pointers, Some(new_node_id))?;
        } else {
            self.store.put_index_page(node)?;
            self.store.put_index_page(new_node)?;
        }

        debug!(page_number, new_node_id, "split");
        Ok((record_for_parent, new_node_id))
    }

    fn update_parent(&mut self, children: &[PagePointer], parent: Option<PagePointer>) -> BTreeResult<()> {
        for &child in children {
            let mut node = self.store.get_index_page(child)?;
            node.set_parent(parent);
            self.store.put_index_page(node)?;
        }
        Ok(())
    }

    // ---- deletion ------------------------------------------------------

    /// Descend to `key`; removes it (from a leaf directly, or via the
    /// predecessor/successor substitution for an internal match) and
    /// returns the data-page id it was backed by, or `None` if absent.
    fn remove_from_node(&mut self, key: i32, page_number: PagePointer) -> BTreeResult<Option<PagePointer>> {
        let node = self.store.get_index_page(page_number)?;
        let i = find_position(&node, key);
        let matched = i < node.records.len() && node.records[i].key == key;

        if matched && node.is_leaf() {
            let data_page = node.records[i].data_page_id;
            self.remove_from_leaf(page_number, i)?;
            Ok(Some(data_page))
        } else if matched {
            let data_page = node.records[i].data_page_id;
            self.remove_from_internal_node(page_number, i)?;
            Ok(Some(data_page))
        } else if node.is_leaf() {
            // `i > records.len()` here is unreachable by construction of
            // `find_position`; this is the ordinary "not found" case.
            Ok(None)
        } else {
            self.remove_from_node(key, node.pointers[i])
        }
    }

    fn remove_from_leaf(&mut self, page_number: PagePointer, i: usize) -> BTreeResult<()> {
        let mut node = self.store.get_index_page(page_number)?;
        node.remove_record_at(i);
        self.store.put_index_page(node)?;
        self.repair_node_after_removal(page_number)
    }

    /// Substitute the key at index `i` of an internal node with its
    /// in-leaf predecessor (if the left child can spare one), else its
    /// successor (if the right child can), else the predecessor anyway
    /// — the repair that follows merges as needed. The substitute is
    /// then recursively removed from the leaf it came from.
    fn remove_from_internal_node(&mut self, page_number: PagePointer, i: usize) -> BTreeResult<()> {
        let node = self.store.get_index_page(page_number)?;
        let left_child_id = node.pointers[i];
        let left_child = self.store.get_index_page(left_child_id)?;

        if left_child.records.len() > self.order {
            let (leaf, predecessor) = self.find_predecessor(left_child_id)?;
            let mut node = self.store.get_index_page(page_number)?;
            node.set_record(i, predecessor);
            self.store.put_index_page(node)?;
            self.remove_from_node(predecessor.key, leaf)?;
            return Ok(());
        }
        self.store.reduce_usage(left_child_id);

        let right_child_id = node.pointers[i + 1];
        let right_child = self.store.get_index_page(right_child_id)?;
        if right_child.records.len() > self.order {
            let (leaf, successor) = self.find_successor(right_child_id)?;
            let mut node = self.store.get_index_page(page_number)?;
            node.set_record(i, successor);
            self.store.put_index_page(node)?;
            self.remove_from_node(successor.key, leaf)?;
        } else {
            self.store.reduce_usage(right_child_id);
            let (leaf, predecessor) = self.find_predecessor(left_child_id)?;
            let mut node = self.store.get_index_page(page_number)?;
            node.set_record(i, predecessor);
            self.store.put_index_page(node)?;
            self.remove_from_node(predecessor.key, leaf)?;
        }
        Ok(())
    }

    fn find_predecessor(&mut self, start: PagePointer) -> BTreeResult<(PagePointer, IndexRecord)> {
        let mut node = self.store.get_index_page(start)?;
        loop {
            let candidate = *node.records.last().expect("non-empty node on predecessor walk");
            if node.is_leaf() {
                return Ok((node.page_number, candidate));
            }
            node = self.store.get_index_page(*node.pointers.last().unwrap())?;
        }
    }

    fn find_successor(&mut self, start: PagePointer) -> BTreeResult<(PagePointer, IndexRecord)> {
        let mut node = self.store.get_index_page(start)?;
        loop {
            let candidate = *node.records.first().expect("non-empty node on successor walk");
            if node.is_leaf() {
                return Ok((node.page_number, candidate));
            }
            node = self.store.get_index_page(node.pointers[0])?;
        }
    }

    /// Restore `d <= n` on `page_number` after a removal, or handle root
    /// collapse if it is the root. Non-root underflow first tries
    /// compensation (left sibling then right), then falls back to
    /// merging with whichever sibling exists, then repairs the parent
    /// recursively.
    fn repair_node_after_removal(&mut self, page_number: PagePointer) -> BTreeResult<()> {
        if Some(page_number) == self.root {
            return self.collapse_root_if_empty(page_number);
        }

        let node = self.store.get_index_page(page_number)?;
        if node.records.len() >= self.order {
            return Ok(());
        }

        if self.try_compensation_for_remove(page_number)? {
            return Ok(());
        }

        let node = self.store.get_index_page(page_number)?;
        let parent_id = node.parent_page_id.expect("non-root node must have a parent");
        let parent = self.store.get_index_page(parent_id)?;
        let index = sibling_index(&parent, page_number);

        if index + 1 < parent.pointers.len() {
            let right_id = parent.pointers[index + 1];
            self.merge(page_number, right_id, parent_id, index)
        } else if index >= 1 {
            let left_id = parent.pointers[index - 1];
            self.merge(left_id, page_number, parent_id, index - 1)
        } else {
            panic!("repair_node_after_removal: underflowed node has no sibling to merge with");
        }
    }

    fn collapse_root_if_empty(&mut self, page_number: PagePointer) -> BTreeResult<()> {
        let node = self.store.get_index_page(page_number)?;
        if !node.records.is_empty() {
            return Ok(());
        }

        if node.is_leaf() {
            self.root = None;
        } else {
            let new_root = node.pointers[0];
            self.root = Some(new_root);
            let mut node = node;
            node.set_records(Vec::new());
            node.set_pointers(Vec::new());
            node.set_parent(None);
            self.store.put_index_page(node)?;
            self.update_parent(&[new_root], None)?;
        }

        self.height -= 1;
        debug!(height = self.height, "root collapsed");
        Ok(())
    }

    fn try_compensation_for_remove(&mut self, page_number: PagePointer) -> BTreeResult<bool> {
        let node = self.store.get_index_page(page_number)?;
        let parent_id = match node.parent_page_id {
            Some(p) => p,
            None => return Ok(false),
        };
        let parent = self.store.get_index_page(parent_id)?;
        let index = sibling_index(&parent, page_number);
        let mut can_compensate = false;

        if index >= 1 {
            let left_id = parent.pointers[index - 1];
            let left = self.store.get_index_page(left_id)?;
            if left.records.len() > self.order {
                self.compensate_with_left_neighbour(page_number, left_id, parent_id, index - 1)?;
                can_compensate = true;
            } else {
                self.store.reduce_usage(left_id);
            }
        }

        if !can_compensate && index + 1 < parent.pointers.len() {
            let right_id = parent.pointers[index + 1];
            let right = self.store.get_index_page(right_id)?;
            if right.records.len() > self.order {
                self.compensate_with_right_neighbour(page_number, right_id, parent_id, index)?;
                can_compensate = true;
            } else {
                self.store.reduce_usage(right_id);
            }
        }

        Ok(can_compensate)
    }

    /// Push the parent separator down as `node`'s leftmost record; lift
    /// the left neighbour's last record up as the new separator.
    fn compensate_with_left_neighbour(
        &mut self,
        node_id: PagePointer,
        neighbour_id: PagePointer,
        parent_id: PagePointer,
        i: usize,
    ) -> BTreeResult<()> {
        let mut node = self.store.get_index_page(node_id)?;
        let mut neighbour = self.store.get_index_page(neighbour_id)?;
        let mut parent = self.store.get_index_page(parent_id)?;

        node.add_record(0, parent.records[i]);
        let lifted = *neighbour.records.last().expect("surplus sibling has at least one record");
        parent.set_record(i, lifted);
        neighbour.remove_record_at(neighbour.records.len() - 1);

        if !node.is_leaf() {
            let pointer = *neighbour.pointers.last().unwrap();
            node.add_pointer(0, pointer);
            neighbour.remove_pointer_value(pointer);
            self.store.put_index_page(node)?;
            self.store.put_index_page(neighbour)?;
            self.store.put_index_page(parent)?;
            return self.update_parent(&[pointer], Some(node_id));
        }

        self.store.put_index_page(node)?;
        self.store.put_index_page(neighbour)?;
        self.store.put_index_page(parent)?;
        Ok(())
    }

    /// Symmetric to `compensate_with_left_neighbour`, using the right
    /// neighbour's first record and first child.
    fn compensate_with_right_neighbour(
        &mut self,
        node_id: PagePointer,
        neighbour_id: PagePointer,
        parent_id: PagePointer,
        i: usize,
    ) -> BTreeResult<()> {
        let mut node = self.store.get_index_page(node_id)?;
        let mut neighbour = self.store.get_index_page(neighbour_id)?;
        let mut parent = self.store.get_index_page(parent_id)?;

        node.add_record(node.records.len(), parent.records[i]);
        let lifted = neighbour.records[0];
        parent.set_record(i, lifted);
        neighbour.remove_record_at(0);

        if !node.is_leaf() {
            let pointer = neighbour.pointers[0];
            node.add_pointer(node.pointers.len(), pointer);
            neighbour.remove_pointer_value(pointer);
            self.store.put_index_page(node)?;
            self.store.put_index_page(neighbour)?;
            self.store.put_index_page(parent)?;
            return self.update_parent(&[pointer], Some(node_id));
        }

        self.store.put_index_page(node)?;
        self.store.put_index_page(neighbour)?;
        self.store.put_index_page(parent)?;
        Ok(())
    }

    /// Merge `right_id` into `left_id` through the parent's separator at
    /// index `i`; empty `right_id` (freeing its page id for recycling)
    /// and recursively repair the parent.
    fn merge(&mut self, left_id: PagePointer, right_id: PagePointer, parent_id: PagePointer, i: usize) -> BTreeResult<()> {
        let mut left = self.store.get_index_page(left_id)?;
        let right = self.store.get_index_page(right_id)?;
        let mut parent = self.store.get_index_page(parent_id)?;

        let separator = parent.records[i];
        let is_leaf = left.is_leaf();
        let right_pointers = right.pointers.clone();

        let mut merged_records = left.records.clone();
        merged_records.push(separator);
        merged_records.extend(right.records.clone());
        left.set_records(merged_records);

        if !is_leaf {
            let mut merged_pointers = left.pointers.clone();
            merged_pointers.extend(right_pointers.clone());
            left.set_pointers(merged_pointers);
        }

        parent.remove_record_at(i);
        parent.remove_pointer_value(right_id);

        self.store.put_index_page(left)?;
        self.store.put_index_page(parent)?;

        if !is_leaf {
            self.update_parent(&right_pointers, Some(left_id))?;
        }

        let mut right = self.store.get_index_page(right_id)?;
        right.set_pointers(Vec::new());
        right.set_records(Vec::new());
        right.set_parent(None);
        self.store.put_index_page(right)?;

        debug!(left_id, right_id, parent_id, "merge");
        self.repair_node_after_removal(parent_id)
    }
}

/// First index `i` such that `node.records[i].key >= key`; if that slot
/// holds `key` exactly this is the match position, otherwise it's the
/// insertion point / descent child index.
fn find_position(node: &IndexPage, key: i32) -> usize {
    let mut i = node.records.len();
    while i > 0 && key < node.records[i - 1].key {
        i -= 1;
    }
    if i > 0 && node.records[i - 1].key == key {
        i - 1
    } else {
        i
    }
}

/// The index of `page_number` among its parent's child pointers.
fn sibling_index(parent: &IndexPage, page_number: PagePointer) -> usize {
    parent
        .pointers
        .iter()
        .position(|&p| p == page_number)
        .expect("parent must list this page among its children")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn open_tree(order: usize) -> (BTree, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let tree = BTree::new(order, dir.path().join("index.txt"), dir.path().join("data.txt")).unwrap();
        (tree, dir)
    }

    fn rec(key: i32) -> Record {
        Record::new(key, format!("v{}", key)).unwrap()
    }

    fn in_order_keys(tree: &mut BTree) -> Vec<i32> {
        let (dump, _) = tree.print(false).unwrap();
        dump.split_whitespace()
            .filter_map(|tok| tok.parse::<i32>().ok())
            .collect()
    }

    /// Walk the tree via `store` the way `small-db-small-db`'s
    /// `check_integrity` does after every mutating test operation, and
    /// assert P2-P5: equal leaf depth, `d <= n <= 2d` occupancy with
    /// `n+1` children on internal nodes, parent back-pointer
    /// consistency, and that the set of data-page ids referenced by
    /// index records equals the set of non-empty data pages.
    fn assert_structural_invariants(tree: &mut BTree, data_path: &Path) {
        let order = tree.order();
        let mut referenced_data_pages: HashSet<i32> = HashSet::new();
        let mut leaf_depths: Vec<usize> = Vec::new();

        if let Some(root) = tree.root {
            walk_invariants(tree, root, 1, None, order, &mut referenced_data_pages, &mut leaf_depths);
        }

        if let Some(&first) = leaf_depths.first() {
            assert!(
                leaf_depths.iter().all(|&d| d == first),
                "leaves are not all at equal depth: {:?}",
                leaf_depths
            );
        }

        let capacity = 2 * order;
        let page_size = crate::page::DataPage::byte_size(capacity);
        let file_len = std::fs::metadata(data_path).map(|m| m.len() as usize).unwrap_or(0);
        let num_pages = if page_size == 0 { 0 } else { file_len / page_size };

        let mut non_empty_data_pages: HashSet<i32> = HashSet::new();
        for page_number in 1..=num_pages as i32 {
            let page = tree.store.get_data_page(page_number).unwrap();
            if !page.records.is_empty() {
                non_empty_data_pages.insert(page_number);
            }
        }

        assert_eq!(
            referenced_data_pages, non_empty_data_pages,
            "index-record data-page-id set must equal the set of non-empty data pages"
        );
    }

    fn walk_invariants(
        tree: &mut BTree,
        page_number: PagePointer,
        depth: usize,
        expected_parent: Option<PagePointer>,
        order: usize,
        referenced: &mut HashSet<i32>,
        leaf_depths: &mut Vec<usize>,
    ) {
        let node = tree.store.get_index_page(page_number).unwrap();
        assert_eq!(
            node.parent_page_id, expected_parent,
            "parent back-pointer mismatch for page {}",
            page_number
        );

        if expected_parent.is_none() {
            assert!(!node.records.is_empty(), "a present root must hold at least one record");
            assert!(node.records.len() <= 2 * order, "root page {} overflowed capacity", page_number);
        } else {
            assert!(
                node.records.len() >= order && node.records.len() <= 2 * order,
                "page {} holds {} records, outside [{}, {}]",
                page_number,
                node.records.len(),
                order,
                2 * order
            );
        }

        let distinct_pointers: HashSet<_> = node.pointers.iter().copied().collect();
        assert_eq!(
            distinct_pointers.len(),
            node.pointers.len(),
            "page {} lists a child more than once",
            page_number
        );

        for record in &node.records {
            referenced.insert(record.data_page_id);
        }

        if node.is_leaf() {
            leaf_depths.push(depth);
        } else {
            assert_eq!(
                node.pointers.len(),
                node.records.len() + 1,
                "internal page {} has {} pointers for {} records",
                page_number,
                node.pointers.len(),
                node.records.len()
            );
            for child in node.pointers.clone() {
                walk_invariants(tree, child, depth + 1, Some(page_number), order, referenced, leaf_depths);
            }
        }
    }

    #[test]
    fn s1_split_on_fifth_insert() {
        let (mut tree, dir) = open_tree(2);
        for k in [10, 20, 30, 40] {
            tree.insert(rec(k)).unwrap();
        }
        assert_eq!(tree.height(), 1);

        let report = tree.insert(rec(50)).unwrap();
        assert_eq!(tree.height(), 2);
        assert_eq!(in_order_keys(&mut tree), vec![10, 20, 30, 40, 50]);
        assert_eq!(report.index_writes, 3, "splitting the 5th insert writes the two halves and the new root");
        assert_structural_invariants(&mut tree, &dir.path().join("data.txt"));
    }

    #[test]
    fn s2_compensation_avoids_split() {
        let (mut tree, dir) = open_tree(2);
        for k in [10, 20, 30, 40, 50] {
            tree.insert(rec(k)).unwrap();
        }
        assert_eq!(tree.height(), 2);

        tree.insert(rec(5)).unwrap();
        assert_eq!(tree.height(), 2, "compensation must not grow the tree");
        assert_eq!(in_order_keys(&mut tree), vec![5, 10, 20, 30, 40, 50]);
        assert_structural_invariants(&mut tree, &dir.path().join("data.txt"));

        tree.insert(rec(25)).unwrap();
        assert_eq!(tree.height(), 2, "second compensation must also not split");
        assert_eq!(in_order_keys(&mut tree), vec![5, 10, 20, 25, 30, 40, 50]);
        assert_structural_invariants(&mut tree, &dir.path().join("data.txt"));
    }

    #[test]
    fn s3_duplicate_detection() {
        let (mut tree, dir) = open_tree(2);
        tree.insert(rec(42)).unwrap();
        let err = tree.insert(rec(42)).unwrap_err();
        assert!(matches!(err, BTreeError::DuplicateKey(42)));

        let (found, _) = tree.search(42).unwrap();
        assert!(found);
        assert_structural_invariants(&mut tree, &dir.path().join("data.txt"));
    }

    #[test]
    fn s4_delete_causing_merge() {
        let (mut tree, dir) = open_tree(2);
        for k in [10, 20, 30, 40, 50] {
            tree.insert(rec(k)).unwrap();
        }
        assert_eq!(tree.height(), 2);

        tree.remove(10).unwrap();
        assert_eq!(tree.height(), 1, "merge must collapse the root");
        assert_eq!(in_order_keys(&mut tree), vec![20, 30, 40, 50]);
        assert_structural_invariants(&mut tree, &dir.path().join("data.txt"));
    }

    #[test]
    fn s5_internal_delete_via_predecessor() {
        let (mut tree, dir) = open_tree(2);
        for k in [10, 20, 25, 30, 40, 50, 60] {
            tree.insert(rec(k)).unwrap();
        }

        tree.remove(30).unwrap();
        let (found, _) = tree.search(30).unwrap();
        assert!(!found);
        assert_eq!(in_order_keys(&mut tree), vec![10, 20, 25, 40, 50, 60]);
        assert_structural_invariants(&mut tree, &dir.path().join("data.txt"));
    }

    #[test]
    fn s6_round_trip_through_reopen() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("index.txt");
        let data_path = dir.path().join("data.txt");
        let keys = [5, 1, 7, 3, 9, 2, 8, 4, 6];

        {
            let mut tree = BTree::new(2, &index_path, &data_path).unwrap();
            for &k in &keys {
                tree.insert(rec(k)).unwrap();
            }
        }

        let mut reopened = BTree::open(2, &index_path, &data_path).unwrap();
        for &k in &keys {
            let (found, _) = reopened.search(k).unwrap();
            assert!(found, "key {} missing after reopen", k);
        }
        assert_eq!(in_order_keys(&mut reopened), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_structural_invariants(&mut reopened, &data_path);
    }

    #[test]
    fn remove_unknown_key_reports_not_found() {
        let (mut tree, _dir) = open_tree(2);
        tree.insert(rec(1)).unwrap();
        let err = tree.remove(999).unwrap_err();
        assert!(matches!(err, BTreeError::KeyNotFound(999)));
    }

    #[test]
    fn remove_on_empty_tree_reports_empty() {
        let (mut tree, _dir) = open_tree(2);
        let err = tree.remove(1).unwrap_err();
        assert!(matches!(err, BTreeError::EmptyTree));
    }

    #[test]
    fn update_replaces_key() {
        let (mut tree, dir) = open_tree(2);
        tree.insert(rec(1)).unwrap();
        tree.insert(rec(2)).unwrap();
        tree.update(1, rec(99)).unwrap();

        let (found_old, _) = tree.search(1).unwrap();
        let (found_new, _) = tree.search(99).unwrap();
        assert!(!found_old);
        assert!(found_new);
        assert_structural_invariants(&mut tree, &dir.path().join("data.txt"));
    }

    #[test]
    fn p8_random_insert_then_remove_all_empties_the_tree() {
        let (mut tree, dir) = open_tree(2);
        let data_path = dir.path().join("data.txt");
        let mut rng = StdRng::seed_from_u64(7);

        let mut keys: Vec<i32> = (1..=60).collect();
        keys.shuffle(&mut rng);
        for &k in &keys {
            tree.insert(rec(k)).unwrap();
        }
        assert_eq!(in_order_keys(&mut tree).len(), 60);
        assert_structural_invariants(&mut tree, &data_path);

        keys.shuffle(&mut rng);
        for &k in &keys {
            tree.remove(k).unwrap();
        }

        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert_structural_invariants(&mut tree, &data_path);
    }

    #[test]
    fn p1_in_order_traversal_stays_sorted_under_random_churn() {
        let (mut tree, dir) = open_tree(2);
        let data_path = dir.path().join("data.txt");
        let mut rng = StdRng::seed_from_u64(42);
        let mut present: Vec<i32> = Vec::new();

        let mut keys: Vec<i32> = (1..=120).collect();
        keys.shuffle(&mut rng);

        for &k in &keys {
            tree.insert(rec(k)).unwrap();
            present.push(k);

            if present.len() % 5 == 0 {
                let idx = rng.gen_range(0..present.len());
                let removed = present.remove(idx);
                tree.remove(removed).unwrap();
            }

            let mut sorted = in_order_keys(&mut tree);
            let mut expected = present.clone();
            sorted.sort_unstable();
            expected.sort_unstable();
            assert_eq!(sorted, expected);
            assert_structural_invariants(&mut tree, &data_path);
        }
    }
}
