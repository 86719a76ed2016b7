//! The page store / buffer manager: owns both on-disk files, serializes
//! and deserializes pages, tracks free index pages and non-full data
//! pages, and maintains two independent LRU buffers with dirty-bit
//! write-back.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::error::BTreeResult;
use crate::page::{DataPage, IndexPage, PagePointer};
use crate::record::{Record, SENTINEL};

/// Small on purpose — the point of a teaching buffer manager is to make
/// its eviction/write-back behavior visible in the reported IO counts.
const DEFAULT_BUFFER_CAPACITY: usize = 3;

pub struct PageStore {
    index_file: File,
    data_file: File,

    order: usize,
    data_capacity: usize,

    index_buffer_capacity: usize,
    data_buffer_capacity: usize,

    next_index_page: PagePointer,
    next_data_page: PagePointer,
    free_index_pages: Vec<PagePointer>,
    non_full_data_pages: Vec<PagePointer>,
    last_data_page: Option<PagePointer>,

    /// Front = most recently used, back = least recently used.
    index_buffer: VecDeque<IndexPage>,
    data_buffer: VecDeque<DataPage>,

    pub index_reads: u32,
    pub index_writes: u32,
    pub data_reads: u32,
    pub data_writes: u32,
}

impl PageStore {
    /// Open (truncating) the index and data files for a tree of order
    /// `order`. The files are always truncated: this is a learning tool,
    /// not a durable store.
    pub fn new(
        order: usize,
        index_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
    ) -> BTreeResult<PageStore> {
        Self::open_with_truncate(order, index_path, data_path, true)
    }

    /// Open the index and data files without truncating them — used to
    /// resume a tree that was previously flushed to disk. The caller is
    /// responsible for recovering `root`/`height` (see
    /// `BTree::open`/`discover_root`), since neither is stored in the
    /// file formats themselves.
    pub fn open(
        order: usize,
        index_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
    ) -> BTreeResult<PageStore> {
        Self::open_with_truncate(order, index_path, data_path, false)
    }

    fn open_with_truncate(
        order: usize,
        index_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
        truncate: bool,
    ) -> BTreeResult<PageStore> {
        let index_file = OpenOptions::new()
            .create(true)
            .truncate(truncate)
            .read(true)
            .write(true)
            .open(index_path)?;
        let data_file = OpenOptions::new()
            .create(true)
            .truncate(truncate)
            .read(true)
            .write(true)
            .open(data_path)?;

        Ok(PageStore {
            index_file,
            data_file,
            order,
            data_capacity: 2 * order,
            index_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            data_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            next_index_page: 1,
            next_data_page: 1,
            free_index_pages: Vec::new(),
            non_full_data_pages: Vec::new(),
            last_data_page: None,
            index_buffer: VecDeque::new(),
            data_buffer: VecDeque::new(),
            index_reads: 0,
            index_writes: 0,
            data_reads: 0,
            data_writes: 0,
        })
    }

    /// Scan the index file for the one non-empty page with no parent —
    /// the root — and compute the tree's height by walking its leftmost
    /// spine. Neither the root id nor the height is part of the on-disk
    /// format (see `crate::record`'s format notes), so reopening a tree
    /// means rediscovering both by inspection rather than reading them
    /// from a header.
    pub fn discover_root(&mut self) -> BTreeResult<(Option<PagePointer>, usize)> {
        let size = self.index_page_size();
        let len = self.index_file.metadata()?.len() as usize;
        if len == 0 {
            return Ok((None, 0));
        }

        let page_count = len / size;
        let mut buf = vec![0u8; size];
        self.index_file.seek(SeekFrom::Start(0))?;

        let mut root = None;
        for page_number in 1..=page_count as PagePointer {
            self.index_file.read_exact(&mut buf)?;
            let page = IndexPage::from_bytes(&buf, self.order, page_number);
            if !page.is_empty() && page.parent_page_id.is_none() {
                root = Some(page.page_number);
                break;
            }
        }

        let height = match root {
            None => 0,
            Some(root_page) => {
                let mut height = 1;
                let mut node = self.get_index_page(root_page)?;
                while !node.is_leaf() {
                    height += 1;
                    node = self.get_index_page(node.pointers[0])?;
                }
                height
            }
        };

        Ok((root, height))
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn index_page_size(&self) -> usize {
        IndexPage::byte_size(self.order)
    }

    fn data_page_size(&self) -> usize {
        DataPage::byte_size(self.data_capacity)
    }

    /// Reset IO counters and drop both buffers. Called at the start of
    /// every public `BTree` operation — any page left dirty and
    /// unflushed from a prior operation (see `BTree::insert`'s
    /// duplicate-key path) is discarded here, not written back.
    pub fn reset_io_counters(&mut self) {
        self.index_reads = 0;
        self.index_writes = 0;
        self.data_reads = 0;
        self.data_writes = 0;
        self.index_buffer.clear();
        self.data_buffer.clear();
    }

    // ---- index pages ----------------------------------------------

    pub fn get_index_page(&mut self, page_number: PagePointer) -> BTreeResult<IndexPage> {
        if let Some(pos) = self
            .index_buffer
            .iter()
            .position(|p| p.page_number == page_number)
        {
            let page = self.index_buffer.remove(pos).unwrap();
            self.index_buffer.push_front(page.clone());
            return Ok(page);
        }
        self.load_index_page(page_number)
    }

    /// Write a mutated page back into the buffer (not to disk — only
    /// `flush_buffers` does that). Marks the page dirty.
    pub fn put_index_page(&mut self, mut page: IndexPage) -> BTreeResult<()> {
        page.mark_dirty();
        if let Some(pos) = self
            .index_buffer
            .iter()
            .position(|p| p.page_number == page.page_number)
        {
            self.index_buffer.remove(pos);
        }
        self.add_index_page_to_buffer(page)
    }

    /// Demote a page to the LRU tail without evicting it. Called after
    /// consulting a sibling whose record count disqualified it from
    /// compensation — the probe still cost a real read, but the page
    /// didn't help, so it's the next thing to go.
    pub fn reduce_usage(&mut self, page_number: PagePointer) {
        if let Some(pos) = self
            .index_buffer
            .iter()
            .position(|p| p.page_number == page_number)
        {
            let page = self.index_buffer.remove(pos).unwrap();
            self.index_buffer.push_back(page);
        }
    }

    pub fn create_new_index_page(&mut self) -> BTreeResult<IndexPage> {
        if let Some(page_number) = self.free_index_pages.first().copied() {
            let page = self.get_index_page(page_number)?;
            self.free_index_pages.retain(|&p| p != page_number);
            debug!(page_number, "reused a recycled index page");
            Ok(page)
        } else {
            let page_number = self.next_index_page;
            self.next_index_page += 1;
            let page = IndexPage::new(page_number);
            self.add_index_page_to_buffer(page.clone())?;
            debug!(page_number, "allocated a fresh index page");
            Ok(page)
        }
    }

    fn add_index_page_to_buffer(&mut self, page: IndexPage) -> BTreeResult<()> {
        if self.index_buffer.len() >= self.index_buffer_capacity {
            if let Some(evicted) = self.index_buffer.pop_back() {
                debug!(page_number = evicted.page_number, "evicting index page from buffer");
                self.save_index_page(&evicted)?;
            }
        }
        self.index_buffer.push_front(page);
        Ok(())
    }

    fn load_index_page(&mut self, page_number: PagePointer) -> BTreeResult<IndexPage> {
        let size = self.index_page_size();
        let mut buf = vec![0u8; size];
        let offset = (page_number - 1) as u64 * size as u64;
        self.index_file.seek(SeekFrom::Start(offset))?;
        self.index_file.read_exact(&mut buf)?;
        self.index_reads += 1;

        let page = IndexPage::from_bytes(&buf, self.order, page_number);
        self.add_index_page_to_buffer(page.clone())?;
        Ok(page)
    }

    fn save_index_page(&mut self, page: &IndexPage) -> BTreeResult<()> {
        if !page.is_dirty() {
            return Ok(());
        }
        if page.is_empty() && !self.free_index_pages.contains(&page.page_number) {
            self.free_index_pages.push(page.page_number);
        }

        let size = self.index_page_size();
        let offset = (page.page_number - 1) as u64 * size as u64;
        self.index_file.seek(SeekFrom::Start(offset))?;
        self.index_file.write_all(&page.to_bytes(self.order))?;
        self.index_writes += 1;
        Ok(())
    }

    // ---- data pages -------------------------------------------------

    pub fn get_data_page(&mut self, page_number: PagePointer) -> BTreeResult<DataPage> {
        if let Some(pos) = self
            .data_buffer
            .iter()
            .position(|p| p.page_number == page_number)
        {
            let page = self.data_buffer.remove(pos).unwrap();
            self.data_buffer.push_front(page.clone());
            return Ok(page);
        }
        self.load_data_page(page_number)
    }

    pub fn put_data_page(&mut self, page: DataPage) -> BTreeResult<()> {
        if let Some(pos) = self
            .data_buffer
            .iter()
            .position(|p| p.page_number == page.page_number)
        {
            self.data_buffer.remove(pos);
        }
        self.add_data_page_to_buffer(page)
    }

    pub fn create_new_data_page(&mut self) -> BTreeResult<DataPage> {
        if let Some(page_number) = self.non_full_data_pages.first().copied() {
            let page = self.get_data_page(page_number)?;
            self.non_full_data_pages.retain(|&p| p != page_number);
            Ok(page)
        } else {
            let page_number = self.next_data_page;
            self.next_data_page += 1;
            let page = DataPage::new(self.data_capacity, page_number);
            self.add_data_page_to_buffer(page.clone())?;
            Ok(page)
        }
    }

    /// Append `record` to the current tail data page, allocating or
    /// reusing a non-full page first if needed. Returns the data page it
    /// landed on.
    pub fn add_record_to_data_file(&mut self, record: Record) -> BTreeResult<PagePointer> {
        let need_new = match self.last_data_page {
            None => true,
            Some(ptr) => self.get_data_page(ptr)?.is_full(),
        };

        let mut page = if need_new {
            let page = self.create_new_data_page()?;
            self.last_data_page = Some(page.page_number);
            page
        } else {
            self.get_data_page(self.last_data_page.unwrap())?
        };

        page.add_record(record);
        let page_number = page.page_number;
        self.put_data_page(page)?;
        Ok(page_number)
    }

    pub fn remove_record_from_data_file(&mut self, page_number: PagePointer, key: i32) -> BTreeResult<()> {
        let mut page = self.get_data_page(page_number)?;
        page.remove_record(key);

        if Some(page_number) != self.last_data_page && !self.non_full_data_pages.contains(&page_number) {
            self.non_full_data_pages.push(page_number);
        }
        self.put_data_page(page)
    }

    fn add_data_page_to_buffer(&mut self, page: DataPage) -> BTreeResult<()> {
        if self.data_buffer.len() >= self.data_buffer_capacity {
            if let Some(evicted) = self.data_buffer.pop_back() {
                self.save_data_page(&evicted)?;
            }
        }
        self.data_buffer.push_front(page);
        Ok(())
    }

    fn load_data_page(&mut self, page_number: PagePointer) -> BTreeResult<DataPage> {
        let size = self.data_page_size();
        let mut buf = vec![0u8; size];
        let offset = (page_number - 1) as u64 * size as u64;
        self.data_file.seek(SeekFrom::Start(offset))?;
        self.data_file.read_exact(&mut buf)?;
        self.data_reads += 1;

        let page = DataPage::from_bytes(&buf, self.data_capacity, page_number);
        self.add_data_page_to_buffer(page.clone())?;
        Ok(page)
    }

    fn save_data_page(&mut self, page: &DataPage) -> BTreeResult<()> {
        if !page.is_dirty() {
            return Ok(());
        }
        let size = self.data_page_size();
        let offset = (page.page_number - 1) as u64 * size as u64;
        self.data_file.seek(SeekFrom::Start(offset))?;
        self.data_file.write_all(&page.to_bytes())?;
        self.data_writes += 1;
        Ok(())
    }

    // ---- shared -------------------------------------------------------

    /// Write back every dirty buffered page and drop both buffers.
    /// Invoked at the end of every user operation that completed
    /// successfully.
    pub fn flush_buffers(&mut self) -> BTreeResult<()> {
        let index_pages: Vec<IndexPage> = self.index_buffer.drain(..).collect();
        for page in index_pages {
            self.save_index_page(&page)?;
        }
        let data_pages: Vec<DataPage> = self.data_buffer.drain(..).collect();
        for page in data_pages {
            self.save_data_page(&page)?;
        }
        Ok(())
    }

    /// Human-readable dump of the index file, one line per page, `.`
    /// standing in for the sentinel. Bypasses the buffer entirely and
    /// does not affect the IO counters — a debugging aid, not a core
    /// operation.
    pub fn dump_index_file(&mut self) -> BTreeResult<String> {
        let size = self.index_page_size();
        let len = self.index_file.metadata()?.len() as usize;
        let mut out = String::from("Index file:\n");

        let mut buf = vec![0u8; size];
        self.index_file.seek(SeekFrom::Start(0))?;
        let mut page_number = 1;
        let mut read = 0;
        while read < len {
            self.index_file.read_exact(&mut buf)?;
            out.push_str(&format!("Page {}:\t", page_number));
            for chunk in buf.chunks_exact(4) {
                let word = i32::from_be_bytes(chunk.try_into().unwrap());
                if word == SENTINEL {
                    out.push_str(". ");
                } else {
                    out.push_str(&format!("{} ", word));
                }
            }
            out.push('\n');
            page_number += 1;
            read += size;
        }
        Ok(out)
    }

    /// Human-readable dump of the data file, one line per page.
    pub fn dump_data_file(&mut self) -> BTreeResult<String> {
        let size = self.data_page_size();
        let len = self.data_file.metadata()?.len() as usize;
        let mut out = String::from("Data file:\n");

        let mut buf = vec![0u8; size];
        self.data_file.seek(SeekFrom::Start(0))?;
        let mut page_number = 1;
        let mut read = 0;
        while read < len {
            self.data_file.read_exact(&mut buf)?;
            let page = DataPage::from_bytes(&buf, self.data_capacity, page_number);
            out.push_str(&format!("Page {}:\t", page_number));
            for record in &page.records {
                out.push_str(&format!(" {}:\"{}\"", record.key, record.payload));
            }
            out.push('\n');
            page_number += 1;
            read += size;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::IndexRecord;
    use tempfile::tempdir;

    fn new_store(order: usize) -> (PageStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = PageStore::new(order, dir.path().join("index.txt"), dir.path().join("data.txt")).unwrap();
        (store, dir)
    }

    #[test]
    fn index_buffer_evicts_lru_tail_and_writes_back_when_full() {
        let (mut store, _dir) = new_store(1);

        for i in 0..4 {
            let mut page = store.create_new_index_page().unwrap();
            page.add_record(0, IndexRecord { key: i, data_page_id: SENTINEL });
            store.put_index_page(page).unwrap();
        }

        assert_eq!(
            store.index_writes, 1,
            "the 4th allocation must evict and write back the capacity-3 buffer's LRU tail"
        );

        let reloaded = store.get_index_page(1).unwrap();
        assert_eq!(store.index_reads, 1, "fetching the evicted page must be a real read");
        assert_eq!(reloaded.records[0].key, 0);
    }

    #[test]
    fn empty_index_page_flush_adds_it_to_the_free_list_for_reuse() {
        let (mut store, _dir) = new_store(2);

        let page = store.create_new_index_page().unwrap();
        assert_eq!(page.page_number, 1);
        store.put_index_page(page).unwrap();
        store.flush_buffers().unwrap();

        let reused = store.create_new_index_page().unwrap();
        assert_eq!(
            reused.page_number, 1,
            "an emptied, flushed page's id must be recycled before minting a fresh one"
        );

        let next_fresh = store.create_new_index_page().unwrap();
        assert_eq!(
            next_fresh.page_number, 2,
            "once the free list is drained, allocation falls back to a fresh id"
        );
    }

    #[test]
    fn data_page_recycling_reuses_a_non_full_page() {
        let (mut store, _dir) = new_store(2);

        for k in 1..=4 {
            store
                .add_record_to_data_file(Record::new(k, format!("v{}", k)).unwrap())
                .unwrap();
        }
        let tail_after_fill = store
            .add_record_to_data_file(Record::new(5, "v5".to_string()).unwrap())
            .unwrap();
        assert_eq!(tail_after_fill, 2, "a full tail page forces allocation of a second page");

        store.remove_record_from_data_file(1, 2).unwrap();

        let recycled = store.create_new_data_page().unwrap();
        assert_eq!(
            recycled.page_number, 1,
            "a page vacated below capacity becomes reusable before minting a fresh one"
        );
    }

    #[test]
    fn flush_does_not_rewrite_clean_pages() {
        let (mut store, _dir) = new_store(2);

        store
            .add_record_to_data_file(Record::new(1, "a".to_string()).unwrap())
            .unwrap();
        store.flush_buffers().unwrap();
        assert_eq!(store.data_writes, 1);

        store.get_data_page(1).unwrap();
        store.flush_buffers().unwrap();
        assert_eq!(
            store.data_writes, 1,
            "re-flushing an untouched, clean page must not write it again"
        );
    }
}
