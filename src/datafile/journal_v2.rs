//! Journal v2 (indexed): single mmap-able file produced by compacting a
//! datafile's v1 journal once it stops accepting writes (§4.3). Unlike v1
//! it is never appended to — `JournalV2Builder` produces a complete file in
//! one pass, and `JournalV2` only ever reads it back via `memmap2`.
//!
//! Grounded on the pager's use of `memmap2::MmapMut`/`Mmap` for whole-file
//! views (`src/pager/mod.rs`), generalized to a read-only sorted index.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{EngineError, Result};
use crate::types::checksum::crc32_of;
use crate::types::{FileNo, MetricId, TimeUsec};

const MAGIC: &[u8; 8] = b"TSEJNL2\0";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 48;
const EXTENT_ENTRY_SIZE: usize = 8 + 4 + 2; // offset, size, index
const METRIC_ENTRY_SIZE: usize = 16 + 4 + 4 + 4 + 2; // uuid, page_offset, first_s, last_s, entries
const PAGE_ENTRY_SIZE: usize = 4 + 4 + 2 + 2 + 2 + 1 + 1;

pub fn journal_v2_path(dir: &Path, tier: u8, file_no: FileNo) -> PathBuf {
    dir.join(format!("journalfile-v2-{tier}-{file_no}.njfv2"))
}

/// One page entry as it will be stored relative to a metric's time
/// envelope: deltas are seconds from the metric's `first_time`/`last_time`
/// to keep the on-disk representation narrow.
#[derive(Debug, Clone, Copy)]
pub struct PageListEntry {
    pub delta_start_s: u32,
    pub delta_end_s: u32,
    pub extent_index: u16,
    pub page_length: u16,
    pub update_every_s: u16,
    pub page_type: u8,
}

#[derive(Debug, Clone)]
pub struct MetricEntryInput {
    pub uuid: MetricId,
    pub first_time_s: u32,
    pub last_time_s: u32,
    pub pages: Vec<PageListEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtentTableEntry {
    pub datafile_offset: u64,
    pub datafile_size: u32,
}

/// Builds a v2 file from the extent table plus per-metric page lists
/// produced by migration (§4.3). Metrics must already be sorted by UUID.
pub struct JournalV2Builder {
    extents: Vec<ExtentTableEntry>,
    metrics: Vec<MetricEntryInput>,
}

impl JournalV2Builder {
    pub fn new(extents: Vec<ExtentTableEntry>, mut metrics: Vec<MetricEntryInput>) -> Self {
        metrics.sort_by_key(|m| m.uuid);
        JournalV2Builder { extents, metrics }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut metric_table = Vec::new();
        let mut page_lists = Vec::new();
        let mut running_offset: u32 = 0;

        for m in &self.metrics {
            metric_table.extend_from_slice(&m.uuid.as_bytes());
            metric_table.extend_from_slice(&running_offset.to_le_bytes());
            metric_table.extend_from_slice(&m.first_time_s.to_le_bytes());
            metric_table.extend_from_slice(&m.last_time_s.to_le_bytes());
            let entries: u16 = m
                .pages
                .len()
                .try_into()
                .map_err(|_| EngineError::invalid("metric has more than u16::MAX pages"))?;
            metric_table.extend_from_slice(&entries.to_le_bytes());

            for p in &m.pages {
                page_lists.extend_from_slice(&p.delta_start_s.to_le_bytes());
                page_lists.extend_from_slice(&p.delta_end_s.to_le_bytes());
                page_lists.extend_from_slice(&p.extent_index.to_le_bytes());
                page_lists.extend_from_slice(&p.page_length.to_le_bytes());
                page_lists.extend_from_slice(&p.update_every_s.to_le_bytes());
                page_lists.push(p.page_type);
                page_lists.push(0);
            }
            running_offset += PAGE_ENTRY_SIZE as u32 * m.pages.len() as u32;
        }

        let mut extent_table = Vec::new();
        for (i, e) in self.extents.iter().enumerate() {
            extent_table.extend_from_slice(&e.datafile_offset.to_le_bytes());
            extent_table.extend_from_slice(&e.datafile_size.to_le_bytes());
            let index: u16 = i
                .try_into()
                .map_err(|_| EngineError::invalid("more than u16::MAX extents"))?;
            extent_table.extend_from_slice(&index.to_le_bytes());
        }

        let extents_offset = HEADER_SIZE as u32;
        let metrics_offset = extents_offset + extent_table.len() as u32;
        let page_lists_offset = metrics_offset + metric_table.len() as u32;

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // reserved
        let (first, last) = self.time_bounds();
        header.extend_from_slice(&first.to_le_bytes());
        header.extend_from_slice(&last.to_le_bytes());
        header.extend_from_slice(&(self.metrics.len() as u32).to_le_bytes());
        header.extend_from_slice(&(self.extents.len() as u32).to_le_bytes());
        header.extend_from_slice(&metrics_offset.to_le_bytes());
        header.extend_from_slice(&extents_offset.to_le_bytes());
        header.extend_from_slice(&page_lists_offset.to_le_bytes());
        header.resize(HEADER_SIZE, 0);

        let mut body = header;
        body.extend_from_slice(&extent_table);
        body.extend_from_slice(&metric_table);
        body.extend_from_slice(&page_lists);
        let trailer = crc32_of(&[&body]);
        body.extend_from_slice(&trailer.to_le_bytes());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&body)?;
        file.sync_data()?;
        Ok(())
    }

    fn time_bounds(&self) -> (TimeUsec, TimeUsec) {
        let first = self.metrics.iter().map(|m| m.first_time_s as u64).min().unwrap_or(0);
        let last = self.metrics.iter().map(|m| m.last_time_s as u64).max().unwrap_or(0);
        (first, last)
    }
}

/// One resolved page-detail record, as handed to the query planner's PDC.
#[derive(Debug, Clone, Copy)]
pub struct PageDetail {
    pub datafile_offset: u64,
    pub datafile_size: u32,
    pub start_time_s: u32,
    pub end_time_s: u32,
    pub page_length: u16,
    pub update_every_s: u16,
}

/// A read-only mmap view over a v2 file. Kept alive for as long as any
/// query references it; the datafile manager unmaps idle v2 files after a
/// grace period (§4.3).
pub struct JournalV2 {
    mmap: Mmap,
}

impl JournalV2 {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_SIZE + 4 {
            return Err(EngineError::corruption("journal v2 file too small"));
        }
        if &mmap[..MAGIC.len()] != MAGIC {
            return Err(EngineError::corruption("invalid journal v2 magic"));
        }
        let version = u16::from_le_bytes(mmap[8..10].try_into().expect("2 bytes"));
        if version != VERSION {
            return Err(EngineError::corruption(format!(
                "unsupported journal v2 version {version}"
            )));
        }
        let body_len = mmap.len() - 4;
        let expected = u32::from_le_bytes(
            mmap[body_len..].try_into().expect("4 bytes"),
        );
        if crc32_of(&[&mmap[..body_len]]) != expected {
            return Err(EngineError::corruption("journal v2 trailer checksum mismatch"));
        }
        Ok(JournalV2 { mmap })
    }

    /// Header layout: magic(8) + version(2) + reserved(2) + first(8) +
    /// last(8) = 28, then the four `u32` fields below.
    fn metric_count(&self) -> u32 {
        u32::from_le_bytes(self.mmap[28..32].try_into().expect("4 bytes"))
    }

    fn extent_count(&self) -> u32 {
        u32::from_le_bytes(self.mmap[32..36].try_into().expect("4 bytes"))
    }

    fn metrics_offset(&self) -> usize {
        u32::from_le_bytes(self.mmap[36..40].try_into().expect("4 bytes")) as usize
    }

    fn extents_offset(&self) -> usize {
        u32::from_le_bytes(self.mmap[40..44].try_into().expect("4 bytes")) as usize
    }

    fn page_lists_offset(&self) -> usize {
        u32::from_le_bytes(self.mmap[44..48].try_into().expect("4 bytes")) as usize
    }

    /// The tier-wide time envelope recorded at build time: the min/max of
    /// every metric's `first_time_s`/`last_time_s` in this index.
    pub fn time_bounds(&self) -> (TimeUsec, TimeUsec) {
        let first = TimeUsec::from_le_bytes(self.mmap[12..20].try_into().expect("8 bytes"));
        let last = TimeUsec::from_le_bytes(self.mmap[20..28].try_into().expect("8 bytes"));
        (first, last)
    }

    fn extent(&self, index: u16) -> ExtentTableEntry {
        let base = self.extents_offset() + index as usize * EXTENT_ENTRY_SIZE;
        let buf = &self.mmap[base..base + EXTENT_ENTRY_SIZE];
        ExtentTableEntry {
            datafile_offset: u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
            datafile_size: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
        }
    }

    /// Binary-searches the sorted metric table for `uuid` and returns all
    /// of its page-detail records, each resolved against the extent table.
    pub fn lookup(&self, uuid: MetricId) -> Vec<PageDetail> {
        let count = self.metric_count() as usize;
        let base = self.metrics_offset();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let entry = &self.mmap[base + mid * METRIC_ENTRY_SIZE..base + (mid + 1) * METRIC_ENTRY_SIZE];
            let mut id_bytes = [0u8; 16];
            id_bytes.copy_from_slice(&entry[0..16]);
            let mid_uuid = MetricId::from_bytes(id_bytes);
            if mid_uuid < uuid {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= count {
            return Vec::new();
        }
        let entry = &self.mmap[base + lo * METRIC_ENTRY_SIZE..base + (lo + 1) * METRIC_ENTRY_SIZE];
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&entry[0..16]);
        if MetricId::from_bytes(id_bytes) != uuid {
            return Vec::new();
        }
        let page_offset = u32::from_le_bytes(entry[16..20].try_into().expect("4 bytes")) as usize;
        let first_time_s = u32::from_le_bytes(entry[20..24].try_into().expect("4 bytes"));
        let num_entries = u16::from_le_bytes(entry[28..30].try_into().expect("2 bytes")) as usize;

        let page_base = self.page_lists_offset() + page_offset;
        let mut out = Vec::with_capacity(num_entries);
        for i in 0..num_entries {
            let p = &self.mmap[page_base + i * PAGE_ENTRY_SIZE..page_base + (i + 1) * PAGE_ENTRY_SIZE];
            let delta_start = u32::from_le_bytes(p[0..4].try_into().expect("4 bytes"));
            let delta_end = u32::from_le_bytes(p[4..8].try_into().expect("4 bytes"));
            let extent_index = u16::from_le_bytes(p[8..10].try_into().expect("2 bytes"));
            let page_length = u16::from_le_bytes(p[10..12].try_into().expect("2 bytes"));
            let update_every_s = u16::from_le_bytes(p[12..14].try_into().expect("2 bytes"));
            let extent = self.extent(extent_index);
            out.push(PageDetail {
                datafile_offset: extent.datafile_offset,
                datafile_size: extent.datafile_size,
                start_time_s: first_time_s + delta_start,
                end_time_s: first_time_s + delta_end,
                page_length,
                update_every_s,
            });
        }
        out
    }

    pub fn metric_count_public(&self) -> u32 {
        self.metric_count()
    }

    pub fn extent_count_public(&self) -> u32 {
        self.extent_count()
    }
}
