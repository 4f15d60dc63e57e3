//! Datafile / Journal Manager (§4.3): owns the append-only `.ndf` files for
//! a tier, their v1 write-ahead logs, and the v2 indexes produced once a
//! datafile stops accepting writes.

pub mod descriptor;
pub mod journal_v1;
pub mod journal_v2;
pub mod migration;
pub mod superblock;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::types::{FileNo, Tier};

use journal_v1::{journal_v1_path, JournalV1};
use journal_v2::{journal_v2_path, JournalV2};
use superblock::Superblock;

/// Reasons a datafile can be held open; deletion requires every counter at
/// zero (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquireReason {
    OpenCache,
    PageDetails,
    Retention,
}

const REASON_COUNT: usize = 3;

/// Single-flight completion signal for an in-flight extent read (§4.5
/// dedup). A blocking `Condvar` rather than `tokio::sync::Notify` because
/// `ExtentPageDetailList::execute_sync` is a plain synchronous call, not an
/// async fn, and losing callers must block the calling thread until the
/// winner's cache insert has actually happened.
#[derive(Default)]
pub struct PendingRead {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl PendingRead {
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.condvar.wait(&mut done);
        }
    }

    fn signal(&self) {
        *self.done.lock() = true;
        self.condvar.notify_all();
    }
}

fn reason_index(reason: AcquireReason) -> usize {
    match reason {
        AcquireReason::OpenCache => 0,
        AcquireReason::PageDetails => 1,
        AcquireReason::Retention => 2,
    }
}

/// A single `datafile-<tier>-<fileno>.ndf`, its v1 journal, and (once
/// produced) its v2 index.
pub struct Datafile {
    pub tier: Tier,
    pub file_no: FileNo,
    path: PathBuf,
    file: Mutex<File>,
    pos: AtomicU64,
    reason_counts: [AtomicI64; REASON_COUNT],
    writer_count: AtomicI64,
    pending_reads: Mutex<HashMap<u64, Arc<PendingRead>>>,
    populated: Mutex<bool>,
    v2: Mutex<Option<Arc<JournalV2>>>,
}

impl Datafile {
    fn create(dir: &Path, tier: Tier, file_no: FileNo) -> Result<Arc<Self>> {
        let path = dir.join(format!("datafile-{tier}-{file_no}.ndf"));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let pos = if len == 0 {
            let mut buf = vec![0u8; Superblock::encoded_len()];
            Superblock::new(tier, file_no).write(&mut buf)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;
            file.sync_data()?;
            buf.len() as u64
        } else {
            let mut buf = vec![0u8; Superblock::encoded_len()];
            file.seek(SeekFrom::Start(0))?;
            std::io::Read::read_exact(&mut file, &mut buf)?;
            let sb = Superblock::read(&buf)?;
            if sb.tier != tier || sb.file_no != file_no {
                return Err(EngineError::corruption(
                    "datafile superblock identity mismatch",
                ));
            }
            len
        };

        Ok(Arc::new(Datafile {
            tier,
            file_no,
            path,
            file: Mutex::new(file),
            pos: AtomicU64::new(pos),
            reason_counts: Default::default(),
            writer_count: AtomicI64::new(0),
            pending_reads: Mutex::new(HashMap::new()),
            populated: Mutex::new(false),
            v2: Mutex::new(None),
        }))
    }

    fn open_existing(path: PathBuf) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut buf = vec![0u8; Superblock::encoded_len()];
        std::io::Read::read_exact(&mut file, &mut buf)?;
        let sb = Superblock::read(&buf)?;
        let len = file.metadata()?.len();
        Ok(Arc::new(Datafile {
            tier: sb.tier,
            file_no: sb.file_no,
            path,
            file: Mutex::new(file),
            pos: AtomicU64::new(len),
            reason_counts: Default::default(),
            writer_count: AtomicI64::new(0),
            pending_reads: Mutex::new(HashMap::new()),
            populated: Mutex::new(false),
            v2: Mutex::new(None),
        }))
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    /// Reserves `len` bytes at the current tail and returns the offset to
    /// write at. Held only for the reservation itself; I/O happens outside
    /// the lock (§5 lock discipline for the datafile writer spinlock).
    pub fn reserve(&self, len: u64) -> u64 {
        self.writer_count.fetch_add(1, Ordering::AcqRel);
        self.pos.fetch_add(len, Ordering::AcqRel)
    }

    pub fn finish_write(&self) {
        self.writer_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let file = self.file.lock();
        file.write_all_at(bytes, offset)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let file = self.file.lock();
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn acquire(&self, reason: AcquireReason) {
        self.reason_counts[reason_index(reason)].fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self, reason: AcquireReason) {
        self.reason_counts[reason_index(reason)].fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_referenced(&self) -> bool {
        self.reason_counts.iter().any(|c| c.load(Ordering::Acquire) > 0)
            || self.writer_count.load(Ordering::Acquire) > 0
    }

    pub fn is_populated(&self) -> bool {
        *self.populated.lock()
    }

    pub fn mark_populated(&self) {
        *self.populated.lock() = true;
    }

    pub fn v2(&self) -> Option<Arc<JournalV2>> {
        self.v2.lock().clone()
    }

    pub fn attach_v2(&self, v2: Arc<JournalV2>) {
        *self.v2.lock() = Some(v2);
    }

    pub fn detach_v2(&self) {
        *self.v2.lock() = None;
    }

    /// Registers interest in an in-flight extent read, returning the
    /// completion signal to wait on if one is already running (§4.5
    /// dedup). The caller that gets `None` back owns the read and must
    /// call `complete_pending_read` when done.
    pub fn begin_pending_read(&self, extent_offset: u64) -> Option<Arc<PendingRead>> {
        let mut pending = self.pending_reads.lock();
        if let Some(signal) = pending.get(&extent_offset) {
            return Some(signal.clone());
        }
        pending.insert(extent_offset, Arc::new(PendingRead::default()));
        None
    }

    pub fn complete_pending_read(&self, extent_offset: u64) {
        if let Some(signal) = self.pending_reads.lock().remove(&extent_offset) {
            signal.signal();
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Per-tier runtime state (§3 "Tier context").
pub struct TierContext {
    pub tier: Tier,
    pub dir: PathBuf,
    datafiles: RwLock<Vec<Arc<Datafile>>>,
    pub max_disk_space: AtomicU64,
    pub max_retention_seconds: AtomicU64,
    pub default_compression: crate::types::CompressionAlgorithm,
    pub target_datafiles: u32,
    pub min_file_size: u64,
    pub max_file_size: u64,
    journals_v1: Mutex<HashMap<FileNo, JournalV1>>,
}

const FILENAME_PREFIX: &str = "datafile-";

impl TierContext {
    /// Scans `dir` for `datafile-<tier>-<fileno>.ndf`, validates each
    /// superblock, and links survivors into a sorted list. No datafiles on
    /// disk creates `(tier, fileno=1)` (§4.3 init).
    pub fn init(
        dir: &Path,
        tier: Tier,
        max_disk_space: u64,
        max_retention_seconds: u64,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let mut found: Vec<(FileNo, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(FILENAME_PREFIX) {
                if let Some((t, no)) = parse_tier_fileno(rest) {
                    if t == tier {
                        found.push((no, entry.path()));
                    }
                }
            }
        }
        found.sort_by_key(|(no, _)| *no);

        let mut datafiles = Vec::new();
        let mut journals_v1 = HashMap::new();
        for (no, path) in found {
            match Datafile::open_existing(path) {
                Ok(df) => {
                    let jpath = journal_v1_path(dir, tier, no);
                    if jpath.exists() {
                        match JournalV1::create(&jpath) {
                            Ok(mut j) => {
                                // Startup replay (§4.3): verify every record's CRC and
                                // advance `next_id` past whatever was last committed, so a
                                // fresh append after a restart never reuses a transaction
                                // id. Extent bytes themselves need no replay here: `pos`
                                // was already recovered from the datafile's own length.
                                match j.replay(|_| Ok(())) {
                                    Ok(applied) => {
                                        info!(tier, file_no = no, applied, "journal.replay.completed");
                                        journals_v1.insert(no, j);
                                    }
                                    Err(err) => {
                                        warn!(file_no = no, error = %err, "dropping datafile with unreadable journal");
                                        continue;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(file_no = no, error = %err, "dropping datafile with unreadable journal");
                                continue;
                            }
                        }
                    }
                    datafiles.push(df);
                }
                Err(err) => {
                    warn!(file_no = no, error = %err, "dropping datafile with invalid superblock");
                }
            }
        }

        let ctx = Arc::new(TierContext {
            tier,
            dir: dir.to_path_buf(),
            datafiles: RwLock::new(datafiles),
            max_disk_space: AtomicU64::new(max_disk_space),
            max_retention_seconds: AtomicU64::new(max_retention_seconds),
            default_compression: crate::types::CompressionAlgorithm::Lz4,
            target_datafiles: 12,
            min_file_size: 16 * 1024 * 1024,
            max_file_size: 1024 * 1024 * 1024,
            journals_v1: Mutex::new(journals_v1),
        });

        if ctx.datafiles.read().is_empty() {
            ctx.create_new_datafile(1)?;
        }

        Ok(ctx)
    }

    pub(crate) fn create_new_datafile(&self, file_no: FileNo) -> Result<Arc<Datafile>> {
        let df = Datafile::create(&self.dir, self.tier, file_no)?;
        let jpath = journal_v1_path(&self.dir, self.tier, file_no);
        let journal = JournalV1::create(&jpath)?;
        self.journals_v1.lock().insert(file_no, journal);
        self.datafiles.write().push(df.clone());
        info!(tier = self.tier, file_no, "created new datafile");
        Ok(df)
    }

    pub fn target_file_size(&self) -> u64 {
        let max = self.max_disk_space.load(Ordering::Relaxed);
        (max / self.target_datafiles as u64).clamp(self.min_file_size, self.max_file_size)
    }

    pub fn newest(&self) -> Arc<Datafile> {
        self.datafiles
            .read()
            .last()
            .cloned()
            .expect("tier always has at least one datafile")
    }

    pub fn oldest(&self) -> Option<Arc<Datafile>> {
        self.datafiles.read().first().cloned()
    }

    pub fn datafiles_snapshot(&self) -> Vec<Arc<Datafile>> {
        self.datafiles.read().clone()
    }

    pub fn count(&self) -> usize {
        self.datafiles.read().len()
    }

    /// Rotates to a new datafile pair if the newest one has crossed the
    /// target size (§4.4 "before commit, rotate").
    pub fn maybe_rotate(&self) -> Result<()> {
        let newest = self.newest();
        if newest.pos() > self.target_file_size() {
            let next_no = newest.file_no + 1;
            self.create_new_datafile(next_no)?;
        }
        Ok(())
    }

    pub fn with_journal_v1<F, R>(&self, file_no: FileNo, f: F) -> Result<R>
    where
        F: FnOnce(&mut JournalV1) -> Result<R>,
    {
        let mut journals = self.journals_v1.lock();
        let journal = journals
            .get_mut(&file_no)
            .ok_or(EngineError::NotFound("journal v1 for file_no"))?;
        f(journal)
    }

    /// Removes the oldest datafile's bookkeeping once its v2/v1/ndf files
    /// are unlinked by the retention controller.
    pub fn drop_oldest(&self) -> Option<Arc<Datafile>> {
        let mut datafiles = self.datafiles.write();
        if datafiles.is_empty() {
            return None;
        }
        let removed = datafiles.remove(0);
        self.journals_v1.lock().remove(&removed.file_no);
        Some(removed)
    }

    pub fn disk_bytes(&self) -> u64 {
        self.datafiles.read().iter().map(|d| d.pos()).sum()
    }

    pub fn v2_path(&self, file_no: FileNo) -> PathBuf {
        journal_v2_path(&self.dir, self.tier, file_no)
    }

    pub fn v1_path(&self, file_no: FileNo) -> PathBuf {
        journal_v1_path(&self.dir, self.tier, file_no)
    }

    /// Earliest timestamp still retained in this tier, per the migrated v2
    /// indices' time envelope (§4.7 "time envelope"). `None` until at
    /// least one datafile has been migrated to v2; a tier with only its
    /// open (never-rotated) datafile has no time-based retention pressure
    /// yet by construction.
    pub fn earliest_surviving_time(&self) -> Option<crate::types::TimeUsec> {
        self.datafiles
            .read()
            .iter()
            .filter_map(|d| d.v2())
            .map(|v2| v2.time_bounds().0)
            .min()
    }
}

fn parse_tier_fileno(rest: &str) -> Option<(Tier, FileNo)> {
    let rest = rest.strip_suffix(".ndf")?;
    let mut parts = rest.splitn(2, '-');
    let tier: Tier = parts.next()?.parse().ok()?;
    let file_no: FileNo = parts.next()?.parse().ok()?;
    Some((tier, file_no))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_first_datafile_when_empty() {
        let dir = tempdir().unwrap();
        let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
        assert_eq!(ctx.count(), 1);
        assert_eq!(ctx.newest().file_no, 1);
    }

    #[test]
    fn reopen_recovers_existing_datafiles() {
        let dir = tempdir().unwrap();
        {
            let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
            ctx.create_new_datafile(2).unwrap();
        }
        let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
        assert_eq!(ctx.count(), 2);
        assert_eq!(ctx.oldest().unwrap().file_no, 1);
    }

    #[test]
    fn reference_counting_blocks_deletion() {
        let dir = tempdir().unwrap();
        let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
        let df = ctx.newest();
        df.acquire(AcquireReason::OpenCache);
        assert!(df.is_referenced());
        df.release(AcquireReason::OpenCache);
        assert!(!df.is_referenced());
    }
}
