//! Journal v1 (WAL): one write-ahead log per datafile, `journalfile-<tier>-
//! <fileno>.njf`, append-only and block-aligned to 4 KiB. Grounded on the
//! pager's `Wal` (magic header, frame encode/decode with checked
//! arithmetic, `replay` with CRC verification), generalized from per-page
//! frames to per-transaction "store extent" records.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::datafile::descriptor::PageDescriptor;
use crate::error::{EngineError, Result};
use crate::types::FileNo;
use crate::types::checksum::crc32_of;

const MAGIC: &[u8; 8] = b"TSEJNL1\0";
const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 32;
pub const BLOCK_SIZE: usize = 4096;

const TXN_HEADER_SIZE: usize = 1 + 1 + 2 + 8; // type, reserved, payload_length, id
const TRAILER_SIZE: usize = 4; // crc32

const TYPE_PADDING: u8 = 0;
const TYPE_STORE_DATA: u8 = 1;

/// A decoded `store-data` transaction's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDataTxn {
    pub extent_offset: u64,
    pub extent_size: u32,
    pub descriptors: Vec<PageDescriptor>,
}

impl StoreDataTxn {
    fn encode(&self) -> Result<Vec<u8>> {
        let num_pages: u8 = self
            .descriptors
            .len()
            .try_into()
            .map_err(|_| EngineError::invalid("extent has more than 255 pages"))?;
        let mut buf = Vec::with_capacity(8 + 4 + 1 + 1 + self.descriptors.len() * 36);
        buf.extend_from_slice(&self.extent_offset.to_le_bytes());
        buf.extend_from_slice(&self.extent_size.to_le_bytes());
        buf.push(num_pages);
        buf.push(0); // reserved
        for d in &self.descriptors {
            d.encode(&mut buf);
        }
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 14 {
            return Err(EngineError::corruption("store-data payload too short"));
        }
        let extent_offset = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        let extent_size = u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
        let num_pages = buf[12] as usize;
        let mut descriptors = Vec::with_capacity(num_pages);
        let mut offset = 14;
        for _ in 0..num_pages {
            let d = PageDescriptor::decode(&buf[offset..])?;
            offset += crate::datafile::descriptor::DESCRIPTOR_SIZE;
            descriptors.push(d);
        }
        Ok(StoreDataTxn {
            extent_offset,
            extent_size,
            descriptors,
        })
    }
}

/// A single write-ahead transaction, as seen by a replay callback.
#[derive(Debug, Clone)]
pub enum Transaction {
    Padding,
    StoreData(StoreDataTxn),
}

/// Block-aligned append-only log. Transactions accumulate in an in-memory
/// block buffer and only hit disk when the buffer fills or the caller
/// explicitly flushes at extent completion.
pub struct JournalV1 {
    file: File,
    next_id: u64,
    block: Vec<u8>,
}

pub fn journal_v1_path(dir: &Path, tier: u8, file_no: FileNo) -> PathBuf {
    dir.join(format!("journalfile-{tier}-{file_no}.njf"))
}

impl JournalV1 {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut journal = JournalV1 {
            file,
            next_id: 1,
            block: Vec::with_capacity(BLOCK_SIZE),
        };
        if journal.file.metadata()?.len() == 0 {
            journal.write_header()?;
        }
        Ok(journal)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[8..10].copy_from_slice(&VERSION.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Appends a store-data transaction to the in-memory block, flushing
    /// the current block to disk first if the record would not fit.
    pub fn append_store_data(&mut self, txn: &StoreDataTxn) -> Result<u64> {
        let payload = txn.encode()?;
        let payload_len: u16 = payload
            .len()
            .try_into()
            .map_err(|_| EngineError::invalid("store-data payload exceeds u16"))?;
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| EngineError::corruption("journal transaction id overflow"))?;

        let mut record = Vec::with_capacity(TXN_HEADER_SIZE + payload.len() + TRAILER_SIZE);
        record.push(TYPE_STORE_DATA);
        record.push(0);
        record.extend_from_slice(&payload_len.to_le_bytes());
        record.extend_from_slice(&id.to_le_bytes());
        record.extend_from_slice(&payload);
        let crc = crc32_of(&[&record]);
        record.extend_from_slice(&crc.to_le_bytes());

        if self.block.len() + record.len() > BLOCK_SIZE {
            self.flush_block()?;
        }
        self.block.extend_from_slice(&record);
        Ok(id)
    }

    /// Pads the in-memory block to the 4 KiB boundary and writes it out.
    /// Called on a full block, and explicitly at extent completion so a
    /// crash never loses an acknowledged extent write.
    pub fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let pad = BLOCK_SIZE - self.block.len() % BLOCK_SIZE;
        if pad != BLOCK_SIZE {
            self.block.resize(self.block.len() + pad, 0);
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&self.block)?;
        self.file.sync_data()?;
        self.block.clear();
        Ok(())
    }

    /// Replays every transaction since the header, verifying each
    /// transaction's CRC and handing `store-data` payloads to `apply`.
    /// Unknown record types advance by one whole block rather than
    /// failing the replay (§4.3). Sets `next_id` to `max(id) + 1`.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u64>
    where
        F: FnMut(&StoreDataTxn) -> Result<()>,
    {
        self.file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut applied = 0u64;
        let mut max_id = 0u64;
        let mut block_buf = vec![0u8; BLOCK_SIZE];

        loop {
            let n = read_up_to(&mut self.file, &mut block_buf)?;
            if n == 0 {
                break;
            }
            let block = &block_buf[..n];
            let mut offset = 0usize;
            while offset + TXN_HEADER_SIZE <= block.len() {
                let record_type = block[offset];
                if record_type == TYPE_PADDING {
                    break;
                }
                if record_type != TYPE_STORE_DATA {
                    // unknown type: abandon the rest of this block.
                    break;
                }
                let payload_len =
                    u16::from_le_bytes(block[offset + 2..offset + 4].try_into().expect("2 bytes"))
                        as usize;
                let id = u64::from_le_bytes(
                    block[offset + 4..offset + 12].try_into().expect("8 bytes"),
                );
                let record_len = TXN_HEADER_SIZE + payload_len + TRAILER_SIZE;
                if offset + record_len > block.len() {
                    return Err(EngineError::corruption(
                        "journal v1 record crosses block boundary",
                    ));
                }
                let record = &block[offset..offset + record_len];
                let (body, trailer) = record.split_at(record_len - TRAILER_SIZE);
                let expected_crc = u32::from_le_bytes(trailer.try_into().expect("4 bytes"));
                if crc32_of(&[body]) != expected_crc {
                    return Err(EngineError::corruption("journal v1 transaction checksum mismatch"));
                }
                let payload = &body[TXN_HEADER_SIZE..];
                let txn = StoreDataTxn::decode(payload)?;
                apply(&txn)?;
                applied += 1;
                max_id = max_id.max(id);
                offset += record_len;
            }
        }

        self.next_id = max_id + 1;
        Ok(applied)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}
