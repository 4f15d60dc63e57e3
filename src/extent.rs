//! Extent Writer (§4.4): batches up to 64 DIRTY pages into a single extent,
//! compresses the concatenated payload, and appends header + payload +
//! CRC32 trailer to the newest datafile. Grounded on the pager's
//! checksum-over-header-and-payload pattern (`src/pager/mod.rs`) and on
//! the WAL's checked-arithmetic encoding style.

use std::convert::TryInto;
use std::sync::Arc;

use tracing::warn;

use crate::cache::{Page, PageOrigin, PageState};
use crate::datafile::descriptor::{PageDescriptor, DESCRIPTOR_SIZE};
use crate::datafile::journal_v1::StoreDataTxn;
use crate::datafile::{AcquireReason, Datafile, TierContext};
use crate::error::{EngineError, Result};
use crate::types::checksum::crc32_of;
use crate::types::CompressionAlgorithm;

pub const MAX_PAGES_PER_EXTENT: usize = 64;
const BLOCK_SIZE: u64 = 4096;
const EXTENT_HEADER_FIXED_SIZE: usize = 1 + 1 + 2 + 4; // algo, reserved, num_pages, payload_len
const TRAILER_SIZE: usize = 4;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// One formed extent, ready to be written to a datafile.
pub struct FormedExtent {
    pub bytes: Vec<u8>,
    pub payload_length: u32,
    pub descriptors: Vec<PageDescriptor>,
}

/// Concatenates, compresses and frames up to [`MAX_PAGES_PER_EXTENT`]
/// DIRTY pages into one extent. Fails the whole batch (keeping pages
/// DIRTY) if compression cannot process the combined payload.
pub fn form_extent(pages: &[Arc<Page>], algorithm: CompressionAlgorithm) -> Result<FormedExtent> {
    if pages.is_empty() {
        return Err(EngineError::invalid("cannot form an extent from zero pages"));
    }
    if pages.len() > MAX_PAGES_PER_EXTENT {
        return Err(EngineError::invalid("extent batch exceeds MAX_PAGES_PER_EXTENT"));
    }

    let mut descriptors = Vec::with_capacity(pages.len());
    let mut raw = Vec::new();
    for page in pages {
        let payload = page.payload();
        let page_length: u16 = payload
            .len()
            .try_into()
            .map_err(|_| EngineError::invalid("page payload exceeds u16 length"))?;
        descriptors.push(PageDescriptor {
            metric_id: page.metric_id,
            page_type: 0,
            page_length,
            start_time: page.start_time,
            end_time: page.end_time(),
        });
        raw.extend_from_slice(&payload);
    }

    let compressed = match algorithm {
        CompressionAlgorithm::None => raw.clone(),
        CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(&raw),
    };

    let payload_length: u32 = compressed
        .len()
        .try_into()
        .map_err(|_| EngineError::invalid("compressed extent payload exceeds u32"))?;

    let mut header = Vec::with_capacity(
        EXTENT_HEADER_FIXED_SIZE + descriptors.len() * DESCRIPTOR_SIZE,
    );
    header.push(algorithm as u8);
    header.push(0);
    header.extend_from_slice(&(descriptors.len() as u16).to_le_bytes());
    header.extend_from_slice(&payload_length.to_le_bytes());
    for d in &descriptors {
        d.encode(&mut header);
    }

    let trailer = crc32_of(&[&header, &compressed]);

    let total = header.len() + compressed.len() + TRAILER_SIZE;
    let aligned_total = align_up(total as u64, BLOCK_SIZE) as usize;
    let mut bytes = Vec::with_capacity(aligned_total);
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&compressed);
    bytes.extend_from_slice(&trailer.to_le_bytes());
    bytes.resize(aligned_total, 0);

    Ok(FormedExtent {
        bytes,
        payload_length,
        descriptors,
    })
}

/// Decodes an extent previously written by [`form_extent`], verifying its
/// CRC32 trailer before returning the decompressed per-page payloads in
/// descriptor order.
pub fn read_extent(bytes: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<(PageDescriptor, Vec<u8>)>> {
    if bytes.len() < EXTENT_HEADER_FIXED_SIZE {
        return Err(EngineError::corruption("extent shorter than fixed header"));
    }
    let num_pages = u16::from_le_bytes(bytes[2..4].try_into().expect("2 bytes")) as usize;
    let payload_length = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")) as usize;
    let header_len = EXTENT_HEADER_FIXED_SIZE + num_pages * DESCRIPTOR_SIZE;
    if bytes.len() < header_len + payload_length + TRAILER_SIZE {
        return Err(EngineError::corruption("extent shorter than header+payload+trailer"));
    }

    let header = &bytes[..header_len];
    let payload = &bytes[header_len..header_len + payload_length];
    let trailer_bytes = &bytes[header_len + payload_length..header_len + payload_length + TRAILER_SIZE];
    let expected = u32::from_le_bytes(trailer_bytes.try_into().expect("4 bytes"));
    if crc32_of(&[header, payload]) != expected {
        return Err(EngineError::corruption("extent CRC32 trailer mismatch"));
    }

    let mut descriptors = Vec::with_capacity(num_pages);
    let mut offset = EXTENT_HEADER_FIXED_SIZE;
    for _ in 0..num_pages {
        descriptors.push(PageDescriptor::decode(&bytes[offset..])?);
        offset += DESCRIPTOR_SIZE;
    }

    let decompressed = match algorithm {
        CompressionAlgorithm::None => payload.to_vec(),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| EngineError::corruption(format!("lz4 decompress failed: {e}")))?,
    };

    let mut out = Vec::with_capacity(num_pages);
    let mut cursor = 0usize;
    for d in descriptors {
        let len = d.page_length as usize;
        if cursor + len > decompressed.len() {
            return Err(EngineError::corruption("extent payload shorter than descriptors imply"));
        }
        out.push((d, decompressed[cursor..cursor + len].to_vec()));
        cursor += len;
    }
    Ok(out)
}

/// Runs the full `FLUSH_PAGES` opcode body (§4.4): forms the extent,
/// reserves space on the tier's newest datafile, writes it, appends the
/// matching v1 transaction, and on success hands the pages' new HOT
/// (datafile-owned) origin back via `on_written`.
pub fn write_extent_to_tier(
    ctx: &TierContext,
    pages: &[Arc<Page>],
    algorithm: CompressionAlgorithm,
) -> Result<()> {
    for page in pages {
        if page.state() != PageState::Dirty {
            return Err(EngineError::invalid("extent writer only accepts DIRTY pages"));
        }
    }

    let formed = form_extent(pages, algorithm)?;
    let previous_tail = ctx.newest();
    ctx.maybe_rotate()?;
    let datafile = ctx.newest();
    if !Arc::ptr_eq(&previous_tail, &datafile) {
        // `previous_tail` just stopped being the tail: it will receive no
        // further writes, so it is eligible for v1 -> v2 migration (§4.4
        // "Completion handling" / §4.3 journal v2 lifecycle). Run inline
        // rather than through the opcode scheduler, matching this engine's
        // synchronous flush path.
        crate::datafile::migration::migrate_to_v2_best_effort(ctx, &previous_tail);
    }
    datafile.acquire(AcquireReason::OpenCache);

    let offset = datafile.reserve(formed.bytes.len() as u64);
    let write_result = datafile.write_at(offset, &formed.bytes);
    datafile.finish_write();

    if let Err(err) = write_result {
        warn!(error = %err, "extent write failed, pages remain DIRTY");
        datafile.release(AcquireReason::OpenCache);
        return Err(err);
    }

    let txn = StoreDataTxn {
        extent_offset: offset,
        extent_size: formed.bytes.len() as u32,
        descriptors: formed.descriptors,
    };
    ctx.with_journal_v1(datafile.file_no, |journal| {
        journal.append_store_data(&txn)?;
        journal.flush_block()
    })?;

    for page in pages {
        page.set_origin(PageOrigin::Datafile(datafile.clone()));
    }
    datafile.release(AcquireReason::OpenCache);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricId;

    fn dirty_page(metric: MetricId, start: u64, payload: &[u8]) -> Arc<Page> {
        let page = Arc::new(Page::new_hot(1, metric, start, 1));
        page.append_samples(payload);
        page.hot_set_end_time(start + payload.len() as u64);
        page.transition_to(PageState::Dirty);
        page
    }

    #[test]
    fn form_and_read_extent_roundtrip() {
        let m1 = MetricId::new_random();
        let m2 = MetricId::new_random();
        let pages = vec![
            dirty_page(m1, 100, b"hello world"),
            dirty_page(m2, 200, b"another payload here"),
        ];
        let formed = form_extent(&pages, CompressionAlgorithm::Lz4).unwrap();
        let decoded = read_extent(&formed.bytes, CompressionAlgorithm::Lz4).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].1, b"hello world");
        assert_eq!(decoded[1].1, b"another payload here");
    }

    #[test]
    fn rejects_oversized_batch() {
        let metric = MetricId::new_random();
        let pages: Vec<_> = (0..MAX_PAGES_PER_EXTENT + 1)
            .map(|i| dirty_page(metric, i as u64, b"x"))
            .collect();
        assert!(form_extent(&pages, CompressionAlgorithm::None).is_err());
    }

    #[test]
    fn detects_corrupted_trailer() {
        let metric = MetricId::new_random();
        let pages = vec![dirty_page(metric, 1, b"payload")];
        let mut formed = form_extent(&pages, CompressionAlgorithm::None).unwrap();
        // Flip a byte inside the fixed header, well before the alignment
        // padding, so the corruption lands inside the checksummed region.
        formed.bytes[0] ^= 0xFF;
        assert!(read_extent(&formed.bytes, CompressionAlgorithm::None).is_err());
    }
}
