#![forbid(unsafe_code)]

//! CRC32 helpers shared by the extent writer, journal v1 and journal v2.

/// Incremental checksum, abstracted so extent/journal code does not depend
/// directly on `crc32fast`.
pub trait Checksum {
    fn reset(&mut self);
    fn update(&mut self, bytes: &[u8]);
    fn finalize(&self) -> u32;
}

#[derive(Default)]
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 over a sequence of byte slices, in order. Used for "header+payload"
/// trailers so callers never need to concatenate buffers just to checksum
/// them.
pub fn crc32_of(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
