//! Shared identifier and time types used across the engine.

pub mod checksum;

use uuid::Uuid;

/// Microsecond timestamp, matching the on-disk `u64` time fields.
pub type TimeUsec = u64;

/// A retention tier (0 = raw, 1.. = progressively coarser rollups).
pub type Tier = u8;

/// Opaque per-context key distinguishing independent page-cache sections
/// (in the original design, a host/context pointer; here a plain integer
/// handed out by whoever owns the `Engine`).
pub type Section = u64;

/// 128-bit metric identifier, interned by the [`crate::registry::MetricRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(pub Uuid);

impl MetricId {
    pub fn new_random() -> Self {
        MetricId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        MetricId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl std::fmt::Display for MetricId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a datafile within a tier: strictly increasing within the
/// tier, used to sort `datafile-<tier>-<fileno>.ndf` pairs.
pub type FileNo = u32;

/// Compression algorithm recorded per-extent in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None = 0,
    Lz4 = 1,
}

impl CompressionAlgorithm {
    pub fn from_u8(v: u8) -> crate::error::Result<Self> {
        match v {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(crate::error::EngineError::corruption(format!(
                "unknown compression algorithm tag {other}"
            ))),
        }
    }
}
