//! Per-page descriptor shared by the extent header and journal v1 payloads
//! (§6 "Extent on-disk format" / "Journal v1 transaction").

use std::convert::TryInto;

use crate::error::{EngineError, Result};
use crate::types::{MetricId, TimeUsec};

pub const DESCRIPTOR_SIZE: usize = 16 + 1 + 1 + 2 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor {
    pub metric_id: MetricId,
    pub page_type: u8,
    pub page_length: u16,
    pub start_time: TimeUsec,
    pub end_time: TimeUsec,
}

impl PageDescriptor {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.metric_id.as_bytes());
        out.push(self.page_type);
        out.push(0); // reserved
        out.extend_from_slice(&self.page_length.to_le_bytes());
        out.extend_from_slice(&self.start_time.to_le_bytes());
        out.extend_from_slice(&self.end_time.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_SIZE {
            return Err(EngineError::corruption("page descriptor shorter than expected"));
        }
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&buf[0..16]);
        let page_type = buf[16];
        let page_length = u16::from_le_bytes(buf[18..20].try_into().expect("2 bytes"));
        let start_time = u64::from_le_bytes(buf[20..28].try_into().expect("8 bytes"));
        let end_time = u64::from_le_bytes(buf[28..36].try_into().expect("8 bytes"));
        Ok(PageDescriptor {
            metric_id: MetricId::from_bytes(uuid_bytes),
            page_type,
            page_length,
            start_time,
            end_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let d = PageDescriptor {
            metric_id: MetricId::new_random(),
            page_type: 1,
            page_length: 512,
            start_time: 1000,
            end_time: 2000,
        };
        let mut buf = Vec::new();
        d.encode(&mut buf);
        assert_eq!(buf.len(), DESCRIPTOR_SIZE);
        let back = PageDescriptor::decode(&buf).unwrap();
        assert_eq!(back, d);
    }
}
