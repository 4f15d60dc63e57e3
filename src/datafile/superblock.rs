//! Datafile superblock: the fixed-size header at the start of every
//! `datafile-<tier>-<fileno>.ndf` file. Grounded on the pager's own
//! magic+version header region, generalized from a single-file database
//! header to a per-datafile superblock carrying tier/fileno identity.

use std::convert::TryInto;

use crate::error::{EngineError, Result};
use crate::types::{FileNo, Tier};

const MAGIC: &[u8; 8] = b"TSEDATA\0";
const SUPERBLOCK_SIZE: usize = 32;
const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub tier: Tier,
    pub file_no: FileNo,
}

impl Superblock {
    pub fn new(tier: Tier, file_no: FileNo) -> Self {
        Superblock { tier, file_no }
    }

    pub fn encoded_len() -> usize {
        SUPERBLOCK_SIZE
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(EngineError::corruption("superblock buffer too small"));
        }
        buf.fill(0);
        buf[..MAGIC.len()].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&VERSION.to_le_bytes());
        buf[10] = self.tier;
        buf[12..16].copy_from_slice(&self.file_no.to_le_bytes());
        Ok(())
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(EngineError::corruption("superblock region shorter than expected"));
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(EngineError::corruption("invalid datafile superblock magic"));
        }
        let version = u16::from_le_bytes([buf[8], buf[9]]);
        if version != VERSION {
            return Err(EngineError::corruption(format!(
                "unsupported datafile superblock version {version}"
            )));
        }
        let tier = buf[10];
        let file_no = u32::from_le_bytes(buf[12..16].try_into().expect("slice is 4 bytes"));
        Ok(Superblock { tier, file_no })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let sb = Superblock::new(1, 42);
        let mut buf = vec![0u8; Superblock::encoded_len()];
        sb.write(&mut buf).unwrap();
        let back = Superblock::read(&buf).unwrap();
        assert_eq!(back.tier, 1);
        assert_eq!(back.file_no, 42);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; Superblock::encoded_len()];
        assert!(Superblock::read(&buf).is_err());
    }
}
