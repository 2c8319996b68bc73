// src/metadata.rs
//
// Persistent superblock record. Lives at a fixed offset past the end of
// the replicated data area on the same backing file; read at open, written
// on every generation-counter bump. Layout is hand-framed the same way
// `wire.rs` frames the network header — fixed-width big-endian fields, no
// serde, because this is an on-disk format that must stay byte-stable
// across versions of this crate.

use crate::error::{DrbdError, Result};
use std::cmp::Ordering;
use std::io::{Read, Seek, SeekFrom, Write};

pub const META_MAGIC: u32 = 0x8620_4d44;
pub const GEN_CNT_SIZE: usize = 5;
pub const RECORD_LEN: usize = 4 + GEN_CNT_SIZE * 4 + GEN_CNT_SIZE * 4 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenCntKind {
    HumanIntervention = 0,
    Timeout = 1,
    Connected = 2,
    Arbitrary = 3,
    ConsistentEpoch = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaFlags {
    pub consistent: bool,
    pub primary_ind: bool,
    pub connected_ind: bool,
}

impl MetaFlags {
    fn to_bits(self) -> u32 {
        (self.consistent as u32) | ((self.primary_ind as u32) << 1) | ((self.connected_ind as u32) << 2)
    }

    fn from_bits(bits: u32) -> Self {
        Self {
            consistent: bits & 0x1 != 0,
            primary_ind: bits & 0x2 != 0,
            connected_ind: bits & 0x4 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub gen_cnt: [u32; GEN_CNT_SIZE],
    pub bit_map_gen: [u32; GEN_CNT_SIZE],
    pub flags: MetaFlags,
    pub last_agreed_size_sectors: u64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            gen_cnt: [0; GEN_CNT_SIZE],
            bit_map_gen: [0; GEN_CNT_SIZE],
            flags: MetaFlags::default(),
            last_agreed_size_sectors: 0,
        }
    }
}

impl Metadata {
    pub fn inc(&mut self, kind: GenCntKind) {
        self.gen_cnt[kind as usize] = self.gen_cnt[kind as usize].wrapping_add(1);
    }

    /// Ordering over the counter tuples, used at handshake to decide which
    /// side is authoritative. Equal counters with differing bitmap
    /// generations mean divergent histories neither side can resolve
    /// automatically.
    pub fn compare(&self, peer: &Metadata) -> Option<Ordering> {
        let ord = self.gen_cnt.cmp(&peer.gen_cnt);
        if ord == Ordering::Equal && self.bit_map_gen != peer.bit_map_gen {
            return None;
        }
        Some(ord)
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let mut off = 0usize;
        out[off..off + 4].copy_from_slice(&META_MAGIC.to_be_bytes());
        off += 4;
        for g in &self.gen_cnt {
            out[off..off + 4].copy_from_slice(&g.to_be_bytes());
            off += 4;
        }
        for g in &self.bit_map_gen {
            out[off..off + 4].copy_from_slice(&g.to_be_bytes());
            off += 4;
        }
        out[off..off + 4].copy_from_slice(&self.flags.to_bits().to_be_bytes());
        off += 4;
        out[off..off + 8].copy_from_slice(&self.last_agreed_size_sectors.to_be_bytes());
        out
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_LEN {
            return Err(DrbdError::protocol("metadata record truncated"));
        }
        let mut off = 0usize;
        let magic = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        if magic != META_MAGIC {
            return Err(DrbdError::protocol(format!("bad metadata magic: {magic:#x}")));
        }
        let mut gen_cnt = [0u32; GEN_CNT_SIZE];
        for g in gen_cnt.iter_mut() {
            *g = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        let mut bit_map_gen = [0u32; GEN_CNT_SIZE];
        for g in bit_map_gen.iter_mut() {
            *g = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        let flags = MetaFlags::from_bits(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()));
        off += 4;
        let last_agreed_size_sectors = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        Ok(Self { gen_cnt, bit_map_gen, flags, last_agreed_size_sectors })
    }
}

/// Offset-addressed store for the metadata record, backed by any
/// `Read + Write + Seek`. Production use is a tail region of the backing
/// device file; tests use an in-memory `Cursor`.
pub struct MetadataArea<F> {
    file: F,
    offset: u64,
}

impl<F: Read + Write + Seek> MetadataArea<F> {
    pub fn new(file: F, offset: u64) -> Self {
        Self { file, offset }
    }

    pub fn read(&mut self) -> Result<Metadata> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = [0u8; RECORD_LEN];
        self.file.read_exact(&mut buf)?;
        Metadata::decode(&buf)
    }

    pub fn write(&mut self, meta: &Metadata) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.write_all(&meta.encode())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_read_round_trips() {
        let mut meta = Metadata::default();
        meta.inc(GenCntKind::Connected);
        meta.flags.consistent = true;
        meta.last_agreed_size_sectors = 16_777_216;

        let mut area = MetadataArea::new(Cursor::new(vec![0u8; RECORD_LEN]), 0);
        area.write(&meta).unwrap();
        let back = area.read().unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn equal_counters_diverging_bitmap_gen_is_unresolvable() {
        let mut a = Metadata::default();
        let mut b = Metadata::default();
        a.bit_map_gen[0] = 1;
        b.bit_map_gen[0] = 2;
        assert_eq!(a.compare(&b), None);
    }

    #[test]
    fn higher_gen_cnt_wins_ordering() {
        let mut a = Metadata::default();
        let b = Metadata::default();
        a.inc(GenCntKind::Timeout);
        assert_eq!(a.compare(&b), Some(Ordering::Greater));
    }
}
