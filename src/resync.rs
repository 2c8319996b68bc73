// src/resync.rs
//
// Bitmap-driven catch-up of a stale replica. The source side walks the
// bitmap's set bits, reads each dirty block locally, and hands it to the
// DiskSender to push out as an ordinary `Data` frame — the target applies
// it exactly like an application write and clears the bit itself, which is
// also how an in-flight application write racing a resync read on the same
// sector converges to a single, correctly-ordered bitmap clear (see
// `Device::apply_incoming_block`). Anti-collision against application
// writes uses the transfer log (`check_sector`) and the busy-block table,
// the same pairing request_pipeline uses in reverse.

use crate::bitmap::{SyncState, BLOCK_SIZE};
use crate::connection::ConnState;
use crate::device::Device;
use crate::error::Result;
use crate::wire::ChecksumBlock;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// First id handed out by `ResyncEngine::next_block_id`, chosen so it can
/// never collide with `RequestPipeline`'s ids (which start at 1).
const RESYNC_BLOCK_ID_BASE: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCause(u8);

impl ReadCause {
    pub const APP: ReadCause = ReadCause(0b01);
    pub const RESYNC: ReadCause = ReadCause(0b10);

    pub fn union(self, other: ReadCause) -> ReadCause {
        ReadCause(self.0 | other.0)
    }

    pub fn contains(self, other: ReadCause) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Outstanding reads being served on behalf of the peer, keyed by sector.
/// A concurrent application read and a resync read on the same sector
/// fold into one cause-union entry rather than issuing two disk reads.
#[derive(Default)]
pub struct PendingReadTable {
    entries: Mutex<HashMap<u64, ReadCause>>,
}

impl PendingReadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `cause` against `sector`. Returns the prior cause set if
    /// a read was already pending (the caller should fold in rather than
    /// issue a second disk read), or `None` if this is the first.
    pub fn add(&self, sector: u64, cause: ReadCause) -> Option<ReadCause> {
        let mut guard = self.entries.lock().unwrap();
        let prior = guard.get(&sector).copied();
        let merged = prior.map(|p| p.union(cause)).unwrap_or(cause);
        guard.insert(sector, merged);
        prior
    }

    pub fn remove(&self, sector: u64) -> Option<ReadCause> {
        self.entries.lock().unwrap().remove(&sector)
    }

    pub fn is_pending(&self, sector: u64) -> bool {
        self.entries.lock().unwrap().contains_key(&sector)
    }
}

/// FNV-1a, used only to decide whether a block needs retransmission during
/// checksum-mode resync — not a cryptographic digest.
pub fn checksum(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

struct RateLimiter {
    bytes_per_sec: AtomicU64,
    window_start: Mutex<Instant>,
    sent_in_window: AtomicU64,
}

impl RateLimiter {
    fn new(bytes_per_sec: u64) -> Self {
        Self { bytes_per_sec: AtomicU64::new(bytes_per_sec), window_start: Mutex::new(Instant::now()), sent_in_window: AtomicU64::new(0) }
    }

    fn set_rate(&self, bytes_per_sec: u64) {
        self.bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Blocks the caller until sending `len` more bytes stays within the
    /// configured rate, sleeping in whole-second windows the way the
    /// original's `sync_rate` throttling does.
    fn throttle(&self, len: u64) {
        let rate = self.bytes_per_sec.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }
        let mut start = self.window_start.lock().unwrap();
        if start.elapsed() >= Duration::from_secs(1) {
            *start = Instant::now();
            self.sent_in_window.store(0, Ordering::Relaxed);
        }
        let sent = self.sent_in_window.fetch_add(len, Ordering::Relaxed) + len;
        if sent > rate {
            let sleep_for = Duration::from_secs(1).saturating_sub(start.elapsed());
            if !sleep_for.is_zero() {
                std::thread::sleep(sleep_for);
            }
            *start = Instant::now();
            self.sent_in_window.store(0, Ordering::Relaxed);
        }
    }
}

/// A block the source read locally and is ready to push to the peer.
pub struct SourceBlock {
    pub sector: u64,
    pub data: Vec<u8>,
}

/// Drives both the sync-source read side and the sync-target apply side.
/// One instance per `Device`, owned alongside it.
pub struct ResyncEngine {
    scan_cursor: AtomicU64,
    pub pending_reads: PendingReadTable,
    limiter: RateLimiter,
    next_block_id: AtomicU64,
}

impl ResyncEngine {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            scan_cursor: AtomicU64::new(0),
            pending_reads: PendingReadTable::new(),
            limiter: RateLimiter::new(rate_bytes_per_sec),
            next_block_id: AtomicU64::new(RESYNC_BLOCK_ID_BASE),
        }
    }

    /// Opaque id for a resync-originated frame (`Data` push or `Csum`
    /// announcement). Starts at `RESYNC_BLOCK_ID_BASE`, well clear of
    /// `RequestPipeline`'s ids (which start at 1), so a stray `RecvAck`/
    /// `WriteAck` for a resync push can never be mistaken for the ack of
    /// an unrelated application write sharing the same numeric id.
    pub fn next_block_id(&self) -> u64 {
        self.next_block_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.limiter.set_rate(bytes_per_sec);
    }

    pub fn reset_scan(&self) {
        self.scan_cursor.store(0, Ordering::SeqCst);
    }

    /// Sync-source step: finds the next dirty block not colliding with an
    /// in-flight application write, reads it locally, and returns it for
    /// the DiskSender to push out. Returns `Ok(None)` when the current pass
    /// over the bitmap has reached the end (the caller checks `rs_left` to
    /// decide whether that means the run is actually finished, since a
    /// deferred block may still need a second pass).
    pub fn next_source_block(&self, device: &Device) -> Result<Option<SourceBlock>> {
        loop {
            let bit = match device.bitmap.find_next_dirty(self.scan_cursor.load(Ordering::SeqCst)) {
                Some(b) => b,
                None => return Ok(None),
            };
            self.scan_cursor.store(bit + 1, Ordering::SeqCst);
            let sector = crate::bitmap::Bitmap::block_sector(bit);

            if device.tl.check_sector(sector) {
                // An application write is already in flight for this
                // block; skip it this pass, it will be picked up (already
                // in-sync, or still dirty) on the next scan.
                continue;
            }

            device.bb.begin_read(sector);
            self.pending_reads.add(sector, ReadCause::RESYNC);
            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            let read_result = device.backing.read_at(sector, &mut buf);
            device.bb.bb_done(sector);
            self.pending_reads.remove(sector);

            self.limiter.throttle(buf.len() as u64);
            return read_result.map(|()| Some(SourceBlock { sector, data: buf }));
        }
    }

    /// Builds a checksum announcement for `sector` in place of the full
    /// block, used when `use_csums` is negotiated with the peer.
    pub fn checksum_block(&self, sector: u64, block_id: u64, data: &[u8]) -> ChecksumBlock {
        ChecksumBlock { sector, block_id, blksize: data.len() as u32, csum: checksum(data) }
    }
}

impl Device {
    /// Applies a block received off the wire (application write or resync
    /// push alike) and, if the sector was marked out-of-sync, clears it and
    /// advances resync progress. This is the single place a dirty bit gets
    /// cleared, so a resync read and a colliding application write that
    /// both touch the same sector converge on exactly one clear.
    pub fn apply_incoming_block(&self, sector: u64, data: &[u8]) -> Result<()> {
        self.backing.write_at(sector, data)?;
        let cleared = self.bitmap.set(sector, data.len() as u64, SyncState::InSync);
        if cleared > 0 {
            let cleared = cleared as u64;
            let left_before = self.rs_left.load(Ordering::SeqCst);
            let left_after = left_before.saturating_sub(cleared);
            self.rs_left.store(left_after, Ordering::SeqCst);
            crate::metrics::set_bitmap_dirty_sectors(self.bitmap.dirty_sectors());
            if self.conn.get().is_syncing() && left_after == 0 {
                self.conn.set(ConnState::Connected);
                self.metadata.lock().unwrap().inc(crate::metadata::GenCntKind::ConsistentEpoch);
            }
        }
        Ok(())
    }

    /// True if the local copy of `sector` already matches `incoming_csum` —
    /// used by a sync target to answer a checksum-mode resync announcement
    /// with `BlockInSync` instead of requesting the full block.
    pub fn local_checksum_matches(&self, sector: u64, blksize: u32, incoming_csum: u64) -> Result<bool> {
        let mut buf = vec![0u8; blksize as usize];
        self.backing.read_at(sector, &mut buf)?;
        Ok(checksum(&buf) == incoming_csum)
    }

    /// Clears `sector`'s dirty bit without touching the backing store —
    /// the checksum-mode counterpart to `apply_incoming_block` for the case
    /// where the local content is already confirmed identical.
    pub fn confirm_in_sync(&self, sector: u64, size: u64) -> Result<()> {
        let cleared = self.bitmap.set(sector, size, SyncState::InSync);
        if cleared > 0 {
            let cleared = cleared as u64;
            let left_after = self.rs_left.load(Ordering::SeqCst).saturating_sub(cleared);
            self.rs_left.store(left_after, Ordering::SeqCst);
            crate::metrics::set_bitmap_dirty_sectors(self.bitmap.dirty_sectors());
            if self.conn.get().is_syncing() && left_after == 0 {
                self.conn.set(ConnState::Connected);
                self.metadata.lock().unwrap().inc(crate::metadata::GenCntKind::ConsistentEpoch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::FileBackingStore;
    use crate::config::{DeviceConfig, General, NetCfg, Protocol, Syncer};
    use tempfile::tempdir;

    fn test_device(dir: &std::path::Path) -> Device {
        let cfg = DeviceConfig {
            general: General { backing_device: dir.join("d.img"), meta_device: dir.join("d.meta"), size_sectors: 1 << 16, json_logs: false, do_panic: false },
            net: NetCfg { peer_data_addr: "127.0.0.1:1".parse().unwrap(), peer_meta_addr: "127.0.0.1:2".parse().unwrap(), protocol: Protocol::C, timeout_ds: 50, ping_interval_ds: 100 },
            syncer: Syncer { al_nr_extents: 8, rate_bytes_per_sec: 0, use_csums: false, skip: false, group: 0 },
            metrics: None,
        };
        let backing = Box::new(FileBackingStore::open(&cfg.general.backing_device, cfg.general.size_sectors).unwrap());
        Device::new(cfg, backing)
    }

    #[test]
    fn pending_read_table_unions_causes() {
        let table = PendingReadTable::new();
        assert_eq!(table.add(512, ReadCause::RESYNC), None);
        let prior = table.add(512, ReadCause::APP).unwrap();
        assert!(prior.contains(ReadCause::RESYNC));
        assert!(table.is_pending(512));
        table.remove(512);
        assert!(!table.is_pending(512));
    }

    #[test]
    fn checksum_is_stable_and_sensitive_to_content() {
        let a = checksum(&[0xAA; 4096]);
        let b = checksum(&[0xAA; 4096]);
        let c = checksum(&[0xBB; 4096]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn next_source_block_skips_sectors_with_in_flight_writes() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        dev.bitmap.set(0, 4096, SyncState::OutOfSync);
        dev.bitmap.set(4096, 4096, SyncState::OutOfSync);
        dev.tl.append(1, 0, 4096); // sector 0 has an in-flight write

        let engine = ResyncEngine::new(0);
        let block = engine.next_source_block(&dev).unwrap().unwrap();
        assert_eq!(block.sector, 4096);
    }

    #[test]
    fn apply_incoming_block_clears_bit_and_drains_rs_left() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        dev.invalidate();
        let total = dev.rs_total.load(Ordering::SeqCst);
        assert!(total > 0);

        dev.conn.set(ConnState::SyncTarget);
        dev.apply_incoming_block(0, &[0xAA; 4096]).unwrap();
        assert!(!dev.bitmap.get(0, 4096));
        assert_eq!(dev.rs_left.load(Ordering::SeqCst), total - 8);
    }

    #[test]
    fn sync_finishes_when_rs_left_reaches_zero() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        dev.bitmap.set(0, 4096, SyncState::OutOfSync);
        dev.rs_total.store(8, Ordering::SeqCst);
        dev.rs_left.store(8, Ordering::SeqCst);
        dev.conn.set(ConnState::SyncTarget);

        dev.apply_incoming_block(0, &[0x11; 4096]).unwrap();
        assert_eq!(dev.rs_left.load(Ordering::SeqCst), 0);
        assert_eq!(dev.conn.get(), ConnState::Connected);
    }

    #[test]
    fn local_checksum_matches_detects_identical_content() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        dev.backing.write_at(0, &[0x55; 4096]).unwrap();
        let csum = checksum(&[0x55; 4096]);
        assert!(dev.local_checksum_matches(0, 4096, csum).unwrap());
        assert!(!dev.local_checksum_matches(0, 4096, csum.wrapping_add(1)).unwrap());
    }
}
