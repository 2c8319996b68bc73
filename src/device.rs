// src/device.rs
//
// The single owning aggregate: bitmap, activity log, entry pool, transfer
// log, busy-block table, metadata, connection state, and backing store all
// live here. Workers borrow `Arc<Device>` the way the teacher's worker
// functions borrow `Arc<PacketPool>` / `Arc<SpscQueue<_>>` rather than each
// holding their own copies of shared state.

use crate::activity_log::{ActivityLog, MemoryJournal};
use crate::backing_store::BackingStore;
use crate::bitmap::{Bitmap, SyncState};
use crate::busy_block::BusyBlockTable;
use crate::config::{DeviceConfig, Protocol};
use crate::connection::{ConnState, ConnectionState};
use crate::entry_pool::EntryPool;
use crate::error::{DrbdError, Result};
use crate::metadata::Metadata;
use crate::resync::ResyncEngine;
use crate::transfer_log::TransferLog;
use crate::wire::{SyncParam, CSUM_MIN_VERSION};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

pub const ENTRY_POOL_CAPACITY: usize = 128;
pub const BLOCK_SIZE: usize = 4096;

pub struct Device {
    pub config: DeviceConfig,
    pub bitmap: Bitmap,
    pub al: ActivityLog<MemoryJournal>,
    pub pool: EntryPool,
    pub tl: TransferLog,
    pub bb: BusyBlockTable,
    pub metadata: Mutex<Metadata>,
    pub conn: ConnectionState,
    pub backing: Box<dyn BackingStore>,
    pub protocol: Mutex<Protocol>,
    pub sync_param: Mutex<SyncParam>,
    pub pending_cnt: AtomicI64,
    pub unacked_cnt: AtomicI64,
    pub rs_left: AtomicU64,
    pub rs_total: AtomicU64,
    pub is_primary: AtomicBool,
    pub shutdown: crate::util::BarrierFlag,
    pub resync: ResyncEngine,
    /// Peer's `Parameter::version`, learned at `ReportParams`. Zero until
    /// the handshake completes, which gates every opt-in command off by
    /// default.
    pub peer_version: AtomicU32,
    /// Writes applied on this (secondary) side since the last `Barrier`,
    /// for the `BarrierAck.set_size` this node owes back. Not advanced
    /// while syncing — resync pushes are not barrier-bounded.
    pub peer_epoch_count: AtomicU64,
}

impl Device {
    pub fn new(config: DeviceConfig, backing: Box<dyn BackingStore>) -> Self {
        let protocol = config.net.protocol;
        let sync_param = SyncParam {
            rate: config.syncer.rate_bytes_per_sec as u32,
            use_csums: config.syncer.use_csums as u32,
            skip: config.syncer.skip as u32,
            group: config.syncer.group,
        };
        let al_nr_extents = config.syncer.al_nr_extents;
        let size_sectors = config.general.size_sectors;
        let rate_bytes_per_sec = config.syncer.rate_bytes_per_sec;
        Self {
            bitmap: Bitmap::new(size_sectors),
            al: ActivityLog::new(al_nr_extents, MemoryJournal::default()),
            pool: EntryPool::new(ENTRY_POOL_CAPACITY, BLOCK_SIZE),
            tl: TransferLog::new(),
            bb: BusyBlockTable::new(),
            metadata: Mutex::new(Metadata::default()),
            conn: ConnectionState::new(ConnState::Standalone),
            backing,
            protocol: Mutex::new(protocol),
            sync_param: Mutex::new(sync_param),
            pending_cnt: AtomicI64::new(0),
            unacked_cnt: AtomicI64::new(0),
            rs_left: AtomicU64::new(0),
            rs_total: AtomicU64::new(0),
            is_primary: AtomicBool::new(false),
            shutdown: crate::util::BarrierFlag::default(),
            resync: ResyncEngine::new(rate_bytes_per_sec),
            peer_version: AtomicU32::new(0),
            peer_epoch_count: AtomicU64::new(0),
            config,
        }
    }

    /// Whether the negotiated peer understands `Command::Csum`, gating
    /// checksum-mode resync on top of the operator's `use_csums` setting.
    pub fn peer_supports_csum(&self) -> bool {
        self.peer_version.load(Ordering::SeqCst) >= CSUM_MIN_VERSION
    }

    // ---------------- Control surface (C16 / §6) ----------------
    // Plain methods an external control-plane crate calls; this crate does
    // not parse a CLI or RPC surface of its own.

    pub fn set_protocol(&self, protocol: Protocol) {
        *self.protocol.lock().unwrap() = protocol;
    }

    pub fn current_protocol(&self) -> Protocol {
        *self.protocol.lock().unwrap()
    }

    pub fn set_sync_param(&self, param: SyncParam) {
        self.resync.set_rate(param.rate as u64);
        *self.sync_param.lock().unwrap() = param;
    }

    /// Forces a full resync: marks the entire volume out-of-sync and resets
    /// the resync progress counters.
    pub fn invalidate(&self) {
        self.bitmap.fill(SyncState::OutOfSync);
        self.bitmap.reset_cursor();
        self.resync.reset_scan();
        let total = self.bitmap.dirty_sectors();
        self.rs_total.store(total, Ordering::SeqCst);
        self.rs_left.store(total, Ordering::SeqCst);
    }

    /// Promotes this node to primary. Refused if the connection already
    /// believes the peer is primary — two primaries is a state the core
    /// cannot resolve without operator intervention.
    pub fn set_primary(&self) -> Result<()> {
        if self.conn.get() == ConnState::Connected && self.is_primary.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.is_primary.store(true, Ordering::SeqCst);
        let mut meta = self.metadata.lock().unwrap();
        meta.flags.primary_ind = true;
        Ok(())
    }

    pub fn set_secondary(&self) -> Result<()> {
        if self.pending_cnt.load(Ordering::SeqCst) > 0 {
            return Err(DrbdError::state_refused("demote refused: requests still pending acknowledgement"));
        }
        self.is_primary.store(false, Ordering::SeqCst);
        self.metadata.lock().unwrap().flags.primary_ind = false;
        Ok(())
    }

    /// Connection loss / operator-initiated disconnect: clears the TL (the
    /// upper layer is expected to retry any dropped requests) and returns
    /// to `Unconnected`.
    pub fn disconnect(&self) {
        self.tl.clear();
        self.pending_cnt.store(0, Ordering::SeqCst);
        self.unacked_cnt.store(0, Ordering::SeqCst);
        self.conn.set(ConnState::Unconnected);
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn publish_metrics(&self) {
        crate::metrics::set_pending_cnt(self.pending_cnt.load(Ordering::Relaxed));
        crate::metrics::set_unacked_cnt(self.unacked_cnt.load(Ordering::Relaxed));
        crate::metrics::set_rs_progress(self.rs_left.load(Ordering::Relaxed), self.rs_total.load(Ordering::Relaxed));
        crate::metrics::set_bitmap_dirty_sectors(self.bitmap.dirty_sectors());
        crate::metrics::set_connection_state(self.conn.get().metric_label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::FileBackingStore;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> DeviceConfig {
        DeviceConfig {
            general: crate::config::General {
                backing_device: dir.join("disk.img"),
                meta_device: dir.join("disk.meta"),
                size_sectors: 16_384,
                json_logs: false,
                do_panic: false,
            },
            net: crate::config::NetCfg {
                peer_data_addr: "127.0.0.1:7788".parse().unwrap(),
                peer_meta_addr: "127.0.0.1:7789".parse().unwrap(),
                protocol: Protocol::C,
                timeout_ds: 60,
                ping_interval_ds: 100,
            },
            syncer: crate::config::Syncer { al_nr_extents: 16, rate_bytes_per_sec: 1_000_000, use_csums: false, skip: false, group: 0 },
            metrics: None,
        }
    }

    #[test]
    fn invalidate_marks_whole_volume_out_of_sync() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let backing = Box::new(FileBackingStore::open(&cfg.general.backing_device, cfg.general.size_sectors).unwrap());
        let dev = Device::new(cfg, backing);
        assert_eq!(dev.bitmap.dirty_sectors(), 0);
        dev.invalidate();
        assert!(dev.bitmap.dirty_sectors() > 0);
        assert_eq!(dev.rs_left.load(Ordering::SeqCst), dev.rs_total.load(Ordering::SeqCst));
    }

    #[test]
    fn set_secondary_refused_with_pending_requests() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let backing = Box::new(FileBackingStore::open(&cfg.general.backing_device, cfg.general.size_sectors).unwrap());
        let dev = Device::new(cfg, backing);
        dev.pending_cnt.store(1, Ordering::SeqCst);
        let err = dev.set_secondary().unwrap_err();
        assert!(matches!(err, DrbdError::StateRefused { .. }));
    }
}
