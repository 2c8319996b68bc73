// src/disk_sender.rs
//
// Sole writer of the data socket's bulk traffic and (sharing `meta_write`
// with the AckSender's pings) the meta socket's ack traffic. Drains three
// sources each pass: the entry pool's `done`/`rdone` lists, the Receiver's
// `AckJob` channel, and the `RequestPipeline`'s `SendJob` channel, then
// pumps one resync block when the connection is a sync source. Mirrors the
// teacher's dedicated sender loop that drains a work queue and writes
// frames under a single owned socket handle.

use crate::connection::ConnState;
use crate::device::Device;
use crate::metadata::GenCntKind;
use crate::request_pipeline::{AckJob, SendJob};
use crate::wire::{self, BarrierAck, BarrierPacket, BlockAck, ChecksumBlock, Command, DataHeader};
use crate::worker::WorkerSignal;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DiskSender {
    device: Arc<Device>,
    data_write: Arc<Mutex<TcpStream>>,
    meta_write: Arc<Mutex<TcpStream>>,
    send_rx: Receiver<SendJob>,
    ack_rx: Receiver<AckJob>,
    signal: Arc<WorkerSignal>,
}

impl DiskSender {
    pub fn new(
        device: Arc<Device>,
        data_write: Arc<Mutex<TcpStream>>,
        meta_write: Arc<Mutex<TcpStream>>,
        send_rx: Receiver<SendJob>,
        ack_rx: Receiver<AckJob>,
        signal: Arc<WorkerSignal>,
    ) -> Self {
        Self { device, data_write, meta_write, send_rx, ack_rx, signal }
    }

    pub fn run(&mut self) {
        while !self.signal.should_stop() {
            self.drain_pool_acks();
            self.drain_ack_jobs();

            match self.send_rx.recv_timeout(POLL_INTERVAL) {
                Ok(job) => {
                    if let Err(e) = self.handle_send_job(job) {
                        log::warn!("disk_sender: {e}");
                        self.device.conn.set(ConnState::BrokenPipe);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.device.conn.get() == ConnState::SyncSource {
                if let Err(e) = self.pump_resync() {
                    log::warn!("disk_sender: resync push failed: {e}");
                    self.device.conn.set(ConnState::BrokenPipe);
                    break;
                }
            }
        }
    }

    /// Emits a `RecvAck`/`WriteAck` for every entry the Receiver has
    /// finished with, per the kind it tagged at admission.
    fn drain_pool_acks(&self) {
        let meta_write = &self.meta_write;
        self.device.pool.process_done(|_handle, entry| {
            let ack = BlockAck { sector: entry.sector, block_id: entry.block_id, blksize: entry.buffer.len() as u32 };
            let command = match entry.ack_kind {
                crate::entry_pool::AckKind::RecvAck => Command::RecvAck,
                crate::entry_pool::AckKind::WriteAck => Command::WriteAck,
            };
            let mut stream = meta_write.lock().unwrap();
            if let Err(e) = wire::write_frame(&mut *stream, command, &ack.encode()) {
                log::warn!("disk_sender: failed to send ack for sector {}: {e}", entry.sector);
            }
            self.device.unacked_cnt.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Drains ack jobs the Receiver could not emit itself (`BarrierAck`,
    /// checksum-mode `BlockInSync`).
    fn drain_ack_jobs(&self) {
        while let Ok(job) = self.ack_rx.try_recv() {
            let mut stream = self.meta_write.lock().unwrap();
            let result = match job {
                AckJob::Barrier { barrier_nr, set_size } => {
                    let ack = BarrierAck { barrier: barrier_nr, set_size };
                    wire::write_frame(&mut *stream, Command::BarrierAck, &ack.encode())
                }
                AckJob::BlockInSync { sector, block_id, blksize } => {
                    let ack = BlockAck { sector, block_id, blksize };
                    wire::write_frame(&mut *stream, Command::BlockInSync, &ack.encode())
                }
            };
            if let Err(e) = result {
                log::warn!("disk_sender: failed to send ack job: {e}");
            }
        }
    }

    fn handle_send_job(&self, job: SendJob) -> crate::error::Result<()> {
        let mut stream = self.data_write.lock().unwrap();
        match job {
            SendJob::Barrier { barrier_nr } => {
                crate::metrics::inc_barrier();
                wire::write_frame(&mut *stream, Command::Barrier, &BarrierPacket { barrier: barrier_nr }.encode())
            }
            SendJob::Data { handle, sector, block_id, payload } => {
                let header = DataHeader { sector, block_id };
                let mut out = header.encode().to_vec();
                out.extend_from_slice(&payload);
                wire::write_frame(&mut *stream, Command::Data, &out)?;
                self.device.tl.with_request(handle, |r| r.sent = true);
                Ok(())
            }
            SendJob::DataRequest { sector, block_id, blksize } => {
                let req = crate::wire::BlockRequest { sector, block_id, blksize };
                wire::write_frame(&mut *stream, Command::DataRequest, &req.encode())
            }
        }
    }

    /// Sends one resync block (or checksum announcement) and advances this
    /// side's own dirty bit optimistically, since the push model does not
    /// wait for the peer's ack before moving to the next block.
    fn pump_resync(&self) -> crate::error::Result<()> {
        let Some(block) = self.device.resync.next_source_block(&self.device)? else {
            // Pass over the bitmap complete. If some blocks were deferred
            // behind in-flight application writes, rs_left is still
            // nonzero and a fresh pass will pick them up.
            if self.device.rs_left.load(Ordering::SeqCst) == 0 {
                if self.device.conn.get() == ConnState::SyncSource {
                    self.device.conn.set(ConnState::Connected);
                    self.device.metadata.lock().unwrap().inc(GenCntKind::ConsistentEpoch);
                }
            } else {
                self.device.resync.reset_scan();
                std::thread::sleep(Duration::from_millis(50));
            }
            return Ok(());
        };

        let use_csums = self.device.sync_param.lock().unwrap().use_csums != 0;
        let block_id = self.device.resync.next_block_id();
        if use_csums && self.device.peer_supports_csum() {
            let csum: ChecksumBlock = self.device.resync.checksum_block(block.sector, block_id, &block.data);
            let mut stream = self.data_write.lock().unwrap();
            wire::write_frame(&mut *stream, Command::Csum, &csum.encode())?;
            // The target answers with BlockInSync or RSDataRequest; either
            // way this side does not clear its own bit until it has
            // positive confirmation, so it waits for the target's reply
            // path instead of clearing here.
            Ok(())
        } else {
            let header = DataHeader { sector: block.sector, block_id };
            let mut out = header.encode().to_vec();
            out.extend_from_slice(&block.data);
            {
                let mut stream = self.data_write.lock().unwrap();
                wire::write_frame(&mut *stream, Command::Data, &out)?;
            }
            self.device.confirm_in_sync(block.sector, block.data.len() as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::FileBackingStore;
    use crate::bitmap::SyncState;
    use crate::config::{DeviceConfig, General, NetCfg, Protocol, Syncer};
    use crate::entry_pool::ListTag;
    use crossbeam_channel::unbounded;
    use std::net::{TcpListener, TcpStream};
    use tempfile::tempdir;

    fn test_device(dir: &std::path::Path) -> Arc<Device> {
        let cfg = DeviceConfig {
            general: General { backing_device: dir.join("d.img"), meta_device: dir.join("d.meta"), size_sectors: 1 << 16, json_logs: false, do_panic: false },
            net: NetCfg { peer_data_addr: "127.0.0.1:1".parse().unwrap(), peer_meta_addr: "127.0.0.1:2".parse().unwrap(), protocol: Protocol::C, timeout_ds: 50, ping_interval_ds: 100 },
            syncer: Syncer { al_nr_extents: 8, rate_bytes_per_sec: 0, use_csums: false, skip: false, group: 0 },
            metrics: None,
        };
        let backing = Box::new(FileBackingStore::open(&cfg.general.backing_device, cfg.general.size_sectors).unwrap());
        Arc::new(Device::new(cfg, backing))
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn drains_pool_done_entries_into_ack_frames() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        let (_send_tx, send_rx) = unbounded();
        let (_ack_tx, ack_rx) = unbounded();
        let (data1, _data2) = loopback_pair();
        let (meta1, mut meta2) = loopback_pair();
        meta2.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();

        let h = dev.pool.get(ListTag::Active, false).unwrap();
        dev.pool.with_entry(h, |e| {
            e.sector = 0;
            e.block_id = 7;
            e.ack_kind = crate::entry_pool::AckKind::WriteAck;
        });
        dev.pool.mark(h, ListTag::Done);
        dev.unacked_cnt.fetch_add(1, Ordering::SeqCst);

        let sender = DiskSender::new(dev.clone(), Arc::new(Mutex::new(data1)), Arc::new(Mutex::new(meta1)), send_rx, ack_rx, Arc::new(WorkerSignal::new()));
        sender.drain_pool_acks();
        let (cmd, payload) = wire::read_frame(&mut meta2).unwrap();
        assert_eq!(cmd, Command::WriteAck);
        let ack = BlockAck::decode(&payload).unwrap();
        assert_eq!(ack.block_id, 7);
        assert_eq!(dev.unacked_cnt.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pump_resync_pushes_a_block_and_clears_its_own_bit() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        dev.backing.write_at(0, &[0x5Au8; 4096]).unwrap();
        dev.bitmap.set(0, 4096, SyncState::OutOfSync);
        dev.rs_total.store(8, Ordering::SeqCst);
        dev.rs_left.store(8, Ordering::SeqCst);
        dev.conn.set(ConnState::SyncSource);

        let (_send_tx, send_rx) = unbounded();
        let (_ack_tx, ack_rx) = unbounded();
        let (w1, mut w2) = loopback_pair();
        w2.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
        let (m1, _m2) = loopback_pair();

        let sender = DiskSender::new(dev.clone(), Arc::new(Mutex::new(w1)), Arc::new(Mutex::new(m1)), send_rx, ack_rx, Arc::new(WorkerSignal::new()));
        sender.pump_resync().unwrap();

        let (cmd, payload) = wire::read_frame(&mut w2).unwrap();
        assert_eq!(cmd, Command::Data);
        assert!(!dev.bitmap.get(0, 4096));
        assert_eq!(dev.rs_left.load(Ordering::SeqCst), 0);
        let _ = payload;
    }
}
