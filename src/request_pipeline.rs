// src/request_pipeline.rs
//
// Primary-side entry point for upper-layer reads and writes. Completion
// waiting is modelled the same way the teacher hands blocking follow-up
// work off to a dedicated consumer via a channel (`snapshot::SnapshotWriter`):
// `submit_write` parks on a per-request `Condvar` that the Receiver's ack
// handling wakes once the protocol-required condition is met, instead of
// polling.

use crate::config::Protocol;
use crate::device::Device;
use crate::error::{DrbdError, Result};
use crate::transfer_log::RequestHandle;
use crossbeam_channel::Sender;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Work handed to the DiskSender for transmission over the data socket.
pub enum SendJob {
    Barrier { barrier_nr: u32 },
    Data { handle: RequestHandle, sector: u64, block_id: u64, payload: Vec<u8> },
    DataRequest { sector: u64, block_id: u64, blksize: u32 },
}

/// Ack traffic the Receiver decides is owed to the peer but does not emit
/// itself — it hands the job to the DiskSender, which is the sole writer
/// of the meta socket's ack frames (alongside the entry pool's done/rdone
/// drain), matching the lock discipline in `msock_mutex`.
pub enum AckJob {
    Barrier { barrier_nr: u32, set_size: u32 },
    BlockInSync { sector: u64, block_id: u64, blksize: u32 },
}

type BoolWaiter = Arc<(Mutex<bool>, Condvar)>;
type ReadWaiter = Arc<(Mutex<Option<Vec<u8>>>, Condvar)>;

pub struct RequestPipeline {
    device: Arc<Device>,
    send_tx: Sender<SendJob>,
    write_waiters: Mutex<HashMap<RequestHandle, BoolWaiter>>,
    read_waiters: Mutex<HashMap<u64, ReadWaiter>>,
    /// Maps a write's wire `block_id` back to its transfer-log handle so the
    /// Receiver, which only ever sees the `block_id` the peer echoes in a
    /// `RecvAck`/`WriteAck`, can resolve it.
    id_to_handle: Mutex<HashMap<u64, RequestHandle>>,
    next_block_id: AtomicU64,
}

impl RequestPipeline {
    pub fn new(device: Arc<Device>, send_tx: Sender<SendJob>) -> Self {
        Self {
            device,
            send_tx,
            write_waiters: Mutex::new(HashMap::new()),
            read_waiters: Mutex::new(HashMap::new()),
            id_to_handle: Mutex::new(HashMap::new()),
            next_block_id: AtomicU64::new(1),
        }
    }

    /// Admits an upper-layer write. Blocks the caller until the protocol's
    /// completion condition is met: local I/O only for protocol A, a
    /// `RecvAck` for B, a `WriteAck` for C.
    pub fn submit_write(&self, sector: u64, data: &[u8]) -> Result<()> {
        self.device.al.begin_io(sector)?;

        if self.device.bb.is_busy(sector) {
            self.device.bb.wait(sector);
        }

        if self.device.tl.needs_barrier() {
            let (barrier_nr, _count) = self.device.tl.open_new_epoch();
            crate::metrics::inc_barrier();
            self.send_tx
                .send(SendJob::Barrier { barrier_nr })
                .map_err(|_| DrbdError::BrokenPipe)?;
        }

        let block_id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        let handle = self.device.tl.append(block_id, sector, data.len() as u32);
        self.id_to_handle.lock().unwrap().insert(block_id, handle);

        self.device.backing.write_at(sector, data)?;
        let already_complete = self.device.tl.with_request(handle, |r| {
            r.written_local = true;
            r.is_complete()
        });

        let protocol = self.device.current_protocol();
        let waiter = if protocol != Protocol::A && !already_complete {
            let w: BoolWaiter = Arc::new((Mutex::new(false), Condvar::new()));
            self.write_waiters.lock().unwrap().insert(handle, w.clone());
            Some(w)
        } else {
            None
        };

        self.device.pending_cnt.fetch_add(1, Ordering::SeqCst);
        self.send_tx
            .send(SendJob::Data { handle, sector, block_id, payload: data.to_vec() })
            .map_err(|_| DrbdError::BrokenPipe)?;

        if already_complete {
            self.finalize(handle);
        } else if let Some(w) = waiter {
            let (lock, cv) = &*w;
            let mut done = lock.lock().unwrap();
            while !*done {
                done = cv.wait(done).unwrap();
            }
        }
        Ok(())
    }

    /// Serves an upper-layer read from the local backing store when the
    /// region is in-sync; otherwise routes it to the peer as a
    /// `DataRequest` and blocks for the `DataReply`.
    pub fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if !self.device.bitmap.get(sector, buf.len() as u64) {
            return self.device.backing.read_at(sector, buf);
        }

        let block_id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        let waiter: ReadWaiter = Arc::new((Mutex::new(None), Condvar::new()));
        self.read_waiters.lock().unwrap().insert(block_id, waiter.clone());
        self.send_tx
            .send(SendJob::DataRequest { sector, block_id, blksize: buf.len() as u32 })
            .map_err(|_| DrbdError::BrokenPipe)?;

        let (lock, cv) = &*waiter;
        let mut data = lock.lock().unwrap();
        while data.is_none() {
            data = cv.wait(data).unwrap();
        }
        let bytes = data.take().unwrap();
        let n = buf.len().min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Called by the Receiver when a `DataReply` for `block_id` arrives.
    pub fn data_reply_received(&self, block_id: u64, payload: Vec<u8>) {
        if let Some(w) = self.read_waiters.lock().unwrap().remove(&block_id) {
            let (lock, cv) = &*w;
            *lock.lock().unwrap() = Some(payload);
            cv.notify_all();
        }
    }

    /// Called by the Receiver when the protocol-required ack (`RecvAck` or
    /// `WriteAck`) for `handle` arrives.
    pub fn ack_received(&self, handle: RequestHandle) {
        let complete = self.device.tl.with_request(handle, |r| {
            r.got_ack = true;
            r.is_complete()
        });
        if complete {
            self.finalize(handle);
        }
    }

    /// Same as `ack_received`, but resolves the peer's echoed `block_id`
    /// back to a transfer-log handle first. A miss means the request was
    /// already finalized by a covering barrier-ack; that is not an error.
    pub fn ack_received_by_id(&self, block_id: u64) {
        let handle = self.id_to_handle.lock().unwrap().get(&block_id).copied();
        if let Some(handle) = handle {
            self.ack_received(handle);
        }
    }

    /// Called once a barrier-ack resolves a batch of requests at once.
    pub fn barrier_resolved(&self, handles: Vec<RequestHandle>) {
        for h in handles {
            self.ack_received(h);
        }
    }

    fn finalize(&self, handle: RequestHandle) {
        let req = self.device.tl.dependence(handle);
        self.device.al.complete_io(req.sector);
        self.device.pending_cnt.fetch_sub(1, Ordering::SeqCst);
        self.id_to_handle.lock().unwrap().remove(&req.id);
        if let Some(w) = self.write_waiters.lock().unwrap().remove(&handle) {
            let (lock, cv) = &*w;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
    }
}
