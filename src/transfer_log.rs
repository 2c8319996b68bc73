// src/transfer_log.rs
//
// Ordered in-memory log of writes sent but not yet fully acknowledged,
// organised into epochs separated by barriers. Epochs and requests each
// live in their own `slab::Slab` arena; an epoch's request membership is a
// `Vec` of request handles rather than owning the requests, and the epoch
// chain links oldest-to-newest via `Option<usize>` — the same arena-plus-
// handle idiom as `orderbook::InstrumentBook`'s FIFO price levels.

use slab::Slab;
use std::collections::HashSet;
use std::sync::Mutex;

pub type RequestHandle = usize;
pub type EpochHandle = usize;

#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub sector: u64,
    pub size: u32,
    pub epoch: EpochHandle,
    pub sent: bool,
    pub written_local: bool,
    pub got_ack: bool,
    pub read: bool,
}

impl Request {
    /// Requests are removed from the TL once local I/O and the
    /// protocol-required peer acknowledgement have both landed.
    pub fn is_complete(&self) -> bool {
        self.written_local && self.got_ack
    }
}

struct Epoch {
    number: u32,
    requests: Vec<RequestHandle>,
    next: Option<EpochHandle>,
    closed: bool,
    /// Request count snapshotted when the epoch was closed (the barrier
    /// frame's implied `set_size`); requests may already have been
    /// individually acked and removed by the time the barrier-ack arrives,
    /// so `release` checks against this rather than the live count.
    closed_count: Option<u32>,
}

struct Inner {
    epochs: Slab<Epoch>,
    requests: Slab<Request>,
    oldest: Option<EpochHandle>,
    newest: Option<EpochHandle>,
    next_epoch_number: u32,
}

impl Inner {
    fn ensure_open_epoch(&mut self) -> EpochHandle {
        if let Some(h) = self.newest {
            return h;
        }
        let number = self.next_epoch_number;
        self.next_epoch_number += 1;
        let h = self.epochs.insert(Epoch { number, requests: Vec::new(), next: None, closed: false, closed_count: None });
        self.oldest = Some(h);
        self.newest = Some(h);
        h
    }
}

pub struct TransferLog {
    inner: Mutex<Inner>,
}

impl Default for TransferLog {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                epochs: Slab::new(),
                requests: Slab::new(),
                oldest: None,
                newest: None,
                next_epoch_number: 0,
            }),
        }
    }
}

impl TransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a freshly admitted write to the newest (open) epoch.
    pub fn append(&self, id: u64, sector: u64, size: u32) -> RequestHandle {
        let mut guard = self.inner.lock().unwrap();
        let epoch = guard.ensure_open_epoch();
        let rh = guard.requests.insert(Request {
            id,
            sector,
            size,
            epoch,
            sent: false,
            written_local: false,
            got_ack: false,
            read: false,
        });
        guard.epochs[epoch].requests.push(rh);
        rh
    }

    pub fn with_request<R>(&self, handle: RequestHandle, f: impl FnOnce(&mut Request) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard.requests[handle])
    }

    /// True if any in-flight request overlaps `sector` — used by the resync
    /// engine to defer a read behind a concurrent application write.
    pub fn check_sector(&self, sector: u64) -> bool {
        let guard = self.inner.lock().unwrap();
        guard.requests.iter().any(|(_, r)| r.sector == sector)
    }

    /// Whether the next application write needs to be preceded by a
    /// barrier: the currently open epoch already has requests in it.
    pub fn needs_barrier(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        match guard.newest {
            Some(h) => !guard.epochs[h].requests.is_empty(),
            None => false,
        }
    }

    /// Closes the current epoch and opens a fresh one; called by the
    /// DiskSender immediately before it emits a barrier frame. Returns the
    /// closed epoch's number (for the barrier frame) and its request count.
    pub fn open_new_epoch(&self) -> (u32, usize) {
        let mut guard = self.inner.lock().unwrap();
        let closing = guard.ensure_open_epoch();
        guard.epochs[closing].closed = true;
        let closed_number = guard.epochs[closing].number;
        let closed_count = guard.epochs[closing].requests.len();
        guard.epochs[closing].closed_count = Some(closed_count as u32);

        let number = guard.next_epoch_number;
        guard.next_epoch_number += 1;
        let new_h = guard.epochs.insert(Epoch { number, requests: Vec::new(), next: None, closed: false, closed_count: None });
        guard.epochs[closing].next = Some(new_h);
        guard.newest = Some(new_h);
        (closed_number, closed_count)
    }

    /// Detaches `handle` from its epoch once it has fully completed
    /// (`Request::is_complete`); frees the epoch too if it is closed and now
    /// empty and is not the oldest-but-still-linked head. Returns the freed
    /// request for the caller to hand back to the upper layer.
    pub fn dependence(&self, handle: RequestHandle) -> Request {
        let mut guard = self.inner.lock().unwrap();
        let req = guard.requests.remove(handle);
        let epoch = req.epoch;
        if let Some(e) = guard.epochs.get_mut(epoch) {
            e.requests.retain(|&h| h != handle);
        }
        self.maybe_free_oldest(&mut guard);
        req
    }

    fn maybe_free_oldest(&self, guard: &mut Inner) {
        while let Some(h) = guard.oldest {
            let is_newest = guard.newest == Some(h);
            let epoch = &guard.epochs[h];
            if epoch.closed && epoch.requests.is_empty() && !is_newest {
                let next = epoch.next;
                guard.epochs.remove(h);
                guard.oldest = next;
            } else {
                break;
            }
        }
    }

    /// Invoked on receipt of a remote `BarrierAck(barrier_nr, set_size)`.
    /// Individual requests in the epoch typically arrive their own
    /// `RecvAck`/`WriteAck` and are `dependence`'d away before the barrier-
    /// ack follows, so by the time this runs the named epoch may already
    /// have been freed entirely — that is success, not an error. If the
    /// epoch is still the oldest, `set_size` is checked against the count
    /// snapshotted when the epoch was closed (not the live count, which may
    /// already be smaller), any requests still attached are marked
    /// acknowledged, and the epoch is force-freed.
    pub fn release(&self, barrier_nr: u32, set_size: u32) -> Result<Vec<RequestHandle>, String> {
        let mut guard = self.inner.lock().unwrap();
        let Some(oldest) = guard.oldest else {
            return Ok(Vec::new());
        };
        let epoch_number = guard.epochs[oldest].number;
        if epoch_number > barrier_nr {
            // Already advanced past this barrier: the epoch was fully
            // acked and freed earlier. Idempotent no-op.
            return Ok(Vec::new());
        }
        if epoch_number != barrier_nr {
            return Err(format!("barrier-ack for epoch {barrier_nr}, oldest is {epoch_number}"));
        }
        let expected = guard.epochs[oldest].closed_count.unwrap_or(guard.epochs[oldest].requests.len() as u32);
        if expected != set_size {
            return Err(format!("barrier-ack set_size {set_size} != epoch closed count {expected}"));
        }
        let handles = guard.epochs[oldest].requests.clone();
        for &h in &handles {
            if let Some(r) = guard.requests.get_mut(h) {
                r.got_ack = true;
            }
        }
        let next = guard.epochs[oldest].next;
        guard.epochs.remove(oldest);
        guard.oldest = next;
        if guard.oldest.is_none() {
            guard.newest = None;
        }
        Ok(handles)
    }

    /// Drops every pending request on connection loss; the upper layer is
    /// expected to retry them once reconnected. Returns the dropped ids.
    pub fn clear(&self) -> Vec<u64> {
        let mut guard = self.inner.lock().unwrap();
        let ids: Vec<u64> = guard.requests.iter().map(|(_, r)| r.id).collect();
        guard.requests.clear();
        guard.epochs.clear();
        guard.oldest = None;
        guard.newest = None;
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    /// TL-conservation check: sum of per-epoch counts equals the number of
    /// requests still awaiting their protocol-required acknowledgement.
    /// Once a request is acked it is detached from its epoch even if it is
    /// still waiting on local I/O to complete (`dependence`).
    pub fn epoch_counts_match_requests(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        let epoch_sum: usize = guard.epochs.iter().map(|(_, e)| e.requests.len()).sum();
        let unacked = guard.requests.iter().filter(|(_, r)| !r.got_ack).count();
        epoch_sum == unacked
    }

    pub fn distinct_sectors_in_flight(&self) -> HashSet<u64> {
        let guard = self.inner.lock().unwrap();
        guard.requests.iter().map(|(_, r)| r.sector).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_dependence_empties_log() {
        let tl = TransferLog::new();
        let h = tl.append(1, 0, 4096);
        assert_eq!(tl.pending_count(), 1);
        assert!(tl.check_sector(0));
        tl.with_request(h, |r| {
            r.written_local = true;
            r.got_ack = true;
        });
        let req = tl.dependence(h);
        assert!(req.is_complete());
        assert_eq!(tl.pending_count(), 0);
    }

    #[test]
    fn barrier_release_requires_matching_oldest_and_set_size() {
        let tl = TransferLog::new();
        tl.append(1, 0, 4096);
        tl.append(2, 8, 4096);
        let (barrier_nr, set_size) = tl.open_new_epoch();
        assert_eq!(set_size, 2);
        tl.append(3, 16, 4096);

        let err = tl.release(barrier_nr, 99).unwrap_err();
        assert!(err.contains("set_size"));

        let handles = tl.release(barrier_nr, set_size as u32).unwrap();
        assert_eq!(handles.len(), 2);
        assert!(tl.epoch_counts_match_requests());
        // the third request, in the new epoch, is untouched
        assert!(tl.check_sector(16));
    }

    #[test]
    fn clear_drops_everything_and_returns_ids() {
        let tl = TransferLog::new();
        tl.append(10, 0, 4096);
        tl.append(11, 8, 4096);
        let ids = tl.clear();
        assert_eq!(ids.len(), 2);
        assert_eq!(tl.pending_count(), 0);
    }

    #[test]
    fn needs_barrier_reflects_open_epoch_occupancy() {
        let tl = TransferLog::new();
        assert!(!tl.needs_barrier());
        tl.append(1, 0, 4096);
        assert!(tl.needs_barrier());
        tl.open_new_epoch();
        assert!(!tl.needs_barrier());
    }
}
