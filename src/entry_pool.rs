// src/entry_pool.rs
//
// Fixed-capacity pool of replication buffers threaded through six lifecycle
// lists. Entries live in a `slab::Slab` arena and list membership is just a
// queue of slab indices — the same arena-plus-handle idiom the teacher uses
// for order nodes in `orderbook::InstrumentBook`, adapted here with
// `VecDeque<usize>` queues instead of intrusive prev/next links since these
// lists are drained strictly FIFO rather than needing mid-list removal.

use crate::error::{DrbdError, Result};
use slab::Slab;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub type EntryHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTag {
    Free,
    Active,
    Sync,
    Done,
    Read,
    RDone,
}

/// Which acknowledgement the DiskSender emits when it drains this entry
/// off `done`/`rdone` — set by the Receiver according to the negotiated
/// protocol (B replies as soon as the payload is in memory; C waits for
/// the local write to land) before the entry is even queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    RecvAck,
    WriteAck,
}

pub struct EpochEntry {
    pub buffer: Vec<u8>,
    pub block_id: u64,
    pub sector: u64,
    pub list: ListTag,
    pub ack_kind: AckKind,
}

struct Lists {
    entries: Slab<EpochEntry>,
    free: VecDeque<EntryHandle>,
    active: VecDeque<EntryHandle>,
    sync: VecDeque<EntryHandle>,
    done: VecDeque<EntryHandle>,
    read: VecDeque<EntryHandle>,
    rdone: VecDeque<EntryHandle>,
}

impl Lists {
    fn queue_mut(&mut self, tag: ListTag) -> &mut VecDeque<EntryHandle> {
        match tag {
            ListTag::Free => &mut self.free,
            ListTag::Active => &mut self.active,
            ListTag::Sync => &mut self.sync,
            ListTag::Done => &mut self.done,
            ListTag::Read => &mut self.read,
            ListTag::RDone => &mut self.rdone,
        }
    }

    fn move_to(&mut self, handle: EntryHandle, dest: ListTag) {
        let current = self.entries[handle].list;
        let q = self.queue_mut(current);
        if let Some(pos) = q.iter().position(|&h| h == handle) {
            q.remove(pos);
        }
        self.entries[handle].list = dest;
        self.queue_mut(dest).push_back(handle);
    }

    fn total(&self) -> usize {
        self.free.len() + self.active.len() + self.sync.len() + self.done.len() + self.read.len() + self.rdone.len()
    }
}

pub struct EntryPool {
    lists: Mutex<Lists>,
    cv: Condvar,
    capacity: usize,
    block_size: usize,
}

impl EntryPool {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let mut entries = Slab::with_capacity(capacity);
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            let h = entries.insert(EpochEntry {
                buffer: vec![0u8; block_size],
                block_id: 0,
                sector: 0,
                list: ListTag::Free,
                ack_kind: AckKind::WriteAck,
            });
            free.push_back(h);
        }
        Self {
            lists: Mutex::new(Lists {
                entries,
                free,
                active: VecDeque::new(),
                sync: VecDeque::new(),
                done: VecDeque::new(),
                read: VecDeque::new(),
                rdone: VecDeque::new(),
            }),
            cv: Condvar::new(),
            capacity,
            block_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Draws a free entry, tagging it `dest` (`Active`, `Sync`, or `Read`
    /// depending on the caller's purpose). Blocks until one is available if
    /// `may_sleep`; otherwise returns `OutOfBuffers` immediately.
    pub fn get(&self, dest: ListTag, may_sleep: bool) -> Result<EntryHandle> {
        let mut guard = self.lists.lock().unwrap();
        loop {
            if let Some(h) = guard.free.pop_front() {
                guard.entries[h].list = dest;
                guard.queue_mut(dest).push_back(h);
                return Ok(h);
            }
            if !may_sleep {
                crate::metrics::inc_pool_exhausted();
                return Err(DrbdError::OutOfBuffers);
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }

    pub fn mark(&self, handle: EntryHandle, dest: ListTag) {
        let mut guard = self.lists.lock().unwrap();
        guard.move_to(handle, dest);
        if dest == ListTag::Free {
            self.cv.notify_one();
        }
    }

    pub fn put(&self, handle: EntryHandle) {
        self.mark(handle, ListTag::Free);
    }

    pub fn with_entry<R>(&self, handle: EntryHandle, f: impl FnOnce(&mut EpochEntry) -> R) -> R {
        let mut guard = self.lists.lock().unwrap();
        f(&mut guard.entries[handle])
    }

    /// Drains `done` and `rdone`, invoking `on_done` for each entry in
    /// arrival order and returning it to `free`. `on_done` runs with the
    /// pool lock released so it may itself call back into other locked
    /// components (e.g. emitting an ack frame).
    pub fn process_done(&self, mut on_done: impl FnMut(EntryHandle, &EpochEntry)) {
        loop {
            let next = {
                let mut guard = self.lists.lock().unwrap();
                guard.done.pop_front().or_else(|| guard.rdone.pop_front())
            };
            let Some(handle) = next else { break };
            {
                let guard = self.lists.lock().unwrap();
                on_done(handle, &guard.entries[handle]);
            }
            self.put(handle);
        }
    }

    /// Pool-conservation invariant: every entry is on exactly one list.
    pub fn total_accounted(&self) -> usize {
        self.lists.lock().unwrap().total()
    }
}
