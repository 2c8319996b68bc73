// src/handshake.rs
//
// Connection establishment: `ReportParams`/`ReportBitMap` exchange and the
// generation-counter comparison that decides which side becomes sync source
// or target (or whether the link is already consistent). Runs once, before
// the Receiver/DiskSender/AckSender loops start, directly on the data
// socket — the same one-shot "negotiate before streaming" shape the
// teacher's connection setup uses ahead of its steady-state worker loops.

use crate::bitmap::{SyncState, BLOCK_SIZE};
use crate::connection::ConnState;
use crate::device::Device;
use crate::error::{DrbdError, Result};
use crate::metadata::Metadata;
use crate::wire::{self, Command, Packet, Parameter, PROTOCOL_VERSION};
use std::cmp::Ordering;
use std::net::TcpStream;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};

fn local_parameter(device: &Device) -> Parameter {
    let meta = *device.metadata.lock().unwrap();
    Parameter {
        p_size: device.config.general.size_sectors,
        u_size: device.config.general.size_sectors,
        protocol: device.current_protocol() as u32,
        version: PROTOCOL_VERSION,
        gen_cnt: meta.gen_cnt,
        bit_map_gen: meta.bit_map_gen,
        sync_rate: device.config.syncer.rate_bytes_per_sec as u32,
    }
}

fn peer_metadata(params: &Parameter) -> Metadata {
    let mut meta = Metadata::default();
    meta.gen_cnt = params.gen_cnt;
    meta.bit_map_gen = params.bit_map_gen;
    meta
}

/// Wire layout for one `ReportBitMap` payload: the chunk's starting bit
/// index followed by its packed words, all big-endian — the same
/// fixed-header-then-words shape `wire::DataHeader` uses ahead of a block.
fn encode_bitmap_chunk(start_bit: u64, words: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + words.len() * 8);
    out.extend_from_slice(&start_bit.to_be_bytes());
    for w in words {
        out.extend_from_slice(&w.to_be_bytes());
    }
    out
}

fn decode_bitmap_chunk(buf: &[u8]) -> Result<(u64, Vec<u64>)> {
    if buf.len() < 8 || (buf.len() - 8) % 8 != 0 {
        return Err(DrbdError::protocol("malformed bitmap chunk"));
    }
    let start_bit = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    let words = buf[8..].chunks_exact(8).map(|c| u64::from_be_bytes(c.try_into().unwrap())).collect();
    Ok((start_bit, words))
}

/// Marks every set bit in a received chunk out-of-sync locally. The peer's
/// bitmap reflects what changed on its side while this node was
/// disconnected; a bit it reports dirty means the two copies can no longer
/// be assumed identical there, regardless of what this node's own bitmap
/// already says.
fn apply_peer_chunk(device: &Device, start_bit: u64, words: &[u64]) {
    for (i, word) in words.iter().enumerate() {
        if *word == 0 {
            continue;
        }
        for bit_in_word in 0..64u64 {
            if word & (1 << bit_in_word) != 0 {
                let bit = start_bit + i as u64 * 64 + bit_in_word;
                let sector = crate::bitmap::Bitmap::block_sector(bit);
                device.bitmap.set(sector, BLOCK_SIZE, SyncState::OutOfSync);
            }
        }
    }
}

fn send_local_bitmap(device: &Device, data_write: &Arc<Mutex<TcpStream>>) -> Result<()> {
    device.bitmap.reset_cursor();
    while let Some((start_bit, words)) = device.bitmap.next_dirty_chunk() {
        let payload = encode_bitmap_chunk(start_bit, &words);
        let mut stream = data_write.lock().unwrap();
        wire::write_frame(&mut *stream, Command::ReportBitMap, &payload)?;
    }
    // Zero-length chunk marks the end of this side's stream.
    let mut stream = data_write.lock().unwrap();
    wire::write_frame(&mut *stream, Command::ReportBitMap, &[])
}

fn recv_peer_bitmap(device: &Device, data_read: &mut TcpStream) -> Result<()> {
    loop {
        let (command, payload) = wire::read_frame(data_read)?;
        if command != Command::ReportBitMap {
            return Err(DrbdError::protocol("expected ReportBitMap during handshake"));
        }
        if payload.is_empty() {
            return Ok(());
        }
        let (start_bit, words) = decode_bitmap_chunk(&payload)?;
        apply_peer_chunk(device, start_bit, &words);
    }
}

/// Runs the full handshake and leaves `device.conn` in `Connected`,
/// `SyncSource`, or `SyncTarget`. Any disagreement this node cannot resolve
/// on its own (size mismatch, diverged generation counters) is a protocol
/// violation: the caller tears the connection down for operator
/// intervention rather than guessing.
pub fn negotiate(device: &Arc<Device>, data_read: &mut TcpStream, data_write: &Arc<Mutex<TcpStream>>) -> Result<()> {
    device.conn.set(ConnState::WFReportParams);

    let local = local_parameter(device);
    {
        let mut stream = data_write.lock().unwrap();
        wire::write_frame(&mut *stream, Command::ReportParams, &local.encode())?;
    }

    let (command, payload) = wire::read_frame(data_read)?;
    if command != Command::ReportParams {
        return Err(DrbdError::protocol("expected ReportParams as the handshake's first frame"));
    }
    let peer = Parameter::decode(&payload)?;
    device.peer_version.store(peer.version, AtomicOrdering::SeqCst);

    if peer.p_size != local.p_size {
        return Err(DrbdError::protocol(format!(
            "peer volume size {} sectors does not match local {} sectors",
            peer.p_size, local.p_size
        )));
    }

    let peer_meta = peer_metadata(&peer);
    let ordering = device.metadata.lock().unwrap().compare(&peer_meta);

    send_local_bitmap(device, data_write)?;
    recv_peer_bitmap(device, data_read)?;

    match ordering {
        None => Err(DrbdError::protocol(
            "generation counters equal but bitmap generations diverge: histories cannot be reconciled automatically",
        )),
        Some(Ordering::Equal) => {
            device.conn.set(ConnState::Connected);
            Ok(())
        }
        Some(Ordering::Greater) => {
            let mut stream = data_write.lock().unwrap();
            wire::write_frame(&mut *stream, Command::BecomeSyncSource, &[])?;
            drop(stream);
            device.conn.set(ConnState::SyncSource);
            device.resync.reset_scan();
            let total = device.bitmap.dirty_sectors();
            device.rs_total.store(total, AtomicOrdering::SeqCst);
            device.rs_left.store(total, AtomicOrdering::SeqCst);
            Ok(())
        }
        Some(Ordering::Less) => {
            let mut stream = data_write.lock().unwrap();
            wire::write_frame(&mut *stream, Command::BecomeSyncTarget, &[])?;
            drop(stream);
            device.conn.set(ConnState::SyncTarget);
            device.resync.reset_scan();
            let total = device.bitmap.dirty_sectors();
            device.rs_total.store(total, AtomicOrdering::SeqCst);
            device.rs_left.store(total, AtomicOrdering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::FileBackingStore;
    use crate::config::{DeviceConfig, General, NetCfg, Protocol, Syncer};
    use crate::metadata::GenCntKind;
    use std::net::TcpListener;
    use std::thread;
    use tempfile::tempdir;

    fn test_device(dir: &std::path::Path, name: &str) -> Arc<Device> {
        let cfg = DeviceConfig {
            general: General { backing_device: dir.join(format!("{name}.img")), meta_device: dir.join(format!("{name}.meta")), size_sectors: 8192, json_logs: false, do_panic: false },
            net: NetCfg { peer_data_addr: "127.0.0.1:1".parse().unwrap(), peer_meta_addr: "127.0.0.1:2".parse().unwrap(), protocol: Protocol::C, timeout_ds: 50, ping_interval_ds: 100 },
            syncer: Syncer { al_nr_extents: 8, rate_bytes_per_sec: 0, use_csums: false, skip: false, group: 0 },
            metrics: None,
        };
        let backing = Box::new(FileBackingStore::open(&cfg.general.backing_device, cfg.general.size_sectors).unwrap());
        Arc::new(Device::new(cfg, backing))
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn equal_generation_counters_connect_directly() {
        let dir = tempdir().unwrap();
        let a = test_device(dir.path(), "a");
        let b = test_device(dir.path(), "b");
        let (mut s1, mut s2) = connected_pair();
        let w1 = Arc::new(Mutex::new(s1.try_clone().unwrap()));
        let w2 = Arc::new(Mutex::new(s2.try_clone().unwrap()));

        let a2 = a.clone();
        let t = thread::spawn(move || negotiate(&a2, &mut s1, &w1));
        negotiate(&b, &mut s2, &w2).unwrap();
        t.join().unwrap().unwrap();

        assert_eq!(a.conn.get(), ConnState::Connected);
        assert_eq!(b.conn.get(), ConnState::Connected);
    }

    #[test]
    fn higher_generation_counter_becomes_sync_source() {
        let dir = tempdir().unwrap();
        let a = test_device(dir.path(), "a");
        let b = test_device(dir.path(), "b");
        a.metadata.lock().unwrap().inc(GenCntKind::HumanIntervention);
        a.bitmap.set(0, 4096, SyncState::OutOfSync);

        let (mut s1, mut s2) = connected_pair();
        let w1 = Arc::new(Mutex::new(s1.try_clone().unwrap()));
        let w2 = Arc::new(Mutex::new(s2.try_clone().unwrap()));

        let a2 = a.clone();
        let t = thread::spawn(move || negotiate(&a2, &mut s1, &w1));
        negotiate(&b, &mut s2, &w2).unwrap();
        t.join().unwrap().unwrap();

        assert_eq!(a.conn.get(), ConnState::SyncSource);
        assert_eq!(b.conn.get(), ConnState::SyncTarget);
        // b learned about a's out-of-sync block from the bitmap exchange.
        assert!(b.bitmap.get(0, 4096));
    }

    #[test]
    fn mismatched_volume_size_is_a_protocol_violation() {
        let dir = tempdir().unwrap();
        let a = test_device(dir.path(), "a");
        let cfg = DeviceConfig {
            general: General { backing_device: dir.join("c.img"), meta_device: dir.join("c.meta"), size_sectors: 4096, json_logs: false, do_panic: false },
            net: NetCfg { peer_data_addr: "127.0.0.1:1".parse().unwrap(), peer_meta_addr: "127.0.0.1:2".parse().unwrap(), protocol: Protocol::C, timeout_ds: 50, ping_interval_ds: 100 },
            syncer: Syncer { al_nr_extents: 8, rate_bytes_per_sec: 0, use_csums: false, skip: false, group: 0 },
            metrics: None,
        };
        let backing = Box::new(FileBackingStore::open(&cfg.general.backing_device, cfg.general.size_sectors).unwrap());
        let b = Arc::new(Device::new(cfg, backing));

        let (mut s1, mut s2) = connected_pair();
        let w1 = Arc::new(Mutex::new(s1.try_clone().unwrap()));
        let w2 = Arc::new(Mutex::new(s2.try_clone().unwrap()));

        let a2 = a.clone();
        let t = thread::spawn(move || negotiate(&a2, &mut s1, &w1));
        let err = negotiate(&b, &mut s2, &w2).unwrap_err();
        assert!(err.is_integrity_fatal());
        let _ = t.join();
    }
}
