// src/receiver.rs
//
// Reads framed packets off the data socket and dispatches each by command:
// apply an incoming block, resolve a pending ack, answer a peer-initiated
// read, or step the connection state machine. Mirrors the teacher's
// `rx_loop` shape (blocking read with a short timeout so `WorkerSignal` is
// checked between frames) but decodes into `wire::Packet` instead of a raw
// market-data frame.

use crate::config::Protocol;
use crate::connection::ConnState;
use crate::device::Device;
use crate::entry_pool::{AckKind, ListTag};
use crate::error::{DrbdError, Result};
use crate::request_pipeline::{AckJob, RequestPipeline};
use crate::wire::{self, Command, DataHeader, Packet};
use crate::worker::WorkerSignal;
use crossbeam_channel::Sender;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

pub struct Receiver {
    device: Arc<Device>,
    pipeline: Arc<RequestPipeline>,
    data_read: TcpStream,
    data_write: Arc<Mutex<TcpStream>>,
    ack_tx: Sender<AckJob>,
    signal: Arc<WorkerSignal>,
}

impl Receiver {
    pub fn new(
        device: Arc<Device>,
        pipeline: Arc<RequestPipeline>,
        data_read: TcpStream,
        data_write: Arc<Mutex<TcpStream>>,
        ack_tx: Sender<AckJob>,
        signal: Arc<WorkerSignal>,
    ) -> Self {
        Self { device, pipeline, data_read, data_write, ack_tx, signal }
    }

    /// Runs until `signal` requests a stop or the socket is lost. Read
    /// timeouts are not errors: they are how the worker notices `signal`
    /// between frames when the peer is quiet.
    pub fn run(&mut self) {
        loop {
            if self.signal.should_stop() {
                break;
            }
            match wire::read_frame(&mut self.data_read) {
                Ok((command, payload)) => match Packet::decode(command, &payload) {
                    Ok(packet) => {
                        if let Err(e) = self.dispatch(packet) {
                            log::error!("receiver: {e}");
                            if e.is_integrity_fatal() {
                                self.device.conn.set(ConnState::BrokenPipe);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("receiver: malformed frame: {e}");
                        self.device.conn.set(ConnState::BrokenPipe);
                        break;
                    }
                },
                Err(DrbdError::BackingIo(ref io_err))
                    if matches!(io_err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => {
                    log::warn!("receiver: connection lost: {e}");
                    self.device.conn.set(ConnState::BrokenPipe);
                    break;
                }
            }
        }
        self.device.disconnect();
    }

    fn dispatch(&self, packet: Packet) -> Result<()> {
        let device = &self.device;
        match packet {
            Packet::Data { header, block } => self.handle_data(header, block),
            Packet::DataReply { header, block } => {
                self.pipeline.data_reply_received(header.block_id, block);
                Ok(())
            }
            // RecvAck/WriteAck/BarrierAck/BlockInSync travel on the meta
            // socket (the AckSender's job) precisely so bulk data frames on
            // this socket can never head-of-line-block them; a peer sending
            // one here is not following that split.
            Packet::RecvAck(_) | Packet::WriteAck(_) | Packet::BarrierAck(_) | Packet::BlockInSync(_) => {
                Err(DrbdError::protocol("ack-class packet received on the data socket"))
            }
            Packet::Barrier(b) => {
                let set_size = device.peer_epoch_count.swap(0, std::sync::atomic::Ordering::SeqCst) as u32;
                self.ack_tx
                    .send(AckJob::Barrier { barrier_nr: b.barrier, set_size })
                    .map_err(|_| DrbdError::BrokenPipe)
            }
            Packet::ReportParams(params) => {
                device.peer_version.store(params.version, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            Packet::ReportBitMap(_chunk) => {
                // Handshake bitmap exchange is driven by the connection
                // establishment routine, not the steady-state receive loop.
                Ok(())
            }
            Packet::Ping | Packet::PingAck => Ok(()),
            Packet::BecomeSyncTarget => {
                device.conn.set(ConnState::SyncTarget);
                device.resync.reset_scan();
                Ok(())
            }
            Packet::BecomeSyncSource => {
                device.conn.set(ConnState::SyncSource);
                device.resync.reset_scan();
                Ok(())
            }
            Packet::BecomeSec => {
                // Both sides demanding the secondary role at once cannot be
                // resolved locally: treat it as a protocol violation so the
                // connection tears down for operator intervention.
                if device.is_primary() {
                    Err(DrbdError::protocol("peer requested BecomeSec while this node is primary"))
                } else {
                    Ok(())
                }
            }
            Packet::WriteHint => Ok(()),
            Packet::DataRequest(req) => self.serve_block_read(req.sector, req.block_id, req.blksize, true),
            Packet::RSDataRequest(req) => self.serve_block_read(req.sector, req.block_id, req.blksize, false),
            Packet::SetSyncParam(param) => {
                device.set_sync_param(param);
                Ok(())
            }
            Packet::SyncStop => Ok(()),
            Packet::SyncCont => Ok(()),
            Packet::Csum(csum) => self.handle_csum(csum),
        }
    }

    fn handle_data(&self, header: DataHeader, block: Vec<u8>) -> Result<()> {
        let device = &self.device;
        device.unacked_cnt.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let protocol = device.current_protocol();
        let handle = device.pool.get(ListTag::Active, true)?;
        device.pool.with_entry(handle, |e| {
            e.sector = header.sector;
            e.block_id = header.block_id;
            e.buffer.clear();
            e.buffer.extend_from_slice(&block);
            e.ack_kind = if protocol == Protocol::B { AckKind::RecvAck } else { AckKind::WriteAck };
        });

        if !device.conn.get().is_syncing() {
            device.peer_epoch_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        if protocol == Protocol::B {
            // B acks as soon as the payload is resident; the local write
            // races the ack and is best-effort from the peer's point of
            // view, same as the protocol's definition.
            device.pool.mark(handle, ListTag::Done);
            if let Err(e) = device.apply_incoming_block(header.sector, &block) {
                log::error!("receiver: local write failed for sector {}: {e}", header.sector);
            }
        } else if let Err(e) = device.apply_incoming_block(header.sector, &block) {
            log::error!("receiver: local write failed for sector {}: {e}", header.sector);
            device.pool.put(handle);
            device.unacked_cnt.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Err(e);
        } else {
            device.pool.mark(handle, ListTag::Done);
        }
        Ok(())
    }

    /// Answers a peer-initiated read of local disk content: `DataRequest`
    /// replies with `DataReply` (an upper-layer diskless read on the
    /// peer), `RSDataRequest` replies with a plain `Data` frame (a resync
    /// target pulling the real block after a checksum mismatch), which the
    /// peer applies through the ordinary `apply_incoming_block` path.
    fn serve_block_read(&self, sector: u64, block_id: u64, blksize: u32, is_upper_layer: bool) -> Result<()> {
        let mut buf = vec![0u8; blksize as usize];
        self.device.backing.read_at(sector, &mut buf)?;
        let header = DataHeader { sector, block_id };
        let mut payload = header.encode().to_vec();
        payload.extend_from_slice(&buf);
        let command = if is_upper_layer { Command::DataReply } else { Command::Data };
        let mut stream = self.data_write.lock().unwrap();
        wire::write_frame(&mut *stream, command, &payload)
    }

    fn handle_csum(&self, csum: crate::wire::ChecksumBlock) -> Result<()> {
        let device = &self.device;
        let matches = device.local_checksum_matches(csum.sector, csum.blksize, csum.csum)?;
        if matches {
            device.confirm_in_sync(csum.sector, csum.blksize as u64)?;
            self.ack_tx
                .send(AckJob::BlockInSync { sector: csum.sector, block_id: csum.block_id, blksize: csum.blksize })
                .map_err(|_| DrbdError::BrokenPipe)
        } else {
            let req = crate::wire::BlockRequest { sector: csum.sector, block_id: csum.block_id, blksize: csum.blksize };
            let mut stream = self.data_write.lock().unwrap();
            wire::write_frame(&mut *stream, Command::RSDataRequest, &req.encode())
        }
    }
}
