// src/ack_sender.rs
//
// Owns the meta socket's read side and, alongside the DiskSender, its
// write side (guarded by the same `Arc<Mutex<TcpStream>>`). Carries the
// traffic kept off the data socket so it can never be head-of-line-blocked
// behind a bulk transfer: ack-class packets (`RecvAck`/`WriteAck`/
// `BarrierAck`/`BlockInSync`) and the keepalive `Ping`/`PingAck` pair. Also
// the sole place that notices a silent peer and raises `ConnState::Timeout`,
// the same "last activity" bookkeeping the teacher's heartbeat loop uses
// for a stalled feed.

use crate::connection::ConnState;
use crate::device::Device;
use crate::error::{DrbdError, Result};
use crate::request_pipeline::RequestPipeline;
use crate::wire::{self, Command, Packet};
use crate::worker::WorkerSignal;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct AckSender {
    device: Arc<Device>,
    pipeline: Arc<RequestPipeline>,
    meta_read: TcpStream,
    meta_write: Arc<Mutex<TcpStream>>,
    signal: Arc<WorkerSignal>,
    ping_interval: Duration,
    ack_timeout: Duration,
}

impl AckSender {
    pub fn new(
        device: Arc<Device>,
        pipeline: Arc<RequestPipeline>,
        meta_read: TcpStream,
        meta_write: Arc<Mutex<TcpStream>>,
        signal: Arc<WorkerSignal>,
    ) -> Self {
        let ping_interval = Duration::from_millis(device.config.net.ping_interval_ds as u64 * 100);
        let ack_timeout = Duration::from_millis(device.config.net.timeout_ds as u64 * 100);
        Self { device, pipeline, meta_read, meta_write, signal, ping_interval, ack_timeout }
    }

    pub fn run(&mut self) {
        let mut last_ping = Instant::now();
        let mut last_rx = Instant::now();

        loop {
            if self.signal.should_stop() {
                break;
            }

            match wire::read_frame(&mut self.meta_read) {
                Ok((command, payload)) => {
                    last_rx = Instant::now();
                    match Packet::decode(command, &payload) {
                        Ok(packet) => {
                            if let Err(e) = self.dispatch(packet) {
                                log::error!("ack_sender: {e}");
                                if e.is_integrity_fatal() {
                                    self.device.conn.set(ConnState::BrokenPipe);
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            log::error!("ack_sender: malformed frame: {e}");
                            self.device.conn.set(ConnState::BrokenPipe);
                            break;
                        }
                    }
                }
                Err(DrbdError::BackingIo(ref io_err))
                    if matches!(io_err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    log::warn!("ack_sender: meta connection lost: {e}");
                    self.device.conn.set(ConnState::BrokenPipe);
                    break;
                }
            }

            if last_ping.elapsed() >= self.ping_interval {
                if let Err(e) = self.send(Command::Ping, &[]) {
                    log::warn!("ack_sender: ping send failed: {e}");
                }
                last_ping = Instant::now();
            }

            if self.device.conn.get() != ConnState::Standalone && last_rx.elapsed() >= self.ack_timeout {
                log::warn!("ack_sender: peer silent for {:?}, declaring timeout", last_rx.elapsed());
                self.device.conn.set(ConnState::Timeout);
                break;
            }
        }
        self.device.disconnect();
    }

    fn dispatch(&self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Ping => self.send(Command::PingAck, &[]),
            Packet::PingAck => Ok(()),
            Packet::RecvAck(ack) | Packet::WriteAck(ack) => {
                self.pipeline.ack_received_by_id(ack.block_id);
                Ok(())
            }
            Packet::BarrierAck(ack) => match self.device.tl.release(ack.barrier, ack.set_size) {
                Ok(handles) => {
                    self.pipeline.barrier_resolved(handles);
                    Ok(())
                }
                Err(detail) => Err(DrbdError::protocol(detail)),
            },
            Packet::BlockInSync(_) => Ok(()),
            _ => Err(DrbdError::protocol("non-ack packet received on the meta socket")),
        }
    }

    fn send(&self, command: Command, payload: &[u8]) -> Result<()> {
        let mut stream = self.meta_write.lock().unwrap();
        wire::write_frame(&mut *stream, command, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::FileBackingStore;
    use crate::config::{DeviceConfig, General, NetCfg, Protocol, Syncer};
    use crate::wire::BlockAck;
    use crossbeam_channel::unbounded;
    use std::net::{TcpListener, TcpStream};
    use tempfile::tempdir;

    fn test_device(dir: &std::path::Path) -> Arc<Device> {
        let cfg = DeviceConfig {
            general: General { backing_device: dir.join("d.img"), meta_device: dir.join("d.meta"), size_sectors: 8192, json_logs: false, do_panic: false },
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
    fn ping_gets_a_ping_ack() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        let (send_tx, _send_rx) = unbounded();
        let pipeline = Arc::new(RequestPipeline::new(dev.clone(), send_tx));
        let (r1, _r2) = loopback_pair();
        let (w1, mut w2) = loopback_pair();
        w2.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();

        let sender = AckSender::new(dev, pipeline, r1, Arc::new(Mutex::new(w1)), Arc::new(WorkerSignal::new()));
        sender.dispatch(Packet::Ping).unwrap();

        let (cmd, _payload) = wire::read_frame(&mut w2).unwrap();
        assert_eq!(cmd, Command::PingAck);
    }

    #[test]
    fn write_ack_resolves_the_matching_request() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        let (send_tx, send_rx) = unbounded();
        let pipeline = Arc::new(RequestPipeline::new(dev.clone(), send_tx));
        let pipeline2 = pipeline.clone();

        let write_thread = std::thread::spawn(move || pipeline2.submit_write(0, &[0xCC; 4096]).unwrap());
        let job = send_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        let block_id = match job {
            crate::request_pipeline::SendJob::Data { block_id, .. } => block_id,
            _ => panic!("expected data job"),
        };

        let (r1, _r2) = loopback_pair();
        let (w1, _w2) = loopback_pair();
        let sender = AckSender::new(dev.clone(), pipeline.clone(), r1, Arc::new(Mutex::new(w1)), Arc::new(WorkerSignal::new()));
        sender.dispatch(Packet::WriteAck(BlockAck { sector: 0, block_id, blksize: 4096 })).unwrap();

        write_thread.join().unwrap();
        assert_eq!(dev.pending_cnt.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn data_frame_on_meta_socket_is_rejected() {
        let dir = tempdir().unwrap();
        let dev = test_device(dir.path());
        let (send_tx, _send_rx) = unbounded();
        let pipeline = Arc::new(RequestPipeline::new(dev.clone(), send_tx));
        let (r1, _r2) = loopback_pair();
        let (w1, _w2) = loopback_pair();
        let sender = AckSender::new(dev, pipeline, r1, Arc::new(Mutex::new(w1)), Arc::new(WorkerSignal::new()));

        let header = crate::wire::DataHeader { sector: 0, block_id: 1 };
        let err = sender.dispatch(Packet::Data { header, block: vec![0u8; 4096] }).unwrap_err();
        assert!(err.is_integrity_fatal());
    }
}
