// src/bin/daemon.rs
//
// Process entry point: loads a device's config, opens its backing store,
// connects the data and meta sockets to the configured peer, runs the
// handshake, and spawns the three worker threads that carry traffic for the
// rest of the process's life. Mirrors the teacher's `main.rs` shape (config
// first, logger second, ctrlc-raised `BarrierFlag`, thread spawn-and-join)
// adapted from a packet-ingestion pipeline to a two-socket replication link.

use crossbeam_channel::unbounded;
use drbd_core::ack_sender::AckSender;
use drbd_core::backing_store::FileBackingStore;
use drbd_core::config::DeviceConfig;
use drbd_core::device::Device;
use drbd_core::disk_sender::DiskSender;
use drbd_core::handshake;
use drbd_core::net;
use drbd_core::receiver::Receiver;
use drbd_core::request_pipeline::RequestPipeline;
use drbd_core::util::BarrierFlag;
use drbd_core::worker::WorkerSignal;
use log::info;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Read timeout workers poll against between frames. Bounds how long a
/// shutdown request can take to notice when the peer is quiet; unrelated to
/// the protocol's own ack timeout.
const WORKER_POLL_TIMEOUT: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("drbd.toml"));
    let cfg = DeviceConfig::from_file(&cfg_path)?;

    if cfg.general.json_logs {
        let mut b = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        b.format(|buf, record| {
            use std::io::Write;
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            writeln!(
                buf,
                "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":\"{}\"}}",
                ts,
                record.level(),
                record.target(),
                record.args().to_string().replace('"', "'")
            )
        })
        .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("loaded config: {:?}", cfg);

    let shutdown = Arc::new(BarrierFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || s.raise())?;
    }

    let metrics_handle = cfg.metrics.as_ref().map(|m| drbd_core::metrics::spawn_http(m.bind.clone()));

    let backing = Box::new(FileBackingStore::open(&cfg.general.backing_device, cfg.general.size_sectors)?);
    let device = Arc::new(Device::new(cfg, backing));

    let mut data_read = net::connect(device.config.net.peer_data_addr, WORKER_POLL_TIMEOUT)?;
    let data_write = Arc::new(Mutex::new(data_read.try_clone()?));
    let meta_read = net::connect(device.config.net.peer_meta_addr, WORKER_POLL_TIMEOUT)?;
    let meta_write = Arc::new(Mutex::new(meta_read.try_clone()?));

    info!("handshaking with peer...");
    handshake::negotiate(&device, &mut data_read, &data_write)?;
    info!("handshake complete, connection state: {:?}", device.conn.get());

    let (send_tx, send_rx) = unbounded();
    let (ack_tx, ack_rx) = unbounded();
    let pipeline = Arc::new(RequestPipeline::new(device.clone(), send_tx));
    let signal = Arc::new(WorkerSignal::new());

    let mut receiver = Receiver::new(device.clone(), pipeline.clone(), data_read, data_write.clone(), ack_tx, signal.clone());
    let mut disk_sender = DiskSender::new(device.clone(), data_write, meta_write.clone(), send_rx, ack_rx, signal.clone());
    let mut ack_sender = AckSender::new(device.clone(), pipeline.clone(), meta_read, meta_write, signal.clone());

    let receiver_handle = std::thread::Builder::new().name("receiver".into()).spawn(move || receiver.run())?;
    let disk_sender_handle = std::thread::Builder::new().name("disk-sender".into()).spawn(move || disk_sender.run())?;
    let ack_sender_handle = std::thread::Builder::new().name("ack-sender".into()).spawn(move || ack_sender.run())?;

    while !shutdown.is_raised() {
        std::thread::sleep(Duration::from_millis(200));
        device.publish_metrics();
        if device.conn.get().is_failure() {
            info!("connection entered a failure state, shutting down");
            break;
        }
    }

    signal.request_exit();
    let _ = receiver_handle.join();
    let _ = disk_sender_handle.join();
    let _ = ack_sender_handle.join();
    if let Some(h) = metrics_handle {
        drop(h); // metrics http thread is detached; the process exit tears it down
    }
    Ok(())
}
