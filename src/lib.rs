// src/lib.rs
//
// Library crate for the replication core: the bitmap/activity-log/entry-pool
// state a `Device` owns, the wire protocol, and the three worker loops
// (Receiver, DiskSender, AckSender) that drive it over a pair of TCP sockets.
// `src/bin/daemon.rs` is the thin process that wires these together; this
// crate has no CLI or RPC surface of its own (see `Device`'s control-surface
// methods in `device.rs`).

pub mod ack_sender;
pub mod activity_log;
pub mod backing_store;
pub mod bitmap;
pub mod busy_block;
pub mod config;
pub mod connection;
pub mod device;
pub mod disk_sender;
pub mod entry_pool;
pub mod error;
pub mod handshake;
pub mod metadata;
pub mod metrics;
pub mod net;
pub mod receiver;
pub mod request_pipeline;
pub mod resync;
pub mod transfer_log;
pub mod util;
pub mod wire;
pub mod worker;
