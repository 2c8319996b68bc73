// src/net.rs
use anyhow::Context;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Connects the data or meta socket to `addr`, disabling Nagle (replicated
/// writes are latency-sensitive, not throughput-bound) and installing a
/// bounded read timeout so a worker polling `BarrierFlag` between reads
/// notices a shutdown request promptly instead of blocking forever.
pub fn connect(addr: SocketAddr, read_timeout: Duration) -> anyhow::Result<TcpStream> {
    let stream = TcpStream::connect(addr).context("connect")?;
    stream.set_nodelay(true).context("set_nodelay")?;
    stream.set_read_timeout(Some(read_timeout)).context("set_read_timeout")?;
    Ok(stream)
}
