// src/metrics.rs
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::net::ToSocketAddrs;
use std::thread;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static PENDING_CNT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("pending_cnt", "Requests awaiting a peer acknowledgement").expect("pending_cnt");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static UNACKED_CNT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("unacked_cnt", "Peer-originated writes owed an ack").expect("unacked_cnt");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static RS_LEFT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("rs_left", "Sectors remaining in the current resync run").expect("rs_left");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static RS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("rs_total", "Total sectors in the current resync run").expect("rs_total");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static AL_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("al_evictions_total", "Activity-log extent evictions").expect("al_evictions_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static BITMAP_DIRTY_SECTORS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("bitmap_dirty_sectors", "Sectors currently marked out-of-sync").expect("bitmap_dirty_sectors");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static BARRIERS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("barriers_total", "Barrier frames emitted").expect("barriers_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static POOL_EXHAUSTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("entry_pool_exhausted_total", "Times the epoch-entry pool was found empty")
        .expect("entry_pool_exhausted_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static CONN_STATE: Lazy<prometheus::IntGaugeVec> = Lazy::new(|| {
    let g = prometheus::IntGaugeVec::new(Opts::new("connection_state", "1 for the currently active connection state"), &["state"])
        .expect("connection_state");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn set_pending_cnt(n: i64) {
    PENDING_CNT.set(n);
}
pub fn set_unacked_cnt(n: i64) {
    UNACKED_CNT.set(n);
}
pub fn set_rs_progress(left: u64, total: u64) {
    RS_LEFT.set(left as i64);
    RS_TOTAL.set(total as i64);
}
pub fn inc_al_eviction() {
    AL_EVICTIONS.inc();
}
pub fn set_bitmap_dirty_sectors(n: u64) {
    BITMAP_DIRTY_SECTORS.set(n as i64);
}
pub fn inc_barrier() {
    BARRIERS_TOTAL.inc();
}
pub fn inc_pool_exhausted() {
    POOL_EXHAUSTED_TOTAL.inc();
}
pub fn set_connection_state(state_name: &str) {
    for label in crate::connection::METRIC_LABELS {
        CONN_STATE.with_label_values(&[label]).set(if label == state_name { 1 } else { 0 });
    }
}

pub fn spawn_http<A: ToSocketAddrs + Send + 'static>(addr: A) -> thread::JoinHandle<()> {
    let addr_string = addr
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "0.0.0.0:9100".to_string());

    thread::spawn(move || {
        let server = tiny_http::Server::http(&addr_string).expect("start metrics http");
        log::info!("prometheus metrics listening on http://{addr_string}/metrics");
        let encoder = TextEncoder::new();
        loop {
            if let Ok(req) = server.recv() {
                let url = req.url().to_string();
                if url == "/metrics" {
                    let metric_families = REGISTRY.gather();
                    let mut buf = Vec::with_capacity(8 * 1024);
                    encoder.encode(&metric_families, &mut buf).ok();
                    let resp = tiny_http::Response::from_data(buf).with_status_code(200).with_header(
                        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..]).unwrap(),
                    );
                    let _ = req.respond(resp);
                } else if url == "/live" || url == "/healthz" {
                    let _ = req.respond(tiny_http::Response::from_string("OK").with_status_code(200));
                } else {
                    let _ = req.respond(tiny_http::Response::empty(404));
                }
            }
        }
    })
}
