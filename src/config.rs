// src/config.rs
use serde::Deserialize;
use std::{fs, net::SocketAddr, path::PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub general: General,
    pub net: NetCfg,
    pub syncer: Syncer,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub backing_device: PathBuf,
    pub meta_device: PathBuf,
    pub size_sectors: u64,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub do_panic: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetCfg {
    pub peer_data_addr: SocketAddr,
    pub peer_meta_addr: SocketAddr,
    pub protocol: Protocol,
    /// Ack timeout in deciseconds, matching the original's `a_timeout` unit.
    pub timeout_ds: u32,
    #[serde(default = "default_ping_interval_ds")]
    pub ping_interval_ds: u32,
}

fn default_ping_interval_ds() -> u32 {
    100 // 10s
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    A,
    B,
    C,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Syncer {
    pub al_nr_extents: usize,
    pub rate_bytes_per_sec: u64,
    #[serde(default)]
    pub use_csums: bool,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub group: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metrics {
    pub bind: String,
}

impl DeviceConfig {
    pub fn from_file(p: &std::path::Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(p)?;
        let cfg: DeviceConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.size_sectors == 0 {
            anyhow::bail!("general.size_sectors must be > 0");
        }
        if self.net.timeout_ds == 0 {
            anyhow::bail!("net.timeout_ds must be > 0");
        }
        if self.net.ping_interval_ds == 0 {
            anyhow::bail!("net.ping_interval_ds must be > 0");
        }
        if self.syncer.al_nr_extents == 0 {
            anyhow::bail!("syncer.al_nr_extents must be > 0");
        }
        if let Some(ref m) = self.metrics {
            if m.bind.trim().is_empty() {
                anyhow::bail!("metrics.bind must be non-empty when metrics is configured");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_toml_fixture() {
        let toml = r#"
            [general]
            backing_device = "/var/lib/drbd/disk0.img"
            meta_device = "/var/lib/drbd/disk0.meta"
            size_sectors = 16777216

            [net]
            peer_data_addr = "10.0.0.2:7788"
            peer_meta_addr = "10.0.0.2:7789"
            protocol = "C"
            timeout_ds = 60

            [syncer]
            al_nr_extents = 257
            rate_bytes_per_sec = 10485760
        "#;
        let cfg: DeviceConfig = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.general.size_sectors, 16_777_216);
        assert_eq!(cfg.net.protocol, Protocol::C);
        assert_eq!(cfg.net.ping_interval_ds, 100);
        assert_eq!(cfg.syncer.al_nr_extents, 257);
    }

    #[test]
    fn rejects_zero_al_extents() {
        let toml = r#"
            [general]
            backing_device = "/d"
            meta_device = "/m"
            size_sectors = 1024

            [net]
            peer_data_addr = "127.0.0.1:1"
            peer_meta_addr = "127.0.0.1:2"
            protocol = "A"
            timeout_ds = 10

            [syncer]
            al_nr_extents = 0
            rate_bytes_per_sec = 1
        "#;
        let cfg: DeviceConfig = toml::from_str(toml).unwrap();
        assert!(cfg.validate().is_err());
    }
}
