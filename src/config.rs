//! Server configuration.
//!
//! Mirrors the daemon's command-line surface. Sizes accept human-readable
//! suffixes in both decimal (`k`, `M`, `G`, ...) and binary (`Ki`, `Mi`,
//! `Gi`, ...) flavours.

use crate::error::{Error, Result};
use crate::memory::AllocatorKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default IPC socket path.
pub const DEFAULT_IPC_SOCKET: &str = "/var/run/arbor.sock";

/// Default RPC port.
pub const DEFAULT_RPC_PORT: u16 = 9600;

/// Default shared memory ceiling (256 MiB).
pub const DEFAULT_SHARED_MEMORY_SIZE: usize = 256 << 20;

/// How the instance participates in a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    #[default]
    Local,
    Distributed,
}

impl std::str::FromStr for Deployment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Deployment> {
        match s {
            "local" => Ok(Deployment::Local),
            "distributed" => Ok(Deployment::Distributed),
            other => Err(Error::Invalid(format!("unknown deployment: {other}"))),
        }
    }
}

/// Which backend coordinates the metadata plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaBackend {
    #[default]
    Local,
    Etcd,
    Redis,
}

impl std::str::FromStr for MetaBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<MetaBackend> {
        match s {
            "local" => Ok(MetaBackend::Local),
            "etcd" => Ok(MetaBackend::Etcd),
            "redis" => Ok(MetaBackend::Redis),
            other => Err(Error::Invalid(format!("unknown meta backend: {other}"))),
        }
    }
}

/// Everything the server observes from flags and the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub deployment: Deployment,
    pub meta: MetaBackend,
    /// Endpoint of the external meta backend, when one is configured.
    pub meta_endpoint: String,
    /// Key prefix inside the meta backend.
    pub meta_prefix: String,
    /// Shared memory ceiling in bytes.
    pub shared_memory_size: usize,
    pub allocator: AllocatorKind,
    /// Percent of total memory reserved for streams.
    pub stream_threshold: u8,
    /// Spill directory; `None` disables spilling.
    pub spill_path: Option<PathBuf>,
    /// Low watermark as a fraction of the ceiling.
    pub spill_lower_rate: f64,
    /// High watermark as a fraction of the ceiling.
    pub spill_upper_rate: f64,
    /// IPC socket path of the root session.
    pub socket: PathBuf,
    /// Whether the root session hosts the RPC endpoint.
    pub rpc: bool,
    pub rpc_socket_port: u16,
    /// Whether cluster resources are mirrored into CRDs.
    pub sync_crds: bool,
    /// Whether the metrics reporter is enabled.
    pub metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            deployment: Deployment::Local,
            meta: MetaBackend::Local,
            meta_endpoint: String::new(),
            meta_prefix: "arbor".into(),
            shared_memory_size: DEFAULT_SHARED_MEMORY_SIZE,
            allocator: AllocatorKind::Dlmalloc,
            stream_threshold: 80,
            spill_path: None,
            spill_lower_rate: 0.3,
            spill_upper_rate: 0.8,
            socket: PathBuf::from(DEFAULT_IPC_SOCKET),
            rpc: true,
            rpc_socket_port: DEFAULT_RPC_PORT,
            sync_crds: std::env::var("ARBOR_SYNC_CRDS")
                .map(|v| v == "1" || v == "true")
                .unwrap_or(false),
            metrics: false,
        }
    }
}

impl ServerConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.shared_memory_size == 0 {
            return Err(Error::Invalid("shared memory size must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.spill_lower_rate)
            || !(0.0..=1.0).contains(&self.spill_upper_rate)
        {
            return Err(Error::Invalid("spill rates must be within [0, 1]".into()));
        }
        if self.spill_lower_rate >= self.spill_upper_rate {
            return Err(Error::Invalid(
                "the lower spill rate must be below the upper rate".into(),
            ));
        }
        if self.stream_threshold > 100 {
            return Err(Error::Invalid("stream threshold is a percentage".into()));
        }
        Ok(())
    }
}

/// Parse a human-readable byte size.
///
/// Plain numbers are bytes. A decimal suffix (`k`, `K`, `m`, `M`, `g`,
/// `G`, `t`, `T`, `p`, `P`, `e`, `E`) multiplies by powers of 1000; the
/// two-letter binary forms (`Ki`, `Mi`, ...) multiply by powers of 1024.
pub fn parse_size(input: &str) -> Result<usize> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Invalid("empty size".into()));
    }

    let (digits, suffix) = match input.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(at) => input.split_at(at),
        None => (input, ""),
    };
    let value: f64 = digits
        .parse()
        .map_err(|_| Error::Invalid(format!("malformed size: {input}")))?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1000,
        "m" | "M" => 1000_u64.pow(2),
        "g" | "G" => 1000_u64.pow(3),
        "t" | "T" => 1000_u64.pow(4),
        "p" | "P" => 1000_u64.pow(5),
        "e" | "E" => 1000_u64.pow(6),
        "Ki" | "ki" => 1 << 10,
        "Mi" | "mi" => 1 << 20,
        "Gi" | "gi" => 1 << 30,
        "Ti" | "ti" => 1 << 40,
        "Pi" | "pi" => 1 << 50,
        "Ei" | "ei" => 1 << 60,
        other => {
            return Err(Error::Invalid(format!("unknown size suffix: {other}")));
        }
    };

    Ok((value * multiplier as f64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_plain_bytes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_size_decimal_suffixes() {
        assert_eq!(parse_size("2k").unwrap(), 2000);
        assert_eq!(parse_size("2K").unwrap(), 2000);
        assert_eq!(parse_size("3M").unwrap(), 3_000_000);
        assert_eq!(parse_size("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1T").unwrap(), 1_000_000_000_000);
    }

    #[test]
    fn test_parse_size_binary_suffixes() {
        assert_eq!(parse_size("2Ki").unwrap(), 2048);
        assert_eq!(parse_size("64Mi").unwrap(), 64 << 20);
        assert_eq!(parse_size("1Gi").unwrap(), 1 << 30);
    }

    #[test]
    fn test_parse_size_fractional() {
        assert_eq!(parse_size("1.5Ki").unwrap(), 1536);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("grams").is_err());
    }

    #[test]
    fn test_default_config_validates() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_spill_rates_must_be_ordered() {
        let config = ServerConfig {
            spill_lower_rate: 0.9,
            spill_upper_rate: 0.5,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
