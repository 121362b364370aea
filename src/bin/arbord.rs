//! The arbor daemon.

use arbor::config::{Deployment, MetaBackend, ServerConfig, parse_size};
use arbor::error::Result;
use arbor::memory::AllocatorKind;
use arbor::server::metrics::init_metrics;
use arbor::server::Runner;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arbord", about = "In-memory immutable object store daemon")]
struct Args {
    /// Deployment mode: local or distributed.
    #[arg(long, default_value = "local")]
    deployment: Deployment,

    /// Metadata backend: local, etcd or redis.
    #[arg(long, default_value = "local")]
    meta: MetaBackend,

    /// Endpoint of the external metadata backend.
    #[arg(long, default_value = "")]
    meta_endpoint: String,

    /// Key prefix inside the metadata backend.
    #[arg(long, default_value = "arbor")]
    meta_prefix: String,

    /// Shared memory ceiling, e.g. `256Mi`, `8G`.
    #[arg(long, default_value = "256Mi")]
    size: String,

    /// Allocator variant: dlmalloc or mimalloc.
    #[arg(long, default_value = "dlmalloc")]
    allocator: String,

    /// Percent of memory streams may hold in unconsumed chunks.
    #[arg(long, default_value_t = 80)]
    stream_threshold: u8,

    /// Spill directory; empty disables spilling.
    #[arg(long, default_value = "")]
    spill_path: String,

    /// Low spill watermark as a fraction of the ceiling.
    #[arg(long, default_value_t = 0.3)]
    spill_lower_rate: f64,

    /// High spill watermark as a fraction of the ceiling.
    #[arg(long, default_value_t = 0.8)]
    spill_upper_rate: f64,

    /// IPC socket path of the root session.
    #[arg(long, default_value = arbor::config::DEFAULT_IPC_SOCKET)]
    socket: PathBuf,

    /// Serve the TCP (RPC) endpoint.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    rpc: bool,

    /// Port of the TCP endpoint.
    #[arg(long, default_value_t = arbor::config::DEFAULT_RPC_PORT)]
    rpc_socket_port: u16,

    /// Mirror cluster resources into CRDs.
    #[arg(long, default_value_t = false)]
    sync_crds: bool,

    /// Enable the metrics reporter.
    #[arg(long, default_value_t = false)]
    metrics: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            deployment: self.deployment,
            meta: self.meta,
            meta_endpoint: self.meta_endpoint,
            meta_prefix: self.meta_prefix,
            shared_memory_size: parse_size(&self.size)?,
            allocator: self.allocator.parse::<AllocatorKind>()?,
            stream_threshold: self.stream_threshold,
            spill_path: if self.spill_path.is_empty() {
                None
            } else {
                Some(PathBuf::from(self.spill_path))
            },
            spill_lower_rate: self.spill_lower_rate,
            spill_upper_rate: self.spill_upper_rate,
            socket: self.socket,
            rpc: self.rpc,
            rpc_socket_port: self.rpc_socket_port,
            sync_crds: self.sync_crds,
            metrics: self.metrics,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.into_config()?;
    config.validate()?;
    if config.metrics {
        init_metrics();
    }

    let runner = Runner::new(config)?;
    runner.serve()?;
    info!(version = arbor::protocol::server_version(), "arbord is ready");

    // serve until interrupted
    loop {
        std::thread::park();
        if !runner.running() {
            break;
        }
    }
    Ok(())
}
