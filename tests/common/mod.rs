//! Shared fixture: an in-process server on a throwaway socket path.
#![allow(dead_code)] // not every suite touches every helper

use arbor::config::ServerConfig;
use arbor::server::Runner;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestServer {
    pub runner: Arc<Runner>,
    pub socket: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    /// The bound RPC address, when RPC was enabled.
    pub fn rpc_endpoint(&self) -> String {
        let addr = self.runner.rpc_addr().expect("rpc is enabled");
        format!("127.0.0.1:{}", addr.port())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.runner.stop();
    }
}

/// Start a server with a 64 MiB ceiling and no RPC; `configure` tweaks
/// the rest.
pub fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("arbor.sock");
    let mut config = ServerConfig {
        socket: socket.clone(),
        rpc: false,
        shared_memory_size: 64 << 20,
        ..ServerConfig::default()
    };
    configure(&mut config);
    let runner = Runner::new(config).unwrap();
    runner.serve().unwrap();
    TestServer {
        runner,
        socket,
        _dir: dir,
    }
}
