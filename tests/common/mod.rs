//! Shared utilities for shutdown integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deferred_server::config::ServerConfig;
use deferred_server::lifecycle::RuntimeMode;
use tracing::subscriber::DefaultGuard;

/// Log lines written by the code under test.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }

    /// Byte offset of the first occurrence of `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.contents().find(needle)
    }

    fn writer(&self) -> CaptureWriter {
        CaptureWriter { buf: self.buf.clone() }
    }
}

struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture logs on the current thread. Use with the current-thread runtime
/// so spawned tasks log through the same subscriber.
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.writer())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}

/// Poll until the captured logs contain `needle`.
pub async fn wait_for_log(logs: &LogCapture, needle: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !logs.contains(needle) {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for log line {needle:?}; got:\n{}", logs.contents());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Config for a server on `addr` with short test timings.
pub fn test_config(addr: SocketAddr, mode: RuntimeMode, drain_timeout_ms: u64) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.runtime.mode = mode;
    config.listener.bind_address = addr.to_string();
    config.shutdown.drain_timeout_ms = drain_timeout_ms;
    config.timeouts.request_secs = 5;
    config
}

/// HTTP client that never reuses connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}
