use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Control-plane server configuration.
/// Keeps lifecycle and back-pressure knobs small and explicit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address for the framed TCP acceptor (`None` = in-process streams only).
    pub listen_addr: Option<String>,

    /// Max concurrent client streams (`None` = 64).
    pub max_streams: Option<usize>,

    /// Periodic subscription update interval in ms (`None` = 30 000).
    pub update_period_ms: Option<u64>,

    /// Max queued events handled per loop iteration (`None` = 128).
    pub max_events_drain: Option<usize>,

    /// Patience for backpressured stream writes in ms (`None` = 250).
    pub write_patience_ms: Option<u64>,

    /// Capacity of each stream's outbound queue (`None` = 256).
    pub stream_buffer: Option<usize>,

    /// Logical CPU core to pin the event loop to (`None` = no pinning).
    pub core_id: Option<usize>,

    /// Trip the server stop token on SIGTERM/SIGINT.
    #[serde(default)]
    pub install_signal_handler: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            max_streams: None,
            update_period_ms: None,
            max_events_drain: None,
            write_patience_ms: None,
            stream_buffer: None,
            core_id: None,
            install_signal_handler: false,
        }
    }
}

impl ServerConfig {
    pub fn max_streams(&self) -> usize {
        self.max_streams.unwrap_or(64)
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms.unwrap_or(30_000))
    }

    pub fn max_events_drain(&self) -> usize {
        self.max_events_drain.unwrap_or(128).max(1)
    }

    pub fn write_patience(&self) -> Duration {
        Duration::from_millis(self.write_patience_ms.unwrap_or(250))
    }

    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer.unwrap_or(256).max(1)
    }
}
