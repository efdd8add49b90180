use std::time::Duration;

use corehost_types::PairEncoding;
use serde::Deserialize;

/// The `[runtime]` table of the host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Delay between the first perform after a flush and the metrics flush.
    pub metrics_flush_ms: u64,
    pub pair_encoding: PairEncoding,
    /// Address of the asyncify unwind header in the core's memory.
    pub asyncify_data_addr: u32,
    /// End of the unwind buffer that follows the header.
    pub asyncify_data_end: u32,
    /// Larger requests from the core are refused without being decoded.
    pub max_message_bytes: usize,
    /// Upper bound on one `stream_read`, whatever buffer the core offers.
    pub max_read_bytes: usize,
}

impl RuntimeConfig {
    #[must_use]
    pub fn metrics_flush_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_flush_ms)
    }

    /// The `[current, end]` header written before a fresh export call.
    #[must_use]
    pub fn asyncify_header(&self) -> [u8; 8] {
        let mut header = [0; 8];
        header[..4].copy_from_slice(&(self.asyncify_data_addr + 8).to_le_bytes());
        header[4..].copy_from_slice(&self.asyncify_data_end.to_le_bytes());
        header
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            metrics_flush_ms: 1000,
            pair_encoding: PairEncoding::Wide,
            asyncify_data_addr: 16,
            asyncify_data_end: 1024,
            max_message_bytes: 4 * 1024 * 1024,
            max_read_bytes: 1024 * 1024,
        }
    }
}
