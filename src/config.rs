use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ChannelError, ChannelResult};

/// Default byte count at which in-memory buffering switches to the spill file.
///
/// Below this amount everything stays in memory; the common case of a
/// consumer that keeps up with the producer never touches disk.
pub const DEFAULT_SPILL_THRESHOLD_BYTES: u32 = 128 * 1024; // 128 KiB

/// Default size of the fixed chunks leased from the buffer pool for
/// reading spilled data back from disk.
pub const DEFAULT_POOL_CHUNK_BYTES: usize = 16 * 1024; // 16 KiB

/// Default number of chunks the pool keeps around for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default number of worker threads executing file I/O jobs.
pub const DEFAULT_IO_WORKER_THREADS: usize = 2;

/// Per-channel configuration, captured at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Directory in which spill files are created. Files are unlinked
    /// immediately after creation, so nothing accumulates here.
    pub buffer_dir: PathBuf,
    /// Byte count of buffered data that triggers the switch to in-file mode.
    /// The switch happens when `bytes_buffered >= threshold`.
    pub threshold: u32,
    /// Milliseconds to wait before creating the spill file. Test hook for
    /// observing the window in which the reader serves still-queued buffers
    /// ahead of the writer.
    pub delay_in_file_mode_switching: u64,
    /// Return to in-memory mode (discarding the spill file) once the reader
    /// has caught up with everything written to disk.
    pub auto_truncate_file: bool,
    /// Kick the writer on every `feed` while in in-file mode, instead of
    /// only after each completed move.
    pub auto_start_mover: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_dir: std::env::temp_dir(),
            threshold: DEFAULT_SPILL_THRESHOLD_BYTES,
            delay_in_file_mode_switching: 0,
            auto_truncate_file: true,
            auto_start_mover: true,
        }
    }
}

impl ChannelConfig {
    /// Validate the configuration before a channel is built from it.
    pub fn validate(&self) -> ChannelResult<()> {
        if self.buffer_dir.as_os_str().is_empty() {
            return Err(ChannelError::invalid_config("buffer_dir must not be empty"));
        }
        Ok(())
    }
}

/// Runtime-wide configuration: the event loop, I/O worker pool, and the
/// shared read-buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of threads executing file I/O jobs.
    pub io_worker_threads: usize,
    /// Size of each pooled read chunk. Reads from the spill file are capped
    /// at this size per request.
    pub pool_chunk_bytes: usize,
    /// Number of chunks kept on the pool's free list for reuse.
    pub pool_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            io_worker_threads: DEFAULT_IO_WORKER_THREADS,
            pool_chunk_bytes: DEFAULT_POOL_CHUNK_BYTES,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Validate the configuration before the runtime is started.
    pub fn validate(&self) -> ChannelResult<()> {
        if self.io_worker_threads == 0 {
            return Err(ChannelError::invalid_config(
                "io_worker_threads must be at least 1",
            ));
        }
        if self.pool_chunk_bytes == 0 {
            return Err(ChannelError::invalid_config(
                "pool_chunk_bytes must be positive",
            ));
        }
        Ok(())
    }
}
