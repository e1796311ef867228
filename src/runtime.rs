//! Shared runtime: the coordinator event loop, the I/O worker pool, and the
//! read-buffer pool. Channels are built from a [`RuntimeHandle`] and any
//! number of channels may share one runtime.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::RuntimeConfig;
use crate::error::ChannelResult;
use crate::executor::{spawn_event_loop, LoopHandle};
use crate::io::{IoPool, IoPoolHandle};
use crate::pool::BufferPool;

/// Owns the background threads. Dropping the runtime stops the I/O workers
/// first (so no further completions are produced) and then the event loop,
/// which drains and discards whatever was still queued.
pub struct Runtime {
    event_loop: LoopHandle,
    loop_join: Option<JoinHandle<()>>,
    io: IoPool,
    pool: Arc<BufferPool>,
}

/// Cloneable handle from which channels are constructed.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub(crate) event_loop: LoopHandle,
    pub(crate) io: IoPoolHandle,
    pub(crate) pool: Arc<BufferPool>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> ChannelResult<Self> {
        config.validate()?;
        let (event_loop, loop_join) = spawn_event_loop()?;
        let io = IoPool::new(config.io_worker_threads)?;
        let pool = Arc::new(BufferPool::new(
            config.pool_chunk_bytes,
            config.pool_capacity,
        ));
        Ok(Self {
            event_loop,
            loop_join: Some(loop_join),
            io,
            pool,
        })
    }

    pub fn with_defaults() -> ChannelResult<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            event_loop: self.event_loop.clone(),
            io: self.io.handle(),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.io.shutdown();
        self.event_loop.shutdown();
        if let Some(join) = self.loop_join.take() {
            let _ = join.join();
        }
    }
}

impl RuntimeHandle {
    /// The shared read-buffer pool.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The event loop handle, for posting work alongside channel callbacks.
    pub fn event_loop(&self) -> &LoopHandle {
        &self.event_loop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn runtime_starts_and_stops() {
        let runtime = Runtime::with_defaults().expect("runtime");
        let handle = runtime.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle
            .event_loop()
            .post(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(crate::test_support::eventually(
            std::time::Duration::from_secs(5),
            || ran.load(Ordering::SeqCst)
        ));
        drop(runtime);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = RuntimeConfig {
            io_worker_threads: 0,
            ..RuntimeConfig::default()
        };
        assert!(Runtime::new(cfg).is_err());
    }
}
