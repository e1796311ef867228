//! The coordinator event loop.
//!
//! All channel state transitions happen on one designated thread. I/O
//! completions fire on worker threads and are marshalled here before they
//! touch a channel; contexts holding leased buffers are dropped here so
//! buffer recycling stays single-threaded.

use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;

/// A closure posted onto the loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum LoopCommand {
    Run(Task),
    Shutdown,
}

/// Cloneable handle for posting work onto the event loop from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<LoopCommand>,
    loop_thread: Arc<OnceLock<ThreadId>>,
}

impl LoopHandle {
    /// Queue a task for execution on the loop thread.
    ///
    /// Tasks posted after shutdown are dropped.
    pub fn post(&self, task: Task) {
        let _ = self.tx.send(LoopCommand::Run(task));
    }

    /// Run the task inline when already on the loop thread, otherwise post.
    pub fn dispatch(&self, task: Task) {
        if self.on_loop_thread() {
            task();
        } else {
            self.post(task);
        }
    }

    /// True when the calling thread is the loop thread.
    pub fn on_loop_thread(&self) -> bool {
        self.loop_thread
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(LoopCommand::Shutdown);
    }
}

/// Spawn the event loop thread. Returns the posting handle and the join
/// handle for shutdown.
pub(crate) fn spawn_event_loop() -> std::io::Result<(LoopHandle, JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let loop_thread = Arc::new(OnceLock::new());
    let slot = loop_thread.clone();
    let join = thread::Builder::new()
        .name("spill-loop".to_string())
        .spawn(move || {
            let _ = slot.set(thread::current().id());
            run_loop(rx);
        })?;
    Ok((LoopHandle { tx, loop_thread }, join))
}

fn run_loop(rx: Receiver<LoopCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            LoopCommand::Run(task) => task(),
            LoopCommand::Shutdown => {
                // Drain remaining tasks here so their captures (leased
                // buffers, file handles) are dropped on the loop thread.
                let mut dropped = 0usize;
                while let Ok(cmd) = rx.try_recv() {
                    if matches!(cmd, LoopCommand::Run(_)) {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    debug!(dropped, "event loop discarded tasks at shutdown");
                }
                break;
            }
        }
    }
}
