//! Asynchronous file I/O substrate.
//!
//! A small pool of worker threads executes open / positioned write /
//! positioned read / unlink / delay jobs. Each job carries an [`IoRequest`]
//! whose cancel flag is flipped under the same mutex the worker takes before
//! running the job: a cancel that wins the race suppresses the system call
//! entirely, a cancel that loses it is observed by the completion. Workers
//! invoke the completion callback in place; callers marshal back to the
//! event loop themselves.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::test_support::{self, ReadOpContext, WriteOpContext};

/// Handle for one submitted I/O operation.
///
/// The `sync` mutex serialises submission against the worker picking the job
/// up, so a completion can never race the submitting thread's bookkeeping.
#[derive(Debug)]
pub struct IoRequest {
    cancelled: AtomicBool,
    sync: Mutex<()>,
}

impl IoRequest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            sync: Mutex::new(()),
        })
    }

    /// Mark the request cancelled. A job not yet started is skipped; a
    /// completion already in flight observes the flag and discards itself.
    pub fn cancel(&self) {
        let _guard = self.sync.lock();
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Shared owner of the spill file descriptor.
///
/// Every in-flight read or move holds a share, so the descriptor stays open
/// until the last completion has fired or been observed as cancelled; the
/// file closes when the final share drops.
#[derive(Debug)]
pub struct SpillFile {
    cell: Mutex<Option<File>>,
}

impl SpillFile {
    /// A cell with no descriptor yet (the file is still being created).
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            cell: Mutex::new(None),
        })
    }

    pub fn install(&self, file: File) {
        let mut cell = self.cell.lock();
        debug_assert!(cell.is_none(), "spill file installed twice");
        *cell = Some(file);
    }

    pub fn is_open(&self) -> bool {
        self.cell.lock().is_some()
    }

    pub fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        let cell = self.cell.lock();
        match cell.as_ref() {
            Some(file) => file.write_at(data, offset),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let cell = self.cell.lock();
        match cell.as_ref() {
            Some(file) => file.read_at(buf, offset),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}

/// One unit of work for the pool.
pub enum IoJob {
    /// Create-exclusive open, mode 0600.
    Open {
        path: PathBuf,
        done: Box<dyn FnOnce(io::Result<File>) + Send>,
    },
    /// Positioned write of `buf` at `offset`. May complete short.
    WriteAt {
        file: Arc<SpillFile>,
        buf: Bytes,
        offset: u64,
        done: Box<dyn FnOnce(io::Result<usize>) + Send>,
    },
    /// Positioned read into `buf` at `offset`. The buffer travels through
    /// the completion so ownership never splits.
    ReadAt {
        file: Arc<SpillFile>,
        buf: BytesMut,
        offset: u64,
        done: Box<dyn FnOnce(BytesMut, io::Result<usize>) + Send>,
    },
    /// Remove a directory entry.
    Unlink {
        path: PathBuf,
        done: Box<dyn FnOnce(io::Result<()>) + Send>,
    },
    /// Sleep for `ms` milliseconds, then complete.
    Delay {
        ms: u64,
        done: Box<dyn FnOnce() + Send>,
    },
}

enum IoCommand {
    Run {
        request: Arc<IoRequest>,
        job: IoJob,
    },
    Shutdown,
}

/// Worker pool executing [`IoJob`]s.
pub struct IoPool {
    tx: Sender<IoCommand>,
    workers: Vec<JoinHandle<()>>,
}

/// Cloneable submission handle.
#[derive(Clone)]
pub struct IoPoolHandle {
    tx: Sender<IoCommand>,
}

impl IoPool {
    pub fn new(workers: usize) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let rx: Receiver<IoCommand> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("spill-io-{index}"))
                .spawn(move || worker_loop(rx))?;
            handles.push(handle);
        }
        Ok(Self {
            tx,
            workers: handles,
        })
    }

    pub fn handle(&self) -> IoPoolHandle {
        IoPoolHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop the workers and join them. Idempotent.
    pub fn shutdown(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.tx.send(IoCommand::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl IoPoolHandle {
    /// Submit a job under the request's sync lock.
    ///
    /// Jobs submitted after shutdown are dropped; their completions never
    /// fire, which only happens during runtime teardown.
    pub fn submit(&self, request: Arc<IoRequest>, job: IoJob) {
        let guard = request.sync.lock();
        let _ = self.tx.send(IoCommand::Run {
            request: request.clone(),
            job,
        });
        drop(guard);
    }
}

fn worker_loop(rx: Receiver<IoCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            IoCommand::Run { request, job } => run_job(&request, job),
            IoCommand::Shutdown => break,
        }
    }
}

fn cancelled_error() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

fn run_job(request: &IoRequest, job: IoJob) {
    // Wait for the submitting thread to finish its bookkeeping, and settle
    // the race against cancel().
    drop(request.sync.lock());
    let cancelled = request.is_cancelled();
    match job {
        IoJob::Open { path, done } => {
            if cancelled {
                done(Err(cancelled_error()));
                return;
            }
            if let Some(err) = test_support::open_override(&path) {
                done(Err(err));
                return;
            }
            let result = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path);
            done(result);
        }
        IoJob::WriteAt {
            file,
            buf,
            offset,
            done,
        } => {
            if cancelled {
                done(Err(cancelled_error()));
                return;
            }
            let ctx = WriteOpContext {
                file: &file,
                data: &buf,
                offset,
            };
            let result = match test_support::write_override(&ctx) {
                Some(result) => result,
                None => file.write_at(&buf, offset),
            };
            done(result);
        }
        IoJob::ReadAt {
            file,
            mut buf,
            offset,
            done,
        } => {
            if cancelled {
                done(buf, Err(cancelled_error()));
                return;
            }
            let ctx = ReadOpContext {
                file: &file,
                len: buf.len(),
                offset,
            };
            let result = match test_support::read_override(&ctx) {
                Some(result) => result,
                None => file.read_at(&mut buf, offset),
            };
            done(buf, result);
        }
        IoJob::Unlink { path, done } => {
            if cancelled {
                done(Err(cancelled_error()));
                return;
            }
            done(std::fs::remove_file(&path));
        }
        IoJob::Delay { ms, done } => {
            if !cancelled {
                thread::sleep(Duration::from_millis(ms));
            }
            done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool() -> IoPool {
        IoPool::new(1).expect("io pool")
    }

    #[test]
    fn open_creates_exclusive_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("buffer.test");
        let pool = pool();
        let (tx, rx) = mpsc::channel();
        pool.handle().submit(
            IoRequest::new(),
            IoJob::Open {
                path: path.clone(),
                done: Box::new(move |result| tx.send(result.map(|_| ())).expect("send")),
            },
        );
        rx.recv_timeout(Duration::from_secs(5))
            .expect("completion")
            .expect("open");
        assert!(path.exists());

        // A second create-exclusive open must fail with EEXIST.
        let (tx, rx) = mpsc::channel();
        pool.handle().submit(
            IoRequest::new(),
            IoJob::Open {
                path,
                done: Box::new(move |result| tx.send(result.map(|_| ())).expect("send")),
            },
        );
        let err = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("completion")
            .expect_err("duplicate open");
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("buffer.rw");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .expect("create");
        let spill = SpillFile::closed();
        spill.install(file);

        let pool = pool();
        let (tx, rx) = mpsc::channel();
        pool.handle().submit(
            IoRequest::new(),
            IoJob::WriteAt {
                file: spill.clone(),
                buf: Bytes::from_static(b"spilled"),
                offset: 3,
                done: Box::new(move |result| tx.send(result).expect("send")),
            },
        );
        let written = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("completion")
            .expect("write");
        assert_eq!(written, 7);

        let (tx, rx) = mpsc::channel();
        let mut buf = BytesMut::with_capacity(16);
        buf.resize(7, 0);
        pool.handle().submit(
            IoRequest::new(),
            IoJob::ReadAt {
                file: spill,
                buf,
                offset: 3,
                done: Box::new(move |buf, result| tx.send((buf, result)).expect("send")),
            },
        );
        let (buf, result) = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(result.expect("read"), 7);
        assert_eq!(&buf[..], b"spilled");
    }

    #[test]
    fn cancel_before_run_skips_the_syscall() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("buffer.cancelled");
        let pool = pool();
        let request = IoRequest::new();
        request.cancel();
        let (tx, rx) = mpsc::channel();
        pool.handle().submit(
            request,
            IoJob::Open {
                path: path.clone(),
                done: Box::new(move |result| tx.send(result.map(|_| ())).expect("send")),
            },
        );
        let err = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("completion")
            .expect_err("cancelled open");
        assert_eq!(err.raw_os_error(), Some(libc::ECANCELED));
        assert!(!path.exists());
    }

    #[test]
    fn closed_spill_file_reports_ebadf() {
        let spill = SpillFile::closed();
        let err = spill.write_at(b"x", 0).expect_err("no fd");
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn unlink_removes_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("buffer.unlink");
        std::fs::write(&path, b"x").expect("create");
        let pool = pool();
        let (tx, rx) = mpsc::channel();
        pool.handle().submit(
            IoRequest::new(),
            IoJob::Unlink {
                path: path.clone(),
                done: Box::new(move |result| tx.send(result).expect("send")),
            },
        );
        rx.recv_timeout(Duration::from_secs(5))
            .expect("completion")
            .expect("unlink");
        assert!(!path.exists());
    }
}
