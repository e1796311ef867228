//! Failure injection hooks and polling helpers for tests.
//!
//! The I/O workers consult these hooks before touching the real file, so
//! tests can simulate errno faults, short writes, and slow reads
//! deterministically. Hooks are compiled out of release builds.

use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::io::SpillFile;

/// Context passed to write-injection hooks.
///
/// The hook sees the target file, so a short-write simulation can perform
/// the partial write for real before reporting the short count.
pub struct WriteOpContext<'a> {
    pub file: &'a SpillFile,
    pub data: &'a [u8],
    pub offset: u64,
}

/// Context passed to read-injection hooks.
pub struct ReadOpContext<'a> {
    pub file: &'a SpillFile,
    pub len: usize,
    pub offset: u64,
}

/// Hook signature for write overrides. Return `Some(Ok(n))` to report `n`
/// bytes written, `Some(Err(..))` to fail the write, or `None` to let the
/// real write proceed.
pub type WriteHook =
    dyn for<'a> Fn(&WriteOpContext<'a>) -> Option<io::Result<usize>> + Send + Sync + 'static;

/// Hook signature for read overrides. Returning `None` after a sleep is the
/// way to hold a read in flight without changing its result.
pub type ReadHook =
    dyn for<'a> Fn(&ReadOpContext<'a>) -> Option<io::Result<usize>> + Send + Sync + 'static;

/// Hook signature for open overrides. Return `Some(err)` to fail the
/// create-exclusive open with that error.
pub type OpenHook = dyn Fn(&Path) -> Option<io::Error> + Send + Sync + 'static;

macro_rules! hook_slot {
    ($slot_fn:ident, $query_fn:ident, $install_fn:ident, $clear_fn:ident, $guard:ident, $hook:ident, $ctx:ty, $out:ty) => {
        #[cfg(debug_assertions)]
        fn $slot_fn() -> &'static RwLock<Option<Arc<$hook>>> {
            static SLOT: OnceLock<RwLock<Option<Arc<$hook>>>> = OnceLock::new();
            SLOT.get_or_init(|| RwLock::new(None))
        }

        /// Query the installed hook, if any, to determine whether the real
        /// operation should be overridden.
        pub fn $query_fn(ctx: $ctx) -> Option<$out> {
            #[cfg(debug_assertions)]
            {
                $slot_fn().read().as_ref().and_then(|hook| hook(ctx))
            }

            #[cfg(not(debug_assertions))]
            {
                let _ = ctx;
                None
            }
        }

        /// Guard that restores the previous hook when dropped.
        pub struct $guard {
            #[cfg(debug_assertions)]
            previous: Option<Arc<$hook>>,
        }

        impl Drop for $guard {
            fn drop(&mut self) {
                #[cfg(debug_assertions)]
                {
                    let mut slot = $slot_fn().write();
                    *slot = self.previous.take();
                }
            }
        }

        /// Install a hook, returning a guard that reverts to the previous
        /// hook (if any) when dropped.
        #[cfg(debug_assertions)]
        pub fn $install_fn<F>(hook: F) -> $guard
        where
            F: Fn($ctx) -> Option<$out> + Send + Sync + 'static,
        {
            let mut slot = $slot_fn().write();
            let previous = std::mem::replace(&mut *slot, Some(Arc::new(hook)));
            $guard { previous }
        }

        /// Install a hook. No-op when failure injection is compiled out.
        #[cfg(not(debug_assertions))]
        pub fn $install_fn<F>(_hook: F) -> $guard
        where
            F: Fn($ctx) -> Option<$out> + Send + Sync + 'static,
        {
            $guard {}
        }

        /// Clear any registered hook.
        #[cfg(debug_assertions)]
        pub fn $clear_fn() {
            let mut slot = $slot_fn().write();
            *slot = None;
        }

        /// Clear hook (no-op when failure injection is compiled out).
        #[cfg(not(debug_assertions))]
        pub fn $clear_fn() {}
    };
}

hook_slot!(
    write_hook_slot,
    write_override,
    install_write_hook,
    clear_write_hook,
    WriteHookGuard,
    WriteHook,
    &WriteOpContext<'_>,
    io::Result<usize>
);

hook_slot!(
    read_hook_slot,
    read_override,
    install_read_hook,
    clear_read_hook,
    ReadHookGuard,
    ReadHook,
    &ReadOpContext<'_>,
    io::Result<usize>
);

hook_slot!(
    open_hook_slot,
    open_override,
    install_open_hook,
    clear_open_hook,
    OpenHookGuard,
    OpenHook,
    &Path,
    io::Error
);

/// Poll `condition` until it holds or `timeout` elapses. Returns whether the
/// condition was observed.
pub fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
