//! Process-wide library state.
//!
//! # Design
//! Initialization is explicit and reference counted: every `init` (or
//! `acquire`) is matched by one release, and the library counts as
//! initialized while the count is above zero. Executors refuse to start
//! without it. The state also tracks how many transfers are running across
//! all executors, so teardown while transfers are in flight can be logged.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

static INIT_COUNT: AtomicUsize = AtomicUsize::new(0);
static ACTIVE_TRANSFERS: AtomicUsize = AtomicUsize::new(0);

/// Keeps the library initialized until dropped.
#[derive(Debug)]
#[must_use = "the library is torn down when the guard is dropped"]
pub struct GlobalGuard(());

impl Drop for GlobalGuard {
    fn drop(&mut self) {
        release();
    }
}

/// Initialize the library for as long as the returned guard lives.
pub fn init() -> GlobalGuard {
    acquire();
    GlobalGuard(())
}

/// Take one initialization reference. Pair with `release`.
pub fn acquire() {
    let previous = INIT_COUNT.fetch_add(1, Ordering::AcqRel);
    if previous == 0 {
        debug!("transfer library initialized");
    }
}

/// Drop one initialization reference. Returns false if there was none.
pub fn release() -> bool {
    let result = INIT_COUNT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    match result {
        Ok(1) => {
            let active = ACTIVE_TRANSFERS.load(Ordering::Acquire);
            if active > 0 {
                warn!(active, "transfer library torn down with transfers running");
            } else {
                debug!("transfer library torn down");
            }
            true
        }
        Ok(_) => true,
        Err(_) => {
            warn!("release without matching init");
            false
        }
    }
}

pub fn is_initialized() -> bool {
    INIT_COUNT.load(Ordering::Acquire) > 0
}

/// Transfers currently running across all executors.
pub fn active_transfers() -> usize {
    ACTIVE_TRANSFERS.load(Ordering::Acquire)
}

/// Counts one running transfer until dropped.
#[derive(Debug)]
pub(crate) struct ActiveTransfer(());

impl ActiveTransfer {
    pub(crate) fn start() -> Self {
        ACTIVE_TRANSFERS.fetch_add(1, Ordering::AcqRel);
        ActiveTransfer(())
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        ACTIVE_TRANSFERS.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_keeps_library_initialized() {
        let outer = init();
        assert!(is_initialized());
        {
            let _inner = init();
            assert!(is_initialized());
        }
        assert!(is_initialized());
        drop(outer);
    }
}
