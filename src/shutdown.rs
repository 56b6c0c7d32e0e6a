//! SIGINT/SIGTERM discipline (§5): a running engine must finish its
//! current transaction before exiting rather than being torn down
//! mid-write. Mirrors `bin/oe/main.rs`'s `Condvar`-guarded exit flag,
//! minus the daemon/restart machinery that process has no counterpart for
//! here — this crate is a library, not a process.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared flag observed by the engine's transaction loops between one bounded
/// unit of work and the next (a GC sweep, a job step). Install with
/// [`install`], check with [`ShutdownFlag::requested`].
#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl Default for ShutdownFlag {
    fn default() -> Self {
        ShutdownFlag(Arc::new(AtomicBool::new(false)))
    }
}

impl ShutdownFlag {
    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Installs a `ctrlc` handler that flips the returned flag. Safe to call
/// at most once per process; a second call returns an error the caller
/// should log and ignore, matching `ctrlc::set_handler`'s own contract.
pub fn install() -> Result<ShutdownFlag, ctrlc::Error> {
    let flag = ShutdownFlag::default();
    let for_handler = flag.clone();
    ctrlc::set_handler(move || {
        log::warn!("shutdown requested, finishing in-flight work before exit");
        for_handler.request();
    })?;
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear_and_latches_once_requested() {
        let flag = ShutdownFlag::default();
        assert!(!flag.requested());
        flag.request();
        assert!(flag.requested());
    }

    #[test]
    fn clones_share_the_same_underlying_flag() {
        let flag = ShutdownFlag::default();
        let clone = flag.clone();
        clone.request();
        assert!(flag.requested());
    }
}
