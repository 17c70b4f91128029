//! Environment mutation helpers for config tests.

use std::sync::{Mutex, OnceLock, PoisonError};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Runs `run` while holding the process-wide environment lock.
///
/// A panicking test poisons the lock; later tests still proceed.
pub(crate) fn with_locked_env<R>(run: impl FnOnce() -> R) -> R {
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    run()
}

pub(crate) fn set_env_var(key: &str, value: &str) {
    // SAFETY: callers hold `with_locked_env`, so no other test touches the environment.
    unsafe {
        std::env::set_var(key, value);
    }
}

pub(crate) fn remove_env_var(key: &str) {
    // SAFETY: see `set_env_var`.
    unsafe {
        std::env::remove_var(key);
    }
}
