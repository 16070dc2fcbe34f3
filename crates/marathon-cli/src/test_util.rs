//! Test-only helpers shared across this crate's `#[cfg(test)]` modules.

use std::sync::{Mutex, MutexGuard};

/// `config::resolve` reads process-wide environment variables, so tests that
/// set/unset them must not run concurrently with each other. Every such test
/// takes this lock for its duration.
static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
