// src/lib.rs
mod constants;
mod cursor;
mod env;
mod error;
mod meta;
mod page;
mod pagelist;
mod transaction;
mod tree;
mod types;
mod value;

pub use constants::{EnvFlags, TreeFlags, WriteFlags};
pub use env::{EnvInfo, Environment};
pub use error::{Error, Result};
pub use meta::Canary;
pub use transaction::Transaction;
pub use tree::Tree;
pub use types::{CommitOutcome, LagInfo, TreeStat};
pub use value::{default_preserver, Preserved, ValueBuf};

/// Lock a mutex, riding through poisoning (a panicked holder cannot leave
/// the guarded state half-updated in a way these structures care about).
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
