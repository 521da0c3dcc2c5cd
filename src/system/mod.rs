//! System utilities module
//!
//! Thread-safe primitives and power locking.

mod locker;

pub use locker::{Locker, LockerError, LockerGuard};
