//! Blocking synchronization primitives built on the scheduler.
//!
//! Spinlocks come from `hermit-sync`; this module adds the counting
//! semaphore and the owner-tracked mutex.

pub mod mutex;
pub mod semaphore;
