// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Minimal spin-based synchronization primitives.
//!
//! The interning registries in this workspace take their shard locks for a
//! handful of pointer chases at a time, so a spinning reader-writer lock
//! beats a blocking one. The raw lock plugs into [`lock_api`] to get the
//! usual guard types for free, and supports upgradable reads for the
//! find-then-insert protocol of the intern tables.

mod backoff;
mod rw_lock;

pub use backoff::Backoff;
pub use rw_lock::{
    RawRwLock, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard,
    RwLockWriteGuard,
};
