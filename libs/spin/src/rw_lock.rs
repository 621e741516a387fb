// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicUsize, Ordering};

use lock_api::GuardSend;

use crate::Backoff;

pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;
pub type RwLockUpgradableReadGuard<'a, T> =
    lock_api::RwLockUpgradableReadGuard<'a, RawRwLock, T>;

const WRITER: usize = 1;
const UPGRADED: usize = 1 << 1;
const READER: usize = 1 << 2;

// An arbitrary cap that lets us catch reader-count overflow long before it
// can corrupt the WRITER and UPGRADED bits.
const MAX_READERS: usize = usize::MAX / READER / 2;

/// A writer-preferring reader-writer spinlock with upgradable reads.
///
/// Readers optimistically bump the reader count and undo the increment if
/// a writer (or upgrader) holds the lock. At most one upgradable reader
/// exists at a time; it may share the lock with plain readers and later
/// upgrade to exclusive access once the readers drain. Writers spin with
/// [`Backoff`] until the state word is entirely clear.
pub struct RawRwLock {
    state: AtomicUsize,
}

unsafe impl lock_api::RawRwLock for RawRwLock {
    const INIT: Self = Self {
        state: AtomicUsize::new(0),
    };
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        let mut boff = Backoff::new();
        while !self.try_lock_shared() {
            boff.spin();
        }
    }

    fn try_lock_shared(&self) -> bool {
        let state = self.acquire_reader();

        // Checking the UPGRADED bit too keeps new readers out while an
        // upgradable lock is held, which reduces writer starvation.
        if state & (WRITER | UPGRADED) != 0 {
            // The lock is taken, undo the optimistic increment.
            self.state.fetch_sub(READER, Ordering::Release);
            false
        } else {
            true
        }
    }

    unsafe fn unlock_shared(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) / READER > 0);
        self.state.fetch_sub(READER, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        let mut boff = Backoff::new();
        while !self.try_lock_exclusive() {
            boff.spin();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed) & WRITER, WRITER);

        // The writer clears both WRITER and UPGRADED: a failed upgradable
        // acquisition may have left the UPGRADED bit set while this lock
        // was held.
        self.state.fetch_and(!(WRITER | UPGRADED), Ordering::Release);
    }
}

unsafe impl lock_api::RawRwLockUpgrade for RawRwLock {
    fn lock_upgradable(&self) {
        let mut boff = Backoff::new();
        while !self.try_lock_upgradable() {
            boff.spin();
        }
    }

    fn try_lock_upgradable(&self) -> bool {
        let state = self.state.fetch_or(UPGRADED, Ordering::Acquire);

        // Failing against a held WRITER may leave a stray UPGRADED bit
        // behind; the writer clears it on unlock. Until then, other
        // upgradable attempts spin, which is all a spinlock promises.
        state & (WRITER | UPGRADED) == 0
    }

    unsafe fn unlock_upgradable(&self) {
        debug_assert_eq!(
            self.state.load(Ordering::Relaxed) & (WRITER | UPGRADED),
            UPGRADED
        );
        self.state.fetch_sub(UPGRADED, Ordering::AcqRel);
    }

    unsafe fn upgrade(&self) {
        let mut boff = Backoff::new();
        while !self.try_upgrade_internal(false) {
            boff.spin();
        }
    }

    unsafe fn try_upgrade(&self) -> bool {
        self.try_upgrade_internal(true)
    }
}

unsafe impl lock_api::RawRwLockDowngrade for RawRwLock {
    unsafe fn downgrade(&self) {
        // Reserve the read guard for ourselves before releasing the
        // exclusive hold.
        self.acquire_reader();

        debug_assert_eq!(self.state.load(Ordering::Relaxed) & WRITER, WRITER);
        self.state.fetch_and(!(WRITER | UPGRADED), Ordering::Release);
    }
}

unsafe impl lock_api::RawRwLockUpgradeDowngrade for RawRwLock {
    unsafe fn downgrade_upgradable(&self) {
        // Reserve the read guard for ourselves.
        self.acquire_reader();

        // Safety: the caller holds the upgradable lock.
        unsafe {
            <Self as lock_api::RawRwLockUpgrade>::unlock_upgradable(self);
        }
    }

    unsafe fn downgrade_to_upgradable(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed) & WRITER, WRITER);

        // Claim (or absorb a stray) UPGRADED bit first, then release the
        // WRITER bit. Plain bit operations only: a reader may be inside
        // its optimistic increment at any time, so the reader count must
        // never be overwritten wholesale.
        self.state.fetch_or(UPGRADED, Ordering::Acquire);
        self.state.fetch_and(!WRITER, Ordering::Release);
    }
}

impl RawRwLock {
    fn acquire_reader(&self) -> usize {
        let state = self.state.fetch_add(READER, Ordering::Acquire);

        if state > MAX_READERS * READER {
            self.state.fetch_sub(READER, Ordering::Relaxed);
            panic!("reader count overflow");
        }
        state
    }

    fn try_upgrade_internal(&self, strong: bool) -> bool {
        // The upgrade completes once every plain reader has drained: the
        // state is then exactly UPGRADED.
        let (success, failure) = (Ordering::Acquire, Ordering::Relaxed);
        if strong {
            self.state
                .compare_exchange(UPGRADED, WRITER, success, failure)
                .is_ok()
        } else {
            self.state
                .compare_exchange_weak(UPGRADED, WRITER, success, failure)
                .is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn smoke() {
        let l = RwLock::new(());
        drop(l.read());
        drop(l.write());
        drop((l.read(), l.read()));
        drop(l.upgradable_read());
        drop(l.write());
    }

    #[test]
    fn try_write_fails_under_reader() {
        let lock = RwLock::new(0isize);
        let read_guard = lock.read();
        assert!(lock.try_write().is_none());
        drop(read_guard);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn upgrade_yields_exclusive_access() {
        let lock = RwLock::new(1);

        let upgradable = lock.upgradable_read();
        assert_eq!(*upgradable, 1);
        // An upgradable read excludes writers and other upgraders, but
        // not plain readers already in place.
        assert!(lock.try_write().is_none());
        assert!(lock.try_upgradable_read().is_none());

        let mut write = RwLockUpgradableReadGuard::upgrade(upgradable);
        *write += 1;
        drop(write);

        assert_eq!(*lock.read(), 2);
        assert!(lock.try_upgradable_read().is_some());
    }

    #[test]
    fn downgrade_back_to_upgradable() {
        let lock = RwLock::new(0);
        let write = lock.write();
        let upgradable = RwLockWriteGuard::downgrade_to_upgradable(write);
        // Readers come back while the upgradable hold persists...
        drop(upgradable);
        // ...and a full release opens the lock up again.
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn upgrade_waits_for_active_readers() {
        let lock = Arc::new(RwLock::new(0));

        let read_guard = lock.read();
        let upgrader = {
            let lock = lock.clone();
            thread::spawn(move || {
                let upgradable = lock.upgradable_read();
                let mut write = RwLockUpgradableReadGuard::upgrade(upgradable);
                *write = 7;
            })
        };

        // Give the upgrader time to start spinning on the held reader.
        thread::sleep(Duration::from_millis(20));
        drop(read_guard);

        upgrader.join().unwrap();
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn readers_never_observe_torn_writes() {
        let arc = Arc::new(RwLock::new(0));
        let arc2 = arc.clone();
        let (tx, rx) = channel();

        thread::spawn(move || {
            for _ in 0..10 {
                let mut lock = arc2.write();
                let tmp = *lock;
                *lock = -1;
                thread::yield_now();
                *lock = tmp + 1;
            }
            tx.send(()).unwrap();
        });

        // Readers try to catch the writer mid-update.
        let children: Vec<_> = (0..5)
            .map(|_| {
                let arc3 = arc.clone();
                thread::spawn(move || {
                    let lock = arc3.read();
                    assert!(*lock >= 0);
                })
            })
            .collect();

        for r in children {
            assert!(r.join().is_ok());
        }

        rx.recv().unwrap();
        assert_eq!(*arc.read(), 10);
    }
}
