// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// A one-shot latch preventing races when populating singleton
/// registries.
///
/// Registration functions need the singleton instance before their
/// entries are all inserted, but handing the instance out that early
/// would let querying threads observe a half-built registry. The barrier
/// splits the accessors: the registration accessor does not wait, the
/// query accessor blocks until [`RegistrationBarrier::set_fully_constructed`]
/// ran. Entering the query path from within registration deadlocks by
/// design.
#[derive(Default)]
pub struct RegistrationBarrier {
    is_fully_constructed: AtomicBool,
    // Even though the flag is atomic, updates are made under this mutex
    // so a waiter cannot enter its wait after the notification fired.
    mutex: Mutex<()>,
    condvar: Condvar,
}

// === impl RegistrationBarrier ===

impl RegistrationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the instance is ready for all clients.
    #[inline]
    pub fn wait_until_fully_constructed(&self) {
        if self.is_fully_constructed.load(Ordering::Acquire) {
            return;
        }
        self.wait_slow();
    }

    /// Marks the instance ready for all clients. Must be called exactly
    /// once.
    pub fn set_fully_constructed(&self) {
        let was_constructed = {
            let _guard = self.mutex.lock().unwrap();
            self.is_fully_constructed.swap(true, Ordering::Release)
        };
        self.condvar.notify_all();
        if was_constructed {
            log::error!("set_fully_constructed must only be called once");
        }
    }

    // The vast majority of waits happen after construction and take the
    // early return above; keeping the mutex/condvar wait out of line
    // keeps that check inlineable.
    #[cold]
    fn wait_slow(&self) {
        let mut guard = self.mutex.lock().unwrap();
        while !self.is_fully_constructed.load(Ordering::Acquire) {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn waiters_block_until_set() {
        let barrier = Arc::new(RegistrationBarrier::new());
        let observed_early = Arc::new(AtomicBool::new(false));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let observed_early = observed_early.clone();
                thread::spawn(move || {
                    barrier.wait_until_fully_constructed();
                    observed_early.load(Ordering::SeqCst)
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        observed_early.store(true, Ordering::SeqCst);
        barrier.set_fully_constructed();

        for w in waiters {
            assert!(w.join().unwrap());
        }

        // Waiting after construction returns immediately.
        barrier.wait_until_fully_constructed();
    }
}
