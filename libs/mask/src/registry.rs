// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The striped interning table backing [`Mask`](crate::Mask).
//!
//! The registry supports only find-or-insert and erase. Entries are
//! distributed over 64 independent shards by the low bits of the content
//! hash; each shard is a chained hash table behind its own RW spinlock, so
//! concurrent lookups of unrelated masks never contend on a central lock.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::LazyLock;

use bits::Bits;

/// Number of least-significant hash bits used to select a shard. These
/// bits are discarded from the bucket index computation.
const SHARD_BITS: u32 = 6;
const NUM_SHARDS: usize = 1 << SHARD_BITS;

/// Initial bucket array size per shard; must be a power of two.
const INITIAL_BUCKET_COUNT: usize = 1 << 4;

/// Masks of this size or smaller are immortal: their refcount and
/// resurrection traffic is skipped entirely.
const IMMORTAL_SIZE: usize = 8;

/// An interned bits node. Reference counting is managed cooperatively by
/// [`Mask`](crate::Mask) handles and the registry.
pub(crate) struct BitsNode {
    // Next entry in the bucket chain; guarded by the owning shard's lock.
    next: *mut BitsNode,
    hash: u64,
    bits: Bits,
    ref_count: AtomicU32,
    // Bounded by the number of threads concurrently reviving this entry,
    // so 16 bits are plenty.
    resurrection_count: AtomicU16,
    immortal: bool,
}

impl BitsNode {
    fn new(next: *mut BitsNode, hash: u64, bits: Bits) -> Self {
        let immortal = bits.size() <= IMMORTAL_SIZE;
        Self {
            next,
            hash,
            bits,
            ref_count: AtomicU32::new(1),
            resurrection_count: AtomicU16::new(0),
            immortal,
        }
    }

    #[inline]
    pub(crate) fn bits(&self) -> &Bits {
        &self.bits
    }

    #[inline]
    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub(crate) fn is_immortal(&self) -> bool {
        self.immortal
    }

    /// Adds one reference on behalf of a cloned handle.
    ///
    /// Relaxed suffices: a clone can only happen by way of an existing
    /// reference, and handing a `Mask` to another thread requires external
    /// synchronization like any non-atomic value. The registry separately
    /// serializes threads that look up the same bits concurrently.
    #[inline]
    pub(crate) fn retain(&self) {
        if !self.immortal {
            self.ref_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops one reference. Returns `true` if this was the last one and
    /// the caller must erase the node.
    ///
    /// Many threads may release concurrently but only one observes the
    /// count hit zero. The release/acquire pair ensures all prior uses
    /// happen-before the deletion.
    #[inline]
    pub(crate) fn release(&self) -> bool {
        if self.immortal {
            return false;
        }
        if self.ref_count.fetch_sub(1, Ordering::Release) == 1 {
            core::sync::atomic::fence(Ordering::Acquire);
            return true;
        }
        false
    }
}

struct Shard {
    // bucket_mask is len(buckets) - 1; len(buckets) is a power of two, so
    // masking is a fast modulo.
    bucket_mask: usize,
    buckets: Box<[*mut BitsNode]>,
    node_count: usize,
}

// Safety: the raw bucket pointers are only dereferenced while holding the
// shard lock (or via a refcounted handle), and `Bits` is Send + Sync.
unsafe impl Send for Shard {}
// Safety: shared access to a shard only reads immutable node content and
// atomics; structural mutation requires the shard's write lock.
unsafe impl Sync for Shard {}

impl Shard {
    fn new() -> Self {
        Self {
            bucket_mask: INITIAL_BUCKET_COUNT - 1,
            buckets: vec![core::ptr::null_mut(); INITIAL_BUCKET_COUNT].into_boxed_slice(),
            node_count: 0,
        }
    }

    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        ((hash >> SHARD_BITS) as usize) & self.bucket_mask
    }

    /// Scans the bucket for a value-equal entry, reviving it if found.
    fn find(&self, bits: &Bits, hash: u64) -> Option<NonNull<BitsNode>> {
        let mut cursor = self.buckets[self.bucket_index(hash)];
        while let Some(node) = NonNull::new(cursor) {
            // Safety: nodes linked into a bucket are alive; the chain is
            // only mutated under the shard's write lock and we hold at
            // least the read lock.
            let node_ref = unsafe { node.as_ref() };
            if node_ref.hash == hash && node_ref.bits == *bits {
                if !node_ref.immortal
                    && node_ref.ref_count.fetch_add(1, Ordering::Relaxed) == 0
                {
                    // We observed an entry whose last reference just went
                    // away. Bump the resurrection counter so the pending
                    // erase does not delete it out from under us. With
                    // multiple racing find/erase pairs, every reviving
                    // find adds exactly one count.
                    node_ref.resurrection_count.fetch_add(1, Ordering::Relaxed);
                }
                return Some(node);
            }
            cursor = node_ref.next;
        }
        None
    }

    /// Inserts a new head-of-bucket entry; the caller confirmed a miss
    /// under the write lock.
    fn emplace(&mut self, bits: Bits, hash: u64) -> NonNull<BitsNode> {
        // Rehash when the load factor exceeds 1.
        if self.node_count >= self.bucket_mask + 1 {
            self.rehash();
        }

        let idx = self.bucket_index(hash);
        // New entries go to the head of the bucket: freshly interned masks
        // are the most likely to be looked up again.
        let node = Box::new(BitsNode::new(self.buckets[idx], hash, bits));
        let ptr = NonNull::from(Box::leak(node));
        self.buckets[idx] = ptr.as_ptr();
        self.node_count += 1;
        ptr
    }

    /// Unlinks `target` from its bucket, or consumes one resurrection
    /// count instead. Returns the unlinked node for deletion outside the
    /// lock.
    fn unlink(&mut self, target: NonNull<BitsNode>) -> Option<Box<BitsNode>> {
        // Safety: target is still linked, hence alive.
        let target_ref = unsafe { target.as_ref() };

        // A racing find revived this entry after its refcount hit zero.
        // Consume one revival instead of erasing, so the refcount cannot
        // ABA into a double delete.
        if target_ref.resurrection_count.load(Ordering::Relaxed) > 0 {
            target_ref.resurrection_count.fetch_sub(1, Ordering::Relaxed);
            return None;
        }

        let idx = self.bucket_index(target_ref.hash);
        let mut pred: *mut *mut BitsNode = &mut self.buckets[idx];

        // Pointer comparison is sufficient, target is an entry in this
        // bucket.
        // Safety: all chain pointers in the bucket are valid while the
        // write lock is held.
        unsafe {
            while *pred != target.as_ptr() {
                pred = &mut (**pred).next;
            }
            *pred = target.as_ref().next;
            self.node_count -= 1;
            Some(Box::from_raw(target.as_ptr()))
        }
    }

    /// Doubles the bucket array and redistributes all nodes.
    fn rehash(&mut self) {
        let old_buckets = core::mem::replace(
            &mut self.buckets,
            vec![core::ptr::null_mut(); (self.bucket_mask + 1) * 2].into_boxed_slice(),
        );
        self.bucket_mask = (self.bucket_mask << 1) + 1;

        for head in old_buckets {
            let mut cursor = head;
            while let Some(node) = NonNull::new(cursor) {
                // Safety: node chains are exclusively owned under the
                // write lock during redistribution.
                unsafe {
                    let node_ref = &mut *node.as_ptr();
                    cursor = node_ref.next;
                    let idx = self.bucket_index(node_ref.hash);
                    node_ref.next = self.buckets[idx];
                    self.buckets[idx] = node.as_ptr();
                }
            }
        }
    }
}

pub(crate) struct MaskRegistry {
    shards: Box<[CachePadded<spin::RwLock<Shard>>]>,
}

// === impl MaskRegistry ===

impl MaskRegistry {
    fn new() -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| CachePadded(spin::RwLock::new(Shard::new())))
            .collect();
        Self { shards }
    }

    #[inline]
    fn shard(&self, hash: u64) -> &spin::RwLock<Shard> {
        &self.shards[(hash as usize) & (NUM_SHARDS - 1)].0
    }

    /// Returns the interned node for `bits`, inserting it if necessary.
    /// The returned node carries one reference on behalf of the caller.
    pub(crate) fn find_or_insert(&self, bits: &Bits) -> NonNull<BitsNode> {
        let hash = bits.fast_hash();
        let shard = self.shard(hash);

        // Look up under an upgradable read lock: concurrent erases stay
        // out, and the hit path never pays for exclusive access.
        let guard = shard.upgradable_read();
        if let Some(node) = guard.find(bits, hash) {
            return node;
        }

        // Miss: upgrade to the write lock. If upgrading ever releases and
        // re-acquires the lock, another thread may have inserted the
        // entry in the meantime, so scan the bucket once more before
        // emplacing.
        let mut guard = spin::RwLockUpgradableReadGuard::upgrade(guard);
        if let Some(node) = guard.find(bits, hash) {
            return node;
        }
        guard.emplace(bits.clone(), hash)
    }

    /// Like [`Self::find_or_insert`] but moves `bits` into the new node on
    /// a miss, avoiding the copy.
    pub(crate) fn find_or_emplace(&self, bits: Bits) -> NonNull<BitsNode> {
        let hash = bits.fast_hash();
        let shard = self.shard(hash);

        let guard = shard.upgradable_read();
        if let Some(node) = guard.find(&bits, hash) {
            return node;
        }

        // See find_or_insert for the upgrade-then-rescan discipline.
        let mut guard = spin::RwLockUpgradableReadGuard::upgrade(guard);
        if let Some(node) = guard.find(&bits, hash) {
            return node;
        }
        guard.emplace(bits, hash)
    }

    /// Erases the node whose refcount hit zero, unless a concurrent find
    /// revived it.
    pub(crate) fn erase(&self, target: NonNull<BitsNode>) {
        // Safety: the caller observed the final release; the node stays
        // alive until unlinked below.
        let hash = unsafe { target.as_ref().hash() };

        let unlinked = self.shard(hash).write().unlink(target);

        // The node is deleted outside of the shard lock.
        drop(unlinked);
    }

    /// The total number of interned entries. For test use only.
    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.0.read().node_count)
            .sum()
    }
}

static REGISTRY: LazyLock<MaskRegistry> = LazyLock::new(MaskRegistry::new);

pub(crate) fn registry() -> &'static MaskRegistry {
    &REGISTRY
}

/// Pads a shard to its own cache line so neighboring shard locks do not
/// falsely share.
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    repr(align(128))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64")),
    repr(align(64))
)]
struct CachePadded<T>(T);
