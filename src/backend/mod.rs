//! Block backend abstraction: a byte-addressable block device with
//! range-locked read/write/trim/sync/cmpwrite, plus free-space estimation.
//!
//! Three variants are provided: [`file::FileBackend`] (raw block image on
//! disk), [`nbd::NbdBackend`] (Network Block Device client), and
//! [`memory::MemoryBackend`] (RAM-backed, standing in for the embedded
//! SD-card variant whose hardware driver is platform glue).

pub mod file;
pub mod memory;
pub mod nbd;

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::stats::BackendStats;

/// Outcome of a compare-and-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpwriteResult {
    Ok,
    Mismatch { offset: u64 },
    ReadError,
    WriteError,
}

/// Outcome of a write-then-verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVerifyResult {
    Ok,
    Mismatch { offset: u64 },
    ReadError,
    WriteError,
}

/// A byte-addressable, range-locked block device.
///
/// `read`/`write`/`trim`/`sync`/`cmpwrite` all take `&self`: the backend is
/// shared process-wide across every connection, and mutual exclusion for
/// overlapping ranges comes from the backend's own [`RangeLockTable`], not
/// from borrowing rules.
pub trait Backend: Send + Sync {
    /// Open the device. Idempotent; `false` on unrecoverable failure.
    fn begin(&self) -> bool;

    fn size_in_blocks(&self) -> u64;

    fn block_size(&self) -> u64;

    /// Fill `out` (`n_blocks * block_size` bytes) starting at `block_nr`.
    fn read(&self, block_nr: u64, n_blocks: u32, out: &mut [u8]) -> bool;

    /// Write `data` (`n_blocks * block_size` bytes) starting at `block_nr`.
    fn write(&self, block_nr: u64, n_blocks: u32, data: &[u8]) -> bool;

    /// Best-effort erase; implementations may fall back to writing zeros.
    fn trim(&self, block_nr: u64, n_blocks: u32) -> bool;

    /// Flush durably; only returns after the backing store acknowledges.
    fn sync(&self) -> bool;

    /// Range-locked read-compare-write. No write occurs on mismatch.
    fn cmpwrite(
        &self,
        block_nr: u64,
        n_blocks: u32,
        write: &[u8],
        compare: &[u8],
    ) -> CmpwriteResult;

    /// Range-locked write followed by a read-back compare, both under the
    /// same lock so no other writer can land between them. Used by WRITE
    /// AND VERIFY(10); unlike `cmpwrite`, the write is unconditional.
    fn write_and_verify(&self, block_nr: u64, n_blocks: u32, data: &[u8]) -> WriteVerifyResult;

    fn stats(&self) -> &BackendStats;

    /// True once no read/write/trim/cmpwrite/write_and_verify has touched
    /// this backend for [`IDLE_THRESHOLD`]. Lets a constrained build yield
    /// to a caller-supplied idle callback between accesses.
    fn is_idle(&self) -> bool;

    /// Sample 100 (jittered, evenly spaced) blocks and report the fraction
    /// that are entirely zero, as a thin-provisioning hint.
    fn free_space_percentage(&self) -> u8 {
        estimate_free_space_percent(self)
    }
}

/// Idle threshold, grounded in the original backend's `is_idle()`: roughly
/// half a second (499000us) since the last access.
pub const IDLE_THRESHOLD: Duration = Duration::from_micros(499_000);

/// Tracks time of last backend access, grounded in the original backend's
/// `ts_last_acces` field, touched on every read/write/trim/compare-write.
pub struct LastAccess(Mutex<Instant>);

impl LastAccess {
    pub fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    pub fn touch(&self) {
        *self.0.lock().expect("last-access lock poisoned") = Instant::now();
    }

    pub fn is_idle(&self) -> bool {
        self.0.lock().expect("last-access lock poisoned").elapsed() >= IDLE_THRESHOLD
    }
}

impl Default for LastAccess {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed array of N mutexes. A range `[b, b+n)` maps onto the set of
/// lock indices `{ hash(b+i) mod N }`, acquired in ascending order so two
/// overlapping ranges can never deadlock against each other.
pub struct RangeLockTable {
    locks: Vec<Mutex<()>>,
}

/// RAII guard holding every lock index touched by one range.
pub struct RangeGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl RangeLockTable {
    pub fn new(n: usize) -> Self {
        let n = n.max(1);
        Self {
            locks: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn indices(&self, block_nr: u64, n_blocks: u32) -> Vec<usize> {
        let n = self.locks.len() as u64;
        let mut set = BTreeSet::new();
        for i in 0..n_blocks.max(1) as u64 {
            set.insert((mix_hash(block_nr.wrapping_add(i)) % n) as usize);
        }
        set.into_iter().collect()
    }

    /// Lock every index a `[block_nr, block_nr+n_blocks)` range touches, in
    /// ascending order.
    pub fn lock_range(&self, block_nr: u64, n_blocks: u32) -> RangeGuard<'_> {
        let indices = self.indices(block_nr, n_blocks);
        let guards = indices
            .into_iter()
            .map(|i| self.locks[i].lock().expect("range lock poisoned"))
            .collect();
        RangeGuard { _guards: guards }
    }
}

/// splitmix64 finalizer: cheap, well-distributed avalanche for block indices.
fn mix_hash(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Shared free-space estimator, grounded in the original backend's random
/// sampling: 100 samples, jittered around evenly spaced buckets, counting
/// all-zero blocks.
fn estimate_free_space_percent<B: Backend + ?Sized>(backend: &B) -> u8 {
    let size = backend.size_in_blocks();
    if size == 0 {
        return 0;
    }
    let block_size = backend.block_size() as usize;
    const SAMPLES: u32 = 100;
    let bucket = (size / SAMPLES as u64).max(1) as i64;
    let mut rng = rand::thread_rng();
    let mut zero_count = 0u32;
    let mut buf = vec![0u8; block_size];

    for i in 0..SAMPLES {
        let base = i as i64 * bucket;
        let jitter = rng.gen_range(-bucket..=bucket);
        let idx = (base + jitter).rem_euclid(size as i64) as u64;
        if backend.read(idx, 1, &mut buf) && buf.iter().all(|&b| b == 0) {
            zero_count += 1;
        }
    }

    zero_count.min(100) as u8
}

/// Generic read-compare-write built from a backend's own locked read/write,
/// for backends that have no cheaper native compare-and-swap. The whole
/// sequence runs under one `lock`, which the caller must hold across the
/// call (acquired from the same [`RangeLockTable`] the backend reads/writes
/// through) so no other writer can interleave between the compare and the
/// write.
pub(crate) fn generic_cmpwrite<F, W>(
    block_size: u64,
    n_blocks: u32,
    compare: &[u8],
    write_payload: &[u8],
    mut read_locked: F,
    mut write_locked: W,
) -> CmpwriteResult
where
    F: FnMut(&mut [u8]) -> bool,
    W: FnMut(&[u8]) -> bool,
{
    let total = (block_size * n_blocks as u64) as usize;
    let mut current = vec![0u8; total];
    if !read_locked(&mut current) {
        return CmpwriteResult::ReadError;
    }
    if current != compare {
        let offset = current
            .iter()
            .zip(compare.iter())
            .position(|(a, b)| a != b)
            .unwrap_or(0) as u64;
        return CmpwriteResult::Mismatch { offset };
    }
    if !write_locked(write_payload) {
        return CmpwriteResult::WriteError;
    }
    CmpwriteResult::Ok
}

/// Generic write-then-read-compare, built from a backend's own locked
/// read/write. The whole sequence runs under one `lock`, which the caller
/// must hold across the call, so no other writer can land between the
/// write and the read-back.
pub(crate) fn generic_write_verify<F, W>(
    block_size: u64,
    n_blocks: u32,
    write_payload: &[u8],
    mut write_locked: W,
    mut read_locked: F,
) -> WriteVerifyResult
where
    F: FnMut(&mut [u8]) -> bool,
    W: FnMut(&[u8]) -> bool,
{
    if !write_locked(write_payload) {
        return WriteVerifyResult::WriteError;
    }
    let total = (block_size * n_blocks as u64) as usize;
    let mut readback = vec![0u8; total];
    if !read_locked(&mut readback) {
        return WriteVerifyResult::ReadError;
    }
    if readback != write_payload {
        let offset = readback
            .iter()
            .zip(write_payload.iter())
            .position(|(a, b)| a != b)
            .unwrap_or(0) as u64;
        return WriteVerifyResult::Mismatch { offset };
    }
    WriteVerifyResult::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_indices_are_sorted_and_deduped() {
        let table = RangeLockTable::new(4);
        let idx = table.indices(0, 16);
        let mut sorted = idx.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(idx, sorted);
    }

    #[test]
    fn n_of_one_never_deadlocks() {
        let table = RangeLockTable::new(1);
        let _g1 = table.lock_range(0, 1);
        drop(_g1);
        let _g2 = table.lock_range(100, 50);
    }

    #[test]
    fn disjoint_ranges_can_lock_concurrently() {
        let table = RangeLockTable::new(128);
        let a = table.indices(0, 1);
        let b = table.indices(1_000_000, 1);
        // Not a hard guarantee (hash collisions possible) but true for this seed.
        assert_ne!(a, b);
    }

    #[test]
    fn last_access_is_not_idle_right_after_touch() {
        let tracker = LastAccess::new();
        tracker.touch();
        assert!(!tracker.is_idle());
    }

    #[test]
    fn last_access_is_idle_after_threshold_elapses() {
        let tracker = LastAccess(Mutex::new(Instant::now() - IDLE_THRESHOLD * 2));
        assert!(tracker.is_idle());
    }
}
