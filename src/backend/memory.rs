//! RAM-backed block device. Stands in for the embedded SD-card backend
//! variant (`ESP32/backend-sdcard.h`): same trait shape as the file backend,
//! different storage medium — the hardware SD driver itself is
//! platform-specific bring-up and out of scope here.
//!
//! Unlike [`super::file::FileBackend`], storage lives behind a single
//! `Mutex<Vec<u8>>` rather than relying on OS-level positioned I/O, so
//! throughput under concurrent disjoint-range access is lower; acceptable
//! for the embedded/small-capacity role this variant plays.

use std::sync::Mutex;
use std::time::Instant;

use super::{
    generic_cmpwrite, generic_write_verify, Backend, CmpwriteResult, LastAccess, RangeLockTable,
    WriteVerifyResult,
};
use crate::stats::BackendStats;

pub struct MemoryBackend {
    data: Mutex<Vec<u8>>,
    block_size: u64,
    size_in_blocks: u64,
    locks: RangeLockTable,
    stats: BackendStats,
    last_access: LastAccess,
}

impl MemoryBackend {
    pub fn new(size_in_blocks: u64, block_size: u64, range_lock_count: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; (size_in_blocks * block_size) as usize]),
            block_size,
            size_in_blocks,
            locks: RangeLockTable::new(range_lock_count),
            stats: BackendStats::new(),
            last_access: LastAccess::new(),
        }
    }

    fn raw_read(&self, block_nr: u64, n_blocks: u32, out: &mut [u8]) -> bool {
        let offset = (block_nr * self.block_size) as usize;
        let len = (n_blocks as u64 * self.block_size) as usize;
        let store = self.data.lock().expect("memory backend poisoned");
        match store.get(offset..offset + len) {
            Some(slice) => {
                out[..len].copy_from_slice(slice);
                true
            }
            None => false,
        }
    }

    fn raw_write(&self, block_nr: u64, n_blocks: u32, data: &[u8]) -> bool {
        let offset = (block_nr * self.block_size) as usize;
        let len = (n_blocks as u64 * self.block_size) as usize;
        let mut store = self.data.lock().expect("memory backend poisoned");
        match store.get_mut(offset..offset + len) {
            Some(slice) => {
                slice.copy_from_slice(&data[..len]);
                true
            }
            None => false,
        }
    }
}

impl Backend for MemoryBackend {
    fn begin(&self) -> bool {
        true
    }

    fn size_in_blocks(&self) -> u64 {
        self.size_in_blocks
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read(&self, block_nr: u64, n_blocks: u32, out: &mut [u8]) -> bool {
        let start = Instant::now();
        self.last_access.touch();
        let _guard = self.locks.lock_range(block_nr, n_blocks);
        let ok = self.raw_read(block_nr, n_blocks, out);
        if ok {
            self.stats
                .record_read(out.len() as u64, start.elapsed().as_micros() as u64);
        }
        ok
    }

    fn write(&self, block_nr: u64, n_blocks: u32, data: &[u8]) -> bool {
        let start = Instant::now();
        self.last_access.touch();
        let _guard = self.locks.lock_range(block_nr, n_blocks);
        let ok = self.raw_write(block_nr, n_blocks, data);
        if ok {
            self.stats
                .record_write(data.len() as u64, start.elapsed().as_micros() as u64);
        }
        ok
    }

    fn trim(&self, block_nr: u64, n_blocks: u32) -> bool {
        self.last_access.touch();
        let zeros = vec![0u8; (n_blocks as u64 * self.block_size) as usize];
        let _guard = self.locks.lock_range(block_nr, n_blocks);
        let ok = self.raw_write(block_nr, n_blocks, &zeros);
        if ok {
            self.stats.record_trim();
        }
        ok
    }

    fn sync(&self) -> bool {
        // Nothing to flush: there's no backing store beneath the Mutex.
        self.stats.record_sync();
        true
    }

    fn cmpwrite(
        &self,
        block_nr: u64,
        n_blocks: u32,
        write: &[u8],
        compare: &[u8],
    ) -> CmpwriteResult {
        self.last_access.touch();
        let _guard = self.locks.lock_range(block_nr, n_blocks);
        generic_cmpwrite(
            self.block_size,
            n_blocks,
            compare,
            write,
            |buf| self.raw_read(block_nr, n_blocks, buf),
            |buf| self.raw_write(block_nr, n_blocks, buf),
        )
    }

    fn write_and_verify(&self, block_nr: u64, n_blocks: u32, data: &[u8]) -> WriteVerifyResult {
        self.last_access.touch();
        let _guard = self.locks.lock_range(block_nr, n_blocks);
        generic_write_verify(
            self.block_size,
            n_blocks,
            data,
            |buf| self.raw_write(block_nr, n_blocks, buf),
            |buf| self.raw_read(block_nr, n_blocks, buf),
        )
    }

    fn stats(&self) -> &BackendStats {
        &self.stats
    }

    fn is_idle(&self) -> bool {
        self.last_access.is_idle()
    }
}
