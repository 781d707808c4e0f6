//! Observability counters threaded through the backend and connection
//! handler. The SNMP server that would export these is out of scope here;
//! this module is just the counters themselves.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-session / per-target protocol counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub cmd_pdus: AtomicU64,
    pub session_failures: AtomicU64,
    pub format_errors: AtomicU64,
    pub digest_errors: AtomicU64,
    pub tx_octets: AtomicU64,
    pub rx_octets: AtomicU64,
    pub login_accepts: AtomicU64,
    pub logout_normals: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_cmd_pdus(&self) {
        self.cmd_pdus.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_session_failures(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_format_errors(&self) {
        self.format_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_digest_errors(&self) {
        self.digest_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tx_octets(&self, n: u64) {
        self.tx_octets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx_octets(&self, n: u64) {
        self.rx_octets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_login_accepts(&self) {
        self.login_accepts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_logout_normals(&self) {
        self.logout_normals.fetch_add(1, Ordering::Relaxed);
    }
}

/// Backend I/O counters, snapshotted-and-reset on demand.
#[derive(Debug, Default)]
pub struct BackendStats {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub n_reads: AtomicU64,
    pub n_writes: AtomicU64,
    pub n_syncs: AtomicU64,
    pub n_trims: AtomicU64,
    pub io_wait_micros: AtomicU64,
}

/// A point-in-time copy of [`BackendStats`], returned by `get_and_reset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStatsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub n_reads: u64,
    pub n_writes: u64,
    pub n_syncs: u64,
    pub n_trims: u64,
    pub io_wait_micros: u64,
}

impl BackendStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: u64, wait_micros: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.n_reads.fetch_add(1, Ordering::Relaxed);
        self.io_wait_micros.fetch_add(wait_micros, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64, wait_micros: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.n_writes.fetch_add(1, Ordering::Relaxed);
        self.io_wait_micros.fetch_add(wait_micros, Ordering::Relaxed);
    }

    pub fn record_sync(&self) {
        self.n_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trim(&self) {
        self.n_trims.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter and reset it to zero, matching the original
    /// backend's get-and-reset semantics.
    pub fn get_and_reset(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot {
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
            bytes_written: self.bytes_written.swap(0, Ordering::Relaxed),
            n_reads: self.n_reads.swap(0, Ordering::Relaxed),
            n_writes: self.n_writes.swap(0, Ordering::Relaxed),
            n_syncs: self.n_syncs.swap(0, Ordering::Relaxed),
            n_trims: self.n_trims.swap(0, Ordering::Relaxed),
            io_wait_micros: self.io_wait_micros.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets() {
        let s = BackendStats::new();
        s.record_read(4096, 10);
        s.record_write(4096, 5);
        let snap = s.get_and_reset();
        assert_eq!(snap.bytes_read, 4096);
        assert_eq!(snap.n_reads, 1);
        assert_eq!(snap.n_writes, 1);
        let second = s.get_and_reset();
        assert_eq!(second, BackendStatsSnapshot::default());
    }
}
