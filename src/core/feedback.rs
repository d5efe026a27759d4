//! DMA-buffer feedback bookkeeping.
//!
//! Tracks what the upstream compositor advertises for zero-copy buffer
//! negotiation: the shared format/modifier table, the preferred main
//! device, and the per-device tranches. Updates arrive incrementally and
//! are accumulated into `pending`; a terminal `done` event swaps `pending`
//! into `current` in one step. Readers (the forwarding proxy, when
//! advertising feedback downstream) only ever observe `current`, so a
//! half-built update is never visible; the single-threaded event loop is
//! the only synchronization needed.

use std::os::fd::OwnedFd;

use crate::core::errors::{LockError, Result};

/// Size of one format/modifier entry in the shared table: a u32 fourcc,
/// 4 bytes padding, and a u64 modifier.
pub const TABLE_ENTRY_SIZE: u32 = 16;

/// One group of format-table indices tied to a target device.
#[derive(Debug, Default, Clone)]
pub struct FeedbackTranche {
    /// dev_t of the target rendering device.
    pub device: u64,
    /// Indices into the format/modifier table.
    pub indices: Vec<u16>,
    /// Raw tranche flag bits (bit 0: scanout-capable).
    pub flags: u32,
}

impl FeedbackTranche {
    fn is_staged(&self) -> bool {
        self.device != 0 || !self.indices.is_empty() || self.flags != 0
    }
}

/// One fully committed feedback snapshot.
#[derive(Debug, Default)]
pub struct FeedbackState {
    /// dev_t of the preferred main device.
    pub main_device: u64,
    /// Format/modifier table fd and its size in bytes.
    pub table: Option<(OwnedFd, u32)>,
    pub tranches: Vec<FeedbackTranche>,
}

impl FeedbackState {
    pub fn table_size(&self) -> u32 {
        self.table.as_ref().map(|(_, size)| *size).unwrap_or(0)
    }
}

/// Double-buffered feedback synchronizer plus the legacy format lists.
#[derive(Debug, Default)]
pub struct FeedbackSync {
    current: FeedbackState,
    pending: FeedbackState,
    /// Tranche being accumulated before the next `tranche_done`.
    staging: FeedbackTranche,

    /// wl_shm pixel formats advertised upstream (raw wl_shm.format values).
    pub shm_formats: Vec<u32>,
    /// (fourcc, modifier) pairs from the pre-feedback dmabuf events.
    pub dmabuf_pairs: Vec<(u32, u64)>,
}

impl FeedbackSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed snapshot. The only view readers may hold.
    pub fn current(&self) -> &FeedbackState {
        &self.current
    }

    pub fn has_feedback(&self) -> bool {
        self.current.table.is_some()
    }

    // ------------------------------------------------------------------
    // Incremental update events (upstream zwp_linux_dmabuf_feedback_v1)
    // ------------------------------------------------------------------

    pub fn handle_format_table(&mut self, fd: OwnedFd, size: u32) {
        self.pending.table = Some((fd, size));
    }

    pub fn handle_main_device(&mut self, device: u64) {
        self.pending.main_device = device;
    }

    pub fn handle_tranche_target_device(&mut self, device: u64) {
        self.staging.device = device;
    }

    pub fn handle_tranche_formats(&mut self, indices: &[u8]) {
        self.staging
            .indices
            .extend(indices.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])));
    }

    pub fn handle_tranche_flags(&mut self, flags: u32) {
        self.staging.flags = flags;
    }

    pub fn handle_tranche_done(&mut self) {
        let tranche = std::mem::take(&mut self.staging);
        self.pending.tranches.push(tranche);
    }

    /// Terminal `done`: atomically replace `current` with the accumulated
    /// pending state. A tranche referencing an entry past the end of the
    /// table is a protocol inconsistency and fails the whole update; the
    /// committed state is left untouched in that case.
    pub fn handle_done(&mut self) -> Result<()> {
        if self.staging.is_staged() {
            // Upstream omitted tranche_done; fold the remainder in rather
            // than dropping it.
            self.handle_tranche_done();
        }

        // An update that did not resend the table inherits the current one.
        if self.pending.table.is_none() {
            self.pending.table = self.current.table.take();
        }

        let table_size = self.pending.table_size();
        for tranche in &self.pending.tranches {
            if let Some(&idx) = tranche.indices.iter().max() {
                let needed = (u32::from(idx) + 1) * TABLE_ENTRY_SIZE;
                if needed > table_size {
                    let err = LockError::feedback(format!(
                        "tranche index {idx} needs {needed} bytes but table is {table_size}"
                    ));
                    // Restore the table so the committed state stays valid.
                    if self.current.table.is_none() {
                        self.current.table = self.pending.table.take();
                    }
                    self.pending = FeedbackState::default();
                    return Err(err);
                }
            }
        }

        self.current = std::mem::take(&mut self.pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    fn table_fd() -> OwnedFd {
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    fn indices_bytes(indices: &[u16]) -> Vec<u8> {
        indices.iter().flat_map(|i| i.to_le_bytes()).collect()
    }

    #[test]
    fn test_pending_is_never_observable() {
        let mut sync = FeedbackSync::new();
        sync.handle_format_table(table_fd(), 64);
        sync.handle_main_device(0xdead);
        sync.handle_tranche_target_device(0xdead);
        sync.handle_tranche_formats(&indices_bytes(&[0, 1, 2]));

        // Interleaved reads between pending events see the empty snapshot.
        assert_eq!(sync.current().main_device, 0);
        assert!(sync.current().tranches.is_empty());
        assert!(sync.current().table.is_none());

        sync.handle_tranche_done();
        assert!(sync.current().tranches.is_empty(), "still not committed");

        sync.handle_done().unwrap();
        assert_eq!(sync.current().main_device, 0xdead);
        assert_eq!(sync.current().tranches.len(), 1);
        assert_eq!(sync.current().tranches[0].indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_done_clears_pending_for_next_round() {
        let mut sync = FeedbackSync::new();
        sync.handle_format_table(table_fd(), 32);
        sync.handle_tranche_target_device(1);
        sync.handle_tranche_formats(&indices_bytes(&[0]));
        sync.handle_tranche_done();
        sync.handle_done().unwrap();

        // Second round with a single different tranche.
        sync.handle_tranche_target_device(2);
        sync.handle_tranche_formats(&indices_bytes(&[1]));
        sync.handle_tranche_done();
        sync.handle_done().unwrap();

        assert_eq!(sync.current().tranches.len(), 1);
        assert_eq!(sync.current().tranches[0].device, 2);
    }

    #[test]
    fn test_table_is_inherited_when_not_resent() {
        let mut sync = FeedbackSync::new();
        sync.handle_format_table(table_fd(), 48);
        sync.handle_done().unwrap();

        sync.handle_tranche_target_device(7);
        sync.handle_tranche_formats(&indices_bytes(&[2]));
        sync.handle_tranche_done();
        sync.handle_done().unwrap();
        assert_eq!(sync.current().table_size(), 48);
    }

    #[test]
    fn test_out_of_range_index_is_fatal_to_the_update() {
        let mut sync = FeedbackSync::new();
        sync.handle_format_table(table_fd(), 64);
        sync.handle_tranche_formats(&indices_bytes(&[3]));
        sync.handle_tranche_done();
        sync.handle_done().unwrap();

        // 64 bytes cover indices 0..=3; index 4 does not fit.
        sync.handle_tranche_formats(&indices_bytes(&[4]));
        sync.handle_tranche_done();
        assert!(sync.handle_done().is_err());

        // Committed state survives the failed update.
        assert_eq!(sync.current().tranches.len(), 1);
        assert_eq!(sync.current().table_size(), 64);
    }

    #[test]
    fn test_missing_tranche_done_is_folded_in() {
        let mut sync = FeedbackSync::new();
        sync.handle_format_table(table_fd(), 16);
        sync.handle_tranche_target_device(9);
        sync.handle_tranche_formats(&indices_bytes(&[0]));
        sync.handle_done().unwrap();
        assert_eq!(sync.current().tranches.len(), 1);
        assert_eq!(sync.current().tranches[0].device, 9);
    }
}
