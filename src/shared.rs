//! Symmetric shared-region lifecycle: one allocation per rank, IPC
//! handles exchanged all-to-all, yielding a per-rank pointer table.
//!
//! Creation is a collective: every rank must call it the same number of
//! times in the same order, or the exchange pairs mismatched regions.
//! Teardown is local: each rank frees only its own slot; imported
//! mappings are released by the owning rank's teardown.

use std::sync::Arc;

use tracing::warn;

use crate::device::DeviceRuntime;
use crate::error::Result;
use crate::group::ProcessGroup;

/// A symmetric allocation replicated once per rank, with a full address
/// table ordered by rank index. Exactly one entry (`ptrs[local_rank]`)
/// is this rank's own allocation; the others are imported IPC mappings.
pub struct SharedRegion {
    ptrs: Vec<u64>,
    size_bytes: usize,
    local_rank: usize,
    runtime: Arc<dyn DeviceRuntime>,
    freed: bool,
}

impl SharedRegion {
    /// Allocate `size_bytes` locally, exchange IPC handles with every
    /// rank, and import each peer's allocation.
    ///
    /// This call is a synchronization barrier as well as a data exchange:
    /// it blocks until all ranks arrive.
    pub async fn create<G: ProcessGroup>(
        runtime: Arc<dyn DeviceRuntime>,
        group: &G,
        size_bytes: usize,
    ) -> Result<Self> {
        let local_rank = group.rank() as usize;
        let local_ptr = unsafe { runtime.allocate(size_bytes)? };

        let result = Self::exchange(&runtime, group, local_rank, local_ptr).await;
        let ptrs = match result {
            Ok(ptrs) => ptrs,
            Err(e) => {
                // The exchange failed; release the local allocation before
                // reporting, so a disabled coordinator leaks nothing.
                if let Err(free_err) = unsafe { runtime.free(local_ptr) } {
                    warn!(error = %free_err, "failed to release local slot after exchange error");
                }
                return Err(e);
            }
        };

        Ok(Self {
            ptrs,
            size_bytes,
            local_rank,
            runtime,
            freed: false,
        })
    }

    async fn exchange<G: ProcessGroup>(
        runtime: &Arc<dyn DeviceRuntime>,
        group: &G,
        local_rank: usize,
        local_ptr: u64,
    ) -> Result<Vec<u64>> {
        let handle = runtime.export_handle(local_ptr)?;
        let handles = group.all_gather(&handle).await?;

        let mut ptrs = Vec::with_capacity(handles.len());
        for (i, handle) in handles.iter().enumerate() {
            if i == local_rank {
                ptrs.push(local_ptr);
            } else {
                ptrs.push(unsafe { runtime.import_handle(handle)? });
            }
        }
        Ok(ptrs)
    }

    /// Full address table, ordered by rank index.
    pub fn ptrs(&self) -> &[u64] {
        &self.ptrs
    }

    /// This rank's own allocation.
    pub fn local_ptr(&self) -> u64 {
        self.ptrs[self.local_rank]
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Free this rank's own slot. Idempotent; never touches another
    /// rank's memory. No address in the table may be dereferenced after
    /// this returns.
    pub fn free(&mut self) -> Result<()> {
        if self.freed {
            return Ok(());
        }
        self.freed = true;
        unsafe { self.runtime.free(self.ptrs[self.local_rank]) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            warn!(error = %e, "failed to free shared region slot");
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("size_bytes", &self.size_bytes)
            .field("local_rank", &self.local_rank)
            .field("world_size", &self.ptrs.len())
            .field("freed", &self.freed)
            .finish()
    }
}
