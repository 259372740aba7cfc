//! Interface to the external native reduction engine.
//!
//! The engine owns the reduction arithmetic and the intra-kernel
//! synchronization protocol over the shared regions; this crate only
//! coordinates its lifecycle. One opaque handle per coordinator instance,
//! disposed exactly once.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::TensorView;
use crate::types::Rank;

/// Per-rank description of every shared-buffer address a reduction call
/// recorded during one capture session: an exportable handle blob plus the
/// offsets into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphBufferMeta {
    pub handle: Vec<u8>,
    pub offsets: Vec<i64>,
}

/// Address tables handed to the engine at initialization.
///
/// Each table is ordered by rank and has world-size entries; `rank_data`
/// is this rank's private scratch heap.
#[derive(Debug, Clone, Copy)]
pub struct EngineRegions<'a> {
    pub rank_data: u64,
    pub rank_data_bytes: usize,
    pub buffer_ptrs: &'a [u64],
    pub result_ptrs: &'a [u64],
    pub barrier_in_ptrs: &'a [u64],
    pub barrier_out_ptrs: &'a [u64],
}

/// The external reduction engine, consumed as an opaque native operation.
pub trait ReduceEngine: Send + Sync {
    /// False when the engine is not built for this platform. A coordinator
    /// constructed over an unavailable engine is permanently disabled.
    fn is_available(&self) -> bool;

    /// Initialize the engine over the shared regions, returning an opaque
    /// nonzero handle.
    ///
    /// # Safety
    /// All table entries must be live mappings of the symmetric regions,
    /// and must outlive the returned handle.
    unsafe fn init(&self, rank: Rank, world_size: u32, regions: EngineRegions<'_>) -> Result<u64>;

    /// Out-of-place reduction of `input` into `output`.
    ///
    /// # Safety
    /// Both views must describe live device buffers of identical byte
    /// size; `output` must not alias `input`.
    unsafe fn all_reduce(&self, handle: u64, input: &TensorView, output: &TensorView)
        -> Result<()>;

    /// Metadata for every shared-buffer address recorded during the
    /// just-completed capture session.
    fn graph_buffer_meta(&self, handle: u64) -> Result<GraphBufferMeta>;

    /// Register the merged per-rank capture tables, aligned by rank index.
    fn register_graph_buffers(
        &self,
        handle: u64,
        handles: Vec<Vec<u8>>,
        offsets: Vec<Vec<i64>>,
    ) -> Result<()>;

    /// Release the engine handle. Must be called exactly once per handle.
    fn dispose(&self, handle: u64) -> Result<()>;
}
