//! Graph-buffer registration: the second, independent exchange protocol
//! that runs after a capture session ends.
//!
//! The exchange is a sequence of single-source broadcasts in ascending
//! rank order, one per rank, rather than a single all-gather: opaque
//! cross-process handle payloads are not safe through a generic
//! all-gather on every backend.

use tracing::info;

use crate::engine::{GraphBufferMeta, ReduceEngine};
use crate::error::{MeshReduceError, Result};
use crate::group::ProcessGroup;
use crate::types::Rank;

/// Collect every shared-buffer address recorded during the just-completed
/// capture session, exchange per-rank rows, and register the merged table
/// with the engine.
pub(crate) async fn register_graph_buffers<G: ProcessGroup>(
    group: &G,
    engine: &dyn ReduceEngine,
    handle: u64,
) -> Result<()> {
    let world_size = group.world_size() as usize;
    let rank = group.rank() as usize;

    let local = engine.graph_buffer_meta(handle)?;
    info!(
        addresses = local.offsets.len(),
        "registering captured graph buffer addresses"
    );

    let mut rows: Vec<Option<GraphBufferMeta>> = vec![None; world_size];
    rows[rank] = Some(local);
    for source in 0..world_size {
        let row = group.broadcast(rows[source].as_ref(), source as Rank).await?;
        rows[source] = Some(row);
    }

    let mut handles = Vec::with_capacity(world_size);
    let mut offsets = Vec::with_capacity(world_size);
    for (source, row) in rows.into_iter().enumerate() {
        let row = row.ok_or(MeshReduceError::CollectiveFailed {
            operation: "graph buffer exchange",
            rank: source as Rank,
            reason: "row missing after broadcast round".into(),
        })?;
        handles.push(row.handle);
        offsets.push(row.offsets);
    }

    engine.register_graph_buffers(handle, handles, offsets)
}
