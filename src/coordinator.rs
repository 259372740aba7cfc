//! The P2P all-reduce coordinator: topology gate at construction,
//! per-call dispatch gate, capture-aware execution, and teardown.
//!
//! A coordinator either comes up enabled — shared regions allocated and
//! the native engine initialized — or permanently disabled. Negotiation
//! is never retried: an unsupported topology is a static fact for the
//! life of the process group, so every later call on a disabled instance
//! is a cheap "not handled".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::MeshReduceConfig;
use crate::device::DeviceRuntime;
use crate::engine::{EngineRegions, ReduceEngine};
use crate::error::Result;
use crate::graph;
use crate::group::{BackendKind, ProcessGroup};
use crate::nvlink::NvlinkTopology;
use crate::probe;
use crate::shared::SharedRegion;
use crate::tensor::{DeviceTensor, TensorView};
use crate::types::{DataType, DeviceHandle, DeviceId, Rank};

/// World sizes the fixed-size engine protocol headers support.
pub const SUPPORTED_WORLD_SIZES: [u32; 4] = [2, 4, 6, 8];

/// Workspace budgets by fan-in: index 0 is the 2-rank case, index 1 is
/// everything larger. Empirical values; revalidate on new hardware.
const MAX_REQUIRED_WORKSPACE: [usize; 2] = [16 * 1024 * 1024, 8 * 1024 * 1024];

const BARRIER_FLAG_BYTES: usize = 8;
const MAX_REDUCE_BLOCKS: usize = 36;
const MAX_RANKS_PER_HOST: usize = 8;
/// Per-rank synchronization-flag footprint of the barrier regions.
const BARRIER_REGION_BYTES: usize = BARRIER_FLAG_BYTES * (MAX_REDUCE_BLOCKS + 2) * MAX_RANKS_PER_HOST;

/// Private per-rank scratch heap handed to the engine.
const RANK_DATA_BYTES: usize = 8 * 1024 * 1024;

/// Why a coordinator came up disabled. Established once at construction,
/// never re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// The native reduction engine is not built for this platform.
    EngineUnavailable,
    /// The group already rides a fully-capable fabric backend.
    FabricBackend,
    /// The group spans more than one host.
    CrossHostGroup,
    /// Nothing to reduce with a single rank.
    SingleRank,
    /// World size outside the fixed supported set.
    UnsupportedWorldSize(u32),
    /// More than two ranks without a full one-hop NVLink mesh.
    PartialNvlinkMesh,
    /// At least one peer is unreachable over P2P.
    MissingPeerAccess,
    /// Region allocation, handle exchange, or engine init failed.
    SetupFailed,
}

impl std::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisableReason::EngineUnavailable => f.write_str("native reduction engine unavailable"),
            DisableReason::FabricBackend => f.write_str("group backend is already fabric-capable"),
            DisableReason::CrossHostGroup => f.write_str("process group spans hosts"),
            DisableReason::SingleRank => f.write_str("world size is 1"),
            DisableReason::UnsupportedWorldSize(n) => write!(f, "unsupported world size {n}"),
            DisableReason::PartialNvlinkMesh => {
                f.write_str("topology unsupported for more than two ranks without full NVLink")
            }
            DisableReason::MissingPeerAccess => f.write_str("platform lacks GPU P2P capability"),
            DisableReason::SetupFailed => f.write_str("shared resource setup failed"),
        }
    }
}

struct ActiveState {
    /// Opaque engine handle; zeroed once disposed.
    handle: u64,
    full_nvlink: bool,
    max_size: usize,
    buffer: SharedRegion,
    result: SharedRegion,
    barrier_in: SharedRegion,
    barrier_out: SharedRegion,
    /// Held for its allocation; released when the state drops.
    _rank_data: DeviceTensor,
}

/// Peer-to-peer shared-memory all-reduce coordinator for one rank.
///
/// One instance per rank per process, bound to exactly one device. All
/// collective-bearing operations (`new`, `CaptureGuard::finish`) must be
/// issued in identical order on every rank of the group.
pub struct MeshAllReduce<G: ProcessGroup> {
    group: G,
    runtime: Arc<dyn DeviceRuntime>,
    engine: Arc<dyn ReduceEngine>,
    rank: Rank,
    world_size: u32,
    capturing: AtomicBool,
    disable_reason: Option<DisableReason>,
    state: Option<ActiveState>,
}

impl<G: ProcessGroup> MeshAllReduce<G> {
    /// Negotiate capability for `group` and, if supported, stand up the
    /// shared regions and the native engine.
    ///
    /// Unsupported topology never errors: the coordinator comes up
    /// disabled and every dispatch returns "not handled". `Err` is
    /// reserved for invalid caller arguments such as a malformed device
    /// index.
    pub async fn new(
        group: G,
        device: DeviceHandle,
        runtime: Arc<dyn DeviceRuntime>,
        engine: Arc<dyn ReduceEngine>,
        topology: &dyn NvlinkTopology,
        config: MeshReduceConfig,
    ) -> Result<Self> {
        let rank = group.rank();
        let world_size = group.world_size();
        let mut this = Self {
            group,
            runtime,
            engine,
            rank,
            world_size,
            capturing: AtomicBool::new(false),
            disable_reason: None,
            state: None,
        };

        if !this.engine.is_available() {
            info!("P2P all-reduce disabled: native reduction engine unavailable on this platform");
            this.disable_reason = Some(DisableReason::EngineUnavailable);
            return Ok(this);
        }

        if this.group.backend() == BackendKind::Fabric {
            warn!("P2P all-reduce must attach to a non-fabric group; disabling");
            this.disable_reason = Some(DisableReason::FabricBackend);
            return Ok(this);
        }

        let same_host = match this.group.same_host(0).await {
            Ok(flags) => flags,
            Err(e) => {
                warn!(error = %e, "host locality query failed; disabling");
                this.disable_reason = Some(DisableReason::SetupFailed);
                return Ok(this);
            }
        };
        if !same_host.iter().all(|&on_host| on_host) {
            warn!("P2P all-reduce disabled because this process group spans across hosts");
            this.disable_reason = Some(DisableReason::CrossHostGroup);
            return Ok(this);
        }

        if world_size == 1 {
            this.disable_reason = Some(DisableReason::SingleRank);
            return Ok(this);
        }

        if !SUPPORTED_WORLD_SIZES.contains(&world_size) {
            warn!(
                world_size,
                supported = ?SUPPORTED_WORLD_SIZES,
                "P2P all-reduce disabled due to an unsupported world size; \
                 request the fallback path explicitly to silence this warning"
            );
            this.disable_reason = Some(DisableReason::UnsupportedWorldSize(world_size));
            return Ok(this);
        }

        // Malformed device index is the one hard construction error.
        let physical_id = this.runtime.physical_device_id(device)?;

        let device_ids: Vec<DeviceId> = match this.group.all_gather(&physical_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "physical device id exchange failed; disabling");
                this.disable_reason = Some(DisableReason::SetupFailed);
                return Ok(this);
            }
        };

        // NVLink first: it filters out most unsupported deployments before
        // the more expensive peer-access verification.
        let full_nvlink = probe::full_mesh_nvlink(topology, &device_ids);
        if world_size > 2 && !full_nvlink {
            warn!(
                "P2P all-reduce disabled: not supported on more than two PCIe-only devices; \
                 request the fallback path explicitly to silence this warning"
            );
            this.disable_reason = Some(DisableReason::PartialNvlinkMesh);
            return Ok(this);
        }

        if !probe::can_p2p(
            this.runtime.as_ref(),
            rank,
            world_size,
            config.skip_p2p_check,
        ) {
            warn!(
                "P2P all-reduce disabled: platform lacks GPU P2P capability or the P2P test \
                 failed; request the fallback path explicitly to silence this warning"
            );
            this.disable_reason = Some(DisableReason::MissingPeerAccess);
            return Ok(this);
        }

        match Self::setup(
            &this.group,
            &this.runtime,
            this.engine.as_ref(),
            rank,
            world_size,
            config.max_size_bytes,
            full_nvlink,
        )
        .await
        {
            Ok(state) => {
                debug!(rank, world_size, full_nvlink, "P2P all-reduce enabled");
                this.state = Some(state);
            }
            Err(e) => {
                warn!(error = %e, "shared resource setup failed; disabling");
                this.disable_reason = Some(DisableReason::SetupFailed);
            }
        }
        Ok(this)
    }

    async fn setup(
        group: &G,
        runtime: &Arc<dyn DeviceRuntime>,
        engine: &dyn ReduceEngine,
        rank: Rank,
        world_size: u32,
        max_size: usize,
        full_nvlink: bool,
    ) -> Result<ActiveState> {
        let buffer = SharedRegion::create(Arc::clone(runtime), group, max_size).await?;
        let result = SharedRegion::create(Arc::clone(runtime), group, max_size).await?;
        let rank_data = DeviceTensor::alloc(runtime, RANK_DATA_BYTES, DataType::U8)?;
        let barrier_in = SharedRegion::create(Arc::clone(runtime), group, BARRIER_REGION_BYTES).await?;
        let barrier_out =
            SharedRegion::create(Arc::clone(runtime), group, BARRIER_REGION_BYTES).await?;

        let handle = unsafe {
            engine.init(
                rank,
                world_size,
                EngineRegions {
                    rank_data: rank_data.ptr(),
                    rank_data_bytes: rank_data.size_bytes(),
                    buffer_ptrs: buffer.ptrs(),
                    result_ptrs: result.ptrs(),
                    barrier_in_ptrs: barrier_in.ptrs(),
                    barrier_out_ptrs: barrier_out.ptrs(),
                },
            )?
        };

        Ok(ActiveState {
            handle,
            full_nvlink,
            max_size,
            buffer,
            result,
            barrier_in,
            barrier_out,
            _rank_data: rank_data,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// The process group this coordinator rides on.
    pub fn group(&self) -> &G {
        &self.group
    }

    /// True if the construction-time gate left this instance inert.
    pub fn is_disabled(&self) -> bool {
        self.state.is_none()
    }

    /// Why the gate disabled this instance, if it did.
    pub fn disable_reason(&self) -> Option<DisableReason> {
        self.disable_reason
    }

    /// True between `begin_capture` and the end of its guard.
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// The opaque engine handle; 0 when disabled or closed.
    pub fn native_handle(&self) -> u64 {
        self.state.as_ref().map(|s| s.handle).unwrap_or(0)
    }

    /// Whether this call is a candidate for the P2P fast path.
    pub fn is_eligible(&self, input: &TensorView) -> bool {
        match &self.state {
            Some(state) => self.eligible_with(state, input),
            None => false,
        }
    }

    fn eligible_with(&self, state: &ActiveState, input: &TensorView) -> bool {
        let bytes = input.size_bytes();
        // The engine's vectorized accesses need 16-byte payload alignment.
        if bytes % 16 != 0 {
            return false;
        }
        if !input.is_weakly_contiguous() {
            return false;
        }
        if self.world_size == 2 {
            return bytes < state.max_size && bytes < MAX_REQUIRED_WORKSPACE[0];
        }
        // For larger fan-ins without NVLink the speedup over the fabric
        // collective is negligible, so the path is deliberately excluded.
        if state.full_nvlink {
            return bytes < state.max_size && bytes < MAX_REQUIRED_WORKSPACE[1];
        }
        false
    }

    /// Reduce `input` over the group, out-of-place.
    ///
    /// Returns `None` when the call is not handled — disabled coordinator
    /// or ineligible payload — and the caller must fall back to the
    /// general collective. During capture warm-up the engine is not
    /// touched; a placeholder with the real call's allocation footprint is
    /// returned instead.
    pub fn all_reduce(
        &self,
        input: &TensorView,
        out: Option<DeviceTensor>,
    ) -> Result<Option<DeviceTensor>> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        if !self.eligible_with(state, input) {
            return Ok(None);
        }

        if self.capturing.load(Ordering::SeqCst) && !self.runtime.is_stream_capturing() {
            let placeholder = match out {
                Some(tensor) => tensor,
                None => DeviceTensor::empty_like(input, &self.runtime)?,
            };
            return Ok(Some(placeholder));
        }

        let output = match out {
            Some(tensor) => tensor,
            None => DeviceTensor::empty_like(input, &self.runtime)?,
        };
        unsafe {
            self.engine.all_reduce(state.handle, input, &output.view())?;
        }
        Ok(Some(output))
    }

    /// Enter a capture session. At most one session may be active per
    /// instance; nesting is caller error and is not detected.
    ///
    /// The returned guard clears the capture flag on every exit path;
    /// call [`CaptureGuard::finish`] to also run the graph-buffer
    /// registration pass.
    pub fn begin_capture(&self) -> CaptureGuard<'_, G> {
        self.capturing.store(true, Ordering::SeqCst);
        CaptureGuard {
            coordinator: self,
            finished: false,
        }
    }

    /// Dispose the engine handle and free every shared region's own slot.
    /// Idempotent: the handle is zeroed after disposal, so a second call
    /// is a no-op.
    pub fn close(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        if state.handle != 0 {
            if let Err(e) = self.engine.dispose(state.handle) {
                warn!(error = %e, "engine dispose failed");
            }
            state.handle = 0;
        }
        for region in [
            &mut state.buffer,
            &mut state.result,
            &mut state.barrier_in,
            &mut state.barrier_out,
        ] {
            if let Err(e) = region.free() {
                warn!(error = %e, "failed to free shared region");
            }
        }
        // rank_data is released when `state` drops here.
    }
}

impl<G: ProcessGroup> Drop for MeshAllReduce<G> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Active capture session. Dropping the guard ends the session; only
/// [`CaptureGuard::finish`] additionally registers the captured graph
/// buffers with the engine.
pub struct CaptureGuard<'a, G: ProcessGroup> {
    coordinator: &'a MeshAllReduce<G>,
    finished: bool,
}

impl<G: ProcessGroup> CaptureGuard<'_, G> {
    /// End the capture session and run exactly one graph-buffer
    /// registration pass (skipped when the coordinator is disabled).
    ///
    /// Collective: every enabled rank must call this the same number of
    /// times in the same order.
    pub async fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.coordinator.capturing.store(false, Ordering::SeqCst);
        if let Some(state) = &self.coordinator.state {
            graph::register_graph_buffers(
                &self.coordinator.group,
                self.coordinator.engine.as_ref(),
                state.handle,
            )
            .await?;
        }
        Ok(())
    }
}

impl<G: ProcessGroup> Drop for CaptureGuard<'_, G> {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator.capturing.store(false, Ordering::SeqCst);
            if self.coordinator.state.is_some() {
                warn!("capture session dropped without finish(); graph buffers were not registered");
            }
        }
    }
}
