use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use meshreduce::{
    DeviceHandle, DeviceId, DeviceRuntime, EngineRegions, GraphBufferMeta, HostRuntime,
    LoopbackGroup, LoopbackOptions, MeshAllReduce, MeshReduceConfig, MeshReduceError,
    NvlinkSession, NvlinkStatus, NvlinkTopology, Rank, ReduceEngine, Result, TensorView,
};

// ============================================================================
// Reduction engine double
// ============================================================================

#[derive(Default)]
struct EngineLog {
    init_calls: Vec<(Rank, u32, usize)>,
    reduce_calls: Vec<(u64, u64, u64, usize)>,
    register_calls: Vec<(Vec<Vec<u8>>, Vec<Vec<i64>>)>,
    disposed: Vec<u64>,
}

/// Records every engine interaction; performs no arithmetic.
pub struct RecordingEngine {
    available: bool,
    next_handle: AtomicU64,
    meta: Mutex<GraphBufferMeta>,
    log: Mutex<EngineLog>,
}

impl RecordingEngine {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            next_handle: AtomicU64::new(1),
            meta: Mutex::new(GraphBufferMeta {
                handle: Vec::new(),
                offsets: Vec::new(),
            }),
            log: Mutex::new(EngineLog::default()),
        }
    }

    /// What `graph_buffer_meta` will report for this rank.
    pub fn set_meta(&self, meta: GraphBufferMeta) {
        *self.meta.lock().unwrap() = meta;
    }

    pub fn init_calls(&self) -> Vec<(Rank, u32, usize)> {
        self.log.lock().unwrap().init_calls.clone()
    }

    pub fn reduce_count(&self) -> usize {
        self.log.lock().unwrap().reduce_calls.len()
    }

    pub fn reduce_calls(&self) -> Vec<(u64, u64, u64, usize)> {
        self.log.lock().unwrap().reduce_calls.clone()
    }

    pub fn register_calls(&self) -> Vec<(Vec<Vec<u8>>, Vec<Vec<i64>>)> {
        self.log.lock().unwrap().register_calls.clone()
    }

    pub fn disposed(&self) -> Vec<u64> {
        self.log.lock().unwrap().disposed.clone()
    }
}

impl ReduceEngine for RecordingEngine {
    fn is_available(&self) -> bool {
        self.available
    }

    unsafe fn init(&self, rank: Rank, world_size: u32, regions: EngineRegions<'_>) -> Result<u64> {
        let width = regions.buffer_ptrs.len();
        assert_eq!(width, world_size as usize);
        assert_eq!(regions.result_ptrs.len(), width);
        assert_eq!(regions.barrier_in_ptrs.len(), width);
        assert_eq!(regions.barrier_out_ptrs.len(), width);
        assert!(regions.rank_data != 0 && regions.rank_data_bytes > 0);
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .init_calls
            .push((rank, world_size, width));
        Ok(handle)
    }

    unsafe fn all_reduce(
        &self,
        handle: u64,
        input: &TensorView,
        output: &TensorView,
    ) -> Result<()> {
        self.log.lock().unwrap().reduce_calls.push((
            handle,
            input.ptr(),
            output.ptr(),
            input.size_bytes(),
        ));
        Ok(())
    }

    fn graph_buffer_meta(&self, _handle: u64) -> Result<GraphBufferMeta> {
        Ok(self.meta.lock().unwrap().clone())
    }

    fn register_graph_buffers(
        &self,
        _handle: u64,
        handles: Vec<Vec<u8>>,
        offsets: Vec<Vec<i64>>,
    ) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .register_calls
            .push((handles, offsets));
        Ok(())
    }

    fn dispose(&self, handle: u64) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.disposed.contains(&handle) {
            return Err(MeshReduceError::Engine {
                operation: "dispose",
                reason: format!("handle {handle} disposed twice"),
            });
        }
        log.disposed.push(handle);
        Ok(())
    }
}

// ============================================================================
// Topology double
// ============================================================================

/// Reports one answer for every device pair.
pub struct StaticTopology {
    full: bool,
}

struct StaticSession {
    full: bool,
}

impl NvlinkSession for StaticSession {
    fn p2p_status(&self, _device: DeviceId, _peer: DeviceId) -> Result<NvlinkStatus> {
        Ok(if self.full {
            NvlinkStatus::Ok
        } else {
            NvlinkStatus::NotSupported
        })
    }
}

impl NvlinkTopology for StaticTopology {
    fn open_session(&self) -> Result<Box<dyn NvlinkSession + '_>> {
        Ok(Box::new(StaticSession { full: self.full }))
    }
}

// ============================================================================
// Multi-rank harness
// ============================================================================

/// Shared fixtures for one multi-rank scenario. Run a closure once per
/// rank, each on its own task, then inspect the per-rank engines.
pub struct MeshHarness {
    pub world_size: u32,
    pub runtime: Arc<HostRuntime>,
    pub engines: Vec<Arc<RecordingEngine>>,
    pub topology: Arc<StaticTopology>,
    pub options: LoopbackOptions,
}

impl MeshHarness {
    /// Full NVLink mesh, available engine, single host.
    pub fn new(world_size: u32) -> Self {
        Self {
            world_size,
            runtime: Arc::new(HostRuntime::new()),
            engines: (0..world_size)
                .map(|_| Arc::new(RecordingEngine::new(true)))
                .collect(),
            topology: Arc::new(StaticTopology { full: true }),
            options: LoopbackOptions::default(),
        }
    }

    pub fn no_nvlink(mut self) -> Self {
        self.topology = Arc::new(StaticTopology { full: false });
        self
    }

    pub fn engine_unavailable(mut self) -> Self {
        self.engines = (0..self.world_size)
            .map(|_| Arc::new(RecordingEngine::new(false)))
            .collect();
        self
    }

    pub fn hosts(mut self, hosts: &[&str]) -> Self {
        self.options.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
        self
    }

    pub fn fabric_backend(mut self) -> Self {
        self.options.backend = meshreduce::BackendKind::Fabric;
        self
    }

    /// Spawn one task per rank and wait for all of them.
    pub async fn run<F, Fut>(&self, f: F)
    where
        F: Fn(RankCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let groups = LoopbackGroup::bootstrap_with(self.world_size, self.options.clone());
        let f = Arc::new(f);
        let mut tasks = Vec::new();
        for (rank, group) in groups.into_iter().enumerate() {
            let ctx = RankCtx {
                rank: rank as Rank,
                group,
                runtime: Arc::clone(&self.runtime),
                engine: Arc::clone(&self.engines[rank]),
                topology: Arc::clone(&self.topology),
            };
            let f = Arc::clone(&f);
            tasks.push(tokio::spawn(async move { f(ctx).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}

/// Per-rank slice of the harness.
pub struct RankCtx {
    pub rank: Rank,
    pub group: LoopbackGroup,
    pub runtime: Arc<HostRuntime>,
    pub engine: Arc<RecordingEngine>,
    pub topology: Arc<StaticTopology>,
}

impl RankCtx {
    /// Construct this rank's coordinator, consuming the group handle.
    pub async fn build(self, config: MeshReduceConfig) -> MeshAllReduce<LoopbackGroup> {
        let runtime: Arc<dyn DeviceRuntime> = self.runtime.clone();
        let engine: Arc<dyn ReduceEngine> = self.engine.clone();
        MeshAllReduce::new(
            self.group,
            DeviceHandle::new(self.rank as usize),
            runtime,
            engine,
            self.topology.as_ref(),
            config,
        )
        .await
        .unwrap()
    }
}

/// A packed f32 view of `bytes` bytes at a synthetic address.
pub fn packed_view(bytes: usize) -> TensorView {
    assert_eq!(bytes % 4, 0);
    unsafe { TensorView::new(0x10_0000, bytes / 4, meshreduce::DataType::F32) }
}
