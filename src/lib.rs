pub mod config;
pub mod coordinator;
pub mod device;
pub mod engine;
pub mod error;
pub(crate) mod graph;
pub mod group;
pub mod host;
pub mod loopback;
pub mod nvlink;
pub mod probe;
pub mod shared;
pub mod tensor;
pub mod types;

pub use config::MeshReduceConfig;
pub use coordinator::{CaptureGuard, DisableReason, MeshAllReduce, SUPPORTED_WORLD_SIZES};
pub use device::{DeviceRuntime, IpcMemHandle};
pub use engine::{EngineRegions, GraphBufferMeta, ReduceEngine};
pub use error::{MeshReduceError, Result};
pub use group::{BackendKind, ProcessGroup};
pub use host::HostRuntime;
pub use loopback::{LoopbackGroup, LoopbackOptions};
pub use nvlink::{NvlinkSession, NvlinkStatus, NvlinkTopology};
pub use shared::SharedRegion;
pub use tensor::{DeviceTensor, TensorView};
pub use types::{DataType, DeviceHandle, DeviceId, Rank};
