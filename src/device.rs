//! Device-runtime capability interface consumed by the coordinator.
//!
//! The coordinator never talks to a driver directly; everything it needs
//! from the device runtime — raw allocations, exportable IPC handles,
//! capture-state queries, peer-access queries — goes through this trait.
//! Real bindings live with the reduction-engine crate; [`crate::host`]
//! provides an in-process implementation for tests and CPU-only runs.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{DeviceHandle, DeviceId};

/// Opaque, exportable token for a device memory allocation.
///
/// Importable by another process in the same group to obtain a locally
/// valid mapping of the same physical memory. The byte contents are
/// meaningful only to the runtime that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpcMemHandle {
    bytes: Vec<u8>,
}

impl IpcMemHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Low-level device primitives consumed by the coordinator.
///
/// One implementation per accelerator runtime. All pointer values use the
/// raw `u64` model; ownership and validity are governed by the documented
/// contracts, not the type system.
pub trait DeviceRuntime: Send + Sync {
    /// Allocate `size_bytes` of device memory, returning its address.
    ///
    /// # Safety
    /// The returned address is owned by the caller and must be released
    /// with [`DeviceRuntime::free`] exactly once.
    unsafe fn allocate(&self, size_bytes: usize) -> Result<u64>;

    /// Export an IPC handle for an allocation made by [`DeviceRuntime::allocate`].
    fn export_handle(&self, ptr: u64) -> Result<IpcMemHandle>;

    /// Import a peer's exported handle into a locally addressable pointer.
    ///
    /// The mapping grants access but never ownership; the importing rank
    /// must not free it.
    ///
    /// # Safety
    /// The handle must have been produced by a live allocation in a
    /// process sharing this runtime's IPC namespace.
    unsafe fn import_handle(&self, handle: &IpcMemHandle) -> Result<u64>;

    /// Release an allocation made by [`DeviceRuntime::allocate`].
    ///
    /// # Safety
    /// `ptr` must be a live local allocation; no address derived from it
    /// may be dereferenced afterward.
    unsafe fn free(&self, ptr: u64) -> Result<()>;

    /// True while the execution backend is actively recording a replayable
    /// graph on the current stream.
    fn is_stream_capturing(&self) -> bool;

    /// Resolve a logical (visible) device index to its physical device id.
    fn physical_device_id(&self, device: DeviceHandle) -> Result<DeviceId>;

    /// Driver-reported peer-access capability from `device` to `peer`.
    ///
    /// Cheap but trusts the driver; used only under the configured
    /// driver-trust override.
    fn device_can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool>;

    /// Authoritative peer-access verification from `device` to `peer`.
    ///
    /// May be expensive on first query; implementations are expected to
    /// cache.
    fn verify_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<bool>;
}
