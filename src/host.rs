//! Host-memory implementation of the device-runtime seam.
//!
//! Backs allocations with plain heap memory and models IPC export/import
//! as an in-process registry, so coordinator integration can run without
//! accelerator hardware. Freed allocations are poisoned and tracked,
//! which lets tests catch double-frees and use-after-free of exchanged
//! pointers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::device::{DeviceRuntime, IpcMemHandle};
use crate::error::{MeshReduceError, Result};
use crate::types::{DeviceHandle, DeviceId};

const POISON_BYTE: u8 = 0xDD;

struct HostState {
    /// ptr -> allocation length.
    allocations: HashMap<u64, usize>,
    /// Export token -> exporting allocation's ptr.
    exports: HashMap<u64, u64>,
    /// ptr -> number of times a peer imported it.
    imports: HashMap<u64, usize>,
    freed: HashSet<u64>,
    /// Pair -> driver-reported peer access (default true).
    driver_access: HashMap<(DeviceId, DeviceId), bool>,
    /// Pair -> verified peer access (default true).
    verified_access: HashMap<(DeviceId, DeviceId), bool>,
    /// Optional logical-index -> physical-id map; identity when empty.
    device_map: Vec<DeviceId>,
}

/// In-process [`DeviceRuntime`] over host heap memory.
pub struct HostRuntime {
    state: Mutex<HostState>,
    capturing: AtomicBool,
    next_token: AtomicU64,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                allocations: HashMap::new(),
                exports: HashMap::new(),
                imports: HashMap::new(),
                freed: HashSet::new(),
                driver_access: HashMap::new(),
                verified_access: HashMap::new(),
                device_map: Vec::new(),
            }),
            capturing: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
        }
    }

    /// Map logical device indices to physical ids; identity when unset.
    pub fn with_device_map(device_map: Vec<DeviceId>) -> Self {
        let rt = Self::new();
        rt.state.lock().unwrap().device_map = device_map;
        rt
    }

    /// Simulate the execution backend entering/leaving graph recording.
    pub fn set_stream_capturing(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::SeqCst);
    }

    /// Override the driver-reported peer-access answer for one ordered pair.
    pub fn set_driver_peer_access(&self, device: DeviceId, peer: DeviceId, ok: bool) {
        self.state
            .lock()
            .unwrap()
            .driver_access
            .insert((device, peer), ok);
    }

    /// Override the verified peer-access answer for one ordered pair.
    pub fn set_verified_peer_access(&self, device: DeviceId, peer: DeviceId, ok: bool) {
        self.state
            .lock()
            .unwrap()
            .verified_access
            .insert((device, peer), ok);
    }

    /// Number of live (not yet freed) allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().allocations.len()
    }

    /// True if `ptr` was allocated here and has been freed.
    pub fn was_freed(&self, ptr: u64) -> bool {
        self.state.lock().unwrap().freed.contains(&ptr)
    }

    /// How many times peers imported the allocation at `ptr`.
    pub fn import_count(&self, ptr: u64) -> usize {
        self.state
            .lock()
            .unwrap()
            .imports
            .get(&ptr)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for HostRuntime {
    unsafe fn allocate(&self, size_bytes: usize) -> Result<u64> {
        if size_bytes == 0 {
            return Err(MeshReduceError::AllocationFailed {
                size_bytes,
                reason: "zero-sized allocation".into(),
            });
        }
        let buf = vec![0u8; size_bytes].into_boxed_slice();
        let ptr = Box::into_raw(buf) as *mut u8 as u64;
        self.state.lock().unwrap().allocations.insert(ptr, size_bytes);
        Ok(ptr)
    }

    fn export_handle(&self, ptr: u64) -> Result<IpcMemHandle> {
        let mut state = self.state.lock().unwrap();
        if !state.allocations.contains_key(&ptr) {
            return Err(MeshReduceError::device(format!(
                "cannot export unknown pointer 0x{ptr:x}"
            )));
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        state.exports.insert(token, ptr);
        Ok(IpcMemHandle::new(token.to_le_bytes().to_vec()))
    }

    unsafe fn import_handle(&self, handle: &IpcMemHandle) -> Result<u64> {
        let bytes: [u8; 8] = handle
            .as_bytes()
            .try_into()
            .map_err(|_| MeshReduceError::device("malformed IPC handle"))?;
        let token = u64::from_le_bytes(bytes);
        let mut state = self.state.lock().unwrap();
        let ptr = *state
            .exports
            .get(&token)
            .ok_or_else(|| MeshReduceError::device(format!("unknown IPC token {token}")))?;
        if !state.allocations.contains_key(&ptr) {
            return Err(MeshReduceError::device(format!(
                "IPC token {token} refers to a freed allocation"
            )));
        }
        *state.imports.entry(ptr).or_insert(0) += 1;
        // In-process "shared memory": the imported mapping is the same address.
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: u64) -> Result<()> {
        let len = {
            let mut state = self.state.lock().unwrap();
            let len = state.allocations.remove(&ptr).ok_or_else(|| {
                MeshReduceError::device(format!("free of unknown or already-freed pointer 0x{ptr:x}"))
            })?;
            state.freed.insert(ptr);
            len
        };
        // Poison before release so stale readers see garbage, not old data.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(ptr as *mut u8, len);
            slice.fill(POISON_BYTE);
            drop(Box::from_raw(slice as *mut [u8]));
        }
        Ok(())
    }

    fn is_stream_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn physical_device_id(&self, device: DeviceHandle) -> Result<DeviceId> {
        let state = self.state.lock().unwrap();
        if state.device_map.is_empty() {
            return Ok(device.index as DeviceId);
        }
        state
            .device_map
            .get(device.index)
            .copied()
            .ok_or(MeshReduceError::InvalidDevice {
                index: device.index,
                visible: state.device_map.len(),
            })
    }

    fn device_can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .driver_access
            .get(&(device, peer))
            .unwrap_or(&true))
    }

    fn verify_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .verified_access
            .get(&(device, peer))
            .unwrap_or(&true))
    }
}
