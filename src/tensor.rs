//! Device-buffer descriptors in the raw `u64` pointer model.
//!
//! A [`TensorView`] borrows a device buffer the caller owns; a
//! [`DeviceTensor`] owns its allocation and frees it through the runtime
//! when dropped.

use std::sync::Arc;

use crate::device::DeviceRuntime;
use crate::error::Result;
use crate::types::DataType;

/// Borrowed view of a device buffer participating in a reduction.
///
/// Carries enough layout information for the dispatch gate: element count,
/// dtype, whether the strides are the default packed pattern, and the span
/// of the backing storage for the weak-contiguity test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    ptr: u64,
    numel: usize,
    dtype: DataType,
    contiguous: bool,
    storage_bytes: usize,
    /// Element offset of this view into its backing storage.
    storage_offset: usize,
}

impl TensorView {
    /// View of a packed, contiguous buffer whose storage exactly matches
    /// the logical span.
    ///
    /// # Safety
    /// `ptr` must be a valid device pointer for
    /// `numel * dtype.size_in_bytes()` bytes.
    pub unsafe fn new(ptr: u64, numel: usize, dtype: DataType) -> Self {
        Self {
            ptr,
            numel,
            dtype,
            contiguous: true,
            storage_bytes: numel * dtype.size_in_bytes(),
            storage_offset: 0,
        }
    }

    /// View with explicit layout, for reshaped or offset buffers.
    ///
    /// # Safety
    /// `ptr` must be a valid device pointer for the described storage.
    pub unsafe fn with_storage(
        ptr: u64,
        numel: usize,
        dtype: DataType,
        contiguous: bool,
        storage_bytes: usize,
        storage_offset: usize,
    ) -> Self {
        Self {
            ptr,
            numel,
            dtype,
            contiguous,
            storage_bytes,
            storage_offset,
        }
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Logical payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.numel * self.dtype.size_in_bytes()
    }

    /// True if the buffer is contiguous, or if the backing storage past the
    /// view's offset exactly matches the logical span (a reshaped view that
    /// is not actually fragmented).
    pub fn is_weakly_contiguous(&self) -> bool {
        if self.contiguous {
            return true;
        }
        let esize = self.dtype.size_in_bytes();
        self.storage_bytes.checked_sub(self.storage_offset * esize) == Some(self.numel * esize)
    }
}

/// Owned device allocation, freed through its runtime on drop.
pub struct DeviceTensor {
    ptr: u64,
    numel: usize,
    dtype: DataType,
    runtime: Arc<dyn DeviceRuntime>,
}

impl DeviceTensor {
    /// Allocate an uninitialized buffer of `numel` elements.
    pub fn alloc(runtime: &Arc<dyn DeviceRuntime>, numel: usize, dtype: DataType) -> Result<Self> {
        let ptr = unsafe { runtime.allocate(numel * dtype.size_in_bytes())? };
        Ok(Self {
            ptr,
            numel,
            dtype,
            runtime: Arc::clone(runtime),
        })
    }

    /// Allocate a buffer matching another view's shape and dtype.
    pub fn empty_like(view: &TensorView, runtime: &Arc<dyn DeviceRuntime>) -> Result<Self> {
        Self::alloc(runtime, view.numel(), view.dtype())
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn size_bytes(&self) -> usize {
        self.numel * self.dtype.size_in_bytes()
    }

    /// Borrow as a packed contiguous view.
    pub fn view(&self) -> TensorView {
        unsafe { TensorView::new(self.ptr, self.numel, self.dtype) }
    }
}

impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("ptr", &format_args!("0x{:x}", self.ptr))
            .field("numel", &self.numel)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Drop for DeviceTensor {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.runtime.free(self.ptr) } {
            tracing::warn!(ptr = self.ptr, error = %e, "failed to free device tensor");
        }
    }
}
