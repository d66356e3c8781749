// SPDX-License-Identifier: AGPL-3.0-only

//! Memory backends: the raw storage primitives a device executes its queue
//! against.
//!
//! [`HostMemory`] keeps every allocation in process memory and is the
//! default backend; it also serves as the fallback executor for field
//! kernels on accelerator backends, which only provide storage and copies.
//! The optional `gpu` feature adds a wgpu-backed implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{LatticeError, Result};

/// Opaque handle to one allocation inside a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub u64);

/// Where an allocation lives, for accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Placement {
    /// Host-visible (mappable / pinned) memory.
    HostVisible,
    /// Device-only memory.
    DeviceOnly,
}

/// Storage primitives required from an execution backend.
///
/// Offsets and lengths are validated by [`crate::buffer::Buffer`] before a
/// call reaches the backend; implementations still report out-of-range
/// access as [`LatticeError::Backend`].
pub trait MemoryBackend: Send + Sync + std::fmt::Debug {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Allocate `bytes` zero-initialized bytes.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Allocation`] when the backend is out of memory.
    fn allocate(&self, device: usize, bytes: usize, placement: Placement) -> Result<MemoryHandle>;

    /// Return an allocation. Unknown handles are ignored.
    fn release(&self, handle: MemoryHandle);

    /// Write `src` at `offset`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Backend`] on an invalid handle or range.
    fn write(&self, handle: MemoryHandle, offset: usize, src: &[u8]) -> Result<()>;

    /// Read `dst.len()` bytes from `offset`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Backend`] on an invalid handle or range.
    fn read(&self, handle: MemoryHandle, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Native copy between two allocations of this backend.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Backend`] on an invalid handle or range.
    fn copy(
        &self,
        src: MemoryHandle,
        src_offset: usize,
        dst: MemoryHandle,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()>;

    /// Copy through a compute kernel instead of the native copy primitive.
    ///
    /// Used for the 16-byte copies that some device families mishandle.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Backend`] on an invalid handle or range.
    fn kernel_copy(&self, src: MemoryHandle, dst: MemoryHandle, bytes: usize) -> Result<()>;

    /// Zero `bytes` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Backend`] on an invalid handle or range.
    fn fill_zero(&self, handle: MemoryHandle, offset: usize, bytes: usize) -> Result<()>;
}

/// Process-memory backend with an optional capacity limit.
#[derive(Debug)]
pub struct HostMemory {
    blocks: Mutex<HashMap<MemoryHandle, Vec<u8>>>,
    next_handle: AtomicU64,
    capacity: Option<usize>,
    in_use: AtomicUsize,
}

impl HostMemory {
    /// Unlimited host backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Host backend refusing allocations beyond `capacity` bytes in total.
    #[must_use]
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    fn check(len: usize, offset: usize, count: usize, op: &str) -> Result<()> {
        if offset.checked_add(count).map_or(true, |end| end > len) {
            return Err(LatticeError::backend(
                op,
                format!("range {offset}+{count} outside allocation of {len} bytes"),
            ));
        }
        Ok(())
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(op: &str, handle: MemoryHandle) -> LatticeError {
    LatticeError::backend(op, format!("unknown memory handle {}", handle.0))
}

impl MemoryBackend for HostMemory {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate(&self, device: usize, bytes: usize, _placement: Placement) -> Result<MemoryHandle> {
        let cap = self.capacity.unwrap_or(usize::MAX);
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&end| end <= cap)
            })
            .map_err(|used| LatticeError::Allocation {
                device,
                requested: bytes,
                available: cap.saturating_sub(used),
            })?;
        let handle = MemoryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut block = Vec::new();
        if block.try_reserve_exact(bytes).is_err() {
            self.in_use.fetch_sub(bytes, Ordering::AcqRel);
            return Err(LatticeError::backend(
                "allocate",
                format!("host refused {bytes} bytes"),
            ));
        }
        block.resize(bytes, 0u8);
        self.blocks.lock().insert(handle, block);
        Ok(handle)
    }

    fn release(&self, handle: MemoryHandle) {
        if let Some(block) = self.blocks.lock().remove(&handle) {
            self.in_use.fetch_sub(block.len(), Ordering::AcqRel);
        }
    }

    fn write(&self, handle: MemoryHandle, offset: usize, src: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks.get_mut(&handle).ok_or_else(|| unknown("write", handle))?;
        Self::check(block.len(), offset, src.len(), "write")?;
        block[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read(&self, handle: MemoryHandle, offset: usize, dst: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock();
        let block = blocks.get(&handle).ok_or_else(|| unknown("read", handle))?;
        Self::check(block.len(), offset, dst.len(), "read")?;
        dst.copy_from_slice(&block[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy(
        &self,
        src: MemoryHandle,
        src_offset: usize,
        dst: MemoryHandle,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let staged = {
            let block = blocks.get(&src).ok_or_else(|| unknown("copy", src))?;
            Self::check(block.len(), src_offset, bytes, "copy")?;
            block[src_offset..src_offset + bytes].to_vec()
        };
        let block = blocks.get_mut(&dst).ok_or_else(|| unknown("copy", dst))?;
        Self::check(block.len(), dst_offset, bytes, "copy")?;
        block[dst_offset..dst_offset + bytes].copy_from_slice(&staged);
        Ok(())
    }

    fn kernel_copy(&self, src: MemoryHandle, dst: MemoryHandle, bytes: usize) -> Result<()> {
        // Element-wise, as the copy kernel would do it.
        let mut blocks = self.blocks.lock();
        let mut staged = vec![0u8; bytes];
        {
            let block = blocks.get(&src).ok_or_else(|| unknown("kernel copy", src))?;
            Self::check(block.len(), 0, bytes, "kernel copy")?;
            for (d, s) in staged.iter_mut().zip(block.iter()) {
                *d = *s;
            }
        }
        let block = blocks
            .get_mut(&dst)
            .ok_or_else(|| unknown("kernel copy", dst))?;
        Self::check(block.len(), 0, bytes, "kernel copy")?;
        for (d, s) in block.iter_mut().zip(staged) {
            *d = s;
        }
        Ok(())
    }

    fn fill_zero(&self, handle: MemoryHandle, offset: usize, bytes: usize) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(&handle)
            .ok_or_else(|| unknown("fill zero", handle))?;
        Self::check(block.len(), offset, bytes, "fill zero")?;
        block[offset..offset + bytes].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_read() {
        let mem = HostMemory::new();
        let h = mem.allocate(0, 8, Placement::DeviceOnly).expect("alloc");
        mem.write(h, 2, &[1, 2, 3]).expect("write");
        let mut out = [9u8; 8];
        mem.read(h, 0, &mut out).expect("read");
        assert_eq!(out, [0, 0, 1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn capacity_is_enforced_and_restored_by_release() {
        let mem = HostMemory::with_capacity(Some(100));
        let a = mem.allocate(3, 80, Placement::DeviceOnly).expect("fits");
        let err = mem
            .allocate(3, 40, Placement::DeviceOnly)
            .expect_err("over capacity");
        assert_eq!(
            err,
            LatticeError::Allocation {
                device: 3,
                requested: 40,
                available: 20
            }
        );
        mem.release(a);
        mem.allocate(3, 40, Placement::DeviceOnly).expect("fits again");
    }

    #[test]
    fn oversized_request_does_not_overflow_accounting() {
        let mem = HostMemory::with_capacity(Some(64));
        let _a = mem.allocate(1, 32, Placement::DeviceOnly).expect("fits");
        let err = mem
            .allocate(1, usize::MAX, Placement::DeviceOnly)
            .expect_err("huge request");
        assert_eq!(
            err,
            LatticeError::Allocation {
                device: 1,
                requested: usize::MAX,
                available: 32
            }
        );
        assert_eq!(mem.in_use(), 32);
    }

    #[test]
    fn concurrent_allocations_respect_capacity() {
        let mem = std::sync::Arc::new(HostMemory::with_capacity(Some(10 * 64)));
        let granted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    let mem = std::sync::Arc::clone(&mem);
                    scope.spawn(move || usize::from(mem.allocate(0, 64, Placement::DeviceOnly).is_ok()))
                })
                .collect();
            workers.into_iter().map(|w| w.join().expect("worker")).sum()
        });
        assert_eq!(granted, 10);
        assert_eq!(mem.in_use(), 10 * 64);
    }

    #[test]
    fn out_of_range_is_backend_error() {
        let mem = HostMemory::new();
        let h = mem.allocate(0, 4, Placement::HostVisible).expect("alloc");
        let err = mem.write(h, 3, &[1, 2]).expect_err("overflow");
        assert!(matches!(err, LatticeError::Backend { .. }));
    }

    #[test]
    fn native_and_kernel_copy_agree() {
        let mem = HostMemory::new();
        let src = mem.allocate(0, 16, Placement::DeviceOnly).expect("src");
        let a = mem.allocate(0, 16, Placement::DeviceOnly).expect("a");
        let b = mem.allocate(0, 16, Placement::DeviceOnly).expect("b");
        let data: Vec<u8> = (0..16).collect();
        mem.write(src, 0, &data).expect("write");
        mem.copy(src, 0, a, 0, 16).expect("copy");
        mem.kernel_copy(src, b, 16).expect("kernel copy");
        let mut ra = [0u8; 16];
        let mut rb = [0u8; 16];
        mem.read(a, 0, &mut ra).expect("read a");
        mem.read(b, 0, &mut rb).expect("read b");
        assert_eq!(ra, rb);
        assert_eq!(ra.to_vec(), data);
    }
}
