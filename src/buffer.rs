// SPDX-License-Identifier: AGPL-3.0-only

//! Device-resident buffers.
//!
//! A [`Buffer`] is a fixed-size block of memory on exactly one [`Device`].
//! Every transfer is bounds-checked on the calling thread and then executed
//! on the device queue, so blocking and asynchronous operations on one
//! device observe submission order.
//!
//! The allocation itself lives in a reference-counted [`DeviceMemory`]
//! guard. Queued jobs hold a clone of the guard, so memory released by
//! dropping a buffer stays valid until the last in-flight job finished, and
//! the backend release plus the accounting update happen exactly once.

use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::device::{Device, MemoryAccounting, MemoryBackend, MemoryHandle, Placement, SyncEvent};
use crate::error::{LatticeError, Result};

/// Shared host staging area filled by one queued job and drained by another.
pub(crate) type Staging = Arc<Mutex<Vec<u8>>>;

/// A byte range inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// First byte.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
}

impl Region {
    /// Region starting at `offset` spanning `len` bytes.
    #[must_use]
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }
}

/// Scoped allocation: released (and un-accounted) when the last owner drops.
pub(crate) struct DeviceMemory {
    memory: Arc<dyn MemoryBackend>,
    accounting: Arc<MemoryAccounting>,
    handle: MemoryHandle,
    bytes: usize,
    placement: Placement,
    device_id: usize,
}

impl DeviceMemory {
    fn allocate(device: &Device, bytes: usize, placement: Placement) -> Result<Arc<Self>> {
        let memory = Arc::clone(device.memory());
        let handle = memory.allocate(device.id(), bytes, placement)?;
        device.accounting().record_alloc(placement, bytes);
        tracing::trace!(
            device = device.id(),
            bytes,
            ?placement,
            handle = handle.0,
            "allocate"
        );
        Ok(Arc::new(Self {
            memory,
            accounting: Arc::clone(device.accounting()),
            handle,
            bytes,
            placement,
            device_id: device.id(),
        }))
    }

    pub(crate) fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.memory.read(self.handle, offset, dst)
    }

    pub(crate) fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.memory.write(self.handle, offset, src)
    }

    /// Whole allocation as `T` elements.
    pub(crate) fn read_all<T: Pod>(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.bytes / std::mem::size_of::<T>()];
        self.read(0, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    pub(crate) fn write_all<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write(0, bytemuck::cast_slice(data))
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        self.memory.release(self.handle);
        self.accounting.record_release(self.placement, self.bytes);
        tracing::trace!(
            device = self.device_id,
            bytes = self.bytes,
            handle = self.handle.0,
            "release"
        );
    }
}

/// Completed or pending device-to-host read.
#[derive(Debug)]
#[must_use = "a readback holds its data until waited on"]
pub struct Readback {
    event: SyncEvent,
    data: Staging,
}

impl Readback {
    /// Completion event, usable as a dependency.
    pub fn event(&self) -> &SyncEvent {
        &self.event
    }

    /// Wait for the transfer and take the bytes.
    ///
    /// # Errors
    ///
    /// Returns the transfer's error.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.event.wait()?;
        let bytes = std::mem::take(&mut *self.data.lock());
        Ok(bytes)
    }
}

/// Fixed-size device memory bound to one [`Device`].
pub struct Buffer {
    device: Device,
    block: Arc<DeviceMemory>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.device.id())
            .field("bytes", &self.block.bytes)
            .field("placement", &self.block.placement)
            .finish()
    }
}

fn check_range(offset: usize, count: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(count) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(LatticeError::Range {
            offset,
            count,
            capacity,
        }),
    }
}

impl Buffer {
    /// Allocate `bytes` device-only bytes, zero-initialized.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Allocation`] if the device is out of memory.
    pub fn new(device: &Device, bytes: usize) -> Result<Self> {
        Self::with_placement(device, bytes, Placement::DeviceOnly)
    }

    /// Allocate with an explicit placement.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Allocation`] if the device is out of memory.
    pub fn with_placement(device: &Device, bytes: usize, placement: Placement) -> Result<Self> {
        Ok(Self {
            device: device.clone(),
            block: DeviceMemory::allocate(device, bytes, placement)?,
        })
    }

    /// Size in bytes; fixed for the buffer's lifetime.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.block.bytes
    }

    /// Owning device.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Host-visible or device-only.
    #[must_use]
    pub fn placement(&self) -> Placement {
        self.block.placement
    }

    pub(crate) fn memory(&self) -> Arc<DeviceMemory> {
        Arc::clone(&self.block)
    }

    // ── Blocking transfers ──────────────────────────────────────────

    /// Write the whole buffer from `host`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if `host` is shorter than the buffer.
    pub fn load(&self, host: &[u8]) -> Result<()> {
        check_range(0, self.bytes(), host.len())?;
        self.load_range(&host[..self.bytes()], 0)
    }

    /// Write `host.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if the range exceeds the buffer.
    pub fn load_range(&self, host: &[u8], offset: usize) -> Result<()> {
        self.load_async(host.to_vec(), offset, &[])?.wait()
    }

    /// Read the whole buffer into `host`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if `host` is shorter than the buffer.
    pub fn dump(&self, host: &mut [u8]) -> Result<()> {
        check_range(0, self.bytes(), host.len())?;
        let bytes = self.bytes();
        self.dump_range(&mut host[..bytes], 0)
    }

    /// Read `host.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if the range exceeds the buffer.
    pub fn dump_range(&self, host: &mut [u8], offset: usize) -> Result<()> {
        let data = self.dump_async(offset, host.len(), &[])?.wait()?;
        host.copy_from_slice(&data);
        Ok(())
    }

    /// Write a typed slice at byte offset 0.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if the slice is larger than the buffer.
    pub fn load_slice<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.load_range(bytemuck::cast_slice(data), 0)
    }

    /// Read the whole buffer as `T` elements.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidArgument`] if the size is not a multiple of `T`.
    pub fn dump_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let size = std::mem::size_of::<T>();
        if size == 0 || self.bytes() % size != 0 {
            return Err(LatticeError::InvalidArgument(format!(
                "{} bytes is not a whole number of {size}-byte elements",
                self.bytes()
            )));
        }
        let mut out = vec![T::zeroed(); self.bytes() / size];
        self.dump(bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    // ── Asynchronous transfers ──────────────────────────────────────

    /// Queue a write of `data` at `offset` after `after`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if the range exceeds the buffer.
    pub fn load_async(&self, data: Vec<u8>, offset: usize, after: &[SyncEvent]) -> Result<SyncEvent> {
        check_range(offset, data.len(), self.bytes())?;
        let block = self.memory();
        Ok(self.device.enqueue(
            "load",
            after,
            Box::new(move || block.write(offset, &data)),
        ))
    }

    /// Queue a read of `count` bytes from `offset` after `after`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if the range exceeds the buffer.
    pub fn dump_async(&self, offset: usize, count: usize, after: &[SyncEvent]) -> Result<Readback> {
        check_range(offset, count, self.bytes())?;
        let block = self.memory();
        let data: Staging = Arc::new(Mutex::new(vec![0u8; count]));
        let sink = Arc::clone(&data);
        let event = self.device.enqueue(
            "dump",
            after,
            Box::new(move || block.read(offset, &mut sink.lock()[..])),
        );
        Ok(Readback { event, data })
    }

    // ── Device-to-device copies ─────────────────────────────────────

    /// Copy the whole of `src` into this buffer.
    ///
    /// # Errors
    ///
    /// [`LatticeError::SizeMismatch`] if the sizes differ.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        self.copy_from_async(src, &[])?.wait()
    }

    /// Queue a whole-buffer copy from `src` after `after`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::SizeMismatch`] if the sizes differ.
    pub fn copy_from_async(&self, src: &Self, after: &[SyncEvent]) -> Result<SyncEvent> {
        if src.bytes() != self.bytes() {
            return Err(LatticeError::SizeMismatch {
                source_bytes: src.bytes(),
                dest_bytes: self.bytes(),
            });
        }
        Ok(self.enqueue_copy(src, 0, 0, self.bytes(), after))
    }

    /// Copy `count` bytes from `src[src_offset..]` to `self[dst_offset..]`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if either range is out of bounds.
    pub fn copy_range(&self, src: &Self, dst_offset: usize, src_offset: usize, count: usize) -> Result<()> {
        check_range(src_offset, count, src.bytes())?;
        check_range(dst_offset, count, self.bytes())?;
        self.enqueue_copy(src, src_offset, dst_offset, count, &[])
            .wait()
    }

    fn enqueue_copy(
        &self,
        src: &Self,
        src_offset: usize,
        dst_offset: usize,
        count: usize,
        after: &[SyncEvent],
    ) -> SyncEvent {
        if src.device.is_same(&self.device) {
            let via_kernel = count == 16
                && src_offset == 0
                && dst_offset == 0
                && self.device.needs_kernel_copy_workaround();
            self.device.count_copy(via_kernel);
            let (from, to) = (src.memory(), self.memory());
            let memory = Arc::clone(self.device.memory());
            return self.device.enqueue(
                "copy",
                after,
                Box::new(move || {
                    if via_kernel {
                        memory.kernel_copy(from.handle, to.handle, count)
                    } else {
                        memory.copy(from.handle, src_offset, to.handle, dst_offset, count)
                    }
                }),
            );
        }

        if src.device.shares_memory_with(&self.device) {
            // One backend: fence the source queue, copy on ours.
            let fence = src.device.enqueue("copy fence", after, Box::new(|| Ok(())));
            self.device.count_copy(false);
            let (from, to) = (src.memory(), self.memory());
            let memory = Arc::clone(self.device.memory());
            return self.device.enqueue(
                "copy",
                &[fence],
                Box::new(move || memory.copy(from.handle, src_offset, to.handle, dst_offset, count)),
            );
        }

        // Separate backends: read on the source queue, write on ours.
        let staging: Staging = Arc::new(Mutex::new(vec![0u8; count]));
        let read = {
            let from = src.memory();
            let sink = Arc::clone(&staging);
            src.device.enqueue(
                "copy read",
                after,
                Box::new(move || from.read(src_offset, &mut sink.lock()[..])),
            )
        };
        let to = self.memory();
        self.device.enqueue(
            "copy write",
            &[read],
            Box::new(move || to.write(dst_offset, &staging.lock()[..])),
        )
    }

    // ── Zeroing and ownership ───────────────────────────────────────

    /// Zero-fill the buffer.
    ///
    /// # Errors
    ///
    /// Backend failure of the fill.
    pub fn clear(&self) -> Result<()> {
        self.clear_async(&[]).wait()
    }

    /// Queue a zero fill after `after`.
    pub fn clear_async(&self, after: &[SyncEvent]) -> SyncEvent {
        let block = self.memory();
        let memory = Arc::clone(self.device.memory());
        self.device.enqueue(
            "clear",
            after,
            Box::new(move || memory.fill_zero(block.handle, 0, block.bytes)),
        )
    }

    /// Move this buffer to `device`, after `after` completed.
    ///
    /// The contents are copied into a fresh allocation on the target and the
    /// old allocation is released once nothing references it. Accounting
    /// moves from the old device to the new one.
    ///
    /// # Errors
    ///
    /// A failed dependency, allocation failure on the target, or transfer
    /// failure. On error the buffer still belongs to its old device.
    pub fn migrate(&mut self, device: &Device, after: &[SyncEvent]) -> Result<()> {
        SyncEvent::wait_all(after)?;
        if device.is_same(&self.device) {
            return Ok(());
        }
        let target = Self::with_placement(device, self.bytes(), self.placement())?;
        target.copy_from(self)?;
        tracing::debug!(
            from = self.device.id(),
            to = device.id(),
            bytes = self.bytes(),
            "migrate buffer"
        );
        *self = target;
        Ok(())
    }

    // ── Region (strided) transfers ──────────────────────────────────

    fn check_regions(&self, regions: &[Region]) -> Result<usize> {
        let mut total = 0;
        for r in regions {
            check_range(r.offset, r.len, self.bytes())?;
            total += r.len;
        }
        Ok(total)
    }

    /// Gather `regions` into one packed host array.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if a region is out of bounds.
    pub fn dump_regions(&self, regions: &[Region]) -> Result<Vec<u8>> {
        let total = self.check_regions(regions)?;
        let staging: Staging = Arc::new(Mutex::new(vec![0u8; total]));
        self.dump_regions_into(regions, Arc::clone(&staging), &[])?
            .wait()?;
        let out = std::mem::take(&mut *staging.lock());
        Ok(out)
    }

    /// Scatter a packed host array into `regions`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Range`] if a region is out of bounds or `data` has
    /// the wrong length.
    pub fn load_regions(&self, regions: &[Region], data: &[u8]) -> Result<()> {
        let total = self.check_regions(regions)?;
        check_range(0, total, data.len())?;
        let staging: Staging = Arc::new(Mutex::new(data[..total].to_vec()));
        self.load_regions_from(regions, staging, &[])?.wait()
    }

    pub(crate) fn dump_regions_into(
        &self,
        regions: &[Region],
        staging: Staging,
        after: &[SyncEvent],
    ) -> Result<SyncEvent> {
        let total = self.check_regions(regions)?;
        let block = self.memory();
        let regions = regions.to_vec();
        Ok(self.device.enqueue(
            "dump regions",
            after,
            Box::new(move || {
                let mut dst = staging.lock();
                if dst.len() != total {
                    dst.resize(total, 0);
                }
                let mut at = 0;
                for r in &regions {
                    block.read(r.offset, &mut dst[at..at + r.len])?;
                    at += r.len;
                }
                Ok(())
            }),
        ))
    }

    pub(crate) fn load_regions_from(
        &self,
        regions: &[Region],
        staging: Staging,
        after: &[SyncEvent],
    ) -> Result<SyncEvent> {
        let total = self.check_regions(regions)?;
        let block = self.memory();
        let regions = regions.to_vec();
        Ok(self.device.enqueue(
            "load regions",
            after,
            Box::new(move || {
                let src = staging.lock();
                if src.len() < total {
                    return Err(LatticeError::backend(
                        "load regions",
                        format!("staging holds {} of {total} bytes", src.len()),
                    ));
                }
                let mut at = 0;
                for r in &regions {
                    block.write(r.offset, &src[at..at + r.len])?;
                    at += r.len;
                }
                Ok(())
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCaps;

    fn device(id: usize) -> Device {
        Device::host(id, DeviceCaps::default()).expect("host device")
    }

    #[test]
    fn load_dump_round_trip() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 64).expect("alloc");
        let data: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37)).collect();
        buf.load(&data).expect("load");
        let mut back = vec![0u8; 64];
        buf.dump(&mut back).expect("dump");
        assert_eq!(back, data);
    }

    #[test]
    fn partial_load_touches_only_its_range() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 32).expect("alloc");
        buf.load(&[0xAAu8; 32]).expect("fill");
        buf.load_range(&[1u8, 2, 3, 4], 10).expect("partial load");
        let all = buf.dump_vec::<u8>().expect("dump");
        assert!(all[..10].iter().all(|&b| b == 0xAA));
        assert_eq!(&all[10..14], &[1, 2, 3, 4]);
        assert!(all[14..].iter().all(|&b| b == 0xAA));

        let mut host = [0x55u8; 8];
        buf.dump_range(&mut host[2..6], 10).expect("partial dump");
        assert_eq!(host, [0x55, 0x55, 1, 2, 3, 4, 0x55, 0x55]);
    }

    #[test]
    fn load_rejects_short_host_slice() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 32).expect("alloc");
        let err = buf.load(&[0u8; 16]).expect_err("short");
        assert!(matches!(err, LatticeError::Range { .. }));
    }

    #[test]
    fn range_error_on_overflowing_offset() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 32).expect("alloc");
        let err = buf.load_range(&[1u8; 8], 28).expect_err("overflow");
        assert_eq!(
            err,
            LatticeError::Range {
                offset: 28,
                count: 8,
                capacity: 32
            }
        );
        let mut out = [0u8; 4];
        assert!(buf.dump_range(&mut out, usize::MAX).is_err());
    }

    #[test]
    fn typed_round_trip() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 5 * 8).expect("alloc");
        let values = [1.5f64, -2.0, 3.25, 0.0, 1e-300];
        buf.load_slice(&values).expect("load");
        let back: Vec<f64> = buf.dump_vec().expect("dump");
        assert_eq!(back, values);
        assert!(buf.dump_vec::<[u8; 3]>().is_err());
    }

    #[test]
    fn clear_zeroes() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 16).expect("alloc");
        buf.load(&[0xff; 16]).expect("load");
        buf.clear().expect("clear");
        let back: Vec<u8> = buf.dump_vec().expect("dump");
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn drop_releases_accounting_once() {
        let dev = device(0);
        {
            let _a = Buffer::new(&dev, 100).expect("a");
            let _b = Buffer::with_placement(&dev, 28, Placement::HostVisible).expect("b");
            let usage = dev.memory_usage();
            assert_eq!(usage.device_bytes, 100);
            assert_eq!(usage.host_bytes, 28);
            assert_eq!(usage.live_allocations, 2);
        }
        let usage = dev.memory_usage();
        assert_eq!(usage.total_bytes(), 0);
        assert_eq!(usage.live_allocations, 0);
        assert_eq!(usage.total_allocations, 2);
    }

    #[test]
    fn region_gather_scatter() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 16).expect("alloc");
        buf.load(&(0..16u8).collect::<Vec<_>>()).expect("load");
        let regions = [Region::new(2, 3), Region::new(10, 2)];
        let packed = buf.dump_regions(&regions).expect("gather");
        assert_eq!(packed, vec![2, 3, 4, 10, 11]);

        let other = Buffer::new(&dev, 16).expect("other");
        other.load_regions(&regions, &packed).expect("scatter");
        let back: Vec<u8> = other.dump_vec().expect("dump");
        assert_eq!(back[2..5], [2, 3, 4]);
        assert_eq!(back[10..12], [10, 11]);
        assert_eq!(back.iter().filter(|&&b| b != 0).count(), 5);
    }

    #[test]
    fn async_chain_on_one_device() {
        let dev = device(0);
        let buf = Buffer::new(&dev, 8).expect("alloc");
        let ev = buf.load_async(vec![7u8; 8], 0, &[]).expect("load");
        let rb = buf.dump_async(0, 8, &[ev]).expect("dump");
        assert_eq!(rb.wait().expect("data"), vec![7u8; 8]);
    }
}
