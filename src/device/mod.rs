// SPDX-License-Identifier: AGPL-3.0-only

//! Compute devices: execution queue, allocation accounting, layout
//! preference and capability flags.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`Device`] | cheap-to-clone handle; one in-order queue per device |
//! | [`SyncEvent`] | completion handle of a queued operation |
//! | [`MemoryBackend`] | storage primitives (host or wgpu) |
//! | [`MemoryAccounting`] | live bytes, split host-visible vs device-only |
//!
//! A device owns no field data. Buffers hold a device handle and the queue
//! worker holds none, so dropping the last buffer and device handle shuts the
//! worker down cleanly.

pub mod event;
pub mod memory;
mod queue;

#[cfg(feature = "gpu")]
pub mod wgpu_backend;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub use event::SyncEvent;
pub use memory::{HostMemory, MemoryBackend, MemoryHandle, Placement};
pub use queue::Work;

use crate::error::Result;
use queue::ExecQueue;

/// Element layout for composite per-site data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Layout {
    /// Array of structures: all components of one site are contiguous.
    #[default]
    Aos,
    /// Structure of arrays: one contiguous run per component.
    Soa,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aos => write!(f, "AOS"),
            Self::Soa => write!(f, "SOA"),
        }
    }
}

/// Static capabilities of a device.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DeviceCaps {
    /// Layout the device's kernels prefer for multi-component site data.
    pub preferred_layout: Layout,
    /// The native copy primitive is unreliable for 16-byte copies; route
    /// them through a copy kernel.
    pub needs_kernel_copy_workaround: bool,
    /// Memory limit in bytes (`None` = unlimited).
    pub capacity_bytes: Option<usize>,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            preferred_layout: Layout::Aos,
            needs_kernel_copy_workaround: false,
            capacity_bytes: None,
        }
    }
}

/// Live allocation bookkeeping for one device.
#[derive(Debug, Default)]
pub struct MemoryAccounting {
    host_bytes: AtomicUsize,
    device_bytes: AtomicUsize,
    live_allocations: AtomicUsize,
    total_allocations: AtomicU64,
}

/// Point-in-time copy of [`MemoryAccounting`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct MemoryUsage {
    /// Bytes in host-visible allocations.
    pub host_bytes: usize,
    /// Bytes in device-only allocations.
    pub device_bytes: usize,
    /// Allocations not yet released.
    pub live_allocations: usize,
    /// Allocations made over the device lifetime.
    pub total_allocations: u64,
}

impl MemoryUsage {
    /// Host plus device bytes.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.host_bytes + self.device_bytes
    }
}

impl MemoryAccounting {
    fn counter(&self, placement: Placement) -> &AtomicUsize {
        match placement {
            Placement::HostVisible => &self.host_bytes,
            Placement::DeviceOnly => &self.device_bytes,
        }
    }

    pub(crate) fn record_alloc(&self, placement: Placement, bytes: usize) {
        self.counter(placement).fetch_add(bytes, Ordering::AcqRel);
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self, placement: Placement, bytes: usize) {
        self.counter(placement).fetch_sub(bytes, Ordering::AcqRel);
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current usage.
    #[must_use]
    pub fn snapshot(&self) -> MemoryUsage {
        MemoryUsage {
            host_bytes: self.host_bytes.load(Ordering::Acquire),
            device_bytes: self.device_bytes.load(Ordering::Acquire),
            live_allocations: self.live_allocations.load(Ordering::Acquire),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct DeviceCounters {
    kernel_copies: AtomicU64,
    native_copies: AtomicU64,
}

struct DeviceInner {
    id: usize,
    name: String,
    caps: DeviceCaps,
    memory: Arc<dyn MemoryBackend>,
    accounting: Arc<MemoryAccounting>,
    counters: DeviceCounters,
    queue: ExecQueue,
}

/// Handle to one compute device. Clones share the queue and accounting.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("backend", &self.inner.memory.name())
            .field("caps", &self.inner.caps)
            .finish()
    }
}

impl Device {
    /// Device backed by process memory.
    ///
    /// # Errors
    ///
    /// Fails if the queue worker thread cannot be spawned.
    pub fn host(id: usize, caps: DeviceCaps) -> Result<Self> {
        let memory: Arc<dyn MemoryBackend> = Arc::new(HostMemory::with_capacity(caps.capacity_bytes));
        Self::with_backend(id, format!("host-{id}"), caps, memory)
    }

    /// `count` host devices sharing the same capabilities.
    ///
    /// # Errors
    ///
    /// Fails if a queue worker thread cannot be spawned.
    pub fn host_set(count: usize, caps: &DeviceCaps) -> Result<Vec<Self>> {
        (0..count).map(|id| Self::host(id, caps.clone())).collect()
    }

    /// Device over an arbitrary memory backend.
    ///
    /// # Errors
    ///
    /// Fails if the queue worker thread cannot be spawned.
    pub fn with_backend(
        id: usize,
        name: String,
        caps: DeviceCaps,
        memory: Arc<dyn MemoryBackend>,
    ) -> Result<Self> {
        let queue = ExecQueue::spawn(&name)?;
        tracing::debug!(
            device = id,
            %name,
            backend = memory.name(),
            layout = %caps.preferred_layout,
            kernel_copy = caps.needs_kernel_copy_workaround,
            "device online"
        );
        Ok(Self {
            inner: Arc::new(DeviceInner {
                id,
                name,
                caps,
                memory,
                accounting: Arc::new(MemoryAccounting::default()),
                counters: DeviceCounters::default(),
                queue,
            }),
        })
    }

    /// Device index within its set.
    #[must_use]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Capability flags.
    #[must_use]
    pub fn caps(&self) -> &DeviceCaps {
        &self.inner.caps
    }

    /// Preferred element layout.
    #[must_use]
    pub fn preferred_layout(&self) -> Layout {
        self.inner.caps.preferred_layout
    }

    /// Whether 16-byte copies must go through the copy kernel.
    #[must_use]
    pub fn needs_kernel_copy_workaround(&self) -> bool {
        self.inner.caps.needs_kernel_copy_workaround
    }

    /// Current allocation accounting.
    #[must_use]
    pub fn memory_usage(&self) -> MemoryUsage {
        self.inner.accounting.snapshot()
    }

    /// Number of copies executed by the copy kernel / native primitive.
    #[must_use]
    pub fn copy_counts(&self) -> (u64, u64) {
        (
            self.inner.counters.kernel_copies.load(Ordering::Relaxed),
            self.inner.counters.native_copies.load(Ordering::Relaxed),
        )
    }

    /// Whether both handles refer to the same device.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether both devices allocate from the same backend instance.
    #[must_use]
    pub fn shares_memory_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.memory, &other.inner.memory)
    }

    pub(crate) fn memory(&self) -> &Arc<dyn MemoryBackend> {
        &self.inner.memory
    }

    pub(crate) fn accounting(&self) -> &Arc<MemoryAccounting> {
        &self.inner.accounting
    }

    pub(crate) fn count_copy(&self, via_kernel: bool) {
        let counter = if via_kernel {
            &self.inner.counters.kernel_copies
        } else {
            &self.inner.counters.native_copies
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue `work` after `deps`; returns without waiting.
    pub fn enqueue(&self, label: &'static str, deps: &[SyncEvent], work: Work) -> SyncEvent {
        self.inner.queue.submit(label, deps, work)
    }

    /// Block until everything queued so far has run.
    ///
    /// # Errors
    ///
    /// Returns the error of the barrier job if the queue is closed.
    pub fn synchronize(&self) -> Result<()> {
        self.enqueue("synchronize", &[], Box::new(|| Ok(()))).wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_device_defaults() {
        let dev = Device::host(2, DeviceCaps::default()).expect("device");
        assert_eq!(dev.id(), 2);
        assert_eq!(dev.name(), "host-2");
        assert_eq!(dev.preferred_layout(), Layout::Aos);
        assert!(!dev.needs_kernel_copy_workaround());
        assert_eq!(dev.memory_usage(), MemoryUsage::default());
    }

    #[test]
    fn accounting_splits_placements() {
        let acc = MemoryAccounting::default();
        acc.record_alloc(Placement::HostVisible, 64);
        acc.record_alloc(Placement::DeviceOnly, 128);
        let usage = acc.snapshot();
        assert_eq!(usage.host_bytes, 64);
        assert_eq!(usage.device_bytes, 128);
        assert_eq!(usage.total_bytes(), 192);
        assert_eq!(usage.live_allocations, 2);
        acc.record_release(Placement::DeviceOnly, 128);
        let usage = acc.snapshot();
        assert_eq!(usage.device_bytes, 0);
        assert_eq!(usage.live_allocations, 1);
        assert_eq!(usage.total_allocations, 2);
    }

    #[test]
    fn synchronize_drains_queue() {
        let dev = Device::host(0, DeviceCaps::default()).expect("device");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let hits = Arc::clone(&hits);
            let _ = dev.enqueue(
                "bump",
                &[],
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }
        dev.synchronize().expect("sync");
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn identity_and_sharing() {
        let a = Device::host(0, DeviceCaps::default()).expect("a");
        let b = Device::host(1, DeviceCaps::default()).expect("b");
        assert!(a.is_same(&a.clone()));
        assert!(!a.is_same(&b));
        assert!(!a.shares_memory_with(&b));
    }
}
