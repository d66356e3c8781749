// SPDX-License-Identifier: AGPL-3.0-only

//! wgpu storage backend (`gpu` feature).
//!
//! Every device gets its own `wgpu::Device` and queue. Storage, uploads,
//! readbacks, native copies and zero fills map onto wgpu buffer commands;
//! the 16-byte copy workaround runs a small WGSL copy kernel. Field kernels
//! still execute on the host executor.
//!
//! Adapter selection: `LATTICE_GPU_ADAPTER` (index or case-insensitive name
//! substring) restricts the pool to one adapter, otherwise all adapters with
//! `SHADER_F64` are used, discrete GPUs first. `LATTICE_WGPU_BACKEND`
//! (`vulkan`, `metal`, `dx12`) restricts the wgpu backend.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::memory::{MemoryBackend, MemoryHandle, Placement};
use super::{Device, DeviceCaps};
use crate::error::{LatticeError, Result};

/// Adapter selector variable.
pub const ADAPTER_ENV: &str = "LATTICE_GPU_ADAPTER";

/// wgpu backend selector variable.
pub const BACKEND_ENV: &str = "LATTICE_WGPU_BACKEND";

const COPY_WORKGROUP: u32 = 64;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

const COPY_SHADER: &str = r"
@group(0) @binding(0) var<storage, read> src: array<vec4<u32>>;
@group(0) @binding(1) var<storage, read_write> dst: array<vec4<u32>>;

@compute @workgroup_size(64)
fn main(
    @builtin(global_invocation_id) id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = id.x + id.y * groups.x * 64u;
    if (i < arrayLength(&dst)) {
        dst[i] = src[i];
    }
}
";

fn instance() -> wgpu::Instance {
    let backends = match std::env::var(BACKEND_ENV).as_deref() {
        Ok("vulkan") => wgpu::Backends::VULKAN,
        Ok("metal") => wgpu::Backends::METAL,
        Ok("dx12") => wgpu::Backends::DX12,
        _ => wgpu::Backends::all(),
    };
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    })
}

fn device_rank(ty: wgpu::DeviceType) -> u8 {
    match ty {
        wgpu::DeviceType::DiscreteGpu => 0,
        wgpu::DeviceType::IntegratedGpu => 1,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Other => 3,
        wgpu::DeviceType::Cpu => 4,
    }
}

/// Adapters to place devices on, in preference order.
fn select_adapters(instance: &wgpu::Instance) -> Result<Vec<wgpu::Adapter>> {
    let mut adapters = instance.enumerate_adapters(wgpu::Backends::all());
    if let Ok(selector) = std::env::var(ADAPTER_ENV) {
        let selector = selector.trim().to_ascii_lowercase();
        let picked = match selector.parse::<usize>() {
            Ok(idx) if idx < adapters.len() => Some(adapters.swap_remove(idx)),
            _ => adapters
                .into_iter()
                .find(|a| a.get_info().name.to_ascii_lowercase().contains(&selector)),
        };
        return picked.map(|a| vec![a]).ok_or_else(|| {
            LatticeError::backend("select adapter", format!("no adapter matching '{selector}'"))
        });
    }
    adapters.retain(|a| a.features().contains(wgpu::Features::SHADER_F64));
    adapters.sort_by_key(|a| device_rank(a.get_info().device_type));
    if adapters.is_empty() {
        return Err(LatticeError::backend(
            "select adapter",
            "no adapter with SHADER_F64 found",
        ));
    }
    Ok(adapters)
}

#[derive(Debug)]
struct Allocation {
    buffer: Arc<wgpu::Buffer>,
    len: usize,
}

/// Storage backend over one wgpu device.
#[derive(Debug)]
pub struct WgpuMemory {
    adapter: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    copy_pipeline: wgpu::ComputePipeline,
    buffers: Mutex<HashMap<MemoryHandle, Allocation>>,
    next_handle: AtomicU64,
    capacity: Option<usize>,
    in_use: AtomicUsize,
}

impl WgpuMemory {
    async fn open(adapter: &wgpu::Adapter, capacity: Option<usize>) -> Result<Self> {
        let info = adapter.get_info();
        let mut required_features = wgpu::Features::empty();
        if adapter.features().contains(wgpu::Features::SHADER_F64) {
            required_features |= wgpu::Features::SHADER_F64;
        }
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("lattice-offload device"),
                    required_features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| LatticeError::backend("request device", e))?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("copy16"),
            source: wgpu::ShaderSource::Wgsl(COPY_SHADER.into()),
        });
        let copy_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("copy16"),
            layout: None,
            module: &module,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        Ok(Self {
            adapter: info.name,
            device,
            queue,
            copy_pipeline,
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            capacity,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Adapter name as reported by the driver.
    #[must_use]
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    fn buffer(&self, handle: MemoryHandle, op: &str) -> Result<(Arc<wgpu::Buffer>, usize)> {
        self.buffers
            .lock()
            .get(&handle)
            .map(|a| (Arc::clone(&a.buffer), a.len))
            .ok_or_else(|| LatticeError::backend(op, format!("unknown memory handle {}", handle.0)))
    }

    fn check(len: usize, offset: usize, count: usize, op: &str) -> Result<()> {
        if offset.checked_add(count).map_or(true, |end| end > len) {
            return Err(LatticeError::backend(
                op,
                format!("range {offset}+{count} outside allocation of {len} bytes"),
            ));
        }
        if offset % 4 != 0 || count % 4 != 0 {
            return Err(LatticeError::backend(
                op,
                format!("range {offset}+{count} not 4-byte aligned"),
            ));
        }
        Ok(())
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }
}

impl MemoryBackend for WgpuMemory {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn allocate(&self, device: usize, bytes: usize, placement: Placement) -> Result<MemoryHandle> {
        if let Some(cap) = self.capacity {
            let used = self.in_use.load(Ordering::Acquire);
            if used + bytes > cap {
                return Err(LatticeError::Allocation {
                    device,
                    requested: bytes,
                    available: cap.saturating_sub(used),
                });
            }
        }
        let size = bytes.max(16).next_multiple_of(16) as u64;
        let label = match placement {
            Placement::HostVisible => "host-visible",
            Placement::DeviceOnly => "device-only",
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let handle = MemoryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.buffers
            .lock()
            .insert(handle, Allocation {
                buffer: Arc::new(buffer),
                len: bytes,
            });
        self.in_use.fetch_add(bytes, Ordering::AcqRel);
        Ok(handle)
    }

    fn release(&self, handle: MemoryHandle) {
        if let Some(a) = self.buffers.lock().remove(&handle) {
            a.buffer.destroy();
            self.in_use.fetch_sub(a.len, Ordering::AcqRel);
        }
    }

    fn write(&self, handle: MemoryHandle, offset: usize, src: &[u8]) -> Result<()> {
        let (buffer, len) = self.buffer(handle, "write")?;
        Self::check(len, offset, src.len(), "write")?;
        self.queue.write_buffer(&buffer, offset as u64, src);
        self.queue.submit(std::iter::empty());
        Ok(())
    }

    fn read(&self, handle: MemoryHandle, offset: usize, dst: &mut [u8]) -> Result<()> {
        let (buffer, len) = self.buffer(handle, "read")?;
        Self::check(len, offset, dst.len(), "read")?;
        if dst.is_empty() {
            return Ok(());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: dst.len() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("readback");
        encoder.copy_buffer_to_buffer(&buffer, offset as u64, &staging, 0, dst.len() as u64);
        self.submit(encoder);

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| LatticeError::backend("read", "map callback channel closed"))?
            .map_err(|e| LatticeError::backend("read", e))?;
        {
            let mapped = slice.get_mapped_range();
            dst.copy_from_slice(&mapped);
        }
        staging.unmap();
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
        let (from, from_len) = self.buffer(src, "copy")?;
        let (to, to_len) = self.buffer(dst, "copy")?;
        Self::check(from_len, src_offset, bytes, "copy")?;
        Self::check(to_len, dst_offset, bytes, "copy")?;
        let mut encoder = self.encoder("copy");
        encoder.copy_buffer_to_buffer(
            &from,
            src_offset as u64,
            &to,
            dst_offset as u64,
            bytes as u64,
        );
        self.submit(encoder);
        Ok(())
    }

    fn kernel_copy(&self, src: MemoryHandle, dst: MemoryHandle, bytes: usize) -> Result<()> {
        if src == dst {
            return Err(LatticeError::backend("kernel copy", "source and destination alias"));
        }
        let (from, from_len) = self.buffer(src, "kernel copy")?;
        let (to, to_len) = self.buffer(dst, "kernel copy")?;
        Self::check(from_len, 0, bytes, "kernel copy")?;
        Self::check(to_len, 0, bytes, "kernel copy")?;
        if bytes % 16 != 0 {
            return Err(LatticeError::backend(
                "kernel copy",
                format!("{bytes} bytes is not a whole number of 16-byte elements"),
            ));
        }
        let Some(size) = NonZeroU64::new(bytes as u64) else {
            return Ok(());
        };
        let layout = self.copy_pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("copy16"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &from,
                        offset: 0,
                        size: Some(size),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &to,
                        offset: 0,
                        size: Some(size),
                    }),
                },
            ],
        });
        let elements = u32::try_from(bytes / 16)
            .map_err(|_| LatticeError::backend("kernel copy", "copy too large"))?;
        let groups = elements.div_ceil(COPY_WORKGROUP);
        let (gx, gy) = if groups > MAX_GROUPS_PER_DIM {
            (MAX_GROUPS_PER_DIM, groups.div_ceil(MAX_GROUPS_PER_DIM))
        } else {
            (groups, 1)
        };
        let mut encoder = self.encoder("copy16");
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("copy16"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.copy_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gx, gy, 1);
        }
        self.submit(encoder);
        Ok(())
    }

    fn fill_zero(&self, handle: MemoryHandle, offset: usize, bytes: usize) -> Result<()> {
        let (buffer, len) = self.buffer(handle, "fill zero")?;
        Self::check(len, offset, bytes, "fill zero")?;
        let mut encoder = self.encoder("fill zero");
        encoder.clear_buffer(&buffer, offset as u64, Some(bytes as u64));
        self.submit(encoder);
        Ok(())
    }
}

/// Open `count` devices on the available GPU adapters, round-robin when
/// there are fewer adapters than devices.
///
/// # Errors
///
/// [`LatticeError::Backend`] if no suitable adapter exists or a device
/// cannot be created.
pub fn open_devices(count: usize, caps: &DeviceCaps) -> Result<Vec<Device>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|e| LatticeError::backend("tokio runtime", e))?;
    let instance = instance();
    let adapters = select_adapters(&instance)?;
    (0..count)
        .map(|id| {
            let adapter = &adapters[id % adapters.len()];
            let memory = runtime.block_on(WgpuMemory::open(adapter, caps.capacity_bytes))?;
            let name = format!("wgpu-{id}:{}", memory.adapter());
            tracing::info!(device = id, adapter = memory.adapter(), "opened wgpu device");
            let memory: Arc<dyn MemoryBackend> = Arc::new(memory);
            Device::with_backend(id, name, caps.clone(), memory)
        })
        .collect()
}
