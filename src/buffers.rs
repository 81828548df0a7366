//! Device buffer allocation, blocking transfers and the named registry for
//! textures and constants.
//!
//! All transfers are issue-order safe against kernel launches because every
//! command goes through the single in-order queue owned by the device
//! worker. Reads block on a staging buffer map.

use std::collections::HashMap;
use std::sync::Arc;

use futures_intrusive::channel::shared::oneshot_channel;

use crate::error::{DriverError, DriverResult};
use crate::gpu::GpuContext;
use crate::kernel_params::TEXTURE_NAMES;
use crate::stats::MemoryStats;

/// Access pattern for a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemoryKind {
    fn usage(self) -> wgpu::BufferUsages {
        match self {
            MemoryKind::ReadOnly => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            MemoryKind::WriteOnly => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            MemoryKind::ReadWrite => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
        }
    }
}

/// One tracked device allocation.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    pub buffer: Arc<wgpu::Buffer>,
    pub size: u64,
}

fn align_buffer_size(size: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    size.div_ceil(align) * align
}

/// Allocate a device buffer and account it.
pub fn mem_alloc(
    ctx: &GpuContext,
    stats: &MemoryStats,
    label: &str,
    size: u64,
    kind: MemoryKind,
) -> DriverResult<DeviceBuffer> {
    let padded = align_buffer_size(size.max(4));

    ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: padded,
        usage: kind.usage(),
        mapped_at_creation: false,
    });
    if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
        let err = DriverError::BufferAllocation(format!("{label} ({padded} bytes): {err}"));
        debug_assert!(false, "{err}");
        return Err(err);
    }

    stats.mem_alloc(padded);
    Ok(DeviceBuffer {
        buffer: Arc::new(buffer),
        size: padded,
    })
}

/// Blocking write of the full host copy into the device buffer.
pub fn mem_copy_to(ctx: &GpuContext, mem: &DeviceBuffer, data: &[u8]) {
    ctx.queue.write_buffer(&mem.buffer, 0, data);
    ctx.queue.submit(std::iter::empty());
}

/// Blocking read of a rectangular region: rows `[y, y+h)` of a `w`-wide
/// buffer with `elem` bytes per element, written back at the same offset
/// in `dst`.
pub fn mem_copy_from(
    ctx: &GpuContext,
    mem: &DeviceBuffer,
    y: i32,
    w: i32,
    h: i32,
    elem: i32,
    dst: &mut [u8],
) -> DriverResult<()> {
    let offset = (elem as u64) * (y as u64) * (w as u64);
    let size = (elem as u64) * (w as u64) * (h as u64);
    if offset + size > dst.len() as u64 {
        return Err(DriverError::MemoryTransfer(format!(
            "host buffer too small for {w}x{h} readback at row {y}"
        )));
    }
    let data = read_buffer(ctx, &mem.buffer, offset, size)?;
    dst[offset as usize..(offset + size) as usize].copy_from_slice(&data);
    Ok(())
}

/// Blocking readback of `size` bytes at `offset` through a staging buffer.
pub fn read_buffer(
    ctx: &GpuContext,
    buffer: &wgpu::Buffer,
    offset: u64,
    size: u64,
) -> DriverResult<Vec<u8>> {
    let padded = align_buffer_size(size);
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("cinder3d-readback-staging"),
        size: padded,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("cinder3d-readback-encoder"),
        });
    encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, padded);
    ctx.queue.submit(std::iter::once(encoder.finish()));
    ctx.device.poll(wgpu::Maintain::Wait);

    let slice = staging.slice(..);
    let (sender, receiver) = oneshot_channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    ctx.device.poll(wgpu::Maintain::Wait);

    pollster::block_on(receiver.receive())
        .ok_or_else(|| DriverError::ReadbackFailed("map_async callback channel dropped".into()))?
        .map_err(|e| DriverError::ReadbackFailed(e.to_string()))?;

    let data = slice.get_mapped_range();
    let mut out = vec![0u8; size as usize];
    out.copy_from_slice(&data[..size as usize]);
    drop(data);
    staging.unmap();

    Ok(out)
}

/// Zero the device copy by uploading a zeroed host image.
pub fn mem_zero(ctx: &GpuContext, mem: &DeviceBuffer) {
    let zeros = vec![0u8; mem.size as usize];
    mem_copy_to(ctx, mem, &zeros);
}

/// Release a device allocation and account the freed bytes.
pub fn mem_free(stats: &MemoryStats, mem: &mut DeviceBuffer) {
    if mem.size != 0 {
        mem.buffer.destroy();
        stats.mem_free(mem.size);
        mem.size = 0;
    }
}

struct ConstBuffer {
    host: Vec<u8>,
    device: DeviceBuffer,
}

/// Named device allocations: textures bound by the argument loop and
/// constants rewritten in place before each upload.
pub struct BufferRegistry {
    textures: HashMap<String, DeviceBuffer>,
    constants: HashMap<String, ConstBuffer>,
    null_sentinel: wgpu::Buffer,
    stats: Arc<MemoryStats>,
}

impl BufferRegistry {
    pub fn new(ctx: &GpuContext, stats: Arc<MemoryStats>) -> Self {
        // the runtime rejects missing bindings, so absent textures bind this
        let null_sentinel = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cinder3d-null-texture"),
            size: wgpu::COPY_BUFFER_ALIGNMENT,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        Self {
            textures: HashMap::new(),
            constants: HashMap::new(),
            null_sentinel,
            stats,
        }
    }

    pub fn null_sentinel(&self) -> &wgpu::Buffer {
        &self.null_sentinel
    }

    pub fn texture(&self, name: &str) -> Option<&wgpu::Buffer> {
        self.textures.get(name).map(|m| m.buffer.as_ref())
    }

    /// Size of one named texture, zero when absent.
    pub fn texture_size(&self, name: &str) -> u64 {
        self.textures.get(name).map(|m| m.size).unwrap_or(0)
    }

    /// Total bytes across every slot in the global texture table.
    pub fn texture_footprint(&self) -> u64 {
        TEXTURE_NAMES.iter().map(|name| self.texture_size(name)).sum()
    }

    /// Allocate, upload and register a texture under `name`. The returned
    /// handle shares the registered allocation and can later free it by
    /// identity through [`BufferRegistry::tex_free`].
    pub fn tex_alloc(
        &mut self,
        ctx: &GpuContext,
        name: &str,
        data: &[u8],
    ) -> DriverResult<DeviceBuffer> {
        log::debug!("texture allocate: {name}, {} bytes", data.len());
        debug_assert!(!self.textures.contains_key(name));
        let mem = mem_alloc(ctx, &self.stats, name, data.len() as u64, MemoryKind::ReadOnly)?;
        mem_copy_to(ctx, &mem, data);
        self.textures.insert(name.to_string(), mem.clone());
        Ok(mem)
    }

    /// Remove a texture by its buffer identity and free it.
    pub fn tex_free(&mut self, id: wgpu::Id<wgpu::Buffer>) {
        let found = self
            .textures
            .iter()
            .find(|(_, mem)| mem.buffer.global_id() == id)
            .map(|(name, _)| name.clone());
        if let Some(name) = found {
            if let Some(mut mem) = self.textures.remove(&name) {
                mem_free(&self.stats, &mut mem);
            }
        }
    }

    /// Upload a named constant, allocating on first use and rewriting the
    /// host copy on every later call.
    pub fn const_copy_to(&mut self, ctx: &GpuContext, name: &str, data: &[u8]) -> DriverResult<()> {
        if !self.constants.contains_key(name) {
            let device = mem_alloc(
                ctx,
                &self.stats,
                name,
                data.len() as u64,
                MemoryKind::ReadOnly,
            )?;
            self.constants.insert(
                name.to_string(),
                ConstBuffer {
                    host: data.to_vec(),
                    device,
                },
            );
        } else if let Some(entry) = self.constants.get_mut(name) {
            entry.host.clear();
            entry.host.extend_from_slice(data);
        }

        let entry = self
            .constants
            .get(name)
            .ok_or_else(|| DriverError::MemoryTransfer(format!("constant {name} vanished")))?;
        mem_copy_to(ctx, &entry.device, &entry.host);
        Ok(())
    }

    pub fn constant(&self, name: &str) -> Option<&wgpu::Buffer> {
        self.constants.get(name).map(|c| c.device.buffer.as_ref())
    }

    /// Shared handle to a constant, for launch loops that outlive the
    /// registry borrow.
    pub fn constant_arc(&self, name: &str) -> Option<Arc<wgpu::Buffer>> {
        self.constants.get(name).map(|c| c.device.buffer.clone())
    }

    pub fn constant_size(&self, name: &str) -> u64 {
        self.constants.get(name).map(|c| c.device.size).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_are_copy_aligned() {
        assert_eq!(align_buffer_size(1), 4);
        assert_eq!(align_buffer_size(4), 4);
        assert_eq!(align_buffer_size(5), 8);
        assert_eq!(align_buffer_size(1024), 1024);
    }

    #[test]
    fn memory_kind_usages() {
        assert!(MemoryKind::ReadOnly.usage().contains(wgpu::BufferUsages::COPY_DST));
        assert!(!MemoryKind::ReadOnly.usage().contains(wgpu::BufferUsages::COPY_SRC));
        assert!(MemoryKind::WriteOnly.usage().contains(wgpu::BufferUsages::COPY_SRC));
        assert!(MemoryKind::ReadWrite.usage().contains(wgpu::BufferUsages::COPY_DST));
        assert!(MemoryKind::ReadWrite.usage().contains(wgpu::BufferUsages::COPY_SRC));
    }
}
