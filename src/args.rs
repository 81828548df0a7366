//! Positional kernel argument binding.
//!
//! Every kernel takes one fixed-order argument list at `@group(0)`; the
//! binder appends buffers in call order and materializes the bind group
//! from the pipeline's own layout. Texture slots are filled from the
//! registry, with the null sentinel standing in for absent textures.

use bytemuck::Pod;
use wgpu::util::DeviceExt;

use crate::buffers::BufferRegistry;
use crate::kernel_params::TEXTURE_NAMES;

/// Ordered argument list for one kernel launch.
pub struct KernelArgList<'a> {
    entries: Vec<&'a wgpu::Buffer>,
}

impl<'a> KernelArgList<'a> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append one buffer argument at the next binding slot.
    pub fn buffer(&mut self, buffer: &'a wgpu::Buffer) -> &mut Self {
        self.entries.push(buffer);
        self
    }

    /// Append one texture slot, substituting the sentinel when the texture
    /// was never allocated.
    pub fn texture(&mut self, registry: &'a BufferRegistry, name: &str) -> &mut Self {
        match registry.texture(name) {
            Some(buffer) => self.entries.push(buffer),
            None => self.entries.push(registry.null_sentinel()),
        }
        self
    }

    /// Append the whole global texture table in declaration order.
    pub fn all_textures(&mut self, registry: &'a BufferRegistry) -> &mut Self {
        for name in TEXTURE_NAMES {
            self.texture(registry, name);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the bind group against the pipeline's group-0 layout.
    pub fn bind(
        &self,
        device: &wgpu::Device,
        pipeline: &wgpu::ComputePipeline,
        label: &str,
    ) -> wgpu::BindGroup {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        })
    }
}

impl<'a> Default for KernelArgList<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Upload one POD scalar block as the uniform tail of an argument list.
pub fn scalar_uniform<T: Pod>(device: &wgpu::Device, label: &str, value: &T) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(value),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}
