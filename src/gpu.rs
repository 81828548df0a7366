// src/gpu.rs
// Global GPU instance helpers and device discovery
// Exists to share wgpu bootstrapping between the driver, device listing and tests
// RELEVANT FILES: src/device/mod.rs, src/program_cache.rs, src/device_caps.rs

use once_cell::sync::OnceCell;
use std::sync::Arc;

use crate::device_caps;
use crate::error::{DriverError, DriverResult};

/// Fixed platform walk order; the flat device index counts across backends
/// in exactly this order.
pub const PLATFORM_ORDER: [wgpu::Backend; 4] = [
    wgpu::Backend::Vulkan,
    wgpu::Backend::Metal,
    wgpu::Backend::Dx12,
    wgpu::Backend::Gl,
];

/// One cached GPU context: the adapter plus its device/queue pair.
pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: wgpu::AdapterInfo,
}

impl GpuContext {
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }
}

static INSTANCE: OnceCell<wgpu::Instance> = OnceCell::new();

fn backends_from_env() -> wgpu::Backends {
    use std::env;
    if let Ok(s) = env::var("WGPU_BACKENDS").or_else(|_| env::var("WGPU_BACKEND")) {
        let s_l = s.to_lowercase();
        if s_l.contains("metal") {
            return wgpu::Backends::METAL;
        }
        if s_l.contains("vulkan") {
            return wgpu::Backends::VULKAN;
        }
        if s_l.contains("dx12") {
            return wgpu::Backends::DX12;
        }
        if s_l.contains("gl") {
            return wgpu::Backends::GL;
        }
    }
    wgpu::Backends::all()
}

/// Process-wide wgpu instance; discovery and context creation share it.
pub fn instance() -> &'static wgpu::Instance {
    INSTANCE.get_or_init(|| {
        wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: backends_from_env(),
            ..Default::default()
        })
    })
}

/// Device-type filter applied at discovery, from `CINDER3D_DEVICE_TEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTypeFilter {
    All,
    Default,
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceTypeFilter {
    pub fn from_env() -> Self {
        match std::env::var("CINDER3D_DEVICE_TEST").as_deref() {
            Ok("DEFAULT") => Self::Default,
            Ok("CPU") => Self::Cpu,
            Ok("GPU") => Self::Gpu,
            Ok("ACCELERATOR") => Self::Accelerator,
            _ => Self::All,
        }
    }

    pub fn admits(&self, ty: wgpu::DeviceType) -> bool {
        match self {
            Self::All | Self::Default => true,
            Self::Cpu => matches!(ty, wgpu::DeviceType::Cpu),
            Self::Gpu => matches!(
                ty,
                wgpu::DeviceType::DiscreteGpu
                    | wgpu::DeviceType::IntegratedGpu
                    | wgpu::DeviceType::VirtualGpu
            ),
            Self::Accelerator => matches!(ty, wgpu::DeviceType::Other),
        }
    }
}

/// Public identity of one compute device, flat-indexed across platforms.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Flat index across all platforms in `PLATFORM_ORDER`.
    pub num: i32,
    pub id: String,
    pub description: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
    pub display_device: bool,
    pub advanced_shading: bool,
}

/// Result of resolving a flat device index to a concrete adapter.
pub(crate) struct SelectedAdapter {
    pub adapter: wgpu::Adapter,
    pub backend: wgpu::Backend,
    /// Index of the adapter within its platform, after filtering.
    pub index_in_platform: u32,
    pub platform_name: String,
}

fn adapters_for_backend(backend: wgpu::Backend, filter: DeviceTypeFilter) -> Vec<wgpu::Adapter> {
    let mask = wgpu::Backends::from(backend) & backends_from_env();
    if mask.is_empty() {
        return Vec::new();
    }
    instance()
        .enumerate_adapters(mask)
        .into_iter()
        .filter(|a| filter.admits(a.get_info().device_type))
        .collect()
}

/// List every visible compute device, numbered consecutively across platforms.
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    let filter = DeviceTypeFilter::from_env();
    let mut devices = Vec::new();
    let mut num_base: i32 = 0;

    for backend in PLATFORM_ORDER {
        let adapters = adapters_for_backend(backend, filter);
        for (idx, adapter) in adapters.iter().enumerate() {
            let info = adapter.get_info();
            let num = num_base + idx as i32;
            devices.push(DeviceInfo {
                num,
                id: format!("COMPUTE_{num}"),
                description: info.name.clone(),
                backend,
                device_type: info.device_type,
                // we don't know if it's used for display, but assume it is
                display_device: true,
                advanced_shading: device_caps::advanced_shading(device_caps::vendor_of(&info)),
            });
        }
        num_base += adapters.len() as i32;
    }

    devices
}

/// Resolve a flat device index to its adapter by walking platforms in order
/// and subtracting each platform's device count.
pub(crate) fn find_adapter(num: i32) -> DriverResult<SelectedAdapter> {
    let filter = DeviceTypeFilter::from_env();
    let mut num_base: i32 = 0;
    let mut total_devices: u32 = 0;

    for backend in PLATFORM_ORDER {
        let adapters = adapters_for_backend(backend, filter);
        let num_devices = adapters.len() as u32;
        total_devices += num_devices;

        // The reference driver compares this difference in unsigned context;
        // a negative difference wraps and skips the platform.
        if (num - num_base) as u32 >= num_devices {
            num_base += num_devices as i32;
            continue;
        }

        let index_in_platform = (num - num_base) as u32;
        let adapter = adapters
            .into_iter()
            .nth(index_in_platform as usize)
            .ok_or_else(|| DriverError::PlatformDiscovery("adapter list changed during walk".into()))?;
        let platform_name = device_caps::platform_name(&adapter.get_info());

        return Ok(SelectedAdapter {
            adapter,
            backend,
            index_in_platform,
            platform_name,
        });
    }

    if total_devices == 0 {
        Err(DriverError::NoDevicesFound)
    } else {
        Err(DriverError::PlatformDiscovery(format!(
            "specified device {num} not found"
        )))
    }
}

/// Create the device/queue pair for an adapter, with an uncaptured-error
/// hook that logs against the adapter name.
pub(crate) fn create_context(adapter: wgpu::Adapter) -> DriverResult<Arc<GpuContext>> {
    let info = adapter.get_info();

    let mut limits = adapter.limits();
    let baseline = wgpu::Limits::downlevel_defaults();
    limits = limits.using_resolution(baseline);
    // The split-kernel argument lists bind many storage buffers per stage.
    let desired_storage_buffers = 96;
    limits.max_storage_buffers_per_shader_stage = limits
        .max_storage_buffers_per_shader_stage
        .max(desired_storage_buffers);

    let mut features = wgpu::Features::empty();
    if adapter.features().contains(wgpu::Features::PIPELINE_CACHE) {
        features |= wgpu::Features::PIPELINE_CACHE;
    }

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("cinder3d-device"),
            required_features: features,
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::default(),
        },
        None,
    ))
    .map_err(|e| DriverError::ContextCreation(e.to_string()))?;

    let device_name = info.name.clone();
    device.on_uncaptured_error(Box::new(move |err| {
        log::error!("compute error ({device_name}): {err}");
    }));

    Ok(Arc::new(GpuContext {
        adapter,
        device,
        queue,
        info,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_admits_expected_types() {
        assert!(DeviceTypeFilter::All.admits(wgpu::DeviceType::Cpu));
        assert!(DeviceTypeFilter::Gpu.admits(wgpu::DeviceType::DiscreteGpu));
        assert!(DeviceTypeFilter::Gpu.admits(wgpu::DeviceType::IntegratedGpu));
        assert!(!DeviceTypeFilter::Gpu.admits(wgpu::DeviceType::Cpu));
        assert!(DeviceTypeFilter::Accelerator.admits(wgpu::DeviceType::Other));
        assert!(!DeviceTypeFilter::Cpu.admits(wgpu::DeviceType::DiscreteGpu));
    }

    #[test]
    fn negative_index_difference_skips_platform() {
        // Mirrors the unsigned promotion in find_adapter's platform walk.
        let num: i32 = 1;
        let num_base: i32 = 3;
        let num_devices: u32 = 2;
        assert!((num - num_base) as u32 >= num_devices);
    }
}
