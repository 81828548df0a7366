//! Compute device driver: construction, strategy selection, the shared
//! device base (program loading, memory contract, shader/bake/film-convert
//! dispatch) and the public task surface.
//!
//! A device instance owns one dedicated worker thread; every GPU command it
//! issues goes through the single in-order queue of the cached context.

pub mod megakernel;
pub mod split;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};

use crate::args::{scalar_uniform, KernelArgList};
use crate::binary_cache;
use crate::buffers::{self, BufferRegistry, DeviceBuffer, MemoryKind};
use crate::device_caps::{self, Vendor};
use crate::error::{DriverError, DriverResult, ErrorSink};
use crate::fingerprint;
use crate::gpu::{self, DeviceInfo, DeviceTypeFilter, GpuContext};
use crate::kernel_params::{BuildOptions, DeviceRequestedFeatures};
use crate::program_cache::{self, CompiledProgram, SlotKey};
use crate::stats::MemoryStats;
use crate::tile::{DeviceTask, TaskKind, SHADER_EVAL_BAKE};
use crate::worker::DedicatedWorker;

use megakernel::MegaKernel;
use split::SplitKernel;

const BASE_ENTRY_POINTS: [&str; 4] = [
    "shader_eval",
    "bake_eval",
    "convert_to_byte",
    "convert_to_half_float",
];

/// Kernel source directory, `CINDER3D_KERNEL_PATH` or `kernels/`.
pub fn kernel_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CINDER3D_KERNEL_PATH") {
        return PathBuf::from(dir);
    }
    PathBuf::from("kernels")
}

/// Round a global size up to the next multiple of the group size.
pub(crate) fn global_size_round_up(group_size: u32, global_size: u32) -> u32 {
    let r = global_size % group_size;
    global_size + if r == 0 { 0 } else { group_size - r }
}

/// Divide the workgroup budget evenly over two dimensions; some drivers cap
/// the second dimension, in which case the first takes up the slack.
pub(crate) fn select_local_size(limits: &wgpu::Limits) -> (u32, u32) {
    let workgroup_size = limits.max_compute_invocations_per_workgroup.max(1);
    let sqrt_workgroup_size = ((workgroup_size as f64).sqrt() as u32).max(1);
    let mut local = (sqrt_workgroup_size, sqrt_workgroup_size);

    let max_y = limits.max_compute_workgroup_size_y.max(1);
    if local.1 > max_y {
        local.0 = (workgroup_size / max_y).max(1);
        local.1 = max_y;
    }
    local
}

/// Everything needed to compile one kernel program.
pub(crate) struct ProgramSpec<'a> {
    pub program_name: &'a str,
    pub source_file: &'a str,
    pub entry_points: &'a [&'a str],
    pub options: BuildOptions,
    /// Suffix distinguishing binary-cache entries built from shared sources.
    pub variant: Option<&'a str>,
}

/// Compile-or-restore one program through the on-disk binary cache.
///
/// The happy path restores a pipeline cache blob keyed by the device and
/// source fingerprints; any load failure falls back to a source compile and
/// writes a fresh blob, which must succeed.
pub(crate) fn load_program(ctx: &GpuContext, spec: &ProgramSpec) -> DriverResult<CompiledProgram> {
    let kernel_path = kernel_dir();
    let source_fp = fingerprint::kernel_sources_fingerprint(&kernel_path)?;
    let options_str = spec.options.canonical();
    let device_fp = fingerprint::device_fingerprint(&ctx.info, &options_str);
    let cache_path = binary_cache::cache_dir().join(binary_cache::cache_file_name(
        &device_fp,
        &source_fp,
        spec.variant,
    ));

    let source_path = kernel_path.join(spec.source_file);
    let raw = std::fs::read_to_string(&source_path).map_err(|e| {
        DriverError::SourceCompileFailed(format!("{}: {e}", source_path.display()))
    })?;
    // the fingerprint comment forces recompilation when any included source
    // changes, which driver-side shader caches fail to notice on their own
    let assembled = format!(
        "{}// sources {}\n{}",
        spec.options.wgsl_preamble(),
        source_fp,
        raw
    );

    if device_caps::kernel_debug_enabled() {
        let dump = binary_cache::cache_dir().join(binary_cache::debug_source_file_name(
            &device_fp,
            &source_fp,
            spec.variant,
        ));
        if let Some(parent) = dump.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&dump, &assembled) {
            log::warn!("failed to dump kernel source {}: {err}", dump.display());
        }
    }

    let mut loaded_from_binary = false;
    let pipeline_cache =
        match binary_cache::load_pipeline_cache(&ctx.device, &cache_path, spec.program_name) {
            Some(cache) => {
                loaded_from_binary = true;
                Some(cache)
            }
            None => binary_cache::fresh_pipeline_cache(&ctx.device, spec.program_name),
        };

    let start = std::time::Instant::now();
    if !loaded_from_binary {
        log::info!("compiling kernel program {} ...", spec.program_name);
    }

    ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = ctx
        .device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(spec.program_name),
            source: wgpu::ShaderSource::Wgsl(assembled.into()),
        });
    if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
        return Err(DriverError::SourceCompileFailed(format!(
            "{}: {err}",
            spec.program_name
        )));
    }

    let mut pipelines = HashMap::new();
    for &entry in spec.entry_points {
        let label = format!("{}-{}", spec.program_name, entry);
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: None,
                module: &module,
                entry_point: entry,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: pipeline_cache.as_ref(),
            });
        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(DriverError::SourceCompileFailed(format!("{label}: {err}")));
        }
        pipelines.insert(entry.to_string(), pipeline);
    }

    if !loaded_from_binary {
        log::info!(
            "kernel compilation finished in {:.2}s",
            start.elapsed().as_secs_f64()
        );
        if let Some(cache) = &pipeline_cache {
            // an uncached compile would repeat on every launch, so a save
            // failure here is fatal
            binary_cache::save_pipeline_cache(cache, &cache_path)?;
        }
    }

    Ok(CompiledProgram {
        name: spec.program_name.to_string(),
        module,
        pipelines,
        pipeline_cache,
    })
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FilmConvertParams {
    sample_scale: f32,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    offset: i32,
    stride: i32,
    _pad: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ShaderParams {
    eval_type: i32,
    shader_x: i32,
    shader_w: i32,
    offset: i32,
    sample: i32,
    _pad: [i32; 3],
}

/// State shared by both dispatch strategies.
pub(crate) struct DeviceBase {
    pub key: SlotKey,
    pub ctx: Arc<GpuContext>,
    pub platform_name: String,
    pub registry: BufferRegistry,
    pub stats: Arc<MemoryStats>,
    pub errors: Arc<ErrorSink>,
    pub background: bool,
    base_kernels: Option<Arc<CompiledProgram>>,
    pub base_local_size: (u32, u32),
}

impl DeviceBase {
    /// Load the shader/bake/film-convert program through the process cache.
    pub fn load_base_kernels(&mut self) -> DriverResult<()> {
        if self.base_kernels.is_some() {
            return Ok(());
        }

        let local = select_local_size(&self.ctx.limits());
        self.base_local_size = local;

        let ctx = self.ctx.clone();
        let program = program_cache::with_program(self.key, "base", || {
            device_caps::version_check(&ctx.info)?;
            load_program(
                &ctx,
                &ProgramSpec {
                    program_name: "base",
                    source_file: "kernel_base.wgsl",
                    entry_points: &BASE_ENTRY_POINTS,
                    options: BuildOptions {
                        vendor_flags: device_caps::kernel_build_options(&ctx.info, None),
                        debug: device_caps::kernel_debug_enabled(),
                        local_size: Some(local),
                        ..Default::default()
                    },
                    variant: None,
                },
            )
            .map(Arc::new)
        })?;

        self.base_kernels = Some(program);
        Ok(())
    }

    pub fn base_kernel(&self, entry: &str) -> DriverResult<&wgpu::ComputePipeline> {
        self.base_kernels
            .as_ref()
            .ok_or_else(|| DriverError::KernelLaunch("base kernels not loaded".into()))?
            .kernel(entry)
    }

    /// Launch one kernel over a 2-D range, rounding the global size up to
    /// local multiples. Submits (flushes) without waiting for completion.
    pub fn enqueue_kernel(
        &self,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        w: u32,
        h: u32,
        local: (u32, u32),
        label: &str,
    ) {
        let global_x = global_size_round_up(local.0, w.max(1));
        let global_y = global_size_round_up(local.1, h.max(1));

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(global_x / local.0, global_y / local.1, 1);
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Convert the accumulator into display pixels, byte or half-float.
    pub fn film_convert(&mut self, task: &DeviceTask) -> DriverResult<()> {
        let data = self
            .registry
            .constant("__data")
            .ok_or_else(|| DriverError::KernelLaunch("__data constant not populated".into()))?;
        let buffer = task
            .buffer
            .as_ref()
            .ok_or_else(|| DriverError::KernelLaunch("film convert without buffer".into()))?;
        let rgba = task
            .rgba_byte
            .as_ref()
            .or(task.rgba_half.as_ref())
            .ok_or_else(|| DriverError::KernelLaunch("film convert without output".into()))?;

        let entry = if task.rgba_byte.is_some() {
            "convert_to_byte"
        } else {
            "convert_to_half_float"
        };
        let pipeline = self.base_kernel(entry)?;

        let params = FilmConvertParams {
            sample_scale: 1.0 / (task.sample + 1) as f32,
            x: task.x,
            y: task.y,
            w: task.w,
            h: task.h,
            offset: task.offset,
            stride: task.stride,
            _pad: 0,
        };
        let uniform = scalar_uniform(&self.ctx.device, "film-convert-params", &params);

        let mut args = KernelArgList::new();
        args.buffer(data)
            .buffer(rgba)
            .buffer(buffer)
            .all_textures(&self.registry)
            .buffer(&uniform);
        let bind_group = args.bind(&self.ctx.device, pipeline, "film-convert-args");

        self.enqueue_kernel(
            pipeline,
            &bind_group,
            task.w as u32,
            task.h as u32,
            self.base_local_size,
            "film-convert",
        );
        Ok(())
    }

    /// Evaluate shaders (or bake) over a 1-D range, one launch per sample.
    pub fn shader(&mut self, task: &mut DeviceTask, pool_cancel: &AtomicBool) -> DriverResult<()> {
        let data = self
            .registry
            .constant_arc("__data")
            .ok_or_else(|| DriverError::KernelLaunch("__data constant not populated".into()))?;
        let input = task
            .shader_input
            .clone()
            .ok_or_else(|| DriverError::KernelLaunch("shader task without input".into()))?;
        let output = task
            .shader_output
            .clone()
            .ok_or_else(|| DriverError::KernelLaunch("shader task without output".into()))?;

        let entry = if task.shader_eval_type >= SHADER_EVAL_BAKE {
            "bake_eval"
        } else {
            "shader_eval"
        };

        for sample in 0..task.num_samples {
            if (task.get_cancel)() || pool_cancel.load(Ordering::Relaxed) {
                break;
            }

            let params = ShaderParams {
                eval_type: task.shader_eval_type,
                shader_x: task.shader_x,
                shader_w: task.shader_w,
                offset: task.offset,
                sample,
                _pad: [0; 3],
            };
            let uniform = scalar_uniform(&self.ctx.device, "shader-eval-params", &params);

            let pipeline = self.base_kernel(entry)?;

            let mut args = KernelArgList::new();
            args.buffer(&data)
                .buffer(&input)
                .buffer(&output)
                .all_textures(&self.registry)
                .buffer(&uniform);
            let bind_group = args.bind(&self.ctx.device, pipeline, "shader-eval-args");

            self.enqueue_kernel(
                pipeline,
                &bind_group,
                task.shader_w as u32,
                1,
                self.base_local_size,
                "shader-eval",
            );

            (task.update_progress)(None);
        }
        Ok(())
    }

    /// Finish every command issued so far on this context.
    pub fn finish(&self) {
        self.ctx.device.poll(wgpu::Maintain::Wait);
    }
}

enum Strategy {
    Mega(MegaKernel),
    Split(SplitKernel),
}

pub(crate) struct DeviceInner {
    pub base: DeviceBase,
    strategy: Strategy,
}

impl DeviceInner {
    fn load_kernels(&mut self, requested: &DeviceRequestedFeatures) -> DriverResult<()> {
        let DeviceInner { base, strategy } = self;
        match strategy {
            Strategy::Mega(mega) => mega.load_kernels(base, requested),
            Strategy::Split(split) => split.load_kernels(base, requested),
        }
    }

    fn thread_run(&mut self, task: &mut DeviceTask, pool_cancel: &AtomicBool) {
        let DeviceInner { base, strategy } = self;
        match task.kind {
            TaskKind::FilmConvert => {
                if let Err(err) = base.film_convert(task) {
                    base.errors.report_err(&err);
                }
            }
            TaskKind::Shader => {
                if let Err(err) = base.shader(task, pool_cancel) {
                    base.errors.report_err(&err);
                }
            }
            TaskKind::PathTrace => match strategy {
                Strategy::Mega(mega) => mega.path_trace_task(base, task, pool_cancel),
                Strategy::Split(split) => split.path_trace_task(base, task, pool_cancel),
            },
        }
    }
}

/// One path-tracing compute device with its dedicated worker.
pub struct RenderDevice {
    inner: Arc<Mutex<DeviceInner>>,
    worker: DedicatedWorker,
    errors: Arc<ErrorSink>,
    info: DeviceInfo,
}

impl RenderDevice {
    /// Select the device for `info.num`, attach (or create) its shared
    /// context and pick a dispatch strategy.
    pub fn create(
        info: &DeviceInfo,
        stats: Arc<MemoryStats>,
        background: bool,
    ) -> DriverResult<Self> {
        let selected = gpu::find_adapter(info.num)?;
        let adapter_info = selected.adapter.get_info();

        let force_split = std::env::var_os("CINDER3D_SPLIT_KERNEL_TEST").is_some();
        let use_split = force_split
            || (device_caps::vendor_of(&adapter_info) == Vendor::Amd
                && DeviceTypeFilter::Gpu.admits(adapter_info.device_type));

        let key = SlotKey {
            backend: selected.backend,
            device_index: selected.index_in_platform,
        };
        let adapter = selected.adapter;
        let ctx = program_cache::with_context(key, move || gpu::create_context(adapter))?;

        let errors = Arc::new(ErrorSink::new());
        let registry = BufferRegistry::new(&ctx, stats.clone());
        let base = DeviceBase {
            key,
            ctx,
            platform_name: selected.platform_name,
            registry,
            stats,
            errors: errors.clone(),
            background,
            base_kernels: None,
            base_local_size: (16, 16),
        };

        let strategy = if use_split {
            log::debug!("using split kernel for {}", info.description);
            Strategy::Split(SplitKernel::new(&base))
        } else {
            log::debug!("using megakernel for {}", info.description);
            Strategy::Mega(MegaKernel::new())
        };

        log::info!(
            "device init success: {} ({})",
            info.description,
            base.platform_name
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(DeviceInner { base, strategy })),
            worker: DedicatedWorker::new(&format!("cinder3d-device-{}", info.num)),
            errors,
            info: info.clone(),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Compile or restore every kernel the active strategy needs. Returns
    /// false (with the error latched) on failure; a failed device rejects
    /// further work.
    pub fn load_kernels(&self, requested: &DeviceRequestedFeatures) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.load_kernels(requested) {
            Ok(()) => true,
            Err(err) => {
                self.errors.report_err(&err);
                false
            }
        }
    }

    /// Queue one task on the dedicated worker.
    pub fn task_add(&self, task: DeviceTask) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.worker.cancel_flag();
        self.worker.push(move || {
            let mut task = task;
            let mut guard = inner.lock().unwrap();
            guard.thread_run(&mut task, &cancel);
        });
    }

    /// Block until every queued task has drained.
    pub fn task_wait(&self) {
        self.worker.wait();
    }

    /// Request cooperative cancellation; polled between samples or tiles.
    pub fn task_cancel(&self) {
        self.worker.cancel();
    }

    /// First latched error, if any.
    pub fn error_message(&self) -> Option<String> {
        self.errors.first()
    }

    // Device memory contract, used by the scene translator and the external
    // scheduler to stage tile buffers, textures and constants.

    pub fn mem_alloc(&self, label: &str, size: u64, kind: MemoryKind) -> DriverResult<DeviceBuffer> {
        let inner = self.inner.lock().unwrap();
        buffers::mem_alloc(&inner.base.ctx, &inner.base.stats, label, size, kind)
    }

    pub fn mem_copy_to(&self, mem: &DeviceBuffer, data: &[u8]) {
        let inner = self.inner.lock().unwrap();
        buffers::mem_copy_to(&inner.base.ctx, mem, data);
    }

    pub fn mem_copy_from(
        &self,
        mem: &DeviceBuffer,
        y: i32,
        w: i32,
        h: i32,
        elem: i32,
        dst: &mut [u8],
    ) -> DriverResult<()> {
        let inner = self.inner.lock().unwrap();
        buffers::mem_copy_from(&inner.base.ctx, mem, y, w, h, elem, dst)
    }

    pub fn mem_zero(&self, mem: &DeviceBuffer) {
        let inner = self.inner.lock().unwrap();
        buffers::mem_zero(&inner.base.ctx, mem);
    }

    pub fn mem_free(&self, mem: &mut DeviceBuffer) {
        let inner = self.inner.lock().unwrap();
        buffers::mem_free(&inner.base.stats, mem);
    }

    pub fn const_copy_to(&self, name: &str, data: &[u8]) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let DeviceInner { base, .. } = &mut *inner;
        let ctx = base.ctx.clone();
        base.registry.const_copy_to(&ctx, name, data)
    }

    pub fn tex_alloc(&self, name: &str, data: &[u8]) -> DriverResult<DeviceBuffer> {
        let mut inner = self.inner.lock().unwrap();
        let DeviceInner { base, .. } = &mut *inner;
        let ctx = base.ctx.clone();
        base.registry.tex_alloc(&ctx, name, data)
    }

    pub fn tex_free(&self, mem: &DeviceBuffer) {
        let mut inner = self.inner.lock().unwrap();
        inner.base.registry.tex_free(mem.buffer.global_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_size_rounds_to_group_multiples() {
        assert_eq!(global_size_round_up(64, 1), 64);
        assert_eq!(global_size_round_up(64, 64), 64);
        assert_eq!(global_size_round_up(64, 65), 128);
        assert_eq!(global_size_round_up(16, 250), 256);
        assert_eq!(global_size_round_up(1, 37), 37);
    }

    #[test]
    fn local_size_splits_workgroup_budget() {
        let mut limits = wgpu::Limits::default();
        limits.max_compute_invocations_per_workgroup = 256;
        limits.max_compute_workgroup_size_y = 256;
        assert_eq!(select_local_size(&limits), (16, 16));

        // second dimension capped: first dimension takes up the slack
        limits.max_compute_invocations_per_workgroup = 256;
        limits.max_compute_workgroup_size_y = 4;
        assert_eq!(select_local_size(&limits), (64, 4));
    }

    #[test]
    fn launch_geometry_invariant_holds() {
        for (w, h) in [(1, 1), (63, 7), (64, 64), (257, 130)] {
            let local = (16u32, 16u32);
            let gx = global_size_round_up(local.0, w);
            let gy = global_size_round_up(local.1, h);
            assert_eq!(gx % local.0, 0);
            assert_eq!(gy % local.1, 0);
            assert!(gx >= w && gy >= h);
        }
    }
}
