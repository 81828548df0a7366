//! Split-kernel strategy: a wavefront pipeline of eleven short kernels that
//! advance every resident ray one state-machine step per launch.
//!
//! The host enqueues bursts of `PathIteration_times` ping-pong rounds, then
//! reads the per-ray state bytes back and scans for any ray that is still
//! alive; that readback is the only global termination signal. The burst
//! length adapts per tile so the steady state is one host intervention per
//! tile.

pub mod arena;
pub mod planner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::IVec2;

use crate::args::{scalar_uniform, KernelArgList};
use crate::buffers::read_buffer;
use crate::device::{global_size_round_up, load_program, DeviceBase, ProgramSpec};
use crate::device_caps::{self, Vendor};
use crate::error::{DriverError, DriverResult};
use crate::kernel_params::{
    interactive_max_closure, BuildOptions, DeviceRequestedFeatures, RAY_INACTIVE,
    PATH_ITER_INC_FACTOR, SPLIT_KERNEL_LOCAL_SIZE, SUM_ALL_RADIANCE_LOCAL_SIZE, WORK_STEALING,
};
use crate::program_cache::CompiledProgram;
use crate::tile::{DeviceTask, RenderTile};

use arena::{ArenaSizes, SplitArena};

struct SplitPrograms {
    data_init: Arc<CompiledProgram>,
    scene_intersect: Arc<CompiledProgram>,
    lamp_emission: Arc<CompiledProgram>,
    queue_enqueue: Arc<CompiledProgram>,
    background_buffer_update: Arc<CompiledProgram>,
    shader_eval: Arc<CompiledProgram>,
    holdout_emission_blurring_pathtermination_ao: Arc<CompiledProgram>,
    direct_lighting: Arc<CompiledProgram>,
    shadow_blocked: Arc<CompiledProgram>,
    next_iteration_setup: Arc<CompiledProgram>,
    sum_all_radiance: Arc<CompiledProgram>,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DataInitParams {
    start_sample: i32,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    offset: i32,
    stride: i32,
    rng_state_offset_x: i32,
    rng_state_offset_y: i32,
    rng_state_stride: i32,
    queue_size: i32,
    num_samples: i32,
    num_parallel_samples: i32,
    _pad: [i32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RangeParams {
    w: i32,
    h: i32,
    queue_size: i32,
    num_parallel_samples: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct QueueParams {
    queue_size: i32,
    _pad: [i32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BufferUpdateParams {
    w: i32,
    h: i32,
    x: i32,
    y: i32,
    stride: i32,
    rng_state_offset_x: i32,
    rng_state_offset_y: i32,
    rng_state_stride: i32,
    queue_size: i32,
    end_sample: i32,
    start_sample: i32,
    num_samples: i32,
    num_parallel_samples: i32,
    _pad: [i32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct HoldoutParams {
    w: i32,
    h: i32,
    x: i32,
    y: i32,
    stride: i32,
    queue_size: i32,
    start_sample: i32,
    num_parallel_samples: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ShadowBlockedParams {
    queue_size: i32,
    total_num_rays: i32,
    _pad: [i32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SumAllRadianceParams {
    num_parallel_samples: i32,
    w: i32,
    h: i32,
    stride: i32,
    buffer_offset_x: i32,
    buffer_offset_y: i32,
    buffer_stride: i32,
    start_sample: i32,
}

/// One prepared stage launch: pipeline, its per-tile bind group and the
/// workgroup grid.
struct StagePass<'a> {
    pipeline: &'a wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    groups_x: u32,
    groups_y: u32,
}

pub(crate) struct SplitKernel {
    programs: Option<SplitPrograms>,
    /// Closure bound the current programs were compiled with; -1 before the
    /// first load.
    current_max_closure: i32,
    split_arena: Option<SplitArena>,
    /// Path iterations enqueued per burst before the host checks ray state.
    path_iteration_times: u32,
    per_thread_output_buffer_size: u64,
    total_allocatable_memory: u64,
    first_tile: bool,
}

impl SplitKernel {
    pub fn new(base: &DeviceBase) -> Self {
        let mut total_allocatable_memory = base.ctx.limits().max_buffer_size;
        if device_caps::vendor_of(&base.ctx.info) == Vendor::Amd {
            // The AMD runtime degrades when the full allocation bound is
            // committed; half of it is the sweet spot.
            total_allocatable_memory /= 2;
        }

        Self {
            programs: None,
            current_max_closure: -1,
            split_arena: None,
            path_iteration_times: PATH_ITER_INC_FACTOR,
            per_thread_output_buffer_size: 0,
            total_allocatable_memory,
            first_tile: true,
        }
    }

    pub fn load_kernels(
        &mut self,
        base: &mut DeviceBase,
        requested: &DeviceRequestedFeatures,
    ) -> DriverResult<()> {
        let mut max_closure = requested.max_closure;
        if !base.background {
            if max_closure == 0 {
                return Err(DriverError::SourceCompileFailed(
                    "requested max_closure is 0".into(),
                ));
            }
            max_closure = interactive_max_closure(max_closure);
        }

        // present kernels were built with the same closure bound
        if self.programs.is_some() && self.current_max_closure == max_closure as i32 {
            return Ok(());
        }

        base.load_base_kernels()?;
        device_caps::version_check(&base.ctx.info)?;

        let ctx = base.ctx.clone();
        let vendor_flags = device_caps::kernel_build_options(&ctx.info, None);
        let load = |variant: &str, file: &str, entry: &str, local: (u32, u32)| {
            load_program(
                &ctx,
                &ProgramSpec {
                    program_name: variant,
                    source_file: file,
                    entry_points: &[entry],
                    options: BuildOptions {
                        vendor_flags: vendor_flags.clone(),
                        split_kernel: true,
                        work_stealing: WORK_STEALING,
                        debug: device_caps::kernel_debug_enabled(),
                        max_closure: Some(max_closure),
                        local_size: Some(local),
                        ..Default::default()
                    },
                    variant: Some(variant),
                },
            )
            .map(Arc::new)
        };

        let wavefront = SPLIT_KERNEL_LOCAL_SIZE;
        self.programs = Some(SplitPrograms {
            data_init: load(
                "DataInit",
                "kernel_data_init.wgsl",
                "data_initialization",
                wavefront,
            )?,
            scene_intersect: load(
                "SceneIntersect",
                "kernel_scene_intersect.wgsl",
                "scene_intersect",
                wavefront,
            )?,
            lamp_emission: load(
                "LampEmission",
                "kernel_lamp_emission.wgsl",
                "lamp_emission",
                wavefront,
            )?,
            queue_enqueue: load(
                "QueueEnqueue",
                "kernel_queue_enqueue.wgsl",
                "queue_enqueue",
                wavefront,
            )?,
            background_buffer_update: load(
                "Background_BufferUpdate",
                "kernel_background_buffer_update.wgsl",
                "background_buffer_update",
                wavefront,
            )?,
            shader_eval: load(
                "ShaderEval",
                "kernel_shader_eval.wgsl",
                "shader_evaluation",
                wavefront,
            )?,
            holdout_emission_blurring_pathtermination_ao: load(
                "Holdout_Emission_Blurring_Pathtermination_AO",
                "kernel_holdout_emission_blurring_pathtermination_ao.wgsl",
                "holdout_emission_blurring_pathtermination_ao",
                wavefront,
            )?,
            direct_lighting: load(
                "DirectLighting",
                "kernel_direct_lighting.wgsl",
                "direct_lighting",
                wavefront,
            )?,
            shadow_blocked: load(
                "ShadowBlocked",
                "kernel_shadow_blocked.wgsl",
                "shadow_blocked_direct_lighting",
                wavefront,
            )?,
            next_iteration_setup: load(
                "NextIterationSetUp",
                "kernel_next_iteration_setup.wgsl",
                "setup_next_iteration",
                wavefront,
            )?,
            sum_all_radiance: load(
                "SumAllRadiance",
                "kernel_sum_all_radiance.wgsl",
                "sum_all_radiance",
                SUM_ALL_RADIANCE_LOCAL_SIZE,
            )?,
        });

        self.current_max_closure = max_closure as i32;
        Ok(())
    }

    /// Render every sample of one (sub-)tile through the wavefront pipeline.
    fn path_trace(
        &mut self,
        base: &DeviceBase,
        tile: &RenderTile,
        max_feasible: IVec2,
    ) -> DriverResult<()> {
        let device = &base.ctx.device;
        let data = base
            .registry
            .constant("__data")
            .ok_or_else(|| DriverError::KernelLaunch("__data constant not populated".into()))?;

        debug_assert_eq!(max_feasible.x % planner::SPLIT_LOCAL.x, 0);
        debug_assert_eq!(max_feasible.y % planner::SPLIT_LOCAL.y, 0);

        let local = SPLIT_KERNEL_LOCAL_SIZE;
        let (d_w, d_h) = (tile.w as u32, tile.h as u32);

        let global_y = global_size_round_up(local.1, d_h);
        let (global_x, num_parallel_samples) = if WORK_STEALING {
            (global_size_round_up(local.0, d_w), 1u32)
        } else {
            let num_threads = (max_feasible.x as u32) * (max_feasible.y as u32);
            let num_tile_columns_possible = num_threads / global_y;
            let mut nps = (num_tile_columns_possible / d_w).min(tile.num_samples as u32);
            if nps / 64 > 0 {
                // snap down to the wavefront width
                nps = (nps / 64) * 64;
            }
            if nps == 0 {
                return Err(DriverError::KernelLaunch(
                    "no parallel samples fit the feasible work size".into(),
                ));
            }
            (d_w * nps, nps)
        };
        debug_assert!(
            (global_x as u64) * (global_y as u64)
                <= (max_feasible.x as u64) * (max_feasible.y as u64)
        );

        // All device-resident state is allocated once, sized to the maximum
        // feasible tile, and reused for every later tile.
        if self.first_tile && self.split_arena.is_none() {
            let sizes = ArenaSizes::compute(
                max_feasible,
                self.current_max_closure.max(0) as u32,
                self.per_thread_output_buffer_size,
            );
            self.split_arena = Some(SplitArena::allocate(&base.ctx, &base.stats, sizes)?);
        }
        let split_arena = self
            .split_arena
            .as_ref()
            .ok_or_else(|| DriverError::KernelLaunch("split arena not allocated".into()))?;
        let programs = self
            .programs
            .as_ref()
            .ok_or_else(|| DriverError::KernelLaunch("split kernels not loaded".into()))?;

        let queue_size = (global_x * global_y) as i32;
        let total_num_rays = queue_size;
        let start_sample = tile.start_sample;
        let end_sample = tile.start_sample + tile.num_samples;

        // Fixed-order argument lists; the same buffers recur across kernels
        // and each kernel's scalar tail rides in one uniform block.
        let sd = &split_arena.sd;
        let sd_dl = &split_arena.sd_dl_shadow;

        let data_init_pipeline = programs.data_init.kernel("data_initialization")?;
        let data_init_bind = {
            let params = scalar_uniform(
                device,
                "data-init-params",
                &DataInitParams {
                    start_sample,
                    x: tile.x,
                    y: tile.y,
                    w: tile.w,
                    h: tile.h,
                    offset: tile.offset,
                    stride: tile.stride,
                    rng_state_offset_x: tile.rng_state_offset_x,
                    rng_state_offset_y: tile.rng_state_offset_y,
                    rng_state_stride: tile.buffer_rng_state_stride,
                    queue_size,
                    num_samples: tile.num_samples,
                    num_parallel_samples: num_parallel_samples as i32,
                    _pad: [0; 3],
                },
            );
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(&sd.header.buffer)
                .buffer(&sd_dl.header.buffer);
            for (main, shadow) in [
                (&sd.p, &sd_dl.p),
                (&sd.n, &sd_dl.n),
                (&sd.ng, &sd_dl.ng),
                (&sd.i, &sd_dl.i),
                (&sd.shader, &sd_dl.shader),
                (&sd.flag, &sd_dl.flag),
                (&sd.prim, &sd_dl.prim),
                (&sd.kind, &sd_dl.kind),
                (&sd.u, &sd_dl.u),
                (&sd.v, &sd_dl.v),
                (&sd.object, &sd_dl.object),
                (&sd.time, &sd_dl.time),
                (&sd.ray_length, &sd_dl.ray_length),
                (&sd.ray_depth, &sd_dl.ray_depth),
                (&sd.transparent_depth, &sd_dl.transparent_depth),
                (&sd.dp, &sd_dl.dp),
                (&sd.di, &sd_dl.di),
                (&sd.du, &sd_dl.du),
                (&sd.dv, &sd_dl.dv),
                (&sd.dpdu, &sd_dl.dpdu),
                (&sd.dpdv, &sd_dl.dpdv),
                (&sd.closure, &sd_dl.closure),
                (&sd.num_closure, &sd_dl.num_closure),
                (&sd.randb_closure, &sd_dl.randb_closure),
                (&sd.ray_p, &sd_dl.ray_p),
                (&sd.ray_dp, &sd_dl.ray_dp),
            ] {
                args.buffer(&main.buffer).buffer(&shadow.buffer);
            }
            args.buffer(data)
                .buffer(&split_arena.per_sample_output.buffer)
                .buffer(&tile.rng_state)
                .buffer(&split_arena.rng.buffer)
                .buffer(&split_arena.throughput.buffer)
                .buffer(&split_arena.l_transparent.buffer)
                .buffer(&split_arena.path_radiance.buffer)
                .buffer(&split_arena.ray.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .all_textures(&base.registry)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&split_arena.use_queues_flag.buffer)
                .buffer(&split_arena.work_array.buffer);
            if let Some(pool) = &split_arena.work_pool_wgs {
                args.buffer(&pool.buffer);
            }
            if let Some(debug) = &split_arena.debug_data {
                args.buffer(&debug.buffer);
            }
            args.buffer(&params);
            args.bind(device, data_init_pipeline, "data-init-args")
        };

        let groups_x = global_x / local.0;
        let groups_y = global_y / local.1;
        // two rays per logical thread: ambient occlusion and the
        // direct-lighting shadow ray
        let shadow_groups_x = (global_x * 2) / local.0;

        let range_params = scalar_uniform(
            device,
            "range-params",
            &RangeParams {
                w: tile.w,
                h: tile.h,
                queue_size,
                num_parallel_samples: num_parallel_samples as i32,
            },
        );
        let queue_params = scalar_uniform(
            device,
            "queue-params",
            &QueueParams {
                queue_size,
                _pad: [0; 3],
            },
        );

        let scene_intersect_pipeline = programs.scene_intersect.kernel("scene_intersect")?;
        let scene_intersect_bind = {
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&split_arena.rng.buffer)
                .buffer(&split_arena.ray.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.intersection.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&split_arena.use_queues_flag.buffer);
            if let Some(debug) = &split_arena.debug_data {
                args.buffer(&debug.buffer);
            }
            args.buffer(&range_params);
            args.bind(device, scene_intersect_pipeline, "scene-intersect-args")
        };

        let lamp_emission_pipeline = programs.lamp_emission.kernel("lamp_emission")?;
        let lamp_emission_bind = {
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&sd.header.buffer)
                .buffer(&split_arena.throughput.buffer)
                .buffer(&split_arena.path_radiance.buffer)
                .buffer(&split_arena.ray.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.intersection.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&split_arena.use_queues_flag.buffer)
                .buffer(&range_params);
            args.bind(device, lamp_emission_pipeline, "lamp-emission-args")
        };

        let queue_enqueue_pipeline = programs.queue_enqueue.kernel("queue_enqueue")?;
        let queue_enqueue_bind = {
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&queue_params);
            args.bind(device, queue_enqueue_pipeline, "queue-enqueue-args")
        };

        let buffer_update_pipeline = programs
            .background_buffer_update
            .kernel("background_buffer_update")?;
        let buffer_update_bind = {
            let params = scalar_uniform(
                device,
                "buffer-update-params",
                &BufferUpdateParams {
                    w: tile.w,
                    h: tile.h,
                    x: tile.x,
                    y: tile.y,
                    stride: tile.stride,
                    rng_state_offset_x: tile.rng_state_offset_x,
                    rng_state_offset_y: tile.rng_state_offset_y,
                    rng_state_stride: tile.buffer_rng_state_stride,
                    queue_size,
                    end_sample,
                    start_sample,
                    num_samples: tile.num_samples,
                    num_parallel_samples: num_parallel_samples as i32,
                    _pad: [0; 3],
                },
            );
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&sd.header.buffer)
                .buffer(&split_arena.per_sample_output.buffer)
                .buffer(&tile.rng_state)
                .buffer(&split_arena.rng.buffer)
                .buffer(&split_arena.throughput.buffer)
                .buffer(&split_arena.path_radiance.buffer)
                .buffer(&split_arena.ray.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.l_transparent.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.work_array.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer);
            if let Some(pool) = &split_arena.work_pool_wgs {
                args.buffer(&pool.buffer);
            }
            if let Some(debug) = &split_arena.debug_data {
                args.buffer(&debug.buffer);
            }
            args.buffer(&params);
            args.bind(device, buffer_update_pipeline, "buffer-update-args")
        };

        let shader_eval_pipeline = programs.shader_eval.kernel("shader_evaluation")?;
        let shader_eval_bind = {
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&sd.header.buffer)
                .buffer(&split_arena.rng.buffer)
                .buffer(&split_arena.ray.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.intersection.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&queue_params);
            args.bind(device, shader_eval_pipeline, "shader-eval-args")
        };

        let holdout_pipeline = programs
            .holdout_emission_blurring_pathtermination_ao
            .kernel("holdout_emission_blurring_pathtermination_ao")?;
        let holdout_bind = {
            let params = scalar_uniform(
                device,
                "holdout-params",
                &HoldoutParams {
                    w: tile.w,
                    h: tile.h,
                    x: tile.x,
                    y: tile.y,
                    stride: tile.stride,
                    queue_size,
                    start_sample,
                    num_parallel_samples: num_parallel_samples as i32,
                },
            );
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&sd.header.buffer)
                .buffer(&split_arena.per_sample_output.buffer)
                .buffer(&split_arena.rng.buffer)
                .buffer(&split_arena.throughput.buffer)
                .buffer(&split_arena.l_transparent.buffer)
                .buffer(&split_arena.path_radiance.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.intersection.buffer)
                .buffer(&split_arena.ao_alpha.buffer)
                .buffer(&split_arena.ao_bsdf.buffer)
                .buffer(&split_arena.ao_light_ray.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.work_array.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&params);
            args.bind(device, holdout_pipeline, "holdout-args")
        };

        let direct_lighting_pipeline = programs.direct_lighting.kernel("direct_lighting")?;
        let direct_lighting_bind = {
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&sd.header.buffer)
                .buffer(&sd_dl.header.buffer)
                .buffer(&split_arena.rng.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.is_lamp.buffer)
                .buffer(&split_arena.light_ray.buffer)
                .buffer(&split_arena.bsdf_eval.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&queue_params);
            args.bind(device, direct_lighting_pipeline, "direct-lighting-args")
        };

        let shadow_blocked_pipeline = programs
            .shadow_blocked
            .kernel("shadow_blocked_direct_lighting")?;
        let shadow_blocked_bind = {
            let params = scalar_uniform(
                device,
                "shadow-blocked-params",
                &ShadowBlockedParams {
                    queue_size,
                    total_num_rays,
                    _pad: [0; 2],
                },
            );
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&sd_dl.header.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.light_ray.buffer)
                .buffer(&split_arena.ao_light_ray.buffer)
                .buffer(&split_arena.intersection_ao.buffer)
                .buffer(&split_arena.intersection_dl.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&params);
            args.bind(device, shadow_blocked_pipeline, "shadow-blocked-args")
        };

        let next_iteration_pipeline = programs.next_iteration_setup.kernel("setup_next_iteration")?;
        let next_iteration_bind = {
            let mut args = KernelArgList::new();
            args.buffer(&split_arena.kernel_globals.buffer)
                .buffer(data)
                .buffer(&sd.header.buffer)
                .buffer(&split_arena.rng.buffer)
                .buffer(&split_arena.throughput.buffer)
                .buffer(&split_arena.path_radiance.buffer)
                .buffer(&split_arena.ray.buffer)
                .buffer(&split_arena.path_state.buffer)
                .buffer(&split_arena.light_ray.buffer)
                .buffer(&split_arena.is_lamp.buffer)
                .buffer(&split_arena.bsdf_eval.buffer)
                .buffer(&split_arena.ao_light_ray.buffer)
                .buffer(&split_arena.ao_bsdf.buffer)
                .buffer(&split_arena.ao_alpha.buffer)
                .buffer(&split_arena.ray_state.buffer)
                .buffer(&split_arena.queue_data.buffer)
                .buffer(&split_arena.queue_index.buffer)
                .buffer(&split_arena.use_queues_flag.buffer)
                .buffer(&queue_params);
            args.bind(device, next_iteration_pipeline, "next-iteration-args")
        };

        let loop_stages = [
            StagePass {
                pipeline: scene_intersect_pipeline,
                bind_group: scene_intersect_bind,
                groups_x,
                groups_y,
            },
            StagePass {
                pipeline: lamp_emission_pipeline,
                bind_group: lamp_emission_bind,
                groups_x,
                groups_y,
            },
            StagePass {
                pipeline: queue_enqueue_pipeline,
                bind_group: queue_enqueue_bind,
                groups_x,
                groups_y,
            },
            StagePass {
                pipeline: buffer_update_pipeline,
                bind_group: buffer_update_bind,
                groups_x,
                groups_y,
            },
            StagePass {
                pipeline: shader_eval_pipeline,
                bind_group: shader_eval_bind,
                groups_x,
                groups_y,
            },
            StagePass {
                pipeline: holdout_pipeline,
                bind_group: holdout_bind,
                groups_x,
                groups_y,
            },
            StagePass {
                pipeline: direct_lighting_pipeline,
                bind_group: direct_lighting_bind,
                groups_x,
                groups_y,
            },
            StagePass {
                pipeline: shadow_blocked_pipeline,
                bind_group: shadow_blocked_bind,
                groups_x: shadow_groups_x,
                groups_y,
            },
            StagePass {
                pipeline: next_iteration_pipeline,
                bind_group: next_iteration_bind,
                groups_x,
                groups_y,
            },
        ];

        // Seed the wavefront.
        {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("split-data-init"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("split-data-init"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(data_init_pipeline);
                pass.set_bind_group(0, &data_init_bind, &[]);
                pass.dispatch_workgroups(groups_x, groups_y, 1);
            }
            base.ctx.queue.submit(std::iter::once(encoder.finish()));
        }

        // Convergence loop: long bursts of path iterations, then one
        // synchronous ray-state scan on the host.
        let mut path_iteration_times = self.path_iteration_times;
        let mut num_host_intervention = 0u32;
        let mut num_next_path_iter_times = path_iteration_times;
        let mut active_rays_available = true;

        while active_rays_available {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("split-path-iteration"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("split-path-iteration"),
                    timestamp_writes: None,
                });
                for _ in 0..path_iteration_times {
                    for stage in &loop_stages {
                        pass.set_pipeline(stage.pipeline);
                        pass.set_bind_group(0, &stage.bind_group, &[]);
                        pass.dispatch_workgroups(stage.groups_x, stage.groups_y, 1);
                    }
                }
            }
            base.ctx.queue.submit(std::iter::once(encoder.finish()));

            let host_ray_state = read_buffer(
                &base.ctx,
                &split_arena.ray_state.buffer,
                0,
                (global_x as u64) * (global_y as u64),
            )?;
            active_rays_available = host_ray_state.iter().any(|&state| state != RAY_INACTIVE);

            if active_rays_available {
                num_host_intervention += 1;
                path_iteration_times = PATH_ITER_INC_FACTOR;
                // the next tile starts with a longer burst
                num_next_path_iter_times += PATH_ITER_INC_FACTOR;
            }
        }

        // Reduce the per-sample accumulators into the tile buffer.
        {
            let params = scalar_uniform(
                device,
                "sum-all-radiance-params",
                &SumAllRadianceParams {
                    num_parallel_samples: num_parallel_samples as i32,
                    w: tile.w,
                    h: tile.h,
                    stride: tile.stride,
                    buffer_offset_x: tile.buffer_offset_x,
                    buffer_offset_y: tile.buffer_offset_y,
                    buffer_stride: tile.buffer_rng_state_stride,
                    start_sample,
                },
            );
            let pipeline = programs.sum_all_radiance.kernel("sum_all_radiance")?;
            let mut args = KernelArgList::new();
            args.buffer(data)
                .buffer(&tile.buffer)
                .buffer(&split_arena.per_sample_output.buffer)
                .buffer(&params);
            let bind_group = args.bind(device, pipeline, "sum-all-radiance-args");

            let sum_local = SUM_ALL_RADIANCE_LOCAL_SIZE;
            let sum_gx = global_size_round_up(sum_local.0, d_w);
            let sum_gy = global_size_round_up(sum_local.1, d_h);
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sum-all-radiance"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("sum-all-radiance"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(sum_gx / sum_local.0, sum_gy / sum_local.1, 1);
            }
            base.ctx.queue.submit(std::iter::once(encoder.finish()));
        }

        // Hysteresis: drive the burst length toward the smallest value that
        // produces exactly one host intervention per tile.
        self.path_iteration_times = if num_host_intervention == 0 {
            num_next_path_iter_times
                .saturating_sub(PATH_ITER_INC_FACTOR)
                .max(PATH_ITER_INC_FACTOR)
        } else {
            num_next_path_iter_times
        };

        self.first_tile = false;
        Ok(())
    }

    /// Keep rendering tiles until the scheduler runs dry, splitting tiles
    /// that exceed the feasible thread count.
    pub fn path_trace_task(
        &mut self,
        base: &mut DeviceBase,
        task: &mut DeviceTask,
        pool_cancel: &AtomicBool,
    ) {
        let mut checked_feasibility = false;
        let mut need_split = false;
        let mut max_feasible = IVec2::ZERO;

        while let Some(mut tile) = (task.acquire_tile)() {
            if ((task.get_cancel)() || pool_cancel.load(Ordering::Relaxed)) && !task.need_finish_queue
            {
                (task.release_tile)(tile);
                break;
            }

            tile.buffer_offset_x = 0;
            tile.buffer_offset_y = 0;
            tile.rng_state_offset_x = 0;
            tile.rng_state_offset_y = 0;

            if !checked_feasibility {
                let output_buffer_size = tile.buffer.size();
                self.per_thread_output_buffer_size = if base.background {
                    // offline render: the accumulator covers the tile only
                    output_buffer_size / ((tile.w as u64) * (tile.h as u64))
                } else {
                    // interactive render: the accumulator covers the viewport
                    output_buffer_size
                        / ((tile.viewport_w as u64) * (tile.viewport_h as u64))
                };

                let invariable = planner::invariable_mem_allocated();
                let tile_specific = planner::tile_specific_mem_allocated(
                    IVec2::new(tile.tile_w, tile.tile_h),
                    self.per_thread_output_buffer_size,
                    WORK_STEALING,
                );
                let scene_specific = base.registry.texture_footprint()
                    + base.registry.constant_size("__data");
                let per_thread = planner::per_thread_memory(
                    self.current_max_closure.max(0) as u32,
                    self.per_thread_output_buffer_size,
                );

                let feasible = planner::feasible_global_work_size(
                    self.total_allocatable_memory,
                    invariable,
                    tile_specific,
                    scene_specific,
                    per_thread,
                );
                max_feasible = planner::max_render_feasible_tile_size(feasible);
                need_split = planner::need_to_split_tile(tile.tile_w, tile.tile_h, max_feasible);
                checked_feasibility = true;
            }

            if need_split {
                let split = planner::split_tile_size(tile.w, tile.h, max_feasible);
                let sub_tiles = planner::split_tiles(&tile, split);

                if base.background && sub_tiles.len() > 1 {
                    log::info!(
                        "tile {}x{} exceeds device memory, rendering as {}x{} sub-tiles",
                        tile.w,
                        tile.h,
                        split.x,
                        split.y
                    );
                }

                for sub_tile in &sub_tiles {
                    if let Err(err) = self.path_trace(base, sub_tile, max_feasible) {
                        base.errors.report_err(&err);
                        break;
                    }
                }
            } else {
                // the feasible size is the user tile itself
                let tile_feasible =
                    planner::ceil_to_local(IVec2::new(tile.tile_w, tile.tile_h));
                tile.buffer_rng_state_stride = tile.stride;
                if let Err(err) = self.path_trace(base, &tile, tile_feasible) {
                    base.errors.report_err(&err);
                }
            }

            tile.sample = tile.start_sample + tile.num_samples;

            // every launch must retire before the tile returns to the
            // scheduler's critical section
            base.finish();

            (task.release_tile)(tile);
        }
    }
}
