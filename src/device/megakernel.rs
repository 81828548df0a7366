//! Megakernel strategy: one monolithic path-trace kernel, launched once per
//! tile per sample.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::args::{scalar_uniform, KernelArgList};
use crate::device::{load_program, DeviceBase, ProgramSpec};
use crate::device_caps;
use crate::error::{DriverError, DriverResult};
use crate::kernel_params::{BuildOptions, DeviceRequestedFeatures};
use crate::program_cache::{self, CompiledProgram};
use crate::tile::{DeviceTask, RenderTile};

const PATH_TRACE_ENTRY: &str = "path_trace";

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PathTraceParams {
    sample: i32,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    offset: i32,
    stride: i32,
    _pad: i32,
}

pub(crate) struct MegaKernel {
    program: Option<Arc<CompiledProgram>>,
}

impl MegaKernel {
    pub fn new() -> Self {
        Self { program: None }
    }

    pub fn load_kernels(
        &mut self,
        base: &mut DeviceBase,
        _requested: &DeviceRequestedFeatures,
    ) -> DriverResult<()> {
        base.load_base_kernels()?;

        if self.program.is_some() {
            return Ok(());
        }

        let ctx = base.ctx.clone();
        let local = base.base_local_size;
        let program = program_cache::with_program(base.key, "megakernel", || {
            device_caps::version_check(&ctx.info)?;
            load_program(
                &ctx,
                &ProgramSpec {
                    program_name: "megakernel",
                    source_file: "kernel_path_trace.wgsl",
                    entry_points: &[PATH_TRACE_ENTRY],
                    options: BuildOptions {
                        vendor_flags: device_caps::kernel_build_options(&ctx.info, None),
                        megakernel_only: true,
                        debug: device_caps::kernel_debug_enabled(),
                        local_size: Some(local),
                        ..Default::default()
                    },
                    variant: None,
                },
            )
            .map(Arc::new)
        })?;

        self.program = Some(program);
        Ok(())
    }

    /// One full-sample launch over the tile rectangle.
    fn path_trace(&self, base: &DeviceBase, tile: &RenderTile, sample: i32) -> DriverResult<()> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| DriverError::KernelLaunch("megakernel not loaded".into()))?;
        let pipeline = program.kernel(PATH_TRACE_ENTRY)?;
        let data = base
            .registry
            .constant("__data")
            .ok_or_else(|| DriverError::KernelLaunch("__data constant not populated".into()))?;

        let params = PathTraceParams {
            sample,
            x: tile.x,
            y: tile.y,
            w: tile.w,
            h: tile.h,
            offset: tile.offset,
            stride: tile.stride,
            _pad: 0,
        };
        let uniform = scalar_uniform(&base.ctx.device, "path-trace-params", &params);

        let mut args = KernelArgList::new();
        args.buffer(data)
            .buffer(&tile.buffer)
            .buffer(&tile.rng_state)
            .all_textures(&base.registry)
            .buffer(&uniform);
        let bind_group = args.bind(&base.ctx.device, pipeline, "path-trace-args");

        base.enqueue_kernel(
            pipeline,
            &bind_group,
            tile.w as u32,
            tile.h as u32,
            base.base_local_size,
            "path-trace",
        );
        Ok(())
    }

    /// Keep rendering tiles until the scheduler runs dry, one sample-loop
    /// per tile. Launch errors latch and the render continues; the caller
    /// observes the first error after the fact.
    pub fn path_trace_task(
        &mut self,
        base: &mut DeviceBase,
        task: &mut DeviceTask,
        pool_cancel: &AtomicBool,
    ) {
        while let Some(mut tile) = (task.acquire_tile)() {
            let start_sample = tile.start_sample;
            let end_sample = tile.start_sample + tile.num_samples;

            for sample in start_sample..end_sample {
                if (task.get_cancel)() || pool_cancel.load(Ordering::Relaxed) {
                    if !task.need_finish_queue {
                        break;
                    }
                }

                if let Err(err) = self.path_trace(base, &tile, sample) {
                    base.errors.report_err(&err);
                }

                tile.sample = sample + 1;
                (task.update_progress)(Some(&tile));
            }

            // All launches must retire before the scheduler reclaims the
            // tile; release_tile is a critical section shared with other
            // devices, and a slow device entering it with work still in
            // flight would stall faster devices behind it.
            base.finish();

            (task.release_tile)(tile);
        }
    }
}
