//! Render tiles and device tasks.
//!
//! Tiles are handed out and collected by the external scheduler through the
//! task callbacks; the driver only ever owns a tile between `acquire_tile`
//! and `release_tile`.

use std::sync::Arc;

/// Shader evaluation request types; values at or above `SHADER_EVAL_BAKE`
/// route to the bake kernel.
pub const SHADER_EVAL_DISPLACE: i32 = 0;
pub const SHADER_EVAL_BACKGROUND: i32 = 1;
pub const SHADER_EVAL_BAKE: i32 = 2;

/// One rectangular region of the image rendered as a unit.
///
/// The offset/stride fields describe a sub-tile view over the parent
/// accumulator and RNG buffers when a tile was subdivided by the
/// feasibility planner; an unsplit tile carries zero offsets and its own
/// stride.
#[derive(Clone)]
pub struct RenderTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,

    pub start_sample: i32,
    pub num_samples: i32,
    pub sample: i32,
    pub resolution: i32,

    pub offset: i32,
    pub stride: i32,

    /// Scheduler-requested tile size, the subdivision baseline.
    pub tile_w: i32,
    pub tile_h: i32,

    /// Full viewport size backing `buffer` in interactive renders.
    pub viewport_w: i32,
    pub viewport_h: i32,

    /// Sample accumulator shared by all sub-tiles of one parent tile.
    pub buffer: Arc<wgpu::Buffer>,
    /// Per-pixel RNG state shared the same way.
    pub rng_state: Arc<wgpu::Buffer>,

    pub buffer_offset_x: i32,
    pub buffer_offset_y: i32,
    pub rng_state_offset_x: i32,
    pub rng_state_offset_y: i32,
    pub buffer_rng_state_stride: i32,
}

impl RenderTile {
    pub fn new(
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        buffer: Arc<wgpu::Buffer>,
        rng_state: Arc<wgpu::Buffer>,
    ) -> Self {
        Self {
            x,
            y,
            w,
            h,
            start_sample: 0,
            num_samples: 1,
            sample: 0,
            resolution: 0,
            offset: 0,
            stride: w,
            tile_w: w,
            tile_h: h,
            viewport_w: w,
            viewport_h: h,
            buffer,
            rng_state,
            buffer_offset_x: 0,
            buffer_offset_y: 0,
            rng_state_offset_x: 0,
            rng_state_offset_y: 0,
            buffer_rng_state_stride: 0,
        }
    }
}

/// What a queued task asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    FilmConvert,
    Shader,
    PathTrace,
}

pub type AcquireTileFn = Box<dyn FnMut() -> Option<RenderTile> + Send>;
pub type ReleaseTileFn = Box<dyn FnMut(RenderTile) + Send>;
pub type UpdateProgressFn = Box<dyn FnMut(Option<&RenderTile>) + Send>;
pub type GetCancelFn = Box<dyn Fn() -> bool + Send>;

/// A unit of work owned by the device worker for one execution.
pub struct DeviceTask {
    pub kind: TaskKind,

    pub acquire_tile: AcquireTileFn,
    pub release_tile: ReleaseTileFn,
    pub update_progress: UpdateProgressFn,
    pub get_cancel: GetCancelFn,
    /// When set, cancellation does not interrupt the tile in flight.
    pub need_finish_queue: bool,

    pub num_samples: i32,

    // film convert
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub sample: i32,
    pub offset: i32,
    pub stride: i32,
    pub buffer: Option<Arc<wgpu::Buffer>>,
    pub rgba_byte: Option<Arc<wgpu::Buffer>>,
    pub rgba_half: Option<Arc<wgpu::Buffer>>,

    // shader / bake
    pub shader_input: Option<Arc<wgpu::Buffer>>,
    pub shader_output: Option<Arc<wgpu::Buffer>>,
    pub shader_eval_type: i32,
    pub shader_x: i32,
    pub shader_w: i32,
}

impl DeviceTask {
    fn empty(kind: TaskKind) -> Self {
        Self {
            kind,
            acquire_tile: Box::new(|| None),
            release_tile: Box::new(|_| {}),
            update_progress: Box::new(|_| {}),
            get_cancel: Box::new(|| false),
            need_finish_queue: false,
            num_samples: 0,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            sample: 0,
            offset: 0,
            stride: 0,
            buffer: None,
            rgba_byte: None,
            rgba_half: None,
            shader_input: None,
            shader_output: None,
            shader_eval_type: 0,
            shader_x: 0,
            shader_w: 0,
        }
    }

    /// A path-trace task; the caller wires up the tile callbacks.
    pub fn path_trace(num_samples: i32) -> Self {
        let mut task = Self::empty(TaskKind::PathTrace);
        task.num_samples = num_samples;
        task
    }

    pub fn film_convert(
        buffer: Arc<wgpu::Buffer>,
        rgba_byte: Option<Arc<wgpu::Buffer>>,
        rgba_half: Option<Arc<wgpu::Buffer>>,
    ) -> Self {
        let mut task = Self::empty(TaskKind::FilmConvert);
        task.buffer = Some(buffer);
        task.rgba_byte = rgba_byte;
        task.rgba_half = rgba_half;
        task
    }

    pub fn shader(
        shader_input: Arc<wgpu::Buffer>,
        shader_output: Arc<wgpu::Buffer>,
        shader_eval_type: i32,
        shader_x: i32,
        shader_w: i32,
        num_samples: i32,
    ) -> Self {
        let mut task = Self::empty(TaskKind::Shader);
        task.shader_input = Some(shader_input);
        task.shader_output = Some(shader_output);
        task.shader_eval_type = shader_eval_type;
        task.shader_x = shader_x;
        task.shader_w = shader_w;
        task.num_samples = num_samples;
        task
    }
}
