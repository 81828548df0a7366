//! Tile feasibility planning for the split kernel.
//!
//! Decides whether a scheduler tile fits in device memory given the per-ray
//! state the split kernel keeps resident, and subdivides oversized tiles
//! into almost-square sub-tiles aligned to the local work size.

use glam::IVec2;

use crate::kernel_params::{
    shader_closure_size, shader_data_size, shader_data_soa_size, kernel_globals_size,
    BsdfEvalRecord, IntersectionRecord, PathRadianceRecord, PathStateRecord, RayRecord,
    AO_ALPHA_SIZE, AO_BSDF_SIZE, DATA_ALLOCATION_MEM_FACTOR, INT_SIZE, IS_LAMP_SIZE,
    L_TRANSPARENT_SIZE, NUM_QUEUES, RAY_STATE_SIZE, RNG_STATE_SIZE, SPLIT_KERNEL_LOCAL_SIZE,
    THROUGHPUT_SIZE, WORK_ELEMENT_SIZE,
};
use crate::tile::RenderTile;

/// Local work size as a vector, for tile math.
pub const SPLIT_LOCAL: IVec2 = IVec2::new(
    SPLIT_KERNEL_LOCAL_SIZE.0 as i32,
    SPLIT_KERNEL_LOCAL_SIZE.1 as i32,
);

fn ceil_multiple(value: i32, step: i32) -> i32 {
    ((value - 1) / step + 1) * step
}

fn floor_multiple(value: i32, step: i32) -> i32 {
    (value / step) * step
}

/// Round both dimensions up to local work-size multiples.
pub fn ceil_to_local(size: IVec2) -> IVec2 {
    IVec2::new(
        ceil_multiple(size.x, SPLIT_LOCAL.x),
        ceil_multiple(size.y, SPLIT_LOCAL.y),
    )
}

/// Memory the split kernel always allocates, independent of tile size or
/// scene content: the kernel-globals header, queue counters, the use-queues
/// flag and both shader-data SoA headers.
pub fn invariable_mem_allocated() -> u64 {
    let mut total = kernel_globals_size();
    total += NUM_QUEUES as u64 * INT_SIZE;
    total += 1;
    total += shader_data_soa_size() * 2;
    total
}

/// Memory scaling with the scheduler's requested tile size: the per-thread
/// output slice, the RNG state and (with work stealing) one pool counter
/// per work group.
pub fn tile_specific_mem_allocated(
    tile: IVec2,
    per_thread_output: u64,
    work_stealing: bool,
) -> u64 {
    let mut total = 0u64;

    if work_stealing {
        let global = ceil_to_local(tile);
        let pools =
            (global.x as u64 * global.y as u64) / (SPLIT_LOCAL.x as u64 * SPLIT_LOCAL.y as u64);
        total += pools * INT_SIZE;
    }

    let area = tile.x as u64 * tile.y as u64;
    total += area * per_thread_output;
    total += area * RNG_STATE_SIZE;
    total
}

/// The full per-ray cost of one resident split-kernel thread.
pub fn per_thread_memory(max_closure: u32, per_thread_output: u64) -> u64 {
    let shader_closure = shader_closure_size(max_closure);
    let shaderdata_volume = shader_data_size(shader_closure);

    RNG_STATE_SIZE
        + THROUGHPUT_SIZE
        + L_TRANSPARENT_SIZE
        + RAY_STATE_SIZE
        + WORK_ELEMENT_SIZE
        + IS_LAMP_SIZE
        + std::mem::size_of::<PathRadianceRecord>() as u64
        + std::mem::size_of::<RayRecord>() as u64
        + std::mem::size_of::<PathStateRecord>() as u64
        + 3 * std::mem::size_of::<IntersectionRecord>() as u64
        + shaderdata_volume * 3
        + std::mem::size_of::<RayRecord>() as u64
        + std::mem::size_of::<BsdfEvalRecord>() as u64
        + AO_ALPHA_SIZE
        + AO_BSDF_SIZE
        + std::mem::size_of::<RayRecord>() as u64
        + INT_SIZE * NUM_QUEUES as u64
        + per_thread_output
}

/// How many resident threads the device can afford after the fixed costs.
pub fn feasible_global_work_size(
    total_allocatable: u64,
    invariable: u64,
    tile_specific: u64,
    scene_specific: u64,
    per_thread: u64,
) -> u64 {
    let reserved = invariable + tile_specific + scene_specific + DATA_ALLOCATION_MEM_FACTOR;
    total_allocatable.saturating_sub(reserved) / per_thread
}

/// Largest almost-square tile whose thread count stays feasible, rounded to
/// local multiples; tries the ceiling first and falls back to the floor.
pub fn max_render_feasible_tile_size(feasible_global_work_size: u64) -> IVec2 {
    let square_root_val = (feasible_global_work_size as f64).sqrt() as i32;
    let base = IVec2::new(square_root_val, square_root_val);

    let ceiled = ceil_to_local(base);
    if (ceiled.x as u64) * (ceiled.y as u64) <= feasible_global_work_size {
        return ceiled;
    }

    IVec2::new(
        floor_multiple(base.x, SPLIT_LOCAL.x),
        floor_multiple(base.y, SPLIT_LOCAL.y),
    )
}

/// A tile must split iff its ceiling-rounded launch area exceeds the
/// feasible thread count.
pub fn need_to_split_tile(w: i32, h: i32, max_feasible: IVec2) -> bool {
    let estimate = ceil_to_local(IVec2::new(w, h));
    (estimate.x as i64) * (estimate.y as i64) > (max_feasible.x as i64) * (max_feasible.y as i64)
}

/// Halve the larger dimension (re-rounded to local multiples) until the
/// tile area fits the feasible thread count.
pub fn split_tile_size(w: i32, h: i32, max_feasible: IVec2) -> IVec2 {
    let num_global_threads = (max_feasible.x as i64) * (max_feasible.y as i64);
    let mut d_w = ceil_multiple(w, SPLIT_LOCAL.x);
    let mut d_h = ceil_multiple(h, SPLIT_LOCAL.y);

    while (d_w as i64) * (d_h as i64) > num_global_threads {
        if d_w >= d_h {
            d_w = ceil_multiple(d_w / 2, SPLIT_LOCAL.x);
        } else {
            d_h = ceil_multiple(d_h / 2, SPLIT_LOCAL.y);
        }
    }

    IVec2::new(d_w, d_h)
}

/// Geometry of one sub-tile inside a split parent tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTileRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub stride: i32,
    pub buffer_offset_x: i32,
    pub buffer_offset_y: i32,
    pub rng_state_offset_x: i32,
    pub rng_state_offset_y: i32,
}

/// Subdivide a tile rectangle into a grid of `split`-sized cells; border
/// cells carry the residual width/height. Every cell records its offset
/// into the parent buffers so all cells accumulate into one target.
pub fn split_grid(
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    offset: i32,
    stride: i32,
    split: IVec2,
) -> Vec<SubTileRect> {
    let num_tiles_x = (w - 1) / split.x + 1;
    let num_tiles_y = (h - 1) / split.y + 1;

    let offset_index = offset + x + y * stride;
    let offset_x = offset_index % stride;
    let offset_y = offset_index / stride;

    let mut tiles = Vec::with_capacity((num_tiles_x * num_tiles_y) as usize);
    for tile_iter_y in 0..num_tiles_y {
        for tile_iter_x in 0..num_tiles_x {
            let sub_w = if tile_iter_x == num_tiles_x - 1 {
                w - tile_iter_x * split.x
            } else {
                split.x
            };
            let sub_h = if tile_iter_y == num_tiles_y - 1 {
                h - tile_iter_y * split.y
            } else {
                split.y
            };

            tiles.push(SubTileRect {
                x: x + tile_iter_x * split.x,
                y: y + tile_iter_y * split.y,
                w: sub_w,
                h: sub_h,
                stride: sub_w,
                buffer_offset_x: offset_x + tile_iter_x * split.x,
                buffer_offset_y: offset_y + tile_iter_y * split.y,
                rng_state_offset_x: offset_x + tile_iter_x * split.x,
                rng_state_offset_y: offset_y + tile_iter_y * split.y,
            });
        }
    }
    tiles
}

/// Materialize the sub-tile grid as render tiles sharing the parent's
/// sample range, accumulator and RNG state.
pub fn split_tiles(rtile: &RenderTile, split: IVec2) -> Vec<RenderTile> {
    split_grid(
        rtile.x,
        rtile.y,
        rtile.w,
        rtile.h,
        rtile.offset,
        rtile.stride,
        split,
    )
    .into_iter()
    .map(|rect| {
        let mut sub = rtile.clone();
        sub.x = rect.x;
        sub.y = rect.y;
        sub.w = rect.w;
        sub.h = rect.h;
        sub.stride = rect.stride;
        sub.buffer_offset_x = rect.buffer_offset_x;
        sub.buffer_offset_y = rect.buffer_offset_y;
        sub.rng_state_offset_x = rect.rng_state_offset_x;
        sub.rng_state_offset_y = rect.rng_state_offset_y;
        sub.buffer_rng_state_stride = rtile.stride;
        sub
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_params::WORK_STEALING;

    #[test]
    fn ceil_to_local_rounds_up() {
        assert_eq!(ceil_to_local(IVec2::new(1, 1)), IVec2::new(64, 1));
        assert_eq!(ceil_to_local(IVec2::new(64, 5)), IVec2::new(64, 5));
        assert_eq!(ceil_to_local(IVec2::new(65, 5)), IVec2::new(128, 5));
    }

    #[test]
    fn max_feasible_tile_tries_ceiling_then_floor() {
        // 200_000 threads: sqrt is 447, ceiling (448, 447) overshoots, so
        // the planner falls back to the floor in x.
        let max = max_render_feasible_tile_size(200_000);
        assert_eq!(max, IVec2::new(384, 447));
        assert!((max.x as u64) * (max.y as u64) <= 200_000);
        assert_eq!(max.x % SPLIT_LOCAL.x, 0);
        assert_eq!(max.y % SPLIT_LOCAL.y, 0);

        // exactly representable: ceiling accepted
        let max = max_render_feasible_tile_size(128 * 128);
        assert_eq!(max, IVec2::new(128, 128));
    }

    #[test]
    fn split_boundary_matches_rounded_area() {
        let max = IVec2::new(256, 256);
        assert!(!need_to_split_tile(256, 256, max));
        // 250 ceils to 256 in x, and 256*260 exceeds the feasible area
        assert!(need_to_split_tile(250, 260, max));
        assert!(need_to_split_tile(1024, 1024, max));
        assert!(!need_to_split_tile(64, 64, max));
        assert!(!need_to_split_tile(200, 256, max));
    }

    #[test]
    fn split_tile_size_halves_larger_dimension() {
        // feasible threads from the 200k scenario
        let max = max_render_feasible_tile_size(200_000);
        let split = split_tile_size(1024, 1024, max);
        assert_eq!(split, IVec2::new(256, 512));
        assert!((split.x as i64) * (split.y as i64) <= (max.x as i64) * (max.y as i64));
        assert_eq!(split.x % SPLIT_LOCAL.x, 0);
        assert_eq!(split.y % SPLIT_LOCAL.y, 0);
    }

    #[test]
    fn sub_tiles_cover_parent_exactly() {
        let (x, y, w, h) = (32, 16, 150, 70);
        let grid = split_grid(x, y, w, h, 0, 1024, IVec2::new(64, 32));

        // area is conserved
        let area: i64 = grid.iter().map(|t| (t.w as i64) * (t.h as i64)).sum();
        assert_eq!(area, (w as i64) * (h as i64));

        // union equals the parent rectangle, with no overlap
        let mut covered = vec![0u8; (w * h) as usize];
        for tile in &grid {
            assert!(tile.x >= x && tile.y >= y);
            assert!(tile.x + tile.w <= x + w && tile.y + tile.h <= y + h);
            for ty in 0..tile.h {
                for tx in 0..tile.w {
                    let px = (tile.x - x) + tx;
                    let py = (tile.y - y) + ty;
                    covered[(py * w + px) as usize] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn sub_tile_offsets_address_parent_buffers() {
        let grid = split_grid(0, 0, 1024, 1024, 0, 1024, IVec2::new(256, 512));
        assert_eq!(grid.len(), 4 * 2);

        assert_eq!(grid[0].buffer_offset_x, 0);
        assert_eq!(grid[0].buffer_offset_y, 0);
        assert_eq!(grid[1].buffer_offset_x, 256);
        assert_eq!(grid[4].buffer_offset_y, 512);

        // every sub-tile keeps its own compact stride
        for tile in &grid {
            assert_eq!(tile.stride, tile.w);
        }
    }

    #[test]
    fn memory_buckets_are_consistent() {
        let invariable = invariable_mem_allocated();
        assert!(invariable > 0);

        let per_thread = per_thread_memory(10, 32);
        // the shader-data volume dominates and appears three times
        let shaderdata = shader_data_size(shader_closure_size(10));
        assert!(per_thread > shaderdata * 3);

        let tile_mem = tile_specific_mem_allocated(IVec2::new(256, 256), 32, WORK_STEALING);
        // output slice + rng for 64k pixels, plus pool counters
        assert!(tile_mem >= 256 * 256 * (32 + 4));

        let feasible = feasible_global_work_size(1 << 30, invariable, tile_mem, 0, per_thread);
        assert!(feasible > 0);
        // reserved memory is excluded before dividing
        let all_reserved =
            feasible_global_work_size(invariable + tile_mem, invariable, tile_mem, 0, per_thread);
        assert_eq!(all_reserved, 0);
    }
}
