// End-to-end feasibility planning scenarios, no GPU required.

use cinder3d::device::split::planner::{
    max_render_feasible_tile_size, need_to_split_tile, split_grid, split_tile_size,
};
use glam::IVec2;

// A 1024x1024 tile on a device that can only keep 200k rays resident must
// subdivide into a grid whose union is exactly the requested tile, with
// every sub-tile addressing the shared parent buffers.
#[test]
fn oversized_tile_splits_into_a_shared_buffer_grid() {
    let feasible_global_threads = 200_000u64;

    let max_feasible = max_render_feasible_tile_size(feasible_global_threads);
    assert_eq!(max_feasible, IVec2::new(384, 447));
    assert!((max_feasible.x as u64) * (max_feasible.y as u64) <= feasible_global_threads);

    assert!(need_to_split_tile(1024, 1024, max_feasible));

    let split = split_tile_size(1024, 1024, max_feasible);
    assert_eq!(split, IVec2::new(256, 512));
    assert_eq!(split.x % 64, 0);

    let grid = split_grid(0, 0, 1024, 1024, 0, 1024, split);
    let expected = ((1024 + split.x - 1) / split.x) * ((1024 + split.y - 1) / split.y);
    assert_eq!(grid.len() as i32, expected);

    let area: i64 = grid.iter().map(|t| (t.w as i64) * (t.h as i64)).sum();
    assert_eq!(area, 1024 * 1024);

    for tile in &grid {
        // offsets address the one shared accumulator and rng buffer
        assert_eq!(tile.buffer_offset_x, tile.x);
        assert_eq!(tile.buffer_offset_y, tile.y);
        assert_eq!(tile.rng_state_offset_x, tile.x);
        assert_eq!(tile.rng_state_offset_y, tile.y);
    }
}

// A tile the device can hold is not split, and its ceiling-rounded launch
// area is the boundary of that decision.
#[test]
fn feasible_tile_is_not_split() {
    // a perfect square count lands exactly on the ceiling-rounded tile
    let max_feasible = max_render_feasible_tile_size((448 * 448) as u64);
    assert_eq!(max_feasible, IVec2::new(448, 448));

    assert!(!need_to_split_tile(256, 256, max_feasible));
    assert!(!need_to_split_tile(448, 448, max_feasible));
    assert!(need_to_split_tile(448, 449, max_feasible));
}

// Offsets survive a parent tile that does not start at the buffer origin.
#[test]
fn split_grid_respects_parent_offset() {
    let (x, y, stride, offset) = (128, 256, 2048, 0);
    let grid = split_grid(x, y, 512, 384, offset, stride, IVec2::new(256, 128));

    assert_eq!(grid[0].buffer_offset_x, 128);
    assert_eq!(grid[0].buffer_offset_y, 256);

    let last = grid.last().unwrap();
    assert_eq!(last.x + last.w, x + 512);
    assert_eq!(last.y + last.h, y + 384);
}
