//! Device-resident state for the split kernel: per-ray SoA shader data
//! (main plus a double-size direct-lighting/shadow copy), cooperation
//! buffers, ray state, queues and per-sample output accumulators.
//!
//! Allocated once, sized to the maximum feasible tile, and reused for every
//! tile until device teardown.

use glam::IVec2;

use crate::buffers::{mem_alloc, DeviceBuffer, MemoryKind};
use crate::device_caps;
use crate::error::DriverResult;
use crate::gpu::GpuContext;
use crate::kernel_params::{
    kernel_globals_size, shader_closure_size, shader_data_soa_size, BsdfEvalRecord,
    DebugDataRecord, IntersectionRecord, PathRadianceRecord, PathStateRecord, RayRecord,
    AO_ALPHA_SIZE, AO_BSDF_SIZE, DIFFERENTIAL3_SIZE, DIFFERENTIAL_SIZE, FLOAT3_SIZE, FLOAT_SIZE,
    INT_SIZE, IS_LAMP_SIZE, L_TRANSPARENT_SIZE, NUM_QUEUES, RAY_STATE_SIZE, RNG_STATE_SIZE,
    THROUGHPUT_SIZE, WORK_ELEMENT_SIZE, WORK_STEALING,
};

use super::planner;

/// Every derived size the arena needs, computed up front so the accounting
/// is testable without a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArenaSizes {
    pub num_global_elements: u64,
    pub shader_closure_size: u64,
    pub per_thread_output_buffer_size: u64,
    pub max_work_groups: u64,
    pub ray_state_size: u64,
    pub queue_data_size: u64,
    pub queue_index_size: u64,
    pub work_array_size: u64,
    pub per_sample_output_size: u64,
}

impl ArenaSizes {
    pub fn compute(max_feasible: IVec2, max_closure: u32, per_thread_output: u64) -> Self {
        let num_global_elements = (max_feasible.x as u64) * (max_feasible.y as u64);

        let global = planner::ceil_to_local(max_feasible);
        let max_work_groups = (global.x as u64 * global.y as u64)
            / (planner::SPLIT_LOCAL.x as u64 * planner::SPLIT_LOCAL.y as u64);

        Self {
            num_global_elements,
            shader_closure_size: shader_closure_size(max_closure),
            per_thread_output_buffer_size: per_thread_output,
            max_work_groups,
            ray_state_size: num_global_elements * RAY_STATE_SIZE,
            queue_data_size: num_global_elements * NUM_QUEUES as u64 * INT_SIZE,
            queue_index_size: NUM_QUEUES as u64 * INT_SIZE,
            work_array_size: num_global_elements * WORK_ELEMENT_SIZE,
            per_sample_output_size: num_global_elements * per_thread_output,
        }
    }
}

/// SoA shader-data record: the kernel-side pointer-table header plus one
/// contiguous allocation per field. Kernels read only a subset of fields
/// per stage, which is why this is not an array of structs.
pub(crate) struct SoaShaderData {
    pub header: DeviceBuffer,
    pub p: DeviceBuffer,
    pub n: DeviceBuffer,
    pub ng: DeviceBuffer,
    pub i: DeviceBuffer,
    pub shader: DeviceBuffer,
    pub flag: DeviceBuffer,
    pub prim: DeviceBuffer,
    pub kind: DeviceBuffer,
    pub u: DeviceBuffer,
    pub v: DeviceBuffer,
    pub object: DeviceBuffer,
    pub time: DeviceBuffer,
    pub ray_length: DeviceBuffer,
    pub ray_depth: DeviceBuffer,
    pub transparent_depth: DeviceBuffer,
    pub dp: DeviceBuffer,
    pub di: DeviceBuffer,
    pub du: DeviceBuffer,
    pub dv: DeviceBuffer,
    pub dpdu: DeviceBuffer,
    pub dpdv: DeviceBuffer,
    pub closure: DeviceBuffer,
    pub num_closure: DeviceBuffer,
    pub randb_closure: DeviceBuffer,
    pub ray_p: DeviceBuffer,
    pub ray_dp: DeviceBuffer,
}

impl SoaShaderData {
    /// `factor` is 1 for the main record and 2 for the direct-lighting /
    /// shadow record, which holds two entries per ray.
    fn allocate(
        ctx: &GpuContext,
        stats: &crate::stats::MemoryStats,
        prefix: &str,
        num_global_elements: u64,
        factor: u64,
        closure_size: u64,
    ) -> DriverResult<Self> {
        let field = |name: &str, elem: u64| -> DriverResult<DeviceBuffer> {
            mem_alloc(
                ctx,
                stats,
                &format!("{prefix}-{name}"),
                num_global_elements * factor * elem,
                MemoryKind::ReadWrite,
            )
        };

        Ok(Self {
            header: mem_alloc(
                ctx,
                stats,
                &format!("{prefix}-header"),
                shader_data_soa_size(),
                MemoryKind::ReadWrite,
            )?,
            p: field("P", FLOAT3_SIZE)?,
            n: field("N", FLOAT3_SIZE)?,
            ng: field("Ng", FLOAT3_SIZE)?,
            i: field("I", FLOAT3_SIZE)?,
            shader: field("shader", INT_SIZE)?,
            flag: field("flag", INT_SIZE)?,
            prim: field("prim", INT_SIZE)?,
            kind: field("type", INT_SIZE)?,
            u: field("u", FLOAT_SIZE)?,
            v: field("v", FLOAT_SIZE)?,
            object: field("object", INT_SIZE)?,
            time: field("time", FLOAT_SIZE)?,
            ray_length: field("ray_length", FLOAT_SIZE)?,
            ray_depth: field("ray_depth", INT_SIZE)?,
            transparent_depth: field("transparent_depth", INT_SIZE)?,
            dp: field("dP", DIFFERENTIAL3_SIZE)?,
            di: field("dI", DIFFERENTIAL3_SIZE)?,
            du: field("du", DIFFERENTIAL_SIZE)?,
            dv: field("dv", DIFFERENTIAL_SIZE)?,
            dpdu: field("dPdu", FLOAT3_SIZE)?,
            dpdv: field("dPdv", FLOAT3_SIZE)?,
            closure: field("closure", closure_size)?,
            num_closure: field("num_closure", INT_SIZE)?,
            randb_closure: field("randb_closure", FLOAT_SIZE)?,
            ray_p: field("ray_P", FLOAT3_SIZE)?,
            ray_dp: field("ray_dP", DIFFERENTIAL3_SIZE)?,
        })
    }
}

/// The full split-kernel working set.
pub(crate) struct SplitArena {
    pub sizes: ArenaSizes,

    pub kernel_globals: DeviceBuffer,
    pub sd: SoaShaderData,
    pub sd_dl_shadow: SoaShaderData,

    // cooperation buffers shared between the stages
    pub rng: DeviceBuffer,
    pub throughput: DeviceBuffer,
    pub l_transparent: DeviceBuffer,
    pub path_radiance: DeviceBuffer,
    pub ray: DeviceBuffer,
    pub path_state: DeviceBuffer,
    pub intersection: DeviceBuffer,
    pub bsdf_eval: DeviceBuffer,
    pub is_lamp: DeviceBuffer,
    pub light_ray: DeviceBuffer,
    pub ao_alpha: DeviceBuffer,
    pub ao_bsdf: DeviceBuffer,
    pub ao_light_ray: DeviceBuffer,
    pub intersection_ao: DeviceBuffer,
    pub intersection_dl: DeviceBuffer,
    pub debug_data: Option<DeviceBuffer>,

    pub ray_state: DeviceBuffer,
    pub per_sample_output: DeviceBuffer,
    pub work_array: DeviceBuffer,

    pub queue_data: DeviceBuffer,
    pub queue_index: DeviceBuffer,
    pub use_queues_flag: DeviceBuffer,
    pub work_pool_wgs: Option<DeviceBuffer>,
}

impl SplitArena {
    pub fn allocate(
        ctx: &GpuContext,
        stats: &crate::stats::MemoryStats,
        sizes: ArenaSizes,
    ) -> DriverResult<Self> {
        let nge = sizes.num_global_elements;
        let coop = |name: &str, bytes: u64| -> DriverResult<DeviceBuffer> {
            mem_alloc(ctx, stats, name, bytes, MemoryKind::ReadWrite)
        };
        let record = |name: &str, elem: usize| coop(name, nge * elem as u64);

        let sd = SoaShaderData::allocate(ctx, stats, "sd", nge, 1, sizes.shader_closure_size)?;
        let sd_dl_shadow =
            SoaShaderData::allocate(ctx, stats, "sd-dl-shadow", nge, 2, sizes.shader_closure_size)?;

        let debug_data = if device_caps::kernel_debug_enabled() {
            Some(record("debug-data", std::mem::size_of::<DebugDataRecord>())?)
        } else {
            None
        };

        let work_pool_wgs = if WORK_STEALING {
            Some(coop("work-pool-wgs", sizes.max_work_groups * INT_SIZE)?)
        } else {
            None
        };

        Ok(Self {
            kernel_globals: coop("kernel-globals", kernel_globals_size())?,
            sd,
            sd_dl_shadow,
            rng: coop("rng-coop", nge * RNG_STATE_SIZE)?,
            throughput: coop("throughput-coop", nge * THROUGHPUT_SIZE)?,
            l_transparent: coop("l-transparent-coop", nge * L_TRANSPARENT_SIZE)?,
            path_radiance: record("path-radiance-coop", std::mem::size_of::<PathRadianceRecord>())?,
            ray: record("ray-coop", std::mem::size_of::<RayRecord>())?,
            path_state: record("path-state-coop", std::mem::size_of::<PathStateRecord>())?,
            intersection: record("intersection-coop", std::mem::size_of::<IntersectionRecord>())?,
            bsdf_eval: record("bsdf-eval-coop", std::mem::size_of::<BsdfEvalRecord>())?,
            is_lamp: coop("is-lamp-coop", nge * IS_LAMP_SIZE)?,
            light_ray: record("light-ray-coop", std::mem::size_of::<RayRecord>())?,
            ao_alpha: coop("ao-alpha-coop", nge * AO_ALPHA_SIZE)?,
            ao_bsdf: coop("ao-bsdf-coop", nge * AO_BSDF_SIZE)?,
            ao_light_ray: record("ao-light-ray-coop", std::mem::size_of::<RayRecord>())?,
            intersection_ao: record(
                "intersection-coop-ao",
                std::mem::size_of::<IntersectionRecord>(),
            )?,
            intersection_dl: record(
                "intersection-coop-dl",
                std::mem::size_of::<IntersectionRecord>(),
            )?,
            debug_data,
            ray_state: coop("ray-state", sizes.ray_state_size)?,
            per_sample_output: coop("per-sample-output", sizes.per_sample_output_size)?,
            work_array: coop("work-array", sizes.work_array_size)?,
            queue_data: coop("queue-data", sizes.queue_data_size)?,
            queue_index: coop("queue-index", sizes.queue_index_size)?,
            use_queues_flag: coop("use-queues-flag", 1)?,
            work_pool_wgs,
            sizes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_sizing_invariants() {
        let max_feasible = IVec2::new(384, 447);
        let sizes = ArenaSizes::compute(max_feasible, 10, 32);

        let nge = 384u64 * 447;
        assert_eq!(sizes.num_global_elements, nge);
        // ray_state holds exactly one byte per global element
        assert_eq!(sizes.ray_state_size, nge);
        // queue storage is NUM_QUEUES ints per element plus the counters
        assert_eq!(sizes.queue_data_size, nge * NUM_QUEUES as u64 * 4);
        assert_eq!(sizes.queue_index_size, NUM_QUEUES as u64 * 4);
        assert_eq!(sizes.per_sample_output_size, nge * 32);
    }

    #[test]
    fn work_groups_follow_launch_geometry() {
        let sizes = ArenaSizes::compute(IVec2::new(256, 256), 5, 16);
        // 256x256 threads in (64,1) groups
        assert_eq!(sizes.max_work_groups, 256 * 256 / 64);
    }
}
