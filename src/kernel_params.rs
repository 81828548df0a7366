//! Kernel interface tables and record footprints.
//!
//! This module is the single source of truth shared with the WGSL kernel
//! contract: the texture-name table and the shader-data field table drive
//! both device-buffer allocation accounting and positional argument binding,
//! and the `#[repr(C)]` records mirror the layouts the kernels read.

use bytemuck::{Pod, Zeroable};

/// Split-kernel local work size, the wavefront width on the target vendor.
pub const SPLIT_KERNEL_LOCAL_SIZE: (u32, u32) = (64, 1);

/// Local size of the radiance reduction stage.
pub const SUM_ALL_RADIANCE_LOCAL_SIZE: (u32, u32) = (16, 16);

/// Number of device-resident ray queues.
pub const NUM_QUEUES: u32 = 4;

/// Upper bound on shading closures compiled into any kernel.
pub const MAX_CLOSURE: u32 = 64;

/// Path-iteration count step for the convergence-loop hysteresis. Tuned
/// proportional to the expected number of ray bounces.
pub const PATH_ITER_INC_FACTOR: u32 = 8;

/// Memory reserved for allocator alignment overhead when sizing the arena.
pub const DATA_ALLOCATION_MEM_FACTOR: u64 = 5_000_000;

/// Whether kernels distribute samples through per-work-group work pools.
pub const WORK_STEALING: bool = true;

/// Size of one device pointer slot in the kernel-side headers.
pub const DEVICE_POINTER_SIZE: u64 = 8;

// Element footprints shared with the kernels.
pub const FLOAT_SIZE: u64 = 4;
pub const INT_SIZE: u64 = 4;
pub const FLOAT3_SIZE: u64 = 16;
pub const DIFFERENTIAL_SIZE: u64 = 8;
pub const DIFFERENTIAL3_SIZE: u64 = 32;
pub const RNG_STATE_SIZE: u64 = 4;
pub const RAY_STATE_SIZE: u64 = 1;
pub const WORK_ELEMENT_SIZE: u64 = 4;
pub const IS_LAMP_SIZE: u64 = 4;
pub const THROUGHPUT_SIZE: u64 = FLOAT3_SIZE;
pub const L_TRANSPARENT_SIZE: u64 = FLOAT_SIZE;
pub const AO_ALPHA_SIZE: u64 = FLOAT3_SIZE;
pub const AO_BSDF_SIZE: u64 = FLOAT3_SIZE;

/// Per-ray state byte scanned on the host as the convergence signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RayState {
    Active = 0,
    Inactive = 1,
    UpdateBuffer = 2,
    HitBackground = 3,
    ToRegenerate = 4,
    Regenerated = 5,
    ShadowRayCastAo = 6,
    ShadowRayCastDl = 7,
}

pub const RAY_INACTIVE: u8 = RayState::Inactive as u8;

/// Global texture table. Order is the binding order in every kernel.
pub const TEXTURE_NAMES: &[&str] = &[
    "__bvh_nodes",
    "__object_node",
    "__tri_woop",
    "__prim_type",
    "__prim_visibility",
    "__prim_index",
    "__prim_object",
    "__tri_shader",
    "__tri_vnormal",
    "__tri_vindex",
    "__tri_verts",
    "__light_distribution",
    "__light_data",
    "__light_background_marginal_cdf",
    "__light_background_conditional_cdf",
    "__particles",
    "__svm_nodes",
    "__shader_flag",
    "__object_flag",
    "__objects",
    "__objects_vector",
    "__attributes_map",
    "__attributes_float",
    "__attributes_float3",
    "__attributes_uchar4",
    "__lookup_table",
    "__sobol_directions",
];

/// One plain (non-closure) shader-data field: name plus per-ray footprint.
#[derive(Debug, Clone, Copy)]
pub struct SoaField {
    pub name: &'static str,
    pub elem_size: u64,
}

const fn field(name: &'static str, elem_size: u64) -> SoaField {
    SoaField { name, elem_size }
}

/// The shader-data record, one SoA allocation per field. The closure array
/// is sized separately from the compiled closure bound.
pub const SHADER_DATA_FIELDS: &[SoaField] = &[
    field("P", FLOAT3_SIZE),
    field("N", FLOAT3_SIZE),
    field("Ng", FLOAT3_SIZE),
    field("I", FLOAT3_SIZE),
    field("shader", INT_SIZE),
    field("flag", INT_SIZE),
    field("prim", INT_SIZE),
    field("type", INT_SIZE),
    field("u", FLOAT_SIZE),
    field("v", FLOAT_SIZE),
    field("object", INT_SIZE),
    field("time", FLOAT_SIZE),
    field("ray_length", FLOAT_SIZE),
    field("ray_depth", INT_SIZE),
    field("transparent_depth", INT_SIZE),
    field("dP", DIFFERENTIAL3_SIZE),
    field("dI", DIFFERENTIAL3_SIZE),
    field("du", DIFFERENTIAL_SIZE),
    field("dv", DIFFERENTIAL_SIZE),
    field("dPdu", FLOAT3_SIZE),
    field("dPdv", FLOAT3_SIZE),
    field("num_closure", INT_SIZE),
    field("randb_closure", FLOAT_SIZE),
    field("ray_P", FLOAT3_SIZE),
    field("ray_dP", DIFFERENTIAL3_SIZE),
];

/// Size of the kernel-side SoA header for one shader-data record: one
/// pointer per plain field, one for the closure array, plus one extra slot
/// kept for layout compatibility with the reference kernels.
pub fn shader_data_soa_size() -> u64 {
    (SHADER_DATA_FIELDS.len() as u64 + 2) * DEVICE_POINTER_SIZE
}

/// Size of the kernel-globals header: the data pointer plus one pointer per
/// texture slot.
pub fn kernel_globals_size() -> u64 {
    (TEXTURE_NAMES.len() as u64 + 1) * DEVICE_POINTER_SIZE
}

pub fn shader_closure_size(max_closure: u32) -> u64 {
    std::mem::size_of::<ShaderClosureRecord>() as u64 * max_closure as u64
}

/// Full shader-data volume for one ray: every plain field plus the closure
/// array at the compiled bound.
pub fn shader_data_size(shader_closure_bytes: u64) -> u64 {
    let base: u64 = SHADER_DATA_FIELDS.iter().map(|f| f.elem_size).sum();
    base + shader_closure_bytes
}

/// Features the scene translator requests from the kernels; compiled into
/// the split-kernel build options.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRequestedFeatures {
    pub max_closure: u32,
    pub max_nodes_group: u32,
    pub nodes_features: u32,
}

impl Default for DeviceRequestedFeatures {
    fn default() -> Self {
        Self {
            max_closure: MAX_CLOSURE,
            max_nodes_group: 0,
            nodes_features: 0,
        }
    }
}

/// Interactive renders round the closure bound up to the next multiple of 5
/// (capped at `MAX_CLOSURE`) so small scene edits don't force recompiles.
pub fn interactive_max_closure(requested: u32) -> u32 {
    let rounded = ((requested - 1) / 5 + 1) * 5;
    rounded.min(MAX_CLOSURE)
}

/// Structured kernel build options; the canonical string participates in
/// the device fingerprint, the preamble is spliced ahead of the WGSL source.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub vendor_flags: String,
    pub split_kernel: bool,
    pub megakernel_only: bool,
    pub work_stealing: bool,
    pub debug: bool,
    pub max_closure: Option<u32>,
    pub local_size: Option<(u32, u32)>,
}

impl BuildOptions {
    /// Canonical option string, stable across runs for fingerprinting.
    pub fn canonical(&self) -> String {
        let mut out = self.vendor_flags.clone();
        if self.split_kernel {
            out += "-D SPLIT_KERNEL ";
        }
        if self.megakernel_only {
            out += "-D COMPILE_ONLY_MEGAKERNEL ";
        }
        if self.work_stealing {
            out += "-D WORK_STEALING ";
        }
        if self.debug {
            out += "-D KERNEL_DEBUG ";
        }
        if let Some(m) = self.max_closure {
            out += &format!("-D MAX_CLOSURE={m} ");
        }
        if let Some((x, y)) = self.local_size {
            out += &format!("-D LOCAL_SIZE={x}x{y} ");
        }
        out
    }

    /// WGSL constant declarations the kernel sources compile against.
    pub fn wgsl_preamble(&self) -> String {
        let mut out = String::new();
        out += &format!("const SPLIT_KERNEL: bool = {};\n", self.split_kernel);
        out += &format!("const COMPILE_ONLY_MEGAKERNEL: bool = {};\n", self.megakernel_only);
        out += &format!("const WORK_STEALING: bool = {};\n", self.work_stealing);
        out += &format!("const KERNEL_DEBUG: bool = {};\n", self.debug);
        out += &format!(
            "const MAX_CLOSURE_COMPILED: u32 = {}u;\n",
            self.max_closure.unwrap_or(MAX_CLOSURE)
        );
        if let Some((x, y)) = self.local_size {
            out += &format!("const LOCAL_SIZE_X: u32 = {x}u;\nconst LOCAL_SIZE_Y: u32 = {y}u;\n");
        }
        out
    }
}

// Cooperation-record layouts mirrored from the kernel side.

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DifferentialVec3 {
    pub dx: [f32; 3],
    _pad0: f32,
    pub dy: [f32; 3],
    _pad1: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RayRecord {
    pub p: [f32; 3],
    pub t: f32,
    pub d: [f32; 3],
    pub time: f32,
    pub dp: DifferentialVec3,
    pub dd: DifferentialVec3,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct IntersectionRecord {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub prim: i32,
    pub object: i32,
    pub kind: i32,
    _pad: [i32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PathStateRecord {
    pub flag: i32,
    pub bounce: i32,
    pub diffuse_bounce: i32,
    pub glossy_bounce: i32,
    pub transmission_bounce: i32,
    pub transparent_bounce: i32,
    pub ray_pdf: f32,
    pub min_ray_pdf: f32,
    pub ray_t: f32,
    _pad: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PathRadianceRecord {
    pub emission: [f32; 4],
    pub background: [f32; 4],
    pub ao: [f32; 4],
    pub shadow: [f32; 4],
    pub direct_diffuse: [f32; 4],
    pub direct_glossy: [f32; 4],
    pub direct_transmission: [f32; 4],
    pub indirect_diffuse: [f32; 4],
    pub indirect_glossy: [f32; 4],
    pub indirect_transmission: [f32; 4],
    pub color_diffuse: [f32; 4],
    pub color_glossy: [f32; 4],
    pub color_transmission: [f32; 4],
    pub throughput: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BsdfEvalRecord {
    pub diffuse: [f32; 4],
    pub glossy: [f32; 4],
    pub transmission: [f32; 4],
    pub transparent: [f32; 4],
    pub subsurface: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ShaderClosureRecord {
    pub weight: [f32; 3],
    pub sample_weight: f32,
    pub n: [f32; 3],
    pub data0: f32,
    pub t: [f32; 3],
    pub data1: f32,
    pub kind: u32,
    pub prim: i32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DebugDataRecord {
    pub num_bvh_traversed_nodes: f32,
    pub num_bvh_traversed_instances: f32,
    pub num_ray_bounces: f32,
    _pad: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn record_footprints_match_kernel_layout() {
        assert_eq!(size_of::<DifferentialVec3>() as u64, DIFFERENTIAL3_SIZE);
        assert_eq!(size_of::<RayRecord>(), 96);
        assert_eq!(size_of::<IntersectionRecord>(), 32);
        assert_eq!(size_of::<PathStateRecord>(), 48);
        assert_eq!(size_of::<PathRadianceRecord>(), 224);
        assert_eq!(size_of::<BsdfEvalRecord>(), 80);
        assert_eq!(size_of::<ShaderClosureRecord>(), 64);
        assert_eq!(size_of::<DebugDataRecord>(), 16);
    }

    #[test]
    fn soa_header_keeps_extra_slot() {
        // 25 plain fields + closure array + the compatibility slot
        assert_eq!(shader_data_soa_size(), (25 + 2) * 8);
    }

    #[test]
    fn kernel_globals_counts_every_texture() {
        assert_eq!(
            kernel_globals_size(),
            (TEXTURE_NAMES.len() as u64 + 1) * DEVICE_POINTER_SIZE
        );
    }

    #[test]
    fn shader_data_size_includes_closures() {
        let closure = shader_closure_size(10);
        assert_eq!(closure, 640);
        let base = shader_data_size(0);
        assert_eq!(shader_data_size(closure), base + 640);
    }

    #[test]
    fn interactive_closure_rounding() {
        assert_eq!(interactive_max_closure(1), 5);
        assert_eq!(interactive_max_closure(5), 5);
        assert_eq!(interactive_max_closure(6), 10);
        assert_eq!(interactive_max_closure(17), 20);
        assert_eq!(interactive_max_closure(63), 65.min(MAX_CLOSURE));
        assert_eq!(interactive_max_closure(200), MAX_CLOSURE);
    }

    #[test]
    fn build_options_canonical_is_order_stable() {
        let opts = BuildOptions {
            vendor_flags: "-D KERNEL_COMPUTE_AMD ".into(),
            split_kernel: true,
            work_stealing: true,
            max_closure: Some(10),
            ..Default::default()
        };
        assert_eq!(
            opts.canonical(),
            "-D KERNEL_COMPUTE_AMD -D SPLIT_KERNEL -D WORK_STEALING -D MAX_CLOSURE=10 "
        );
        let preamble = opts.wgsl_preamble();
        assert!(preamble.contains("const SPLIT_KERNEL: bool = true;"));
        assert!(preamble.contains("const MAX_CLOSURE_COMPILED: u32 = 10u;"));
    }
}
