//! cinder3d: host-side driver for a tiled GPU path tracer on wgpu.
//!
//! The driver turns render tiles into sequences of compute kernel launches
//! under two dispatch strategies. The megakernel path launches one
//! monolithic path-trace kernel per tile per sample; the split-kernel path
//! advances many rays in lockstep through an eleven-stage wavefront
//! pipeline coordinated by device-resident queues, with host-side
//! convergence polling. Around them sit a process-wide single-flight
//! program cache, a disk-backed binary cache keyed by device and source
//! fingerprints, a typed registry of named device buffers, and a planner
//! that subdivides tiles the device memory cannot hold.
//!
//! ```no_run
//! use cinder3d::{enumerate_devices, DeviceRequestedFeatures, MemoryStats, RenderDevice};
//!
//! let devices = enumerate_devices();
//! let stats = MemoryStats::new();
//! let device = RenderDevice::create(&devices[0], stats, true)?;
//! if !device.load_kernels(&DeviceRequestedFeatures::default()) {
//!     eprintln!("{}", device.error_message().unwrap_or_default());
//! }
//! # Ok::<(), cinder3d::DriverError>(())
//! ```

pub mod args;
pub mod binary_cache;
pub mod buffers;
pub mod device;
pub mod device_caps;
pub mod error;
pub mod fingerprint;
pub mod gpu;
pub mod kernel_params;
pub mod program_cache;
pub mod stats;
pub mod tile;
pub mod worker;

pub use buffers::{DeviceBuffer, MemoryKind};
pub use device::RenderDevice;
pub use error::{DriverError, DriverResult};
pub use gpu::{enumerate_devices, DeviceInfo};
pub use kernel_params::DeviceRequestedFeatures;
pub use stats::MemoryStats;
pub use tile::{DeviceTask, RenderTile, TaskKind};
