//! Device capabilities and vendor-specific behavior.
//!
//! Classifies adapters by vendor, gates on the minimum driver API version
//! and assembles the per-vendor kernel build option string that also feeds
//! the binary-cache fingerprint.

use std::path::Path;

use crate::error::{DriverError, DriverResult};

/// Minimum supported driver API version.
pub const REQUIRED_API_VERSION: (u32, u32) = (1, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other,
}

/// Classify an adapter by PCI vendor id, falling back to name matching for
/// drivers that report a zero id.
pub fn vendor_of(info: &wgpu::AdapterInfo) -> Vendor {
    match info.vendor {
        0x10de => Vendor::Nvidia,
        0x1002 | 0x1022 => Vendor::Amd,
        0x8086 => Vendor::Intel,
        0x106b => Vendor::Apple,
        _ => {
            let name = info.name.to_lowercase();
            if name.contains("nvidia") {
                Vendor::Nvidia
            } else if name.contains("amd") || name.contains("radeon") {
                Vendor::Amd
            } else if name.contains("intel") {
                Vendor::Intel
            } else if name.contains("apple") {
                Vendor::Apple
            } else {
                Vendor::Other
            }
        }
    }
}

/// Human-readable platform string, used for strategy selection and logs.
pub fn platform_name(info: &wgpu::AdapterInfo) -> String {
    let vendor = match vendor_of(info) {
        Vendor::Nvidia => "NVIDIA",
        Vendor::Amd => "AMD",
        Vendor::Intel => "Intel",
        Vendor::Apple => "Apple",
        Vendor::Other => "Unknown",
    };
    format!("{vendor} {:?}", info.backend)
}

/// Keep this in sync with the kernel feature tables.
pub fn advanced_shading(vendor: Vendor) -> bool {
    match vendor {
        Vendor::Nvidia => true,
        Vendor::Apple => false,
        Vendor::Amd => false,
        Vendor::Intel => true,
        Vendor::Other => false,
    }
}

pub fn kernel_debug_enabled() -> bool {
    std::env::var_os("CINDER3D_KERNEL_DEBUG").is_some()
}

/// Vendor-specific kernel build options. The returned string participates in
/// the device fingerprint, so any change here invalidates cached binaries.
pub fn kernel_build_options(info: &wgpu::AdapterInfo, debug_src: Option<&Path>) -> String {
    let mut build_options = String::from(" -fast-relaxed-math ");

    match vendor_of(info) {
        Vendor::Nvidia => {
            build_options += "-D KERNEL_COMPUTE_NVIDIA -maxrregcount=32 -verbose ";
        }
        Vendor::Apple => {
            build_options += "-D KERNEL_COMPUTE_APPLE ";
        }
        Vendor::Amd => {
            build_options += "-D KERNEL_COMPUTE_AMD ";
        }
        Vendor::Intel if info.device_type == wgpu::DeviceType::Cpu => {
            build_options += "-D KERNEL_COMPUTE_INTEL_CPU ";

            // source level kernel debugging, only meaningful on the CPU driver
            if kernel_debug_enabled() {
                if let Some(src) = debug_src {
                    build_options += &format!("-g -s \"{}\" ", src.display());
                }
            }
        }
        _ => {}
    }

    if kernel_debug_enabled() {
        build_options += "-D KERNEL_COMPUTE_DEBUG ";
    }

    build_options
}

/// Parse the first `major.minor` pair out of a driver version string.
pub fn parse_api_version(version: &str) -> Option<(u32, u32)> {
    let bytes = version.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                let major: u32 = version[start..i].parse().ok()?;
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                let minor: u32 = version[i + 1..j].parse().ok()?;
                return Some((major, minor));
            }
        } else {
            i += 1;
        }
    }
    None
}

fn meets_requirement(major: u32, minor: u32) -> bool {
    let (req_major, req_minor) = REQUIRED_API_VERSION;
    (major == req_major && minor >= req_minor) || major > req_major
}

/// Gate kernel loading on the minimum driver API version. A version string
/// that fails to parse counts as a failure, same as a version that is too low.
pub fn version_check(info: &wgpu::AdapterInfo) -> DriverResult<()> {
    let version = if info.driver_info.is_empty() {
        &info.driver
    } else {
        &info.driver_info
    };

    let (major, minor) = parse_api_version(version).ok_or_else(|| {
        DriverError::VersionTooLow(format!(
            "failed to parse driver version string ({version})"
        ))
    })?;

    if !meets_requirement(major, minor) {
        return Err(DriverError::VersionTooLow(format!(
            "driver version {}.{} or later required, found {major}.{minor}",
            REQUIRED_API_VERSION.0, REQUIRED_API_VERSION.1
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(vendor: u32, name: &str, device_type: wgpu::DeviceType) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: name.to_string(),
            vendor,
            device: 0,
            device_type,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        }
    }

    #[test]
    fn vendor_classification() {
        assert_eq!(
            vendor_of(&info_with(0x10de, "GeForce", wgpu::DeviceType::DiscreteGpu)),
            Vendor::Nvidia
        );
        assert_eq!(
            vendor_of(&info_with(0x1002, "Radeon", wgpu::DeviceType::DiscreteGpu)),
            Vendor::Amd
        );
        assert_eq!(
            vendor_of(&info_with(0, "AMD Radeon RX 6800", wgpu::DeviceType::DiscreteGpu)),
            Vendor::Amd
        );
        assert_eq!(
            vendor_of(&info_with(0, "llvmpipe", wgpu::DeviceType::Cpu)),
            Vendor::Other
        );
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_api_version("Vulkan 1.3.280"), Some((1, 3)));
        assert_eq!(parse_api_version("OpenGL 3.3 core"), Some((3, 3)));
        assert_eq!(parse_api_version("535.161.08"), Some((535, 161)));
        assert_eq!(parse_api_version("no digits here"), None);
        assert_eq!(parse_api_version("v7"), None);
    }

    #[test]
    fn version_gate() {
        assert!(meets_requirement(1, 1));
        assert!(meets_requirement(1, 2));
        assert!(meets_requirement(2, 0));
        assert!(!meets_requirement(1, 0));
        assert!(!meets_requirement(0, 9));
    }

    #[test]
    fn build_options_select_vendor_defines() {
        let amd = info_with(0x1002, "Radeon", wgpu::DeviceType::DiscreteGpu);
        let opts = kernel_build_options(&amd, None);
        assert!(opts.contains("KERNEL_COMPUTE_AMD"));
        assert!(opts.contains("-fast-relaxed-math"));

        let nv = info_with(0x10de, "GeForce", wgpu::DeviceType::DiscreteGpu);
        assert!(kernel_build_options(&nv, None).contains("maxrregcount"));
    }
}
