//! Content fingerprints for the on-disk kernel binary cache.
//!
//! A cached binary is only valid for the exact device, driver, build options
//! and kernel sources it was produced from; both fingerprints feed the cache
//! file name so any change lands on a different file.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{DriverError, DriverResult};

/// Hex digest length kept in file names.
const FINGERPRINT_LEN: usize = 32;

fn finish_hex(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Digest of the device identity: vendor, driver version, adapter name,
/// driver name and the kernel build options.
pub fn device_fingerprint(info: &wgpu::AdapterInfo, build_options: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(info.vendor.to_le_bytes());
    hasher.update(info.driver_info.as_bytes());
    hasher.update(info.name.as_bytes());
    hasher.update(info.driver.as_bytes());
    hasher.update(build_options.as_bytes());
    finish_hex(hasher)
}

fn collect_source_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_source_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Digest over every file under the kernel source directory, in sorted
/// order. Editing any kernel file forces a recompile through a new name.
pub fn kernel_sources_fingerprint(dir: &Path) -> DriverResult<String> {
    let mut files = Vec::new();
    collect_source_files(dir, &mut files).map_err(|e| {
        DriverError::SourceCompileFailed(format!(
            "can't read kernel sources in {}: {e}",
            dir.display()
        ))
    })?;
    files.sort();

    let mut hasher = Sha256::new();
    for path in &files {
        let contents = std::fs::read(path)?;
        let rel = path.strip_prefix(dir).unwrap_or(path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
    }
    Ok(finish_hex(hasher))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, driver: &str) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: name.to_string(),
            vendor: 0x1002,
            device: 0,
            device_type: wgpu::DeviceType::DiscreteGpu,
            driver: driver.to_string(),
            driver_info: "Vulkan 1.3".to_string(),
            backend: wgpu::Backend::Vulkan,
        }
    }

    #[test]
    fn device_fingerprint_is_deterministic() {
        let a = device_fingerprint(&info("Radeon", "amdvlk"), "-D KERNEL_COMPUTE_AMD ");
        let b = device_fingerprint(&info("Radeon", "amdvlk"), "-D KERNEL_COMPUTE_AMD ");
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn device_fingerprint_tracks_identity_and_options() {
        let base = device_fingerprint(&info("Radeon", "amdvlk"), "-D A ");
        assert_ne!(base, device_fingerprint(&info("Radeon VII", "amdvlk"), "-D A "));
        assert_ne!(base, device_fingerprint(&info("Radeon", "radv"), "-D A "));
        assert_ne!(base, device_fingerprint(&info("Radeon", "amdvlk"), "-D B "));
    }

    #[test]
    fn source_fingerprint_tracks_file_contents() {
        let dir = std::env::temp_dir().join(format!("cinder3d-fp-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("kernel_a.wgsl"), "fn a() {}").unwrap();
        std::fs::write(dir.join("kernel_b.wgsl"), "fn b() {}").unwrap();

        let first = kernel_sources_fingerprint(&dir).unwrap();
        let again = kernel_sources_fingerprint(&dir).unwrap();
        assert_eq!(first, again);

        std::fs::write(dir.join("kernel_b.wgsl"), "fn b() { let x = 1; }").unwrap();
        let changed = kernel_sources_fingerprint(&dir).unwrap();
        assert_ne!(first, changed);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
