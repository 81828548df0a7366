//! Disk-backed cache of compiled kernel program binaries.
//!
//! Binaries are pipeline-cache blobs keyed by the device and source
//! fingerprints. Load failures of any kind degrade to a source compile;
//! a failure to save after a successful compile is fatal, since the
//! expensive compile would otherwise repeat on every launch.

use std::path::{Path, PathBuf};

use crate::error::{DriverError, DriverResult};

/// Directory holding cached binaries, `CINDER3D_CACHE_PATH` or a per-user
/// temp location.
pub fn cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CINDER3D_CACHE_PATH") {
        return PathBuf::from(dir);
    }
    std::env::temp_dir().join("cinder3d").join("cache")
}

/// Cache file name for one compiled program.
pub fn cache_file_name(device_fp: &str, source_fp: &str, variant: Option<&str>) -> String {
    match variant {
        Some(v) => format!("cinder3d_kernel_{device_fp}_{source_fp}_{v}.bin"),
        None => format!("cinder3d_kernel_{device_fp}_{source_fp}.bin"),
    }
}

/// Name of the assembled-source dump written next to the binary when kernel
/// debugging is enabled.
pub fn debug_source_file_name(device_fp: &str, source_fp: &str, variant: Option<&str>) -> String {
    match variant {
        Some(v) => format!("cinder3d_kernel_{device_fp}_{source_fp}_{v}.wgsl"),
        None => format!("cinder3d_kernel_{device_fp}_{source_fp}.wgsl"),
    }
}

pub fn supports_binary_cache(device: &wgpu::Device) -> bool {
    device.features().contains(wgpu::Features::PIPELINE_CACHE)
}

/// Try to restore a pipeline cache from a previously saved blob.
///
/// Any failure (missing file, short read, driver rejecting the blob) is a
/// cache miss: the caller falls back to a fresh cache and a source compile.
pub fn load_pipeline_cache(
    device: &wgpu::Device,
    path: &Path,
    label: &str,
) -> Option<wgpu::PipelineCache> {
    if !supports_binary_cache(device) {
        return None;
    }
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            if path.exists() {
                log::warn!("failed to read cached binary {}: {err}", path.display());
            }
            return None;
        }
    };

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let cache = unsafe {
        device.create_pipeline_cache(&wgpu::PipelineCacheDescriptor {
            label: Some(label),
            data: Some(&data),
            fallback: false,
        })
    };
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        log::warn!(
            "cached binary {} rejected by driver, recompiling: {err}",
            path.display()
        );
        return None;
    }

    Some(cache)
}

/// Create an empty pipeline cache for a fresh compile.
pub fn fresh_pipeline_cache(device: &wgpu::Device, label: &str) -> Option<wgpu::PipelineCache> {
    if !supports_binary_cache(device) {
        return None;
    }
    Some(unsafe {
        device.create_pipeline_cache(&wgpu::PipelineCacheDescriptor {
            label: Some(label),
            data: None,
            fallback: true,
        })
    })
}

/// Persist the cache blob after a successful compile. Written to a sibling
/// temp file first so a crash never leaves a truncated cache entry behind.
pub fn save_pipeline_cache(cache: &wgpu::PipelineCache, path: &Path) -> DriverResult<()> {
    let data = cache.get_data().ok_or_else(|| {
        DriverError::BinarySaveFailed(format!(
            "driver returned no pipeline cache data for {}",
            path.display()
        ))
    })?;

    let parent = path
        .parent()
        .ok_or_else(|| DriverError::BinarySaveFailed(format!("bad cache path {}", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| DriverError::BinarySaveFailed(format!("{}: {e}", parent.display())))?;

    let tmp = path.with_extension("bin.tmp");
    std::fs::write(&tmp, &data)
        .map_err(|e| DriverError::BinarySaveFailed(format!("{}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| DriverError::BinarySaveFailed(format!("{}: {e}", path.display())))?;

    log::debug!("saved kernel binary {} ({} bytes)", path.display(), data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_deterministic_and_distinct() {
        let a = cache_file_name("devaaa", "srcbbb", None);
        assert_eq!(a, "cinder3d_kernel_devaaa_srcbbb.bin");
        assert_eq!(a, cache_file_name("devaaa", "srcbbb", None));

        assert_ne!(a, cache_file_name("devccc", "srcbbb", None));
        assert_ne!(a, cache_file_name("devaaa", "srcddd", None));
        assert_eq!(
            cache_file_name("devaaa", "srcbbb", Some("SceneIntersect")),
            "cinder3d_kernel_devaaa_srcbbb_SceneIntersect.bin"
        );
    }

    #[test]
    fn debug_dump_name_matches_binary_stem() {
        let bin = cache_file_name("d", "s", Some("DataInit"));
        let src = debug_source_file_name("d", "s", Some("DataInit"));
        assert_eq!(bin.trim_end_matches(".bin"), src.trim_end_matches(".wgsl"));
    }
}
