// Device-dependent integration checks. Skips cleanly on machines without a
// usable compute adapter.

use cinder3d::{
    enumerate_devices, DeviceRequestedFeatures, MemoryKind, MemoryStats, RenderDevice,
};

fn first_device() -> Option<cinder3d::DeviceInfo> {
    let devices = enumerate_devices();
    if devices.is_empty() {
        eprintln!("no compute adapter available, skipping");
        return None;
    }
    Some(devices[0].clone())
}

#[test]
fn device_numbers_are_consecutive() {
    let devices = enumerate_devices();
    for (expected, info) in devices.iter().enumerate() {
        assert_eq!(info.num, expected as i32);
        assert_eq!(info.id, format!("COMPUTE_{expected}"));
    }
}

#[test]
fn memory_contract_roundtrip() -> anyhow::Result<()> {
    let Some(info) = first_device() else {
        return Ok(());
    };
    let stats = MemoryStats::new();
    let device = RenderDevice::create(&info, stats.clone(), true)?;

    let mem = device.mem_alloc("smoke-buffer", 256, MemoryKind::ReadWrite)?;
    assert!(stats.allocated() >= 256);

    let pattern: Vec<u8> = (0..=255u8).collect();
    device.mem_copy_to(&mem, &pattern);

    // rectangular readback of rows 2..6 of a 16-wide byte image
    let mut readback = vec![0u8; 256];
    device.mem_copy_from(&mem, 2, 16, 4, 1, &mut readback)?;
    assert_eq!(&readback[32..96], &pattern[32..96]);
    assert_eq!(&readback[..32], &[0u8; 32]);

    device.mem_zero(&mem);
    let mut zeroed = vec![0xffu8; 256];
    device.mem_copy_from(&mem, 0, 16, 16, 1, &mut zeroed)?;
    assert!(zeroed.iter().all(|&b| b == 0));

    let mut mem = mem;
    device.mem_free(&mut mem);
    assert_eq!(mem.size, 0);

    Ok(())
}

#[test]
fn texture_and_constant_registry() -> anyhow::Result<()> {
    let Some(info) = first_device() else {
        return Ok(());
    };
    let stats = MemoryStats::new();
    let device = RenderDevice::create(&info, stats.clone(), true)?;

    let tex = device.tex_alloc("__bvh_nodes", &vec![7u8; 1024])?;
    let after_alloc = stats.allocated();
    assert!(after_alloc >= 1024);

    // constants allocate once and re-upload in place
    device.const_copy_to("__data", &[1u8; 128])?;
    let after_const = stats.allocated();
    device.const_copy_to("__data", &[2u8; 128])?;
    assert_eq!(stats.allocated(), after_const);

    device.tex_free(&tex);
    assert!(stats.allocated() < after_alloc);

    Ok(())
}

// Without kernel sources on disk, loading kernels must fail cleanly and
// latch the first error instead of panicking.
#[test]
fn missing_kernel_sources_fail_load() -> anyhow::Result<()> {
    let Some(info) = first_device() else {
        return Ok(());
    };
    let device = RenderDevice::create(&info, MemoryStats::new(), true)?;

    std::env::set_var("CINDER3D_KERNEL_PATH", "/nonexistent/kernel/dir");
    let loaded = device.load_kernels(&DeviceRequestedFeatures::default());
    std::env::remove_var("CINDER3D_KERNEL_PATH");

    assert!(!loaded);
    assert!(device.error_message().is_some());
    Ok(())
}
