//! Accelerator memory housekeeping around sample generation.

use anyhow::Result;
use candle_core::Device;
use log::{debug, info};
use std::process::Command;

/// Wait for queued kernels so buffers dropped by the caller are actually released.
///
/// candle has no allocator cache to flush; synchronizing is the closest equivalent.
pub fn clear_cuda_cache(device: &Device) -> Result<()> {
    if device.is_cuda() {
        device.synchronize()?;
        debug!("Synchronized {:?} after releasing buffers", device);
    }
    Ok(())
}

/// Used and total GPU memory in MiB as reported by `nvidia-smi`, when available.
pub fn gpu_memory_mib() -> Option<(f32, f32)> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.used,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let info = String::from_utf8_lossy(&output.stdout);
    let mut parts = info.lines().next()?.split(',').map(|p| p.trim().parse::<f32>());
    let used = parts.next()?.ok()?;
    let total = parts.next()?.ok()?;
    Some((used, total))
}

pub fn log_memory_usage(stage: &str, device: &Device) {
    if !device.is_cuda() {
        return;
    }
    match gpu_memory_mib() {
        Some((used, total)) => info!(
            "[{}] GPU memory: {:.1}GB/{:.1}GB used",
            stage,
            used / 1024.0,
            total / 1024.0
        ),
        None => debug!("[{}] GPU memory info not available", stage),
    }
}
