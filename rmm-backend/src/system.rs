//! Host and process metrics.

use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, RefreshKind, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Snapshot returned by `GET /api/system/info`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub platform: String,
    pub platform_version: String,
    pub host_name: Option<String>,
    pub cpu_count: usize,
    pub memory_total_gb: f64,
    pub memory_available_gb: f64,
    pub backend_memory_mb: f64,
    pub backend_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new()),
        );

        Self {
            platform: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            platform_version: System::os_version().unwrap_or_default(),
            host_name: System::host_name(),
            cpu_count: system.cpus().len(),
            memory_total_gb: system.total_memory() as f64 / BYTES_PER_GB,
            memory_available_gb: system.available_memory() as f64 / BYTES_PER_GB,
            backend_memory_mb: bytes_to_mb(process_memory_bytes()),
            backend_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Resident memory of the current process, 0 if it cannot be read.
pub fn process_memory_bytes() -> u64 {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_process(pid);
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}
