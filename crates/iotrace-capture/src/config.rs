use crate::cpu;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUFFER_SIZE_MB: u64 = 64;
pub const DEFAULT_MAX_BUFFER_SIZE_MB: u64 = 1024;

/// Capture context settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CaptureConfig {
    /// Total trace buffer size across all CPUs, in MiB
    pub buffer_size_mb: u64,
    /// Upper bound accepted for `buffer_size_mb`
    pub max_buffer_size_mb: u64,
    /// Number of per-CPU buffers, the online CPU count when unset
    pub cpus: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_size_mb: DEFAULT_BUFFER_SIZE_MB,
            max_buffer_size_mb: DEFAULT_MAX_BUFFER_SIZE_MB,
            cpus: None,
        }
    }
}

impl CaptureConfig {
    pub fn cpu_count(&self) -> usize {
        self.cpus.unwrap_or_else(cpu::online_cpus)
    }
}
