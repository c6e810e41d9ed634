//! Trace buffer sizing rules

use crate::error::CaptureError;

pub const MIB: u64 = 1024 * 1024;

/// Compute the per-CPU buffer capacity, in bytes, for a total size given in MiB.
///
/// The total is split evenly across CPUs and the result floored. Fails when the total
/// exceeds `max_total_mb` or when a CPU would end up with an empty buffer.
pub fn per_cpu_capacity(total_mb: u64, cpus: usize, max_total_mb: u64) -> Result<u64, CaptureError> {
    if cpus == 0 {
        return Err(CaptureError::invalid("cpu count must be at least 1"));
    }
    if total_mb > max_total_mb {
        return Err(CaptureError::invalid(format!(
            "buffer size {total_mb} MiB exceeds the maximum of {max_total_mb} MiB"
        )));
    }

    let capacity = total_mb
        .checked_mul(MIB)
        .ok_or_else(|| CaptureError::invalid(format!("buffer size {total_mb} MiB overflows")))?
        / cpus as u64;
    if capacity == 0 {
        return Err(CaptureError::invalid(format!(
            "buffer size {total_mb} MiB leaves no room per cpu across {cpus} cpus"
        )));
    }

    Ok(capacity)
}

/// Total size across all CPUs, in MiB, for a given per-CPU capacity
pub fn total_size_mb(per_cpu_capacity: u64, cpus: usize) -> u64 {
    per_cpu_capacity.saturating_mul(cpus as u64) / MIB
}
