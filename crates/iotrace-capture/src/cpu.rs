//! CPU topology and affinity helpers

use crate::prelude::*;
use nix::sched::{CpuSet, sched_getcpu, sched_setaffinity};
use nix::unistd::Pid;

/// Number of online CPUs, at least 1
pub fn online_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        warn!("Failed to query online cpus, assuming 1");
        return 1;
    }
    ret as usize
}

/// CPU the calling thread is currently running on.
///
/// Only a hint: the thread may migrate right after this returns unless it is pinned.
pub fn current_cpu() -> Option<usize> {
    sched_getcpu().ok()
}

/// Restrict the calling thread to a single CPU
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)
        .with_context(|| format!("cpu {cpu} is beyond the supported affinity mask"))?;
    sched_setaffinity(Pid::from_raw(0), &set)
        .with_context(|| format!("Failed to pin thread to cpu {cpu}"))?;

    Ok(())
}

/// Monotonic clock in nanoseconds
pub fn monotonic_ns() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_cpus() {
        assert!(online_cpus() >= 1);
    }

    #[test]
    fn test_monotonic_ns_does_not_go_back() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_pin_current_thread() {
        let cpu = current_cpu().unwrap_or(0);
        std::thread::spawn(move || {
            pin_current_thread(cpu).unwrap();
            assert_eq!(current_cpu(), Some(cpu));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_pin_beyond_mask_fails() {
        let err = pin_current_thread(CpuSet::count()).unwrap_err();
        assert!(err.to_string().contains("beyond the supported affinity mask"));
    }
}
