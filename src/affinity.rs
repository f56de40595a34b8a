//! CPU pinning for worker placement.
//!
//! The topology assigns each worker a cpu id; pinning the worker thread to
//! that cpu makes the victim graph's locality assumptions (shared L2 between
//! SMT siblings, shared L3 within a socket) actually hold at runtime.
//!
//! Linux only, via `pthread_setaffinity_np`. Elsewhere every operation
//! reports [`AffinityError::Unsupported`]; the scheduler treats pinning
//! failure as a warning, not an error.
//!
//! In containers the process may be confined to a subset of host cpus, so
//! cpu ids computed from a configured topology can be invalid even when the
//! host has that many cores. [`allowed_cpus`] exposes the actual mask.

use thiserror::Error;

/// Bits in the kernel affinity mask. Cpu ids at or beyond this are
/// rejected up front, the `CPU_SET` macro would index out of bounds.
#[cfg(target_os = "linux")]
pub const CPU_SET_CAPACITY: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

#[cfg(not(target_os = "linux"))]
pub const CPU_SET_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("cpu id {0} exceeds affinity mask capacity {CPU_SET_CAPACITY}")]
    OutOfRange(usize),
    #[error("affinity syscall failed: {0}")]
    Os(#[from] std::io::Error),
    #[error("thread affinity is not supported on this platform")]
    Unsupported,
}

fn validate_cpu(cpu: usize) -> Result<(), AffinityError> {
    if cpu >= CPU_SET_CAPACITY {
        return Err(AffinityError::OutOfRange(cpu));
    }
    Ok(())
}

/// Pin the calling thread to one cpu.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<(), AffinityError> {
    validate_cpu(cpu)?;

    // SAFETY: a zeroed cpu_set_t is a valid empty mask and `cpu` was bounds
    // checked, so CPU_SET stays inside it. pthread_setaffinity_np reports
    // errors through its return value, not errno.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);

        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set as *const _,
        );
        if rc != 0 {
            return Err(AffinityError::Os(std::io::Error::from_raw_os_error(rc)));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> Result<(), AffinityError> {
    validate_cpu(cpu)?;
    Err(AffinityError::Unsupported)
}

/// The set of cpus this process may run on (respects cgroups and taskset).
#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> Result<CpuSet, AffinityError> {
    let mut set = CpuSet::new();
    // SAFETY: pid 0 queries the calling thread; the mask is sized to the
    // struct we pass.
    unsafe {
        let rc = libc::sched_getaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut set.inner as *mut _,
        );
        if rc != 0 {
            return Err(AffinityError::Os(std::io::Error::last_os_error()));
        }
    }
    Ok(set)
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> Result<CpuSet, AffinityError> {
    Err(AffinityError::Unsupported)
}

/// Affinity mask wrapper. A stub off Linux.
#[derive(Clone)]
pub struct CpuSet {
    #[cfg(target_os = "linux")]
    inner: libc::cpu_set_t,
    #[cfg(not(target_os = "linux"))]
    _private: (),
}

impl CpuSet {
    pub fn new() -> Self {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: zeroed cpu_set_t is valid; CPU_ZERO normalizes it.
            let mut inner: libc::cpu_set_t = unsafe { std::mem::zeroed() };
            unsafe { libc::CPU_ZERO(&mut inner) };
            Self { inner }
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self { _private: () }
        }
    }

    #[cfg(target_os = "linux")]
    pub fn is_set(&self, cpu: usize) -> bool {
        if cpu >= CPU_SET_CAPACITY {
            return false;
        }
        // SAFETY: bounds checked above.
        unsafe { libc::CPU_ISSET(cpu, &self.inner) }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn is_set(&self, _cpu: usize) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    pub fn count(&self) -> usize {
        // SAFETY: the mask is always a valid cpu_set_t.
        unsafe { libc::CPU_COUNT(&self.inner) as usize }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn count(&self) -> usize {
        0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..CPU_SET_CAPACITY).filter(move |&cpu| self.is_set(cpu))
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_rejected_before_syscall() {
        assert!(matches!(
            pin_current_thread(CPU_SET_CAPACITY),
            Err(AffinityError::OutOfRange(_))
        ));
        assert!(matches!(
            pin_current_thread(usize::MAX),
            Err(AffinityError::OutOfRange(_))
        ));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn allowed_set_is_nonempty() {
        let allowed = allowed_cpus().unwrap();
        assert!(allowed.count() >= 1);
        assert_eq!(allowed.iter().count(), allowed.count());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn pinning_to_an_allowed_cpu_succeeds() {
        let allowed = allowed_cpus().unwrap();
        let cpu = allowed.iter().next().unwrap();
        pin_current_thread(cpu).unwrap();
    }

    #[test]
    #[cfg(not(target_os = "linux"))]
    fn unsupported_off_linux() {
        assert!(matches!(
            pin_current_thread(0),
            Err(AffinityError::Unsupported)
        ));
        assert!(matches!(allowed_cpus(), Err(AffinityError::Unsupported)));
    }

    #[test]
    fn stale_bits_never_read_out_of_bounds() {
        let set = CpuSet::new();
        assert!(!set.is_set(CPU_SET_CAPACITY));
        assert!(!set.is_set(usize::MAX));
    }
}
