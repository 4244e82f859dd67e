use libc::{
    CPU_COUNT, CPU_ISSET, CPU_SET, CPU_SETSIZE, CPU_ZERO, cpu_set_t, pthread_self,
    pthread_setaffinity_np, sched_getaffinity,
};
use syscalls::Errno;

pub fn pin_cpu(cpu: usize) -> Result<(), Errno> {
    unsafe {
        let mut cpuset = std::mem::zeroed();
        CPU_ZERO(&mut cpuset);
        CPU_SET(cpu, &mut cpuset);
        let ret =
            pthread_setaffinity_np(pthread_self(), size_of::<cpu_set_t>(), &cpuset);
        if ret != 0 {
            return Err(Errno::new(ret));
        }
        Ok(())
    }
}

/// CPUs the calling thread is currently allowed to run on, in ascending order.
pub fn allowed_cpus() -> Result<Vec<usize>, Errno> {
    unsafe {
        let mut cpuset: cpu_set_t = std::mem::zeroed();
        if sched_getaffinity(0, size_of::<cpu_set_t>(), &mut cpuset) != 0 {
            return Err(Errno::new(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            ));
        }
        let mut cpus = Vec::with_capacity(CPU_COUNT(&cpuset) as usize);
        for cpu in 0..CPU_SETSIZE as usize {
            if CPU_ISSET(cpu, &cpuset) {
                cpus.push(cpu);
            }
        }
        Ok(cpus)
    }
}

/// CPU for the `slot`-th worker: round-robin over the allowed set.
pub fn cpu_for_slot(allowed: &[usize], slot: usize) -> Option<usize> {
    if allowed.is_empty() { None } else { Some(allowed[slot % allowed.len()]) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_wrap_around_allowed_set() {
        let allowed = [2, 3, 7];
        assert_eq!(cpu_for_slot(&allowed, 0), Some(2));
        assert_eq!(cpu_for_slot(&allowed, 2), Some(7));
        assert_eq!(cpu_for_slot(&allowed, 3), Some(2));
        assert_eq!(cpu_for_slot(&[], 5), None);
    }

    #[test]
    fn pins_to_an_allowed_cpu() {
        let allowed = allowed_cpus().unwrap();
        assert!(!allowed.is_empty());
        std::thread::spawn(move || pin_cpu(allowed[0]))
            .join()
            .unwrap()
            .unwrap();
    }
}
