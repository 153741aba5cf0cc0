//! Scheduling and memory-locking scaffolding for the real-time thread.
//!
//! Thin wrappers over the libc calls the runtime needs: `mlockall` during
//! process init, SCHED_FIFO election and CPU pinning for the processing
//! thread, and restoring a full CPU mask on the non-RT threads afterwards.

use std::io;

/// Lock current and future pages into RAM so the RT thread never faults.
pub fn lock_all_memory() -> io::Result<()> {
    let res = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Elect the calling thread into SCHED_FIFO at the given priority.
pub fn set_current_thread_fifo(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let res = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pin the calling thread to a single CPU.
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let res = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Restore the calling thread's affinity to every online CPU.
///
/// After the RT thread is created the spawning thread is left pinned; this
/// reverts it to the default of using all cores.
pub fn open_affinity_to_all_cpus() -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..num_cpus() {
            libc::CPU_SET(cpu, &mut set);
        }
        let res = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// CPUs the calling thread may currently run on.
pub fn current_affinity() -> io::Result<Vec<usize>> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        let res = libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((0..num_cpus())
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect())
    }
}

pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Monotonic clock in microseconds, 0 if the clock cannot be read.
pub fn monotonic_micros() -> i64 {
    let mut tp = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let res = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut tp) };
    if res != 0 {
        return 0;
    }
    tp.tv_sec as i64 * 1_000_000 + tp.tv_nsec as i64 / 1000
}
