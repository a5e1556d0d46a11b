#![allow(unused)]

use anyhow::{Result, anyhow};

const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char).
// It's limited to 16 bytes, including the null terminator.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // The buffer is zero-initialized and we write at most
    // MAX_PTHREAD_NAME_LEN - 1 bytes, so it stays null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for i in 0..len_to_copy {
        c_name_buf[i] = bytes[i] as libc::c_char;
    }

    unsafe {
        let thread = libc::pthread_self();
        libc::pthread_setname_np(thread, c_name_buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

/// Pin the calling thread to one CPU core.
#[cfg(target_os = "linux")]
pub(crate) fn pin_current_thread_to_core(core_id: usize) -> Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core_id)
        .map_err(|e| anyhow!("core {} does not fit in the cpu set: {}", core_id, e))?;

    // Pid 0 targets the calling thread.
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| anyhow!("sched_setaffinity failed: {}", e))?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_current_thread_to_core(_core_id: usize) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_to_first_core() -> Result<()> {
        std::thread::spawn(|| pin_current_thread_to_core(0))
            .join()
            .unwrap()
    }
}
