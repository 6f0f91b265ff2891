//! Process identity and the non-destructive liveness probe used by
//! dead-holder recovery.

/// Pid of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Check if a process exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == current_pid() {
        return true;
    }
    // kill(pid, 0) checks existence without sending a signal
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        true
    } else {
        // EPERM means the process exists but belongs to someone else
        let errno = std::io::Error::last_os_error().raw_os_error();
        errno != Some(libc::ESRCH)
    }
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    // No probe available: never reclaim
    pid != 0
}
