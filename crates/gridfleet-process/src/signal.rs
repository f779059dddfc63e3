//! Signal helpers for processes this run did not spawn.

use std::io;

/// SIGKILL `pid`. `Ok(false)` if it was already gone.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> io::Result<bool> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGKILL) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        _ => Err(err),
    }
}

/// `taskkill /F` on `pid`. `Ok(false)` if it was already gone.
#[cfg(windows)]
pub fn force_kill(pid: u32) -> io::Result<bool> {
    let output = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()?;
    if output.status.success() {
        return Ok(true);
    }
    if !is_alive(pid) {
        return Ok(false);
    }
    Err(io::Error::other(
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    ))
}

#[cfg(not(any(unix, windows)))]
pub fn force_kill(_pid: u32) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "killing adopted processes is not supported on this platform",
    ))
}

/// Whether `pid` still exists. EPERM means it exists but belongs to
/// someone else.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence/permission check.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether `tasklist` still lists `pid`.
#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    let filter = format!("PID eq {pid}");
    match std::process::Command::new("tasklist")
        .args(["/FI", &filter, "/FO", "CSV", "/NH"])
        .output()
    {
        Ok(output) => crate::table::parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout))
            .iter()
            .any(|p| p.pid == pid),
        // Unknown counts as alive so the caller keeps tracking it.
        Err(_) => true,
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_alive(_pid: u32) -> bool {
    true
}
