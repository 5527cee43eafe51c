/// Privilege detection for the executor
///
/// Commands are wrapped in `su` unless the current process already runs as
/// root, in which case the helper binary is executed directly.

/// Check if the current process is running as root
#[cfg(unix)]
pub fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}

/// Display elevation status information
pub fn get_elevation_status() -> String {
    if is_elevated() {
        "Running as root, helper commands are executed directly".to_string()
    } else {
        "Not running as root, helper commands go through su".to_string()
    }
}
