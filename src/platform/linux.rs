//! Linux-specific process and file locking primitives

use nix::unistd::{User, geteuid, getpid};
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Get current process ID
pub fn current_pid() -> i64 {
    getpid().as_raw() as i64
}

/// Get the current OS user name.
///
/// Falls back to the `USER` environment variable, then to `"unknown"`, when
/// the uid has no passwd entry (containers, scratch images).
pub fn current_user_name() -> String {
    if let Ok(Some(user)) = User::from_uid(geteuid()) {
        return user.name;
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Directory backing shared memory segments
pub fn shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

/// Directory for local socket endpoints.
///
/// `XDG_RUNTIME_DIR` when set (cleaned up on logout), `/tmp` otherwise.
pub fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Acquire an exclusive advisory lock on an open file, blocking until granted
pub fn lock_file(fd: RawFd) -> io::Result<()> {
    flock_retry(fd, libc::LOCK_EX)
}

/// Release an advisory lock held on an open file
pub fn unlock_file(fd: RawFd) -> io::Result<()> {
    flock_retry(fd, libc::LOCK_UN)
}

fn flock_retry(fd: RawFd, op: libc::c_int) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::flock(fd, op) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
