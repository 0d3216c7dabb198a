//! Platform-specific primitives

mod linux;

pub use linux::{current_pid, current_user_name, lock_file, runtime_dir, shm_dir, unlock_file};
