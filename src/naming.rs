//! Derivation of segment and endpoint names from the application identifier
//!
//! Every cooperating process computes the same names independently, with no
//! rendezvous step, by hashing the application identifier plus any
//! caller-supplied extra bytes.

use crate::platform::runtime_dir;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::path::PathBuf;

/// Derive the stable base name for an application identifier.
///
/// SHA-256 over `app_id ++ extra_hash_data`, first 16 digest bytes in hex.
pub fn derive_base_name(app_id: &str, extra_hash_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app_id.as_bytes());
    hasher.update(extra_hash_data);
    let digest = hasher.finalize();

    let mut name = String::with_capacity(8 + 32);
    name.push_str("uniproc-");
    for byte in &digest[..16] {
        // Writing to a String cannot fail
        let _ = write!(name, "{:02x}", byte);
    }
    name
}

/// Shared memory segment name for a base name
pub fn segment_name(base: &str) -> String {
    base.to_string()
}

/// Local socket endpoint path for a base name
pub fn endpoint_path(base: &str) -> PathBuf {
    runtime_dir().join(format!("{}.sock", base))
}
