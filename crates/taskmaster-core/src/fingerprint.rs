//! Workload fingerprinting: `hash(image ∥ command)` identifies a workload
//! class for the Tau Store (§4.1).

use sha2::{Digest, Sha256};

/// Compute the stable fingerprint for a `(docker_image, command)` pair.
///
/// Two tasks with the same image and command share a fingerprint and thus
/// a runtime estimate, regardless of `task_id` or submission time.
pub fn fingerprint(docker_image: &str, command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(docker_image.as_bytes());
    hasher.update(b"\0");
    hasher.update(command.as_bytes());
    hex::encode(hasher.finalize())
}
