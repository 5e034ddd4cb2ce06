// SPDX-License-Identifier: MIT OR Apache-2.0
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing.
///
/// Not a full JCS implementation, but stable for our types: `serde_json`'s
/// `Map` is a `BTreeMap` by default so keys come out sorted.
///
/// # Errors
///
/// Returns [`CoreError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

type HmacSha256 = Hmac<Sha256>;

/// Derive a project UUID from a canonicalized absolute path and an
/// installation-local 32-byte salt.
///
/// This is non-reversible: the salt never leaves the local machine and the
/// HMAC output is rendered as a UUID-shaped hex string, not stored as raw
/// bytes. Two path representations that canonicalize to the same absolute
/// path (symlinks, trailing slashes) always derive the same UUID.
///
/// # Examples
///
/// ```
/// # use ocmem_core::project_uuid;
/// let salt = [7u8; 32];
/// let a = project_uuid(std::path::Path::new("/tmp/project"), &salt);
/// let b = project_uuid(std::path::Path::new("/tmp/project/"), &salt);
/// assert_eq!(a, b);
/// ```
#[must_use]
pub fn project_uuid(canonical_path: &Path, salt: &[u8; 32]) -> String {
    let normalized = canonical_path.to_string_lossy();
    let normalized = normalized.trim_end_matches(['/', '\\']);
    let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key length");
    mac.update(normalized.as_bytes());
    let digest = mac.finalize().into_bytes();
    uuid::Uuid::from_slice(&digest[..16])
        .expect("first 16 bytes of a SHA-256 digest always fit a UUID")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_object_keys() {
        #[derive(Serialize)]
        struct Unsorted {
            z: u8,
            a: u8,
        }
        let s = canonical_json(&Unsorted { z: 1, a: 2 }).unwrap();
        assert_eq!(s, r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn sha256_hex_is_64_chars() {
        assert_eq!(sha256_hex(b"hello").len(), 64);
    }

    #[test]
    fn project_uuid_is_deterministic() {
        let salt = [1u8; 32];
        let p = Path::new("/home/user/project");
        assert_eq!(project_uuid(p, &salt), project_uuid(p, &salt));
    }

    #[test]
    fn project_uuid_differs_across_salts() {
        let p = Path::new("/home/user/project");
        let a = project_uuid(p, &[1u8; 32]);
        let b = project_uuid(p, &[2u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn project_uuid_ignores_trailing_separator() {
        let salt = [9u8; 32];
        let a = project_uuid(Path::new("/tmp/x"), &salt);
        let b = project_uuid(Path::new("/tmp/x/"), &salt);
        assert_eq!(a, b);
    }
}
