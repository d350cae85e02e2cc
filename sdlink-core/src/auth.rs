//! Password proof for the capability reply: lower-case hex SHA-1 of `password + challenge`.

use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Hash `password` salted with the peer's challenge.
pub fn password_hash(password: &str, challenge: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Value for the `passwordHash` capability field. Empty when no password is configured.
pub fn capability_hash(password: Option<&str>, challenge: &str) -> String {
    match password {
        Some(p) if !p.is_empty() => password_hash(p, challenge),
        _ => String::new(),
    }
}

/// Fresh challenge for sessions where the peer did not send one.
pub fn new_challenge() -> String {
    Uuid::new_v4().simple().to_string()
}
