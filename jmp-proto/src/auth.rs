use md5::{Digest, Md5};
use rand::Rng;

/// Computes the JMP login digest for a server-issued nonce.
///
/// The transmitted value is `username + ":" + hex(MD5(username + ":" +
/// nonce + ":" + password))`, sent in the `Auth-Digest` field of the login
/// message. MD5 is what the device firmware speaks; it is not used here for
/// anything beyond that challenge/response.
pub fn compute_auth_digest(username: &str, password: &str, nonce: &str) -> String {
    let salted = format!("{}:{}:{}", username, nonce, password);
    let digest = hex::encode(Md5::digest(salted.as_bytes()));
    format!("{}:{}", username, digest)
}

/// Generates an 8-character hex correlation token for `Meta.Hash`.
pub fn generate_hash() -> String {
    let mut rng = rand::thread_rng();
    let token: [u8; 4] = rng.gen();
    hex::encode(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let digest = compute_auth_digest("alice", "secret", "n0nce123");
        assert_eq!(digest, "alice:f8347ab12b30d7ede978e00c38f617e9");
    }

    #[test]
    fn test_digest_is_salted_by_nonce() {
        let first = compute_auth_digest("jnior", "jnior", "abc");
        let second = compute_auth_digest("jnior", "jnior", "xyz");
        assert_ne!(first, second);
        assert!(first.starts_with("jnior:"));
    }

    #[test]
    fn test_generate_hash() {
        let hash1 = generate_hash();
        let hash2 = generate_hash();

        assert_eq!(hash1.len(), 8); // 4 bytes = 8 hex chars
        assert_ne!(hash1, hash2);
    }
}
