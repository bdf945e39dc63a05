use sha2::{Digest, Sha256};

/// Salted SHA-256, stored as `hex(salt)$hex(hash)`. Mirrors the PIN hashing
/// in `passcode::hash_pin`; a production deployment swaps this for argon2
/// without touching `UserStore`, which only ever sees the opaque string.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    format!("{}${}", hex::encode(salt), hex::encode(hasher.finalize()))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize()) == hash_hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_correct_password() {
        let stored = hash_password("correct horse battery staple");
        assert!(verify_password("correct horse battery staple", &stored));
        assert!(!verify_password("wrong", &stored));
    }

    #[test]
    fn two_hashes_of_the_same_password_differ_by_salt() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }
}
