use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use argon2::{Algorithm, Argon2, Params, Version};

/// PHC-encoded argon2id hash of the admin bearer token. Constructed only via
/// `parse_admin_token_hash` / `hash_admin_token`, so holding one means the
/// encoding already checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTokenHash(String);

impl AdminTokenHash {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

pub fn parse_admin_token_hash(raw: &str) -> Option<AdminTokenHash> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.starts_with("$argon2id$") {
        return None;
    }
    let parsed = PasswordHash::new(raw).ok()?;
    if parsed.algorithm.as_str() != "argon2id" {
        return None;
    }
    Some(AdminTokenHash(raw.to_string()))
}

/// Hashes a plaintext token for use with `--admin-token-hash`.
/// m=64 MiB, t=3, p=1.
pub fn hash_admin_token(token_plaintext: &str) -> Result<AdminTokenHash, String> {
    if token_plaintext.trim().is_empty() {
        return Err("token is empty".to_string());
    }

    let params = Params::new(65_536, 3, 1, None).map_err(|e| format!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(token_plaintext.as_bytes(), &salt)
        .map_err(|e| format!("argon2 hash: {e}"))?
        .to_string();

    Ok(AdminTokenHash(hash))
}

pub fn verify_admin_token(token_plaintext: &str, expected: &AdminTokenHash) -> bool {
    if token_plaintext.is_empty() {
        return false;
    }
    let Ok(parsed) = PasswordHash::new(expected.as_str()) else {
        return false;
    };
    if parsed.algorithm.as_str() != "argon2id" {
        return false;
    }
    Argon2::default()
        .verify_password(token_plaintext.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty_and_non_argon2id_inputs() {
        assert!(parse_admin_token_hash("").is_none());
        assert!(parse_admin_token_hash("   ").is_none());
        assert!(parse_admin_token_hash("plaintext-token").is_none());
        assert!(parse_admin_token_hash("$argon2id$not-a-valid-phc").is_none());
    }

    #[test]
    fn hash_then_verify_roundtrip() {
        let hash = hash_admin_token("correct horse battery staple").unwrap();
        assert!(parse_admin_token_hash(hash.as_str()).is_some());
        assert!(verify_admin_token("correct horse battery staple", &hash));
        assert!(!verify_admin_token("wrong token", &hash));
        assert!(!verify_admin_token("", &hash));
    }

    #[test]
    fn hash_rejects_empty_token() {
        assert!(hash_admin_token("").is_err());
        assert!(hash_admin_token("   ").is_err());
    }
}
