use sha2::{Digest, Sha256};

const KEY_PREFIX: &str = "adt_";
const KEY_ID_LEN: usize = 10;
const SECRET_LEN: usize = 32;

/// A freshly generated API key. `raw` is shown to the operator once and never
/// stored.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub raw: String,
    pub key_id: String,
    pub salt: String,
    pub hash: String,
    /// Display prefix: `adt_<key-id>_` plus the first four secret chars.
    pub prefix: String,
}

/// Generate a new tenant API key.
///
/// Raw key format: `adt_` + 10-char key id + `_` + 32 random hex chars.
/// The key id is the lookup handle; the whole raw key is hashed with a
/// per-key salt.
pub fn generate_api_key() -> GeneratedKey {
    use rand::RngCore;
    let mut secret = [0u8; SECRET_LEN / 2];
    rand::thread_rng().fill_bytes(&mut secret);
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let key_id = generate_key_id();
    let raw = format!("{KEY_PREFIX}{key_id}_{}", hex::encode(secret));
    let salt = hex::encode(salt);
    let hash = hash_api_key(&salt, &raw);
    let prefix = raw[..KEY_PREFIX.len() + KEY_ID_LEN + 1 + 4].to_string();

    GeneratedKey {
        raw,
        key_id,
        salt,
        hash,
        prefix,
    }
}

/// 10 random lowercase alphanumeric chars.
fn generate_key_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..KEY_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

/// Split a raw key into its key id, or `None` if it is malformed.
pub fn parse_api_key(raw: &str) -> Option<&str> {
    let rest = raw.strip_prefix(KEY_PREFIX)?;
    let (key_id, secret) = rest.split_once('_')?;
    let id_ok = key_id.len() == KEY_ID_LEN
        && key_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let secret_ok = secret.len() == SECRET_LEN && secret.chars().all(|c| c.is_ascii_hexdigit());
    (id_ok && secret_ok).then_some(key_id)
}

/// SHA-256 of `salt || raw`, hex encoded.
pub fn hash_api_key(salt: &str, raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare `raw` against a stored salt and hash without early exit.
pub fn verify_api_key(raw: &str, salt: &str, expected_hash: &str) -> bool {
    let actual = hash_api_key(salt, raw);
    let (a, b) = (actual.as_bytes(), expected_hash.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_parses_and_verifies() {
        let key = generate_api_key();
        assert!(key.raw.starts_with("adt_"));
        assert_eq!(key.raw.len(), 4 + 10 + 1 + 32);
        assert_eq!(parse_api_key(&key.raw), Some(key.key_id.as_str()));
        assert!(key.raw.starts_with(&key.prefix));
        assert!(verify_api_key(&key.raw, &key.salt, &key.hash));
    }

    #[test]
    fn wrong_secret_does_not_verify() {
        let key = generate_api_key();
        let tampered = format!("{}{}", &key.raw[..key.raw.len() - 1], if key.raw.ends_with('0') { '1' } else { '0' });
        assert!(!verify_api_key(&tampered, &key.salt, &key.hash));
    }

    #[test]
    fn same_key_with_different_salt_hashes_differently() {
        let raw = "adt_abcdefghij_0123456789abcdef0123456789abcdef";
        assert_ne!(hash_api_key("aa", raw), hash_api_key("bb", raw));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert_eq!(parse_api_key(""), None);
        assert_eq!(parse_api_key("spk_selfhosted_abc"), None);
        assert_eq!(parse_api_key("adt_short_0123456789abcdef0123456789abcdef"), None);
        assert_eq!(parse_api_key("adt_abcdefghij_not-hex"), None);
        assert_eq!(
            parse_api_key("adt_abcdefghij_0123456789abcdef0123456789abcdef"),
            Some("abcdefghij")
        );
    }
}
