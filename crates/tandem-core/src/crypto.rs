//! Randomness and hashing for Tandem
//!
//! Provides:
//! - Pairing code, public room id and room secret generation
//! - Format validation for client-supplied codes and secrets
//! - Keyed BLAKE3 identity hashes used for peer id resumption

use blake3::Hash;

/// Length of a pairing code in digits
pub const PAIRING_CODE_LENGTH: usize = 6;

/// Length of a public room id in characters
pub const PUBLIC_ROOM_ID_LENGTH: usize = 5;

/// Length of a server-generated room secret
pub const ROOM_SECRET_LENGTH: usize = 256;

/// Shortest room secret accepted from a client
pub const ROOM_SECRET_MIN_LENGTH: usize = 64;

/// Longest room secret accepted from a client
pub const ROOM_SECRET_MAX_LENGTH: usize = 256;

/// Size of the identity key in bytes
pub const IDENTITY_KEY_SIZE: usize = 32;

/// Number of distinct pairing codes (000000..=999999)
const PAIRING_CODE_SPACE: u32 = 1_000_000;

/// Characters used in room secrets (64 symbols, so a byte maps without bias)
const ROOM_SECRET_CHARS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Try to generate a 6-digit pairing code, leading zeros preserved (e.g. "042817")
pub fn try_generate_pairing_code() -> Result<String, getrandom::Error> {
    // Largest multiple of the code space that fits in a u32
    let zone = u32::MAX - (u32::MAX % PAIRING_CODE_SPACE);
    loop {
        let mut bytes = [0u8; 4];
        getrandom::getrandom(&mut bytes)?;
        let value = u32::from_le_bytes(bytes);
        if value < zone {
            return Ok(format!(
                "{:0width$}",
                value % PAIRING_CODE_SPACE,
                width = PAIRING_CODE_LENGTH
            ));
        }
    }
}

/// Try to generate a public room id of five lowercase letters (e.g. "qzmfa")
pub fn try_generate_public_room_id() -> Result<String, getrandom::Error> {
    let mut id = String::with_capacity(PUBLIC_ROOM_ID_LENGTH);
    let mut bytes = [0u8; 16];
    while id.len() < PUBLIC_ROOM_ID_LENGTH {
        getrandom::getrandom(&mut bytes)?;
        // 234 = 26 * 9, reject the tail to keep letters uniform
        for b in bytes.iter().filter(|b| **b < 234) {
            if id.len() == PUBLIC_ROOM_ID_LENGTH {
                break;
            }
            id.push((b'a' + b % 26) as char);
        }
    }
    Ok(id)
}

/// Try to generate a fresh room secret of `ROOM_SECRET_LENGTH` characters
pub fn try_generate_room_secret() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; ROOM_SECRET_LENGTH];
    getrandom::getrandom(&mut bytes)?;
    Ok(bytes
        .iter()
        .map(|b| ROOM_SECRET_CHARS[(*b & 0x3f) as usize] as char)
        .collect())
}

/// Validate a pairing code format
pub fn validate_pairing_code(code: &str) -> bool {
    code.len() == PAIRING_CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit())
}

/// Validate a public room id format
pub fn validate_public_room_id(id: &str) -> bool {
    id.len() == PUBLIC_ROOM_ID_LENGTH && id.bytes().all(|b| b.is_ascii_lowercase())
}

/// Validate a client-supplied room secret: 64-256 printable ASCII characters
pub fn validate_room_secret(secret: &str) -> bool {
    (ROOM_SECRET_MIN_LENGTH..=ROOM_SECRET_MAX_LENGTH).contains(&secret.len())
        && secret.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Process-lifetime key used to sign peer ids
///
/// A client that reconnects presents its previous id together with the
/// hash handed out by `sign`. Only this process can produce a matching
/// hash, so a peer cannot claim someone else's id. The key is never
/// persisted; a restart invalidates every outstanding hash.
#[derive(Clone)]
pub struct IdentityKey {
    key: [u8; IDENTITY_KEY_SIZE],
}

impl IdentityKey {
    /// Generate a random key
    pub fn try_generate() -> Result<Self, getrandom::Error> {
        let mut key = [0u8; IDENTITY_KEY_SIZE];
        getrandom::getrandom(&mut key)?;
        Ok(Self { key })
    }

    /// Build a key from fixed bytes (tests)
    pub fn from_bytes(key: [u8; IDENTITY_KEY_SIZE]) -> Self {
        Self { key }
    }

    fn hash(&self, peer_id: &str) -> Hash {
        blake3::keyed_hash(&self.key, peer_id.as_bytes())
    }

    /// Hex-encoded keyed hash of a peer id
    pub fn sign(&self, peer_id: &str) -> String {
        self.hash(peer_id).to_hex().to_string()
    }

    /// Check a hash previously produced by `sign` (constant-time compare)
    pub fn verify(&self, peer_id: &str, peer_id_hash: &str) -> bool {
        match Hash::from_hex(peer_id_hash) {
            Ok(claimed) => claimed == self.hash(peer_id),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentityKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_code_generation() {
        for _ in 0..100 {
            let code = try_generate_pairing_code().unwrap();
            assert!(validate_pairing_code(&code), "bad code {code}");
        }
    }

    #[test]
    fn test_pairing_code_validation() {
        assert!(validate_pairing_code("000123"));
        assert!(validate_pairing_code("999999"));
        assert!(!validate_pairing_code("12345"));
        assert!(!validate_pairing_code("1234567"));
        assert!(!validate_pairing_code("12a456"));
        assert!(!validate_pairing_code(""));
    }

    #[test]
    fn test_public_room_id_generation() {
        for _ in 0..100 {
            let id = try_generate_public_room_id().unwrap();
            assert_eq!(id.len(), PUBLIC_ROOM_ID_LENGTH);
            assert!(validate_public_room_id(&id), "bad id {id}");
        }
    }

    #[test]
    fn test_public_room_id_validation() {
        assert!(validate_public_room_id("abcde"));
        assert!(!validate_public_room_id("ABCDE"));
        assert!(!validate_public_room_id("abcd"));
        assert!(!validate_public_room_id("abcd1"));
    }

    #[test]
    fn test_room_secret_generation() {
        let a = try_generate_room_secret().unwrap();
        let b = try_generate_room_secret().unwrap();
        assert_eq!(a.len(), ROOM_SECRET_LENGTH);
        assert!(validate_room_secret(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_room_secret_validation() {
        assert!(validate_room_secret(&"x".repeat(64)));
        assert!(validate_room_secret(&"x".repeat(256)));
        assert!(validate_room_secret(&format!("{} ~!", "a".repeat(62))));
        assert!(!validate_room_secret(&"x".repeat(63)));
        assert!(!validate_room_secret(&"x".repeat(257)));
        assert!(!validate_room_secret(&format!("{}\n", "a".repeat(70))));
        assert!(!validate_room_secret(&"é".repeat(40)));
    }

    #[test]
    fn test_identity_sign_and_verify() {
        let key = IdentityKey::from_bytes([7u8; IDENTITY_KEY_SIZE]);
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        let hash = key.sign(id);

        assert_eq!(hash.len(), 64);
        assert!(key.verify(id, &hash));
        assert!(!key.verify("0f8fad5b-d9cb-469f-a165-70867728950f", &hash));
        assert!(!key.verify(id, "not-hex"));
    }

    #[test]
    fn test_identity_keys_differ() {
        let a = IdentityKey::try_generate().unwrap();
        let b = IdentityKey::try_generate().unwrap();
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        assert!(!b.verify(id, &a.sign(id)));
    }
}
