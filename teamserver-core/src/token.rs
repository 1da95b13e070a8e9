use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 32;

/// Generates a fresh bearer token: 32 random bytes, hex encoded.
///
/// The plaintext exists only at issuance time and inside the user's
/// connection descriptor; the server keeps [`hash_token`] of it.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

/// SHA-256 of the token's UTF-8 bytes, lowercase hex.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
