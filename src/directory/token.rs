use rand::RngCore;

pub const TOKEN_BYTES: usize = 32;

/// 256 bits from the thread-local CSPRNG, hex-encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
