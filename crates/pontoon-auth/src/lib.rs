#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **pontoon-auth** – Bearer-token minting and constant-time verification.
//!
//! One sandboxed execution gets exactly one 256-bit bearer token. [`mint`]
//! draws the bytes from the OS entropy source and hex-encodes them;
//! [`verify`] compares a presented token against the expected one without
//! short-circuiting, so comparison time does not depend on how long a
//! prefix the caller has guessed correctly.

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::Secret;
use thiserror::Error;

/// Raw token width in bytes.
pub const TOKEN_BYTES: usize = 32;

/// Encoded token width: two lowercase hex characters per byte.
pub const TOKEN_HEX_LEN: usize = TOKEN_BYTES * 2;

/// Failure minting a token. The only failure mode is the OS refusing to
/// produce entropy.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The OS entropy source was unavailable or returned an error.
    #[error("OS entropy source unavailable: {0}")]
    EntropyUnavailable(String),
}

/// Mint a fresh bearer token: 32 CSPRNG bytes as 64 lowercase hex characters.
///
/// The token is returned wrapped in [`Secret`] so it never shows up in
/// `Debug` output or log lines.
pub fn mint() -> Result<Secret<String>, TokenError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| TokenError::EntropyUnavailable(e.to_string()))?;
    Ok(Secret::new(hex::encode(bytes)))
}

/// Compare a presented token against the expected one.
///
/// Inputs of different lengths return `false` without comparing content;
/// equal-length inputs are compared over every byte regardless of where the
/// first mismatch sits. Total over arbitrary input, never panics.
pub fn verify(provided: &str, expected: &str) -> bool {
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
