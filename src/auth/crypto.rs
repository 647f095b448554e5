//! Hashing and salt helpers for the challenge-response handshake.

use std::fmt::Write;

use rand::Rng;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// Printable ASCII without the space, `!` through `~`.
const SALT_POOL: &[u8] = b"!\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Length of salts generated by the gateway.
pub const SALT_LEN: usize = 16;

/// Random salt drawn from the printable pool.
pub fn random_salt(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| SALT_POOL[rng.random_range(0..SALT_POOL.len())] as char)
        .collect()
}

/// Lowercase hex SHA-512 of `data`.
pub fn sha512_hex(data: impl AsRef<[u8]>) -> String {
    let digest = Sha512::digest(data.as_ref());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// `sha512(salt + secret)`, the form both stored hashes and responses take.
pub fn salted_hash(salt: &str, secret: &str) -> String {
    sha512_hex(format!("{}{}", salt, secret))
}

/// 128 hex digits, either case.
pub fn is_sha512_hex(value: &str) -> bool {
    value.len() == 128 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
