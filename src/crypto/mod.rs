//! Streaming codecs for backup artifacts.
//!
//! Artifacts are (optionally) compressed and then (optionally) encrypted on
//! the way to storage; the inverse order applies on restore. Both transforms
//! stream in fixed-size chunks so memory stays bounded for multi-gigabyte
//! dumps.

mod cipher;
mod compression;

pub use cipher::{decrypt_file, encrypt_file, EncryptionParams};
pub use compression::{compress_file, decompress_file, CompressionMode};

use thiserror::Error;

/// Plaintext chunk size for both codecs. Each encrypted frame carries one
/// chunk plus its 16-byte authentication tag.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Errors produced by the codec layer
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Authentication failed while decrypting; no plaintext from the
    /// failing chunk was emitted
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Key material could not be used
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// A compression codec failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for codec operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
