//! Compression codecs applied before encryption on write and after
//! decryption on read. The mode in effect is recorded in the artifact
//! sidecar, never sniffed from content.

use super::{CryptoError, CryptoResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// Compression applied to an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Store the dump as-is
    #[default]
    None,
    /// gzip (flate2)
    Gzip,
    /// Brotli
    Brotli,
}

impl CompressionMode {
    /// File name suffix appended to compressed artifacts
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            CompressionMode::None => None,
            CompressionMode::Gzip => Some(".gz"),
            CompressionMode::Brotli => Some(".br"),
        }
    }

    /// Stable identifier used in sidecars and storage paths
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMode::None => "none",
            CompressionMode::Gzip => "gzip",
            CompressionMode::Brotli => "brotli",
        }
    }
}

impl std::fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compress `src` into `dest` using `mode`. `CompressionMode::None` copies
/// the file unchanged.
pub fn compress_file(src: &Path, dest: &Path, mode: CompressionMode) -> CryptoResult<u64> {
    match mode {
        CompressionMode::None => {
            let bytes = std::fs::copy(src, dest)?;
            Ok(bytes)
        }
        CompressionMode::Gzip => {
            let mut reader = BufReader::new(File::open(src)?);
            let mut encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::new(6));
            let bytes = io::copy(&mut reader, &mut encoder)
                .map_err(|e| CryptoError::Compression(format!("gzip encode failed: {}", e)))?;
            let mut inner = encoder
                .finish()
                .map_err(|e| CryptoError::Compression(format!("gzip finalize failed: {}", e)))?;
            inner.flush()?;
            Ok(bytes)
        }
        CompressionMode::Brotli => {
            let mut reader = BufReader::new(File::open(src)?);
            let mut writer = BufWriter::new(File::create(dest)?);
            let params = brotli::enc::BrotliEncoderParams {
                quality: 5,
                lgwin: 22,
                ..Default::default()
            };
            let bytes = brotli::BrotliCompress(&mut reader, &mut writer, &params)
                .map_err(|e| CryptoError::Compression(format!("brotli encode failed: {}", e)))?;
            writer.flush()?;
            Ok(bytes as u64)
        }
    }
}

/// Decompress `src` into `dest` using `mode`.
pub fn decompress_file(src: &Path, dest: &Path, mode: CompressionMode) -> CryptoResult<u64> {
    match mode {
        CompressionMode::None => {
            let bytes = std::fs::copy(src, dest)?;
            Ok(bytes)
        }
        CompressionMode::Gzip => {
            let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
            let mut writer = BufWriter::new(File::create(dest)?);
            let bytes = io::copy(&mut decoder, &mut writer)
                .map_err(|e| CryptoError::Compression(format!("gzip decode failed: {}", e)))?;
            writer.flush()?;
            Ok(bytes)
        }
        CompressionMode::Brotli => {
            let mut decoder = brotli::Decompressor::new(BufReader::new(File::open(src)?), 4096);
            let mut writer = BufWriter::new(File::create(dest)?);
            let bytes = io::copy(&mut decoder, &mut writer)
                .map_err(|e| CryptoError::Compression(format!("brotli decode failed: {}", e)))?;
            writer.flush()?;
            Ok(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn roundtrip(mode: CompressionMode) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("dump.sql");
        let packed = dir.path().join("dump.sql.packed");
        let unpacked = dir.path().join("dump.sql.out");

        let payload = b"-- PostgreSQL database dump\nCREATE TABLE t (id int);\n".repeat(500);
        File::create(&src).unwrap().write_all(&payload).unwrap();

        compress_file(&src, &packed, mode).unwrap();
        decompress_file(&packed, &unpacked, mode).unwrap();

        assert_eq!(std::fs::read(&unpacked).unwrap(), payload);
    }

    #[test]
    fn test_gzip_roundtrip() {
        roundtrip(CompressionMode::Gzip);
    }

    #[test]
    fn test_brotli_roundtrip() {
        roundtrip(CompressionMode::Brotli);
    }

    #[test]
    fn test_none_roundtrip() {
        roundtrip(CompressionMode::None);
    }
}
