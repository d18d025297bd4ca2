//! Codec round-trip and fail-closed integrity behavior across every
//! compression/encryption combination.

use dbackup::crypto::{
    compress_file, decompress_file, decrypt_file, encrypt_file, CompressionMode, CryptoError,
};
use proptest::prelude::*;
use std::path::{Path, PathBuf};

const MASTER_KEY: &[u8; 32] = b"an-exemplary-master-key-32-bytes";

fn encode(
    dir: &Path,
    payload: &[u8],
    compression: CompressionMode,
    encrypt: bool,
) -> (PathBuf, Option<dbackup::crypto::EncryptionParams>) {
    let plain = dir.join("artifact.sql");
    std::fs::write(&plain, payload).unwrap();

    let compressed = dir.join("artifact.sql.c");
    compress_file(&plain, &compressed, compression).unwrap();

    if encrypt {
        let encrypted = dir.join("artifact.sql.c.enc");
        let params = encrypt_file(&compressed, &encrypted, MASTER_KEY).unwrap();
        (encrypted, Some(params))
    } else {
        (compressed, None)
    }
}

fn decode(
    dir: &Path,
    stored: &Path,
    compression: CompressionMode,
    params: Option<&dbackup::crypto::EncryptionParams>,
) -> Vec<u8> {
    let mut current = stored.to_path_buf();
    if let Some(params) = params {
        let decrypted = dir.join("decoded.c");
        decrypt_file(&current, &decrypted, MASTER_KEY, params).unwrap();
        current = decrypted;
    }
    let out = dir.join("decoded.sql");
    decompress_file(&current, &out, compression).unwrap();
    std::fs::read(&out).unwrap()
}

#[test]
fn test_roundtrip_every_combination() {
    let payload = b"-- PostgreSQL database dump\nINSERT INTO t VALUES (42);\n".repeat(2048);
    for compression in [
        CompressionMode::None,
        CompressionMode::Gzip,
        CompressionMode::Brotli,
    ] {
        for encrypt in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let (stored, params) = encode(dir.path(), &payload, compression, encrypt);
            let decoded = decode(dir.path(), &stored, compression, params.as_ref());
            assert_eq!(
                decoded, payload,
                "round-trip failed for {:?} encrypted={}",
                compression, encrypt
            );
        }
    }
}

#[test]
fn test_corrupted_ciphertext_yields_integrity_error_and_no_plaintext() {
    let payload = vec![7u8; 200 * 1024]; // multiple chunks
    let dir = tempfile::tempdir().unwrap();
    let (stored, params) = encode(dir.path(), &payload, CompressionMode::Gzip, true);
    let params = params.unwrap();

    let mut bytes = std::fs::read(&stored).unwrap();
    // corrupt a byte in the middle of the second chunk's ciphertext
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x80;
    std::fs::write(&stored, &bytes).unwrap();

    let out = dir.path().join("decoded.c");
    let err = decrypt_file(&stored, &out, MASTER_KEY, &params).unwrap_err();
    assert!(matches!(err, CryptoError::Integrity(_)));
    assert!(!out.exists(), "failed decrypt must not leave plaintext behind");
}

#[test]
fn test_corrupted_auth_tag_yields_integrity_error() {
    let dir = tempfile::tempdir().unwrap();
    let (stored, params) = encode(dir.path(), b"small payload", CompressionMode::None, true);
    let mut params = params.unwrap();
    params.auth_tag[0] ^= 0x01;

    let out = dir.path().join("decoded.c");
    let err = decrypt_file(&stored, &out, MASTER_KEY, &params).unwrap_err();
    assert!(matches!(err, CryptoError::Integrity(_)));
    assert!(!out.exists());
}

#[test]
fn test_truncated_ciphertext_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let (stored, params) = encode(
        dir.path(),
        &vec![3u8; 150 * 1024],
        CompressionMode::None,
        true,
    );
    let params = params.unwrap();

    let bytes = std::fs::read(&stored).unwrap();
    std::fs::write(&stored, &bytes[..bytes.len() - 10]).unwrap();

    let out = dir.path().join("decoded.c");
    let err = decrypt_file(&stored, &out, MASTER_KEY, &params).unwrap_err();
    assert!(matches!(err, CryptoError::Integrity(_)));
    assert!(!out.exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_gzip_aes_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..40_000)) {
        let dir = tempfile::tempdir().unwrap();
        let (stored, params) = encode(dir.path(), &payload, CompressionMode::Gzip, true);
        let decoded = decode(dir.path(), &stored, CompressionMode::Gzip, params.as_ref());
        prop_assert_eq!(decoded, payload);
    }
}
