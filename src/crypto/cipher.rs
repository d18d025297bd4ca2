//! Authenticated streaming encryption for artifacts.
//!
//! A fresh key is derived per artifact with HKDF-SHA256 from the encryption
//! profile's master key and a random 16-byte IV. The payload is processed
//! as a sequence of 64 KiB chunks under the AEAD STREAM construction
//! (AES-256-GCM, 32-bit big-endian counter), each chunk framed as a
//! little-endian length prefix followed by ciphertext + tag. Every chunk is
//! authenticated before any of its plaintext is written out; the final
//! chunk's tag is recorded in the artifact sidecar.

use super::{CryptoError, CryptoResult, CHUNK_SIZE};
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// IV length recorded in sidecars. The first 7 bytes double as the STREAM
/// nonce prefix.
const IV_LEN: usize = 16;

/// GCM tag length appended to each ciphertext chunk
const TAG_LEN: usize = 16;

/// Context string bound into the derived key
const HKDF_INFO: &[u8] = b"dbackup.artifact.v1";

/// Parameters produced by encryption and required for decryption. Stored
/// base64-encoded in the artifact sidecar together with the profile id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    /// Random per-artifact IV (key-derivation salt + nonce prefix)
    pub iv: Vec<u8>,
    /// Authentication tag of the final chunk
    pub auth_tag: Vec<u8>,
}

fn derive_key(master_key: &[u8], iv: &[u8]) -> CryptoResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(iv), master_key);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::InvalidKey("HKDF expand failed".to_string()))?;
    Ok(okm)
}

fn read_chunk(reader: &mut impl Read, len: usize) -> CryptoResult<Option<Vec<u8>>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf))
}

fn write_frame(writer: &mut impl Write, ciphertext: &[u8]) -> CryptoResult<()> {
    writer.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
    writer.write_all(ciphertext)?;
    Ok(())
}

fn read_frame(reader: &mut impl Read) -> CryptoResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len < TAG_LEN || len > CHUNK_SIZE + TAG_LEN {
        return Err(CryptoError::Integrity(format!(
            "corrupt frame length {}",
            len
        )));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CryptoError::Integrity("truncated ciphertext frame".to_string())
        } else {
            CryptoError::Io(e)
        }
    })?;
    Ok(Some(frame))
}

/// Encrypt `src` into `dest` with a key derived from `master_key`.
/// Returns the parameters the sidecar must record for decryption.
pub fn encrypt_file(src: &Path, dest: &Path, master_key: &[u8]) -> CryptoResult<EncryptionParams> {
    let mut iv = vec![0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(master_key, &iv)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let mut nonce = [0u8; 7];
    nonce.copy_from_slice(&iv[..7]);
    let mut encryptor = EncryptorBE32::from_aead(cipher, &nonce.into());

    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);

    let mut current = read_chunk(&mut reader, CHUNK_SIZE)?.unwrap_or_default();
    let auth_tag;
    loop {
        match read_chunk(&mut reader, CHUNK_SIZE)? {
            Some(next) => {
                let ciphertext = encryptor
                    .encrypt_next(current.as_slice())
                    .map_err(|_| CryptoError::InvalidKey("chunk encryption failed".to_string()))?;
                write_frame(&mut writer, &ciphertext)?;
                current = next;
            }
            None => {
                let ciphertext = encryptor
                    .encrypt_last(current.as_slice())
                    .map_err(|_| CryptoError::InvalidKey("final chunk encryption failed".to_string()))?;
                auth_tag = ciphertext[ciphertext.len() - TAG_LEN..].to_vec();
                write_frame(&mut writer, &ciphertext)?;
                break;
            }
        }
    }
    writer.flush()?;

    Ok(EncryptionParams { iv, auth_tag })
}

/// Decrypt `src` into `dest` with a key derived from `master_key` and the
/// recorded parameters. Authentication is verified chunk by chunk before
/// any plaintext is written; on failure the partial output is removed and
/// [`CryptoError::Integrity`] is returned.
pub fn decrypt_file(
    src: &Path,
    dest: &Path,
    master_key: &[u8],
    params: &EncryptionParams,
) -> CryptoResult<()> {
    if params.iv.len() != IV_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "expected {}-byte IV, got {}",
            IV_LEN,
            params.iv.len()
        )));
    }

    let result = decrypt_file_inner(src, dest, master_key, params);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn decrypt_file_inner(
    src: &Path,
    dest: &Path,
    master_key: &[u8],
    params: &EncryptionParams,
) -> CryptoResult<()> {
    let key = derive_key(master_key, &params.iv)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let mut nonce = [0u8; 7];
    nonce.copy_from_slice(&params.iv[..7]);
    let mut decryptor = DecryptorBE32::from_aead(cipher, &nonce.into());

    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);

    let mut current = match read_frame(&mut reader)? {
        Some(frame) => frame,
        None => return Err(CryptoError::Integrity("empty ciphertext".to_string())),
    };
    loop {
        match read_frame(&mut reader)? {
            Some(next) => {
                let plaintext = decryptor.decrypt_next(current.as_slice()).map_err(|_| {
                    CryptoError::Integrity("chunk authentication failed".to_string())
                })?;
                writer.write_all(&plaintext)?;
                current = next;
            }
            None => {
                if current[current.len() - TAG_LEN..] != params.auth_tag[..] {
                    return Err(CryptoError::Integrity(
                        "authentication tag mismatch".to_string(),
                    ));
                }
                let plaintext = decryptor.decrypt_last(current.as_slice()).map_err(|_| {
                    CryptoError::Integrity("final chunk authentication failed".to_string())
                })?;
                writer.write_all(&plaintext)?;
                break;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

    fn write_payload(dir: &Path, payload: &[u8]) -> std::path::PathBuf {
        let src = dir.join("plain.sql");
        std::fs::write(&src, payload).unwrap();
        src
    }

    #[test]
    fn test_roundtrip_small() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_payload(dir.path(), b"CREATE TABLE t (id int);");
        let enc = dir.path().join("plain.sql.enc");
        let out = dir.path().join("plain.sql.out");

        let params = encrypt_file(&src, &enc, MASTER_KEY).unwrap();
        decrypt_file(&enc, &out, MASTER_KEY, &params).unwrap();

        assert_eq!(std::fs::read(&out).unwrap(), std::fs::read(&src).unwrap());
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..3 * CHUNK_SIZE + 577).map(|i| (i % 251) as u8).collect();
        let src = write_payload(dir.path(), &payload);
        let enc = dir.path().join("plain.sql.enc");
        let out = dir.path().join("plain.sql.out");

        let params = encrypt_file(&src, &enc, MASTER_KEY).unwrap();
        decrypt_file(&enc, &out, MASTER_KEY, &params).unwrap();

        assert_eq!(std::fs::read(&out).unwrap(), payload);
    }

    #[test]
    fn test_roundtrip_empty() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_payload(dir.path(), b"");
        let enc = dir.path().join("plain.sql.enc");
        let out = dir.path().join("plain.sql.out");

        let params = encrypt_file(&src, &enc, MASTER_KEY).unwrap();
        decrypt_file(&enc, &out, MASTER_KEY, &params).unwrap();

        assert!(std::fs::read(&out).unwrap().is_empty());
    }

    #[test]
    fn test_flipped_ciphertext_byte_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_payload(dir.path(), b"INSERT INTO t VALUES (1);");
        let enc = dir.path().join("plain.sql.enc");
        let out = dir.path().join("plain.sql.out");

        let params = encrypt_file(&src, &enc, MASTER_KEY).unwrap();

        let mut ciphertext = std::fs::read(&enc).unwrap();
        let mid = ciphertext.len() / 2;
        ciphertext[mid] ^= 0x01;
        std::fs::write(&enc, &ciphertext).unwrap();

        let err = decrypt_file(&enc, &out, MASTER_KEY, &params).unwrap_err();
        assert!(matches!(err, CryptoError::Integrity(_)));
        assert!(!out.exists(), "no plaintext may survive a failed decrypt");
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_payload(dir.path(), b"INSERT INTO t VALUES (1);");
        let enc = dir.path().join("plain.sql.enc");
        let out = dir.path().join("plain.sql.out");

        let params = encrypt_file(&src, &enc, MASTER_KEY).unwrap();
        let err = decrypt_file(&enc, &out, b"ffffffffffffffffffffffffffffffff", &params)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Integrity(_)));
        assert!(!out.exists());
    }
}
