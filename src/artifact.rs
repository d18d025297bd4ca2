//! Artifact naming and the sidecar metadata document.
//!
//! Artifacts live at `<job-name-or-manual>/<timestamp>.<ext>[.gz|.br][.enc]`
//! at the storage destination. Whenever an artifact is encrypted or carries
//! multi-database metadata, a JSON sidecar is stored next to it at
//! `<same-base>.meta.json`. If a sidecar exists it fully determines the
//! decode pipeline; restore never infers encryption parameters.

use crate::crypto::{CompressionMode, EncryptionParams};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timestamp format used in artifact file names. Colon-free so names stay
/// portable across filesystems and object stores.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

/// Suffix of sidecar documents
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Sidecar document stored alongside an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    /// Version of the source database engine at dump time
    pub engine_version: String,

    /// Logical database names contained in the artifact
    pub databases: Vec<String>,

    /// Compression applied before encryption
    #[serde(default)]
    pub compression: CompressionMode,

    /// Encryption parameters, when the artifact is encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SidecarEncryption>,

    /// SHA-256 of the stored artifact bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// When the artifact was produced
    pub created_at: DateTime<Utc>,
}

/// Encryption block of a sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarEncryption {
    /// Encryption profile the artifact key was derived from
    pub profile_id: Uuid,
    /// Per-artifact IV, base64
    pub iv: String,
    /// Final-chunk authentication tag, base64
    pub auth_tag: String,
}

impl SidecarEncryption {
    /// Build the sidecar block from the parameters encryption produced
    pub fn from_params(profile_id: Uuid, params: &EncryptionParams) -> Self {
        Self {
            profile_id,
            iv: BASE64.encode(&params.iv),
            auth_tag: BASE64.encode(&params.auth_tag),
        }
    }

    /// Decode the recorded parameters for decryption
    pub fn to_params(&self) -> Result<EncryptionParams, base64::DecodeError> {
        Ok(EncryptionParams {
            iv: BASE64.decode(&self.iv)?,
            auth_tag: BASE64.decode(&self.auth_tag)?,
        })
    }
}

/// Directory component of an artifact path: the job name slug, or
/// `manual` for ad-hoc runs.
pub fn artifact_dir(job_name: Option<&str>) -> String {
    match job_name {
        Some(name) => slug(name),
        None => "manual".to_string(),
    }
}

/// Base file name (`<timestamp>.<ext>`) for an artifact produced now
pub fn artifact_base_name(created_at: DateTime<Utc>, extension: &str) -> String {
    format!("{}.{}", created_at.format(TIMESTAMP_FORMAT), extension)
}

/// Full remote path with codec suffixes applied in encode order
pub fn remote_artifact_path(
    dir: &str,
    base_name: &str,
    compression: CompressionMode,
    encrypted: bool,
) -> String {
    let mut path = format!("{}/{}", dir, base_name);
    if let Some(suffix) = compression.suffix() {
        path.push_str(suffix);
    }
    if encrypted {
        path.push_str(".enc");
    }
    path
}

/// Sidecar path for an artifact: codec suffixes stripped, `.meta.json`
/// appended
pub fn sidecar_path(artifact_path: &str) -> String {
    format!("{}{}", strip_codec_suffixes(artifact_path), SIDECAR_SUFFIX)
}

/// Remove trailing `.enc` / `.gz` / `.br` suffixes from an artifact path
pub fn strip_codec_suffixes(path: &str) -> &str {
    let mut stripped = path;
    loop {
        let next = stripped
            .strip_suffix(".enc")
            .or_else(|| stripped.strip_suffix(".gz"))
            .or_else(|| stripped.strip_suffix(".br"));
        match next {
            Some(rest) => stripped = rest,
            None => return stripped,
        }
    }
}

/// True when `path` names a sidecar, not an artifact
pub fn is_sidecar(path: &str) -> bool {
    path.ends_with(SIDECAR_SUFFIX)
}

/// Parse the creation timestamp out of an artifact file name
pub fn parse_artifact_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = strip_codec_suffixes(file_name);
    let stamp = stem.split('.').next()?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Codec suffixes on an artifact name imply its compression mode. Only
/// consulted when no sidecar exists; a sidecar always wins.
pub fn compression_from_path(path: &str) -> CompressionMode {
    let without_enc = path.strip_suffix(".enc").unwrap_or(path);
    if without_enc.ends_with(".gz") {
        CompressionMode::Gzip
    } else if without_enc.ends_with(".br") {
        CompressionMode::Brotli
    } else {
        CompressionMode::None
    }
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "job".to_string()
    } else {
        trimmed
    }
}
