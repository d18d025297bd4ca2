//! The database adapter contract and helpers shared by the CLI-driven
//! implementations.

use super::{AdapterError, AdapterResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

/// Result of a connectivity probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Version reported by the live server ("15.4", "8.0.36")
    pub version: String,
    /// Optional human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of a dump operation
#[derive(Debug, Clone)]
pub struct DumpOutput {
    /// Logical databases contained in the artifact, in dump order
    pub databases: Vec<String>,
    /// Tool output lines worth surfacing on the execution record
    pub logs: Vec<String>,
}

/// Result of a restore operation
#[derive(Debug, Clone)]
pub struct RestoreOutput {
    /// Tool output lines worth surfacing on the execution record
    pub logs: Vec<String>,
}

/// Caller-supplied mapping for one logical database in a multi-database
/// artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMapping {
    /// Name recorded in the artifact
    pub original: String,
    /// Name to restore into
    pub target: String,
    /// Unselected entries are skipped entirely
    #[serde(default = "default_selected")]
    pub selected: bool,
}

fn default_selected() -> bool {
    true
}

/// One-shot elevated credentials for a privileged retry. Used for a single
/// restore attempt, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivilegedAuth {
    /// Privileged account name
    pub username: String,
    /// Privileged account password
    pub password: String,
}

/// Options applied to one restore invocation
#[derive(Debug, Clone, Default)]
pub struct RestoreTargetOptions {
    /// Per-database mapping; empty restores every database under its
    /// original name
    pub mapping: Vec<DatabaseMapping>,
    /// Elevated credentials for this attempt only
    pub privileged: Option<PrivilegedAuth>,
}

impl RestoreTargetOptions {
    /// Resolve the target name for a database found in the artifact.
    /// `None` means the database is skipped.
    pub fn target_for<'a>(&'a self, original: &'a str) -> Option<&'a str> {
        if self.mapping.is_empty() {
            return Some(original);
        }
        self.mapping
            .iter()
            .find(|m| m.original == original)
            .filter(|m| m.selected)
            .map(|m| m.target.as_str())
    }
}

/// Capability contract for dump/restore sources
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Stable registry id ("postgres")
    fn id(&self) -> &'static str;

    /// Human-readable adapter name
    fn display_name(&self) -> &'static str;

    /// Extension of uncompressed, unencrypted dumps ("sql", "sqlite")
    fn file_extension(&self) -> &'static str;

    /// Shape-check an opaque config payload. Called when the adapter
    /// config is registered; failure is a configuration error.
    fn validate(&self, settings: &Value) -> AdapterResult<()>;

    /// Probe connectivity and report the live server version
    async fn test(&self, settings: &Value) -> AdapterResult<ConnectionInfo>;

    /// Confirm the target is ready to receive a restore
    async fn prepare_restore(&self, settings: &Value) -> AdapterResult<()>;

    /// Dump the configured databases into `dest`
    async fn dump(&self, settings: &Value, dest: &Path) -> AdapterResult<DumpOutput>;

    /// Restore `source` into the configured server, honoring the mapping
    /// and one-shot privileged credentials
    async fn restore(
        &self,
        settings: &Value,
        source: &Path,
        options: &RestoreTargetOptions,
    ) -> AdapterResult<RestoreOutput>;

    /// Plausibility predicate for smart key recovery: does this look like
    /// a dump this adapter could restore?
    fn dump_looks_valid(&self, head: &[u8]) -> bool;
}

/// Permission-failure patterns across the supported database tools
pub(crate) fn access_denied_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"(?i)access denied|permission denied|must be owner|insufficient privilege")
            .unwrap()
    })
}

/// Classify a failed tool run: permission failures get their own error
/// kind so the caller can surface a privileged retry.
pub(crate) fn tool_failure(context: &str, stderr: &str) -> AdapterError {
    if access_denied_pattern().is_match(stderr) {
        AdapterError::PermissionDenied(format!("{}: {}", context, stderr.trim()))
    } else {
        AdapterError::Tool(format!("{}: {}", context, stderr.trim()))
    }
}

/// Run a tool, capturing stderr, with stdout going wherever the command
/// was pointed (usually a dump file).
pub(crate) async fn run_tool(mut command: Command, context: &str) -> AdapterResult<Vec<String>> {
    let output = command
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AdapterError::Tool(format!("{}: failed to spawn: {}", context, e)))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(tool_failure(context, &stderr));
    }
    Ok(stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| format!("{}: {}", context, l))
        .collect())
}

/// Resolve a required CLI binary, mapping absence to a connectivity error
pub(crate) fn require_binary(name: &str) -> AdapterResult<std::path::PathBuf> {
    which::which(name)
        .map_err(|_| AdapterError::Connectivity(format!("required binary not found: {}", name)))
}

/// Split a multi-database dump into one file per logical database.
///
/// `marker` must capture the database name in group 1 on a section-start
/// line. Content before the first marker (or a dump with no markers at
/// all) becomes a section named `fallback`.
pub(crate) fn split_sections(
    source: &Path,
    scratch: &Path,
    marker: &regex::Regex,
    fallback: &str,
) -> std::io::Result<Vec<(String, std::path::PathBuf)>> {
    use std::io::{BufRead, BufReader, BufWriter, Write};

    let reader = BufReader::new(std::fs::File::open(source)?);
    let mut sections: Vec<(String, std::path::PathBuf)> = Vec::new();
    let mut writer: Option<BufWriter<std::fs::File>> = None;

    for line in reader.lines() {
        let line = line?;
        if let Some(captures) = marker.captures(&line) {
            if let Some(w) = writer.as_mut() {
                w.flush()?;
            }
            let name = captures
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| fallback.to_string());
            let path = scratch.join(format!("section_{:03}.sql", sections.len()));
            writer = Some(BufWriter::new(std::fs::File::create(&path)?));
            sections.push((name, path));
        }
        if let Some(w) = writer.as_mut() {
            w.write_all(line.as_bytes())?;
            w.write_all(b"\n")?;
        } else if !line.trim().is_empty() {
            // content before any marker: open a fallback section
            let path = scratch.join(format!("section_{:03}.sql", sections.len()));
            let mut w = BufWriter::new(std::fs::File::create(&path)?);
            w.write_all(line.as_bytes())?;
            w.write_all(b"\n")?;
            sections.push((fallback.to_string(), path));
            writer = Some(w);
        }
    }
    if let Some(w) = writer.as_mut() {
        w.flush()?;
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_defaults_to_identity() {
        let options = RestoreTargetOptions::default();
        assert_eq!(options.target_for("orders"), Some("orders"));
    }

    #[test]
    fn test_unselected_databases_are_skipped() {
        let options = RestoreTargetOptions {
            mapping: vec![
                DatabaseMapping {
                    original: "orders".into(),
                    target: "orders_copy".into(),
                    selected: true,
                },
                DatabaseMapping {
                    original: "sessions".into(),
                    target: "sessions".into(),
                    selected: false,
                },
            ],
            privileged: None,
        };
        assert_eq!(options.target_for("orders"), Some("orders_copy"));
        assert_eq!(options.target_for("sessions"), None);
        assert_eq!(options.target_for("not_in_artifact_mapping"), None);
    }

    #[test]
    fn test_permission_failures_are_classified() {
        let err = tool_failure("psql", "ERROR: permission denied for table users");
        assert!(matches!(err, AdapterError::PermissionDenied(_)));

        let err = tool_failure("psql", "ERROR: relation does not exist");
        assert!(matches!(err, AdapterError::Tool(_)));
    }
}
