//! Retention policies applied against real local-fs storage, including
//! sidecar follow-along deletes.

use chrono::{Duration, TimeZone, Utc};
use dbackup::adapters::{LocalStorage, StorageAdapter};
use dbackup::artifact::TIMESTAMP_FORMAT;
use dbackup::retention::{apply, RetentionPolicy};
use serde_json::json;
use std::path::Path;

fn seed_artifact(root: &Path, dir: &str, created: chrono::DateTime<Utc>, with_sidecar: bool) -> String {
    let name = format!("{}.sql", created.format(TIMESTAMP_FORMAT));
    let job_dir = root.join(dir);
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(job_dir.join(&name), b"-- dump").unwrap();
    if with_sidecar {
        std::fs::write(job_dir.join(format!("{}.meta.json", name)), b"{}").unwrap();
    }
    format!("{}/{}", dir, name)
}

#[tokio::test]
async fn test_simple_keeps_three_of_five() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage;
    let settings = json!({ "root": root.path().to_string_lossy() });
    let now = Utc.with_ymd_and_hms(2026, 3, 14, 3, 0, 0).unwrap();

    let mut paths = Vec::new();
    for i in 0..5 {
        paths.push(seed_artifact(root.path(), "nightly", now - Duration::days(i), true));
    }

    let outcome = apply(
        &RetentionPolicy::Simple { keep: 3 },
        &storage,
        &settings,
        "nightly",
        now,
    )
    .await
    .unwrap();

    assert_eq!(outcome.kept, 3);
    assert_eq!(outcome.deleted.len(), 2);
    // the two oldest are gone, the three newest remain
    assert!(outcome.deleted.contains(&paths[3]));
    assert!(outcome.deleted.contains(&paths[4]));
    for path in &paths[..3] {
        assert!(root.path().join(path).exists());
    }
    for path in &paths[3..] {
        assert!(!root.path().join(path).exists());
        let sidecar = dbackup::artifact::sidecar_path(path);
        assert!(!root.path().join(sidecar).exists(), "sidecar follows artifact");
    }
}

#[tokio::test]
async fn test_gfs_daily_two_deletes_unbucketed_third_day() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage;
    let settings = json!({ "root": root.path().to_string_lossy() });
    // mid-week so the 3-day-old artifact shares the ISO week but weekly=0
    let now = Utc.with_ymd_and_hms(2026, 3, 12, 3, 0, 0).unwrap();

    let today = seed_artifact(root.path(), "gfs", now, false);
    let yesterday = seed_artifact(root.path(), "gfs", now - Duration::days(1), false);
    let stale = seed_artifact(root.path(), "gfs", now - Duration::days(3), false);

    let policy = RetentionPolicy::Gfs {
        daily: 2,
        weekly: 0,
        monthly: 0,
        yearly: 0,
    };
    let outcome = apply(&policy, &storage, &settings, "gfs", now).await.unwrap();

    assert_eq!(outcome.deleted, vec![stale.clone()]);
    assert!(root.path().join(&today).exists());
    assert!(root.path().join(&yesterday).exists());
    assert!(!root.path().join(&stale).exists());
}

#[tokio::test]
async fn test_none_policy_touches_nothing() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage;
    let settings = json!({ "root": root.path().to_string_lossy() });
    let now = Utc::now();

    for i in 0..4 {
        seed_artifact(root.path(), "keep", now - Duration::days(i * 30), false);
    }
    let outcome = apply(&RetentionPolicy::None, &storage, &settings, "keep", now)
        .await
        .unwrap();
    assert!(outcome.deleted.is_empty());
    assert_eq!(
        std::fs::read_dir(root.path().join("keep")).unwrap().count(),
        4
    );
}
