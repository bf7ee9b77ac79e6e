#![forbid(unsafe_code)]

//! One-shot retention pass for cron or systemd timers: expires old history
//! entries for every known user, then purges download files no history
//! references any more.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use grabtube::{
    config::{RuntimeOverrides, resolve_runtime_settings},
    history::{HistoryStore, RetentionPolicy, SweepReport},
    security::ensure_not_root,
    storage::JsonDirStorage,
    sweeper::purge_orphans,
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "grabtube-sweep", about = "Expire old downloads once and exit")]
struct SweepArgs {
    #[arg(long)]
    data_root: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Report only; nothing is deleted.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SweepSummary {
    report: SweepReport,
    orphans: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = SweepArgs::parse();
    ensure_not_root("grabtube-sweep")?;

    let settings = resolve_runtime_settings(RuntimeOverrides {
        data_root: args.data_root.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let paths = settings.paths();
    paths.create_dirs()?;

    let storage = JsonDirStorage::open(&paths.history)
        .with_context(|| format!("opening {}", paths.history.display()))?;
    let history = HistoryStore::new(
        Arc::new(storage),
        RetentionPolicy {
            max_entries: settings.max_history,
            retention: chrono::Duration::from_std(settings.retention)
                .context("retention window out of range")?,
        },
    );

    println!("Data root: {}", settings.data_root.display());
    if args.dry_run {
        let expired = count_expired(&history).await?;
        println!("Dry run: {expired} expired entr(y/ies) would be removed.");
        return Ok(());
    }

    let summary = sweep_once(&history, &paths.downloads, settings.retention).await?;
    println!(
        "Scanned {} user(s): removed {} expired entr(y/ies), deleted {} file(s).",
        summary.report.users_scanned, summary.report.entries_removed, summary.report.files_deleted
    );
    if !summary.orphans.is_empty() {
        println!("Purged {} orphaned file(s):", summary.orphans.len());
        for path in &summary.orphans {
            println!("  - {}", path.display());
        }
    }
    if summary.report.users_failed > 0 {
        eprintln!(
            "Warning: {} user history record(s) could not be swept; they will be retried next run.",
            summary.report.users_failed
        );
    }
    Ok(())
}

async fn sweep_once(
    history: &HistoryStore,
    downloads: &Path,
    orphan_age: Duration,
) -> Result<SweepSummary> {
    let report = history
        .sweep_expired(Utc::now())
        .await
        .context("sweeping expired history")?;
    let referenced = history.referenced_files().await?;
    let orphans = purge_orphans(downloads, &referenced, orphan_age);
    Ok(SweepSummary { report, orphans })
}

async fn count_expired(history: &HistoryStore) -> Result<usize> {
    let now = Utc::now();
    let mut expired = 0;
    for user in history.known_users().await? {
        expired += history
            .get_history(&user)
            .await?
            .iter()
            .filter(|entry| entry.is_expired(now))
            .count();
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grabtube::history::{CompletedDownload, MediaFormat};
    use std::fs;
    use tempfile::tempdir;

    fn history_in(dir: &Path, retention: chrono::Duration) -> HistoryStore {
        HistoryStore::new(
            Arc::new(JsonDirStorage::open(dir.join("history")).unwrap()),
            RetentionPolicy {
                max_entries: 20,
                retention,
            },
        )
    }

    async fn seed(history: &HistoryStore, user: &str, path: &Path) {
        fs::write(path, b"media").unwrap();
        history
            .record_download(
                user,
                CompletedDownload {
                    filename: path.file_name().unwrap().to_string_lossy().into_owned(),
                    title: "clip".into(),
                    format: MediaFormat::Mp4,
                    url: "https://example.com/watch?v=1".into(),
                    file_path: path.to_path_buf(),
                    completed_at: Utc::now() - chrono::Duration::minutes(5),
                },
            )
            .await
            .unwrap();
    }

    #[test]
    fn sweep_args_parse_flags() {
        let args =
            SweepArgs::try_parse_from(["grabtube-sweep", "--data-root", "/srv/grab", "--dry-run"])
                .unwrap();
        assert_eq!(args.data_root, Some(PathBuf::from("/srv/grab")));
        assert!(args.dry_run);
        assert!(SweepArgs::try_parse_from(["grabtube-sweep", "--bogus"]).is_err());
    }

    #[tokio::test]
    async fn sweep_once_expires_entries_and_purges_orphans() {
        let dir = tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        fs::create_dir_all(&downloads).unwrap();
        let history = history_in(dir.path(), chrono::Duration::minutes(1));

        let expired = downloads.join("expired.mp4");
        seed(&history, "alice", &expired).await;
        let orphan = downloads.join("orphan.mp3");
        fs::write(&orphan, b"left behind").unwrap();

        assert_eq!(count_expired(&history).await.unwrap(), 1);
        let summary = sweep_once(&history, &downloads, Duration::ZERO).await.unwrap();

        assert_eq!(summary.report.users_scanned, 1);
        assert_eq!(summary.report.entries_removed, 1);
        assert_eq!(summary.report.files_deleted, 1);
        assert_eq!(summary.orphans, vec![orphan.clone()]);
        assert!(!expired.exists());
        assert!(!orphan.exists());
        assert!(history.get_history("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_once_keeps_live_downloads() {
        let dir = tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        fs::create_dir_all(&downloads).unwrap();
        let history = history_in(dir.path(), chrono::Duration::hours(1));

        let live = downloads.join("live.mp4");
        seed(&history, "bob", &live).await;

        let summary = sweep_once(&history, &downloads, Duration::ZERO).await.unwrap();
        assert_eq!(summary.report.entries_removed, 0);
        assert!(summary.orphans.is_empty());
        assert!(live.exists());
        assert_eq!(count_expired(&history).await.unwrap(), 0);
    }
}
