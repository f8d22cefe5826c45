//! Archive of fetched listing pages.
//!
//! Each distinct page for a family and period is kept once, named by its
//! SHA-256, under `<root>/<family>/<period>/`. Every fetch, including repeats
//! of a page already on disk, gets a line in that directory's `fetches.log`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const FETCH_LOG: &str = "fetches.log";

#[derive(Debug, Clone)]
pub struct ArchivedListing {
    pub sha256: String,
    /// Relative to the archive root.
    pub path: PathBuf,
    /// The same page was already archived for this period.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct ListingArchive {
    root: PathBuf,
}

impl ListingArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn period_dir(&self, family: &str, period: &str) -> PathBuf {
        self.root.join(family).join(period)
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        family: &str,
        period: &str,
        page: &str,
    ) -> anyhow::Result<ArchivedListing> {
        let sha256 = hex::encode(Sha256::digest(page.as_bytes()));
        let dir = self.period_dir(family, period);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let file_name = format!("{sha256}.html");
        let target = dir.join(&file_name);
        let reused = fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?;
        if !reused {
            // readers never see a half-written page
            let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
            fs::write(&partial, page)
                .await
                .with_context(|| format!("writing {}", partial.display()))?;
            if let Err(err) = fs::rename(&partial, &target).await {
                let _ = fs::remove_file(&partial).await;
                return Err(err).with_context(|| format!("publishing {}", target.display()));
            }
        }

        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(FETCH_LOG))
            .await
            .context("opening fetch log")?;
        let line = format!("{}\t{sha256}\n", fetched_at.to_rfc3339());
        log.write_all(line.as_bytes())
            .await
            .context("appending fetch log")?;

        Ok(ArchivedListing {
            sha256,
            path: PathBuf::from(family).join(period).join(file_name),
            reused,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn repeated_page_is_stored_once_and_logged_twice() {
        let dir = tempdir().unwrap();
        let archive = ListingArchive::new(dir.path());

        let first = archive
            .archive(at("2025-02-24T12:00:00Z"), "wpi", "202501", "hello world")
            .await
            .unwrap();
        let second = archive
            .archive(at("2025-02-25T12:00:00Z"), "wpi", "202501", "hello world")
            .await
            .unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.path, second.path);
        assert!(first.path.starts_with("wpi/202501"));
        assert_eq!(
            first.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let log = std::fs::read_to_string(dir.path().join("wpi/202501").join(FETCH_LOG)).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().all(|l| l.ends_with(&first.sha256)));
        assert!(dir.path().join(&first.path).exists());
    }

    #[tokio::test]
    async fn different_pages_get_different_files() {
        let dir = tempdir().unwrap();
        let archive = ListingArchive::new(dir.path());
        let now = at("2025-02-24T12:00:00Z");

        let a = archive.archive(now, "wpi", "202501", "<p>a</p>").await.unwrap();
        let b = archive.archive(now, "wpi", "202501", "<p>b</p>").await.unwrap();
        assert_ne!(a.path, b.path);
        assert!(!b.reused);
    }
}
