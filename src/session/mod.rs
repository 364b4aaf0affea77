//! Persisted transport sessions (MTProto session strings and similar).
//!
//! Writes are best-effort side effects: callers log failures and try again
//! on the next interval.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<String>>;

    async fn save(&self, account_id: &str, session: &str) -> Result<()>;

    async fn clear(&self, account_id: &str) -> Result<()>;
}

/// One file per account under `<workspace>/sessions/`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        let safe: String = account_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.session"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, account_id: &str) -> Result<Option<String>> {
        let path = self.path_for(account_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(None),
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading session {}", path.display())),
        }
    }

    async fn save(&self, account_id: &str, session: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating session directory {}", self.dir.display()))?;

        let path = self.path_for(account_id);
        let temp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp_path, session)
            .await
            .with_context(|| format!("writing session {}", temp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e).with_context(|| format!("replacing session {}", path.display()));
        }
        Ok(())
    }

    async fn clear(&self, account_id: &str) -> Result<()> {
        let path = self.path_for(account_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing session {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_session_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStore::new(tmp.path().join("sessions"));
        assert!(store.load("tg-user").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_and_clear_removes() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStore::new(tmp.path().join("sessions"));

        store.save("tg-user", "first").await.unwrap();
        store.save("tg-user", "second").await.unwrap();
        assert_eq!(store.load("tg-user").await.unwrap().as_deref(), Some("second"));

        store.clear("tg-user").await.unwrap();
        store.clear("tg-user").await.unwrap();
        assert!(store.load("tg-user").await.unwrap().is_none());
    }

    #[test]
    fn account_ids_are_sanitized() {
        let store = FileSessionStore::new("/tmp/s");
        assert_eq!(
            store.path_for("../evil/id"),
            PathBuf::from("/tmp/s/___evil_id.session")
        );
    }
}
