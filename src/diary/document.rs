//! Document store for diary bodies: one JSON file per document.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The diary body as stored in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiaryDocument {
    pub title: String,
    pub content: String,
    pub mood: Option<String>,
    pub created_at: i64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, id: &str, doc: &DiaryDocument) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DiaryDocument>>;

    /// Returns `true` if a document was removed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

pub struct FileDocumentStore {
    dir: PathBuf,
}

impl FileDocumentStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create document dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        // Ids become file names; keep them to a safe alphabet.
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            bail!("invalid document id '{id}'");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn put(&self, id: &str, doc: &DiaryDocument) -> Result<()> {
        let path = self.path_for(id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(doc)?;

        // Write-then-rename so readers never see a half-written file.
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move document into place at {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DiaryDocument>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc() -> DiaryDocument {
        DiaryDocument {
            title: "Exam week".into(),
            content: "Tired but okay.".into(),
            mood: Some("anxious".into()),
            created_at: 1_760_000_000,
        }
    }

    #[tokio::test]
    async fn put_get_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FileDocumentStore::open(tmp.path().join("docs"))
            .await
            .unwrap();

        store.put("abc-123", &doc()).await.unwrap();
        assert_eq!(store.get("abc-123").await.unwrap(), Some(doc()));

        assert!(store.delete("abc-123").await.unwrap());
        assert!(!store.delete("abc-123").await.unwrap());
        assert_eq!(store.get("abc-123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn path_traversal_ids_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = FileDocumentStore::open(tmp.path()).await.unwrap();
        for id in ["../escape", "a/b", "", "x.json"] {
            assert!(store.put(id, &doc()).await.is_err(), "id {id:?} accepted");
        }
    }
}
