//! Diary entries spanning two stores.
//!
//! The body lives in the document store and a pointer row lives in the
//! relational index. Writes run as a saga: document first, pointer second,
//! and a failed pointer insert deletes the document again, so no pointer
//! ever references a missing document.

pub mod document;
pub mod index;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub use document::{DiaryDocument, DocumentStore, FileDocumentStore};
pub use index::{DiaryIndex, DiaryPointer, SqliteDiaryIndex};

const MAX_TITLE_CHARS: usize = 120;
const MAX_CONTENT_CHARS: usize = 20_000;
const MAX_MOOD_CHARS: usize = 32;

/// Entries returned by one listing.
pub const LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDiaryEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub mood: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiaryEntry {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub mood: Option<String>,
    pub created_at: i64,
}

pub struct DiaryService {
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn DiaryIndex>,
}

impl DiaryService {
    pub fn new(documents: Arc<dyn DocumentStore>, index: Arc<dyn DiaryIndex>) -> Self {
        Self { documents, index }
    }

    pub async fn create_entry(
        &self,
        account_id: i64,
        entry: NewDiaryEntry,
    ) -> ApiResult<DiaryEntry> {
        let doc = validate(entry)?;
        let document_id = Uuid::new_v4().to_string();

        self.documents
            .put(&document_id, &doc)
            .await
            .map_err(|e| ApiError::internal(format!("document write: {e:#}")))?;

        let pointer = self
            .index
            .insert(account_id, &document_id, doc.mood.as_deref(), doc.created_at);

        match pointer {
            Ok(id) => {
                tracing::info!(account_id, entry_id = id, "diary entry created");
                Ok(DiaryEntry {
                    id,
                    title: doc.title,
                    content: doc.content,
                    mood: doc.mood,
                    created_at: doc.created_at,
                })
            }
            Err(e) => {
                match self.documents.delete(&document_id).await {
                    Ok(_) => tracing::warn!(
                        account_id,
                        %document_id,
                        error = %e,
                        "diary pointer insert failed, document removed"
                    ),
                    Err(comp) => tracing::error!(
                        account_id,
                        %document_id,
                        error = %e,
                        compensation_error = %comp,
                        "diary pointer insert failed and document cleanup failed; orphaned document"
                    ),
                }
                Err(ApiError::internal(format!("diary index insert: {e:#}")))
            }
        }
    }

    /// Pointers whose document is gone are skipped and logged.
    pub async fn list_entries(&self, account_id: i64) -> ApiResult<Vec<DiaryEntry>> {
        let pointers = self
            .index
            .list(account_id, LIST_LIMIT)
            .map_err(|e| ApiError::internal(format!("diary index list: {e:#}")))?;

        let mut entries = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            match self.documents.get(&pointer.document_id).await {
                Ok(Some(doc)) => entries.push(DiaryEntry {
                    id: pointer.id,
                    title: doc.title,
                    content: doc.content,
                    mood: doc.mood,
                    created_at: doc.created_at,
                }),
                Ok(None) => tracing::warn!(
                    entry_id = pointer.id,
                    document_id = %pointer.document_id,
                    "diary pointer references a missing document"
                ),
                Err(e) => return Err(ApiError::internal(format!("document read: {e:#}"))),
            }
        }
        Ok(entries)
    }
}

fn validate(entry: NewDiaryEntry) -> ApiResult<DiaryDocument> {
    let title = entry.title.trim().to_string();
    let content = entry.content.trim().to_string();
    if title.is_empty() || content.is_empty() {
        return Err(ApiError::Validation("title and content are required".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::Validation(format!(
            "title too long (max {MAX_TITLE_CHARS} characters)"
        )));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::Validation(format!(
            "content too long (max {MAX_CONTENT_CHARS} characters)"
        )));
    }
    let mood = entry
        .mood
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty());
    if mood.as_ref().is_some_and(|m| m.chars().count() > MAX_MOOD_CHARS) {
        return Err(ApiError::Validation("mood label too long".into()));
    }

    Ok(DiaryDocument {
        title,
        content,
        mood,
        created_at: Utc::now().timestamp(),
    })
}
