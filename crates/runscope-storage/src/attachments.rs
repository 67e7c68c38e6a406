//! Attachment metadata repository. File bytes live in an external store;
//! only the descriptive row is kept here.

use runscope_core::{now_iso, Attachment, AttachmentPayload, Result, RunscopeError};
use std::sync::Arc;
use uuid::Uuid;

use crate::adapter::{Row, SqlValue, StorageAdapter};
use crate::convert::parse_datetime;

const ATTACHMENT_COLUMNS: &str =
    "id, run_id, filename, content_type, file_size, storage_path, created_at";

fn attachment_from_row(row: &Row) -> Result<Attachment> {
    Ok(Attachment {
        id: row.required_text("id")?,
        run_id: row.required_text("run_id")?,
        filename: row.required_text("filename")?,
        content_type: row.text("content_type"),
        file_size: row.int("file_size").unwrap_or(0),
        storage_path: row.required_text("storage_path")?,
        created_at: parse_datetime(&row.required_text("created_at")?)?,
    })
}

/// File metadata attached to runs.
#[derive(Clone)]
pub struct AttachmentRepository {
    adapter: Arc<dyn StorageAdapter>,
}

impl AttachmentRepository {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn create_attachment(&self, payload: &AttachmentPayload) -> Result<Attachment> {
        let adapter = self.adapter.as_ref();
        let id = Uuid::new_v4().to_string();
        let mut params = adapter.params();
        let sql = format!(
            "INSERT INTO attachments ({ATTACHMENT_COLUMNS}) VALUES ({})",
            params.push_all([
                SqlValue::from(&id),
                SqlValue::from(&payload.run_id),
                SqlValue::from(&payload.filename),
                SqlValue::from(payload.content_type.as_deref()),
                SqlValue::Integer(payload.file_size),
                SqlValue::from(&payload.storage_path),
                SqlValue::from(now_iso()),
            ])
        );
        adapter.run(&sql, params.values()).await?;

        self.get_attachment(&id).await?.ok_or_else(|| {
            RunscopeError::Storage(format!("Attachment '{id}' vanished after insert"))
        })
    }

    pub async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = {}",
            params.push(id)
        );
        adapter
            .get(&sql, params.values())
            .await?
            .as_ref()
            .map(attachment_from_row)
            .transpose()
    }

    /// Attachments of one run, oldest first.
    pub async fn get_attachments_by_run(&self, run_id: &str) -> Result<Vec<Attachment>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE run_id = {} ORDER BY created_at ASC",
            params.push(run_id)
        );
        let rows = adapter.all(&sql, params.values()).await?;
        rows.iter().map(attachment_from_row).collect()
    }

    pub async fn count_attachments_by_run(&self, run_id: &str) -> Result<i64> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT COUNT(*) AS total FROM attachments WHERE run_id = {}",
            params.push(run_id)
        );
        let row = adapter.get(&sql, params.values()).await?;
        Ok(row.and_then(|r| r.int("total")).unwrap_or(0))
    }

    /// Returns whether a row was removed.
    pub async fn delete_attachment(&self, id: &str) -> Result<bool> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!("DELETE FROM attachments WHERE id = {}", params.push(id));
        Ok(adapter.run(&sql, params.values()).await?.changes > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::initialize_schema;
    use crate::sqlite::SqliteAdapter;

    async fn repo() -> AttachmentRepository {
        let adapter = SqliteAdapter::connect("sqlite::memory:", None).await.unwrap();
        initialize_schema(&adapter).await.unwrap();
        AttachmentRepository::new(Arc::new(adapter))
    }

    fn payload(run_id: &str, filename: &str) -> AttachmentPayload {
        AttachmentPayload {
            run_id: run_id.to_string(),
            filename: filename.to_string(),
            content_type: Some("image/png".to_string()),
            file_size: 2048,
            storage_path: format!("/data/attachments/{run_id}/{filename}"),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = repo().await;
        let created = repo.create_attachment(&payload("r1", "a.png")).await.unwrap();
        let read = repo.get_attachment(&created.id).await.unwrap().unwrap();
        assert_eq!(read, created);
        assert_eq!(read.file_size, 2048);
        assert_eq!(read.storage_path, "/data/attachments/r1/a.png");
    }

    #[tokio::test]
    async fn test_by_run_count_and_delete() {
        let repo = repo().await;
        let a = repo.create_attachment(&payload("r1", "a.png")).await.unwrap();
        repo.create_attachment(&payload("r1", "b.png")).await.unwrap();
        repo.create_attachment(&payload("r2", "c.png")).await.unwrap();

        assert_eq!(repo.get_attachments_by_run("r1").await.unwrap().len(), 2);
        assert_eq!(repo.count_attachments_by_run("r2").await.unwrap(), 1);
        assert!(repo.delete_attachment(&a.id).await.unwrap());
        assert!(!repo.delete_attachment(&a.id).await.unwrap());
        assert_eq!(repo.count_attachments_by_run("r1").await.unwrap(), 1);
    }
}
