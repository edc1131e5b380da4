//! Document-store seam. The pipeline hands every record to a `ContentStore`;
//! write failures are reported, never fatal.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

use crate::error::PersistenceError;
use crate::model::{ClassificationResult, ComponentSchema, ComponentType, ContentInstance};
use crate::report::PageSummary;

pub type DynStore = Arc<dyn ContentStore>;

#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    async fn save_schema(&self, schema: &ComponentSchema) -> Result<(), PersistenceError>;
    async fn save_classification(&self, result: &ClassificationResult) -> Result<(), PersistenceError>;
    async fn save_instance(&self, instance: &ContentInstance) -> Result<(), PersistenceError>;
    async fn save_component_type(&self, ty: &ComponentType) -> Result<(), PersistenceError>;
    async fn save_page_summary(&self, page: &PageSummary) -> Result<(), PersistenceError>;
}

/// Keeps everything in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Saved>,
}

#[derive(Debug, Default, Clone)]
pub struct Saved {
    pub schemas: Vec<ComponentSchema>,
    pub classifications: Vec<ClassificationResult>,
    pub instances: Vec<ContentInstance>,
    pub component_types: Vec<ComponentType>,
    pub pages: Vec<PageSummary>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Saved {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn with<F: FnOnce(&mut Saved)>(&self, f: F) -> Result<(), PersistenceError> {
        f(&mut self.inner.lock().unwrap_or_else(|e| e.into_inner()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContentStore for MemoryStore {
    async fn save_schema(&self, schema: &ComponentSchema) -> Result<(), PersistenceError> {
        self.with(|s| s.schemas.push(schema.clone()))
    }

    async fn save_classification(&self, result: &ClassificationResult) -> Result<(), PersistenceError> {
        self.with(|s| s.classifications.push(result.clone()))
    }

    async fn save_instance(&self, instance: &ContentInstance) -> Result<(), PersistenceError> {
        self.with(|s| s.instances.push(instance.clone()))
    }

    async fn save_component_type(&self, ty: &ComponentType) -> Result<(), PersistenceError> {
        self.with(|s| s.component_types.push(ty.clone()))
    }

    async fn save_page_summary(&self, page: &PageSummary) -> Result<(), PersistenceError> {
        self.with(|s| s.pages.push(page.clone()))
    }
}

/// Appends one JSON line per record to `<dir>/<kind>.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{kind}.jsonl"))
    }

    async fn append<T: Serialize + Sync>(
        &self,
        kind: &'static str,
        uid: &str,
        record: &T,
    ) -> Result<(), PersistenceError> {
        let fail = |message: String| PersistenceError {
            kind,
            uid: uid.to_string(),
            message,
        };
        let mut line = serde_json::to_string(record).map_err(|e| fail(e.to_string()))?;
        line.push('\n');
        append_line(&self.path_for(kind), &line)
            .await
            .map_err(|e| fail(e.to_string()))
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    f.write_all(line.as_bytes()).await?;
    f.flush().await
}

#[async_trait::async_trait]
impl ContentStore for JsonlStore {
    async fn save_schema(&self, schema: &ComponentSchema) -> Result<(), PersistenceError> {
        self.append("schema", &schema.uid, schema).await
    }

    async fn save_classification(&self, result: &ClassificationResult) -> Result<(), PersistenceError> {
        self.append("classification", &result.key().to_string(), result).await
    }

    async fn save_instance(&self, instance: &ContentInstance) -> Result<(), PersistenceError> {
        self.append("instance", &instance.uid, instance).await
    }

    async fn save_component_type(&self, ty: &ComponentType) -> Result<(), PersistenceError> {
        self.append("component_type", &ty.uid, ty).await
    }

    async fn save_page_summary(&self, page: &PageSummary) -> Result<(), PersistenceError> {
        self.append("page", &page.page_id, page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SchemaOptions, UNKNOWN};

    fn schema(uid: &str) -> ComponentSchema {
        ComponentSchema {
            title: "T".into(),
            uid: uid.into(),
            fields: vec![],
            options: SchemaOptions {
                singleton: false,
                is_page: false,
                title: "title".into(),
            },
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn memory_store_keeps_order() {
        let store = MemoryStore::new();
        store.save_schema(&schema("a_component")).await.unwrap();
        store.save_schema(&schema("b_component")).await.unwrap();
        let uids: Vec<_> = store.snapshot().schemas.into_iter().map(|s| s.uid).collect();
        assert_eq!(uids, vec!["a_component", "b_component"]);
    }

    #[tokio::test]
    async fn jsonl_store_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(tmp.path().join("store"));
        store.save_schema(&schema("a_component")).await.unwrap();
        store.save_schema(&schema(UNKNOWN)).await.unwrap();
        let body = std::fs::read_to_string(store.path_for("schema")).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["uid"], "a_component");
    }

    #[tokio::test]
    async fn jsonl_store_reports_write_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        // A regular file where the directory should be.
        let store = JsonlStore::new(&blocker);
        let err = store.save_schema(&schema("a_component")).await.unwrap_err();
        assert_eq!(err.kind, "schema");
        assert_eq!(err.uid, "a_component");
    }
}
