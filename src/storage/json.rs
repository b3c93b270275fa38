//! JSON 文件后端：每个资源一个文件，临时文件 + 原子重命名。

use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{Resource, StorageError};
use crate::atomic::write_atomic;
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::locking::LockManager;

#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    locks: LockManager,
    lock_timeout: Duration,
}

impl JsonStore {
    /// 打开数据目录，不存在时创建。
    pub async fn open(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: LockManager::new(),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, resource: Resource) -> PathBuf {
        self.root.join(resource.file_name())
    }

    async fn lock(&self, resource: Resource) -> Result<OwnedMutexGuard<()>, StorageError> {
        self.locks
            .lock_with_timeout(resource.name(), self.lock_timeout)
            .await
            .ok_or_else(|| StorageError::LockTimeout(resource.name().to_string()))
    }

    /// 读取文件；不存在时返回 None。
    pub(super) async fn load(&self, resource: Resource) -> Result<Option<Value>, StorageError> {
        let bytes = match fs::read(self.path_for(resource)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub(super) async fn write(
        &self,
        resource: Resource,
        document: &Value,
    ) -> Result<(), StorageError> {
        let _guard = self.lock(resource).await?;
        self.persist(resource, document).await
    }

    pub(super) async fn update<F>(
        &self,
        resource: Resource,
        default: Value,
        updater: F,
    ) -> Result<Value, StorageError>
    where
        F: FnOnce(Value) -> Value,
    {
        let _guard = self.lock(resource).await?;
        let current = self.load(resource).await?.unwrap_or(default);
        let updated = updater(current);
        self.persist(resource, &updated).await?;
        Ok(updated)
    }

    /// 调用方必须持有该资源的锁。
    async fn persist(&self, resource: Resource, document: &Value) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomic(&self.path_for(resource), &bytes).await?;
        debug!(resource = resource.name(), bytes = bytes.len(), "document written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_a_default() {
        let temp = tempdir().expect("tempdir");
        let store = JsonStore::open(temp.path().to_path_buf())
            .await
            .expect("open");
        std::fs::write(temp.path().join("faq.json"), "not valid json{{{").expect("write");

        assert!(matches!(
            store.load(Resource::Faq).await,
            Err(StorageError::Json(_))
        ));
    }

    #[tokio::test]
    async fn writes_pretty_utf8_files() {
        let temp = tempdir().expect("tempdir");
        let store = JsonStore::open(temp.path().to_path_buf())
            .await
            .expect("open");
        store
            .write(Resource::Masters, &json!({"masters": [{"name": "Иван"}]}))
            .await
            .expect("write");

        let text = std::fs::read_to_string(temp.path().join("masters.json")).expect("read");
        assert!(text.contains("Иван"));
        assert!(text.contains('\n'));
    }

    #[tokio::test]
    async fn panicking_updater_leaves_document_intact() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(
            JsonStore::open(temp.path().to_path_buf())
                .await
                .expect("open"),
        );
        let original = json!({"total_views": 7});
        store.write(Resource::Stats, &original).await.expect("write");

        let task_store = store.clone();
        let result = tokio::spawn(async move {
            task_store
                .update(Resource::Stats, json!({}), |_| panic!("crash mid-update"))
                .await
        })
        .await;
        assert!(result.is_err());

        assert_eq!(store.load(Resource::Stats).await.expect("load"), Some(original));
        store
            .write(Resource::Stats, &json!({"total_views": 8}))
            .await
            .expect("lock released after panic");
    }
}
