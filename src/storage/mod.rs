//! 内容文档的持久化：统一的 read / write / update 接口，两种后端。
//!
//! 读取永不失败：资源未知、尚未写入、数据损坏或 I/O 错误都会返回调用方
//! 给出的默认值（非"未写入"的情况会记录警告日志）。写入整体替换文档，
//! 要么全部生效要么保持原样。

mod json;
mod sqlite;

pub use json::JsonStore;
pub use sqlite::SqliteStore;

use serde_json::Value;
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

/// Named content collections known to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Masters,
    Services,
    Articles,
    Faq,
    Legal,
    Social,
    ShopCategories,
    ShopProducts,
    Stats,
}

impl Resource {
    pub const ALL: [Resource; 9] = [
        Resource::Masters,
        Resource::Services,
        Resource::Articles,
        Resource::Faq,
        Resource::Legal,
        Resource::Social,
        Resource::ShopCategories,
        Resource::ShopProducts,
        Resource::Stats,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|resource| resource.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Resource::Masters => "masters",
            Resource::Services => "services",
            Resource::Articles => "articles",
            Resource::Faq => "faq",
            Resource::Legal => "legal",
            Resource::Social => "social",
            Resource::ShopCategories => "shop-categories",
            Resource::ShopProducts => "shop-products",
            Resource::Stats => "stats",
        }
    }

    /// JSON 后端中的文件名。
    pub fn file_name(self) -> &'static str {
        match self {
            Resource::Masters => "masters.json",
            Resource::Services => "services.json",
            Resource::Articles => "articles.json",
            Resource::Faq => "faq.json",
            Resource::Legal => "legal.json",
            Resource::Social => "social.json",
            Resource::ShopCategories => "shop-categories.json",
            Resource::ShopProducts => "products.json",
            Resource::Stats => "stats.json",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),
}

/// Storage backend chosen once at startup; callers only see this type.
pub enum Storage {
    Json(JsonStore),
    Sqlite(SqliteStore),
}

impl Storage {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Storage::Json(_) => "json",
            Storage::Sqlite(_) => "sqlite",
        }
    }

    /// 读取整个文档；任何失败都退回 `default`。
    pub async fn read(&self, name: &str, default: Value) -> Value {
        let Some(resource) = Resource::from_name(name) else {
            debug!(resource = name, "read of unknown resource");
            return default;
        };
        match self.load(resource).await {
            Ok(Some(document)) => document,
            Ok(None) => default,
            Err(err) => {
                warn!(resource = name, error = %err, "storage read failed, using default");
                default
            }
        }
    }

    /// 整体替换文档。
    pub async fn write(&self, name: &str, document: &Value) -> Result<(), StorageError> {
        let resource = resolve(name)?;
        match self {
            Storage::Json(store) => store.write(resource, document).await,
            Storage::Sqlite(store) => store.write(resource, document).await,
        }
    }

    /// 原子的读-改-写，返回写入后的文档。
    pub async fn update<F>(
        &self,
        name: &str,
        default: Value,
        updater: F,
    ) -> Result<Value, StorageError>
    where
        F: FnOnce(Value) -> Value,
    {
        let resource = resolve(name)?;
        match self {
            Storage::Json(store) => store.update(resource, default, updater).await,
            Storage::Sqlite(store) => store.update(resource, default, updater).await,
        }
    }

    /// 按 slug 查找启用状态的法律文档。
    pub async fn legal_by_slug(&self, slug: &str) -> Result<Option<Value>, StorageError> {
        match self {
            Storage::Json(store) => {
                let documents = store.load(Resource::Legal).await?;
                Ok(collection(documents.as_ref(), "documents")
                    .find(|doc| {
                        doc.get("slug").and_then(Value::as_str) == Some(slug) && is_active(doc)
                    })
                    .cloned())
            }
            Storage::Sqlite(store) => store.legal_by_slug(slug).await,
        }
    }

    pub async fn product_by_id(&self, id: &str) -> Result<Option<Value>, StorageError> {
        match self {
            Storage::Json(store) => {
                let products = store.load(Resource::ShopProducts).await?;
                Ok(collection(products.as_ref(), "products")
                    .find(|product| product.get("id").and_then(Value::as_str) == Some(id))
                    .cloned())
            }
            Storage::Sqlite(store) => store.product_by_id(id).await,
        }
    }

    /// 上架商品列表，可按店铺分类 slug 过滤。
    pub async fn products_filtered(
        &self,
        category_slug: Option<&str>,
    ) -> Result<Vec<Value>, StorageError> {
        match self {
            Storage::Json(store) => {
                let category_ids = match category_slug {
                    Some(slug) => {
                        let categories = store.load(Resource::ShopCategories).await?;
                        Some(
                            collection(categories.as_ref(), "categories")
                                .filter(|cat| cat.get("slug").and_then(Value::as_str) == Some(slug))
                                .filter_map(|cat| cat.get("id").and_then(Value::as_str))
                                .map(str::to_string)
                                .collect::<Vec<_>>(),
                        )
                    }
                    None => None,
                };
                let products = store.load(Resource::ShopProducts).await?;
                Ok(collection(products.as_ref(), "products")
                    .filter(|product| product_status(product) == ACTIVE_STATUS)
                    .filter(|product| match &category_ids {
                        Some(ids) => ids.iter().any(|id| id == product_category(product)),
                        None => true,
                    })
                    .cloned()
                    .collect())
            }
            Storage::Sqlite(store) => store.products_filtered(category_slug).await,
        }
    }

    async fn load(&self, resource: Resource) -> Result<Option<Value>, StorageError> {
        match self {
            Storage::Json(store) => store.load(resource).await,
            Storage::Sqlite(store) => store.load(resource).await,
        }
    }
}

pub(crate) const ACTIVE_STATUS: &str = "active";

fn resolve(name: &str) -> Result<Resource, StorageError> {
    Resource::from_name(name).ok_or_else(|| StorageError::UnknownResource(name.to_string()))
}

fn collection<'a>(document: Option<&'a Value>, key: &str) -> impl Iterator<Item = &'a Value> {
    document
        .and_then(|doc| doc.get(key))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

pub(crate) fn is_active(document: &Value) -> bool {
    document
        .get("active")
        .map(|value| !matches!(value, Value::Bool(false) | Value::Null))
        .unwrap_or(true)
}

pub(crate) fn product_status(product: &Value) -> &str {
    product
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(ACTIVE_STATUS)
}

pub(crate) fn product_category(product: &Value) -> &str {
    product
        .get("categoryId")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// 文档中的对象数组字段，缺失或类型不符时为空。
pub(crate) fn records<'a>(document: &'a Value, key: &str) -> &'a [Value] {
    document
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    async fn json_storage() -> (TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let store = JsonStore::open(temp.path().join("data"))
            .await
            .expect("json store");
        (temp, Arc::new(Storage::Json(store)))
    }

    async fn sqlite_storage() -> (TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(&temp.path().join("cms.db"))
            .await
            .expect("sqlite store");
        (temp, Arc::new(Storage::Sqlite(store)))
    }

    async fn both_backends() -> Vec<(TempDir, Arc<Storage>)> {
        vec![json_storage().await, sqlite_storage().await]
    }

    fn sample_documents() -> Vec<(&'static str, Value)> {
        vec![
            (
                "masters",
                json!({"masters": [
                    {"id": "master_1700000000", "name": "Иван", "badge": "green"},
                    {"id": "master_1700000001", "name": "Пётр", "badge": "pink"}
                ]}),
            ),
            (
                "services",
                json!({
                    "categories": [
                        {"id": "1", "name": "Стрижки", "services": [{"name": "Fade", "price": 1500}]}
                    ],
                    "podology": {
                        "title": "Подология",
                        "description": "Уход",
                        "services": [{"name": "Педикюр", "price": 2000}],
                        "categories": [{"id": "p1", "name": "Базовый"}]
                    }
                }),
            ),
            (
                "articles",
                json!({"articles": [{"id": "article_1700000000", "title": "Уход за бородой"}]}),
            ),
            (
                "faq",
                json!({"faq": [{"id": "faq_1700000000", "question": "Q?", "answer": "A."}]}),
            ),
            (
                "legal",
                json!({"documents": [
                    {"id": "legal_1", "slug": "privacy", "title": "Privacy", "active": true},
                    {"id": "legal_2", "slug": "terms", "title": "Terms", "active": false}
                ]}),
            ),
            (
                "social",
                json!({
                    "social": [{"id": "vk", "url": "https://vk.com/barbers"}],
                    "phone": "+7 900 000-00-00",
                    "email": "hello@example.com",
                    "address": "Main st. 1"
                }),
            ),
            (
                "shop-categories",
                json!({"categories": [{"id": "category_1", "name": "Hair", "slug": "hair"}]}),
            ),
            (
                "shop-products",
                json!({"products": [
                    {"id": "product_2", "name": "Wax", "categoryId": "category_1", "status": "active"},
                    {"id": "product_1", "name": "Oil", "categoryId": "category_1", "status": "draft"}
                ]}),
            ),
            (
                "stats",
                json!({
                    "total_views": 12,
                    "unique_visitors": 3,
                    "created": "2024-01-01T00:00:00",
                    "last_visit": "2024-01-02T10:00:00",
                    "daily": {"2024-01-01": 5, "2024-01-02": 7},
                    "sections": {"masters": 4},
                    "sessions": {"2024-01-02": ["s1", "s2"]}
                }),
            ),
        ]
    }

    #[tokio::test]
    async fn write_then_read_round_trips_every_resource() {
        for (_temp, storage) in both_backends().await {
            for (name, document) in sample_documents() {
                storage.write(name, &document).await.expect("write");
                let read = storage.read(name, json!({})).await;
                assert_eq!(read, document, "{} via {}", name, storage.backend_name());
            }
        }
    }

    #[tokio::test]
    async fn never_written_resource_reads_default() {
        for (_temp, storage) in both_backends().await {
            let default = json!({"masters": "fallback"});
            assert_eq!(storage.read("masters", default.clone()).await, default);
            assert_eq!(storage.read("stats", json!(null)).await, json!(null));
        }
    }

    #[tokio::test]
    async fn unknown_resource_reads_default_and_rejects_writes() {
        for (_temp, storage) in both_backends().await {
            assert_eq!(storage.read("secrets", json!([])).await, json!([]));
            let result = storage.write("secrets", &json!({"a": 1})).await;
            assert!(matches!(result, Err(StorageError::UnknownResource(_))));
        }
    }

    #[tokio::test]
    async fn write_replaces_previous_document() {
        for (_temp, storage) in both_backends().await {
            storage
                .write("faq", &json!({"faq": [{"id": "faq_1", "question": "old"}]}))
                .await
                .expect("first write");
            let replacement = json!({"faq": [{"id": "faq_2", "question": "new"}]});
            storage.write("faq", &replacement).await.expect("second write");
            assert_eq!(storage.read("faq", json!({})).await, replacement);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_serialized() {
        const TASKS: i64 = 32;
        for (_temp, storage) in both_backends().await {
            storage
                .write("stats", &json!({"total_views": 5, "unique_visitors": 0}))
                .await
                .expect("seed");

            let handles = (0..TASKS)
                .map(|_| {
                    let storage = storage.clone();
                    tokio::spawn(async move {
                        storage
                            .update("stats", json!({}), |mut stats| {
                                let current = stats["total_views"].as_i64().unwrap_or(0);
                                stats["total_views"] = json!(current + 1);
                                stats
                            })
                            .await
                            .expect("update");
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.await.expect("join");
            }

            let stats = storage.read("stats", json!({})).await;
            assert_eq!(stats["total_views"], json!(5 + TASKS), "{}", storage.backend_name());
        }
    }

    #[tokio::test]
    async fn update_starts_from_default_when_empty() {
        for (_temp, storage) in both_backends().await {
            let updated = storage
                .update("masters", json!({"masters": []}), |mut doc| {
                    doc["masters"] = json!([{"id": "master_1", "name": "A"}]);
                    doc
                })
                .await
                .expect("update");
            assert_eq!(storage.read("masters", json!({})).await, updated);
        }
    }

    #[tokio::test]
    async fn lookups_behave_the_same_on_both_backends() {
        for (_temp, storage) in both_backends().await {
            for (name, document) in sample_documents() {
                storage.write(name, &document).await.expect("write");
            }

            let privacy = storage.legal_by_slug("privacy").await.expect("legal");
            assert_eq!(privacy.expect("privacy")["id"], "legal_1");
            assert!(storage.legal_by_slug("terms").await.expect("legal").is_none());

            let oil = storage.product_by_id("product_1").await.expect("product");
            assert_eq!(oil.expect("oil")["name"], "Oil");
            assert!(storage.product_by_id("product_9").await.expect("product").is_none());

            let hair = storage.products_filtered(Some("hair")).await.expect("filter");
            assert_eq!(hair.len(), 1);
            assert_eq!(hair[0]["id"], "product_2");
            let all = storage.products_filtered(None).await.expect("filter");
            assert_eq!(all.len(), 1);
            let none = storage.products_filtered(Some("beard")).await.expect("filter");
            assert!(none.is_empty());
        }
    }
}
