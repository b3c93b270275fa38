//! SQLite 后端：文档拆分为规范化表，写入在单个事务中删除并重新插入。

use chrono::Utc;
use serde_json::{Map, Value, json};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    ACTIVE_STATUS, Resource, StorageError, is_active, product_category, product_status, records,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS resources (
        name TEXT PRIMARY KEY,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS masters (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS service_categories (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS podology_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS podology_categories (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS articles (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS faq (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS legal (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        slug TEXT NOT NULL DEFAULT '',
        active INTEGER NOT NULL DEFAULT 1,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS social_links (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS contacts (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS shop_categories (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        slug TEXT NOT NULL DEFAULT '',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS products (
        sort_order INTEGER PRIMARY KEY,
        id TEXT NOT NULL DEFAULT '',
        category_id TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS stats_counters (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS stats_daily (
        date TEXT PRIMARY KEY,
        count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS stats_sections (
        name TEXT PRIMARY KEY,
        count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS stats_sessions (
        date TEXT NOT NULL,
        session_id TEXT NOT NULL,
        PRIMARY KEY (date, session_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_legal_slug ON legal(slug)",
    "CREATE INDEX IF NOT EXISTS idx_products_id ON products(id)",
    "CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id)",
    "CREATE INDEX IF NOT EXISTS idx_products_status ON products(status)",
    "CREATE INDEX IF NOT EXISTS idx_shop_categories_slug ON shop_categories(slug)",
];

const STATS_DAILY: &str = "daily";
const STATS_SECTIONS: &str = "sections";
const STATS_SESSIONS: &str = "sessions";
const STATS_COUNTERS: [&str; 2] = ["total_views", "unique_visitors"];

/// SQLite-backed document store.
///
/// All writes, across every resource, go through one async lock.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.migrate().await?;
        info!(path = %path.display(), "sqlite storage ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// 从规范化表重建文档；从未写入的资源返回 None。
    pub(super) async fn load(&self, resource: Resource) -> Result<Option<Value>, StorageError> {
        // One read transaction so multi-table documents come from one snapshot.
        let mut tx = self.pool.begin().await?;
        let written: Option<String> =
            sqlx::query_scalar("SELECT name FROM resources WHERE name = ?")
                .bind(resource.name())
                .fetch_optional(&mut *tx)
                .await?;
        if written.is_none() {
            return Ok(None);
        }

        let document = match resource {
            Resource::Masters => json!({ "masters": read_records(&mut tx, "masters").await? }),
            Resource::Services => read_services(&mut tx).await?,
            Resource::Articles => json!({ "articles": read_records(&mut tx, "articles").await? }),
            Resource::Faq => json!({ "faq": read_records(&mut tx, "faq").await? }),
            Resource::Legal => json!({ "documents": read_records(&mut tx, "legal").await? }),
            Resource::Social => read_social(&mut tx).await?,
            Resource::ShopCategories => {
                json!({ "categories": read_records(&mut tx, "shop_categories").await? })
            }
            Resource::ShopProducts => {
                json!({ "products": read_records(&mut tx, "products").await? })
            }
            Resource::Stats => read_stats(&mut tx).await?,
        };
        tx.commit().await?;
        Ok(Some(document))
    }

    pub(super) async fn write(
        &self,
        resource: Resource,
        document: &Value,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
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
        let _guard = self.write_lock.lock().await;
        let current = self.load(resource).await?.unwrap_or(default);
        let updated = updater(current);
        self.persist(resource, &updated).await?;
        Ok(updated)
    }

    /// 调用方必须持有写锁。
    async fn persist(&self, resource: Resource, document: &Value) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        match resource {
            Resource::Masters => {
                replace_records(&mut tx, "masters", records(document, "masters")).await?
            }
            Resource::Services => write_services(&mut tx, document).await?,
            Resource::Articles => {
                replace_records(&mut tx, "articles", records(document, "articles")).await?
            }
            Resource::Faq => {
                let items = if document.get("faq").is_some() {
                    records(document, "faq")
                } else {
                    records(document, "items")
                };
                replace_records(&mut tx, "faq", items).await?
            }
            Resource::Legal => write_legal(&mut tx, records(document, "documents")).await?,
            Resource::Social => write_social(&mut tx, document).await?,
            Resource::ShopCategories => {
                write_shop_categories(&mut tx, records(document, "categories")).await?
            }
            Resource::ShopProducts => {
                write_products(&mut tx, records(document, "products")).await?
            }
            Resource::Stats => write_stats(&mut tx, document).await?,
        }

        sqlx::query(
            "INSERT INTO resources (name, updated_at) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(resource.name())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(resource = resource.name(), "document committed");
        Ok(())
    }

    pub(super) async fn legal_by_slug(&self, slug: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT data FROM legal WHERE slug = ? AND active = 1 ORDER BY sort_order LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|raw| parse_record(&raw)).transpose()
    }

    pub(super) async fn product_by_id(&self, id: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT data FROM products WHERE id = ? ORDER BY sort_order LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|raw| parse_record(&raw)).transpose()
    }

    pub(super) async fn products_filtered(
        &self,
        category_slug: Option<&str>,
    ) -> Result<Vec<Value>, StorageError> {
        let rows: Vec<String> = match category_slug {
            Some(slug) => {
                sqlx::query_scalar(
                    "SELECT data FROM products
                     WHERE status = ?
                       AND category_id IN (SELECT id FROM shop_categories WHERE slug = ?)
                     ORDER BY sort_order",
                )
                .bind(ACTIVE_STATUS)
                .bind(slug)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT data FROM products WHERE status = ? ORDER BY sort_order")
                    .bind(ACTIVE_STATUS)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(|raw| parse_record(raw)).collect()
    }
}

fn parse_record(raw: &str) -> Result<Value, StorageError> {
    Ok(serde_json::from_str(raw)?)
}

/// 记录 ID 统一存为字符串；数字 ID（服务）转为十进制文本。
fn record_id(record: &Value) -> String {
    match record.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    }
}

fn str_field<'a>(record: &'a Value, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or("")
}

async fn read_records(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<Value>, StorageError> {
    let sql = format!("SELECT data FROM {table} ORDER BY sort_order");
    let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;
    rows.iter().map(|raw| parse_record(raw)).collect()
}

/// 键值表，值以 JSON 文本保存。
async fn read_key_values(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Map<String, Value>, StorageError> {
    let sql = format!("SELECT key, value FROM {table} ORDER BY rowid");
    let rows: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
    Ok(rows
        .into_iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            (key, value)
        })
        .collect())
}

async fn replace_records(
    conn: &mut SqliteConnection,
    table: &str,
    items: &[Value],
) -> Result<(), StorageError> {
    sqlx::query(&format!("DELETE FROM {table}"))
        .execute(&mut *conn)
        .await?;
    let insert = format!("INSERT INTO {table} (sort_order, id, data) VALUES (?, ?, ?)");
    for (index, item) in items.iter().enumerate() {
        sqlx::query(&insert)
            .bind(index as i64)
            .bind(record_id(item))
            .bind(serde_json::to_string(item)?)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn replace_key_values<'a>(
    conn: &mut SqliteConnection,
    table: &str,
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
) -> Result<(), StorageError> {
    sqlx::query(&format!("DELETE FROM {table}"))
        .execute(&mut *conn)
        .await?;
    let insert = format!("INSERT INTO {table} (key, value) VALUES (?, ?)");
    for (key, value) in entries {
        sqlx::query(&insert)
            .bind(key)
            .bind(serde_json::to_string(value)?)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn read_services(conn: &mut SqliteConnection) -> Result<Value, StorageError> {
    let categories = read_records(conn, "service_categories").await?;
    let mut podology = read_key_values(conn, "podology_meta").await?;
    let podology_categories = read_records(conn, "podology_categories").await?;

    let mut document = json!({ "categories": categories });
    if !podology.is_empty() || !podology_categories.is_empty() {
        podology.insert("categories".into(), Value::Array(podology_categories));
        document["podology"] = Value::Object(podology);
    }
    Ok(document)
}

async fn write_services(conn: &mut SqliteConnection, document: &Value) -> Result<(), StorageError> {
    replace_records(conn, "service_categories", records(document, "categories")).await?;

    let empty = Map::new();
    let podology = document
        .get("podology")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    replace_key_values(
        conn,
        "podology_meta",
        podology.iter().filter(|(key, _)| key.as_str() != "categories"),
    )
    .await?;
    let podology_categories = podology
        .get("categories")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    replace_records(conn, "podology_categories", podology_categories).await
}

async fn read_social(conn: &mut SqliteConnection) -> Result<Value, StorageError> {
    let links = read_records(conn, "social_links").await?;
    let mut document = read_key_values(conn, "contacts").await?;
    document.insert("social".into(), Value::Array(links));
    Ok(Value::Object(document))
}

async fn write_social(conn: &mut SqliteConnection, document: &Value) -> Result<(), StorageError> {
    replace_records(conn, "social_links", records(document, "social")).await?;
    let empty = Map::new();
    let fields = document.as_object().unwrap_or(&empty);
    replace_key_values(
        conn,
        "contacts",
        fields.iter().filter(|(key, _)| key.as_str() != "social"),
    )
    .await
}

async fn write_legal(conn: &mut SqliteConnection, documents: &[Value]) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM legal").execute(&mut *conn).await?;
    for (index, doc) in documents.iter().enumerate() {
        sqlx::query(
            "INSERT INTO legal (sort_order, id, slug, active, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(index as i64)
        .bind(record_id(doc))
        .bind(str_field(doc, "slug"))
        .bind(is_active(doc))
        .bind(serde_json::to_string(doc)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_shop_categories(
    conn: &mut SqliteConnection,
    categories: &[Value],
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM shop_categories")
        .execute(&mut *conn)
        .await?;
    for (index, category) in categories.iter().enumerate() {
        sqlx::query("INSERT INTO shop_categories (sort_order, id, slug, data) VALUES (?, ?, ?, ?)")
            .bind(index as i64)
            .bind(record_id(category))
            .bind(str_field(category, "slug"))
            .bind(serde_json::to_string(category)?)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn write_products(conn: &mut SqliteConnection, products: &[Value]) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM products").execute(&mut *conn).await?;
    for (index, product) in products.iter().enumerate() {
        sqlx::query(
            "INSERT INTO products (sort_order, id, category_id, status, data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(index as i64)
        .bind(record_id(product))
        .bind(product_category(product))
        .bind(product_status(product))
        .bind(serde_json::to_string(product)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn read_stats(conn: &mut SqliteConnection) -> Result<Value, StorageError> {
    let mut document = Map::new();
    for counter in STATS_COUNTERS {
        document.insert(counter.into(), json!(0));
    }
    document.extend(read_key_values(conn, "stats_counters").await?);

    let daily: Vec<(String, i64)> = sqlx::query_as("SELECT date, count FROM stats_daily ORDER BY date")
        .fetch_all(&mut *conn)
        .await?;
    document.insert(
        STATS_DAILY.into(),
        Value::Object(daily.into_iter().map(|(date, n)| (date, json!(n))).collect()),
    );

    let sections: Vec<(String, i64)> =
        sqlx::query_as("SELECT name, count FROM stats_sections ORDER BY name")
            .fetch_all(&mut *conn)
            .await?;
    document.insert(
        STATS_SECTIONS.into(),
        Value::Object(sections.into_iter().map(|(name, n)| (name, json!(n))).collect()),
    );

    let session_rows: Vec<(String, String)> =
        sqlx::query_as("SELECT date, session_id FROM stats_sessions ORDER BY date, rowid")
            .fetch_all(&mut *conn)
            .await?;
    let mut sessions = Map::new();
    for (date, session_id) in session_rows {
        if let Value::Array(ids) = sessions
            .entry(date)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            ids.push(Value::String(session_id));
        }
    }
    document.insert(STATS_SESSIONS.into(), Value::Object(sessions));

    Ok(Value::Object(document))
}

async fn write_stats(conn: &mut SqliteConnection, document: &Value) -> Result<(), StorageError> {
    let empty = Map::new();
    let fields = document.as_object().unwrap_or(&empty);
    replace_key_values(
        conn,
        "stats_counters",
        fields.iter().filter(|(key, _)| {
            !matches!(key.as_str(), STATS_DAILY | STATS_SECTIONS | STATS_SESSIONS)
        }),
    )
    .await?;

    write_counts(conn, "stats_daily", "date", fields.get(STATS_DAILY)).await?;
    write_counts(conn, "stats_sections", "name", fields.get(STATS_SECTIONS)).await?;

    sqlx::query("DELETE FROM stats_sessions")
        .execute(&mut *conn)
        .await?;
    let sessions = fields
        .get(STATS_SESSIONS)
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    for (date, ids) in sessions {
        for id in ids.as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let session_id = match id {
                Value::String(value) => value.clone(),
                other => other.to_string(),
            };
            sqlx::query("INSERT OR IGNORE INTO stats_sessions (date, session_id) VALUES (?, ?)")
                .bind(date)
                .bind(session_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

async fn write_counts(
    conn: &mut SqliteConnection,
    table: &str,
    key_column: &str,
    counts: Option<&Value>,
) -> Result<(), StorageError> {
    sqlx::query(&format!("DELETE FROM {table}"))
        .execute(&mut *conn)
        .await?;
    let Some(counts) = counts.and_then(Value::as_object) else {
        return Ok(());
    };
    let insert = format!("INSERT INTO {table} ({key_column}, count) VALUES (?, ?)");
    for (key, count) in counts {
        sqlx::query(&insert)
            .bind(key)
            .bind(count.as_i64().unwrap_or(0))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reopening_keeps_committed_documents() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("cms.db");
        let document = json!({"faq": [{"id": "faq_1", "question": "Когда открыты?"}]});
        {
            let store = SqliteStore::open(&path).await.expect("open");
            store.write(Resource::Faq, &document).await.expect("write");
        }
        let store = SqliteStore::open(&path).await.expect("reopen");
        assert_eq!(store.load(Resource::Faq).await.expect("load"), Some(document));
    }

    #[tokio::test]
    async fn faq_items_alias_is_accepted() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(&temp.path().join("cms.db"))
            .await
            .expect("open");
        store
            .write(Resource::Faq, &json!({"items": [{"id": "faq_1", "question": "Q"}]}))
            .await
            .expect("write");
        let loaded = store.load(Resource::Faq).await.expect("load").expect("doc");
        assert_eq!(loaded["faq"][0]["question"], "Q");
    }

    #[tokio::test]
    async fn records_without_ids_keep_their_order() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(&temp.path().join("cms.db"))
            .await
            .expect("open");
        let document = json!({"masters": [{"name": "C"}, {"name": "A"}, {"name": "B"}]});
        store.write(Resource::Masters, &document).await.expect("write");
        assert_eq!(store.load(Resource::Masters).await.expect("load"), Some(document));
    }

    #[tokio::test]
    async fn failed_transaction_leaves_previous_rows() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(&temp.path().join("cms.db"))
            .await
            .expect("open");
        let original = json!({"articles": [{"id": "article_1", "title": "Old"}]});
        store.write(Resource::Articles, &original).await.expect("write");

        {
            let mut tx = store.pool.begin().await.expect("begin");
            replace_records(&mut tx, "articles", &[json!({"id": "article_2"})])
                .await
                .expect("replace");
            // Dropped without commit, as if the process died mid-write.
        }

        assert_eq!(store.load(Resource::Articles).await.expect("load"), Some(original));
    }
}
