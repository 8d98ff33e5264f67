// ABOUTME: Record persistence for roles and per-user state behind an async RecordStore trait.
// ABOUTME: MemoryStore backs tests; SqliteStore keeps JSON field maps in a single records table.
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One stored row: a model name plus free-form JSON fields
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    pub model: String,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }
}

/// Field equality constraints; an empty filter matches every record of a model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Vec<(String, Value)>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        self.0.iter().all(|(k, v)| fields.get(k) == Some(v))
    }

    /// The constraints as a field map, used to seed a new record
    pub fn to_fields(&self) -> Map<String, Value> {
        self.0.iter().cloned().collect()
    }

    /// SQL conditions for the integer and string constraints on plain keys.
    /// The flag is false when some constraint is left for `matches`.
    fn to_sql(&self) -> (String, Vec<rusqlite::types::Value>, bool) {
        let mut clause = String::new();
        let mut args = Vec::new();
        let mut complete = true;
        for (key, value) in &self.0 {
            let plain =
                !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            let arg = match value {
                Value::Number(n) => n.as_i64().map(rusqlite::types::Value::Integer),
                Value::String(s) => Some(rusqlite::types::Value::Text(s.clone())),
                _ => None,
            };
            match arg {
                Some(arg) if plain => {
                    clause.push_str(&format!(" AND json_extract(fields, '$.\"{}\"') = ?", key));
                    args.push(arg);
                }
                _ => complete = false,
            }
        }
        (clause, args, complete)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, model: &str, filter: &Filter) -> Result<Option<Record>>;

    async fn create(&self, model: &str, fields: Map<String, Value>) -> Result<Record>;

    async fn update(&self, record: &Record) -> Result<()>;

    async fn count(&self, model: &str, filter: &Filter) -> Result<usize>;

    async fn get_or_create(&self, model: &str, filter: &Filter) -> Result<Record> {
        match self.get(model, filter).await? {
            Some(record) => Ok(record),
            None => self.create(model, filter.to_fields()).await,
        }
    }
}

/// In-process store; contents are lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: tokio::sync::Mutex<Vec<Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, model: &str, filter: &Filter) -> Result<Option<Record>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .find(|r| r.model == model && filter.matches(&r.fields))
            .cloned())
    }

    async fn create(&self, model: &str, fields: Map<String, Value>) -> Result<Record> {
        let mut records = self.records.lock().await;
        let record = Record {
            id: records.len() as i64 + 1,
            model: model.to_string(),
            fields,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn update(&self, record: &Record) -> Result<()> {
        let mut records = self.records.lock().await;
        let slot = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .with_context(|| format!("No record with id {}", record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn count(&self, model: &str, filter: &Filter) -> Result<usize> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.model == model && filter.matches(&r.fields))
            .count())
    }
}

/// SQLite-backed store under the workspace directory
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create workspace directory")?;
        }
        let conn = Connection::open(db_path).context("Failed to open SQLite database")?;
        Self::init(conn, &db_path.display().to_string())
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open SQLite database")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, location: &str) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS records_model ON records (model)",
            [],
        )?;
        // Every role and user lookup filters on user_id
        conn.execute(
            "CREATE INDEX IF NOT EXISTS records_user_id
                ON records (model, json_extract(fields, '$.\"user_id\"'))",
            [],
        )?;

        tracing::info!(db = %location, "RecordStore initialized");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Records of `model` passing the SQL part of `filter`, in id order
    fn select(&self, model: &str, filter: &Filter, limit: Option<usize>) -> Result<Vec<Record>> {
        let (clause, mut args, _) = filter.to_sql();
        let mut sql = format!(
            "SELECT id, fields FROM records WHERE model = ?{} ORDER BY id",
            clause
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        args.insert(0, rusqlite::types::Value::Text(model.to_string()));

        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            let fields: Map<String, Value> = serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt fields for record {}", id))?;
            if filter.matches(&fields) {
                records.push(Record {
                    id,
                    model: model.to_string(),
                    fields,
                });
            }
        }
        Ok(records)
    }

    #[cfg(test)]
    fn query_plan(&self, model: &str, filter: &Filter) -> Result<String> {
        let (clause, mut args, _) = filter.to_sql();
        args.insert(0, rusqlite::types::Value::Text(model.to_string()));
        let sql = format!("EXPLAIN QUERY PLAN SELECT id FROM records WHERE model = ?{}", clause);
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(3))?;
        let mut plan = Vec::new();
        for row in rows {
            plan.push(row?);
        }
        Ok(plan.join("\n"))
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, model: &str, filter: &Filter) -> Result<Option<Record>> {
        let (_, _, complete) = filter.to_sql();
        let limit = complete.then_some(1);
        Ok(self.select(model, filter, limit)?.into_iter().next())
    }

    async fn create(&self, model: &str, fields: Map<String, Value>) -> Result<Record> {
        let raw = serde_json::to_string(&fields)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        db.execute(
            "INSERT INTO records (model, fields, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![model, raw, now],
        )?;
        Ok(Record {
            id: db.last_insert_rowid(),
            model: model.to_string(),
            fields,
        })
    }

    async fn update(&self, record: &Record) -> Result<()> {
        let raw = serde_json::to_string(&record.fields)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let changed = db.execute(
            "UPDATE records SET fields = ?1, updated_at = ?2 WHERE id = ?3",
            params![raw, now, record.id],
        )?;
        if changed == 0 {
            anyhow::bail!("No record with id {}", record.id);
        }
        Ok(())
    }

    async fn count(&self, model: &str, filter: &Filter) -> Result<usize> {
        let (clause, mut args, complete) = filter.to_sql();
        if !complete {
            return Ok(self.select(model, filter, None)?.len());
        }
        args.insert(0, rusqlite::types::Value::Text(model.to_string()));
        let sql = format!("SELECT COUNT(*) FROM records WHERE model = ?{}", clause);
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let count: i64 = db.query_row(&sql, params_from_iter(args), |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn exercise(store: &dyn RecordStore) {
        let role = store
            .create("role", fields(json!({"user_id": 1, "role": "admin"})))
            .await
            .unwrap();
        store
            .create("role", fields(json!({"user_id": 2, "role": "blacklisted"})))
            .await
            .unwrap();

        let found = store
            .get("role", &Filter::new().field("user_id", 1).field("role", "admin"))
            .await
            .unwrap();
        assert_eq!(found, Some(role.clone()));
        assert!(store
            .get("role", &Filter::new().field("user_id", 1).field("role", "blacklisted"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.count("role", &Filter::new()).await.unwrap(), 2);
        assert_eq!(store.count("user", &Filter::new()).await.unwrap(), 0);

        let mut updated = role;
        updated.set("role", "whitelisted");
        store.update(&updated).await.unwrap();
        assert_eq!(
            store
                .count("role", &Filter::new().field("role", "whitelisted"))
                .await
                .unwrap(),
            1
        );

        let created = store
            .get_or_create("user", &Filter::new().field("user_id", 9))
            .await
            .unwrap();
        let again = store
            .get_or_create("user", &Filter::new().field("user_id", 9))
            .await
            .unwrap();
        assert_eq!(created.id, again.id);
        assert_eq!(again.get_i64("user_id"), Some(9));
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_in_memory() {
        exercise(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws").join("records.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .create("user", fields(json!({"user_id": 5, "message_date": 100})))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let record = store
            .get("user", &Filter::new().field("user_id", 5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get_i64("message_date"), Some(100));
    }

    #[tokio::test]
    async fn test_sqlite_filters_keep_json_types_apart() {
        let store = SqliteStore::in_memory().unwrap();
        for (id, flag) in [(1, true), (2, false)] {
            store
                .create("user", fields(json!({"user_id": id, "muted": flag})))
                .await
                .unwrap();
        }
        store
            .create("user", fields(json!({"user_id": "1"})))
            .await
            .unwrap();
        store
            .create("role", fields(json!({"user_id": 1, "role": "admin"})))
            .await
            .unwrap();

        assert_eq!(store.count("user", &Filter::new().field("user_id", 1)).await.unwrap(), 1);
        assert_eq!(store.count("user", &Filter::new().field("user_id", "1")).await.unwrap(), 1);
        assert_eq!(store.count("user", &Filter::new()).await.unwrap(), 3);

        let muted = store
            .get("user", &Filter::new().field("muted", false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(muted.get_i64("user_id"), Some(2));
        assert_eq!(
            store
                .count("user", &Filter::new().field("user_id", 1).field("muted", true))
                .await
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_user_lookups_use_the_user_id_index() {
        let store = SqliteStore::in_memory().unwrap();
        let plan = store
            .query_plan("user", &Filter::new().field("user_id", 5))
            .unwrap();
        assert!(plan.contains("records_user_id"), "plan was: {}", plan);
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() {
        let record = Record {
            id: 99,
            model: "user".to_string(),
            fields: Map::new(),
        };
        assert!(MemoryStore::new().update(&record).await.is_err());
        assert!(SqliteStore::in_memory().unwrap().update(&record).await.is_err());
    }
}
