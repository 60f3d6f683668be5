// SQLite Backend
// Single-connection store behind an async mutex. WAL mode for concurrent
// readers; the connection lock serialises writes, which also gives the
// per-id atomicity the contract requires.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params_from_iter, Connection, Row};
use tokio::sync::Mutex;

use maestro_types::{MemoryEntry, MemoryKind, MemoryRelationship, MemoryTier};

use crate::similarity::{cosine_similarity, LexicalScorer, SimilarityScorer};
use crate::store::{
    Field, FieldValue, MemoryQuery, MemoryStore, MemoryUpdate, Predicate, Relevance, SortOrder,
};
use crate::types::MemoryResult;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    scorer: Arc<dyn SimilarityScorer>,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> MemoryResult<Self> {
        Self::open_with_scorer(db_path, Arc::new(LexicalScorer)).await
    }

    pub async fn open_with_scorer(
        db_path: &Path,
        scorer: Arc<dyn SimilarityScorer>,
    ) -> MemoryResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, scorer)
    }

    /// Private on-disk-free store, used by tests and ephemeral runs.
    pub fn open_in_memory() -> MemoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, Arc::new(LexicalScorer))
    }

    fn init(conn: Connection, scorer: Arc<dyn SimilarityScorer>) -> MemoryResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row; ignore it. In-memory databases
        // report "memory" here, which is fine.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT,
                tier TEXT NOT NULL,
                kind TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                importance REAL NOT NULL DEFAULT 0.5,
                confidence REAL NOT NULL DEFAULT 0.5,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER,
                extracted_from TEXT,
                consolidated INTEGER NOT NULL DEFAULT 0,
                consolidated_at INTEGER,
                relationships TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_user_tier
             ON memories (user_id, tier)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_user_session_tier_created
             ON memories (user_id, session_id, tier, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_user_category
             ON memories (user_id, category)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            scorer,
        })
    }
}

fn column(field: Field) -> &'static str {
    match field {
        Field::Id => "id",
        Field::UserId => "user_id",
        Field::SessionId => "session_id",
        Field::Tier => "tier",
        Field::Kind => "kind",
        Field::Category => "category",
        Field::Content => "content",
        Field::Importance => "importance",
        Field::Confidence => "confidence",
        Field::CreatedAt => "created_at",
        Field::UpdatedAt => "updated_at",
        Field::LastAccessed => "last_accessed",
        Field::AccessCount => "access_count",
        Field::Version => "version",
        Field::ExpiresAt => "expires_at",
        Field::ExtractedFrom => "extracted_from",
        Field::Consolidated => "consolidated",
    }
}

fn to_sql_value(value: &FieldValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        FieldValue::Str(s) => Value::Text(s.clone()),
        FieldValue::Num(n) => Value::Real(*n),
        FieldValue::Int(i) => Value::Integer(*i),
        FieldValue::Bool(b) => Value::Integer(i64::from(*b)),
        FieldValue::Time(t) => Value::Integer(t.timestamp_millis()),
    }
}

fn build_where(
    predicates: &[Predicate],
) -> (String, Vec<rusqlite::types::Value>) {
    let mut clauses = Vec::new();
    let mut params: Vec<rusqlite::types::Value> = Vec::new();

    for predicate in predicates {
        match predicate {
            Predicate::Equals(f, v) => {
                clauses.push(format!("{} = ?", column(*f)));
                params.push(to_sql_value(v));
            }
            Predicate::NotEquals(f, v) => {
                clauses.push(format!("{} <> ?", column(*f)));
                params.push(to_sql_value(v));
            }
            Predicate::LessThan(f, v) => {
                clauses.push(format!("{} < ?", column(*f)));
                params.push(to_sql_value(v));
            }
            Predicate::AtMost(f, v) => {
                clauses.push(format!("{} <= ?", column(*f)));
                params.push(to_sql_value(v));
            }
            Predicate::GreaterThan(f, v) => {
                clauses.push(format!("{} > ?", column(*f)));
                params.push(to_sql_value(v));
            }
            Predicate::AtLeast(f, v) => {
                clauses.push(format!("{} >= ?", column(*f)));
                params.push(to_sql_value(v));
            }
            Predicate::Contains(f, needle) => {
                clauses.push(format!("{} LIKE '%' || ? || '%'", column(*f)));
                params.push(rusqlite::types::Value::Text(needle.clone()));
            }
            Predicate::In(f, values) => {
                if values.is_empty() {
                    clauses.push("0 = 1".to_string());
                } else {
                    let marks = vec!["?"; values.len()].join(", ");
                    clauses.push(format!("{} IN ({})", column(*f), marks));
                    params.extend(values.iter().map(to_sql_value));
                }
            }
            Predicate::Between(f, lo, hi) => {
                clauses.push(format!("{} BETWEEN ? AND ?", column(*f)));
                params.push(to_sql_value(lo));
                params.push(to_sql_value(hi));
            }
            Predicate::IsNull(f) => clauses.push(format!("{} IS NULL", column(*f))),
            Predicate::NotNull(f) => clauses.push(format!("{} IS NOT NULL", column(*f))),
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (where_sql, params)
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let tier_raw: String = row.get("tier")?;
    let kind_raw: String = row.get("kind")?;
    let tags_raw: String = row.get("tags")?;
    let relationships_raw: String = row.get("relationships")?;
    let metadata_raw: String = row.get("metadata")?;
    let embedding_raw: Option<String> = row.get("embedding")?;

    let tags: BTreeSet<String> = serde_json::from_str(&tags_raw).unwrap_or_default();
    let relationships: Vec<MemoryRelationship> =
        serde_json::from_str(&relationships_raw).unwrap_or_default();
    let metadata: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&metadata_raw).unwrap_or_default();
    let embedding: Option<Vec<f32>> =
        embedding_raw.and_then(|raw| serde_json::from_str(&raw).ok());

    let expires_at: Option<i64> = row.get("expires_at")?;
    let consolidated_at: Option<i64> = row.get("consolidated_at")?;

    Ok(MemoryEntry {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_id: row.get("session_id")?,
        tier: MemoryTier::parse(&tier_raw).unwrap_or(MemoryTier::LongTerm),
        kind: MemoryKind::parse(&kind_raw),
        category: row.get("category")?,
        content: row.get("content")?,
        tags,
        importance: row.get("importance")?,
        confidence: row.get("confidence")?,
        created_at: millis_to_datetime(row.get("created_at")?),
        updated_at: millis_to_datetime(row.get("updated_at")?),
        last_accessed: millis_to_datetime(row.get("last_accessed")?),
        access_count: row.get::<_, i64>("access_count")? as u64,
        version: row.get::<_, i64>("version")? as u64,
        expires_at: expires_at.map(millis_to_datetime),
        extracted_from: row.get("extracted_from")?,
        consolidated: row.get::<_, i64>("consolidated")? != 0,
        consolidated_at: consolidated_at.map(millis_to_datetime),
        relationships,
        metadata,
        embedding,
    })
}

const SELECT_COLUMNS: &str = "id, user_id, session_id, tier, kind, category, content, tags, \
     importance, confidence, created_at, updated_at, last_accessed, access_count, version, \
     expires_at, extracted_from, consolidated, consolidated_at, relationships, metadata, embedding";

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn insert(&self, entry: MemoryEntry) -> MemoryResult<String> {
        let conn = self.conn.lock().await;
        let tags = serde_json::to_string(&entry.tags)?;
        let relationships = serde_json::to_string(&entry.relationships)?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        let embedding = entry
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO memories (
                id, user_id, session_id, tier, kind, category, content, tags,
                importance, confidence, created_at, updated_at, last_accessed,
                access_count, version, expires_at, extracted_from, consolidated,
                consolidated_at, relationships, metadata, embedding
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            rusqlite::params![
                entry.id,
                entry.user_id,
                entry.session_id,
                entry.tier.as_str(),
                entry.kind.as_str(),
                entry.category,
                entry.content,
                tags,
                entry.importance,
                entry.confidence,
                entry.created_at.timestamp_millis(),
                entry.updated_at.timestamp_millis(),
                entry.last_accessed.timestamp_millis(),
                entry.access_count as i64,
                entry.version as i64,
                entry.expires_at.map(|t| t.timestamp_millis()),
                entry.extracted_from,
                i64::from(entry.consolidated),
                entry.consolidated_at.map(|t| t.timestamp_millis()),
                relationships,
                metadata,
                embedding,
            ],
        )?;
        Ok(entry.id)
    }

    async fn query(&self, query: &MemoryQuery) -> MemoryResult<Vec<MemoryEntry>> {
        let (where_sql, params) = build_where(&query.predicates);
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM memories{where_sql}");

        let sql_pagination = query.relevance.is_none();
        if let Some((field, order)) = query.order_by {
            let dir = match order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            sql.push_str(&format!(" ORDER BY {} {}", column(field), dir));
        }
        if sql_pagination {
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {limit} OFFSET {}", query.offset));
            } else if query.offset > 0 {
                sql.push_str(&format!(" LIMIT -1 OFFSET {}", query.offset));
            }
        }

        let rows = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map(params_from_iter(params.iter()), row_to_entry)?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };

        let Some(relevance) = &query.relevance else {
            return Ok(rows);
        };

        // Relevance scoring and pagination happen here: the candidate set is
        // fetched by the SQL predicates, scored, filtered, ordered, paged.
        let mut scored: Vec<(f64, MemoryEntry)> = match relevance {
            Relevance::Semantic { text, .. } => rows
                .into_iter()
                .filter_map(|entry| {
                    let score = self.scorer.score(text, &entry.content);
                    (score > 0.0).then_some((score, entry))
                })
                .collect(),
            Relevance::Similar {
                embedding,
                threshold,
            } => rows
                .into_iter()
                .filter_map(|entry| {
                    let score = entry
                        .embedding
                        .as_ref()
                        .map(|e| cosine_similarity(embedding, e))
                        .unwrap_or(0.0);
                    (score >= *threshold).then_some((score, entry))
                })
                .collect(),
        };

        if query.order_by.is_none() {
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        }

        if let Relevance::Semantic { limit, .. } = relevance {
            scored.truncate(*limit);
        }

        let mut entries: Vec<MemoryEntry> = scored.into_iter().map(|(_, e)| e).collect();
        if query.offset > 0 {
            entries = entries.split_off(query.offset.min(entries.len()));
        }
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn update(&self, id: &str, fields: MemoryUpdate) -> MemoryResult<bool> {
        // An empty update still bumps version/updated_at; the contract is
        // uniform for every applied update.
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        use rusqlite::types::Value;

        if let Some(content) = fields.content {
            sets.push("content = ?".into());
            params.push(Value::Text(content));
        }
        if let Some(category) = fields.category {
            sets.push("category = ?".into());
            params.push(Value::Text(category));
        }
        if let Some(importance) = fields.importance {
            sets.push("importance = ?".into());
            params.push(Value::Real(importance));
        }
        if let Some(confidence) = fields.confidence {
            sets.push("confidence = ?".into());
            params.push(Value::Real(confidence));
        }
        if let Some(tags) = fields.tags {
            sets.push("tags = ?".into());
            params.push(Value::Text(serde_json::to_string(&tags)?));
        }
        if let Some(metadata) = fields.metadata {
            sets.push("metadata = ?".into());
            params.push(Value::Text(serde_json::to_string(&metadata)?));
        }
        if let Some(expires_at) = fields.expires_at {
            sets.push("expires_at = ?".into());
            params.push(match expires_at {
                Some(t) => Value::Integer(t.timestamp_millis()),
                None => Value::Null,
            });
        }
        if let Some(consolidated) = fields.consolidated {
            sets.push("consolidated = ?".into());
            params.push(Value::Integer(i64::from(consolidated)));
        }
        if let Some(consolidated_at) = fields.consolidated_at {
            sets.push("consolidated_at = ?".into());
            params.push(match consolidated_at {
                Some(t) => Value::Integer(t.timestamp_millis()),
                None => Value::Null,
            });
        }
        if let Some(relationships) = fields.relationships {
            sets.push("relationships = ?".into());
            params.push(Value::Text(serde_json::to_string(&relationships)?));
        }
        if let Some(embedding) = fields.embedding {
            sets.push("embedding = ?".into());
            params.push(match embedding {
                Some(e) => Value::Text(serde_json::to_string(&e)?),
                None => Value::Null,
            });
        }

        sets.push("updated_at = ?".into());
        params.push(Value::Integer(Utc::now().timestamp_millis()));
        sets.push("version = version + 1".into());

        let sql = format!("UPDATE memories SET {} WHERE id = ?", sets.join(", "));
        params.push(Value::Text(id.to_string()));

        let conn = self.conn.lock().await;
        let changed = conn.execute(&sql, params_from_iter(params.iter()))?;
        Ok(changed > 0)
    }

    async fn delete(&self, id: &str) -> MemoryResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM memories WHERE id = ?1", rusqlite::params![id])?;
        Ok(changed > 0)
    }

    async fn count(&self, predicates: &[Predicate]) -> MemoryResult<u64> {
        let (where_sql, params) = build_where(predicates);
        let sql = format!("SELECT COUNT(*) FROM memories{where_sql}");
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn find_by_id(&self, id: &str) -> MemoryResult<Option<MemoryEntry>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1");
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(rusqlite::params![id], row_to_entry)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn touch_accessed(&self, ids: &[String], at: DateTime<Utc>) -> MemoryResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let marks = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE memories
             SET last_accessed = ?, access_count = access_count + 1
             WHERE id IN ({marks})"
        );
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Integer(at.timestamp_millis())];
        params.extend(
            ids.iter()
                .map(|id| rusqlite::types::Value::Text(id.clone())),
        );
        let conn = self.conn.lock().await;
        conn.execute(&sql, params_from_iter(params.iter()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::MemoryKind;

    fn entry(user: &str, content: &str) -> MemoryEntry {
        MemoryEntry::new(user, MemoryTier::LongTerm, MemoryKind::Fact, content)
    }

    #[tokio::test]
    async fn insert_and_find_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut original = entry("u1", "the sky is blue");
        original.tags.insert("color".to_string());
        original
            .metadata
            .insert("source".to_string(), serde_json::json!("test"));
        original.embedding = Some(vec![0.5, 0.5]);
        let id = store.insert(original.clone()).await.unwrap();

        let found = store.find_by_id(&id).await.unwrap().expect("entry");
        assert_eq!(found.content, original.content);
        assert_eq!(found.tags, original.tags);
        assert_eq!(found.metadata, original.metadata);
        assert_eq!(found.embedding, original.embedding);
        assert_eq!(found.version, 1);
        assert_eq!(
            found.created_at.timestamp_millis(),
            original.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn update_bumps_version_by_one() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(entry("u1", "before")).await.unwrap();

        let changed = store
            .update(
                &id,
                MemoryUpdate {
                    content: Some("after".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(changed);

        let found = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(found.content, "after");
        assert_eq!(found.version, 2);
    }

    #[tokio::test]
    async fn delete_is_idempotent_in_effect() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(entry("u1", "ephemeral")).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.find_by_id(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn predicates_compose_as_conjunction() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(entry("u1", "alpha")).await.unwrap();
        store.insert(entry("u2", "beta")).await.unwrap();
        let mut third = entry("u1", "gamma");
        third.importance = 0.9;
        store.insert(third).await.unwrap();

        let query = MemoryQuery::new()
            .filter(Predicate::Equals(Field::UserId, "u1".into()))
            .filter(Predicate::AtLeast(Field::Importance, 0.8.into()));
        let rows = store.query(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "gamma");
    }

    #[tokio::test]
    async fn semantic_relevance_filters_and_orders() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(entry("u1", "rust borrow checker rules"))
            .await
            .unwrap();
        store
            .insert(entry("u1", "the rust borrow checker"))
            .await
            .unwrap();
        store.insert(entry("u1", "gardening tips")).await.unwrap();

        let query = MemoryQuery::new()
            .filter(Predicate::Equals(Field::UserId, "u1".into()))
            .semantic("the rust borrow checker", 10);
        let rows = store.query(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "the rust borrow checker");
    }

    #[tokio::test]
    async fn similar_relevance_uses_cosine_threshold() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut close = entry("u1", "close");
        close.embedding = Some(vec![1.0, 0.05]);
        let mut far = entry("u1", "far");
        far.embedding = Some(vec![0.0, 1.0]);
        let mut missing = entry("u1", "missing");
        missing.embedding = None;
        for e in [close, far, missing] {
            store.insert(e).await.unwrap();
        }

        let query = MemoryQuery::new().similar(vec![1.0, 0.0], 0.9);
        let rows = store.query(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "close");
    }

    #[tokio::test]
    async fn order_by_and_pagination() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, content) in ["one", "two", "three"].iter().enumerate() {
            let mut e = entry("u1", content);
            e.importance = 0.1 * (i as f64 + 1.0);
            store.insert(e).await.unwrap();
        }

        let query = MemoryQuery::new()
            .order_by(Field::Importance, SortOrder::Desc)
            .limit(2)
            .offset(1);
        let rows = store.query(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "two");
        assert_eq!(rows[1].content, "one");
    }

    #[tokio::test]
    async fn touch_accessed_increments_counts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(entry("u1", "counted")).await.unwrap();
        let at = Utc::now();
        store.touch_accessed(&[id.clone()], at).await.unwrap();
        store.touch_accessed(&[id.clone()], at).await.unwrap();

        let found = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(found.access_count, 2);
        assert_eq!(found.last_accessed.timestamp_millis(), at.timestamp_millis());
        // Accounting is not a content update.
        assert_eq!(found.version, 1);
    }

    #[tokio::test]
    async fn in_and_between_predicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (user, importance) in [("a", 0.2), ("b", 0.5), ("c", 0.8)] {
            let mut e = entry(user, "x");
            e.importance = importance;
            store.insert(e).await.unwrap();
        }

        let rows = store
            .query(&MemoryQuery::new().filter(Predicate::In(
                Field::UserId,
                vec!["a".into(), "c".into()],
            )))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = store
            .query(&MemoryQuery::new().filter(Predicate::Between(
                Field::Importance,
                0.4.into(),
                0.6.into(),
            )))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "b");
    }
}
