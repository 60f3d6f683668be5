// Storage Contract
// Closed predicate/field enums over a uniform insert/query/update/delete
// surface. Backends match on the enums; nothing reflects over struct fields.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use maestro_types::{MemoryEntry, MemoryRelationship, MemoryTier};

use crate::types::MemoryResult;

/// Queryable fields of a memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Id,
    UserId,
    SessionId,
    Tier,
    Kind,
    Category,
    Content,
    Importance,
    Confidence,
    CreatedAt,
    UpdatedAt,
    LastAccessed,
    AccessCount,
    Version,
    ExpiresAt,
    ExtractedFrom,
    Consolidated,
}

/// Typed comparison operand
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Num(f64),
    Int(i64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Num(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Time(value)
    }
}

impl From<MemoryTier> for FieldValue {
    fn from(value: MemoryTier) -> Self {
        FieldValue::Str(value.as_str().to_string())
    }
}

/// Conjunction member of a query
#[derive(Debug, Clone)]
pub enum Predicate {
    Equals(Field, FieldValue),
    NotEquals(Field, FieldValue),
    LessThan(Field, FieldValue),
    AtMost(Field, FieldValue),
    GreaterThan(Field, FieldValue),
    AtLeast(Field, FieldValue),
    Contains(Field, String),
    In(Field, Vec<FieldValue>),
    Between(Field, FieldValue, FieldValue),
    IsNull(Field),
    NotNull(Field),
}

/// At most one relevance clause per query
#[derive(Debug, Clone)]
pub enum Relevance {
    /// Lexical relevance; items scoring 0 are excluded
    Semantic { text: String, limit: usize },
    /// Cosine similarity on stored embeddings; items below threshold excluded
    Similar { embedding: Vec<f32>, threshold: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A complete query: conjunctive predicates, optional relevance, optional
/// explicit ordering, then pagination. Without `order_by`, relevance score
/// (when present) orders descending; otherwise insertion order applies.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub predicates: Vec<Predicate>,
    pub relevance: Option<Relevance>,
    pub order_by: Option<(Field, SortOrder)>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn semantic(mut self, text: impl Into<String>, limit: usize) -> Self {
        self.relevance = Some(Relevance::Semantic {
            text: text.into(),
            limit,
        });
        self
    }

    pub fn similar(mut self, embedding: Vec<f32>, threshold: f64) -> Self {
        self.relevance = Some(Relevance::Similar {
            embedding,
            threshold,
        });
        self
    }

    pub fn order_by(mut self, field: Field, order: SortOrder) -> Self {
        self.order_by = Some((field, order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Partial update. `None` leaves a field untouched; double-Option fields can
/// clear a nullable column. Every applied update bumps `updated_at` and
/// increments `version` by exactly one.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    pub category: Option<String>,
    pub importance: Option<f64>,
    pub confidence: Option<f64>,
    pub tags: Option<BTreeSet<String>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub consolidated: Option<bool>,
    pub consolidated_at: Option<Option<DateTime<Utc>>>,
    pub relationships: Option<Vec<MemoryRelationship>>,
    pub embedding: Option<Option<Vec<f32>>>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.category.is_none()
            && self.importance.is_none()
            && self.confidence.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
            && self.expires_at.is_none()
            && self.consolidated.is_none()
            && self.consolidated_at.is_none()
            && self.relationships.is_none()
            && self.embedding.is_none()
    }
}

/// The consumed storage contract. Implementations must provide per-id atomic
/// updates; the manager owns all higher-level semantics.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn insert(&self, entry: MemoryEntry) -> MemoryResult<String>;

    async fn query(&self, query: &MemoryQuery) -> MemoryResult<Vec<MemoryEntry>>;

    /// Returns false when the id does not exist.
    async fn update(&self, id: &str, fields: MemoryUpdate) -> MemoryResult<bool>;

    /// Idempotent in effect: deleting a missing id returns false.
    async fn delete(&self, id: &str) -> MemoryResult<bool>;

    async fn count(&self, predicates: &[Predicate]) -> MemoryResult<u64>;

    async fn find_by_id(&self, id: &str) -> MemoryResult<Option<MemoryEntry>>;

    /// Access accounting: set `last_accessed` and increment `access_count`
    /// for each id, atomically per id.
    async fn touch_accessed(&self, ids: &[String], at: DateTime<Utc>) -> MemoryResult<()>;
}
