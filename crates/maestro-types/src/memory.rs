// Memory Data Model
// Tiered memory entries shared by the storage layer, the manager, and the agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Memory tier - determines retention and eviction behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Session-scoped memory with a TTL; evicted on expiry or per-session cap
    ShortTerm,
    /// Persistent memory; evicted only by the per-user importance cap
    LongTerm,
    /// Upsert-by-key user preference
    UserPreference,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::LongTerm => "long_term",
            MemoryTier::UserPreference => "user_preference",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "short_term" => Some(MemoryTier::ShortTerm),
            "long_term" => Some(MemoryTier::LongTerm),
            "user_preference" => Some(MemoryTier::UserPreference),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a memory records. The set is open-ended: the LLM extractor is free to
/// emit kinds we do not enumerate, which round-trip as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Conversation,
    Preference,
    Fact,
    Interest,
    TaskResult,
    PlanningResult,
    ExtractedFact,
    Other(String),
}

impl MemoryKind {
    pub fn as_str(&self) -> &str {
        match self {
            MemoryKind::Conversation => "conversation",
            MemoryKind::Preference => "preference",
            MemoryKind::Fact => "fact",
            MemoryKind::Interest => "interest",
            MemoryKind::TaskResult => "task_result",
            MemoryKind::PlanningResult => "planning_result",
            MemoryKind::ExtractedFact => "extracted_fact",
            MemoryKind::Other(value) => value.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "conversation" => MemoryKind::Conversation,
            "preference" => MemoryKind::Preference,
            "fact" => MemoryKind::Fact,
            "interest" => MemoryKind::Interest,
            "task_result" => MemoryKind::TaskResult,
            "planning_result" => MemoryKind::PlanningResult,
            "extracted_fact" => MemoryKind::ExtractedFact,
            other => MemoryKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MemoryKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MemoryKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MemoryKind::parse(&raw))
    }
}

/// How one memory relates to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Related,
    Contradicts,
    Supports,
    Follows,
}

/// Edge in the memory relationship graph. Targets are ids only; the full
/// entry is resolved lazily through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRelationship {
    pub target_id: String,
    pub kind: RelationKind,
    /// Strength of the association, in [0, 1]
    pub strength: f64,
}

/// A single memory record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub tier: MemoryTier,
    pub kind: MemoryKind,
    pub category: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Subjective importance, in [0, 1]
    pub importance: f64,
    /// Confidence in the content, in [0, 1]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    /// Monotonic; strictly increases on every update
    pub version: u64,
    /// Set if and only if `tier == ShortTerm`
    pub expires_at: Option<DateTime<Utc>>,
    /// Id of the short-term source this entry was consolidated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_from: Option<String>,
    /// Whether this short-term entry has already been consolidated
    #[serde(default)]
    pub consolidated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub relationships: Vec<MemoryRelationship>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    /// Create a fresh entry with generated id and current timestamps.
    /// `expires_at` is left unset; the manager fills it for short-term inserts.
    pub fn new(
        user_id: impl Into<String>,
        tier: MemoryTier,
        kind: MemoryKind,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            session_id: None,
            tier,
            kind,
            category: String::new(),
            content: content.into(),
            tags: BTreeSet::new(),
            importance: 0.5,
            confidence: 0.5,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            access_count: 0,
            version: 1,
            expires_at: None,
            extracted_from: None,
            consolidated: false,
            consolidated_at: None,
            relationships: Vec::new(),
            metadata: serde_json::Map::new(),
            embedding: None,
        }
    }
}

/// Per-tier counts for one user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub short_term: u64,
    pub long_term: u64,
    pub preferences: u64,
}

impl MemoryStats {
    pub fn total(&self) -> u64 {
        self.short_term + self.long_term + self.preferences
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_kind_round_trips_unknown_values() {
        let kind = MemoryKind::parse("observation");
        assert_eq!(kind, MemoryKind::Other("observation".to_string()));
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"observation\"");
        let back: MemoryKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn tier_parse_matches_as_str() {
        for tier in [
            MemoryTier::ShortTerm,
            MemoryTier::LongTerm,
            MemoryTier::UserPreference,
        ] {
            assert_eq!(MemoryTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(MemoryTier::parse("episodic"), None);
    }

    #[test]
    fn new_entry_starts_at_version_one() {
        let entry = MemoryEntry::new("u1", MemoryTier::LongTerm, MemoryKind::Fact, "x");
        assert_eq!(entry.version, 1);
        assert_eq!(entry.access_count, 0);
        assert!(entry.expires_at.is_none());
    }
}
