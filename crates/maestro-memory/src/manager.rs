// Memory Manager
// Tier semantics over the storage contract: retention and caps, conflict
// merge, preference upsert, consolidation, cleanup, contextual search, and
// background maintenance. The manager owns all memory mutation; callers
// never touch the store directly.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use maestro_observability::EventBus;
use maestro_types::{MemoryEntry, MemoryKind, MemoryStats, MemoryTier, RuntimeEvent, SessionMemories};

use crate::store::{
    Field, MemoryQuery, MemoryStore, MemoryUpdate, Predicate, SortOrder,
};
use crate::types::{MemoryConfig, MemoryResult, SearchContextOptions};
use crate::similarity::jaccard_similarity;

/// Input for a new memory, before the manager assigns tier mechanics.
#[derive(Debug, Clone)]
pub struct StoreMemoryRequest {
    pub user_id: String,
    pub session_id: Option<String>,
    pub kind: MemoryKind,
    pub category: String,
    pub content: String,
    pub importance: f64,
    pub confidence: f64,
    pub tags: BTreeSet<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
}

impl StoreMemoryRequest {
    pub fn new(
        user_id: impl Into<String>,
        kind: MemoryKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: None,
            kind,
            category: String::new(),
            content: content.into(),
            importance: 0.5,
            confidence: 0.5,
            tags: BTreeSet::new(),
            metadata: serde_json::Map::new(),
            embedding: None,
        }
    }

    fn into_entry(self, tier: MemoryTier) -> MemoryEntry {
        let mut entry = MemoryEntry::new(self.user_id, tier, self.kind, self.content);
        entry.session_id = self.session_id;
        entry.category = self.category;
        entry.importance = self.importance;
        entry.confidence = self.confidence;
        entry.tags = self.tags;
        entry.metadata = self.metadata;
        entry.embedding = self.embedding;
        entry
    }
}

/// What an insert-like operation actually did
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    Inserted(MemoryEntry),
    /// The content was folded into an existing entry; no new row exists
    Merged(MemoryEntry),
}

impl StoreOutcome {
    pub fn entry(&self) -> &MemoryEntry {
        match self {
            StoreOutcome::Inserted(e) | StoreOutcome::Merged(e) => e,
        }
    }

    pub fn into_entry(self) -> MemoryEntry {
        match self {
            StoreOutcome::Inserted(e) | StoreOutcome::Merged(e) => e,
        }
    }

    pub fn was_merged(&self) -> bool {
        matches!(self, StoreOutcome::Merged(_))
    }
}

struct MaintenanceHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    config: MemoryConfig,
    events: EventBus,
    /// Users with a maintenance job currently running
    in_flight: Arc<StdMutex<HashSet<String>>>,
    maintenance: StdMutex<Option<MaintenanceHandle>>,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, config: MemoryConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            maintenance: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    /// Store a short-term memory: TTL applied, then the per-(user, session)
    /// cap enforced LRU-by-creation.
    pub async fn add_short_term_memory(
        &self,
        request: StoreMemoryRequest,
    ) -> MemoryResult<MemoryEntry> {
        let mut entry = request.into_entry(MemoryTier::ShortTerm);
        entry.expires_at =
            Some(entry.created_at + ChronoDuration::milliseconds(self.config.short_term_retention_ms as i64));

        let user_id = entry.user_id.clone();
        let session_id = entry.session_id.clone();
        self.store.insert(entry.clone()).await?;
        self.emit_inserted(&entry);

        self.enforce_short_term_cap(&user_id, session_id.as_deref())
            .await?;
        Ok(entry)
    }

    /// Store a long-term memory with conflict resolution: a candidate with
    /// the same (user, kind, category), a shared 50-char content prefix and
    /// near-identical wording is updated in place instead of duplicated.
    pub async fn add_long_term_memory(
        &self,
        request: StoreMemoryRequest,
    ) -> MemoryResult<StoreOutcome> {
        let candidates = self
            .store
            .query(
                &MemoryQuery::new()
                    .filter(Predicate::Equals(Field::UserId, request.user_id.as_str().into()))
                    .filter(Predicate::Equals(Field::Tier, MemoryTier::LongTerm.into()))
                    .filter(Predicate::Equals(Field::Kind, request.kind.as_str().into()))
                    .filter(Predicate::Equals(
                        Field::Category,
                        request.category.as_str().into(),
                    )),
            )
            .await?;

        for candidate in candidates {
            if !shares_prefix(&candidate.content, &request.content, 50) {
                continue;
            }
            let similarity = jaccard_similarity(&candidate.content, &request.content);
            if similarity < self.config.merge_similarity_threshold {
                continue;
            }

            let merged_content = merge_contents(&candidate.content, &request.content);
            let update = MemoryUpdate {
                content: Some(merged_content),
                importance: Some(candidate.importance.max(request.importance)),
                confidence: Some(candidate.confidence.max(request.confidence)),
                ..Default::default()
            };
            self.store.update(&candidate.id, update).await?;
            let refreshed = self
                .store
                .find_by_id(&candidate.id)
                .await?
                .ok_or_else(|| crate::types::MemoryError::NotFound(candidate.id.clone()))?;
            tracing::debug!(
                id = %refreshed.id,
                similarity,
                "long-term insert merged into existing memory"
            );
            self.emit_updated(&refreshed);
            return Ok(StoreOutcome::Merged(refreshed));
        }

        let entry = request.into_entry(MemoryTier::LongTerm);
        self.store.insert(entry.clone()).await?;
        self.emit_inserted(&entry);
        self.enforce_long_term_cap(&entry.user_id).await?;
        Ok(StoreOutcome::Inserted(entry))
    }

    /// Upsert a preference keyed by (user, category, preference key). The
    /// explicit key wins; without one, matching falls back to the content
    /// itself. Re-applying an already-recorded preference leaves the content
    /// unchanged.
    pub async fn add_user_preference(
        &self,
        user_id: &str,
        category: &str,
        content: &str,
        preference_key: Option<&str>,
        importance: f64,
        confidence: f64,
    ) -> MemoryResult<StoreOutcome> {
        let match_key = preference_key.unwrap_or(content);
        let existing = self
            .store
            .query(
                &MemoryQuery::new()
                    .filter(Predicate::Equals(Field::UserId, user_id.into()))
                    .filter(Predicate::Equals(Field::Tier, MemoryTier::UserPreference.into()))
                    .filter(Predicate::Equals(Field::Category, category.into()))
                    .filter(Predicate::Contains(Field::Content, match_key.to_string()))
                    .limit(1),
            )
            .await?
            .into_iter()
            .next();

        if let Some(current) = existing {
            if confidence < self.config.preference_update_threshold {
                tracing::debug!(
                    user_id,
                    category,
                    "preference update below confidence threshold, keeping existing"
                );
                return Ok(StoreOutcome::Merged(current));
            }
            let content_known = current.content.contains(content);
            let update = MemoryUpdate {
                content: if content_known {
                    None
                } else {
                    Some(format!("{}\n{}", current.content, content))
                },
                importance: Some(current.importance.max(importance)),
                confidence: Some(current.confidence.max(confidence)),
                ..Default::default()
            };
            self.store.update(&current.id, update).await?;
            let refreshed = self
                .store
                .find_by_id(&current.id)
                .await?
                .ok_or_else(|| crate::types::MemoryError::NotFound(current.id.clone()))?;
            self.emit_updated(&refreshed);
            return Ok(StoreOutcome::Merged(refreshed));
        }

        let mut request = StoreMemoryRequest::new(user_id, MemoryKind::Preference, content);
        request.category = category.to_string();
        request.importance = importance;
        request.confidence = confidence;
        let entry = request.into_entry(MemoryTier::UserPreference);
        self.store.insert(entry.clone()).await?;
        self.emit_inserted(&entry);
        Ok(StoreOutcome::Inserted(entry))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Unexpired short-term memories, newest first.
    pub async fn get_short_term_memories(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let mut query = MemoryQuery::new()
            .filter(Predicate::Equals(Field::UserId, user_id.into()))
            .filter(Predicate::Equals(Field::Tier, MemoryTier::ShortTerm.into()))
            .filter(Predicate::GreaterThan(Field::ExpiresAt, Utc::now().into()))
            .order_by(Field::CreatedAt, SortOrder::Desc)
            .limit(limit);
        if let Some(session_id) = session_id {
            query = query.filter(Predicate::Equals(Field::SessionId, session_id.into()));
        }
        let mut entries = self.store.query(&query).await?;
        self.mark_accessed(&mut entries).await?;
        Ok(entries)
    }

    /// Relevance-ranked long-term memories.
    pub async fn search_long_term_memories(
        &self,
        user_id: &str,
        text: &str,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let query = MemoryQuery::new()
            .filter(Predicate::Equals(Field::UserId, user_id.into()))
            .filter(Predicate::Equals(Field::Tier, MemoryTier::LongTerm.into()))
            .semantic(text, limit);
        let mut entries = self.store.query(&query).await?;
        self.mark_accessed(&mut entries).await?;
        Ok(entries)
    }

    pub async fn get_user_preferences(
        &self,
        user_id: &str,
        category: Option<&str>,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let mut query = MemoryQuery::new()
            .filter(Predicate::Equals(Field::UserId, user_id.into()))
            .filter(Predicate::Equals(Field::Tier, MemoryTier::UserPreference.into()))
            .order_by(Field::UpdatedAt, SortOrder::Desc)
            .limit(limit);
        if let Some(category) = category {
            query = query.filter(Predicate::Equals(Field::Category, category.into()));
        }
        let mut entries = self.store.query(&query).await?;
        self.mark_accessed(&mut entries).await?;
        Ok(entries)
    }

    pub async fn find_by_id(&self, id: &str) -> MemoryResult<Option<MemoryEntry>> {
        self.store.find_by_id(id).await
    }

    pub async fn update_memory(&self, id: &str, fields: MemoryUpdate) -> MemoryResult<bool> {
        let updated = self.store.update(id, fields).await?;
        if updated {
            if let Some(entry) = self.store.find_by_id(id).await? {
                self.emit_updated(&entry);
            }
        }
        Ok(updated)
    }

    pub async fn delete_memory(&self, id: &str) -> MemoryResult<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            self.events.publish(RuntimeEvent::MemoryDeleted {
                id: id.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(deleted)
    }

    pub async fn get_stats(&self, user_id: &str) -> MemoryResult<MemoryStats> {
        let count_tier = |tier: MemoryTier| {
            vec![
                Predicate::Equals(Field::UserId, user_id.into()),
                Predicate::Equals(Field::Tier, tier.into()),
            ]
        };
        Ok(MemoryStats {
            short_term: self.store.count(&count_tier(MemoryTier::ShortTerm)).await?,
            long_term: self.store.count(&count_tier(MemoryTier::LongTerm)).await?,
            preferences: self
                .store
                .count(&count_tier(MemoryTier::UserPreference))
                .await?,
        })
    }

    /// Bundle of recent, relevant and preference context for one query, each
    /// bucket independently bounded, plus the entries referenced by the
    /// union's relationship edges.
    pub async fn search_with_context(
        &self,
        text: &str,
        user_id: &str,
        opts: &SearchContextOptions,
    ) -> MemoryResult<SessionMemories> {
        let short_term = self
            .get_short_term_memories(user_id, None, opts.short_term_limit)
            .await?;
        let long_term = self
            .search_long_term_memories(user_id, text, opts.long_term_limit)
            .await?;
        let preferences = self
            .get_user_preferences(user_id, None, opts.preference_limit)
            .await?;

        let mut seen: HashSet<String> = short_term
            .iter()
            .chain(long_term.iter())
            .chain(preferences.iter())
            .map(|e| e.id.clone())
            .collect();

        let mut related = Vec::new();
        'outer: for entry in short_term.iter().chain(long_term.iter()).chain(preferences.iter()) {
            for relationship in &entry.relationships {
                if related.len() >= opts.related_limit {
                    break 'outer;
                }
                if !seen.insert(relationship.target_id.clone()) {
                    continue;
                }
                if let Some(target) = self.store.find_by_id(&relationship.target_id).await? {
                    related.push(target);
                }
            }
        }
        if !related.is_empty() {
            self.mark_accessed(&mut related).await?;
        }

        Ok(SessionMemories {
            short_term,
            long_term,
            preferences,
            related,
        })
    }

    // ------------------------------------------------------------------
    // Consolidation and cleanup
    // ------------------------------------------------------------------

    /// Promote important unconsolidated short-term memories to long-term.
    /// Sources are marked consolidated and retained until expiry, which also
    /// makes the operation idempotent.
    pub async fn consolidate_memories(&self, user_id: &str) -> MemoryResult<usize> {
        let sources = self
            .store
            .query(
                &MemoryQuery::new()
                    .filter(Predicate::Equals(Field::UserId, user_id.into()))
                    .filter(Predicate::Equals(Field::Tier, MemoryTier::ShortTerm.into()))
                    .filter(Predicate::AtLeast(
                        Field::Importance,
                        self.config.consolidation_threshold.into(),
                    ))
                    .filter(Predicate::Equals(Field::Consolidated, false.into()))
                    .filter(Predicate::GreaterThan(Field::ExpiresAt, Utc::now().into())),
            )
            .await?;

        let mut promoted = 0usize;
        for source in &sources {
            let mut entry = MemoryEntry::new(
                source.user_id.clone(),
                MemoryTier::LongTerm,
                source.kind.clone(),
                source.content.clone(),
            );
            entry.category = source.category.clone();
            entry.importance = source.importance;
            entry.confidence = source.confidence;
            entry.tags = source.tags.clone();
            entry.extracted_from = Some(source.id.clone());
            entry.embedding = source.embedding.clone();
            self.store.insert(entry.clone()).await?;
            self.emit_inserted(&entry);

            self.store
                .update(
                    &source.id,
                    MemoryUpdate {
                        consolidated: Some(true),
                        consolidated_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
            promoted += 1;
        }

        if promoted > 0 {
            self.enforce_long_term_cap(user_id).await?;
            self.events.publish(RuntimeEvent::MemoriesConsolidated {
                user_id: user_id.to_string(),
                count: promoted,
                timestamp: Utc::now(),
            });
        }
        Ok(promoted)
    }

    /// Delete expired short-term rows; with a user given, also enforce that
    /// user's long-term cap.
    pub async fn cleanup_memories(&self, user_id: Option<&str>) -> MemoryResult<usize> {
        let mut query = MemoryQuery::new()
            .filter(Predicate::Equals(Field::Tier, MemoryTier::ShortTerm.into()))
            .filter(Predicate::LessThan(Field::ExpiresAt, Utc::now().into()));
        if let Some(user_id) = user_id {
            query = query.filter(Predicate::Equals(Field::UserId, user_id.into()));
        }
        let expired = self.store.query(&query).await?;

        let mut removed = 0usize;
        for entry in expired {
            if self.store.delete(&entry.id).await? {
                removed += 1;
            }
        }

        if let Some(user_id) = user_id {
            removed += self.enforce_long_term_cap(user_id).await?;
        }

        if removed > 0 {
            self.events.publish(RuntimeEvent::MemoriesCleaned {
                count: removed,
                timestamp: Utc::now(),
            });
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Background maintenance
    // ------------------------------------------------------------------

    /// Start the periodic cleanup and consolidation loops. Idempotent.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut guard = self.maintenance.lock().expect("maintenance lock");
        if guard.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let cleanup_mgr = Arc::clone(self);
        let cleanup_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let period = std::time::Duration::from_millis(cleanup_mgr.config.cleanup_interval_ms);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cleanup_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cleanup_mgr
                            .run_maintenance_round(MaintenanceKind::Cleanup)
                            .await;
                    }
                }
            }
        }));

        let consolidate_mgr = Arc::clone(self);
        let consolidate_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let period =
                std::time::Duration::from_millis(consolidate_mgr.config.consolidation_interval_ms);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = consolidate_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        consolidate_mgr
                            .run_maintenance_round(MaintenanceKind::Consolidation)
                            .await;
                    }
                }
            }
        }));

        *guard = Some(MaintenanceHandle { cancel, tasks });
    }

    /// Stop the background loops. Safe to call repeatedly.
    pub fn close(&self) {
        let mut guard = self.maintenance.lock().expect("maintenance lock");
        if let Some(handle) = guard.take() {
            handle.cancel.cancel();
            for task in handle.tasks {
                task.abort();
            }
        }
    }

    /// One maintenance pass over every active user. Failures are logged and
    /// swallowed; maintenance never propagates errors.
    pub async fn run_maintenance_round(&self, kind: MaintenanceKind) {
        let window_ms = match kind {
            MaintenanceKind::Cleanup => self.config.cleanup_interval_ms,
            MaintenanceKind::Consolidation => self.config.consolidation_interval_ms,
        };
        let users = match self.active_users(window_ms).await {
            Ok(users) => users,
            Err(err) => {
                tracing::warn!(error = %err, "maintenance could not list active users");
                return;
            }
        };

        for user_id in users {
            if !self.try_begin_user_job(&user_id) {
                tracing::debug!(user_id, "maintenance already running for user, skipping");
                continue;
            }
            let result = match kind {
                MaintenanceKind::Cleanup => self.cleanup_memories(Some(&user_id)).await,
                MaintenanceKind::Consolidation => self.consolidate_memories(&user_id).await,
            };
            self.end_user_job(&user_id);
            if let Err(err) = result {
                tracing::warn!(user_id, error = %err, "maintenance pass failed");
            }
        }
    }

    /// Users with any short-term activity inside the window.
    async fn active_users(&self, window_ms: u64) -> MemoryResult<Vec<String>> {
        let since = Utc::now() - ChronoDuration::milliseconds(window_ms as i64);
        let entries = self
            .store
            .query(
                &MemoryQuery::new()
                    .filter(Predicate::Equals(Field::Tier, MemoryTier::ShortTerm.into()))
                    .filter(Predicate::AtLeast(Field::CreatedAt, since.into())),
            )
            .await?;
        let mut users: Vec<String> = entries.into_iter().map(|e| e.user_id).collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    fn try_begin_user_job(&self, user_id: &str) -> bool {
        self.in_flight
            .lock()
            .expect("single-flight lock")
            .insert(user_id.to_string())
    }

    fn end_user_job(&self, user_id: &str) {
        self.in_flight
            .lock()
            .expect("single-flight lock")
            .remove(user_id);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn mark_accessed(&self, entries: &mut [MemoryEntry]) -> MemoryResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        self.store.touch_accessed(&ids, now).await?;
        for entry in entries.iter_mut() {
            entry.access_count += 1;
            entry.last_accessed = now;
        }
        Ok(())
    }

    async fn enforce_short_term_cap(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> MemoryResult<()> {
        let mut predicates = vec![
            Predicate::Equals(Field::UserId, user_id.into()),
            Predicate::Equals(Field::Tier, MemoryTier::ShortTerm.into()),
        ];
        if let Some(session_id) = session_id {
            predicates.push(Predicate::Equals(Field::SessionId, session_id.into()));
        }
        let count = self.store.count(&predicates).await? as usize;
        if count <= self.config.max_short_term_memories {
            return Ok(());
        }

        let excess = count - self.config.max_short_term_memories;
        let mut query = MemoryQuery::new()
            .order_by(Field::CreatedAt, SortOrder::Asc)
            .limit(excess);
        query.predicates = predicates;
        let oldest = self.store.query(&query).await?;
        for entry in oldest {
            self.delete_memory(&entry.id).await?;
        }
        Ok(())
    }

    /// Evict lowest-importance long-term entries until the user is within cap.
    /// Returns the number of evictions.
    async fn enforce_long_term_cap(&self, user_id: &str) -> MemoryResult<usize> {
        let predicates = vec![
            Predicate::Equals(Field::UserId, user_id.into()),
            Predicate::Equals(Field::Tier, MemoryTier::LongTerm.into()),
        ];
        let count = self.store.count(&predicates).await? as usize;
        if count <= self.config.max_long_term_memories {
            return Ok(0);
        }

        let excess = count - self.config.max_long_term_memories;
        let mut query = MemoryQuery::new()
            .order_by(Field::Importance, SortOrder::Asc)
            .limit(excess);
        query.predicates = predicates;
        let victims = self.store.query(&query).await?;
        let mut evicted = 0usize;
        for entry in victims {
            if self.delete_memory(&entry.id).await? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    fn emit_inserted(&self, entry: &MemoryEntry) {
        self.events.publish(RuntimeEvent::MemoryInserted {
            id: entry.id.clone(),
            user_id: entry.user_id.clone(),
            tier: entry.tier,
            timestamp: Utc::now(),
        });
    }

    fn emit_updated(&self, entry: &MemoryEntry) {
        self.events.publish(RuntimeEvent::MemoryUpdated {
            id: entry.id.clone(),
            version: entry.version,
            timestamp: Utc::now(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    Cleanup,
    Consolidation,
}

fn shares_prefix(a: &str, b: &str, chars: usize) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.chars().take(chars).eq(b.chars().take(chars))
}

/// Deliberately non-lossy: the previous wording stays visible.
fn merge_contents(existing: &str, incoming: &str) -> String {
    format!("{existing} (Updated: {incoming})")
}
