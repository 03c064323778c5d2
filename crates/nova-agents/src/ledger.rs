//! Shared bookkeeping for turn deduplication and side-effect idempotency.
//!
//! These are the only pieces of mutable state shared between concurrently
//! running turns. Every decision is a single conditional insert on a
//! `DashMap` entry, so two racing callers can never both "win".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nova_common::{clean_text, stable_digest};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Prune dedupe signatures once the map grows past this many entries.
const DEDUPE_PRUNE_THRESHOLD: usize = 1024;
/// Drop idle scope locks once the map grows past this many entries.
const SCOPE_LOCK_PRUNE_THRESHOLD: usize = 256;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Inbound dedupe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupeDecision {
    Fresh { signature: String },
    Duplicate { signature: String, first_seen_ms: i64 },
}

impl DedupeDecision {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Rejects an identical `(session, text)` submission seen within the debounce window.
pub struct TurnDedupe {
    window_ms: i64,
    seen: DashMap<String, i64>,
}

impl TurnDedupe {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms: window_ms.max(0),
            seen: DashMap::new(),
        }
    }

    /// Case and whitespace insensitive signature of a submission.
    pub fn signature(session_key: &str, text: &str) -> String {
        stable_digest(&[session_key, &clean_text(text).to_lowercase()])
    }

    pub fn check(&self, session_key: &str, text: &str) -> DedupeDecision {
        self.check_at(session_key, text, now_ms())
    }

    pub fn check_at(&self, session_key: &str, text: &str, now_ms: i64) -> DedupeDecision {
        if self.seen.len() > DEDUPE_PRUNE_THRESHOLD {
            self.prune_at(now_ms);
        }

        let signature = Self::signature(session_key, text);
        match self.seen.entry(signature.clone()) {
            Entry::Occupied(mut entry) => {
                let first_seen_ms = *entry.get();
                if now_ms - first_seen_ms < self.window_ms {
                    DedupeDecision::Duplicate {
                        signature,
                        first_seen_ms,
                    }
                } else {
                    entry.insert(now_ms);
                    DedupeDecision::Fresh { signature }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now_ms);
                DedupeDecision::Fresh { signature }
            }
        }
    }

    pub fn prune_at(&self, now_ms: i64) {
        let window = self.window_ms;
        self.seen.retain(|_, seen_at| now_ms - *seen_at < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Idempotency claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub user_context_id: String,
    pub scope: String,
    pub status: ClaimStatus,
    pub result_ref: Option<String>,
    pub first_seen_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    /// `true` only for the caller that should perform the action.
    pub accepted: bool,
    pub status: ClaimStatus,
    pub result_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    user_context_id: String,
    scope: String,
    key: String,
}

impl LedgerKey {
    fn new(key: &str, user_context_id: &str, scope: &str) -> Self {
        Self {
            user_context_id: user_context_id.to_string(),
            scope: scope.to_string(),
            key: key.to_string(),
        }
    }
}

/// TTL-leased claims on side-effecting actions.
///
/// A crashed claimant never unlocks explicitly; its lease simply expires.
pub struct IdempotencyLedger {
    records: DashMap<LedgerKey, IdempotencyRecord>,
    default_ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn claim(
        &self,
        key: &str,
        user_context_id: &str,
        scope: &str,
        ttl: Option<Duration>,
    ) -> ClaimOutcome {
        self.claim_at(key, user_context_id, scope, ttl, now_ms())
    }

    pub fn claim_at(
        &self,
        key: &str,
        user_context_id: &str,
        scope: &str,
        ttl: Option<Duration>,
        now_ms: i64,
    ) -> ClaimOutcome {
        self.prune_at(now_ms);

        let ttl_ms = ttl.unwrap_or(self.default_ttl).as_millis() as i64;
        let fresh = || IdempotencyRecord {
            key: key.to_string(),
            user_context_id: user_context_id.to_string(),
            scope: scope.to_string(),
            status: ClaimStatus::Pending,
            result_ref: None,
            first_seen_at_ms: now_ms,
            expires_at_ms: now_ms + ttl_ms,
        };
        let accepted = ClaimOutcome {
            accepted: true,
            status: ClaimStatus::Pending,
            result_ref: None,
        };

        match self.records.entry(LedgerKey::new(key, user_context_id, scope)) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at_ms <= now_ms {
                    entry.insert(fresh());
                    return accepted;
                }
                let existing = entry.get();
                debug!(key, scope, status = ?existing.status, "idempotency claim rejected");
                ClaimOutcome {
                    accepted: false,
                    status: existing.status,
                    result_ref: existing.result_ref.clone(),
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh());
                accepted
            }
        }
    }

    /// Record the outcome of an accepted claim. Returns `false` if no live record exists.
    pub fn complete(
        &self,
        key: &str,
        user_context_id: &str,
        scope: &str,
        status: ClaimStatus,
        result_ref: Option<String>,
    ) -> bool {
        match self
            .records
            .get_mut(&LedgerKey::new(key, user_context_id, scope))
        {
            Some(mut record) => {
                record.status = status;
                record.result_ref = result_ref;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str, user_context_id: &str, scope: &str) -> Option<IdempotencyRecord> {
        self.records
            .get(&LedgerKey::new(key, user_context_id, scope))
            .map(|r| r.clone())
    }

    pub fn prune_at(&self, now_ms: i64) {
        self.records.retain(|_, record| record.expires_at_ms > now_ms);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-scope serialisation of side effects
// ---------------------------------------------------------------------------

/// One async mutex per `(user, conversation)`.
#[derive(Default)]
pub struct ScopeLocks {
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_context_id: &str, conversation_id: &str) -> OwnedMutexGuard<()> {
        if self.locks.len() > SCOPE_LOCK_PRUNE_THRESHOLD {
            self.prune_idle();
        }
        let lock = self
            .locks
            .entry((user_context_id.to_string(), conversation_id.to_string()))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody is holding or waiting on.
    pub fn prune_idle(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dedupe_rejects_within_window_and_accepts_after() {
        let dedupe = TurnDedupe::new(2_500);
        assert!(!dedupe.check_at("s1", "hello there", 1_000).is_duplicate());
        assert!(dedupe.check_at("s1", "  Hello   there ", 2_000).is_duplicate());
        assert!(!dedupe.check_at("s2", "hello there", 2_000).is_duplicate());
        assert!(!dedupe.check_at("s1", "hello there", 3_600).is_duplicate());
    }

    #[test]
    fn dedupe_duplicate_does_not_extend_window() {
        let dedupe = TurnDedupe::new(1_000);
        dedupe.check_at("s", "x", 0);
        assert!(dedupe.check_at("s", "x", 900).is_duplicate());
        assert!(!dedupe.check_at("s", "x", 1_000).is_duplicate());
    }

    #[test]
    fn dedupe_prune_drops_expired_signatures() {
        let dedupe = TurnDedupe::new(100);
        dedupe.check_at("s", "a", 0);
        dedupe.check_at("s", "b", 50);
        dedupe.prune_at(120);
        assert_eq!(dedupe.len(), 1);
    }

    #[test]
    fn claim_then_complete_then_reclaim() {
        let ledger = IdempotencyLedger::new(Duration::from_secs(60));
        let first = ledger.claim_at("abc", "u1", "report", None, 0);
        assert!(first.accepted);

        let second = ledger.claim_at("abc", "u1", "report", None, 10);
        assert!(!second.accepted);
        assert_eq!(second.status, ClaimStatus::Pending);

        assert!(ledger.complete("abc", "u1", "report", ClaimStatus::Completed, Some("msg-1".into())));
        let third = ledger.claim_at("abc", "u1", "report", None, 20);
        assert!(!third.accepted);
        assert_eq!(third.status, ClaimStatus::Completed);
        assert_eq!(third.result_ref.as_deref(), Some("msg-1"));
    }

    #[test]
    fn claims_are_scoped_by_user_and_scope() {
        let ledger = IdempotencyLedger::new(Duration::from_secs(60));
        assert!(ledger.claim_at("abc", "u1", "report", None, 0).accepted);
        assert!(ledger.claim_at("abc", "u2", "report", None, 0).accepted);
        assert!(ledger.claim_at("abc", "u1", "mission", None, 0).accepted);
    }

    #[test]
    fn expired_claim_is_pruned_and_reclaimable() {
        let ledger = IdempotencyLedger::new(Duration::from_millis(100));
        assert!(ledger.claim_at("k", "u", "report", None, 0).accepted);
        assert!(ledger.claim_at("k", "u", "report", None, 100).accepted);
        assert_eq!(ledger.len(), 1);
        let record = ledger.get("k", "u", "report").unwrap();
        assert_eq!(record.first_seen_at_ms, 100);
    }

    #[test]
    fn complete_without_claim_is_rejected() {
        let ledger = IdempotencyLedger::new(Duration::from_secs(1));
        assert!(!ledger.complete("k", "u", "report", ClaimStatus::Failed, None));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_admit_exactly_one() {
        let ledger = Arc::new(IdempotencyLedger::new(Duration::from_secs(60)));
        let winners = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let winners = Arc::clone(&winners);
                tokio::spawn(async move {
                    if ledger.claim("abc", "u1", "report", None).accepted {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scope_locks_serialise_same_scope() {
        let locks = Arc::new(ScopeLocks::new());
        let guard = locks.acquire("u1", "c1").await;

        let other_scope = tokio::time::timeout(Duration::from_millis(50), locks.acquire("u1", "c2")).await;
        assert!(other_scope.is_ok());

        let same_scope = tokio::time::timeout(Duration::from_millis(50), locks.acquire("u1", "c1")).await;
        assert!(same_scope.is_err());

        drop(guard);
        drop(other_scope);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.acquire("u1", "c1")).await;
        assert!(reacquired.is_ok());
        drop(reacquired);
        locks.prune_idle();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn idle_scope_locks_are_dropped_as_the_map_grows() {
        let locks = ScopeLocks::new();
        let held = locks.acquire("u0", "held").await;
        for i in 0..SCOPE_LOCK_PRUNE_THRESHOLD {
            drop(locks.acquire("u1", &format!("c{i}")).await);
        }
        assert_eq!(locks.len(), SCOPE_LOCK_PRUNE_THRESHOLD + 1);

        drop(locks.acquire("u1", "fresh").await);
        // Only the held lock and the newly inserted one survive.
        assert_eq!(locks.len(), 2);
        drop(held);
    }
}
