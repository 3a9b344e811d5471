//! Opportunity persistence contract and the in-memory implementation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use coa_core::{Opportunity, OpportunityCandidate, OpportunityStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no opportunity stored for keyword `{0}`")]
    NotFound(String),
    #[error("rejected opportunity `{keyword}`: {reason}")]
    Invalid { keyword: String, reason: String },
    #[error("malformed stored row: {0}")]
    Malformed(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// What an upsert does to the `status` of an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPolicy {
    /// Leave workflow status alone on re-analysis.
    #[default]
    Preserve,
    /// Legacy behavior: every upsert writes `identified`.
    ResetToIdentified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: Vec<String>,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    /// Most recently written first.
    #[default]
    Recent,
    Score,
}

impl fmt::Display for ListOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recent => "recent",
            Self::Score => "score",
        })
    }
}

impl FromStr for ListOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recent" | "recency" => Ok(Self::Recent),
            "score" => Ok(Self::Score),
            other => Err(format!("unknown list order `{other}` (expected recent|score)")),
        }
    }
}

pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<OpportunityStatus>,
    pub limit: usize,
    pub order: ListOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            order: ListOrder::Recent,
        }
    }
}

/// Reject candidates the schema would refuse, before touching the backend.
pub fn validate_candidate(candidate: &OpportunityCandidate) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::Invalid {
        keyword: candidate.keyword.clone(),
        reason: reason.to_string(),
    };
    if candidate.keyword.trim().is_empty() {
        return Err(invalid("keyword is empty"));
    }
    if !candidate.opportunity_score.is_finite()
        || !(0.0..=100.0).contains(&candidate.opportunity_score)
    {
        return Err(invalid("opportunity_score outside [0, 100]"));
    }
    if !candidate.current_position.is_finite() {
        return Err(invalid("current_position is not finite"));
    }
    Ok(())
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Insert as `identified`, or refresh the analysis-owned fields of the
    /// existing row for `candidate.keyword`.
    async fn upsert(&self, candidate: &OpportunityCandidate) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, keyword: &str) -> Result<Option<Opportunity>, StoreError>;

    async fn list(&self, query: &ListQuery) -> Result<Vec<Opportunity>, StoreError>;

    /// Workflow transition; the only write that changes status after insert.
    async fn set_status(
        &self,
        keyword: &str,
        status: OpportunityStatus,
    ) -> Result<Opportunity, StoreError>;

    /// Upsert row by row. A failed row is logged and skipped; rows already
    /// written stay committed.
    async fn upsert_batch(&self, candidates: &[OpportunityCandidate]) -> UpsertReport {
        let mut report = UpsertReport::default();
        for candidate in candidates {
            match self.upsert(candidate).await {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(err) => {
                    warn!(keyword = %candidate.keyword, error = %err, "skipping opportunity upsert");
                    report.failed.push(candidate.keyword.clone());
                }
            }
        }
        report
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<String, MemoryRow>,
    clock: u64,
}

#[derive(Debug, Clone)]
struct MemoryRow {
    written_seq: u64,
    created_seq: u64,
    opportunity: Opportunity,
}

/// Process-local store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    state: Mutex<MemoryState>,
    status_policy: StatusPolicy,
}

impl MemoryOpportunityStore {
    pub fn new(status_policy: StatusPolicy) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            status_policy,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn upsert(&self, candidate: &OpportunityCandidate) -> Result<UpsertOutcome, StoreError> {
        validate_candidate(candidate)?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.clock += 1;
        let seq = state.clock;

        if let Some(row) = state.rows.get_mut(&candidate.keyword) {
            row.opportunity.refresh_from(candidate.clone(), now);
            if self.status_policy == StatusPolicy::ResetToIdentified {
                row.opportunity.status = OpportunityStatus::Identified;
            }
            row.written_seq = seq;
            return Ok(UpsertOutcome::Updated);
        }

        state.rows.insert(
            candidate.keyword.clone(),
            MemoryRow {
                written_seq: seq,
                created_seq: seq,
                opportunity: Opportunity::identified(candidate.clone(), now),
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn get(&self, keyword: &str) -> Result<Option<Opportunity>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(keyword).map(|row| row.opportunity.clone()))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .rows
            .values()
            .filter(|row| query.status.map_or(true, |s| row.opportunity.status == s))
            .collect::<Vec<_>>();

        match query.order {
            ListOrder::Recent => rows.sort_by(|a, b| {
                b.written_seq
                    .cmp(&a.written_seq)
                    .then_with(|| b.created_seq.cmp(&a.created_seq))
            }),
            ListOrder::Score => rows.sort_by(|a, b| {
                b.opportunity
                    .opportunity_score
                    .total_cmp(&a.opportunity.opportunity_score)
                    .then_with(|| a.opportunity.keyword.cmp(&b.opportunity.keyword))
            }),
        }

        Ok(rows
            .into_iter()
            .take(query.limit)
            .map(|row| row.opportunity.clone())
            .collect())
    }

    async fn set_status(
        &self,
        keyword: &str,
        status: OpportunityStatus,
    ) -> Result<Opportunity, StoreError> {
        let mut state = self.state.lock().await;
        state.clock += 1;
        let seq = state.clock;
        let row = state
            .rows
            .get_mut(keyword)
            .ok_or_else(|| StoreError::NotFound(keyword.to_string()))?;
        row.opportunity.status = status;
        row.opportunity.updated_at = Utc::now();
        row.written_seq = seq;
        Ok(row.opportunity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(keyword: &str, score: f64) -> OpportunityCandidate {
        OpportunityCandidate {
            keyword: keyword.to_string(),
            impressions_30d: 500,
            clicks_30d: 10,
            current_position: 8.0,
            related_product_id: None,
            opportunity_score: score,
        }
    }

    #[tokio::test]
    async fn first_write_inserts_identified() {
        let store = MemoryOpportunityStore::default();
        let outcome = store.upsert(&candidate("x", 30.0)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        let row = store.get("x").await.unwrap().unwrap();
        assert_eq!(row.status, OpportunityStatus::Identified);
    }

    #[tokio::test]
    async fn reanalysis_keeps_workflow_status() {
        let store = MemoryOpportunityStore::default();
        store.upsert(&candidate("x", 30.0)).await.unwrap();
        store
            .set_status("x", OpportunityStatus::InProgress)
            .await
            .unwrap();

        let mut next = candidate("x", 42.0);
        next.impressions_30d = 900;
        next.related_product_id = Some("p1".into());
        assert_eq!(store.upsert(&next).await.unwrap(), UpsertOutcome::Updated);

        let row = store.get("x").await.unwrap().unwrap();
        assert_eq!(row.status, OpportunityStatus::InProgress);
        assert_eq!(row.opportunity_score, 42.0);
        assert_eq!(row.impressions_30d, 900);
        assert_eq!(row.related_product_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn legacy_policy_resets_status() {
        let store = MemoryOpportunityStore::new(StatusPolicy::ResetToIdentified);
        store.upsert(&candidate("x", 30.0)).await.unwrap();
        store
            .set_status("x", OpportunityStatus::Completed)
            .await
            .unwrap();
        store.upsert(&candidate("x", 31.0)).await.unwrap();
        let row = store.get("x").await.unwrap().unwrap();
        assert_eq!(row.status, OpportunityStatus::Identified);
    }

    #[tokio::test]
    async fn batch_skips_bad_rows_and_keeps_going() {
        let store = MemoryOpportunityStore::default();
        store.upsert(&candidate("existing", 10.0)).await.unwrap();

        let report = store
            .upsert_batch(&[
                candidate("a", 50.0),
                candidate("", 50.0),
                candidate("b", f64::NAN),
                candidate("existing", 60.0),
            ])
            .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.written(), 2);
        assert_eq!(report.failed, vec!["".to_string(), "b".to_string()]);
        assert_eq!(store.len().await, 2);
        assert_eq!(
            store.get("existing").await.unwrap().unwrap().opportunity_score,
            60.0
        );
    }

    #[tokio::test]
    async fn list_filters_by_status_and_limits() {
        let store = MemoryOpportunityStore::default();
        for (k, s) in [("a", 10.0), ("b", 90.0), ("c", 50.0)] {
            store.upsert(&candidate(k, s)).await.unwrap();
        }
        store
            .set_status("c", OpportunityStatus::Skipped)
            .await
            .unwrap();

        let identified = store
            .list(&ListQuery {
                status: Some(OpportunityStatus::Identified),
                limit: 10,
                order: ListOrder::Score,
            })
            .await
            .unwrap();
        let keywords = identified.iter().map(|o| o.keyword.as_str()).collect::<Vec<_>>();
        assert_eq!(keywords, vec!["b", "a"]);

        let recent = store
            .list(&ListQuery {
                status: None,
                limit: 2,
                order: ListOrder::Recent,
            })
            .await
            .unwrap();
        let keywords = recent.iter().map(|o| o.keyword.as_str()).collect::<Vec<_>>();
        assert_eq!(keywords, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn unknown_keyword_status_change_is_not_found() {
        let store = MemoryOpportunityStore::default();
        let err = store
            .set_status("nope", OpportunityStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(k) if k == "nope"));
    }

    #[test]
    fn list_order_parses() {
        assert_eq!("Score".parse::<ListOrder>().unwrap(), ListOrder::Score);
        assert_eq!("recent".parse::<ListOrder>().unwrap(), ListOrder::Recent);
        assert!("random".parse::<ListOrder>().is_err());
    }
}
