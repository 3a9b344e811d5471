//! Core domain model for content opportunity analysis.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "coa-core";

/// One observed row of search performance for a query on a date in a country.
///
/// Identified by `(query, country, date)`; the engine never mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQueryRecord {
    pub query: String,
    pub country: String,
    pub date: NaiveDate,
    pub clicks: u64,
    pub impressions: u64,
    pub ctr: f64,
    pub position: f64,
}

/// Per-query summary over the active window, countries merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedQuery {
    pub query: String,
    pub total_impressions: u64,
    pub total_clicks: u64,
    pub avg_position: f64,
}

/// Per-run filter applied after aggregation. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryThresholds {
    pub min_impressions: u64,
    pub max_position: f64,
}

impl Default for QueryThresholds {
    fn default() -> Self {
        Self {
            min_impressions: 10,
            max_position: 50.0,
        }
    }
}

/// Sellable item supplied by the catalog source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub handle: String,
    pub title: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Queries judged lexically similar. The seed is always the first member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordCluster {
    pub queries: Vec<String>,
}

impl KeywordCluster {
    pub fn seeded(seed: impl Into<String>) -> Self {
        Self {
            queries: vec![seed.into()],
        }
    }

    pub fn seed(&self) -> Option<&str> {
        self.queries.first().map(String::as_str)
    }

    pub fn contains(&self, query: &str) -> bool {
        self.queries.iter().any(|q| q == query)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    #[default]
    Identified,
    InProgress,
    Completed,
    Skipped,
}

impl OpportunityStatus {
    pub const ALL: [OpportunityStatus; 4] = [
        OpportunityStatus::Identified,
        OpportunityStatus::InProgress,
        OpportunityStatus::Completed,
        OpportunityStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identified => "identified",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown opportunity status `{0}`")]
pub struct StatusParseError(pub String);

impl FromStr for OpportunityStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| StatusParseError(s.to_string()))
    }
}

/// Write payload produced by scoring one cluster. Carries no status: that
/// field belongs to the external workflow once the row exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityCandidate {
    pub keyword: String,
    pub impressions_30d: u64,
    pub clicks_30d: u64,
    pub current_position: f64,
    pub related_product_id: Option<String>,
    pub opportunity_score: f64,
}

/// Persisted, status-tracked opportunity keyed by `keyword`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub keyword: String,
    pub impressions_30d: u64,
    pub clicks_30d: u64,
    pub current_position: f64,
    pub related_product_id: Option<String>,
    pub opportunity_score: f64,
    pub status: OpportunityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn identified(candidate: OpportunityCandidate, now: DateTime<Utc>) -> Self {
        Self {
            keyword: candidate.keyword,
            impressions_30d: candidate.impressions_30d,
            clicks_30d: candidate.clicks_30d,
            current_position: candidate.current_position,
            related_product_id: candidate.related_product_id,
            opportunity_score: candidate.opportunity_score,
            status: OpportunityStatus::Identified,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the analysis-owned fields, leaving status and creation time alone.
    pub fn refresh_from(&mut self, candidate: OpportunityCandidate, now: DateTime<Utc>) {
        self.impressions_30d = candidate.impressions_30d;
        self.clicks_30d = candidate.clicks_30d;
        self.current_position = candidate.current_position;
        self.related_product_id = candidate.related_product_id;
        self.opportunity_score = candidate.opportunity_score;
        self.updated_at = now;
    }
}
