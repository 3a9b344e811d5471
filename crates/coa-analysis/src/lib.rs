//! Pure analysis stages: aggregate, cluster, match, score.

pub mod aggregate;
pub mod cluster;
pub mod matcher;
pub mod score;

use coa_core::{AggregatedQuery, CatalogItem, OpportunityCandidate, QueryThresholds, RawQueryRecord};
use serde::Serialize;
use tracing::info_span;

pub use aggregate::aggregate_queries;
pub use cluster::{cluster_queries, jaccard, primary_query, tokenize, SIMILARITY_THRESHOLD};
pub use matcher::match_catalog_item;
pub use score::{opportunity_score, score_breakdown, score_clusters, ScoreBreakdown, ScoreInput, ScoredCluster};

pub const CRATE_NAME: &str = "coa-analysis";

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub raw_records: usize,
    pub aggregated: Vec<AggregatedQuery>,
    pub clusters_found: usize,
    pub scored: Vec<ScoredCluster>,
}

impl AnalysisOutcome {
    /// Candidates in score order, ready for the store.
    pub fn candidates(&self) -> Vec<OpportunityCandidate> {
        self.scored.iter().map(|s| s.candidate.clone()).collect()
    }
}

pub struct AnalysisEngine {
    thresholds: QueryThresholds,
}

impl AnalysisEngine {
    pub fn new(thresholds: QueryThresholds) -> Self {
        Self { thresholds }
    }

    pub fn analyze(&self, records: &[RawQueryRecord], catalog: &[CatalogItem]) -> AnalysisOutcome {
        let span = info_span!(
            "analyze",
            records = records.len(),
            catalog = catalog.len(),
            min_impressions = self.thresholds.min_impressions,
            max_position = self.thresholds.max_position
        );
        let _guard = span.enter();

        let aggregated = aggregate_queries(records, self.thresholds);
        let queries = aggregated.iter().map(|q| q.query.as_str()).collect::<Vec<_>>();
        let clusters = cluster_queries(&queries);
        let scored = score_clusters(&clusters, &aggregated, catalog);

        AnalysisOutcome {
            raw_records: records.len(),
            clusters_found: clusters.len(),
            aggregated,
            scored,
        }
    }
}
