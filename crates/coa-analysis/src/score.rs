//! Bounded opportunity scoring and batch ordering.

use std::collections::HashMap;

use coa_core::{AggregatedQuery, CatalogItem, KeywordCluster, OpportunityCandidate};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cluster::primary_of;
use crate::matcher::match_catalog_item;

pub const MAX_SCORE: f64 = 100.0;
pub const PRODUCT_BONUS: f64 = 15.0;
pub const CTR_POTENTIAL: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput {
    pub total_impressions: u64,
    pub avg_position: f64,
    pub has_catalog_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub impression: f64,
    pub position: f64,
    pub product_bonus: f64,
    pub ctr_potential: f64,
    pub total: f64,
}

pub fn position_score(avg_position: f64) -> f64 {
    if (5.0..=15.0).contains(&avg_position) {
        30.0
    } else if avg_position > 15.0 && avg_position <= 20.0 {
        20.0
    } else if avg_position < 5.0 {
        10.0
    } else {
        0.0
    }
}

pub fn score_breakdown(input: ScoreInput) -> ScoreBreakdown {
    let impression = 10.0 * (input.total_impressions as f64 + 1.0).log10();
    let position = position_score(input.avg_position);
    let product_bonus = if input.has_catalog_match {
        PRODUCT_BONUS
    } else {
        0.0
    };
    let ctr_potential = if input.avg_position > 3.0 {
        CTR_POTENTIAL
    } else {
        0.0
    };
    let total = (impression + position + product_bonus + ctr_potential).clamp(0.0, MAX_SCORE);
    ScoreBreakdown {
        impression,
        position,
        product_bonus,
        ctr_potential,
        total,
    }
}

pub fn opportunity_score(input: ScoreInput) -> f64 {
    score_breakdown(input).total
}

/// A cluster together with the opportunity it yields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCluster {
    pub cluster: KeywordCluster,
    pub candidate: OpportunityCandidate,
    pub breakdown: ScoreBreakdown,
}

/// Match and score every cluster, then sort by score descending. The sort is
/// stable, so equal scores keep cluster order.
pub fn score_clusters(
    clusters: &[KeywordCluster],
    aggregated: &[AggregatedQuery],
    catalog: &[CatalogItem],
) -> Vec<ScoredCluster> {
    let index = aggregated
        .iter()
        .map(|row| (row.query.as_str(), row))
        .collect::<HashMap<_, _>>();

    let mut scored = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let members = cluster
            .queries
            .iter()
            .filter_map(|q| index.get(q.as_str()).copied())
            .collect::<Vec<_>>();
        let Some(primary) = primary_of(members.iter().copied()) else {
            warn!(seed = ?cluster.seed(), "cluster has no aggregated members; skipping");
            continue;
        };

        let total_impressions = members
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.total_impressions));
        let total_clicks = members
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.total_clicks));
        let avg_position =
            members.iter().map(|m| m.avg_position).sum::<f64>() / members.len() as f64;
        let matched = match_catalog_item(&cluster.queries, catalog);

        let breakdown = score_breakdown(ScoreInput {
            total_impressions,
            avg_position,
            has_catalog_match: matched.is_some(),
        });
        debug!(
            keyword = %primary.query,
            members = members.len(),
            total_impressions,
            avg_position,
            product = ?matched.map(|m| m.id.as_str()),
            score = breakdown.total,
            "scored cluster"
        );

        scored.push(ScoredCluster {
            cluster: cluster.clone(),
            candidate: OpportunityCandidate {
                keyword: primary.query.clone(),
                impressions_30d: total_impressions,
                clicks_30d: total_clicks,
                current_position: avg_position,
                related_product_id: matched.map(|m| m.id.clone()),
                opportunity_score: breakdown.total,
            },
            breakdown,
        });
    }

    scored.sort_by(|a, b| {
        b.candidate
            .opportunity_score
            .total_cmp(&a.candidate.opportunity_score)
    });
    scored
}
