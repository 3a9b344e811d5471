//! Collapses raw daily rows into one summary per query text.

use std::collections::BTreeMap;

use coa_core::{AggregatedQuery, QueryThresholds, RawQueryRecord};

#[derive(Default)]
struct Accumulator {
    impressions: u64,
    clicks: u64,
    position_sum: f64,
    rows: usize,
}

/// Aggregate by exact query text (country is not part of the key), drop rows
/// outside the thresholds, and order by impressions descending then query.
pub fn aggregate_queries(
    records: &[RawQueryRecord],
    thresholds: QueryThresholds,
) -> Vec<AggregatedQuery> {
    let mut by_query: BTreeMap<&str, Accumulator> = BTreeMap::new();
    for record in records {
        let acc = by_query.entry(record.query.as_str()).or_default();
        acc.impressions = acc.impressions.saturating_add(record.impressions);
        acc.clicks = acc.clicks.saturating_add(record.clicks);
        acc.position_sum += record.position;
        acc.rows += 1;
    }

    let mut out = by_query
        .into_iter()
        .map(|(query, acc)| AggregatedQuery {
            query: query.to_string(),
            total_impressions: acc.impressions,
            total_clicks: acc.clicks,
            avg_position: acc.position_sum / acc.rows as f64,
        })
        .filter(|q| {
            q.total_impressions >= thresholds.min_impressions
                && q.avg_position <= thresholds.max_position
        })
        .collect::<Vec<_>>();

    out.sort_by(|a, b| {
        b.total_impressions
            .cmp(&a.total_impressions)
            .then_with(|| a.query.cmp(&b.query))
    });
    out
}
