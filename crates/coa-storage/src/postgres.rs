//! Postgres-backed opportunity store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coa_core::{Opportunity, OpportunityCandidate, OpportunityStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::store::{
    validate_candidate, ListOrder, ListQuery, OpportunityStore, StatusPolicy, StoreError,
    UpsertOutcome,
};

const UPSERT_PRESERVING_STATUS: &str = r#"
    INSERT INTO content_opportunities (
        id, keyword, impressions_30d, clicks_30d, current_position,
        related_product_id, opportunity_score, status, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, 'identified', NOW(), NOW())
    ON CONFLICT (keyword) DO UPDATE
       SET impressions_30d = EXCLUDED.impressions_30d,
           clicks_30d = EXCLUDED.clicks_30d,
           current_position = EXCLUDED.current_position,
           related_product_id = EXCLUDED.related_product_id,
           opportunity_score = EXCLUDED.opportunity_score,
           updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_RESETTING_STATUS: &str = r#"
    INSERT INTO content_opportunities (
        id, keyword, impressions_30d, clicks_30d, current_position,
        related_product_id, opportunity_score, status, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, 'identified', NOW(), NOW())
    ON CONFLICT (keyword) DO UPDATE
       SET impressions_30d = EXCLUDED.impressions_30d,
           clicks_30d = EXCLUDED.clicks_30d,
           current_position = EXCLUDED.current_position,
           related_product_id = EXCLUDED.related_product_id,
           opportunity_score = EXCLUDED.opportunity_score,
           status = 'identified',
           updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

const SELECT_COLUMNS: &str = r#"
    SELECT keyword, impressions_30d, clicks_30d, current_position,
           related_product_id, opportunity_score, status, created_at, updated_at
      FROM content_opportunities
"#;

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
    status_policy: StatusPolicy,
}

impl PgOpportunityStore {
    pub fn new(pool: PgPool, status_policy: StatusPolicy) -> Self {
        Self {
            pool,
            status_policy,
        }
    }

    pub async fn connect(database_url: &str, status_policy: StatusPolicy) -> Result<Self, StoreError> {
        Ok(Self::new(connect(database_url).await?, status_policy))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_db_count(keyword: &str, field: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invalid {
        keyword: keyword.to_string(),
        reason: format!("{field} exceeds BIGINT range"),
    })
}

fn from_db_count(field: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Malformed(format!("negative {field}: {value}")))
}

fn order_clause(order: ListOrder) -> &'static str {
    match order {
        ListOrder::Recent => "ORDER BY updated_at DESC, created_at DESC, keyword ASC",
        ListOrder::Score => "ORDER BY opportunity_score DESC, keyword ASC",
    }
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<OpportunityStatus>()
        .map_err(|e| StoreError::Malformed(e.to_string()))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(Opportunity {
        keyword: row.try_get("keyword")?,
        impressions_30d: from_db_count("impressions_30d", row.try_get("impressions_30d")?)?,
        clicks_30d: from_db_count("clicks_30d", row.try_get("clicks_30d")?)?,
        current_position: row.try_get("current_position")?,
        related_product_id: row.try_get("related_product_id")?,
        opportunity_score: row.try_get("opportunity_score")?,
        status,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn upsert(&self, candidate: &OpportunityCandidate) -> Result<UpsertOutcome, StoreError> {
        validate_candidate(candidate)?;
        let sql = match self.status_policy {
            StatusPolicy::Preserve => UPSERT_PRESERVING_STATUS,
            StatusPolicy::ResetToIdentified => UPSERT_RESETTING_STATUS,
        };
        let row = sqlx::query(sql)
            .bind(Uuid::new_v4())
            .bind(&candidate.keyword)
            .bind(to_db_count(&candidate.keyword, "impressions_30d", candidate.impressions_30d)?)
            .bind(to_db_count(&candidate.keyword, "clicks_30d", candidate.clicks_30d)?)
            .bind(candidate.current_position)
            .bind(candidate.related_product_id.as_deref())
            .bind(candidate.opportunity_score)
            .fetch_one(&self.pool)
            .await?;
        let inserted: bool = row.try_get("inserted")?;
        debug!(keyword = %candidate.keyword, inserted, "upserted opportunity");
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get(&self, keyword: &str) -> Result<Option<Opportunity>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE keyword = $1");
        let row = sqlx::query(&sql)
            .bind(keyword)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(opportunity_from_row).transpose()
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Opportunity>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE ($1::text IS NULL OR status = $1) {} LIMIT $2",
            order_clause(query.order)
        );
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(query.status.map(OpportunityStatus::as_str))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn set_status(
        &self,
        keyword: &str,
        status: OpportunityStatus,
    ) -> Result<Opportunity, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE content_opportunities
               SET status = $2,
                   updated_at = NOW()
             WHERE keyword = $1
            RETURNING keyword, impressions_30d, clicks_30d, current_position,
                      related_product_id, opportunity_score, status, created_at, updated_at
            "#,
        )
        .bind(keyword)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => opportunity_from_row(&row),
            None => Err(StoreError::NotFound(keyword.to_string())),
        }
    }
}
