//! Axum + Askama dashboard and JSON API over the opportunity store.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use coa_core::{Opportunity, OpportunityStatus};
use coa_storage::{
    ListOrder, ListQuery, MemoryOpportunityStore, OpportunityStore, PgOpportunityStore,
    StatusPolicy, StoreError, DEFAULT_LIST_LIMIT,
};
use coa_sync::{report_recent_runs, AnalysisConfig};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "coa-web";

const MAX_PAGE_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OpportunityStore>,
    pub reports_root: PathBuf,
}

impl AppState {
    pub fn new(store: Arc<dyn OpportunityStore>, reports_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            reports_root: reports_root.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesQuery {
    status: Option<String>,
    limit: Option<usize>,
    sort: Option<String>,
}

impl OpportunitiesQuery {
    fn to_list_query(&self) -> Result<ListQuery, String> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => None,
            Some(raw) => Some(raw.parse::<OpportunityStatus>().map_err(|e| e.to_string())?),
        };
        let order = match self.sort.as_deref() {
            None | Some("") => ListOrder::default(),
            Some(raw) => raw.parse::<ListOrder>()?,
        };
        Ok(ListQuery {
            status,
            limit: self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_PAGE_LIMIT),
            order,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

struct OpportunityRow {
    keyword: String,
    score: String,
    impressions: u64,
    clicks: u64,
    position: String,
    product: String,
    status: &'static str,
    updated_at: String,
}

impl From<&Opportunity> for OpportunityRow {
    fn from(o: &Opportunity) -> Self {
        Self {
            keyword: o.keyword.clone(),
            score: format!("{:.1}", o.opportunity_score),
            impressions: o.impressions_30d,
            clicks: o.clicks_30d,
            position: format!("{:.1}", o.current_position),
            product: o.related_product_id.clone().unwrap_or_else(|| "-".into()),
            status: o.status.as_str(),
            updated_at: o.updated_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

struct FilterOption {
    value: &'static str,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    opportunities: Vec<OpportunityRow>,
    statuses: Vec<FilterOption>,
    sorts: Vec<FilterOption>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/opportunities", get(list_handler))
        .route("/api/opportunities/{keyword}", get(detail_handler))
        .route("/api/opportunities/{keyword}/status", post(status_handler))
        .route("/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("COA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = AnalysisConfig::from_env();
    let store: Arc<dyn OpportunityStore> = match &config.database_url {
        Some(url) => Arc::new(PgOpportunityStore::connect(url, StatusPolicy::default()).await?),
        None => {
            warn!("DATABASE_URL not set; serving an empty in-memory store");
            Arc::new(MemoryOpportunityStore::default())
        }
    };
    let state = AppState::new(store, config.reports_dir);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    let list = match query.to_list_query() {
        Ok(list) => list,
        Err(message) => return bad_request(message),
    };
    match state.store.list(&list).await {
        Ok(rows) => render_html(IndexTemplate {
            opportunities: rows.iter().map(OpportunityRow::from).collect(),
            statuses: OpportunityStatus::ALL
                .iter()
                .map(|s| FilterOption {
                    value: s.as_str(),
                    selected: list.status == Some(*s),
                })
                .collect(),
            sorts: [ListOrder::Recent, ListOrder::Score]
                .into_iter()
                .map(|o| FilterOption {
                    value: match o {
                        ListOrder::Recent => "recent",
                        ListOrder::Score => "score",
                    },
                    selected: list.order == o,
                })
                .collect(),
        }),
        Err(err) => store_error(err),
    }
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    let list = match query.to_list_query() {
        Ok(list) => list,
        Err(message) => return bad_request(message),
    };
    match state.store.list(&list).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(keyword): AxumPath<String>,
) -> Response {
    match state.store.get(&keyword).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => store_error(StoreError::NotFound(keyword)),
        Err(err) => store_error(err),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(keyword): AxumPath<String>,
    Json(update): Json<StatusUpdate>,
) -> Response {
    let status = match update.status.parse::<OpportunityStatus>() {
        Ok(status) => status,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.store.set_status(&keyword, status).await {
        Ok(row) => {
            info!(keyword = %row.keyword, status = %row.status, "status updated");
            Json(row).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Response {
    match report_recent_runs(10, &state.reports_root) {
        Ok(markdown) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            markdown,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn bad_request(message: String) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(keyword) => {
            json_error(StatusCode::NOT_FOUND, format!("no opportunity for keyword `{keyword}`"))
        }
        StoreError::Invalid { .. } => bad_request(err.to_string()),
        other => server_error(other.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("server error: {err}"))
}
