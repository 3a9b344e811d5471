//! Search-performance and catalog source contracts + fixture/HTTP implementations.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use coa_core::{CatalogItem, RawQueryRecord};
use coa_storage::{FetchError, HttpFetcher, SourceRequest};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "coa-adapters";

/// Search Console caps a single page at 25k rows.
pub const SEARCH_CONSOLE_ROW_LIMIT: usize = 25_000;
pub const CATALOG_PAGE_SIZE: usize = 250;
const MAX_CATALOG_PAGES: usize = 400;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Trailing window `[end - days, end]`, optionally restricted to one country.
///
/// Both bounds are inclusive, so the window covers `days + 1` calendar days
/// (31 for the default 30).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRequest {
    pub days: u32,
    pub end: NaiveDate,
    pub country: Option<String>,
}

impl WindowRequest {
    pub fn start(&self) -> NaiveDate {
        self.end - Duration::days(i64::from(self.days))
    }

    pub fn contains(&self, record: &RawQueryRecord) -> bool {
        let in_range = record.date >= self.start() && record.date <= self.end;
        let in_country = self
            .country
            .as_deref()
            .map_or(true, |c| record.country.eq_ignore_ascii_case(c));
        in_range && in_country
    }
}

/// Parsed items plus the raw payload pages they came from, for archiving.
#[derive(Debug, Clone)]
pub struct SourceBatch<T> {
    pub items: Vec<T>,
    pub raw_pages: Vec<Vec<u8>>,
}

impl<T> Default for SourceBatch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            raw_pages: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SearchPerformanceSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_window(
        &self,
        ctx: &AdapterContext,
        window: &WindowRequest,
    ) -> Result<SourceBatch<RawQueryRecord>, AdapterError>;
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_catalog(&self, ctx: &AdapterContext) -> Result<SourceBatch<CatalogItem>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchSourceConfig {
    Fixture {
        path: PathBuf,
    },
    SearchConsole {
        site_url: String,
        #[serde(default = "default_search_console_base")]
        api_base: String,
        access_token_env: String,
    },
}

fn default_search_console_base() -> String {
    "https://www.googleapis.com/webmasters/v3".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogSourceConfig {
    Fixture {
        path: PathBuf,
    },
    Graphql {
        endpoint: String,
        #[serde(default = "default_token_header")]
        token_header: String,
        access_token_env: String,
    },
}

fn default_token_header() -> String {
    "X-Shopify-Access-Token".to_string()
}

fn credential_from_env(var: &str) -> Result<String, AdapterError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AdapterError::MissingCredential(var.to_string()))
}

pub fn search_source_for(
    config: &SearchSourceConfig,
    workspace_root: &Path,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn SearchPerformanceSource>, AdapterError> {
    Ok(match config {
        SearchSourceConfig::Fixture { path } => {
            Box::new(FixtureSearchSource::new(workspace_root.join(path)))
        }
        SearchSourceConfig::SearchConsole {
            site_url,
            api_base,
            access_token_env,
        } => Box::new(SearchConsoleSource {
            http,
            api_base: api_base.clone(),
            site_url: site_url.clone(),
            access_token: credential_from_env(access_token_env)?,
        }),
    })
}

pub fn catalog_source_for(
    config: &CatalogSourceConfig,
    workspace_root: &Path,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn CatalogSource>, AdapterError> {
    Ok(match config {
        CatalogSourceConfig::Fixture { path } => {
            Box::new(FixtureCatalogSource::new(workspace_root.join(path)))
        }
        CatalogSourceConfig::Graphql {
            endpoint,
            token_header,
            access_token_env,
        } => Box::new(CatalogGraphqlSource::new(
            http,
            endpoint.clone(),
            token_header.clone(),
            credential_from_env(access_token_env)?,
        )),
    })
}

// ---- parsing shared by fixtures and live sources ----

/// Parse a `searchAnalytics/query` response with dimensions `[query, country, date]`.
pub fn parse_search_analytics(body: &JsonValue) -> Result<Vec<RawQueryRecord>, AdapterError> {
    let Some(rows) = body.get("rows") else {
        return Ok(Vec::new());
    };
    let rows = rows
        .as_array()
        .ok_or_else(|| AdapterError::Message("search analytics `rows` is not an array".into()))?;

    rows.iter()
        .enumerate()
        .map(|(idx, row)| parse_search_row(row).map_err(|e| AdapterError::Message(format!("row {idx}: {e}"))))
        .collect()
}

fn parse_search_row(row: &JsonValue) -> Result<RawQueryRecord, String> {
    let keys = row
        .get("keys")
        .and_then(JsonValue::as_array)
        .ok_or("missing keys")?;
    let key = |i: usize, name: &str| {
        keys.get(i)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or(format!("missing {name} key"))
    };
    let number = |name: &str| {
        row.get(name)
            .and_then(JsonValue::as_f64)
            .ok_or(format!("missing numeric {name}"))
    };

    let date = key(2, "date")?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| format!("bad date {date}: {e}"))?;
    let clicks = number("clicks")?;
    let impressions = number("impressions")?;
    if clicks < 0.0 || impressions < 0.0 {
        return Err("negative clicks or impressions".into());
    }

    Ok(RawQueryRecord {
        query: key(0, "query")?,
        country: key(1, "country")?,
        date,
        clicks: clicks as u64,
        impressions: impressions as u64,
        ctr: number("ctr").unwrap_or(0.0).clamp(0.0, 1.0),
        position: number("position")?,
    })
}

/// Tags must be an array of strings; anything else counts as no tags.
pub fn parse_tags(product_id: &str, value: Option<&JsonValue>) -> BTreeSet<String> {
    match value {
        None | Some(JsonValue::Null) => BTreeSet::new(),
        Some(JsonValue::Array(items)) => {
            let tags = items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<BTreeSet<_>>>();
            tags.unwrap_or_else(|| {
                warn!(product_id, "catalog tags contain non-string values; ignoring tags");
                BTreeSet::new()
            })
        }
        Some(other) => {
            warn!(product_id, kind = json_kind(other), "catalog tags are not a list; ignoring tags");
            BTreeSet::new()
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Map one product node (`id`, `handle`, `title`, `tags`) to a catalog item.
pub fn parse_catalog_node(node: &JsonValue) -> Result<CatalogItem, AdapterError> {
    let text = |name: &str| {
        node.get(name)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Message(format!("catalog node missing `{name}`")))
    };
    let id = match node.get("id") {
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => text("id")?,
    };
    Ok(CatalogItem {
        tags: parse_tags(&id, node.get("tags")),
        handle: text("handle")?,
        title: node
            .get("title")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        id,
    })
}

fn read_fixture(path: &Path) -> Result<(Vec<u8>, JsonValue), AdapterError> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok((bytes, value))
}

// ---- fixtures ----

#[derive(Debug, Clone)]
pub struct FixtureSearchSource {
    path: PathBuf,
}

impl FixtureSearchSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SearchPerformanceSource for FixtureSearchSource {
    fn source_id(&self) -> &str {
        "search-fixture"
    }

    async fn fetch_window(
        &self,
        _ctx: &AdapterContext,
        window: &WindowRequest,
    ) -> Result<SourceBatch<RawQueryRecord>, AdapterError> {
        let (bytes, value) = read_fixture(&self.path)?;
        let items = parse_search_analytics(&value)?
            .into_iter()
            .filter(|r| window.contains(r))
            .collect::<Vec<_>>();
        debug!(path = %self.path.display(), rows = items.len(), "loaded search fixture");
        Ok(SourceBatch {
            items,
            raw_pages: vec![bytes],
        })
    }
}

#[derive(Debug, Clone)]
pub struct FixtureCatalogSource {
    path: PathBuf,
}

impl FixtureCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalogSource {
    fn source_id(&self) -> &str {
        "catalog-fixture"
    }

    async fn fetch_catalog(&self, _ctx: &AdapterContext) -> Result<SourceBatch<CatalogItem>, AdapterError> {
        let (bytes, value) = read_fixture(&self.path)?;
        let nodes = value.as_array().ok_or_else(|| {
            AdapterError::Message(format!("{} is not a JSON array", self.path.display()))
        })?;
        let items = nodes.iter().map(parse_catalog_node).collect::<Result<Vec<_>, _>>()?;
        Ok(SourceBatch {
            items,
            raw_pages: vec![bytes],
        })
    }
}

// ---- live sources ----

pub struct SearchConsoleSource {
    http: Arc<HttpFetcher>,
    api_base: String,
    site_url: String,
    access_token: String,
}

impl SearchConsoleSource {
    pub fn new(http: Arc<HttpFetcher>, site_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: default_search_console_base(),
            site_url: site_url.into(),
            access_token: access_token.into(),
        }
    }

    pub fn query_url(&self) -> Result<Url, AdapterError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| AdapterError::Message(format!("invalid api base {}: {e}", self.api_base)))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message(format!("api base {} cannot hold a path", self.api_base)))?
            .pop_if_empty()
            .push("sites")
            .push(&self.site_url)
            .push("searchAnalytics")
            .push("query");
        Ok(url)
    }
}

pub fn search_analytics_body(window: &WindowRequest, start_row: usize) -> JsonValue {
    let mut body = json!({
        "startDate": window.start().format("%Y-%m-%d").to_string(),
        "endDate": window.end.format("%Y-%m-%d").to_string(),
        "dimensions": ["query", "country", "date"],
        "rowLimit": SEARCH_CONSOLE_ROW_LIMIT,
        "startRow": start_row,
    });
    if let Some(country) = &window.country {
        body["dimensionFilterGroups"] = json!([{
            "filters": [{
                "dimension": "country",
                "operator": "equals",
                "expression": country.to_ascii_lowercase(),
            }]
        }]);
    }
    body
}

#[async_trait]
impl SearchPerformanceSource for SearchConsoleSource {
    fn source_id(&self) -> &str {
        "search-console"
    }

    async fn fetch_window(
        &self,
        ctx: &AdapterContext,
        window: &WindowRequest,
    ) -> Result<SourceBatch<RawQueryRecord>, AdapterError> {
        let url = self.query_url()?;
        let mut batch = SourceBatch::default();
        let mut start_row = 0usize;

        loop {
            let request = SourceRequest::post_json(url.as_str(), search_analytics_body(window, start_row))
                .bearer(Some(self.access_token.clone()));
            let response = self.http.send(ctx.run_id, self.source_id(), &request).await?;
            let rows = parse_search_analytics(&response.json()?)?;
            let page_len = rows.len();
            batch.raw_pages.push(response.body);
            batch.items.extend(rows);
            debug!(start_row, page_len, "fetched search analytics page");

            if page_len < SEARCH_CONSOLE_ROW_LIMIT {
                break;
            }
            start_row += page_len;
        }

        Ok(batch)
    }
}

pub struct CatalogGraphqlSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
    token_header: String,
    access_token: String,
}

const PRODUCTS_QUERY: &str = r#"
query CatalogProducts($first: Int!, $after: String) {
  products(first: $first, after: $after) {
    pageInfo { hasNextPage endCursor }
    edges { node { id handle title tags } }
  }
}
"#;

pub fn products_query_body(after: Option<&str>) -> JsonValue {
    json!({
        "query": PRODUCTS_QUERY,
        "variables": { "first": CATALOG_PAGE_SIZE, "after": after },
    })
}

/// Items on one page plus the cursor to continue from, if any.
pub fn parse_products_page(body: &JsonValue) -> Result<(Vec<CatalogItem>, Option<String>), AdapterError> {
    if let Some(errors) = body.get("errors").and_then(JsonValue::as_array) {
        if !errors.is_empty() {
            let messages = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(JsonValue::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AdapterError::Message(format!("catalog query failed: {messages}")));
        }
    }
    let products = body
        .pointer("/data/products")
        .ok_or_else(|| AdapterError::Message("catalog response missing data.products".into()))?;
    let items = products
        .get("edges")
        .and_then(JsonValue::as_array)
        .map(|edges| edges.iter().filter_map(|edge| edge.get("node")).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .map(parse_catalog_node)
        .collect::<Result<Vec<_>, _>>()?;

    let has_next = products
        .pointer("/pageInfo/hasNextPage")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let cursor = products
        .pointer("/pageInfo/endCursor")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    Ok((items, if has_next { cursor } else { None }))
}

impl CatalogGraphqlSource {
    pub fn new(
        http: Arc<HttpFetcher>,
        endpoint: impl Into<String>,
        token_header: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            token_header: token_header.into(),
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl CatalogSource for CatalogGraphqlSource {
    fn source_id(&self) -> &str {
        "catalog-graphql"
    }

    async fn fetch_catalog(&self, ctx: &AdapterContext) -> Result<SourceBatch<CatalogItem>, AdapterError> {
        let mut batch = SourceBatch::default();
        let mut after: Option<String> = None;

        for _ in 0..MAX_CATALOG_PAGES {
            let request = SourceRequest::post_json(&self.endpoint, products_query_body(after.as_deref()))
                .header(&self.token_header, &self.access_token);
            let response = self.http.send(ctx.run_id, self.source_id(), &request).await?;
            let (items, next) = parse_products_page(&response.json()?)?;
            batch.raw_pages.push(response.body);
            batch.items.extend(items);

            match next {
                Some(cursor) => after = Some(cursor),
                None => return Ok(batch),
            }
        }

        Err(AdapterError::Message(format!(
            "catalog pagination exceeded {MAX_CATALOG_PAGES} pages"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::nil(),
            fetched_at: Utc.with_ymd_and_hms(2024, 1, 31, 6, 0, 0).single().unwrap(),
        }
    }

    fn january(country: Option<&str>) -> WindowRequest {
        WindowRequest {
            days: 30,
            end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            country: country.map(str::to_string),
        }
    }

    #[test]
    fn window_is_trailing_and_inclusive() {
        let w = january(None);
        assert_eq!(w.start(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let covered = w.start().iter_days().take_while(|d| *d <= w.end).count();
        assert_eq!(covered, 31);
    }

    #[test]
    fn empty_batch_needs_no_item_default() {
        let search = SourceBatch::<RawQueryRecord>::default();
        let catalog = SourceBatch::<CatalogItem>::default();
        assert!(search.items.is_empty() && search.raw_pages.is_empty());
        assert!(catalog.items.is_empty() && catalog.raw_pages.is_empty());
    }

    #[test]
    fn graphql_config_builds_a_catalog_source() {
        std::env::set_var("COA_TEST_CATALOG_TOKEN", "shpat_test");
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let config = CatalogSourceConfig::Graphql {
            endpoint: "https://shop.example/admin/api/graphql.json".into(),
            token_header: default_token_header(),
            access_token_env: "COA_TEST_CATALOG_TOKEN".into(),
        };
        let source = catalog_source_for(&config, Path::new("."), http).unwrap();
        assert_eq!(source.source_id(), "catalog-graphql");
    }

    #[tokio::test]
    async fn search_fixture_applies_window_and_country() {
        let source = FixtureSearchSource::new(workspace_root().join("fixtures/search-console/sample.json"));

        let all = source.fetch_window(&ctx(), &january(None)).await.unwrap();
        assert_eq!(all.items.len(), 7, "november row falls outside the window");
        assert_eq!(all.raw_pages.len(), 1);

        let belgium = source.fetch_window(&ctx(), &january(Some("BEL"))).await.unwrap();
        assert_eq!(belgium.items.len(), 1);
        assert_eq!(belgium.items[0].query, "zero waste skincare");
    }

    #[tokio::test]
    async fn catalog_fixture_tolerates_malformed_tags() {
        let source = FixtureCatalogSource::new(workspace_root().join("fixtures/catalog/sample.json"));
        let batch = source.fetch_catalog(&ctx()).await.unwrap();
        assert_eq!(batch.items.len(), 4);
        assert_eq!(batch.items[0].tags.len(), 2);
        assert!(batch.items[1].tags.is_empty(), "comma string is not a tag list");
        assert!(batch.items[2].tags.is_empty(), "mixed array is not a tag list");
    }

    #[test]
    fn search_row_parsing_rejects_missing_keys() {
        let body = json!({"rows": [{"keys": ["q"], "clicks": 1, "impressions": 2, "ctr": 0.5, "position": 3.0}]});
        let err = parse_search_analytics(&body).unwrap_err();
        assert!(err.to_string().contains("row 0"));
        assert!(parse_search_analytics(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn search_body_carries_window_and_country_filter() {
        let body = search_analytics_body(&january(Some("NLD")), 25_000);
        assert_eq!(body["startDate"], "2024-01-01");
        assert_eq!(body["endDate"], "2024-01-31");
        assert_eq!(body["startRow"], 25_000);
        assert_eq!(
            body["dimensionFilterGroups"][0]["filters"][0]["expression"],
            "nld"
        );
    }

    #[test]
    fn query_url_escapes_site_property() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let source = SearchConsoleSource::new(http, "https://shop.example/", "token");
        let url = source.query_url().unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/webmasters/v3/sites/https:%2F%2Fshop.example%2F/searchAnalytics/query"
        );
    }

    #[test]
    fn products_page_yields_cursor_only_when_more_pages() {
        let body = json!({
            "data": {"products": {
                "pageInfo": {"hasNextPage": true, "endCursor": "abc"},
                "edges": [{"node": {"id": "gid://shopify/Product/1", "handle": "soap", "title": "Soap", "tags": ["vegan"]}}]
            }}
        });
        let (items, next) = parse_products_page(&body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(next.as_deref(), Some("abc"));

        let last = json!({"data": {"products": {"pageInfo": {"hasNextPage": false, "endCursor": "zzz"}, "edges": []}}});
        assert_eq!(parse_products_page(&last).unwrap().1, None);
    }

    #[test]
    fn graphql_errors_surface() {
        let body = json!({"errors": [{"message": "Throttled"}]});
        let err = parse_products_page(&body).unwrap_err();
        assert!(err.to_string().contains("Throttled"));
    }

    #[test]
    fn missing_credentials_are_reported() {
        let config = CatalogSourceConfig::Graphql {
            endpoint: "https://example.test/graphql.json".into(),
            token_header: default_token_header(),
            access_token_env: "COA_TEST_TOKEN_THAT_IS_NEVER_SET".into(),
        };
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let err = catalog_source_for(&config, Path::new("."), http).err().unwrap();
        assert!(matches!(err, AdapterError::MissingCredential(_)));
    }

    #[test]
    fn source_config_reads_from_yaml_shape() {
        let config: SearchSourceConfig =
            serde_json::from_value(json!({"kind": "search_console", "site_url": "sc-domain:x.test", "access_token_env": "T"}))
                .unwrap();
        assert!(matches!(config, SearchSourceConfig::SearchConsole { ref api_base, .. } if api_base.contains("webmasters")));
    }
}
