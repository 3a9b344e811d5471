//! Opportunity persistence, source payload archive and the shared HTTP client.

pub mod archive;
pub mod http;
pub mod postgres;
pub mod store;

pub use archive::{ArchivedSnapshot, SnapshotArchive};
pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, SourceRequest,
    TokenBucketConfig,
};
pub use postgres::{connect, run_migrations, PgOpportunityStore};
pub use store::{
    ListOrder, ListQuery, MemoryOpportunityStore, OpportunityStore, StatusPolicy, StoreError,
    UpsertOutcome, UpsertReport, DEFAULT_LIST_LIMIT,
};

pub const CRATE_NAME: &str = "coa-storage";
