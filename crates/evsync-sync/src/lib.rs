//! Sync pipeline: expand the search plan, page through each search, collapse
//! duplicates and upsert the result in fixed-size batches.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_adapters::{
    adapter_for_api, AdapterError, SearchAdapter, SearchApi, KM_PER_MILE, MAX_PAGE_SIZE, SELF_QUERY,
    TYPE_INTROSPECTION_QUERY,
};
use evsync_core::{EventRow, GeoFilter, SearchPage, SearchSpec};
use evsync_storage::{
    EventSink, GraphqlClient, HttpClientConfig, PgEventStore, RestTableSink, TableRef, UniversityDirectory,
    UniversityRow, DEFAULT_TABLE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evsync-sync";

pub const DEFAULT_SEARCHES_PATH: &str = "searches.yaml";
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// 21 bound columns per row keeps a batch of this size well under Postgres'
/// 65535 parameter limit.
pub const MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const DEFAULT_USER_AGENT: &str = "evsync/0.1";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
/// Ten miles around each campus.
pub const DEFAULT_UNIVERSITY_RADIUS_KM: f64 = 10.0 * KM_PER_MILE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    /// Supabase's PostgREST interface.
    Rest { url: String, service_key: String },
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_token: String,
    pub endpoint: Option<String>,
    pub sink: Option<SinkConfig>,
    pub table: String,
    pub batch_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub searches_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env(require_sink: bool) -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok(), require_sink)
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    /// Every missing name is reported at once.
    pub fn from_vars(
        lookup: impl Fn(&str) -> Option<String>,
        require_sink: bool,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        let api_token = var("MEETUP_API_TOKEN");
        if api_token.is_none() {
            missing.push("MEETUP_API_TOKEN");
        }

        let sink = match (var("SUPABASE_URL"), var("SUPABASE_SERVICE_ROLE_KEY"), var("DATABASE_URL")) {
            (Some(url), Some(service_key), _) => Some(SinkConfig::Rest { url, service_key }),
            (_, _, Some(database_url)) => Some(SinkConfig::Postgres { database_url }),
            (url, key, None) => {
                if require_sink {
                    if url.is_none() {
                        missing.push("SUPABASE_URL");
                    }
                    if key.is_none() {
                        missing.push("SUPABASE_SERVICE_ROLE_KEY");
                    }
                    missing.push("DATABASE_URL");
                }
                None
            }
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Ok(Self {
            api_token: api_token.unwrap_or_default(),
            endpoint: var("MEETUP_API_ENDPOINT"),
            sink,
            table: var("EVSYNC_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            batch_size: var("EVSYNC_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE)
                .clamp(1, MAX_BATCH_SIZE),
            http_timeout_secs: var("EVSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)
                .max(1),
            user_agent: var("EVSYNC_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            searches_path: var("EVSYNC_SEARCHES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SEARCHES_PATH)),
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn graphql_client(&self, api: SearchApi) -> Result<GraphqlClient> {
        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| api.default_endpoint().to_string());
        GraphqlClient::new(self.http_config(), endpoint, self.api_token.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationConfig {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UniversityPlan {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default = "default_university_radius_km")]
    pub radius_km: f64,
    /// Topic for every campus search; unset searches everything nearby.
    #[serde(default)]
    pub query: Option<String>,
}

fn default_university_radius_km() -> f64 {
    DEFAULT_UNIVERSITY_RADIUS_KM
}

fn default_api() -> SearchApi {
    SearchApi::KeywordSearch
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

/// What to search for on each run, read from `searches.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchPlan {
    #[serde(default = "default_api")]
    pub api: SearchApi,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
    #[serde(default)]
    pub global_topics: Vec<String>,
    #[serde(default)]
    pub universities: Option<UniversityPlan>,
}

impl SearchPlan {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn university_plan(&self) -> Option<&UniversityPlan> {
        self.universities.as_ref().filter(|u| u.enabled)
    }

    /// Locations crossed with their topics, location-only searches for
    /// locations without topics, then global topics, then campuses.
    pub fn expand(&self, universities: &[UniversityRow]) -> Vec<SearchSpec> {
        let mut specs = Vec::new();
        for location in &self.locations {
            let geo = GeoFilter {
                lat: location.lat,
                lon: location.lon,
                radius_km: location.radius_km,
            };
            if location.topics.is_empty() {
                specs.push(SearchSpec::located(&location.name, None, geo));
            }
            for topic in &location.topics {
                specs.push(SearchSpec::located(&location.name, Some(topic.clone()), geo));
            }
        }

        specs.extend(self.global_topics.iter().map(SearchSpec::topic));

        if let Some(plan) = self.university_plan() {
            for university in universities {
                let geo = GeoFilter {
                    lat: university.latitude,
                    lon: university.longitude,
                    radius_km: plan.radius_km,
                };
                specs.push(SearchSpec::located(&university.name, plan.query.clone(), geo));
            }
        }
        specs
    }
}

/// One page of results for a search.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_page(
        &self,
        spec: &SearchSpec,
        after: Option<&str>,
        page_size: u32,
    ) -> Result<SearchPage, AdapterError>;
}

pub struct GraphqlEventSource {
    client: GraphqlClient,
    adapter: Box<dyn SearchAdapter>,
}

impl GraphqlEventSource {
    pub fn new(client: GraphqlClient, api: SearchApi) -> Self {
        let adapter = adapter_for_api(api);
        info!(endpoint = client.endpoint(), api = ?adapter.api(), "using search endpoint");
        Self { client, adapter }
    }
}

#[async_trait]
impl EventSource for GraphqlEventSource {
    async fn fetch_page(
        &self,
        spec: &SearchSpec,
        after: Option<&str>,
        page_size: u32,
    ) -> Result<SearchPage, AdapterError> {
        self.adapter.fetch_page(&self.client, spec, after, page_size).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub rows: Vec<EventRow>,
    pub pages: u32,
    /// A page request failed; rows from earlier pages are still in `rows`.
    pub aborted: bool,
    pub hit_page_cap: bool,
}

/// Follow the cursor until the API runs out of pages or `max_pages` is hit.
pub async fn paginate<S>(source: &S, spec: &SearchSpec, page_size: u32, max_pages: u32) -> SearchOutcome
where
    S: EventSource + ?Sized,
{
    let span = info_span!("search", search = %spec.label);
    async move {
        let mut outcome = SearchOutcome::default();
        let mut cursor: Option<String> = None;

        while outcome.pages < max_pages {
            let page = match source.fetch_page(spec, cursor.as_deref(), page_size).await {
                Ok(page) => page,
                Err(err) => {
                    error!(page = outcome.pages + 1, error = %err, "search aborted");
                    outcome.aborted = true;
                    return outcome;
                }
            };
            outcome.pages += 1;
            info!(
                page = outcome.pages,
                edges = page.edge_count,
                events = page.rows.len(),
                "fetched page"
            );

            let next = page.next_cursor().map(ToString::to_string);
            outcome.rows.extend(page.rows);
            match next {
                Some(next) => cursor = Some(next),
                None => return outcome,
            }
        }

        if outcome.pages > 0 {
            warn!(max_pages, "page cap reached with more results available");
            outcome.hit_page_cap = true;
        }
        outcome
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub rows: Vec<EventRow>,
    pub total: usize,
    pub unique: usize,
    pub duplicates_removed: usize,
}

/// Collapse rows sharing an id. The last row seen wins but keeps the position
/// of the first.
pub fn dedupe_by_id(rows: Vec<EventRow>) -> DedupOutcome {
    let total = rows.len();
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(total);
    let mut unique: Vec<EventRow> = Vec::with_capacity(total);

    for row in rows {
        match positions.get(&row.id) {
            Some(&idx) => unique[idx] = row,
            None => {
                positions.insert(row.id.clone(), unique.len());
                unique.push(row);
            }
        }
    }

    let count = unique.len();
    DedupOutcome {
        rows: unique,
        total,
        unique: count,
        duplicates_removed: total - count,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub rows_upserted: usize,
    pub rows_failed: usize,
}

pub async fn upsert_in_batches<S>(sink: &S, rows: &[EventRow], batch_size: usize) -> UpsertReport
where
    S: EventSink + ?Sized,
{
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
    let batches = rows.len().div_ceil(batch_size);
    let mut report = UpsertReport::default();

    for (idx, batch) in rows.chunks(batch_size).enumerate() {
        match sink.upsert_batch(batch).await {
            Ok(()) => {
                report.batches_ok += 1;
                report.rows_upserted += batch.len();
                info!(sink = sink.name(), batch = idx + 1, batches, rows = batch.len(), "upserted batch");
            }
            Err(err) => {
                report.batches_failed += 1;
                report.rows_failed += batch.len();
                error!(sink = sink.name(), batch = idx + 1, batches, error = %err, "batch upsert failed");
            }
        }
    }
    report
}

/// Newest first; rows without a start time go last.
pub fn sort_newest_first(rows: &mut [EventRow]) {
    rows.sort_by(|a, b| match (&a.date_time, &b.date_time) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sink: String,
    pub searches: usize,
    pub searches_aborted: usize,
    pub searches_capped: usize,
    pub fetched: usize,
    pub unique: usize,
    pub duplicates_removed: usize,
    #[serde(flatten)]
    pub upsert: UpsertReport,
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub searches: usize,
    pub searches_aborted: usize,
    pub searches_capped: usize,
    pub dedup: DedupOutcome,
}

pub struct SyncPipeline {
    plan: SearchPlan,
    source: Box<dyn EventSource>,
    sink: Option<Arc<dyn EventSink>>,
    universities: Option<Arc<dyn UniversityDirectory>>,
    batch_size: usize,
}

impl SyncPipeline {
    pub fn new(plan: SearchPlan, source: Box<dyn EventSource>) -> Self {
        Self {
            plan,
            source,
            sink: None,
            universities: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_university_directory(mut self, directory: Arc<dyn UniversityDirectory>) -> Self {
        self.universities = Some(directory);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Wire the live GraphQL source and, when configured, the storage
    /// backend. The backend also serves the university list.
    pub async fn from_config(config: &SyncConfig, plan: SearchPlan) -> Result<Self> {
        let client = config.graphql_client(plan.api)?;
        let source = GraphqlEventSource::new(client, plan.api);
        let mut pipeline = Self::new(plan, Box::new(source)).with_batch_size(config.batch_size);

        let Some(sink_config) = &config.sink else {
            return Ok(pipeline);
        };
        let table = TableRef::parse(&config.table).context("invalid EVSYNC_TABLE")?;
        match sink_config {
            SinkConfig::Rest { url, service_key } => {
                let sink = Arc::new(RestTableSink::new(config.http_config(), url, service_key.clone(), table)?);
                pipeline.sink = Some(sink.clone());
                pipeline.universities = Some(sink);
            }
            SinkConfig::Postgres { database_url } => {
                let store = PgEventStore::connect_lazy(
                    database_url,
                    table,
                    Duration::from_secs(config.http_timeout_secs),
                )
                .context("invalid DATABASE_URL")?;
                let store = Arc::new(store);
                pipeline.sink = Some(store.clone());
                pipeline.universities = Some(store);
            }
        }
        Ok(pipeline)
    }

    async fn resolve_searches(&self) -> Result<Vec<SearchSpec>> {
        let universities = match self.plan.university_plan() {
            Some(plan) => {
                let directory = self
                    .universities
                    .as_ref()
                    .ok_or(ConfigError::Missing(vec!["SUPABASE_URL", "SUPABASE_SERVICE_ROLE_KEY", "DATABASE_URL"]))
                    .context("university searches need a database connection")?;
                let rows = directory
                    .active_universities(plan.limit)
                    .await
                    .context("loading active universities")?;
                if rows.is_empty() {
                    warn!("no active universities found");
                }
                info!(count = rows.len(), "loaded universities");
                rows
            }
            None => Vec::new(),
        };
        Ok(self.plan.expand(&universities))
    }

    async fn collect(&self) -> Result<FetchReport> {
        let searches = self.resolve_searches().await?;
        let page_size = self.plan.effective_page_size();
        info!(searches = searches.len(), page_size, max_pages = self.plan.max_pages, "starting searches");

        let mut rows = Vec::new();
        let mut aborted = 0usize;
        let mut capped = 0usize;
        for spec in &searches {
            let outcome = paginate(self.source.as_ref(), spec, page_size, self.plan.max_pages).await;
            if outcome.aborted {
                aborted += 1;
            }
            if outcome.hit_page_cap {
                capped += 1;
            }
            info!(search = %spec.label, events = outcome.rows.len(), pages = outcome.pages, "search finished");
            rows.extend(outcome.rows);
        }

        let dedup = dedupe_by_id(rows);
        info!(
            total = dedup.total,
            unique = dedup.unique,
            duplicates_removed = dedup.duplicates_removed,
            "deduplicated events"
        );
        Ok(FetchReport {
            searches: searches.len(),
            searches_aborted: aborted,
            searches_capped: capped,
            dedup,
        })
    }

    /// Search and deduplicate without writing anything. Rows come back
    /// newest first.
    pub async fn fetch_only(&self) -> Result<FetchReport> {
        let mut report = self.collect().await?;
        sort_newest_first(&mut report.dedup.rows);
        Ok(report)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let sink = self
            .sink
            .clone()
            .ok_or(ConfigError::Missing(vec!["SUPABASE_URL", "SUPABASE_SERVICE_ROLE_KEY", "DATABASE_URL"]))?;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, sink = sink.name());

        async move {
            let report = self.collect().await?;
            let upsert = if report.dedup.rows.is_empty() {
                warn!("no events to upsert");
                UpsertReport::default()
            } else {
                upsert_in_batches(sink.as_ref(), &report.dedup.rows, self.batch_size).await
            };

            Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                sink: sink.name().to_string(),
                searches: report.searches,
                searches_aborted: report.searches_aborted,
                searches_capped: report.searches_capped,
                fetched: report.dedup.total,
                unique: report.dedup.unique,
                duplicates_removed: report.dedup.duplicates_removed,
                upsert,
            })
        }
        .instrument(span)
        .await
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env(true)?;
    let plan = SearchPlan::load(&config.searches_path).await?;
    let pipeline = SyncPipeline::from_config(&config, plan).await?;
    pipeline.run_once().await
}

pub async fn fetch_events_from_env() -> Result<FetchReport> {
    let config = SyncConfig::from_env(false)?;
    let plan = SearchPlan::load(&config.searches_path).await?;
    let pipeline = SyncPipeline::from_config(&config, plan).await?;
    pipeline.fetch_only().await
}

/// Identity of the token owner. Uses the extended endpoint unless one is
/// configured.
pub async fn check_token_from_env() -> Result<JsonValue> {
    let config = SyncConfig::from_env(false)?;
    let client = config.graphql_client(SearchApi::EventSearch)?;
    info!(endpoint = client.endpoint(), "checking token");
    client
        .execute(SELF_QUERY, &serde_json::json!({}))
        .await
        .context("token check failed")
}

pub async fn inspect_type_from_env(type_name: &str) -> Result<JsonValue> {
    let config = SyncConfig::from_env(false)?;
    let client = config.graphql_client(SearchApi::EventSearch)?;
    client
        .execute(TYPE_INTROSPECTION_QUERY, &serde_json::json!({ "name": type_name }))
        .await
        .with_context(|| format!("introspecting type {type_name}"))
}
