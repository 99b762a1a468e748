//! GraphQL transport plus the table sinks that event rows are upserted into.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use evsync_core::EventRow;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "evsync-storage";

pub const DEFAULT_TABLE: &str = "meetup_events";
pub const UNIVERSITY_SCHEMA: &str = "staging_meetup";
pub const UNIVERSITY_TABLE: &str = "feed_source_university";

/// Longest response body kept in an error message.
const ERROR_BODY_LIMIT: usize = 500;

/// Column order used by every write path. `id` is the conflict target.
pub const EVENT_COLUMNS: [&str; 21] = [
    "id",
    "title",
    "description",
    "short_description",
    "event_url",
    "date_time",
    "going",
    "group_id",
    "group_name",
    "group_urlname",
    "venue_name",
    "venue_city",
    "venue_state",
    "venue_country",
    "venue_lat",
    "venue_lon",
    "topic_keyword",
    "search_lat",
    "search_lon",
    "search_radius_km",
    "raw_event",
];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= ERROR_BODY_LIMIT {
        return text.into_owned();
    }
    let mut cut = text.chars().take(ERROR_BODY_LIMIT).collect::<String>();
    cut.push('…');
    cut
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("failed to parse JSON response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("GraphQL errors: {0}")]
    GraphQl(String),
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Option<Vec<JsonValue>>,
}

/// Decode a GraphQL response body. Any `errors` entry fails the whole
/// response, even when partial `data` came back. A missing `data` field
/// decodes to `Null`.
pub fn decode_graphql_body(body: &[u8]) -> Result<JsonValue, FetchError> {
    let envelope: GraphqlEnvelope = serde_json::from_slice(body)?;
    if let Some(errors) = envelope.errors {
        let messages = errors
            .iter()
            .map(|err| {
                err.get("message")
                    .and_then(JsonValue::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| err.to_string())
            })
            .collect::<Vec<_>>();
        return Err(FetchError::GraphQl(messages.join("; ")));
    }
    Ok(envelope.data.unwrap_or(JsonValue::Null))
}

/// Bearer-authenticated GraphQL client. One request per call, no retries.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GraphqlClient {
    pub fn new(
        config: HttpClientConfig,
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(&config)?,
            endpoint: endpoint.into(),
            token: token.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `{query, variables}` and return the `data` member.
    pub async fn execute(&self, query: &str, variables: &JsonValue) -> Result<JsonValue, FetchError> {
        let span = info_span!("graphql_query", endpoint = %self.endpoint);
        async {
            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.token)
                .json(&serde_json::json!({
                    "query": query,
                    "variables": variables,
                }))
                .send()
                .await?;

            let status = resp.status();
            let url = resp.url().to_string();
            let body = resp.bytes().await?;

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                    body: truncate_body(&body),
                });
            }

            decode_graphql_body(&body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("failed to parse JSON response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),
}

/// Destination for normalized rows. Each call writes one batch; the caller
/// decides what to do when it fails.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert_batch(&self, rows: &[EventRow]) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversityRow {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Unvalidated university record as read from either backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawUniversity {
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl RawUniversity {
    fn from_json(value: &JsonValue) -> Self {
        let number = |key: &str| match value.get(key) {
            Some(JsonValue::Number(n)) => n.as_f64(),
            Some(JsonValue::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        Self {
            name: value
                .get("name")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
            latitude: number("latitude"),
            longitude: number("longitude"),
        }
    }
}

/// Keep records with a non-empty name and both coordinates.
pub fn validate_universities(raw: Vec<RawUniversity>) -> Vec<UniversityRow> {
    raw.into_iter()
        .filter_map(|record| match (&record.name, record.latitude, record.longitude) {
            (Some(name), Some(latitude), Some(longitude)) if !name.trim().is_empty() => {
                Some(UniversityRow {
                    name: name.clone(),
                    latitude,
                    longitude,
                })
            }
            _ => {
                warn!(?record, "skipping university with missing data");
                None
            }
        })
        .collect()
}

/// Source of search locations kept in the database.
#[async_trait]
pub trait UniversityDirectory: Send + Sync {
    async fn active_universities(&self, limit: Option<u32>) -> Result<Vec<UniversityRow>, SinkError>;
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Table name, optionally schema-qualified (`schema.table`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn parse(input: &str) -> Result<Self, SinkError> {
        let invalid = || SinkError::InvalidIdentifier(input.to_string());
        let parts = input.trim().split('.').collect::<Vec<_>>();
        let (schema, name) = match parts.as_slice() {
            [name] => (None, *name),
            [schema, name] => (Some(*schema), *name),
            _ => return Err(invalid()),
        };
        if !is_plain_identifier(name) || !schema.map(is_plain_identifier).unwrap_or(true) {
            return Err(invalid());
        }
        Ok(Self {
            schema: schema.map(ToString::to_string),
            name: name.to_string(),
        })
    }

    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Upsert client for a PostgREST front end (Supabase's REST interface).
#[derive(Debug, Clone)]
pub struct RestTableSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    table: TableRef,
}

impl RestTableSink {
    pub fn new(
        config: HttpClientConfig,
        base_url: &str,
        api_key: impl Into<String>,
        table: TableRef,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(&config)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            table,
        })
    }

    pub fn upsert_url(&self) -> String {
        format!("{}/rest/v1/{}?on_conflict=id", self.base_url, self.table.name)
    }

    pub fn universities_url(&self, limit: Option<u32>) -> String {
        let mut url = format!(
            "{}/rest/v1/{UNIVERSITY_TABLE}?select=name,latitude,longitude&status=eq.active",
            self.base_url
        );
        if let Some(limit) = limit {
            url.push_str(&format!("&limit={limit}"));
        }
        url
    }

    fn auth_headers(&self) -> Result<HeaderMap, SinkError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&self.api_key).map_err(|_| SinkError::InvalidHeader("apikey"))?,
        );
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| SinkError::InvalidHeader("authorization"))?,
        );
        Ok(headers)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body = resp.bytes().await?;
        Err(SinkError::HttpStatus {
            status: status.as_u16(),
            url,
            body: truncate_body(&body),
        })
    }
}

#[async_trait]
impl EventSink for RestTableSink {
    fn name(&self) -> &'static str {
        "postgrest"
    }

    async fn upsert_batch(&self, rows: &[EventRow]) -> Result<(), SinkError> {
        let mut headers = self.auth_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "prefer",
            HeaderValue::from_static("resolution=merge-duplicates,return=minimal"),
        );
        if let Some(schema) = &self.table.schema {
            headers.insert(
                "content-profile",
                HeaderValue::from_str(schema).map_err(|_| SinkError::InvalidHeader("content-profile"))?,
            );
        }

        let resp = self
            .client
            .post(self.upsert_url())
            .headers(headers)
            .json(rows)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl UniversityDirectory for RestTableSink {
    async fn active_universities(&self, limit: Option<u32>) -> Result<Vec<UniversityRow>, SinkError> {
        let mut headers = self.auth_headers()?;
        headers.insert("accept-profile", HeaderValue::from_static(UNIVERSITY_SCHEMA));

        let resp = self
            .client
            .get(self.universities_url(limit))
            .headers(headers)
            .send()
            .await?;
        let body = Self::check_status(resp).await?.bytes().await?;
        let records: Vec<JsonValue> = serde_json::from_slice(&body)?;
        Ok(validate_universities(
            records.iter().map(RawUniversity::from_json).collect(),
        ))
    }
}

/// Build the multi-row upsert statement for one batch. Re-running it with the
/// same rows leaves the table unchanged. `updated_at` is left to the table's
/// trigger so both sinks record it the same way.
pub fn build_upsert_query(table: &TableRef, rows: &[EventRow]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {} ({}) ",
        table.qualified(),
        EVENT_COLUMNS.join(", ")
    ));
    qb.push_values(rows.iter().cloned(), |mut b, row| {
        b.push_bind(row.id)
            .push_bind(row.title)
            .push_bind(row.description)
            .push_bind(row.short_description)
            .push_bind(row.event_url)
            .push_bind(row.date_time.map(|dt| dt.with_timezone(&Utc)))
            .push_bind(row.going)
            .push_bind(row.group_id)
            .push_bind(row.group_name)
            .push_bind(row.group_urlname)
            .push_bind(row.venue_name)
            .push_bind(row.venue_city)
            .push_bind(row.venue_state)
            .push_bind(row.venue_country)
            .push_bind(row.venue_lat)
            .push_bind(row.venue_lon)
            .push_bind(row.topic_keyword)
            .push_bind(row.search_lat)
            .push_bind(row.search_lon)
            .push_bind(row.search_radius_km)
            .push_bind(sqlx::types::Json(row.raw_event));
    });
    let updates = EVENT_COLUMNS
        .iter()
        .skip(1)
        .map(|col| format!("{col} = EXCLUDED.{col}"))
        .collect::<Vec<_>>()
        .join(", ");
    qb.push(format!(" ON CONFLICT (id) DO UPDATE SET {updates}"));
    qb
}

/// Direct Postgres writer. The pool holds a single connection since the
/// pipeline never issues concurrent statements.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
    table: TableRef,
}

/// Parse `database_url` and bound every statement on the session with
/// `statement_timeout`.
pub fn pg_connect_options(
    database_url: &str,
    statement_timeout: Duration,
) -> Result<PgConnectOptions, SinkError> {
    let options: PgConnectOptions = database_url.parse()?;
    Ok(options.options([(
        "statement_timeout",
        statement_timeout.as_millis().to_string(),
    )]))
}

impl PgEventStore {
    /// Set up the pool without opening a connection. The first upsert or
    /// university lookup connects, so commands that never touch the table
    /// never need the database.
    pub fn connect_lazy(database_url: &str, table: TableRef, timeout: Duration) -> Result<Self, SinkError> {
        let options = pg_connect_options(database_url, timeout)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect_lazy_with(options);
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl EventSink for PgEventStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_batch(&self, rows: &[EventRow]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        build_upsert_query(&self.table, rows)
            .build()
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UniversityDirectory for PgEventStore {
    async fn active_universities(&self, limit: Option<u32>) -> Result<Vec<UniversityRow>, SinkError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT name, latitude::float8 AS latitude, longitude::float8 AS longitude \
             FROM {UNIVERSITY_SCHEMA}.{UNIVERSITY_TABLE} WHERE status = 'active'"
        ));
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        let raw = rows
            .iter()
            .map(|r| -> Result<RawUniversity, sqlx::Error> {
                Ok(RawUniversity {
                    name: r.try_get("name")?,
                    latitude: r.try_get("latitude")?,
                    longitude: r.try_get("longitude")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(validate_universities(raw))
    }
}
