//! GraphQL search dialects + fixture-backed parsing into event rows.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use evsync_core::{EventRow, SearchContext, SearchPage, SearchSpec};
use evsync_storage::{FetchError, GraphqlClient};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "evsync-adapters";

pub const KM_PER_MILE: f64 = 1.609344;

/// The event-search endpoint silently caps radii above this.
pub const MAX_RADIUS_MILES: f64 = 100.0;

/// Largest page the API will return.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchApi {
    /// `keywordSearch` on `/gql`; radius in km.
    KeywordSearch,
    /// `eventSearch` on `/gql-ext`; radius in miles.
    EventSearch,
}

impl SearchApi {
    pub fn default_endpoint(self) -> &'static str {
        match self {
            SearchApi::KeywordSearch => "https://api.meetup.com/gql",
            SearchApi::EventSearch => "https://api.meetup.com/gql-ext",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

#[async_trait]
pub trait SearchAdapter: Send + Sync {
    fn api(&self) -> SearchApi;

    fn query(&self) -> &'static str;

    fn variables(&self, spec: &SearchSpec, after: Option<&str>, page_size: u32) -> JsonValue;

    fn parse_page(&self, data: &JsonValue, spec: &SearchSpec) -> Result<SearchPage, AdapterError>;

    async fn fetch_page(
        &self,
        http: &GraphqlClient,
        spec: &SearchSpec,
        after: Option<&str>,
        page_size: u32,
    ) -> Result<SearchPage, AdapterError> {
        let variables = self.variables(spec, after, page_size);
        let data = http.execute(self.query(), &variables).await?;
        self.parse_page(&data, spec)
    }
}

const KEYWORD_SEARCH_QUERY: &str = r#"
query($filter: SearchConnectionFilter!, $first: Int, $after: String) {
  keywordSearch(filter: $filter, input: {first: $first, after: $after}) {
    count
    pageInfo {
      hasNextPage
      endCursor
    }
    edges {
      cursor
      node {
        id
        result {
          ... on Event {
            id
            title
            eventUrl
            description
            shortDescription
            dateTime
            going
            group {
              id
              name
              urlname
            }
            venue {
              name
              lat
              lon
              city
              state
              country
            }
          }
        }
      }
    }
  }
}
"#;

const EVENT_SEARCH_QUERY: &str = r#"
query($filter: EventSearchFilter!, $first: Int, $after: String) {
  eventSearch(filter: $filter, first: $first, after: $after) {
    pageInfo {
      hasNextPage
      endCursor
    }
    edges {
      cursor
      node {
        id
        title
        eventUrl
        description
        dateTime
        eventType
        featuredEventPhoto {
          id
          baseUrl
        }
        group {
          id
          name
          urlname
          keyGroupPhoto {
            id
            baseUrl
          }
        }
        venues {
          name
          lat
          lon
          city
          state
          country
        }
      }
    }
  }
}
"#;

/// Identity of the token owner; a cheap probe that the token works.
pub const SELF_QUERY: &str = "{ self { id name } }";

pub const TYPE_INTROSPECTION_QUERY: &str = r#"
query($name: String!) {
  __type(name: $name) {
    name
    kind
    fields {
      name
      type { name kind ofType { name kind } }
    }
    inputFields {
      name
      type { name kind ofType { name kind } }
    }
  }
}
"#;

#[derive(Debug, Clone, Copy, Default)]
struct KeywordSearchAdapter;

#[derive(Debug, Clone, Copy, Default)]
struct EventSearchAdapter;

pub fn keyword_search_adapter() -> impl SearchAdapter {
    KeywordSearchAdapter
}

pub fn event_search_adapter() -> impl SearchAdapter {
    EventSearchAdapter
}

pub fn adapter_for_api(api: SearchApi) -> Box<dyn SearchAdapter> {
    match api {
        SearchApi::KeywordSearch => Box::new(KeywordSearchAdapter),
        SearchApi::EventSearch => Box::new(EventSearchAdapter),
    }
}

/// Radius to send to the event-search API, in miles, and whether it had to be
/// capped.
pub fn event_search_radius_miles(radius_km: f64) -> (f64, bool) {
    let miles = radius_km / KM_PER_MILE;
    if miles > MAX_RADIUS_MILES {
        (MAX_RADIUS_MILES, true)
    } else {
        (miles, false)
    }
}

/// Accepts RFC 3339 as well as the API's minute-precision form
/// (`2024-03-01T18:00-08:00`). Anything else yields `None`.
pub fn parse_event_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    let value = match value.strip_suffix('Z') {
        Some(prefix) => format!("{prefix}+00:00"),
        None => value.to_string(),
    };
    DateTime::parse_from_rfc3339(&value)
        .ok()
        .or_else(|| DateTime::parse_from_str(&value, "%Y-%m-%dT%H:%M%:z").ok())
}

fn json_str(value: &JsonValue, key: &str) -> Option<String> {
    value.get(key)?.as_str().map(ToString::to_string)
}

fn json_f64(value: &JsonValue, key: &str) -> Option<f64> {
    value.get(key)?.as_f64()
}

fn non_empty_object(value: Option<&JsonValue>) -> Option<&JsonValue> {
    value.filter(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(false))
}

/// Build a row from one raw event object. Returns `None` when the event has
/// no usable id.
pub fn normalize_event(
    event: &JsonValue,
    venue: Option<&JsonValue>,
    topic_keyword: Option<&str>,
    context: SearchContext,
) -> Option<EventRow> {
    let id = json_str(event, "id").filter(|id| !id.is_empty())?;
    let group = event.get("group").filter(|g| g.is_object());
    let venue = venue.filter(|v| v.is_object());
    let from_group = |key: &str| group.and_then(|g| json_str(g, key));
    let from_venue = |key: &str| venue.and_then(|v| json_str(v, key));
    let venue_f64 = |key: &str| venue.and_then(|v| json_f64(v, key));

    let mut row = EventRow {
        id,
        title: json_str(event, "title").unwrap_or_default(),
        description: json_str(event, "description"),
        short_description: json_str(event, "shortDescription"),
        event_url: json_str(event, "eventUrl"),
        date_time: event
            .get("dateTime")
            .and_then(JsonValue::as_str)
            .and_then(parse_event_datetime),
        going: event.get("going").and_then(JsonValue::as_i64),
        group_id: from_group("id"),
        group_name: from_group("name"),
        group_urlname: from_group("urlname"),
        venue_name: from_venue("name"),
        venue_city: from_venue("city"),
        venue_state: from_venue("state"),
        venue_country: from_venue("country"),
        venue_lat: venue_f64("lat"),
        venue_lon: venue_f64("lon"),
        topic_keyword: topic_keyword.map(ToString::to_string),
        search_lat: None,
        search_lon: None,
        search_radius_km: None,
        raw_event: event.clone(),
    };
    row.apply_context(context);
    Some(row)
}

struct ConnectionShape {
    root: &'static str,
    event: fn(&JsonValue) -> Option<&JsonValue>,
    venue: fn(&JsonValue) -> Option<&JsonValue>,
}

fn parse_connection(
    data: &JsonValue,
    shape: &ConnectionShape,
    spec: &SearchSpec,
    context: SearchContext,
) -> Result<SearchPage, AdapterError> {
    let Some(connection) = data.get(shape.root).filter(|c| !c.is_null()) else {
        return Ok(SearchPage::default());
    };
    if !connection.is_object() {
        return Err(AdapterError::Shape(format!("`{}` is not an object", shape.root)));
    }

    let edges = match connection.get("edges") {
        None | Some(JsonValue::Null) => &[][..],
        Some(JsonValue::Array(edges)) => edges.as_slice(),
        Some(_) => {
            return Err(AdapterError::Shape(format!("`{}.edges` is not a list", shape.root)));
        }
    };

    let rows = edges
        .iter()
        .filter_map(|edge| edge.get("node"))
        .filter_map(|node| {
            let event = (shape.event)(node)?;
            normalize_event(event, (shape.venue)(event), spec.keyword.as_deref(), context)
        })
        .collect();

    let page_info = connection.get("pageInfo");
    Ok(SearchPage {
        rows,
        edge_count: edges.len(),
        has_next_page: page_info
            .and_then(|p| p.get("hasNextPage"))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
        end_cursor: page_info.and_then(|p| json_str(p, "endCursor")),
    })
}

// Keyword search wraps each hit in a `result` union; non-event members come
// back as empty objects.
fn keyword_event(node: &JsonValue) -> Option<&JsonValue> {
    non_empty_object(node.get("result"))
}

fn keyword_venue(event: &JsonValue) -> Option<&JsonValue> {
    event.get("venue")
}

fn event_search_event(node: &JsonValue) -> Option<&JsonValue> {
    non_empty_object(Some(node))
}

fn event_search_venue(event: &JsonValue) -> Option<&JsonValue> {
    event.get("venues").and_then(|v| v.get(0))
}

impl KeywordSearchAdapter {
    const SHAPE: ConnectionShape = ConnectionShape {
        root: "keywordSearch",
        event: keyword_event,
        venue: keyword_venue,
    };
}

impl EventSearchAdapter {
    const SHAPE: ConnectionShape = ConnectionShape {
        root: "eventSearch",
        event: event_search_event,
        venue: event_search_venue,
    };

    /// Radius in miles for the request plus the radius actually searched, in km.
    fn radius(spec: &SearchSpec) -> Option<(f64, f64)> {
        let geo = spec.location.as_ref()?;
        let (miles, capped) = event_search_radius_miles(geo.radius_km);
        let effective_km = if capped {
            miles * KM_PER_MILE
        } else {
            geo.radius_km
        };
        Some((miles, effective_km))
    }
}

#[async_trait]
impl SearchAdapter for KeywordSearchAdapter {
    fn api(&self) -> SearchApi {
        SearchApi::KeywordSearch
    }

    fn query(&self) -> &'static str {
        KEYWORD_SEARCH_QUERY
    }

    fn variables(&self, spec: &SearchSpec, after: Option<&str>, page_size: u32) -> JsonValue {
        let mut filter = serde_json::json!({
            "query": spec.query_text(),
            "source": "EVENTS",
        });
        if let Some(geo) = &spec.location {
            filter["lat"] = geo.lat.into();
            filter["lon"] = geo.lon.into();
            filter["radius"] = geo.radius_km.into();
        }
        serde_json::json!({
            "filter": filter,
            "first": page_size.min(MAX_PAGE_SIZE),
            "after": after,
        })
    }

    fn parse_page(&self, data: &JsonValue, spec: &SearchSpec) -> Result<SearchPage, AdapterError> {
        let context = SearchContext::from_location(spec.location.as_ref(), None);
        parse_connection(data, &Self::SHAPE, spec, context)
    }
}

#[async_trait]
impl SearchAdapter for EventSearchAdapter {
    fn api(&self) -> SearchApi {
        SearchApi::EventSearch
    }

    fn query(&self) -> &'static str {
        EVENT_SEARCH_QUERY
    }

    fn variables(&self, spec: &SearchSpec, after: Option<&str>, page_size: u32) -> JsonValue {
        let mut filter = serde_json::json!({ "query": spec.query_text() });
        if let Some(geo) = &spec.location {
            let (miles, capped) = event_search_radius_miles(geo.radius_km);
            if capped {
                warn!(
                    search = %spec.label,
                    radius_km = geo.radius_km,
                    max_miles = MAX_RADIUS_MILES,
                    "radius exceeds API maximum; capping"
                );
            }
            filter["lat"] = geo.lat.into();
            filter["lon"] = geo.lon.into();
            filter["radius"] = miles.into();
        }
        serde_json::json!({
            "filter": filter,
            "first": page_size.min(MAX_PAGE_SIZE),
            "after": after,
        })
    }

    fn parse_page(&self, data: &JsonValue, spec: &SearchSpec) -> Result<SearchPage, AdapterError> {
        let effective = Self::radius(spec).map(|(_, km)| km);
        let context = SearchContext::from_location(spec.location.as_ref(), effective);
        parse_connection(data, &Self::SHAPE, spec, context)
    }
}

/// Recorded API response plus the search that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub fixture_id: String,
    pub api: SearchApi,
    pub search: SearchSpec,
    pub response: JsonValue,
}

impl FixturePage {
    /// Run the recorded response through the same decode + parse path as a
    /// live request.
    pub fn parse(&self) -> Result<SearchPage> {
        let body = serde_json::to_vec(&self.response).context("re-encoding fixture response")?;
        let data = evsync_storage::decode_graphql_body(&body)
            .with_context(|| format!("decoding fixture {}", self.fixture_id))?;
        adapter_for_api(self.api)
            .parse_page(&data, &self.search)
            .with_context(|| format!("parsing fixture {}", self.fixture_id))
    }
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<FixturePage> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evsync_core::GeoFilter;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GoldenRow {
        id: String,
        title: String,
        date_time: Option<String>,
        group_urlname: Option<String>,
        venue_city: Option<String>,
        topic_keyword: Option<String>,
        search_radius_km: Option<f64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GoldenPage {
        edge_count: usize,
        has_next_page: bool,
        end_cursor: Option<String>,
        rows: Vec<GoldenRow>,
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_path(dialect: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(dialect)
            .join("sample")
            .join("page.json")
    }

    fn expected_snapshot_path(dialect: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(dialect)
            .join("sample")
            .join("snapshot.json")
    }

    fn page_to_golden(page: &SearchPage) -> GoldenPage {
        GoldenPage {
            edge_count: page.edge_count,
            has_next_page: page.has_next_page,
            end_cursor: page.end_cursor.clone(),
            rows: page
                .rows
                .iter()
                .map(|r| GoldenRow {
                    id: r.id.clone(),
                    title: r.title.clone(),
                    date_time: r.date_time.map(|d| d.to_rfc3339()),
                    group_urlname: r.group_urlname.clone(),
                    venue_city: r.venue_city.clone(),
                    topic_keyword: r.topic_keyword.clone(),
                    search_radius_km: r.search_radius_km,
                })
                .collect(),
        }
    }

    fn read_snapshot(path: &Path) -> GoldenPage {
        let text = fs::read_to_string(path).expect("read snapshot");
        serde_json::from_str(&text).expect("parse snapshot")
    }

    fn austin(keyword: Option<&str>, radius_km: f64) -> SearchSpec {
        SearchSpec::located(
            "Austin",
            keyword.map(ToString::to_string),
            GeoFilter {
                lat: 30.2672,
                lon: -97.7431,
                radius_km,
            },
        )
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_keyword_search() {
        let fixture = load_fixture_page(fixture_path("keyword-search")).unwrap();
        assert_eq!(fixture.api, SearchApi::KeywordSearch);
        let page = fixture.parse().unwrap();
        let expected = read_snapshot(&expected_snapshot_path("keyword-search"));
        assert_eq!(page_to_golden(&page), expected);
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_event_search() {
        let fixture = load_fixture_page(fixture_path("event-search")).unwrap();
        assert_eq!(fixture.api, SearchApi::EventSearch);
        let page = fixture.parse().unwrap();
        let expected = read_snapshot(&expected_snapshot_path("event-search"));
        assert_eq!(page_to_golden(&page), expected);
    }

    #[test]
    fn keyword_fixture_rows_keep_raw_payload_and_venue() {
        let fixture = load_fixture_page(fixture_path("keyword-search")).unwrap();
        let page = fixture.parse().unwrap();
        let first = page.rows.first().unwrap();
        assert_eq!(first.raw_event["id"], JsonValue::String(first.id.clone()));
        assert_eq!(first.going, Some(42));
        assert_eq!(first.venue_lat, Some(30.2669));
        assert_eq!(first.search_lat, Some(30.2672));
    }

    #[test]
    fn keyword_variables_carry_location_in_km() {
        let vars = keyword_search_adapter().variables(&austin(Some("web3"), 40.0), Some("c1"), 250);
        assert_eq!(vars["filter"]["query"], "web3");
        assert_eq!(vars["filter"]["source"], "EVENTS");
        assert_eq!(vars["filter"]["radius"], 40.0);
        assert_eq!(vars["first"], 100);
        assert_eq!(vars["after"], "c1");
    }

    #[test]
    fn global_topic_variables_have_no_location() {
        let vars = keyword_search_adapter().variables(&SearchSpec::topic("blockchain"), None, 100);
        assert!(vars["filter"].get("lat").is_none());
        assert!(vars["filter"].get("radius").is_none());
        assert!(vars["after"].is_null());
    }

    #[test]
    fn event_search_converts_and_caps_radius() {
        let adapter = event_search_adapter();
        let vars = adapter.variables(&austin(None, 16.09344), None, 100);
        let miles = vars["filter"]["radius"].as_f64().unwrap();
        assert!((miles - 10.0).abs() < 1e-9);
        assert_eq!(vars["filter"]["query"], "events");
        assert!(vars["filter"].get("source").is_none());

        let capped = adapter.variables(&austin(None, 500.0), None, 100);
        assert_eq!(capped["filter"]["radius"], 100.0);
    }

    #[test]
    fn capped_radius_is_reported_on_rows() {
        let data = serde_json::json!({
            "eventSearch": {
                "pageInfo": {"hasNextPage": false, "endCursor": null},
                "edges": [{"node": {"id": "e1", "title": "Big Radius"}}]
            }
        });
        let page = event_search_adapter()
            .parse_page(&data, &austin(Some("tech"), 500.0))
            .unwrap();
        let km = page.rows[0].search_radius_km.unwrap();
        assert!((km - 160.9344).abs() < 1e-9);
    }

    #[test]
    fn non_event_results_and_empty_ids_are_dropped() {
        let data = serde_json::json!({
            "keywordSearch": {
                "pageInfo": {"hasNextPage": true, "endCursor": "next"},
                "edges": [
                    {"node": {"id": "n1", "result": {}}},
                    {"node": {"id": "n2", "result": {"id": "", "title": "No id"}}},
                    {"node": {"id": "n3"}},
                    {"node": {"id": "n4", "result": {"id": "ev4", "title": "Kept"}}}
                ]
            }
        });
        let page = keyword_search_adapter()
            .parse_page(&data, &SearchSpec::topic("ai"))
            .unwrap();
        assert_eq!(page.edge_count, 4);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].id, "ev4");
        assert_eq!(page.rows[0].topic_keyword.as_deref(), Some("ai"));
        assert_eq!(page.rows[0].search_lat, None);
        assert_eq!(page.next_cursor(), Some("next"));
    }

    #[test]
    fn missing_connection_is_an_empty_last_page() {
        let page = keyword_search_adapter()
            .parse_page(&JsonValue::Null, &SearchSpec::topic("ai"))
            .unwrap();
        assert_eq!(page, SearchPage::default());
        assert!(page.next_cursor().is_none());
    }

    #[test]
    fn malformed_edges_are_a_shape_error() {
        let data = serde_json::json!({"eventSearch": {"edges": "nope"}});
        let err = event_search_adapter()
            .parse_page(&data, &SearchSpec::topic("ai"))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Shape(_)));
    }

    #[test]
    fn registry_returns_adapter_for_requested_dialect() {
        for api in [SearchApi::KeywordSearch, SearchApi::EventSearch] {
            assert_eq!(adapter_for_api(api).api(), api);
        }
        assert!(adapter_for_api(SearchApi::EventSearch).query().contains("eventSearch("));
    }

    #[test]
    fn datetimes_accept_minute_precision_and_zulu() {
        let dt = parse_event_datetime("2024-03-01T18:00-08:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-01T18:00:00-08:00");
        let z = parse_event_datetime("2024-03-01T18:00:00Z").unwrap();
        assert_eq!(z.to_rfc3339(), "2024-03-01T18:00:00+00:00");
        assert!(parse_event_datetime("next tuesday").is_none());
    }

    #[test]
    fn normalize_tolerates_missing_group_and_venue() {
        let event = serde_json::json!({"id": "x", "dateTime": "garbage", "group": null});
        let row = normalize_event(&event, None, None, SearchContext::default()).unwrap();
        assert_eq!(row.title, "");
        assert!(row.group_id.is_none());
        assert!(row.venue_name.is_none());
        assert!(row.date_time.is_none());
    }
}
