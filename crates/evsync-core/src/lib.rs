//! Core domain model for event listing sync: the flat event row and the
//! search descriptions that produce it.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "evsync-core";

/// Text sent to the API when a search has a location but no topic.
pub const DEFAULT_QUERY: &str = "events";

/// Geographic filter attached to a search. The radius is always kept in
/// kilometres here; adapters convert to whatever unit their API expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFilter {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

/// One search against the event API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub label: String,
    /// Topic recorded on every row this search produces.
    pub keyword: Option<String>,
    pub location: Option<GeoFilter>,
}

impl SearchSpec {
    pub fn topic(keyword: impl Into<String>) -> Self {
        let keyword = keyword.into();
        Self {
            label: format!("{keyword} (global)"),
            keyword: Some(keyword),
            location: None,
        }
    }

    pub fn located(name: &str, keyword: Option<String>, location: GeoFilter) -> Self {
        let label = match &keyword {
            Some(k) => format!("{k} @ {name}"),
            None => format!("all events @ {name}"),
        };
        Self {
            label,
            keyword,
            location: Some(location),
        }
    }

    /// Text for the API's `query` filter field.
    pub fn query_text(&self) -> &str {
        self.keyword.as_deref().unwrap_or(DEFAULT_QUERY)
    }
}

/// Where a row came from. Stored alongside the event so the last search that
/// touched an event is visible in the table.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchContext {
    pub search_lat: Option<f64>,
    pub search_lon: Option<f64>,
    pub search_radius_km: Option<f64>,
}

impl SearchContext {
    pub fn from_location(location: Option<&GeoFilter>, effective_radius_km: Option<f64>) -> Self {
        match location {
            Some(geo) => Self {
                search_lat: Some(geo.lat),
                search_lon: Some(geo.lon),
                search_radius_km: Some(effective_radius_km.unwrap_or(geo.radius_km)),
            },
            None => Self::default(),
        }
    }
}

/// Normalized, database-ready event. Field names match the table columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub event_url: Option<String>,
    pub date_time: Option<DateTime<FixedOffset>>,
    pub going: Option<i64>,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub group_urlname: Option<String>,
    pub venue_name: Option<String>,
    pub venue_city: Option<String>,
    pub venue_state: Option<String>,
    pub venue_country: Option<String>,
    pub venue_lat: Option<f64>,
    pub venue_lon: Option<f64>,
    pub topic_keyword: Option<String>,
    pub search_lat: Option<f64>,
    pub search_lon: Option<f64>,
    pub search_radius_km: Option<f64>,
    pub raw_event: JsonValue,
}

impl EventRow {
    pub fn apply_context(&mut self, context: SearchContext) {
        self.search_lat = context.search_lat;
        self.search_lon = context.search_lon;
        self.search_radius_km = context.search_radius_km;
    }
}

/// One page of search results after normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchPage {
    pub rows: Vec<EventRow>,
    /// Raw edge count, including results that were not events.
    pub edge_count: usize,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

impl SearchPage {
    /// Cursor for the next request, if the API says one exists.
    pub fn next_cursor(&self) -> Option<&str> {
        if !self.has_next_page {
            return None;
        }
        self.end_cursor.as_deref().filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_only_search_queries_broad_default() {
        let spec = SearchSpec::located(
            "Austin",
            None,
            GeoFilter {
                lat: 30.2672,
                lon: -97.7431,
                radius_km: 40.0,
            },
        );
        assert_eq!(spec.query_text(), "events");
        assert_eq!(spec.label, "all events @ Austin");
        assert!(spec.keyword.is_none());
    }

    #[test]
    fn context_prefers_effective_radius() {
        let geo = GeoFilter {
            lat: 1.0,
            lon: 2.0,
            radius_km: 500.0,
        };
        let ctx = SearchContext::from_location(Some(&geo), Some(160.9344));
        assert_eq!(ctx.search_radius_km, Some(160.9344));
        assert_eq!(SearchContext::from_location(None, Some(3.0)), SearchContext::default());
    }

    #[test]
    fn next_cursor_requires_flag_and_non_empty_cursor() {
        let mut page = SearchPage {
            has_next_page: true,
            end_cursor: Some("abc".into()),
            ..Default::default()
        };
        assert_eq!(page.next_cursor(), Some("abc"));
        page.end_cursor = Some(String::new());
        assert_eq!(page.next_cursor(), None);
        page.end_cursor = Some("abc".into());
        page.has_next_page = false;
        assert_eq!(page.next_cursor(), None);
    }
}
