// Recorded pages for both search dialects parse through the public API.

use std::path::{Path, PathBuf};

use evsync_adapters::{load_fixture_page, SearchApi};

fn fixture(dialect: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(dialect)
        .join("sample")
}

#[test]
fn fixture_directories_have_page_and_snapshot() {
    for dialect in ["keyword-search", "event-search"] {
        let dir = fixture(dialect);
        assert!(dir.join("page.json").exists(), "{dialect} page");
        assert!(dir.join("snapshot.json").exists(), "{dialect} snapshot");
    }
}

#[test]
fn keyword_search_page_skips_non_event_results() {
    let page = load_fixture_page(fixture("keyword-search").join("page.json"))
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(page.edge_count, 3);
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.next_cursor(), Some("Y3Vyc29yOjM="));
    assert!(page.rows.iter().all(|r| r.topic_keyword.as_deref() == Some("tech")));
}

#[test]
fn event_search_page_takes_first_venue_and_ends_pagination() {
    let fixture = load_fixture_page(fixture("event-search").join("page.json")).unwrap();
    assert_eq!(fixture.api, SearchApi::EventSearch);
    let page = fixture.parse().unwrap();
    assert!(page.next_cursor().is_none());

    let robotics = &page.rows[0];
    assert_eq!(robotics.venue_name.as_deref(), Some("Gates Building"));
    assert_eq!(robotics.group_name.as_deref(), Some("Stanford Robotics Club"));
    assert_eq!(robotics.search_lat, Some(37.4275));

    let demo = &page.rows[1];
    assert!(demo.venue_name.is_none());
    assert!(demo.date_time.is_none());
    assert_eq!(demo.raw_event["eventType"], "ONLINE");
}

#[test]
fn graphql_errors_in_a_recorded_response_fail_the_parse() {
    let mut fixture = load_fixture_page(fixture("keyword-search").join("page.json")).unwrap();
    fixture.response = serde_json::json!({
        "data": null,
        "errors": [{"message": "Invalid token"}]
    });
    let err = fixture.parse().unwrap_err();
    assert!(format!("{err:#}").contains("Invalid token"));
}
