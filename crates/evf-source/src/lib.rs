//! Discovery-API source contract + normalization of raw event records.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use evf_core::{NormalizedEvent, PLACEHOLDER_IMAGE_URL};
use evf_storage::{FetchError, HttpClient};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "evf-source";

/// Timestamp layout the discovery API puts on the wire, always UTC.
const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A record that cannot be keyed or displayed. Reported to the caller so the
/// sync run can count it; never silently defaulted, since the identifier is
/// the upsert key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// One page of raw event records plus the upstream pagination cursor.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub records: Vec<Value>,
    pub total_pages: Option<u32>,
}

/// Paginated read access to the external event catalog.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetches one page of raw event records, zero-indexed.
    async fn fetch_page(&self, page: u32) -> Result<EventPage, SourceError>;

    /// Page size the upstream serves, used to detect the final short page.
    fn page_size(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_size: usize,
}

/// Client for the third-party event-discovery HTTP API.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: HttpClient,
    config: DiscoveryConfig,
}

impl DiscoveryClient {
    pub fn new(http: HttpClient, config: DiscoveryConfig) -> Self {
        Self { http, config }
    }

    fn listing_url(&self, page: u32) -> String {
        format!(
            "{}/events.json?apikey={}&size={}&page={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_key,
            self.config.page_size,
            page
        )
    }

    fn detail_url(&self, external_id: &str) -> String {
        format!(
            "{}/events/{}.json?apikey={}",
            self.config.base_url.trim_end_matches('/'),
            external_id,
            self.config.api_key
        )
    }

    /// Fetches a single raw event record by its upstream identifier.
    pub async fn fetch_event(&self, external_id: &str) -> Result<Value, SourceError> {
        Ok(self.http.get_json(&self.detail_url(external_id)).await?)
    }
}

#[async_trait]
impl EventSource for DiscoveryClient {
    async fn fetch_page(&self, page: u32) -> Result<EventPage, SourceError> {
        let body = self.http.get_json(&self.listing_url(page)).await?;
        parse_page(&body)
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }
}

/// Pulls the record array and pagination cursor out of a listing response.
/// A response with no `_embedded` block is a valid, empty last page.
pub fn parse_page(body: &Value) -> Result<EventPage, SourceError> {
    let records = match body.pointer("/_embedded/events") {
        Some(events) => events
            .as_array()
            .cloned()
            .ok_or_else(|| SourceError::Decode("`_embedded.events` is not an array".to_string()))?,
        None => Vec::new(),
    };
    let total_pages = body
        .pointer("/page/totalPages")
        .and_then(Value::as_u64)
        .map(|total| total as u32);
    Ok(EventPage {
        records,
        total_pages,
    })
}

/// Maps one raw discovery-API record onto the flat internal schema.
///
/// Only `id`, `name`, and `url` are required. Everything else is optional
/// upstream: the venue is the first element of the embedded venue list,
/// the address joins up to three lines, timestamps parse independently of
/// one another, and a missing image falls back to the placeholder. Pure, no
/// I/O.
pub fn normalize(raw: &Value) -> Result<NormalizedEvent, MalformedRecord> {
    let external_id = required_str(raw, "id")?;
    let name = required_str(raw, "name")?;
    let detail_url = required_str(raw, "url")?;

    let description = raw
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let image_url = raw
        .pointer("/images/0/url")
        .and_then(Value::as_str)
        .unwrap_or(PLACEHOLDER_IMAGE_URL)
        .to_string();

    let venue = raw.pointer("/_embedded/venues/0");
    let venue_name = venue
        .and_then(|v| v.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let address = venue.map(joined_address).unwrap_or_default();
    let city = venue
        .and_then(|v| v.pointer("/city/name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let start_time = parse_wire_time(raw.pointer("/dates/start/dateTime"));
    let end_time = parse_wire_time(raw.pointer("/dates/end/dateTime"));

    Ok(NormalizedEvent {
        external_id,
        name,
        detail_url,
        description,
        image_url,
        venue_name,
        address,
        city,
        start_time,
        end_time,
    })
}

fn required_str(raw: &Value, field: &'static str) -> Result<String, MalformedRecord> {
    raw.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(MalformedRecord::MissingField(field))
}

/// Joins the venue's up-to-three address lines with `", "`, skipping any
/// line that is absent or blank so separators are never doubled.
fn joined_address(venue: &Value) -> String {
    ["/address/line1", "/address/line2", "/address/line3"]
        .iter()
        .filter_map(|pointer| venue.pointer(pointer).and_then(Value::as_str))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// An absent or unparseable timestamp means "time to be announced".
fn parse_wire_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = value.and_then(Value::as_str)?;
    NaiveDateTime::parse_from_str(text, WIRE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evf_storage::HttpClientConfig;
    use serde_json::json;

    #[test]
    fn listing_and_detail_urls_carry_the_credential() {
        let client = DiscoveryClient::new(
            HttpClient::new(HttpClientConfig::default()).unwrap(),
            DiscoveryConfig {
                base_url: "https://api.example.com/discovery/v2/".to_string(),
                api_key: "k123".to_string(),
                page_size: 20,
            },
        );
        assert_eq!(
            client.listing_url(2),
            "https://api.example.com/discovery/v2/events.json?apikey=k123&size=20&page=2"
        );
        assert_eq!(
            client.detail_url("tm-abc123"),
            "https://api.example.com/discovery/v2/events/tm-abc123.json?apikey=k123"
        );
    }

    fn full_record() -> Value {
        json!({
            "id": "tm-abc123",
            "name": "The Midnight",
            "url": "https://tickets.example.com/tm-abc123",
            "info": "Synthwave night.",
            "images": [
                {"url": "https://img.example.com/a.jpg", "width": 1024},
                {"url": "https://img.example.com/b.jpg", "width": 640}
            ],
            "dates": {
                "start": {"dateTime": "2025-03-01T18:00:00Z"},
                "end": {"dateTime": "2025-03-01T22:00:00Z"}
            },
            "_embedded": {
                "venues": [{
                    "name": "The Fox Theater",
                    "address": {"line1": "123 Main St", "line2": "Suite 4"},
                    "city": {"name": "Boise"}
                }]
            }
        })
    }

    #[test]
    fn normalize_keeps_the_external_identifier() {
        let event = normalize(&full_record()).unwrap();
        assert_eq!(event.external_id, "tm-abc123");
        assert_eq!(event.name, "The Midnight");
        assert_eq!(event.detail_url, "https://tickets.example.com/tm-abc123");
        assert_eq!(event.description, "Synthwave night.");
        assert_eq!(event.image_url, "https://img.example.com/a.jpg");
        assert_eq!(event.venue_name, "The Fox Theater");
        assert_eq!(event.address, "123 Main St, Suite 4");
        assert_eq!(event.city, "Boise");
        assert_eq!(
            event.start_time,
            Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).single()
        );
        assert_eq!(
            event.end_time,
            Utc.with_ymd_and_hms(2025, 3, 1, 22, 0, 0).single()
        );
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        for field in ["id", "name", "url"] {
            let mut record = full_record();
            record.as_object_mut().unwrap().remove(field);
            assert_eq!(
                normalize(&record).unwrap_err(),
                MalformedRecord::MissingField(field),
            );
        }
    }

    #[test]
    fn non_string_identifier_is_malformed() {
        let mut record = full_record();
        record["id"] = json!(42);
        assert_eq!(
            normalize(&record).unwrap_err(),
            MalformedRecord::MissingField("id"),
        );
    }

    #[test]
    fn optional_fields_fall_back_to_defaults() {
        let record = json!({
            "id": "tm-bare",
            "name": "Bare Event",
            "url": "https://tickets.example.com/tm-bare"
        });
        let event = normalize(&record).unwrap();
        assert_eq!(event.description, "");
        assert_eq!(event.image_url, PLACEHOLDER_IMAGE_URL);
        assert_eq!(event.venue_name, "");
        assert_eq!(event.address, "");
        assert_eq!(event.city, "");
        assert!(event.start_time.is_none());
        assert!(event.end_time.is_none());
    }

    #[test]
    fn address_joining_skips_blank_lines() {
        let venue = json!({
            "address": {"line1": "123 Main St", "line2": "", "line3": "Suite 4"}
        });
        assert_eq!(joined_address(&venue), "123 Main St, Suite 4");

        let all_blank = json!({"address": {"line1": "", "line2": "", "line3": ""}});
        assert_eq!(joined_address(&all_blank), "");

        let no_address = json!({"name": "Somewhere"});
        assert_eq!(joined_address(&no_address), "");
    }

    #[test]
    fn start_and_end_times_parse_independently() {
        let mut record = full_record();
        record["dates"] = json!({"start": {"dateTime": "2025-03-01T18:00:00Z"}});
        let event = normalize(&record).unwrap();
        assert!(event.start_time.is_some());
        assert!(event.end_time.is_none());

        record["dates"] = json!({"start": {}, "end": {"dateTime": "2025-03-01T22:00:00Z"}});
        let event = normalize(&record).unwrap();
        assert!(event.start_time.is_none());
        assert!(event.end_time.is_some());
    }

    #[test]
    fn garbled_timestamp_means_time_tbd() {
        let mut record = full_record();
        record["dates"]["start"]["dateTime"] = json!("next friday, doors at 8");
        assert!(normalize(&record).unwrap().start_time.is_none());
    }

    #[test]
    fn listing_page_parses_records_and_cursor() {
        let body = json!({
            "_embedded": {"events": [full_record(), full_record()]},
            "page": {"size": 20, "totalElements": 42, "totalPages": 3, "number": 0}
        });
        let page = parse_page(&body).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_pages, Some(3));
    }

    #[test]
    fn listing_page_without_embedded_block_is_empty() {
        let body = json!({"page": {"size": 20, "totalElements": 0, "totalPages": 0, "number": 0}});
        let page = parse_page(&body).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.total_pages, Some(0));
    }

    #[test]
    fn malformed_embedded_block_is_a_decode_error() {
        let body = json!({"_embedded": {"events": "not-a-list"}});
        assert!(matches!(
            parse_page(&body).unwrap_err(),
            SourceError::Decode(_)
        ));
    }
}
