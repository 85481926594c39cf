//! Core domain model for the Event Finder.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "evf-core";

/// Fallback artwork for events whose payload carries no image.
pub const PLACEHOLDER_IMAGE_URL: &str = "https://placehold.co/600x400";

/// Default avatar for newly created users.
pub const DEFAULT_USER_IMAGE_URL: &str = "/static/images/default-pic.png";

/// Flat internal form of one external event record.
///
/// `external_id` is the upstream identifier and the natural key for upserts;
/// it is stable across syncs and uniquely identifies one logical event.
/// Venue, address, city, and image fields are not guaranteed by the upstream
/// API and fall back to empty defaults. A `None` start time means the event
/// is announced with its time still to be decided; end times are commonly
/// absent altogether.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub external_id: String,
    pub name: String,
    pub detail_url: String,
    pub description: String,
    pub image_url: String,
    pub venue_name: String,
    pub address: String,
    pub city: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Persisted event: the normalized record plus its surrogate row id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: NormalizedEvent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered user who can RSVP to and like events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub image_url: String,
    pub first_name: String,
    pub last_name: String,
    pub location: Option<String>,
}

/// Payload for creating a user row; the password arrives pre-hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub image_url: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub location: Option<String>,
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPatch {
    pub email: Option<String>,
    pub username: Option<String>,
    pub image_url: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub location: Option<String>,
}

/// Filters accepted by the event listing query. Date bounds are inclusive
/// and compared against the event's start date; events with no start time
/// match only when no date bound is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub city: Option<String>,
}

/// Insert/update split for one transactional upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
}

/// Per-run reconciliation counters, reported to operators after every sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            fetched: 0,
            inserted: 0,
            updated: 0,
            failed: 0,
        }
    }
}
