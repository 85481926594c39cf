//! HTTP fetch utilities + the relational event store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use evf_core::{
    BatchOutcome, EventFilter, NewUser, NormalizedEvent, StoredEvent, User, UserPatch,
    DEFAULT_USER_IMAGE_URL,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

pub const CRATE_NAME: &str = "evf-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Thin JSON-over-HTTP client for the external event source.
///
/// Fetch failures are terminal for the caller's current run; there is no
/// retry here, the next scheduled run starts over.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}

/// Spaces consecutive requests at least `min_delay` apart, so the external
/// API's rate limit is honored by construction.
#[derive(Debug)]
pub struct RequestPacer {
    min_delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last: Mutex::new(None),
        }
    }

    /// Waits until at least `min_delay` has passed since the previous call.
    /// The first call returns immediately.
    pub async fn pace(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_delay;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("row not found")]
    NotFound,
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

fn map_db_err(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StorageError::Conflict(db.message().to_string());
        }
    }
    match err {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        other => StorageError::Database(other),
    }
}

/// Read/write surface the sync engine and event endpoints run against.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert-or-update every record in one transaction, keyed by
    /// `external_id`. Existing rows have all synced fields overwritten in
    /// place; no duplicate row is ever created for the same key.
    async fn upsert_batch(&self, batch: &[NormalizedEvent]) -> Result<BatchOutcome, StorageError>;

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, StorageError>;

    async fn get_event(&self, id: i64) -> Result<StoredEvent, StorageError>;

    async fn get_event_by_external_id(&self, external_id: &str)
        -> Result<StoredEvent, StorageError>;
}

/// User CRUD plus the RSVP/Like association toggles.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, new_user: NewUser) -> Result<User, StorageError>;

    async fn get_user(&self, id: i64) -> Result<User, StorageError>;

    async fn update_user(&self, id: i64, patch: UserPatch) -> Result<User, StorageError>;

    async fn delete_user(&self, id: i64) -> Result<(), StorageError>;

    /// Flips the RSVP association and returns the new state: `true` when the
    /// user is now RSVP'd, `false` when the RSVP was removed.
    async fn toggle_rsvp(&self, user_id: i64, event_id: i64) -> Result<bool, StorageError>;

    /// Same contract as [`UserStore::toggle_rsvp`], for likes.
    async fn toggle_like(&self, user_id: i64, event_id: i64) -> Result<bool, StorageError>;

    async fn rsvped_events(&self, user_id: i64) -> Result<Vec<StoredEvent>, StorageError>;

    async fn liked_events(&self, user_id: i64) -> Result<Vec<StoredEvent>, StorageError>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            BIGSERIAL PRIMARY KEY,
    email         TEXT NOT NULL UNIQUE,
    username      TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    image_url     TEXT NOT NULL DEFAULT '/static/images/default-pic.png',
    first_name    TEXT NOT NULL,
    last_name     TEXT NOT NULL,
    location      TEXT
);

CREATE TABLE IF NOT EXISTS events (
    id          BIGSERIAL PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    detail_url  TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    image_url   TEXT NOT NULL DEFAULT '',
    venue_name  TEXT NOT NULL DEFAULT '',
    address     TEXT NOT NULL DEFAULT '',
    city        TEXT NOT NULL DEFAULT '',
    start_time  TIMESTAMPTZ,
    end_time    TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS events_start_time_idx ON events (start_time);

CREATE TABLE IF NOT EXISTS rsvps (
    id       BIGSERIAL PRIMARY KEY,
    user_id  BIGINT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    event_id BIGINT NOT NULL REFERENCES events (id) ON DELETE CASCADE,
    UNIQUE (user_id, event_id)
);

CREATE TABLE IF NOT EXISTS likes (
    id       BIGSERIAL PRIMARY KEY,
    user_id  BIGINT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    event_id BIGINT NOT NULL REFERENCES events (id) ON DELETE CASCADE,
    UNIQUE (user_id, event_id)
);
"#;

/// Postgres-backed store used in production.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the schema when missing. Idempotent, safe to run at startup.
    pub async fn bootstrap_schema(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        debug!("schema bootstrap complete");
        Ok(())
    }

    async fn toggle_join_row(
        &self,
        table: &'static str,
        user_id: i64,
        event_id: i64,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        // Resolve bad ids to NotFound instead of a foreign-key error.
        let user = sqlx::query("SELECT 1 FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        let event = sqlx::query("SELECT 1 FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?;
        if user.is_none() || event.is_none() {
            return Err(StorageError::NotFound);
        }

        let deleted = sqlx::query(&format!(
            "DELETE FROM {table} WHERE user_id = $1 AND event_id = $2"
        ))
        .bind(user_id)
        .bind(event_id)
        .execute(&mut *tx)
        .await?;

        let active = if deleted.rows_affected() == 0 {
            sqlx::query(&format!(
                "INSERT INTO {table} (user_id, event_id) VALUES ($1, $2)"
            ))
            .bind(user_id)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
            true
        } else {
            false
        };

        tx.commit().await?;
        Ok(active)
    }

    async fn events_joined(
        &self,
        table: &'static str,
        user_id: i64,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        sqlx::query("SELECT 1 FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound)?;

        let rows = sqlx::query(&format!(
            "SELECT e.* FROM events e
               JOIN {table} j ON j.event_id = e.id
              WHERE j.user_id = $1
              ORDER BY e.start_time NULLS LAST, e.id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, StorageError> {
    Ok(StoredEvent {
        id: row.try_get("id")?,
        event: NormalizedEvent {
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            detail_url: row.try_get("detail_url")?,
            description: row.try_get("description")?,
            image_url: row.try_get("image_url")?,
            venue_name: row.try_get("venue_name")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StorageError> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        image_url: row.try_get("image_url")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        location: row.try_get("location")?,
    })
}

const USER_COLUMNS: &str =
    "id, email, username, password_hash, image_url, first_name, last_name, location";

#[async_trait]
impl EventStore for PgStore {
    async fn upsert_batch(&self, batch: &[NormalizedEvent]) -> Result<BatchOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;

        let keys: Vec<String> = batch.iter().map(|e| e.external_id.clone()).collect();
        let rows = sqlx::query("SELECT external_id FROM events WHERE external_id = ANY($1)")
            .bind(&keys)
            .fetch_all(&mut *tx)
            .await?;
        let mut existing: HashSet<String> = rows
            .iter()
            .map(|row| row.try_get("external_id"))
            .collect::<Result<_, _>>()?;

        let mut outcome = BatchOutcome::default();
        for event in batch {
            sqlx::query(
                r#"
                INSERT INTO events
                    (external_id, name, detail_url, description, image_url,
                     venue_name, address, city, start_time, end_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (external_id) DO UPDATE SET
                    name        = EXCLUDED.name,
                    detail_url  = EXCLUDED.detail_url,
                    description = EXCLUDED.description,
                    image_url   = EXCLUDED.image_url,
                    venue_name  = EXCLUDED.venue_name,
                    address     = EXCLUDED.address,
                    city        = EXCLUDED.city,
                    start_time  = EXCLUDED.start_time,
                    end_time    = EXCLUDED.end_time,
                    updated_at  = now()
                "#,
            )
            .bind(&event.external_id)
            .bind(&event.name)
            .bind(&event.detail_url)
            .bind(&event.description)
            .bind(&event.image_url)
            .bind(&event.venue_name)
            .bind(&event.address)
            .bind(&event.city)
            .bind(event.start_time)
            .bind(event.end_time)
            .execute(&mut *tx)
            .await?;

            if existing.insert(event.external_id.clone()) {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
             WHERE ($1::date IS NULL OR start_time::date >= $1::date)
               AND ($2::date IS NULL OR start_time::date <= $2::date)
               AND ($3::text IS NULL OR lower(city) = lower($3::text))
             ORDER BY start_time NULLS LAST, id
            "#,
        )
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(filter.city.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn get_event(&self, id: i64) -> Result<StoredEvent, StorageError> {
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound)?;
        event_from_row(&row)
    }

    async fn get_event_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<StoredEvent, StorageError> {
        let row = sqlx::query("SELECT * FROM events WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound)?;
        event_from_row(&row)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User, StorageError> {
        let image_url = new_user
            .image_url
            .unwrap_or_else(|| DEFAULT_USER_IMAGE_URL.to_string());
        let row = sqlx::query(&format!(
            "INSERT INTO users
                 (email, username, password_hash, image_url, first_name, last_name, location)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&new_user.email)
        .bind(&new_user.username)
        .bind(&new_user.password_hash)
        .bind(&image_url)
        .bind(&new_user.first_name)
        .bind(&new_user.last_name)
        .bind(new_user.location.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;
        user_from_row(&row)
    }

    async fn get_user(&self, id: i64) -> Result<User, StorageError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound)?;
        user_from_row(&row)
    }

    async fn update_user(&self, id: i64, patch: UserPatch) -> Result<User, StorageError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET
                 email      = COALESCE($2::text, email),
                 username   = COALESCE($3::text, username),
                 image_url  = COALESCE($4::text, image_url),
                 first_name = COALESCE($5::text, first_name),
                 last_name  = COALESCE($6::text, last_name),
                 location   = COALESCE($7::text, location)
             WHERE id = $1
             RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(patch.email.as_deref())
        .bind(patch.username.as_deref())
        .bind(patch.image_url.as_deref())
        .bind(patch.first_name.as_deref())
        .bind(patch.last_name.as_deref())
        .bind(patch.location.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?
        .ok_or(StorageError::NotFound)?;
        user_from_row(&row)
    }

    async fn delete_user(&self, id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn toggle_rsvp(&self, user_id: i64, event_id: i64) -> Result<bool, StorageError> {
        self.toggle_join_row("rsvps", user_id, event_id).await
    }

    async fn toggle_like(&self, user_id: i64, event_id: i64) -> Result<bool, StorageError> {
        self.toggle_join_row("likes", user_id, event_id).await
    }

    async fn rsvped_events(&self, user_id: i64) -> Result<Vec<StoredEvent>, StorageError> {
        self.events_joined("rsvps", user_id).await
    }

    async fn liked_events(&self, user_id: i64) -> Result<Vec<StoredEvent>, StorageError> {
        self.events_joined("likes", user_id).await
    }
}

/// In-memory store mirroring [`PgStore`] semantics (unique keys, cascading
/// deletes, filter behavior). Backs handler and engine tests that should not
/// need a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    events: BTreeMap<i64, StoredEvent>,
    events_by_key: HashMap<String, i64>,
    users: BTreeMap<i64, User>,
    rsvps: HashSet<(i64, i64)>,
    likes: HashSet<(i64, i64)>,
    next_event_id: i64,
    next_user_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn matches(&self, stored: &StoredEvent, filter: &EventFilter) -> bool {
        let by_date = match stored.event.start_time {
            Some(ts) => {
                let date = ts.date_naive();
                filter.start_date.is_none_or(|start| date >= start)
                    && filter.end_date.is_none_or(|end| date <= end)
            }
            None => filter.start_date.is_none() && filter.end_date.is_none(),
        };
        let by_city = filter
            .city
            .as_deref()
            .is_none_or(|city| stored.event.city.eq_ignore_ascii_case(city));
        by_date && by_city
    }

    fn sorted(&self, mut events: Vec<StoredEvent>) -> Vec<StoredEvent> {
        events.sort_by(|a, b| match (a.event.start_time, b.event.start_time) {
            (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        events
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_batch(&self, batch: &[NormalizedEvent]) -> Result<BatchOutcome, StorageError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut outcome = BatchOutcome::default();

        for event in batch {
            match inner.events_by_key.get(&event.external_id).copied() {
                Some(id) => {
                    let stored = inner
                        .events
                        .get_mut(&id)
                        .expect("event index points at a live row");
                    stored.event = event.clone();
                    stored.updated_at = now;
                    outcome.updated += 1;
                }
                None => {
                    inner.next_event_id += 1;
                    let id = inner.next_event_id;
                    inner.events_by_key.insert(event.external_id.clone(), id);
                    inner.events.insert(
                        id,
                        StoredEvent {
                            id,
                            event: event.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, StorageError> {
        let inner = self.inner.read().await;
        let events = inner
            .events
            .values()
            .filter(|stored| inner.matches(stored, filter))
            .cloned()
            .collect();
        Ok(inner.sorted(events))
    }

    async fn get_event(&self, id: i64) -> Result<StoredEvent, StorageError> {
        let inner = self.inner.read().await;
        inner.events.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn get_event_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<StoredEvent, StorageError> {
        let inner = self.inner.read().await;
        inner
            .events_by_key
            .get(external_id)
            .and_then(|id| inner.events.get(id))
            .cloned()
            .ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User, StorageError> {
        let mut inner = self.inner.write().await;
        if inner
            .users
            .values()
            .any(|u| u.email == new_user.email || u.username == new_user.username)
        {
            return Err(StorageError::Conflict(
                "duplicate email or username".to_string(),
            ));
        }

        inner.next_user_id += 1;
        let user = User {
            id: inner.next_user_id,
            email: new_user.email,
            username: new_user.username,
            password_hash: new_user.password_hash,
            image_url: new_user
                .image_url
                .unwrap_or_else(|| DEFAULT_USER_IMAGE_URL.to_string()),
            first_name: new_user.first_name,
            last_name: new_user.last_name,
            location: new_user.location,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: i64) -> Result<User, StorageError> {
        let inner = self.inner.read().await;
        inner.users.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn update_user(&self, id: i64, patch: UserPatch) -> Result<User, StorageError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or(StorageError::NotFound)?;
        if let Some(email) = patch.email {
            user.email = email;
        }
        if let Some(username) = patch.username {
            user.username = username;
        }
        if let Some(image_url) = patch.image_url {
            user.image_url = image_url;
        }
        if let Some(first_name) = patch.first_name {
            user.first_name = first_name;
        }
        if let Some(last_name) = patch.last_name {
            user.last_name = last_name;
        }
        if let Some(location) = patch.location {
            user.location = Some(location);
        }
        Ok(user.clone())
    }

    async fn delete_user(&self, id: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if inner.users.remove(&id).is_none() {
            return Err(StorageError::NotFound);
        }
        inner.rsvps.retain(|(user_id, _)| *user_id != id);
        inner.likes.retain(|(user_id, _)| *user_id != id);
        Ok(())
    }

    async fn toggle_rsvp(&self, user_id: i64, event_id: i64) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&user_id) || !inner.events.contains_key(&event_id) {
            return Err(StorageError::NotFound);
        }
        if inner.rsvps.remove(&(user_id, event_id)) {
            Ok(false)
        } else {
            inner.rsvps.insert((user_id, event_id));
            Ok(true)
        }
    }

    async fn toggle_like(&self, user_id: i64, event_id: i64) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&user_id) || !inner.events.contains_key(&event_id) {
            return Err(StorageError::NotFound);
        }
        if inner.likes.remove(&(user_id, event_id)) {
            Ok(false)
        } else {
            inner.likes.insert((user_id, event_id));
            Ok(true)
        }
    }

    async fn rsvped_events(&self, user_id: i64) -> Result<Vec<StoredEvent>, StorageError> {
        let inner = self.inner.read().await;
        if !inner.users.contains_key(&user_id) {
            return Err(StorageError::NotFound);
        }
        let events = inner
            .rsvps
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .filter_map(|(_, event_id)| inner.events.get(event_id))
            .cloned()
            .collect();
        Ok(inner.sorted(events))
    }

    async fn liked_events(&self, user_id: i64) -> Result<Vec<StoredEvent>, StorageError> {
        let inner = self.inner.read().await;
        if !inner.users.contains_key(&user_id) {
            return Err(StorageError::NotFound);
        }
        let events = inner
            .likes
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .filter_map(|(_, event_id)| inner.events.get(event_id))
            .cloned()
            .collect();
        Ok(inner.sorted(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn event(external_id: &str, city: &str, start: Option<chrono::DateTime<Utc>>) -> NormalizedEvent {
        NormalizedEvent {
            external_id: external_id.to_string(),
            name: format!("Event {external_id}"),
            detail_url: format!("https://events.example.com/{external_id}"),
            description: String::new(),
            image_url: evf_core::PLACEHOLDER_IMAGE_URL.to_string(),
            venue_name: String::new(),
            address: String::new(),
            city: city.to_string(),
            start_time: start,
            end_time: None,
        }
    }

    fn ts(y: i32, m: u32, d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 19, 30, 0).single().unwrap()
    }

    fn new_user(email: &str, username: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            username: username.to_string(),
            password_hash: "$argon2id$stub".to_string(),
            image_url: None,
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            location: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_enforces_min_delay_between_calls() {
        let pacer = RequestPacer::new(Duration::from_millis(200));
        let start = Instant::now();
        for _ in 0..3 {
            pacer.pace().await;
        }
        // Three paced calls wait out two full delays.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_first_call_is_immediate() {
        let pacer = RequestPacer::new(Duration::from_millis(200));
        let start = Instant::now();
        pacer.pace().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn upsert_never_duplicates_an_external_id() {
        let store = MemoryStore::new();
        let batch = vec![event("tm-1", "Boise", Some(ts(2025, 3, 1)))];

        let first = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.updated, 0);

        let second = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);

        let all = store.list_events(&EventFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_fields_in_place() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[event("tm-1", "Boise", None)])
            .await
            .unwrap();
        let before = store.get_event_by_external_id("tm-1").await.unwrap();
        assert!(before.event.start_time.is_none());

        store
            .upsert_batch(&[event("tm-1", "Boise", Some(ts(2025, 3, 1)))])
            .await
            .unwrap();
        let after = store.get_event_by_external_id("tm-1").await.unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.event.start_time, Some(ts(2025, 3, 1)));
    }

    #[tokio::test]
    async fn list_events_filters_by_date_window_and_city() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[
                event("tm-1", "Boise", Some(ts(2025, 3, 1))),
                event("tm-2", "Portland", Some(ts(2025, 3, 5))),
                event("tm-3", "Boise", Some(ts(2025, 4, 1))),
                event("tm-4", "Boise", None),
            ])
            .await
            .unwrap();

        let march_boise = store
            .list_events(&EventFilter {
                start_date: NaiveDate::from_ymd_opt(2025, 3, 1),
                end_date: NaiveDate::from_ymd_opt(2025, 3, 31),
                city: Some("boise".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(march_boise.len(), 1);
        assert_eq!(march_boise[0].event.external_id, "tm-1");

        // No date bound: the time-TBD event shows up, sorted last.
        let all_boise = store
            .list_events(&EventFilter {
                city: Some("Boise".to_string()),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all_boise.len(), 3);
        assert_eq!(all_boise.last().unwrap().event.external_id, "tm-4");
    }

    #[tokio::test]
    async fn rsvp_toggle_flips_state() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[event("tm-1", "Boise", Some(ts(2025, 3, 1)))])
            .await
            .unwrap();
        let user = store.create_user(new_user("a@example.com", "a")).await.unwrap();
        let stored = store.get_event_by_external_id("tm-1").await.unwrap();

        assert!(store.toggle_rsvp(user.id, stored.id).await.unwrap());
        assert_eq!(store.rsvped_events(user.id).await.unwrap().len(), 1);
        assert!(!store.toggle_rsvp(user.id, stored.id).await.unwrap());
        assert!(store.rsvped_events(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_user_cascades_to_associations() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[event("tm-1", "Boise", Some(ts(2025, 3, 1)))])
            .await
            .unwrap();
        let user = store.create_user(new_user("a@example.com", "a")).await.unwrap();
        let stored = store.get_event_by_external_id("tm-1").await.unwrap();
        store.toggle_rsvp(user.id, stored.id).await.unwrap();
        store.toggle_like(user.id, stored.id).await.unwrap();

        store.delete_user(user.id).await.unwrap();
        let inner = store.inner.read().await;
        assert!(inner.rsvps.is_empty());
        assert!(inner.likes.is_empty());
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let store = MemoryStore::new();
        store.create_user(new_user("a@example.com", "a")).await.unwrap();
        let err = store
            .create_user(new_user("a@example.com", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }
}
