//! Axum JSON API over the event store.

use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHasher};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use evf_core::{EventFilter, NewUser, StoredEvent, User, UserPatch};
use evf_storage::{EventStore, StorageError, UserStore};
use serde::Deserialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "evf-web";

#[derive(Clone)]
pub struct AppState {
    pub events: Arc<dyn EventStore>,
    pub users: Arc<dyn UserStore>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/events", get(list_events_handler))
        .route("/api/events/{id}", get(get_event_handler))
        .route("/api/events/{id}/rsvp", post(toggle_rsvp_handler))
        .route("/api/events/{id}/like", post(toggle_like_handler))
        .route("/api/users", post(create_user_handler))
        .route(
            "/api/users/{id}",
            get(get_user_handler)
                .patch(update_user_handler)
                .delete(delete_user_handler),
        )
        .route("/api/users/{id}/rsvps", get(user_rsvps_handler))
        .route("/api/users/{id}/likes", get(user_likes_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving json api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => Self(StatusCode::NOT_FOUND, "not found".to_string()),
            StorageError::Conflict(message) => Self(StatusCode::CONFLICT, message),
            StorageError::Database(err) => {
                tracing::error!(%err, "storage failure");
                Self(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage failure".to_string(),
                )
            }
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    city: Option<String>,
}

async fn list_events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    let filter = EventFilter {
        start_date: query.start_date,
        end_date: query.end_date,
        city: query.city.filter(|c| !c.is_empty()),
    };
    Ok(Json(state.events.list_events(&filter).await?))
}

async fn get_event_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StoredEvent>, ApiError> {
    Ok(Json(state.events.get_event(id).await?))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    user_id: i64,
}

async fn toggle_rsvp_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ToggleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let active = state.users.toggle_rsvp(body.user_id, id).await?;
    Ok(Json(serde_json::json!({
        "event_id": id,
        "user_id": body.user_id,
        "rsvped": active,
    })))
}

async fn toggle_like_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ToggleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let active = state.users.toggle_like(body.user_id, id).await?;
    Ok(Json(serde_json::json!({
        "event_id": id,
        "user_id": body.user_id,
        "liked": active,
    })))
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    email: String,
    username: String,
    password: String,
    first_name: String,
    last_name: String,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

async fn create_user_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let password_hash = hash_password(&body.password)?;
    let user = state
        .users
        .create_user(NewUser {
            email: body.email,
            username: body.username,
            password_hash,
            image_url: body.image_url,
            first_name: body.first_name,
            last_name: body.last_name,
            location: body.location,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn get_user_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.users.get_user(id).await?))
}

async fn update_user_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<UserPatch>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.users.update_user(id, patch).await?))
}

async fn delete_user_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.users.delete_user(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn user_rsvps_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    Ok(Json(state.users.rsvped_events(id).await?))
}

async fn user_likes_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    Ok(Json(state.users.liked_events(id).await?))
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| {
            tracing::error!(%err, "password hashing failed");
            ApiError(
                StatusCode::INTERNAL_SERVER_ERROR,
                "password hashing failed".to_string(),
            )
        })
}
