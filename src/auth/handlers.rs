use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{AuthResponse, LoginRequest, NewUser, PublicUser},
        error::AuthError,
        repo_types::User,
    },
    state::AppState,
};

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth", post(create).get(list))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/:id", get(find_one))
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_lowercase();
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err((StatusCode::BAD_REQUEST, "Invalid email".into()));
    }
    Ok(email)
}

fn reject(state: &AppState, err: AuthError) -> (StatusCode, String) {
    let disclose = state.config.auth.disclose_credential_fault;
    (err.status_code(), err.client_message(disclose))
}

#[instrument(skip(state, payload))]
pub async fn create(
    State(state): State<AppState>,
    Json(mut payload): Json<NewUser>,
) -> ApiResult<(StatusCode, Json<PublicUser>)> {
    payload.email = normalize_email(&payload.email)?;
    let user = state
        .authority
        .enroll(payload)
        .await
        .map_err(|e| reject(&state, e))?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<NewUser>,
) -> ApiResult<Json<AuthResponse>> {
    payload.email = normalize_email(&payload.email)?;
    let res = state
        .authority
        .register(payload)
        .await
        .map_err(|e| reject(&state, e))?;
    Ok(Json(res))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let email = normalize_email(&payload.email)?;
    let res = state
        .authority
        .authenticate(&email, &payload.password)
        .await
        .map_err(|e| reject(&state, e))?;
    Ok(Json(res))
}

#[instrument(skip(state))]
pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    let users = state
        .authority
        .list_users()
        .await
        .map_err(|e| reject(&state, e))?;
    Ok(Json(users))
}

#[instrument(skip(state))]
pub async fn find_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PublicUser>> {
    let user = state
        .authority
        .find_by_id(id)
        .await
        .map_err(|e| reject(&state, e))?;
    Ok(Json(user))
}
