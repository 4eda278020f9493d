use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration as ChronoDuration, Utc};
use cookie::time::Duration as CookieDuration;
use rand_core::OsRng;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::web::{ApiError, AppState, json_error};

#[derive(Clone, sqlx::FromRow)]
pub struct DbUserAuth {
    pub id: Uuid,
    pub password_hash: String,
}

#[derive(Clone, sqlx::FromRow)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub is_staff: bool,
}

pub const SESSION_COOKIE: &str = "auth_token";
pub const SESSION_TTL_DAYS: i64 = 7;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<Value>), ApiError> {
    let username = request.username.trim();
    let pool = state.pool();

    let user = match fetch_user_by_username(&pool, username).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err(invalid_credentials()),
        Err(err) => {
            error!(?err, "failed to fetch user during login");
            return Err(server_error());
        }
    };

    if !verify_password(&request.password, &user.password_hash) {
        return Err(invalid_credentials());
    }

    let session_token = Uuid::new_v4();
    let expires_at = Utc::now() + ChronoDuration::days(SESSION_TTL_DAYS);

    if let Err(err) =
        sqlx::query("INSERT INTO sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_token)
            .bind(user.id)
            .bind(expires_at)
            .execute(state.pool_ref())
            .await
    {
        error!(?err, "failed to create session");
        return Err(server_error());
    }

    let mut cookie = Cookie::new(SESSION_COOKIE, session_token.to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(CookieDuration::days(SESSION_TTL_DAYS));

    Ok((jar.add(cookie), Json(json!({}))))
}

pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, Json<Value>) {
    let mut jar = jar;

    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Ok(token) = Uuid::parse_str(cookie.value()) {
            if let Err(err) = sqlx::query("DELETE FROM sessions WHERE id = $1")
                .bind(token)
                .execute(state.pool_ref())
                .await
            {
                error!(?err, "failed to remove session during logout");
            }
        }
    }

    let mut removal = Cookie::new(SESSION_COOKIE, "");
    removal.set_path("/");
    removal.set_http_only(true);
    removal.set_same_site(SameSite::Lax);
    removal.set_max_age(CookieDuration::seconds(0));
    jar = jar.remove(removal);

    (jar, Json(json!({})))
}

/// Resolve the session cookie to a user, or fail with a JSON 401.
pub async fn require_user(state: &AppState, jar: &CookieJar) -> Result<AuthUser, ApiError> {
    let token = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
        .ok_or_else(unauthenticated)?;

    match fetch_user_by_session(state.pool_ref(), token).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(unauthenticated()),
        Err(err) => {
            error!(?err, "failed to validate session");
            Err(server_error())
        }
    }
}

/// Whether `user` may edit content under the given course. Staff pass
/// unconditionally; everyone else needs a course_access grant.
pub async fn has_course_access(
    pool: &PgPool,
    user: &AuthUser,
    org: &str,
    course: &str,
) -> sqlx::Result<bool> {
    if user.is_staff {
        return Ok(true);
    }

    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM course_access WHERE user_id = $1 AND org = $2 AND course = $3)",
    )
    .bind(user.id)
    .bind(org)
    .bind(course)
    .fetch_one(pool)
    .await
}

/// Permission denial is a hard failure, surfaced as a JSON 403.
pub async fn require_course_access(
    state: &AppState,
    user: &AuthUser,
    org: &str,
    course: &str,
) -> Result<(), ApiError> {
    match has_course_access(state.pool_ref(), user, org, course).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(json_error(StatusCode::FORBIDDEN, "Permission denied.")),
        Err(err) => {
            error!(?err, "failed to evaluate course access");
            Err(server_error())
        }
    }
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let parsed = PasswordHash::new(password_hash);
    match parsed {
        Ok(hash) => Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok(),
        Err(_) => false,
    }
}

pub async fn fetch_user_by_username(
    pool: &PgPool,
    username: &str,
) -> sqlx::Result<Option<DbUserAuth>> {
    sqlx::query_as::<_, DbUserAuth>("SELECT id, password_hash FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_user_by_session(pool: &PgPool, token: Uuid) -> sqlx::Result<Option<AuthUser>> {
    sqlx::query_as::<_, AuthUser>(
        "SELECT users.id, users.username, users.full_name, users.is_staff FROM sessions JOIN users ON users.id = sessions.user_id WHERE sessions.id = $1 AND sessions.expires_at > NOW()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await
}

fn invalid_credentials() -> ApiError {
    json_error(StatusCode::UNAUTHORIZED, "Invalid username or password.")
}

fn unauthenticated() -> ApiError {
    json_error(StatusCode::UNAUTHORIZED, "Authentication required.")
}

fn server_error() -> ApiError {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
}
