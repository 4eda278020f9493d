use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

mod signing;

pub use signing::{sign_params, signed_purchase_params, verify_signature};

use crate::web::{ApiError, AppState, auth, json_error};

/// Price of a verified-certificate line when the course mode does not set one.
const DEFAULT_VERIFIED_PRICE: i64 = 30;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/course/:org/:course/enroll", get(enroll))
        .route("/course/:org/:course/enroll/choose", get(choose_mode))
        .route("/verify/:org/:course", get(verification_context))
        .route("/verify/create_order", post(create_order))
}

/// An enrollment mode offered by a course.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct CourseMode {
    pub mode_slug: String,
    pub mode_display_name: String,
    pub min_price: i64,
    pub currency: String,
}

impl CourseMode {
    fn honor(currency: &str) -> Self {
        Self {
            mode_slug: "honor".to_string(),
            mode_display_name: "Honor Code Certificate".to_string(),
            min_price: 0,
            currency: currency.to_string(),
        }
    }
}

/// What the enroll endpoint should do, decided from the enrollment state, the
/// requested mode, and the modes the course offers.
#[derive(Debug, PartialEq)]
enum EnrollOutcome<'a> {
    AlreadyEnrolled,
    ChooseMode,
    Enroll(&'a CourseMode),
    StartVerification(&'a CourseMode),
    UnknownMode,
}

/// New enrollments only: an existing enrollment short-circuits to the
/// dashboard. The caller guarantees `offered` is non-empty (the honor mode is
/// the catalog default).
fn enroll_decision<'a>(
    already_enrolled: bool,
    requested: Option<&str>,
    offered: &'a [CourseMode],
) -> EnrollOutcome<'a> {
    if already_enrolled {
        return EnrollOutcome::AlreadyEnrolled;
    }

    let slug = match requested {
        Some(slug) => slug,
        None if offered.len() > 1 => return EnrollOutcome::ChooseMode,
        None => match offered.first() {
            Some(only) => only.mode_slug.as_str(),
            None => return EnrollOutcome::UnknownMode,
        },
    };

    let Some(mode) = offered.iter().find(|mode| mode.mode_slug == slug) else {
        return EnrollOutcome::UnknownMode;
    };

    match mode.mode_slug.as_str() {
        "honor" | "audit" => EnrollOutcome::Enroll(mode),
        "verified" => EnrollOutcome::StartVerification(mode),
        _ => EnrollOutcome::UnknownMode,
    }
}

#[derive(Deserialize)]
struct EnrollQuery {
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Deserialize)]
struct CreateOrderRequest {
    course_id: String,
}

fn db_failure(err: sqlx::Error) -> ApiError {
    error!(?err, "enrollment database operation failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
}

async fn enroll(
    State(state): State<AppState>,
    AxumPath((org, course)): AxumPath<(String, String)>,
    jar: CookieJar,
    Query(query): Query<EnrollQuery>,
) -> Response {
    let user = match auth::require_user(&state, &jar).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    let course_id = format!("{org}/{course}");
    let pool = state.pool_ref();

    let already_enrolled = match is_enrolled(pool, user.id, &course_id).await {
        Ok(enrolled) => enrolled,
        Err(err) => return db_failure(err).into_response(),
    };
    let offered = match modes_for_course(pool, &course_id, &state.settings().payment.currency).await
    {
        Ok(offered) => offered,
        Err(err) => return db_failure(err).into_response(),
    };

    match enroll_decision(already_enrolled, query.mode.as_deref(), &offered) {
        EnrollOutcome::AlreadyEnrolled => Redirect::to("/dashboard").into_response(),
        EnrollOutcome::ChooseMode => {
            Redirect::to(&format!("/course/{org}/{course}/enroll/choose")).into_response()
        }
        EnrollOutcome::Enroll(mode) => {
            if let Err(err) = create_enrollment(pool, user.id, &course_id, &mode.mode_slug).await {
                return db_failure(err).into_response();
            }
            Redirect::to("/dashboard").into_response()
        }
        EnrollOutcome::StartVerification(_) => {
            // The payment step happens on the verification page; the pending
            // attempt is created up front so the page opens in progress.
            if let Err(err) = create_verification_attempt(pool, user.id).await {
                return db_failure(err).into_response();
            }
            Redirect::to(&format!("/verify/{org}/{course}")).into_response()
        }
        EnrollOutcome::UnknownMode => {
            json_error(StatusCode::BAD_REQUEST, "Unsupported enrollment mode.").into_response()
        }
    }
}

/// The mode-selection page data: every mode the course offers.
async fn choose_mode(
    State(state): State<AppState>,
    AxumPath((org, course)): AxumPath<(String, String)>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    auth::require_user(&state, &jar).await?;

    let course_id = format!("{org}/{course}");
    let offered = modes_for_course(
        state.pool_ref(),
        &course_id,
        &state.settings().payment.currency,
    )
    .await
    .map_err(db_failure)?;

    let modes: Vec<Value> = offered
        .iter()
        .map(|mode| {
            json!({
                "slug": mode.mode_slug,
                "name": mode.mode_display_name,
                "min_price": mode.min_price,
                "currency": mode.currency,
            })
        })
        .collect();

    Ok(Json(json!({ "course_id": course_id, "modes": modes })))
}

/// Context for the photo-verification flow: where the user is in it and what
/// the payment handoff needs.
async fn verification_context(
    State(state): State<AppState>,
    AxumPath((org, course)): AxumPath<(String, String)>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    let user = auth::require_user(&state, &jar).await?;
    let pool = state.pool_ref();

    // A valid or pending attempt skips straight to payment; otherwise the
    // flow restarts with a fresh attempt.
    let progress_state = if has_valid_or_pending_attempt(pool, user.id)
        .await
        .map_err(db_failure)?
    {
        "payment"
    } else {
        "start"
    };

    let course_id = format!("{org}/{course}");
    let course_name = course_display_name(pool, &org, &course)
        .await
        .map_err(db_failure)?
        .unwrap_or_else(|| course_id.clone());

    Ok(Json(json!({
        "progress_state": progress_state,
        "user_full_name": user.full_name,
        "course_id": course_id,
        "course_name": course_name,
        "purchase_endpoint": state.settings().payment.purchase_endpoint,
    })))
}

/// Create a pending verification attempt and a signed payment payload for a
/// verified-certificate purchase.
async fn create_order(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = auth::require_user(&state, &jar).await?;
    let pool = state.pool_ref();
    let payment = &state.settings().payment;

    create_verification_attempt(pool, user.id)
        .await
        .map_err(db_failure)?;

    let verified_mode = modes_for_course(pool, &request.course_id, &payment.currency)
        .await
        .map_err(db_failure)?
        .into_iter()
        .find(|mode| mode.mode_slug == "verified");
    let (unit_cost, currency) = match verified_mode {
        Some(mode) if mode.min_price > 0 => (mode.min_price, mode.currency),
        Some(mode) => (DEFAULT_VERIFIED_PRICE, mode.currency),
        None => (DEFAULT_VERIFIED_PRICE, payment.currency.clone()),
    };

    let cart = get_or_create_cart(pool, user.id).await.map_err(db_failure)?;
    replace_certificate_item(pool, cart, &request.course_id, "verified", unit_cost, &currency)
        .await
        .map_err(db_failure)?;

    let amount = cart_total(pool, cart).await.map_err(db_failure)?;
    let params = signed_purchase_params(payment, cart, amount, Utc::now());

    Ok(Json(Value::Object(params)))
}

async fn is_enrolled(pool: &PgPool, user_id: Uuid, course_id: &str) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM enrollments WHERE user_id = $1 AND course_id = $2)",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_one(pool)
    .await
}

/// Modes the course offers; every course has at least the honor mode.
async fn modes_for_course(
    pool: &PgPool,
    course_id: &str,
    default_currency: &str,
) -> sqlx::Result<Vec<CourseMode>> {
    let mut modes = sqlx::query_as::<_, CourseMode>(
        "SELECT mode_slug, mode_display_name, min_price, currency FROM course_modes
         WHERE course_id = $1 ORDER BY mode_slug",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    if modes.is_empty() {
        modes.push(CourseMode::honor(default_currency));
    }
    Ok(modes)
}

async fn create_enrollment(
    pool: &PgPool,
    user_id: Uuid,
    course_id: &str,
    mode: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO enrollments (id, user_id, course_id, mode) VALUES ($1, $2, $3, $4)
         ON CONFLICT (user_id, course_id) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(course_id)
    .bind(mode)
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_verification_attempt(pool: &PgPool, user_id: Uuid) -> sqlx::Result<Uuid> {
    let attempt_id = Uuid::new_v4();
    sqlx::query("INSERT INTO verification_attempts (id, user_id, status) VALUES ($1, $2, 'pending')")
        .bind(attempt_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(attempt_id)
}

async fn has_valid_or_pending_attempt(pool: &PgPool, user_id: Uuid) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM verification_attempts
         WHERE user_id = $1 AND status IN ('pending', 'approved'))",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
}

/// The user's open cart order, created on first use.
async fn get_or_create_cart(pool: &PgPool, user_id: Uuid) -> sqlx::Result<Uuid> {
    let existing: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM orders WHERE user_id = $1 AND status = 'cart' ORDER BY created_at LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    if let Some(cart) = existing {
        return Ok(cart);
    }

    let cart = Uuid::new_v4();
    sqlx::query("INSERT INTO orders (id, user_id, status) VALUES ($1, $2, 'cart')")
        .bind(cart)
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(cart)
}

/// At most one certificate line per course in a cart; re-ordering replaces it.
async fn replace_certificate_item(
    pool: &PgPool,
    order_id: Uuid,
    course_id: &str,
    mode: &str,
    unit_cost: i64,
    currency: &str,
) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM certificate_items WHERE order_id = $1 AND course_id = $2")
        .bind(order_id)
        .bind(course_id)
        .execute(pool)
        .await?;

    sqlx::query(
        "INSERT INTO certificate_items (id, order_id, course_id, mode, unit_cost, currency)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(Uuid::new_v4())
    .bind(order_id)
    .bind(course_id)
    .bind(mode)
    .bind(unit_cost)
    .bind(currency)
    .execute(pool)
    .await?;

    Ok(())
}

async fn cart_total(pool: &PgPool, order_id: Uuid) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(unit_cost), 0)::BIGINT FROM certificate_items WHERE order_id = $1",
    )
    .bind(order_id)
    .fetch_one(pool)
    .await
}

async fn course_display_name(
    pool: &PgPool,
    org: &str,
    course: &str,
) -> sqlx::Result<Option<String>> {
    let name: Option<Option<String>> = sqlx::query_scalar(
        "SELECT metadata->>'display_name' FROM items
         WHERE org = $1 AND course = $2 AND category = 'course' LIMIT 1",
    )
    .bind(org)
    .bind(course)
    .fetch_optional(pool)
    .await?;

    Ok(name.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(slug: &str, min_price: i64) -> CourseMode {
        CourseMode {
            mode_slug: slug.to_string(),
            mode_display_name: slug.to_string(),
            min_price,
            currency: "usd".to_string(),
        }
    }

    #[test]
    fn enrolled_users_go_to_the_dashboard() {
        let offered = vec![mode("honor", 0), mode("verified", 30)];
        assert_eq!(
            enroll_decision(true, Some("verified"), &offered),
            EnrollOutcome::AlreadyEnrolled
        );
    }

    #[test]
    fn missing_mode_with_several_offers_asks_the_user() {
        let offered = vec![mode("honor", 0), mode("verified", 30)];
        assert_eq!(
            enroll_decision(false, None, &offered),
            EnrollOutcome::ChooseMode
        );
    }

    #[test]
    fn missing_mode_with_one_offer_uses_it() {
        let offered = vec![mode("honor", 0)];
        assert_eq!(
            enroll_decision(false, None, &offered),
            EnrollOutcome::Enroll(&offered[0])
        );
    }

    #[test]
    fn honor_and_audit_enroll_immediately() {
        let offered = vec![mode("audit", 0), mode("honor", 0), mode("verified", 30)];
        assert_eq!(
            enroll_decision(false, Some("honor"), &offered),
            EnrollOutcome::Enroll(&offered[1])
        );
        assert_eq!(
            enroll_decision(false, Some("audit"), &offered),
            EnrollOutcome::Enroll(&offered[0])
        );
    }

    #[test]
    fn verified_mode_starts_the_payment_flow() {
        let offered = vec![mode("honor", 0), mode("verified", 30)];
        assert_eq!(
            enroll_decision(false, Some("verified"), &offered),
            EnrollOutcome::StartVerification(&offered[1])
        );
    }

    #[test]
    fn unoffered_mode_is_rejected() {
        let offered = vec![mode("honor", 0)];
        assert_eq!(
            enroll_decision(false, Some("verified"), &offered),
            EnrollOutcome::UnknownMode
        );
        assert_eq!(
            enroll_decision(false, Some("professional"), &offered),
            EnrollOutcome::UnknownMode
        );
    }
}
