//! HTTP Endpoints
//!
//! Twilio-style form webhooks answering with TwiML, plus admin and health
//! routes.

use std::time::Duration;

use axum::{
    extract::{Form, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use restaurant_agent_core::{normalize_phone_number, OrderStatus};
use restaurant_agent_dialogue::{TurnEvent, TurnOutcome};
use restaurant_agent_persistence::{ConversationFilter, OrderFilter, MAX_PAGE_LIMIT};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::ServerError;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(&state.config.server.cors_origins, state.config.server.cors_enabled);
    let timeout = Duration::from_secs(state.config.server.timeout_seconds);

    Router::new()
        // Telephony webhooks
        .route("/api/voice/incoming", post(incoming_call))
        .route("/api/webhook/speech", post(speech))
        .route("/api/webhook/no-input", post(no_input))
        .route("/api/webhook/status", post(call_status))
        .route("/api/webhook/fallback", post(fallback))
        // Admin
        .route("/api/admin/orders", get(list_orders))
        .route("/api/admin/orders/:call_id", get(get_order))
        .route("/api/admin/orders/:call_id/status", put(update_order_status))
        .route("/api/admin/conversations", get(list_conversations))
        .route("/api/admin/conversations/:call_id", get(get_conversation))
        .route("/api/admin/stats", get(call_statistics))
        // Health check
        .route("/health", get(health_check))
        // Prometheus metrics
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .layer(cors_layer)
        .with_state(state)
}

/// Build CORS layer from configured origins
///
/// - If cors_enabled is false, returns permissive layer (for dev)
/// - If cors_origins is empty or all invalid, no cross-origin access
/// - Otherwise, uses the configured origins
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let parsed_origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed_origins.is_empty() {
        tracing::info!("No valid CORS origins configured, cross-origin requests are rejected");
        return CorsLayer::new();
    }

    tracing::info!("CORS configured with {} origins", parsed_origins.len());
    CorsLayer::new()
        .allow_origin(parsed_origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any)
}

fn twiml(outcome: &TurnOutcome) -> Response {
    (
        [(header::CONTENT_TYPE, "application/xml")],
        outcome.to_xml(),
    )
        .into_response()
}

/// Inbound call
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IncomingCall {
    call_sid: String,
    #[serde(default)]
    from: String,
}

async fn incoming_call(State(state): State<AppState>, Form(form): Form<IncomingCall>) -> Response {
    let phone = normalize_phone_number(&form.from);
    tracing::info!(call_id = %form.call_sid, phone = %phone, "Incoming call");
    let outcome = state.engine.start_call(&form.call_sid, &phone).await;
    twiml(&outcome)
}

/// Speech recognition result
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpeechEvent {
    call_sid: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    speech_result: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
}

async fn speech(State(state): State<AppState>, Form(form): Form<SpeechEvent>) -> Response {
    let confidence = form
        .confidence
        .as_deref()
        .and_then(|c| c.trim().parse::<f32>().ok())
        .unwrap_or(0.0);
    tracing::debug!(call_id = %form.call_sid, confidence, "Speech received");

    let event = TurnEvent::new(
        form.call_sid,
        normalize_phone_number(&form.from),
        form.speech_result.unwrap_or_default(),
    );
    let outcome = state.engine.handle_turn(event).await;
    twiml(&outcome)
}

/// Gather finished without speech
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallEvent {
    call_sid: String,
    #[serde(default)]
    from: String,
}

async fn no_input(State(state): State<AppState>, Form(form): Form<CallEvent>) -> Response {
    let phone = normalize_phone_number(&form.from);
    let outcome = state.engine.handle_no_input(&form.call_sid, &phone).await;
    twiml(&outcome)
}

/// Call status callback
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusCallback {
    call_sid: String,
    call_status: String,
    #[serde(default)]
    call_duration: Option<String>,
}

async fn call_status(
    State(state): State<AppState>,
    Form(form): Form<StatusCallback>,
) -> Json<serde_json::Value> {
    let duration = form
        .call_duration
        .as_deref()
        .and_then(|d| d.trim().parse::<u32>().ok());
    tracing::info!(
        call_id = %form.call_sid,
        status = %form.call_status,
        duration = ?duration,
        "Call status update"
    );

    let finalized = state
        .engine
        .handle_status(&form.call_sid, &form.call_status, duration)
        .await;

    Json(serde_json::json!({
        "status": "success",
        "finalized": finalized,
    }))
}

/// Telephony-side error
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FallbackEvent {
    call_sid: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

async fn fallback(State(state): State<AppState>, Form(form): Form<FallbackEvent>) -> Response {
    tracing::error!(
        call_id = %form.call_sid,
        error_code = form.error_code.as_deref().unwrap_or(""),
        error_message = form.error_message.as_deref().unwrap_or(""),
        "Telephony fallback triggered"
    );
    let phone = normalize_phone_number(&form.from);
    let outcome = state.engine.handle_fallback(&form.call_sid, &phone).await;
    twiml(&outcome)
}

fn page_limit(limit: Option<usize>) -> Result<usize, ServerError> {
    match limit {
        None => Ok(restaurant_agent_persistence::query::DEFAULT_PAGE_LIMIT),
        Some(n) if (1..=MAX_PAGE_LIMIT).contains(&n) => Ok(n),
        Some(n) => Err(ServerError::InvalidRequest(format!(
            "limit must be between 1 and {}, got {}",
            MAX_PAGE_LIMIT, n
        ))),
    }
}

fn storage_error(e: restaurant_agent_persistence::PersistenceError) -> StatusCode {
    tracing::error!(error = %e, "Admin query failed");
    StatusCode::from(ServerError::from(e))
}

#[derive(Debug, Deserialize)]
struct OrderQuery {
    phone: Option<String>,
    status: Option<String>,
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

/// Order listing. With `phone`, the caller's history, newest first.
async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if let Some(phone) = query.phone.as_deref() {
        return order_history(&state, phone).await;
    }

    let status = query
        .status
        .as_deref()
        .map(str::parse::<OrderStatus>)
        .transpose()
        .map_err(|e| StatusCode::from(ServerError::InvalidRequest(e.to_string())))?;
    let filter = OrderFilter {
        status,
        from: query.from_date,
        to: query.to_date,
        offset: query.offset,
        limit: page_limit(query.limit)?,
    };

    let page = state.repository.list_orders(&filter).await.map_err(storage_error)?;
    Ok(Json(serde_json::json!(page)))
}

async fn order_history(state: &AppState, phone: &str) -> Result<Json<serde_json::Value>, StatusCode> {
    if phone.trim().is_empty() {
        return Err(ServerError::InvalidRequest("phone is required".into()).into());
    }
    let phone = normalize_phone_number(phone);

    let orders = state
        .repository
        .get_order_history(&phone)
        .await
        .map_err(storage_error)?;

    Ok(Json(serde_json::json!({
        "phone": phone,
        "count": orders.len(),
        "orders": orders,
    })))
}

/// One call's order and its conversation log
async fn get_order(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let order = state
        .repository
        .get_order_for_call(&call_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| StatusCode::from(ServerError::NotFound(format!("order for {}", call_id))))?;
    let conversation = state
        .repository
        .get_conversation(&call_id)
        .await
        .map_err(storage_error)?;

    Ok(Json(serde_json::json!({
        "order": order,
        "conversation": conversation,
    })))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

async fn update_order_status(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Query(update): Query<StatusUpdate>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let status: OrderStatus = update
        .status
        .parse()
        .map_err(|e: restaurant_agent_core::Error| {
            StatusCode::from(ServerError::InvalidRequest(format!(
                "{}. Must be one of: confirmed, modified, cancelled",
                e
            )))
        })?;

    let order = state
        .repository
        .update_order_status(&call_id, status)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| StatusCode::from(ServerError::NotFound(format!("order for {}", call_id))))?;

    tracing::info!(call_id = %call_id, status = status.as_str(), "Order status changed by admin");
    Ok(Json(serde_json::json!({
        "status": "success",
        "call_id": call_id,
        "order_id": order.order_id,
        "new_status": order.status,
    })))
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
    sentiment_min: Option<f32>,
    sentiment_max: Option<f32>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    for bound in [query.sentiment_min, query.sentiment_max].into_iter().flatten() {
        if !(-1.0..=1.0).contains(&bound) {
            return Err(ServerError::InvalidRequest(format!(
                "sentiment bounds must be within [-1, 1], got {}",
                bound
            ))
            .into());
        }
    }
    let filter = ConversationFilter {
        from: query.from_date,
        to: query.to_date,
        sentiment_min: query.sentiment_min,
        sentiment_max: query.sentiment_max,
        offset: query.offset,
        limit: page_limit(query.limit)?,
    };

    let page = state
        .repository
        .list_conversations(&filter)
        .await
        .map_err(storage_error)?;
    Ok(Json(serde_json::json!(page)))
}

/// One call's conversation log and its order
async fn get_conversation(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let conversation = state
        .repository
        .get_conversation(&call_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| {
            StatusCode::from(ServerError::NotFound(format!("conversation for {}", call_id)))
        })?;
    let order = state
        .repository
        .get_order_for_call(&call_id)
        .await
        .map_err(storage_error)?;

    Ok(Json(serde_json::json!({
        "conversation": conversation,
        "order": order,
    })))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default = "default_stats_days")]
    days: i64,
}

fn default_stats_days() -> i64 {
    7
}

async fn call_statistics(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !(1..=90).contains(&query.days) {
        return Err(ServerError::InvalidRequest(format!(
            "days must be between 1 and 90, got {}",
            query.days
        ))
        .into());
    }
    let to = Utc::now();
    let from = to - chrono::Duration::days(query.days);

    let stats = state
        .repository
        .call_statistics(from, to)
        .await
        .map_err(storage_error)?;
    Ok(Json(serde_json::json!(stats)))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "restaurant": state.config.restaurant.name,
        "active_calls": state.engine.sessions().len(),
    }))
}
