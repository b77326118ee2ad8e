//! Route definitions for the tutor gateway.
//!
//! Public chat endpoints, the password-protected prompt administration
//! endpoints, and health checks.

use crate::auth::{admin_auth_middleware, AuthState};
use crate::chat::ChatService;
use crate::prompt::PromptStore;
use axum::{
    extract::{
        rejection::{FormRejection, JsonRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    middleware,
    response::{
        sse::{Event, Sse},
        IntoResponse, Json, Response,
    },
    routing::{delete, get, post},
    Form, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tutor_common::config::parse_flag;
use tutor_common::Error;
use tutor_store::StoreHandle;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthState,
    pub chat: Arc<ChatService>,
    pub prompts: Arc<PromptStore>,
    pub store: StoreHandle,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map a service error to a response. Client errors carry their message;
/// everything else is reported as a server error.
fn error_response(e: &Error) -> ApiError {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match client_message(e) {
        Some(message) if status.is_client_error() => api_error(status, message),
        _ => {
            tracing::error!(error = %e, "Request failed");
            api_error(status, format!("Server error: {e}"))
        }
    }
}

fn client_message(e: &Error) -> Option<String> {
    match e {
        Error::InvalidInput(m) | Error::NotFound(m) => Some(m.clone()),
        Error::WithContext { source, .. } => client_message(source),
        _ => None,
    }
}

/// Chat request body.
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Chat reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
    pub store: String,
}

/// Current prompt settings as shown to the admin.
#[derive(Debug, Serialize, Deserialize)]
pub struct PromptSettingsResponse {
    pub prompt: String,
    pub subject: String,
    pub saved_prompts: BTreeMap<String, String>,
    pub default_prompt: String,
    pub default_subject: String,
}

/// Prompt update form.
#[derive(Debug, Deserialize)]
pub struct PromptUpdateForm {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub prompt_name: Option<String>,
    #[serde(default)]
    pub set_as_default: Option<String>,
}

/// One saved prompt.
#[derive(Debug, Serialize, Deserialize)]
pub struct SavedPromptResponse {
    pub name: String,
    pub prompt: String,
}

/// Query of `DELETE /admin/prompts`.
#[derive(Debug, Deserialize)]
pub struct DeletePromptQuery {
    pub name: Option<String>,
}

/// Login form.
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Plain acknowledgment.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Build the router with all routes.
pub fn build_routes(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/prompt", get(get_prompt_settings).post(update_prompt_settings))
        .route("/admin/prompts", delete(delete_prompt_handler))
        .route("/admin/prompts/:name", get(get_saved_prompt_handler))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/admin/login", post(login_handler))
        .route("/admin/logout", post(logout_handler))
        .merge(admin)
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat Handlers
// ─────────────────────────────────────────────────────────────────────────────

fn chat_fields(body: Result<Json<ChatBody>, JsonRejection>) -> Result<(String, String), ApiError> {
    let Json(body) = body.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;
    Ok((
        body.session_id.unwrap_or_default(),
        body.message.unwrap_or_default(),
    ))
}

async fn chat_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatReply>, ApiError> {
    let (session_id, message) = chat_fields(body)?;

    let response = state
        .chat
        .exchange(&session_id, &message)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(ChatReply { response }))
}

async fn chat_stream_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (session_id, message) = chat_fields(body)?;

    let fragments = state
        .chat
        .exchange_stream(&session_id, &message)
        .await
        .map_err(|e| error_response(&e))?;

    // Event data may not carry carriage returns
    let events = fragments.map(|item| {
        Ok::<_, Infallible>(match item {
            Ok(fragment) => Event::default().data(fragment.replace('\r', "")),
            Err(e) => Event::default()
                .event("error")
                .data(e.to_string().replace('\r', "")),
        })
    });

    Ok(Sse::new(events))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn prompt_settings(prompts: &PromptStore) -> PromptSettingsResponse {
    let current = prompts.snapshot().await;
    let defaults = prompts.defaults();
    PromptSettingsResponse {
        prompt: current.prompt,
        subject: current.subject,
        saved_prompts: prompts.list_saved_prompts().await,
        default_prompt: defaults.prompt,
        default_subject: defaults.subject,
    }
}

async fn get_prompt_settings(State(state): State<AppState>) -> Json<PromptSettingsResponse> {
    Json(prompt_settings(&state.prompts).await)
}

async fn update_prompt_settings(
    State(state): State<AppState>,
    form: Result<Form<PromptUpdateForm>, FormRejection>,
) -> Result<Json<PromptSettingsResponse>, ApiError> {
    let Form(form) = form.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    let Some(prompt) = form.prompt.filter(|p| !p.trim().is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "No prompt provided"));
    };
    let make_default = form
        .set_as_default
        .as_deref()
        .and_then(parse_flag)
        .unwrap_or(false);

    state
        .prompts
        .set_prompt(&prompt, make_default)
        .await
        .map_err(|e| error_response(&e))?;

    if let Some(subject) = form.subject.filter(|s| !s.trim().is_empty()) {
        state
            .prompts
            .set_subject(&subject)
            .await
            .map_err(|e| error_response(&e))?;
    }

    if let Some(name) = form.prompt_name.filter(|n| !n.trim().is_empty()) {
        state
            .prompts
            .save_prompt(name.trim(), &prompt)
            .await
            .map_err(|e| error_response(&e))?;
    }

    Ok(Json(prompt_settings(&state.prompts).await))
}

async fn get_saved_prompt_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SavedPromptResponse>, ApiError> {
    match state.prompts.get_saved_prompt(&name).await {
        Some(prompt) => Ok(Json(SavedPromptResponse { name, prompt })),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Prompt '{name}' not found"),
        )),
    }
}

async fn delete_prompt_handler(
    State(state): State<AppState>,
    Query(query): Query<DeletePromptQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Some(name) = query.name.filter(|n| !n.is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "No prompt name provided"));
    };

    state
        .prompts
        .delete_prompt(&name)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(MessageResponse {
        message: format!("Prompt '{name}' deleted successfully"),
    }))
}

async fn login_handler(
    State(state): State<AppState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let Form(form) = form.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    if !state.auth.check_credentials(&form.username, &form.password) {
        tracing::warn!(username = %form.username, "Failed admin login");
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid credentials"));
    }

    let token = state.auth.generate_token(&form.username).map_err(|e| {
        tracing::error!(error = %e, "Failed to generate token");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate token")
    })?;

    tracing::info!(username = %form.username, "Admin logged in");
    Ok((
        [(header::SET_COOKIE, state.auth.session_cookie(&token))],
        Json(MessageResponse {
            message: "Logged in".into(),
        }),
    )
        .into_response())
}

async fn logout_handler(State(state): State<AppState>) -> Response {
    (
        [(header::SET_COOKIE, state.auth.clear_cookie())],
        Json(MessageResponse {
            message: "Logged out".into(),
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.store.is_healthy().await {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "tutor-gateway".into(),
        store: state.store.backend().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_keep_their_message() {
        let (status, Json(body)) = error_response(&Error::InvalidInput("No message provided".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "No message provided");

        let wrapped = Error::NotFound("Prompt 'x' not found".into()).with_context("deleting");
        let (status, Json(body)) = error_response(&wrapped);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "Prompt 'x' not found");
    }

    #[test]
    fn test_server_errors_are_prefixed() {
        let (status, Json(body)) = error_response(&Error::External("[gemini:m] quota".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.error.starts_with("Server error: "));
        assert!(body.error.contains("quota"));
    }
}
