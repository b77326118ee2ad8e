//! Tutor Gateway - HTTP backend for the programming tutor chat.
//!
//! This crate provides:
//! - Chat sessions persisted per session id with TTL expiry
//! - Blocking and streamed (SSE) replies from Gemini
//! - Password-protected administration of the system prompt and subject
//! - Health checks
//!
//! ## Architecture
//!
//! ```text
//! Client → routes → ChatService ─┬→ SessionManager ─┐
//!                                │                  ├→ StoreHandle (Redis | memory)
//!                                ├→ PromptStore ────┘
//!                                └→ Provider (Gemini)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod auth;
pub mod chat;
pub mod prompt;
pub mod provider;
pub mod routes;
pub mod session;

#[cfg(test)]
mod testing;

pub use auth::AuthState;
pub use chat::{ChatService, GenerationSettings};
pub use prompt::{PromptSnapshot, PromptStore};
pub use provider::{ChatRequest, ChatResponse, GeminiProvider, Provider, ProviderError};
pub use routes::AppState;
pub use session::{SessionManager, SessionRecord};

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tutor_common::config::Config;
use tutor_common::logging::generate_request_id;
use tutor_store::StoreHandle;

/// Wire the services for `config` over an already selected store.
pub fn build_state(config: &Config, store: StoreHandle, provider: Arc<dyn Provider>) -> AppState {
    let prompts = Arc::new(PromptStore::new(store.clone(), &config.prompt, &config.frontend));
    let sessions = Arc::new(SessionManager::new(store.clone(), &config.session));
    let chat = Arc::new(ChatService::new(
        sessions,
        Arc::clone(&prompts),
        provider,
        GenerationSettings::from(&config.llm),
    ));

    AppState {
        auth: AuthState::from_config(&config.auth),
        chat,
        prompts,
        store,
    }
}

/// Build the gateway router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().make_span_with(|request: &axum::extract::Request| {
        tracing::info_span!(
            "request",
            id = %generate_request_id(),
            method = %request.method(),
            uri = %request.uri(),
        )
    });

    routes::build_routes(state).layer(cors).layer(trace)
}

/// Start the gateway server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let store = tutor_store::make_store(&config.store).await;
    let provider = Arc::new(GeminiProvider::new(
        config.llm.api_key.as_deref(),
        config.llm.timeout_secs,
    ));
    let router = build_router(build_state(config, store, provider));

    tracing::info!("Starting Tutor Gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Tutor Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
