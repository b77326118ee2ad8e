//! Admin authentication.
//!
//! Admin routes accept either HTTP Basic credentials or the signed session
//! cookie issued by `POST /admin/login`.

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tutor_common::config::AuthConfig;

/// Name of the admin session cookie.
pub const ADMIN_COOKIE: &str = "admin_token";

/// Realm sent in the Basic challenge.
pub const ADMIN_REALM: &str = "Tutor Admin";

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (admin username)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
}

/// Authentication state shared across requests.
#[derive(Clone)]
pub struct AuthState {
    jwt_secret: Arc<String>,
    token_expiry_secs: u64,
    admin_username: Arc<String>,
    admin_password: Arc<String>,
    cookie_secure: bool,
}

impl AuthState {
    /// Create a new auth state with the given JWT secret and admin credentials.
    pub fn new(
        jwt_secret: impl Into<String>,
        token_expiry_secs: u64,
        admin_username: impl Into<String>,
        admin_password: impl Into<String>,
    ) -> Self {
        Self {
            jwt_secret: Arc::new(jwt_secret.into()),
            token_expiry_secs,
            admin_username: Arc::new(admin_username.into()),
            admin_password: Arc::new(admin_password.into()),
            cookie_secure: false,
        }
    }

    /// Build from configuration. Without a configured secret, a random one
    /// is generated and cookies do not outlive the process.
    pub fn from_config(config: &AuthConfig) -> Self {
        let secret = match config.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => secret.to_string(),
            None => {
                tracing::warn!("No auth secret configured, admin cookies will not survive a restart");
                format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
            }
        };

        let mut state = Self::new(
            secret,
            config.token_expiry_secs,
            config.admin_username.clone(),
            config.admin_password.clone(),
        );
        state.cookie_secure = config.cookie_secure;
        state
    }

    /// Generate a new JWT token for the admin.
    pub fn generate_token(&self, username: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp() as usize;
        let exp = now + self.token_expiry_secs as usize;

        let claims = Claims {
            sub: username.to_string(),
            exp,
            iat: now,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// Validate a JWT token and return the claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )?;

        Ok(token_data.claims)
    }

    /// Whether the pair matches the configured admin credentials.
    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        constant_time_eq(username.as_bytes(), self.admin_username.as_bytes())
            & constant_time_eq(password.as_bytes(), self.admin_password.as_bytes())
    }

    /// `Set-Cookie` value carrying `token`.
    pub fn session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{ADMIN_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
            self.token_expiry_secs
        );
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> String {
        format!("{ADMIN_COOKIE}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0")
    }

    /// Identify the admin from request headers, if any credential is valid.
    pub fn authorize(&self, headers: &HeaderMap) -> Option<AdminUser> {
        if let Some((username, password)) = basic_credentials(headers) {
            if self.check_credentials(&username, &password) {
                return Some(AdminUser { username });
            }
            tracing::warn!(username = %username, "Rejected admin Basic credentials");
        }

        let token = cookie_value(headers, ADMIN_COOKIE)?;
        match self.validate_token(&token) {
            Ok(claims) => Some(AdminUser {
                username: claims.sub,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "Rejected admin cookie");
                None
            }
        }
    }
}

/// Admin identity attached to authorized requests.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub username: String,
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Decode `Authorization: Basic ...` into (username, password).
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// 401 with a Basic challenge.
pub fn unauthorized() -> Response {
    let challenge = HeaderValue::from_str(&format!("Basic realm=\"{ADMIN_REALM}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"));

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(serde_json::json!({ "error": "Authentication required" })),
    )
        .into_response()
}

/// Admin authentication middleware.
pub async fn admin_auth_middleware(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    match auth.authorize(request.headers()) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => unauthorized(),
    }
}
