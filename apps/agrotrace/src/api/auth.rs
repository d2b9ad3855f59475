//! # Authentication Module
//!
//! Caller identification for the AgroTrace HTTP API.
//!
//! ## Configuration
//!
//! - `AGROTRACE_API_KEY`: If set, all requests (except /health) require
//!   either this service key or a user token
//! - `[[tokens]]` in the config file: bearer token -> user VTI id
//!
//! ## Usage
//!
//! ```text
//! Authorization: Bearer <token>
//! ```
//!
//! The resolved `Caller` is stored in the request extensions. Endpoints that
//! act on behalf of a user (the dashboard) require `Caller::User`.

use crate::config::TokenConfig;
use agrotrace_core::VtiId;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Environment variable holding the service API key.
pub const API_KEY_ENV: &str = "AGROTRACE_API_KEY";

// =============================================================================
// CALLER
// =============================================================================

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A user identified by a configured bearer token.
    User(VtiId),
    /// A holder of the service API key.
    Service,
    /// No credentials (only possible when no API key is configured).
    Anonymous,
}

impl Caller {
    #[must_use]
    pub fn user(&self) -> Option<&VtiId> {
        match self {
            Self::User(id) => Some(id),
            _ => None,
        }
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Credentials accepted by the API.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    api_key: Option<String>,
    tokens: Vec<(String, VtiId)>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(api_key: Option<String>, tokens: &[TokenConfig]) -> Self {
        Self {
            api_key,
            tokens: tokens
                .iter()
                .map(|t| (t.token.clone(), VtiId::new(t.user.as_str())))
                .collect(),
        }
    }

    /// Read the service key from the environment alongside the given tokens.
    #[must_use]
    pub fn from_env(tokens: &[TokenConfig]) -> Self {
        Self::new(get_api_key_from_env(), tokens)
    }

    #[must_use]
    pub fn requires_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Identify the holder of `provided`.
    ///
    /// Every configured token is compared so the time taken does not depend
    /// on which one matched.
    fn identify(&self, provided: &str) -> Option<Caller> {
        let mut caller = None;
        for (token, user) in &self.tokens {
            if keys_match(provided, token) && caller.is_none() {
                caller = Some(Caller::User(user.clone()));
            }
        }
        if let Some(ref key) = self.api_key {
            if keys_match(provided, key) && caller.is_none() {
                caller = Some(Caller::Service);
            }
        }
        caller
    }
}

/// Get API key from environment variable.
///
/// Returns `Some(key)` if `AGROTRACE_API_KEY` is set and non-empty.
pub fn get_api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// Constant-time comparison over equal-length padded buffers.
fn keys_match(provided: &str, expected: &str) -> bool {
    let provided_bytes = provided.as_bytes();
    let expected_bytes = expected.as_bytes();

    let max_len = provided_bytes.len().max(expected_bytes.len());
    let mut padded_provided = vec![0u8; max_len];
    let mut padded_expected = vec![0u8; max_len];
    padded_provided[..provided_bytes.len()].copy_from_slice(provided_bytes);
    padded_expected[..expected_bytes.len()].copy_from_slice(expected_bytes);

    let bytes_match: bool = padded_provided.ct_eq(&padded_expected).into();
    bytes_match && provided_bytes.len() == expected_bytes.len()
}

// =============================================================================
// MIDDLEWARE
// =============================================================================

/// Identify the caller and enforce the service key.
///
/// - A matching user token yields `Caller::User`
/// - If `AGROTRACE_API_KEY` is set, `/health` is always allowed and every
///   other request needs a user token or the key
/// - Otherwise unidentified requests pass as `Caller::Anonymous`
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).to_string());

    let caller = provided.as_deref().and_then(|p| auth.identify(p));

    let caller = match caller {
        Some(caller) => caller,
        None if !auth.requires_key() || request.uri().path() == "/health" => Caller::Anonymous,
        None => {
            let reason = if provided.is_some() {
                "invalid_api_key"
            } else {
                "missing_authorization_header"
            };
            tracing::warn!(event = "auth_failure", reason, "Authentication failed");
            return Err((StatusCode::UNAUTHORIZED, "Unauthorized"));
        }
    };

    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

// =============================================================================
// TESTS
// =============================================================================
