// JWT bearer-token middleware wrapping the process endpoints.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by platform tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Operator user name.
    pub sub: String,
    pub exp: usize,
}

/// Resolved caller identity, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct Operator(pub String);

#[derive(Clone)]
pub struct AuthState {
    decoding_key: DecodingKey,
}

impl AuthState {
    pub fn new(signing_key: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
        }
    }
}

/// Validate the bearer token and stash the operator identity for handlers.
pub async fn require_bearer(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = decode::<Claims>(token, &auth.decoding_key, &Validation::default())
        .map_err(|e| {
            tracing::debug!("token rejected: {}", e);
            StatusCode::UNAUTHORIZED
        })?
        .claims;

    request.extensions_mut().insert(Operator(claims.sub));
    Ok(next.run(request).await)
}
