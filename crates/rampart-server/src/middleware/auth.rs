//! Bearer authentication.
//!
//! Every failure (missing header, malformed header, bad signature, expired,
//! revoked) yields the same 401 body so callers cannot tell them apart.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use rampart_cache::SharedStore;
use rampart_core::{CoreError, Identity, RequestContext};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Blacklisted tokens live under this prefix in the shared store.
pub const BLACKLIST_PREFIX: &str = "token:blacklist:";

pub fn blacklist_key(token: &str) -> String {
    format!("{BLACKLIST_PREFIX}{token}")
}

/// Validates a bearer token and returns the caller it identifies.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, CoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// HMAC-SHA256 signed JWTs with a shared secret.
pub struct Hs256Verifier {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256Verifier {
    pub fn new(secret: &str, issuer: Option<&str>, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        match issuer {
            Some(iss) => {
                validation.set_required_spec_claims(&["exp", "sub", "iss"]);
                validation.set_issuer(&[iss]);
            }
            None => validation.set_required_spec_claims(&["exp", "sub"]),
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for Hs256Verifier {
    fn verify(&self, token: &str) -> Result<Identity, CoreError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| {
                tracing::debug!(error = %e, "JWT validation failed");
                CoreError::Unauthorized
            },
        )?;
        Ok(Identity {
            subject: data.claims.sub,
            roles: data.claims.roles,
        })
    }
}

/// Revoked tokens, kept in the shared store until they would have expired.
#[derive(Clone, Default)]
pub struct TokenBlacklist {
    store: Option<Arc<dyn SharedStore>>,
}

impl TokenBlacklist {
    pub fn new(store: Option<Arc<dyn SharedStore>>) -> Self {
        Self { store }
    }

    pub async fn revoke(
        &self,
        ctx: &RequestContext,
        token: &str,
        ttl: Duration,
    ) -> Result<(), CoreError> {
        let Some(store) = &self.store else {
            return Err(CoreError::backend_unavailable("no shared store configured"));
        };
        store
            .set(ctx, &blacklist_key(token), b"1", ttl)
            .await
            .map_err(CoreError::from)
    }

    /// A store failure is logged and treated as "not revoked": the token has
    /// already passed signature and expiry checks.
    pub async fn is_revoked(&self, ctx: &RequestContext, token: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.exists(ctx, &blacklist_key(token)).await {
            Ok(revoked) => revoked,
            Err(e) => {
                tracing::warn!(error = %e, "token blacklist lookup failed");
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
    pub blacklist: TokenBlacklist,
}

pub async fn require_auth(
    State(auth): State<AuthState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(RequestContext::background);

    match authenticate(&auth, &ctx, req.headers()).await {
        Ok(identity) => {
            tracing::debug!(subject = %identity.subject, "token validated");
            req.extensions_mut().insert(ctx.with_identity(identity));
            next.run(req).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn authenticate(
    auth: &AuthState,
    ctx: &RequestContext,
    headers: &axum::http::HeaderMap,
) -> Result<Identity, CoreError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(CoreError::Unauthorized)?;

    let identity = auth.verifier.verify(token)?;
    if auth.blacklist.is_revoked(ctx, token).await {
        tracing::debug!(subject = %identity.subject, "revoked token presented");
        return Err(CoreError::Unauthorized);
    }
    Ok(identity)
}
