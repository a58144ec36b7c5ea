use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde_json::json;

use crate::{
    policy::{ActorContext, ActorType},
    AppState,
};

pub const HEADER_ACTOR_TYPE: &str = "x-actor-type";
pub const HEADER_ACTOR_ID: &str = "x-actor-id";
pub const HEADER_ORG_ID: &str = "x-org-id";
pub const HEADER_ACTOR_AUTH_METHOD: &str = "x-actor-auth-method";
pub const HEADER_ACTOR_ORG_ID: &str = "x-actor-org-id";

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

/// Axum middleware for routes that act on behalf of an organization member.
///
/// The upstream proxy authenticates the caller and asserts the actor context
/// in headers. When an upstream key is configured the request must also carry
/// `Authorization: Bearer <key>`, otherwise the headers are not trusted.
pub async fn require_actor(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(ref key) = state.upstream_key {
        let token = request
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match token {
            Some(t) if constant_time_eq(t.as_bytes(), key.as_bytes()) => {}
            _ => return unauthorized("unauthorized"),
        }
    }

    match actor_from_headers(request.headers()) {
        Some(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        None => unauthorized("missing or malformed actor context"),
    }
}

/// Parse the actor context headers. Returns `None` if a required header is
/// missing, empty, or not valid UTF-8.
pub fn actor_from_headers(headers: &HeaderMap) -> Option<ActorContext> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };

    Some(ActorContext {
        actor: ActorType::from_str(&get(HEADER_ACTOR_TYPE)?)?,
        actor_id: get(HEADER_ACTOR_ID)?,
        org_id: get(HEADER_ORG_ID)?,
        actor_auth_method: get(HEADER_ACTOR_AUTH_METHOD),
        actor_org_id: get(HEADER_ACTOR_ORG_ID),
    })
}
