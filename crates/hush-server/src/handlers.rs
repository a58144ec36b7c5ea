use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    error::SharingError,
    policy::ActorContext,
    sharing::SharePayload,
    store::{self, SharedSecret},
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub encrypted_value: String,
    pub iv: String,
    #[serde(alias = "tag")]
    pub auth_tag: String,
    #[serde(alias = "hashed_hex")]
    pub lookup_hash: String,
    /// Absolute deadline (unix seconds). Mutually exclusive with `ttl_seconds`.
    pub expires_at: Option<i64>,
    pub ttl_seconds: Option<u64>,
    pub expires_after_views: Option<u32>,
}

impl CreateRequest {
    fn into_payload(self) -> Result<SharePayload, SharingError> {
        let expires_at = match (self.expires_at, self.ttl_seconds) {
            (Some(_), Some(_)) => {
                return Err(SharingError::InvalidInput(
                    "set either expires_at or ttl_seconds, not both".into(),
                ))
            }
            (Some(at), None) => Some(at),
            (None, Some(ttl)) => Some(store::now().saturating_add_unsigned(ttl)),
            (None, None) => None,
        };
        Ok(SharePayload {
            encrypted_value: self.encrypted_value,
            iv: self.iv,
            auth_tag: self.auth_tag,
            lookup_hash: self.lookup_hash,
            expires_at,
            expires_after_views: self.expires_after_views,
        })
    }
}

/// A stored secret as rendered to clients. The lookup hash is never echoed.
#[derive(Debug, Serialize, Deserialize)]
pub struct SharedSecretView {
    pub id: String,
    pub owner_user_id: Option<String>,
    pub organization_id: Option<String>,
    pub encrypted_value: String,
    pub iv: String,
    pub auth_tag: String,
    pub expires_at: Option<i64>,
    pub expires_after_views: Option<u32>,
    pub created_at: i64,
}

impl From<&SharedSecret> for SharedSecretView {
    fn from(s: &SharedSecret) -> Self {
        Self {
            id: s.id.clone(),
            owner_user_id: s.owner_user_id.clone(),
            organization_id: s.organization_id.clone(),
            encrypted_value: s.encrypted_value.clone(),
            iv: s.iv.clone(),
            auth_tag: s.auth_tag.clone(),
            expires_at: s.expires_at,
            expires_after_views: s.expires_after_views,
            created_at: s.created_at,
        }
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

pub async fn create_secret(
    State(state): State<AppState>,
    Extension(ctx): Extension<ActorContext>,
    Json(body): Json<CreateRequest>,
) -> Response {
    let created = body
        .into_payload()
        .and_then(|payload| state.engine.create_shared_secret(&ctx, payload));
    match created {
        Ok(created) => {
            info!(
                id = %created.id,
                actor_id = %ctx.actor_id,
                org_id = %ctx.org_id,
                "shared secret created"
            );
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn create_public_secret(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> Response {
    let created = body
        .into_payload()
        .and_then(|payload| state.engine.create_public_shared_secret(payload));
    match created {
        Ok(created) => {
            info!(id = %created.id, "public shared secret created");
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── List ──────────────────────────────────────────────────────────────────────

pub async fn list_secrets(
    State(state): State<AppState>,
    Extension(ctx): Extension<ActorContext>,
) -> Response {
    match state.engine.get_shared_secrets(&ctx) {
        Ok(secrets) => {
            debug!(count = secrets.len(), actor_id = %ctx.actor_id, "listed shared secrets");
            let views: Vec<SharedSecretView> = secrets.iter().map(Into::into).collect();
            Json(json!({ "secrets": views })).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Retrieve ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RetrieveQuery {
    #[serde(alias = "hashedHex")]
    pub hashed_hex: String,
}

pub async fn get_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RetrieveQuery>,
) -> Response {
    match state
        .engine
        .get_active_shared_secret_by_id_and_hashed_hex(&id, &query.hashed_hex)
    {
        Ok(secret) => Json(SharedSecretView::from(&secret)).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Delete ────────────────────────────────────────────────────────────────────

pub async fn delete_secret(
    State(state): State<AppState>,
    Extension(ctx): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.delete_shared_secret_by_id(&ctx, &id) {
        Ok(deleted) => {
            info!(id = %id, actor_id = %ctx.actor_id, "shared secret deleted");
            Json(SharedSecretView::from(&deleted)).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn error_response(e: SharingError) -> Response {
    match e {
        SharingError::Unauthorized(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "actor is not a member of the organization"})),
        )
            .into_response(),
        SharingError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "secret not found"})),
        )
            .into_response(),
        SharingError::InvalidInput(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
        }
        e @ (SharingError::Store(_) | SharingError::Policy(_)) => internal_error(e),
    }
}

fn internal_error(e: SharingError) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
