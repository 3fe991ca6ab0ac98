use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{info, warn, Instrument};

use clippa_core::ids::{MemberId, PartyId};
use clippa_core::security::{hash_secret, verify_secret, PartySecret};
use clippa_store::{NewParty, PartyRow, StoreError};

use crate::error::ApiError;
use crate::server::AppState;
use crate::session::{run_session_until, split_socket};

const SECRET_HEADER: &str = "x-secret";

#[derive(Debug, Deserialize)]
pub struct CreatePartyRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyResponse {
    pub id: PartyId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leader_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert_pem: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_pem: String,
}

impl From<PartyRow> for PartyResponse {
    fn from(row: PartyRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            leader_address: row.leader_address,
            cert_pem: row.cert_pem,
            key_pem: row.key_pem,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct PartyQuery {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinQuery {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token: String,
    #[serde(rename = "memberId")]
    pub member_id: Option<String>,
}

/// `POST /api/parties/`
pub async fn create_party(
    State(state): State<AppState>,
    body: Result<Json<CreatePartyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PartyResponse>), ApiError> {
    let Json(req) = body.map_err(|_| ApiError::BadRequest("invalid request body".into()))?;
    let name = req.name.trim().to_string();
    let secret = PartySecret::new(req.secret.trim());
    if name.is_empty() || secret.is_blank() {
        return Err(ApiError::BadRequest("name and secret are required".into()));
    }

    let parties = state.parties.clone();
    let cost = state.secret_cost;
    let party = task::spawn_blocking(move || -> Result<PartyRow, ApiError> {
        let secret_hash = hash_secret(&secret, cost)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        parties
            .create(NewParty {
                name,
                secret_hash,
                ..Default::default()
            })
            .map_err(|e| ApiError::Internal(format!("create party: {e}")))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("create party task failed: {e}")))??;

    info!(party_id = %party.id, "party created");
    Ok((StatusCode::CREATED, Json(party.into())))
}

/// `GET /api/parties/?id=` with `X-Secret`.
pub async fn get_party(
    State(state): State<AppState>,
    Query(query): Query<PartyQuery>,
    headers: HeaderMap,
) -> Result<Json<PartyResponse>, ApiError> {
    let party = authorize(&state, &query, &headers, "unauthorized").await?;
    Ok(Json(party.into()))
}

/// `GET /api/parties/auth?id=` with `X-Secret`. Issues a single-use join token.
pub async fn authenticate(
    State(state): State<AppState>,
    Query(query): Query<PartyQuery>,
    headers: HeaderMap,
) -> Result<Json<AuthResponse>, ApiError> {
    let party = authorize(&state, &query, &headers, "invalid party").await?;
    let token = state.tokens.issue(party.id);
    Ok(Json(AuthResponse { token }))
}

/// Check the party id and secret. Unknown parties and wrong secrets are
/// indistinguishable to the caller.
async fn authorize(
    state: &AppState,
    query: &PartyQuery,
    headers: &HeaderMap,
    denial: &'static str,
) -> Result<PartyRow, ApiError> {
    let id = query.id.trim();
    let secret = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| PartySecret::new(s.trim()))
        .filter(|s| !s.is_blank());
    let (false, Some(secret)) = (id.is_empty(), secret) else {
        return Err(ApiError::BadRequest("id and secret are required".into()));
    };

    let parties = state.parties.clone();
    let party_id = PartyId::from_raw(id);
    task::spawn_blocking(move || -> Result<PartyRow, ApiError> {
        let party = match parties.get(&party_id) {
            Ok(party) => party,
            Err(StoreError::NotFound(_)) => {
                warn!(party_id = %party_id, "party not found");
                return Err(ApiError::Unauthorized(denial.into()));
            }
            Err(e) => return Err(ApiError::Internal(format!("get party: {e}"))),
        };
        if !verify_secret(&secret, &party.secret_hash) {
            warn!(party_id = %party_id, "invalid secret");
            return Err(ApiError::Unauthorized(denial.into()));
        }
        Ok(party)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("authorize task failed: {e}")))?
}

/// `GET /api/parties/join?id=&token=[&memberId=]`, upgraded to a WebSocket.
///
/// The token is consumed before the upgrade, whether or not it succeeds.
pub async fn join_party(
    State(state): State<AppState>,
    Query(query): Query<JoinQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let id = query.id.trim();
    let token = query.token.trim();
    if id.is_empty() || token.is_empty() {
        return ApiError::BadRequest("token and id are required".into()).into_response();
    }

    let party_id = PartyId::from_raw(id);
    if let Err(e) = state.tokens.redeem(token, &party_id) {
        warn!(party_id = %party_id, error = %e, "join refused");
        return ApiError::Unauthorized("unauthorized".into()).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let member_id = MemberId::from_requested(query.member_id.as_deref());
    let span = tracing::info_span!("session", party_id = %party_id, member_id = %member_id);

    ws.on_upgrade(move |socket| {
        async move {
            let handle = match state.registry.join(&party_id, member_id).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(error = %e, "join failed");
                    return;
                }
            };
            let (frames, sink) = split_socket(socket);
            run_session_until(frames, sink, handle, &state.session, state.shutdown.clone()).await;
        }
        .instrument(span)
    })
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "parties": state.registry.len(),
    }))
}
