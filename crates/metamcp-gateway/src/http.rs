//! Session/transport router: the client-facing HTTP surface.
//!
//! The routes authenticate the API key, enforce session ownership, and
//! forward into the rmcp server transports owned by
//! [`crate::services::McpServices`]. JSON-RPC framing, protocol
//! negotiation, and transport session state all live inside rmcp; this
//! layer only decides who may reach which transport.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use mmg_core::GatewayError;
use mmg_repo::{ApiKeyIdentity, ApiKeyStore, NamespaceStore};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::services::McpService;
use crate::sessions::{OwnedSession, SessionAccess};
use crate::state::AppState;

pub(crate) const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
const API_KEY_HEADER: &str = "x-api-key";
const INCLUDE_INACTIVE_QUERY: &str = "includeInactiveServers";

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_request_body_bytes;
    Router::new()
        .route("/health", get(crate::health::health_handler))
        .route("/metrics", get(crate::health::metrics_handler))
        .route(
            "/{namespace}/mcp",
            post(post_mcp).get(get_mcp).delete(delete_mcp),
        )
        .route("/{namespace}/sse", get(get_sse))
        .route("/{namespace}/message", post(post_message))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

struct Authenticated {
    secret: String,
    identity: ApiKeyIdentity,
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Authenticated, Response> {
    let secret = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    let Some(secret) = secret else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            GatewayError::AuthMissing.to_string(),
        ));
    };

    match state.deps.repo.validate(&secret).await {
        Ok(Some(identity)) => Ok(Authenticated { secret, identity }),
        Ok(None) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            GatewayError::AuthInvalid.to_string(),
        )),
        Err(error) => {
            tracing::error!(error = %error, "API-key validation failed");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ))
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn session_error(kind: SessionAccess, session_id: &str) -> Response {
    match kind {
        SessionAccess::Unknown | SessionAccess::NamespaceMismatch => {
            let mut response = (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": GatewayError::SessionUnknown(session_id.to_string()).to_string(),
                    "sessionId": session_id,
                })),
            )
                .into_response();
            if let Ok(value) = session_id.parse() {
                response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
            }
            response
        }
        SessionAccess::KeyMismatch => error_response(
            StatusCode::FORBIDDEN,
            GatewayError::SessionMismatch(session_id.to_string()).to_string(),
        ),
    }
}

fn parse_namespace(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        error_response(StatusCode::NOT_FOUND, format!("unknown namespace: {raw}"))
    })
}

fn session_header(headers: &HeaderMap) -> Result<Option<String>, Response> {
    let Some(raw) = headers.get(MCP_SESSION_ID_HEADER) else {
        return Ok(None);
    };
    raw.to_str()
        .map(|raw| Some(raw.to_string()))
        .map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid mcp-session-id header".to_string(),
            )
        })
}

async fn ensure_namespace(state: &AppState, namespace_uuid: Uuid) -> Result<(), Response> {
    match state.repo.namespace_exists(namespace_uuid).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("unknown namespace: {namespace_uuid}"),
        )),
        Err(error) => {
            tracing::error!(error = %error, "namespace lookup failed");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ))
        }
    }
}

fn include_inactive(params: &HashMap<String, String>) -> bool {
    params
        .get(INCLUDE_INACTIVE_QUERY)
        .is_some_and(|value| value == "true")
}

async fn forward(service: &McpService, request: Request) -> Response {
    service.clone().handle(request).await.into_response()
}

/// Transport for an already-owned session; the identity comes from the
/// ownership entry so a recreated service keeps the session's flag.
async fn service_for_session(state: &AppState, entry: &OwnedSession) -> McpService {
    state
        .services
        .streamable(
            entry.namespace_uuid,
            &entry.api_key,
            entry.key_uuid,
            entry.user_id,
            entry.include_inactive,
        )
        .await
}

/// `POST /{namespace}/mcp`: streamable-HTTP requests. The first
/// (session-less) request must be `initialize`; rmcp mints the session and
/// the response's `mcp-session-id` header is recorded in the ownership
/// index.
async fn post_mcp(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let namespace_uuid = match parse_namespace(&namespace) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    let auth = match authenticate(&state, request.headers()).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    let session_id = match session_header(request.headers()) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match session_id {
        Some(session_id) => {
            let entry = match state
                .sessions
                .access(&session_id, &auth.secret, namespace_uuid)
                .await
            {
                Ok(entry) => entry,
                Err(kind) => return session_error(kind, &session_id),
            };
            let service = service_for_session(&state, &entry).await;
            forward(&service, request).await
        }
        None => {
            let (parts, body) = request.into_parts();
            let bytes = match to_bytes(body, state.config.max_request_body_bytes).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        format!("unreadable request body: {error}"),
                    );
                }
            };
            let message: Value = match serde_json::from_slice(&bytes) {
                Ok(message) => message,
                Err(error) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        format!("invalid JSON-RPC body: {error}"),
                    );
                }
            };
            if message.get("method").and_then(Value::as_str) != Some("initialize") {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "missing mcp-session-id header".to_string(),
                );
            }
            if let Err(response) = ensure_namespace(&state, namespace_uuid).await {
                return response;
            }

            let flag = include_inactive(&params);
            let service = state
                .services
                .streamable(
                    namespace_uuid,
                    &auth.secret,
                    auth.identity.key_uuid,
                    auth.identity.user_id,
                    flag,
                )
                .await;
            let request = Request::from_parts(parts, Body::from(bytes));
            let response = forward(&service, request).await;

            if response.status().is_success() {
                if let Some(session_id) = response
                    .headers()
                    .get(MCP_SESSION_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                {
                    state
                        .sessions
                        .insert(Arc::new(OwnedSession::new(
                            session_id.to_string(),
                            namespace_uuid,
                            auth.secret.clone(),
                            auth.identity.key_uuid,
                            auth.identity.user_id,
                            flag,
                        )))
                        .await;
                    tracing::info!(
                        session_id = %session_id,
                        namespace = %namespace_uuid,
                        api_key_uuid = %auth.identity.key_uuid,
                        "session created"
                    );
                }
            }
            response
        }
    }
}

/// `GET /{namespace}/mcp`: server-initiated event stream for an existing
/// streamable-HTTP session.
async fn get_mcp(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    request: Request,
) -> Response {
    let namespace_uuid = match parse_namespace(&namespace) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    let auth = match authenticate(&state, request.headers()).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    let session_id = match session_header(request.headers()) {
        Ok(Some(id)) => id,
        Ok(None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "missing mcp-session-id header".to_string(),
            );
        }
        Err(response) => return response,
    };

    let entry = match state
        .sessions
        .access(&session_id, &auth.secret, namespace_uuid)
        .await
    {
        Ok(entry) => entry,
        Err(kind) => return session_error(kind, &session_id),
    };
    let service = service_for_session(&state, &entry).await;
    forward(&service, request).await
}

/// `DELETE /{namespace}/mcp`: closes one session, or every session owned
/// by the key when no session header is present.
async fn delete_mcp(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    request: Request,
) -> Response {
    let namespace_uuid = match parse_namespace(&namespace) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    let auth = match authenticate(&state, request.headers()).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    match session_header(request.headers()) {
        Err(response) => response,
        Ok(Some(session_id)) => {
            if let Err(kind) = state
                .sessions
                .access(&session_id, &auth.secret, namespace_uuid)
                .await
            {
                return session_error(kind, &session_id);
            }
            if let Some(entry) = state.sessions.remove(&session_id).await {
                state.services.close_streamable_session(&entry).await;
                tracing::info!(
                    session_id = %session_id,
                    age_secs = entry.created_at.elapsed().as_secs(),
                    "session closed"
                );
            }
            (StatusCode::OK, Json(json!({ "closed": session_id }))).into_response()
        }
        Ok(None) => {
            let removed = state.sessions.remove_all_for_key(&auth.secret).await;
            for entry in &removed {
                state.services.close_streamable_session(entry).await;
            }
            state.services.remove_for_key(&auth.secret).await;
            state.deps.pool.cleanup_api_key(&auth.secret).await;
            tracing::info!(
                api_key_uuid = %auth.identity.key_uuid,
                count = removed.len(),
                "closed all sessions for API key"
            );
            (
                StatusCode::OK,
                Json(json!({ "closedSessions": removed.len() })),
            )
                .into_response()
        }
    }
}

/// `GET /{namespace}/sse`: legacy SSE transport. rmcp's SSE server owns the
/// session and advertises the message endpoint as the first event.
async fn get_sse(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let namespace_uuid = match parse_namespace(&namespace) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    let auth = match authenticate(&state, request.headers()).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    if let Err(response) = ensure_namespace(&state, namespace_uuid).await {
        return response;
    }

    let router = state
        .services
        .sse_router(
            namespace_uuid,
            &auth.secret,
            auth.identity.key_uuid,
            auth.identity.user_id,
            include_inactive(&params),
        )
        .await;
    dispatch_sse(router, request).await
}

/// `POST /{namespace}/message?sessionId=...`: legacy SSE request channel.
/// Keyed transport isolation enforces ownership: a caller only ever reaches
/// the SSE server holding its own sessions.
async fn post_message(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    request: Request,
) -> Response {
    let namespace_uuid = match parse_namespace(&namespace) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    let auth = match authenticate(&state, request.headers()).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let Some(router) = state
        .services
        .existing_sse_router(namespace_uuid, &auth.secret)
        .await
    else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown session: no SSE stream open for this API key".to_string(),
        );
    };
    dispatch_sse(router, request).await
}

async fn dispatch_sse(router: Router, request: Request) -> Response {
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod http_tests;
