//! HTTP handlers for the Murmur server.
//!
//! A thin long-poll surface over [`Chat`]: join opens a session, update
//! holds a request open until the session has something to deliver, send
//! feeds one message to the router, close tears the session down and upload
//! stores attachments. The front proxy authenticates the caller and passes
//! the identity in the `x-user-id` and `x-user-name` headers.

use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use murmur_bus::{validate_topic, Bus, LocalBus};
use murmur_core::{Chat, PollOutcome, RoomKind, Session, UploadError, UploadFile};
use murmur_protocol::{codec, Message};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Status returned to a poll whose session was closed.
const DISCONNECTED_STATUS: u16 = 599;

/// Longest accepted user ID. Session topics append a token to it.
const MAX_USER_ID_LENGTH: usize = 128;

/// Shared server state.
pub struct AppState {
    /// The chat engine.
    pub chat: Arc<Chat>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the engine cannot be built or the listener fails.
pub async fn run_server(config: Config) -> Result<()> {
    let chat = Chat::new(config.chat_config(), Arc::new(LocalBus::new()))
        .context("Failed to build chat engine")?;

    match chat.attachments().cleanup().await {
        Ok(removed) => info!(dir = %chat.attachments().dir().display(), removed, "Upload directory cleaned"),
        Err(e) => warn!(dir = %chat.attachments().dir().display(), error = %e, "Failed to clean upload directory"),
    }

    chat.start().context("Failed to create default rooms")?;
    metrics::set_active_rooms(chat.rooms().count(RoomKind::Public));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let body_limit = config.upload.max_request_bytes;
    let state = Arc::new(AppState { chat, config });

    let app = Router::new()
        .route("/chat/join", get(join_handler))
        .route("/chat/update", get(update_handler))
        .route("/chat/send", post(send_handler))
        .route("/chat/close", get(close_handler))
        .route("/chat/upload", post(upload_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Murmur server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler. Reports 503 while the bus is unhealthy.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let bus = state.chat.bus();
    let (status, label) = if bus.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        warn!(bus = bus.name(), "Health check failed: bus unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    (
        status,
        Json(serde_json::json!({
            "status": label,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
        .into_response()
}

/// Authenticated caller, as asserted by the front proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    /// Read the identity headers. The name falls back to the ID.
    ///
    /// The user ID doubles as a bus topic, so IDs that are not valid topics
    /// (whitespace, wildcards) or too long to prefix a session topic are
    /// rejected.
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let id = headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())?;
        if id.len() > MAX_USER_ID_LENGTH {
            debug!(len = id.len(), "Rejected user ID: too long");
            return None;
        }
        if let Err(e) = validate_topic(id) {
            debug!(user = %id, error = %e, "Rejected user ID");
            return None;
        }
        let name = headers
            .get("x-user-name")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(id);

        Some(Self {
            id: id.to_string(),
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Identity::from_headers(&parts.headers).ok_or(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session: String,
}

/// Resolve a live session owned by `identity`, extending its life.
fn owned_session(chat: &Chat, identity: &Identity, id: &str) -> Option<Arc<Session>> {
    let session = chat.sessions().get(id)?;
    if session.user().id() != identity.id {
        warn!(session = %id, user = %identity.id, "Session belongs to another user");
        return None;
    }
    chat.session(id).ok()
}

/// JSON array response.
fn batch_response(status: StatusCode, messages: &[Message]) -> Response {
    match codec::encode_batch(messages) {
        Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode poll response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn session_not_found() -> Response {
    metrics::record_error("session_not_found");
    StatusCode::NOT_FOUND.into_response()
}

fn poll_response(outcome: PollOutcome) -> Response {
    match outcome {
        PollOutcome::Messages(batch) => batch_response(StatusCode::OK, &batch),
        PollOutcome::Disconnected | PollOutcome::Cancelled => {
            let status = StatusCode::from_u16(DISCONNECTED_STATUS).unwrap_or(StatusCode::GONE);
            batch_response(status, &[Message::disconnected()])
        }
    }
}

fn outcome_label(outcome: &PollOutcome) -> &'static str {
    match outcome {
        PollOutcome::Messages(_) => "messages",
        PollOutcome::Disconnected => "disconnected",
        PollOutcome::Cancelled => "cancelled",
    }
}

/// Tears the session down if the poll future is dropped before completing,
/// which is how the server observes a client disconnect.
struct DisconnectGuard {
    chat: Arc<Chat>,
    session: Arc<Session>,
    armed: bool,
}

impl DisconnectGuard {
    fn new(chat: Arc<Chat>, session: Arc<Session>) -> Self {
        Self {
            chat,
            session,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(session = %self.session.id(), "Client went away during poll");
            metrics::record_poll("cancelled", 0.0);
            self.chat.teardown(&self.session);
        }
    }
}

/// Open a session for the caller.
async fn join_handler(State(state): State<Arc<AppState>>, identity: Identity) -> Response {
    let user = state.chat.user(&identity.id, &identity.name);
    let session = match state.chat.connect(&user) {
        Ok(session) => session,
        Err(e) => {
            error!(user = %identity.id, error = %e, "Failed to open session");
            metrics::record_error("connect");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Keeps the active gauge up until the session closes.
    let guard = SessionMetricsGuard::new();
    let mut closed = session.closed_signal();
    tokio::spawn(async move {
        let _guard = guard;
        let _ = closed.wait_for(|closed| *closed).await;
    });

    Json(serde_json::json!({
        "id": user.id(),
        "name": user.name(),
        "session": session.id(),
    }))
    .into_response()
}

/// Long-poll for messages.
async fn update_handler(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session) = owned_session(&state.chat, &identity, &query.session) else {
        return session_not_found();
    };

    let started = Instant::now();
    let mut guard = DisconnectGuard::new(state.chat.clone(), session.clone());
    let outcome = state.chat.poll(&session, std::future::pending()).await;
    guard.disarm();

    metrics::record_poll(outcome_label(&outcome), started.elapsed().as_secs_f64());
    poll_response(outcome)
}

/// Submit one message.
async fn send_handler(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    if body.len() > state.config.limits.max_message_size {
        metrics::record_error("message_too_large");
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let message = match codec::decode(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(session = %query.session, error = %e, "Malformed message");
            metrics::record_error("malformed_message");
            return (StatusCode::BAD_REQUEST, "unknown message format").into_response();
        }
    };

    let Some(session) = owned_session(&state.chat, &identity, &query.session) else {
        return session_not_found();
    };

    metrics::record_message(message.kind.as_str());
    state.chat.process(message, &session);
    metrics::set_active_rooms(state.chat.rooms().count(RoomKind::Public));

    Json(serde_json::json!({})).into_response()
}

/// Close a session.
async fn close_handler(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session) = owned_session(&state.chat, &identity, &query.session) else {
        return session_not_found();
    };

    state.chat.close(&session);
    metrics::set_active_rooms(state.chat.rooms().count(RoomKind::Public));

    Json(serde_json::json!({})).into_response()
}

/// Store the files of the multipart field `files`.
async fn upload_handler(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<SessionQuery>,
    mut multipart: Multipart,
) -> Response {
    let Some(session) = owned_session(&state.chat, &identity, &query.session) else {
        return session_not_found();
    };

    let mut files = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(session = %session.id(), error = %e, "Malformed upload");
                metrics::record_error("malformed_upload");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        if field.name() != Some("files") {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        match field.bytes().await {
            Ok(data) => files.push(UploadFile { content_type, data }),
            Err(e) => {
                warn!(session = %session.id(), error = %e, "Failed to read upload");
                metrics::record_error("malformed_upload");
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    }

    match state.chat.upload(session.user(), files).await {
        Ok(uploads) => {
            let attachments: Vec<_> = uploads
                .into_iter()
                .map(|upload| {
                    metrics::record_upload(upload.size, upload.cached);
                    upload.attachment
                })
                .collect();
            Json(attachments).into_response()
        }
        Err(e @ UploadError::OverQuota { .. }) => {
            info!(user = %identity.id, error = %e, "Upload refused");
            metrics::record_error("over_quota");
            (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use murmur_bus::{BusError, Inbound};
    use murmur_core::ChatConfig;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            name: id.to_string(),
        }
    }

    #[test]
    fn test_identity_from_headers() {
        let parsed = Identity::from_headers(&headers(&[("x-user-id", "u1"), ("x-user-name", "alice")]));
        assert_eq!(
            parsed,
            Some(Identity {
                id: "u1".into(),
                name: "alice".into()
            })
        );

        let unnamed = Identity::from_headers(&headers(&[("x-user-id", "u2")])).unwrap();
        assert_eq!(unnamed.name, "u2");

        assert!(Identity::from_headers(&headers(&[("x-user-name", "alice")])).is_none());
        assert!(Identity::from_headers(&headers(&[("x-user-id", "  ")])).is_none());
    }

    #[test]
    fn test_identity_rejects_topic_unsafe_ids() {
        for id in ["a b", "a\tb", "rooms.*", "user.>"] {
            assert!(
                Identity::from_headers(&headers(&[("x-user-id", id)])).is_none(),
                "{id:?} should be rejected"
            );
        }
        let mut long = HeaderMap::new();
        long.insert("x-user-id", HeaderValue::from_str(&"u".repeat(MAX_USER_ID_LENGTH + 1)).unwrap());
        assert!(Identity::from_headers(&long).is_none());

        let spaced_name = Identity::from_headers(&headers(&[("x-user-id", "u1"), ("x-user-name", "Alice Smith")]));
        assert_eq!(spaced_name.unwrap().name, "Alice Smith");
    }

    #[tokio::test]
    async fn test_rejected_identity_is_unauthorized() {
        let request = axum::http::Request::builder()
            .uri("/chat/join")
            .header("x-user-id", "a b")
            .body(())
            .unwrap();
        let (mut parts, ()) = request.into_parts();
        assert_eq!(
            Identity::from_request_parts(&mut parts, &()).await,
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    /// Bus that reports itself down and refuses all traffic.
    struct DownBus;

    impl Bus for DownBus {
        fn name(&self) -> &'static str {
            "down"
        }

        fn publish(&self, _topic: &str, _payload: Bytes) -> Result<usize, BusError> {
            Err(BusError::Closed)
        }

        fn subscribe(&self, _topic: &str) -> Result<Box<dyn Inbound>, BusError> {
            Err(BusError::Closed)
        }

        fn unsubscribe(&self, _topic: &str) {}

        fn is_healthy(&self) -> bool {
            false
        }
    }

    fn state(bus: Arc<dyn Bus>) -> Arc<AppState> {
        Arc::new(AppState {
            chat: Chat::new(ChatConfig::default(), bus).unwrap(),
            config: Config::default(),
        })
    }

    #[tokio::test]
    async fn test_health_reflects_bus() {
        let healthy = health_handler(State(state(Arc::new(LocalBus::new())))).await;
        assert_eq!(healthy.status(), StatusCode::OK);

        let down = health_handler(State(state(Arc::new(DownBus)))).await;
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_poll_response_status() {
        assert_eq!(poll_response(PollOutcome::Messages(vec![])).status(), StatusCode::OK);
        assert_eq!(poll_response(PollOutcome::Disconnected).status().as_u16(), 599);
        assert_eq!(poll_response(PollOutcome::Cancelled).status().as_u16(), 599);
        assert_eq!(session_not_found().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_owned_session_rejects_foreign_user() {
        let chat = Chat::new(ChatConfig::default(), Arc::new(LocalBus::new())).unwrap();
        let session = chat.connect(&chat.user("u1", "alice")).unwrap();

        assert!(owned_session(&chat, &identity("u1"), session.id()).is_some());
        assert!(owned_session(&chat, &identity("u2"), session.id()).is_none());
        assert!(owned_session(&chat, &identity("u1"), "u1:missing").is_none());

        chat.close(&session);
        assert!(owned_session(&chat, &identity("u1"), session.id()).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_guard_tears_down() {
        let chat = Chat::new(ChatConfig::default(), Arc::new(LocalBus::new())).unwrap();
        let session = chat.connect(&chat.user("u1", "alice")).unwrap();

        let mut guard = DisconnectGuard::new(chat.clone(), session.clone());
        guard.disarm();
        drop(guard);
        assert!(!session.is_closed());

        drop(DisconnectGuard::new(chat.clone(), session.clone()));
        assert!(session.is_closed());
        assert!(chat.sessions().get(session.id()).is_none());
    }
}
