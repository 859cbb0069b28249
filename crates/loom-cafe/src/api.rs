use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use loom_net::http::PEER_HEADER;
use loom_node::cafe::CafeHost;
use loom_node::Node;
use loom_shared::protocol::{CafeDeliverMessage, Envelope};
use loom_shared::types::{ContentId, PeerId, ThreadId};
use loom_store::{CafeClient, CafeToken};

use crate::config::CafeConfig;
use crate::error::ServerError;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    pub host: Arc<CafeHost>,
    pub config: Arc<CafeConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/cafe/v1/info", get(cafe_info))
        .route("/cafe/v1/pin", post(pin))
        .route("/cafe/v1/service", post(service))
        .route("/cafe/v1/store/:cid", put(store_object).delete(unstore_object))
        .route("/cafe/v1/threads/:id", put(store_thread).delete(unstore_thread))
        .route("/cafe/v1/inbox/:client", post(deliver))
        .route("/admin/tokens", post(admin_create_token).get(admin_list_tokens))
        .route("/admin/tokens/:id", delete(admin_revoke_token))
        .layer(DefaultBodyLimit::max(state.config.max_blob_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct CafeInfoResponse {
    peer: String,
    address: String,
    api: String,
    protocol: String,
    url: String,
    open: bool,
}

#[derive(Serialize)]
struct ObjectResponse {
    id: String,
}

#[derive(Serialize)]
struct TokenInfo {
    id: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct CreatedToken {
    id: String,
    token: String,
    created_at: DateTime<Utc>,
}

impl From<CafeToken> for TokenInfo {
    fn from(token: CafeToken) -> Self {
        Self {
            id: token.id,
            created_at: token.created_at,
        }
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn cafe_info(State(state): State<AppState>) -> Json<CafeInfoResponse> {
    let info = state.host.info();
    Json(CafeInfoResponse {
        peer: info.peer.to_hex(),
        address: info.address.to_string(),
        api: info.api,
        protocol: info.protocol,
        url: info.url,
        open: state.host.config().open,
    })
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// The session access token in `Authorization: Bearer ...`.
fn bearer(headers: &HeaderMap) -> Result<&str, ServerError> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match auth.strip_prefix("Bearer ").map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(ServerError::Unauthorized),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<CafeClient, ServerError> {
    Ok(state.host.authorize(bearer(headers)?, None)?)
}

/// The sending peer named in the `x-loom-peer` header.
fn peer_header(headers: &HeaderMap) -> Result<PeerId, ServerError> {
    let value = headers
        .get(PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest(format!("Missing {PEER_HEADER} header")))?;
    PeerId::from_hex(value.trim())
        .map_err(|e| ServerError::BadRequest(format!("Invalid {PEER_HEADER} header: {e}")))
}

fn require_octet_stream(headers: &HeaderMap) -> Result<(), ServerError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with(OCTET_STREAM) {
        return Err(ServerError::BadRequest(format!(
            "Expected {OCTET_STREAM}, got {content_type:?}"
        )));
    }
    Ok(())
}

fn parse_cid(raw: &str) -> Result<ContentId, ServerError> {
    ContentId::parse(raw).map_err(|e| ServerError::BadRequest(format!("Invalid content id: {e}")))
}

// ---------------------------------------------------------------------------
// Cafe routes
// ---------------------------------------------------------------------------

async fn pin(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ObjectResponse>, ServerError> {
    let client = authorize(&state, &headers)?;
    require_octet_stream(&headers)?;
    if body.is_empty() {
        return Err(ServerError::BadRequest("Empty body".into()));
    }

    let id = state.host.pin(&client, &body).await?;
    info!(client = %client.id.short(), object = %id.short(), size = body.len(), "Object pinned via API");
    Ok(Json(ObjectResponse {
        id: id.as_str().to_string(),
    }))
}

/// Envelope transport for peers that reach the cafe over HTTP.
async fn service(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let from = peer_header(&headers)?;
    let envelope = Envelope::from_bytes(&body)
        .map_err(|e| ServerError::BadRequest(format!("Malformed envelope: {e}")))?;
    if envelope.verify(&from).is_err() {
        return Err(ServerError::Forbidden);
    }

    match state.node.handle_message(&from, &envelope).await {
        Some(reply) => {
            let bytes = reply
                .to_bytes()
                .map_err(|e| ServerError::Internal(format!("Failed to encode reply: {e}")))?;
            Ok(([(header::CONTENT_TYPE, OCTET_STREAM)], bytes).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn store_object(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(cid): Path<String>,
    body: Bytes,
) -> Result<Json<ObjectResponse>, ServerError> {
    let client = authorize(&state, &headers)?;
    let cid = parse_cid(&cid)?;

    let id = state.host.store_object(&client, &cid, &body).await?;
    Ok(Json(ObjectResponse {
        id: id.as_str().to_string(),
    }))
}

async fn unstore_object(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<StatusCode, ServerError> {
    let client = authorize(&state, &headers)?;
    let cid = parse_cid(&cid)?;

    state.host.unpin(&client, &cid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn store_thread(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let client = authorize(&state, &headers)?;
    let id = ThreadId::from_hex(&id)
        .map_err(|e| ServerError::BadRequest(format!("Invalid thread id: {e}")))?;
    if body.is_empty() {
        return Err(ServerError::BadRequest("Empty thread backup".into()));
    }

    state.host.store_thread(&client, &id, &body)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unstore_thread(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    let client = authorize(&state, &headers)?;
    let id = ThreadId::from_hex(&id)
        .map_err(|e| ServerError::BadRequest(format!("Invalid thread id: {e}")))?;

    state.host.unstore_thread(&client, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Park a sealed envelope for a registered client.
async fn deliver(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(client): Path<String>,
    body: Bytes,
) -> Result<Json<ObjectResponse>, ServerError> {
    let from = peer_header(&headers)?;
    let client = PeerId::from_hex(&client)
        .map_err(|e| ServerError::BadRequest(format!("Invalid client id: {e}")))?;
    if body.is_empty() {
        return Err(ServerError::BadRequest("Empty message".into()));
    }

    let req = CafeDeliverMessage {
        id: ContentId::of(&body),
        client,
        env: body.to_vec(),
    };
    state.node.deliver_mail(&from, &req)?;
    Ok(Json(ObjectResponse {
        id: req.id.as_str().to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Admin routes
// ---------------------------------------------------------------------------

fn verify_admin_token(headers: &HeaderMap, config: &CafeConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden);
    };

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden);
    }

    Ok(())
}

async fn admin_create_token(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<CreatedToken>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let (record, token) = state.host.create_token()?;
    Ok(Json(CreatedToken {
        id: record.id,
        token,
        created_at: record.created_at,
    }))
}

async fn admin_list_tokens(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<TokenInfo>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let tokens = state.host.list_tokens()?;
    Ok(Json(tokens.into_iter().map(TokenInfo::from).collect()))
}

async fn admin_revoke_token(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    if !state.host.revoke_token(&id)? {
        return Err(ServerError::NotFound(format!("token {id}")));
    }
    Ok(Json(serde_json::json!({ "revoked": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting cafe HTTP API");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use loom_net::MemoryHub;
    use loom_node::cafe::CafeHostConfig;
    use loom_node::{MemoryContentStore, NodeOptions};
    use loom_shared::constants::CAFE_PROTOCOL;
    use loom_shared::protocol::Payload;
    use loom_shared::session;
    use loom_shared::{Account, Identity};
    use loom_store::Datastore;

    use super::*;

    struct Fixture {
        hub: MemoryHub,
        cafe: Arc<Node>,
        app: Router,
        tasks: Vec<tokio::task::JoinHandle<()>>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for task in &self.tasks {
                task.abort();
            }
        }
    }

    fn node(hub: &MemoryHub, cafe_host: Option<CafeHostConfig>) -> (Arc<Node>, tokio::task::JoinHandle<()>) {
        let identity = Identity::generate();
        let (network, inbound) = hub.connect(identity.peer_id());
        let node = Node::new(
            identity,
            Account::generate(),
            Datastore::in_memory().unwrap(),
            Arc::new(MemoryContentStore::new()),
            Arc::new(network),
            NodeOptions {
                name: String::new(),
                cafe_host,
            },
        )
        .unwrap();
        let task = node.spawn_dispatch(inbound);
        (node, task)
    }

    fn fixture(host: CafeHostConfig, admin_token: Option<&str>) -> Fixture {
        let hub = MemoryHub::new();
        let (cafe, task) = node(&hub, Some(host));
        let config = CafeConfig {
            admin_token: admin_token.map(str::to_string),
            ..CafeConfig::default()
        };
        let state = AppState {
            host: cafe.cafe_host().unwrap().clone(),
            node: cafe.clone(),
            config: Arc::new(config),
        };
        Fixture {
            hub,
            cafe,
            app: build_router(state),
            tasks: vec![task],
        }
    }

    impl Fixture {
        /// A peer registered with the cafe and its access token.
        async fn client(&mut self, token: &str) -> (Arc<Node>, String) {
            let (client, task) = node(&self.hub, None);
            self.tasks.push(task);
            let session = client.register_cafe(&self.cafe.peer_id(), token).await.unwrap();
            (client, session.access)
        }

        async fn call(&self, req: Request<Body>) -> (StatusCode, Vec<u8>) {
            let resp = self.app.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            (status, body.to_vec())
        }
    }

    fn request(method: Method, uri: &str, bearer: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, OCTET_STREAM);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let fx = fixture(CafeHostConfig::open_registration(), None);

        let (status, body) = fx.call(request(Method::GET, "/health", None, Vec::new())).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");

        let (status, body) = fx.call(request(Method::GET, "/cafe/v1/info", None, Vec::new())).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["peer"], fx.cafe.peer_id().to_hex());
        assert_eq!(json["open"], true);
    }

    #[tokio::test]
    async fn test_bearer_errors() {
        let fx = fixture(CafeHostConfig::open_registration(), None);
        let cid = ContentId::of(b"hello");
        let uri = format!("/cafe/v1/store/{}", cid.as_str());

        let (status, _) = fx.call(request(Method::PUT, &uri, None, b"hello".to_vec())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = fx
            .call(request(Method::PUT, &uri, Some("not-a-token"), b"hello".to_vec()))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // well formed, but signed by someone else
        let foreign = session::issue(
            &Identity::generate(),
            &Identity::generate().peer_id(),
            CAFE_PROTOCOL,
            chrono::Duration::hours(1),
            chrono::Duration::hours(2),
        );
        let (status, _) = fx
            .call(request(Method::PUT, &uri, Some(&foreign.access), b"hello".to_vec()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_store_object_checks_content_id() {
        let mut fx = fixture(CafeHostConfig::open_registration(), None);
        let (_client, token) = fx.client("").await;

        let cid = ContentId::of(b"hello");
        let uri = format!("/cafe/v1/store/{}", cid.as_str());

        let (status, _) = fx
            .call(request(Method::PUT, &uri, Some(&token), b"goodbye".to_vec()))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = fx
            .call(request(Method::PUT, &uri, Some(&token), b"hello".to_vec()))
            .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["id"], cid.as_str());
        assert!(fx.cafe.content().is_pinned(&cid).await.unwrap());

        let (status, _) = fx.call(request(Method::DELETE, &uri, Some(&token), Vec::new())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!fx.cafe.content().is_pinned(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_pin_requires_octet_stream() {
        let mut fx = fixture(CafeHostConfig::open_registration(), None);
        let (_client, token) = fx.client("").await;

        let req = Request::builder()
            .method(Method::POST)
            .uri("/cafe/v1/pin")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/gzip")
            .body(Body::from(b"archive".to_vec()))
            .unwrap();
        let (status, _) = fx.call(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = fx
            .call(request(Method::POST, "/cafe/v1/pin", Some(&token), b"raw bytes".to_vec()))
            .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["id"], ContentId::of(b"raw bytes").as_str());
    }

    #[tokio::test]
    async fn test_thread_backup_routes() {
        let mut fx = fixture(CafeHostConfig::open_registration(), None);
        let (client, token) = fx.client("").await;
        let uri = format!("/cafe/v1/threads/{}", ThreadId([3u8; 32]).to_hex());

        let (status, _) = fx
            .call(request(Method::PUT, &uri, Some(&token), b"sealed backup".to_vec()))
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let backups = |fx: &Fixture| {
            fx.cafe
                .datastore()
                .with(|db| db.list_cafe_client_threads(&client.peer_id()))
                .unwrap()
        };
        assert_eq!(backups(&fx).len(), 1);
        assert_eq!(backups(&fx)[0].ciphertext, b"sealed backup".to_vec());

        let (status, _) = fx.call(request(Method::DELETE, &uri, Some(&token), Vec::new())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(backups(&fx).is_empty());
    }

    #[tokio::test]
    async fn test_inbox_delivery() {
        let mut fx = fixture(CafeHostConfig::open_registration(), None);
        let (client, _token) = fx.client("").await;
        let sender = Identity::generate().peer_id();

        let deliver = |to: PeerId| {
            Request::builder()
                .method(Method::POST)
                .uri(format!("/cafe/v1/inbox/{}", to.to_hex()))
                .header(PEER_HEADER, sender.to_hex())
                .header(header::CONTENT_TYPE, OCTET_STREAM)
                .body(Body::from(b"sealed envelope".to_vec()))
                .unwrap()
        };

        let (status, _) = fx.call(deliver(Identity::generate().peer_id())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = fx.call(deliver(client.peer_id())).await;
        assert_eq!(status, StatusCode::OK);

        let waiting = fx
            .cafe
            .datastore()
            .with(|db| db.list_cafe_client_messages(&client.peer_id(), 10))
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].peer, sender);
    }

    #[tokio::test]
    async fn test_service_answers_signed_envelopes() {
        let fx = fixture(CafeHostConfig::open_registration(), None);
        let peer = Identity::generate();
        let ping = Envelope::new(&peer, Payload::Ping, Some(1), false).unwrap();

        let post = |claimed: PeerId| {
            Request::builder()
                .method(Method::POST)
                .uri("/cafe/v1/service")
                .header(PEER_HEADER, claimed.to_hex())
                .header(header::CONTENT_TYPE, OCTET_STREAM)
                .body(Body::from(ping.to_bytes().unwrap()))
                .unwrap()
        };

        let (status, body) = fx.call(post(peer.peer_id())).await;
        assert_eq!(status, StatusCode::OK);
        let reply = Envelope::from_bytes(&body).unwrap();
        assert!(reply.verify(&fx.cafe.peer_id()).is_ok());
        assert!(matches!(reply.payload(), Payload::Pong));

        let (status, _) = fx.call(post(Identity::generate().peer_id())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let fire_and_forget = Envelope::new(&peer, Payload::Pong, None, false).unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/cafe/v1/service")
            .header(PEER_HEADER, peer.peer_id().to_hex())
            .body(Body::from(fire_and_forget.to_bytes().unwrap()))
            .unwrap();
        let (status, _) = fx.call(req).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_admin_tokens_gate_closed_registration() {
        let mut fx = fixture(CafeHostConfig::default(), Some("s3cret"));

        let (status, _) = fx
            .call(request(Method::POST, "/admin/tokens", Some("wrong"), Vec::new()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = fx
            .call(request(Method::POST, "/admin/tokens", Some("s3cret"), Vec::new()))
            .await;
        assert_eq!(status, StatusCode::OK);
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let dev_token = created["token"].as_str().unwrap().to_string();
        let id = created["id"].as_str().unwrap().to_string();

        let (_client, access) = fx.client(&dev_token).await;
        assert!(!access.is_empty());

        let (status, body) = fx
            .call(request(Method::GET, "/admin/tokens", Some("s3cret"), Vec::new()))
            .await;
        assert_eq!(status, StatusCode::OK);
        let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert!(listed[0].get("token_hash").is_none());

        let uri = format!("/admin/tokens/{id}");
        let (status, _) = fx.call(request(Method::DELETE, &uri, Some("s3cret"), Vec::new())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = fx.call(request(Method::DELETE, &uri, Some("s3cret"), Vec::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let fx = fixture(CafeHostConfig::default(), None);
        let (status, _) = fx
            .call(request(Method::GET, "/admin/tokens", None, Vec::new()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
