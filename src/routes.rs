//! HTTP/WS admin surface (spec §6). Every handler goes through `AppState`;
//! `AppState` never imports `crate::routes` back, keeping the dependency
//! direction one-way (spec §9).

use crate::auth::AuthManager;
use crate::config::{Config, RuntimeConfig};
use crate::db::Database;
use crate::error::ApiError;
use crate::events::ServerCapabilities;
use crate::nip46::Nip46Service;
use crate::peers::PeerRegistry;
use crate::pubkey;
use crate::ratelimit::{LimitSpec, RateLimiter};
use crate::signer::{NodeConfig, SignerSupervisor, SupervisorTuning};
use crate::types::{
    ApiKeyCreateRequest, ApiKeyCreateResponse, ApiKeyListResponse, ApiKeyPublic,
    ApiKeyRevokeRequest, ConnectRequest, CredentialsRequest, EnvDeleteRequest, EnvPatchRequest,
    EnvResponse, LoginRequest, LoginResponse, Nip46RequestDecisionRequest,
    Nip46RequestListResponse, Nip46SessionListResponse, PeerListResponse, PeerPingRequest,
    PeerPingResponse, PeerPolicyRequest, RegisterRequest, Role, SelfPubkeyResponse, UserPublic,
};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub runtime: Arc<RuntimeConfig>,
    pub db: Database,
    pub auth: Arc<AuthManager>,
    pub peers: Arc<PeerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub capabilities: ServerCapabilities,
    signer: Arc<RwLock<Option<Arc<SignerSupervisor>>>>,
    nip46: Arc<RwLock<Option<Arc<Nip46Service>>>>,
    owner_user_id: Arc<RwLock<Option<String>>>,
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        runtime: Arc<RuntimeConfig>,
        db: Database,
        auth: Arc<AuthManager>,
        peers: Arc<PeerRegistry>,
        rate_limiter: Arc<RateLimiter>,
        capabilities: ServerCapabilities,
    ) -> Self {
        Self {
            config,
            runtime,
            db,
            auth,
            peers,
            rate_limiter,
            capabilities,
            signer: Arc::new(RwLock::new(None)),
            nip46: Arc::new(RwLock::new(None)),
            owner_user_id: Arc::new(RwLock::new(None)),
            started_at: std::time::Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn tuning(&self) -> SupervisorTuning {
        SupervisorTuning {
            restart_delay: Duration::from_millis(self.config.node_restart_delay_ms),
            max_retries: self.config.node_max_retries,
            backoff_multiplier: self.config.node_backoff_multiplier,
            max_retry_delay: Duration::from_millis(self.config.node_max_retry_delay_ms),
            initial_connectivity_delay: Duration::from_millis(self.config.initial_connectivity_delay_ms),
        }
    }

    /// One FROST identity per process (spec §4.1): binding a new owner tears
    /// down and replaces whatever supervisor/agent pair was running before,
    /// rather than trying to swap their embedded `user_id` in place.
    pub async fn bind_signer(&self, owner: Option<String>, node_config: NodeConfig) -> Result<(), ApiError> {
        self.unbind_signer().await;

        let label = owner.clone().unwrap_or_else(|| "unbound".to_string());
        let supervisor =
            SignerSupervisor::new_with_tuning(self.capabilities.clone(), self.peers.clone(), label, self.tuning());
        supervisor.start(node_config).await?;
        let _ = supervisor.spawn_health_loop();

        let nip46 = Nip46Service::new(
            self.db.clone(),
            self.peers.clone(),
            supervisor.clone(),
            self.capabilities.clone(),
            self.runtime.sign_timeout_ms.clone(),
        );
        if let Some(user_id) = &owner {
            nip46.set_active_user(Some(user_id.clone())).await?;
        }
        let _ = nip46.spawn_restart_loop();

        *self.signer.write() = Some(supervisor);
        *self.nip46.write() = Some(nip46);
        *self.owner_user_id.write() = owner;
        Ok(())
    }

    pub async fn unbind_signer(&self) {
        let nip46 = self.nip46.write().take();
        let supervisor = self.signer.write().take();
        *self.owner_user_id.write() = None;
        if let Some(nip46) = nip46 {
            nip46.stop().await;
        }
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
    }

    /// Binds the signer directly from `SHARE_CRED`/`GROUP_CRED` at startup.
    /// No session exists yet to derive a PBKDF2 credential key, so this path
    /// never touches `encrypt_credential`/the `users` table — the env
    /// credentials live only in process memory until a user claims ownership
    /// through `POST /api/user/credentials` (spec §4.4 Open Question: the
    /// PBKDF2 handoff always requires a password at the HTTP boundary).
    pub async fn bootstrap_env_credentials(&self, share: &str, group: &str) -> Result<(), ApiError> {
        let node_config = NodeConfig {
            group_credential: group.to_string(),
            share_credential: share.to_string(),
            relays: self.runtime.relays.read().clone(),
        };
        self.bind_signer(None, node_config).await
    }

    fn owner(&self) -> Option<String> {
        self.owner_user_id.read().clone()
    }

    fn signer_handle(&self) -> Option<Arc<SignerSupervisor>> {
        self.signer.read().clone()
    }

    fn nip46_handle(&self) -> Option<Arc<Nip46Service>> {
        self.nip46.read().clone()
    }
}

pub fn router(state: AppState) -> Router {
    let cors_runtime = state.runtime.clone();
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin
                .to_str()
                .map(|s| cors_runtime.allowed_origins.read().iter().any(|o| o == s))
                .unwrap_or(false)
        }));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/env", get(get_env).post(patch_env))
        .route("/api/env/delete", post(delete_env))
        .route("/api/user/credentials", post(set_credentials).delete(clear_credentials))
        .route("/api/peers", get(list_peers))
        .route("/api/peers/self", get(self_pubkey))
        .route("/api/peers/ping", post(ping_peers))
        .route("/api/peers/:pubkey/policy", put(set_peer_policy).delete(reset_peer_policy))
        .route("/api/admin/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api/admin/api-keys/revoke", post(revoke_api_key))
        .route("/api/nip46/connect", post(nip46_connect))
        .route("/api/nip46/sessions", get(nip46_sessions))
        .route("/api/nip46/requests", get(nip46_requests))
        .route("/api/nip46/requests/approve", post(nip46_approve))
        .route("/api/nip46/requests/deny", post(nip46_deny))
        .route("/api/events", get(events_ws))
        .layer(cors)
        .with_state(state)
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn require_session(state: &AppState, headers: &HeaderMap) -> Result<(String, String), ApiError> {
    let session_id = headers.get("x-session-id").and_then(|v| v.to_str().ok()).ok_or(ApiError::AuthFailure)?;
    let user_id = state.auth.verify_session(session_id)?;
    Ok((user_id, session_id.to_string()))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let (user_id, _) = require_session(state, headers)?;
    let user = state.db.get_user_by_id(&user_id)?.ok_or(ApiError::AuthFailure)?;
    if user.role != Role::Admin {
        return Err(ApiError::AuthorizationDenied("admin role required".to_string()));
    }
    Ok(user_id)
}

/// Session or API-key auth. An API key acts as whichever user currently owns
/// the bound signer — there is only ever one identity to act as (spec §4.1).
fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    if let Some(session_id) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
        return state.auth.verify_session(session_id);
    }
    if let Some(token) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        state.auth.verify_api_key(token, &client_ip(headers))?;
        return state.owner().ok_or(ApiError::AuthFailure);
    }
    Err(ApiError::AuthFailure)
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let node_state = match state.signer_handle() {
        Some(supervisor) if supervisor.transport().is_some() => "connected",
        Some(_) => "disconnected",
        None => "unbound",
    };
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.uptime_seconds(),
        "node_state": node_state,
    }))
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<UserPublic>, ApiError> {
    if state.db.count_users()? > 0 {
        require_admin(&state, &headers)?;
    }
    let role = req.role.unwrap_or(Role::User);
    let user = state.auth.create_user(&req.username, &req.password, role)?;
    state.capabilities.log("user_registered", json!({ "username": user.username, "role": user.role.as_str() }));
    Ok(Json(UserPublic::from(&user)))
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let ip = client_ip(&headers);

    if state.runtime.rate_limit_enabled.load(Ordering::Relaxed) {
        let spec = LimitSpec {
            window_ms: state.runtime.rate_limit_window_secs.load(Ordering::Relaxed) * 1000,
            max_attempts: state.runtime.rate_limit_max.load(Ordering::Relaxed),
            bucket: "auth",
        };
        state.rate_limiter.check_limit(&ip, &spec).await?;
    }

    let (user, session_id) = state.auth.authenticate(&req.username, &req.password, &ip)?;
    state.capabilities.log("user_login", json!({ "user_id": user.id, "ip": ip }));
    Ok(Json(LoginResponse { session_id, role: user.role }))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let (_, session_id) = require_session(&state, &headers)?;
    state.auth.logout(&session_id)?;
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn get_env(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<EnvResponse>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.runtime.snapshot()))
}

async fn patch_env(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<EnvPatchRequest>,
) -> Result<Json<EnvResponse>, ApiError> {
    require_admin(&state, &headers)?;
    state.runtime.apply_patch(&patch);
    state.capabilities.log("env_patched", json!({}));
    Ok(Json(state.runtime.snapshot()))
}

async fn delete_env(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EnvDeleteRequest>,
) -> Result<Json<EnvResponse>, ApiError> {
    require_admin(&state, &headers)?;
    state.runtime.delete_keys(&req.keys, &state.config);
    state.capabilities.log("env_reset", json!({ "keys": req.keys }));
    Ok(Json(state.runtime.snapshot()))
}

async fn set_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<UserPublic>, ApiError> {
    let (user_id, session_id) = require_session(&state, &headers)?;

    if let Some(owner) = state.owner() {
        if owner != user_id {
            return Err(ApiError::AuthorizationDenied(
                "signer identity already bound to another user".to_string(),
            ));
        }
    }

    let relays = if req.relays.is_empty() { state.runtime.relays.read().clone() } else { req.relays.clone() };

    let encrypted_share = state.auth.encrypt_credential(&session_id, &req.share_credential)?;
    let encrypted_group = state.auth.encrypt_credential(&session_id, &req.group_credential)?;
    state
        .db
        .store_user_credentials(&user_id, &encrypted_group, &encrypted_share, req.group_name.as_deref(), &relays)?;

    let node_config = NodeConfig {
        group_credential: req.group_credential.clone(),
        share_credential: req.share_credential.clone(),
        relays,
    };
    state.bind_signer(Some(user_id.clone()), node_config).await?;

    let user = state.db.get_user_by_id(&user_id)?.ok_or_else(|| ApiError::NotFound("user".to_string()))?;
    state.capabilities.log("credentials_set", json!({ "user_id": user_id }));
    Ok(Json(UserPublic::from(&user)))
}

async fn clear_credentials(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let (user_id, _) = require_session(&state, &headers)?;
    state.db.clear_user_credentials(&user_id)?;
    if state.owner().as_deref() == Some(user_id.as_str()) {
        state.unbind_signer().await;
    }
    state.capabilities.log("credentials_cleared", json!({ "user_id": user_id }));
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn list_peers(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<PeerListResponse>, ApiError> {
    let user_id = require_auth(&state, &headers)?;
    let defaults = state.db.get_user_by_id(&user_id)?.map(|u| u.peer_policy_defaults).unwrap_or_default();
    let peers = state.peers.list_views(&user_id, defaults)?;
    Ok(Json(PeerListResponse { peers }))
}

async fn self_pubkey(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<SelfPubkeyResponse>, ApiError> {
    require_auth(&state, &headers)?;
    let pubkey = state
        .signer_handle()
        .and_then(|s| s.group_public_key())
        .map(|pk| pubkey::normalize(&pk).unwrap_or(pk));
    Ok(Json(SelfPubkeyResponse { pubkey }))
}

async fn ping_peers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PeerPingRequest>,
) -> Result<Json<PeerPingResponse>, ApiError> {
    require_auth(&state, &headers)?;
    let supervisor = state.signer_handle().ok_or_else(|| ApiError::NodeUnavailable("signer not bound".to_string()))?;
    let results = state.peers.ping(&req.target, supervisor.as_ref(), PING_TIMEOUT).await;
    Ok(Json(PeerPingResponse { results }))
}

async fn set_peer_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pubkey): Path<String>,
    Json(req): Json<PeerPolicyRequest>,
) -> Result<Response, ApiError> {
    let user_id = require_auth(&state, &headers)?;
    state.peers.set_policy(&user_id, &pubkey, req.allow_send, req.allow_receive)?;
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn reset_peer_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pubkey): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = require_auth(&state, &headers)?;
    state.peers.reset_policy(&user_id, &pubkey)?;
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn list_api_keys(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<ApiKeyListResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let keys = state.auth.list_api_keys()?.iter().map(ApiKeyPublic::from).collect();
    Ok(Json(ApiKeyListResponse { keys }))
}

async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ApiKeyCreateRequest>,
) -> Result<Json<ApiKeyCreateResponse>, ApiError> {
    let admin_id = require_admin(&state, &headers)?;
    let created_by = req.user_id.clone().unwrap_or(admin_id);
    let (token, prefix, id) = state.auth.create_api_key(req.label.as_deref(), Some(&created_by), true)?;
    state.capabilities.log("api_key_created", json!({ "prefix": prefix, "created_by": created_by }));
    Ok(Json(ApiKeyCreateResponse { token, prefix, id }))
}

async fn revoke_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ApiKeyRevokeRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    state.auth.revoke_api_key(&req.api_key_id, req.reason.as_deref())?;
    state.capabilities.log("api_key_revoked", json!({ "id": req.api_key_id }));
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn nip46_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConnectRequest>,
) -> Result<Response, ApiError> {
    let user_id = require_auth(&state, &headers)?;
    let nip46 = state.nip46_handle().ok_or_else(|| ApiError::NodeUnavailable("signer not bound".to_string()))?;
    let session = nip46.connect_from_uri(&user_id, &req.uri).await?;
    Ok(Json(session).into_response())
}

async fn nip46_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Nip46SessionListResponse>, ApiError> {
    let user_id = require_auth(&state, &headers)?;
    let nip46 = state.nip46_handle().ok_or_else(|| ApiError::NodeUnavailable("signer not bound".to_string()))?;
    Ok(Json(Nip46SessionListResponse { sessions: nip46.list_sessions(&user_id)? }))
}

async fn nip46_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Nip46RequestListResponse>, ApiError> {
    let user_id = require_auth(&state, &headers)?;
    let nip46 = state.nip46_handle().ok_or_else(|| ApiError::NodeUnavailable("signer not bound".to_string()))?;
    Ok(Json(Nip46RequestListResponse { requests: nip46.list_requests(&user_id)? }))
}

async fn nip46_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<Nip46RequestDecisionRequest>,
) -> Result<Response, ApiError> {
    let user_id = require_auth(&state, &headers)?;
    let nip46 = state.nip46_handle().ok_or_else(|| ApiError::NodeUnavailable("signer not bound".to_string()))?;
    let result = nip46.approve_request(&user_id, &req.request_id).await;
    Ok(Json(json!({ "result": result })).into_response())
}

async fn nip46_deny(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<Nip46RequestDecisionRequest>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let nip46 = state.nip46_handle().ok_or_else(|| ApiError::NodeUnavailable("signer not bound".to_string()))?;
    nip46.deny_request(&req.request_id)?;
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn events_ws(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(ws.on_upgrade(move |socket| stream_events(socket, state)))
}

async fn stream_events(mut socket: WebSocket, state: AppState) {
    let mut rx = state.capabilities.bus.subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use axum::body::Body;
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use std::time::Instant;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            db_path: dir.path().join("signer.sqlite"),
            share_credential: None,
            group_credential: None,
            group_name: None,
            relays: crate::config::default_relays(),
            session_timeout_secs: 3600,
            sign_timeout_ms: 30_000,
            rate_limit_enabled: false,
            rate_limit_window_secs: 60,
            rate_limit_max: 5,
            node_restart_delay_ms: 10,
            node_max_retries: 1,
            node_backoff_multiplier: 2.0,
            node_max_retry_delay_ms: 100,
            initial_connectivity_delay_ms: 0,
            allowed_origins: vec![],
            admin_secret: None,
        };
        let db = Database::open(config.db_path.clone()).unwrap();
        let runtime = RuntimeConfig::from_config(&config);
        let capabilities = ServerCapabilities::new(EventBus::new(16));
        let auth = Arc::new(AuthManager::new(db.clone()));
        let peers = Arc::new(PeerRegistry::new(db.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(db.clone()));
        AppState::new(config, runtime, db, auth, peers, rate_limiter, capabilities)
    }

    fn json_request(method: &str, uri: &str, session_id: &str, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
        if !session_id.is_empty() {
            builder = builder.header("x-session-id", session_id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_does_not_require_auth() {
        let app = router(test_state());
        let res = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unauthenticated_request_to_a_session_gated_route_is_rejected() {
        let app = router(test_state());
        let res = app
            .oneshot(Request::builder().uri("/api/peers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn first_registration_is_open_but_the_second_requires_an_admin_session() {
        let state = test_state();
        let app = router(state.clone());

        let first = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/auth/register",
                "",
                json!({"username": "alice", "password": "correct horse battery"}),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second_without_session = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/auth/register",
                "",
                json!({"username": "bob", "password": "correct horse battery"}),
            ))
            .await
            .unwrap();
        assert_eq!(second_without_session.status(), StatusCode::UNAUTHORIZED);

        let (_, session_id) = state.auth.authenticate("alice", "correct horse battery", "127.0.0.1").unwrap();
        let second_as_admin = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/auth/register",
                &session_id,
                json!({"username": "bob", "password": "correct horse battery"}),
            ))
            .await
            .unwrap();
        assert_eq!(second_as_admin.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_endpoint_rejects_wrong_password_and_issues_a_session_on_success() {
        let state = test_state();
        state.auth.create_user("alice", "correct horse battery", Role::User).unwrap();
        let app = router(state);

        let bad = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/auth/login",
                "",
                json!({"username": "alice", "password": "wrong-password"}),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);

        let good = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/auth/login",
                "",
                json!({"username": "alice", "password": "correct horse battery"}),
            ))
            .await
            .unwrap();
        assert_eq!(good.status(), StatusCode::OK);
        let parsed: LoginResponse = body_json(good).await;
        assert_eq!(parsed.role, Role::Admin);
    }

    /// Spec §8 S1: wrong-password and unknown-user logins must not be
    /// distinguishable by timing. `AuthManager::authenticate` already runs a
    /// real Argon2id verification against a dummy hash in the unknown-user
    /// path (see `crypto::password::verify_dummy`); this drives both paths
    /// through the real HTTP route and asserts neither is a lopsided outlier.
    #[tokio::test]
    async fn s1_login_timing_does_not_distinguish_known_from_unknown_usernames() {
        let state = test_state();
        state.auth.create_user("alice", "correct horse battery", Role::User).unwrap();
        let app = router(state);

        async fn timed_attempts(app: &Router, username: &str, n: u32) -> std::time::Duration {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..n {
                let start = Instant::now();
                let res = app
                    .clone()
                    .oneshot(json_request(
                        "POST",
                        "/api/auth/login",
                        "",
                        json!({"username": username, "password": "wrong-password"}),
                    ))
                    .await
                    .unwrap();
                assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
                total += start.elapsed();
            }
            total
        }

        let known = timed_attempts(&app, "alice", 20).await;
        let unknown = timed_attempts(&app, "ghost", 20).await;

        let slower = known.max(unknown).as_secs_f64();
        let faster = known.min(unknown).as_secs_f64().max(0.000_001);
        assert!(
            slower / faster < 3.0,
            "login timing diverged too much: known={known:?} unknown={unknown:?}"
        );
    }

    #[tokio::test]
    async fn non_admin_session_cannot_read_or_patch_env() {
        let state = test_state();
        state.auth.create_user("admin", "adminpassword1", Role::User).unwrap();
        state.auth.create_user("carol", "carolpassword1", Role::User).unwrap();
        let (_, carol_session) = state.auth.authenticate("carol", "carolpassword1", "127.0.0.1").unwrap();
        let app = router(state);

        let res = app
            .clone()
            .oneshot(Request::builder().uri("/api/env").header("x-session-id", &carol_session).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_can_patch_and_then_reset_env_over_http() {
        let state = test_state();
        state.auth.create_user("admin", "adminpassword1", Role::User).unwrap();
        let (_, session_id) = state.auth.authenticate("admin", "adminpassword1", "127.0.0.1").unwrap();
        let app = router(state.clone());

        let patch = app
            .clone()
            .oneshot(json_request("POST", "/api/env", &session_id, json!({"relays": ["wss://custom"]})))
            .await
            .unwrap();
        assert_eq!(patch.status(), StatusCode::OK);
        let snapshot: EnvResponse = body_json(patch).await;
        assert_eq!(snapshot.relays, vec!["wss://custom".to_string()]);

        let reset = app
            .clone()
            .oneshot(json_request("POST", "/api/env/delete", &session_id, json!({"keys": ["relays"]})))
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);
        let snapshot: EnvResponse = body_json(reset).await;
        assert_eq!(snapshot.relays, state.config.relays);
    }

    /// Spec §8 S5: an API key revoked through the admin HTTP surface must
    /// fail the next verification. Exercising the full bind-a-signer-then-call
    /// path isn't reachable without a live relay, so the effect is checked at
    /// `AuthManager::verify_api_key` directly, the same check `require_auth`
    /// runs on every `x-api-key` request.
    #[tokio::test]
    async fn s5_revoked_api_key_fails_verification_after_http_revoke() {
        let state = test_state();
        state.auth.create_user("admin", "adminpassword1", Role::User).unwrap();
        let (_, session_id) = state.auth.authenticate("admin", "adminpassword1", "127.0.0.1").unwrap();
        let app = router(state.clone());

        let created_res = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/admin/api-keys",
                &session_id,
                json!({"label": "ci", "user_id": null}),
            ))
            .await
            .unwrap();
        assert_eq!(created_res.status(), StatusCode::OK);
        let created: ApiKeyCreateResponse = body_json(created_res).await;

        assert!(state.auth.verify_api_key(&created.token, "127.0.0.1").is_ok());

        let revoke_res = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/admin/api-keys/revoke",
                &session_id,
                json!({"api_key_id": created.id, "reason": "rotation"}),
            ))
            .await
            .unwrap();
        assert_eq!(revoke_res.status(), StatusCode::NO_CONTENT);

        let err = state.auth.verify_api_key(&created.token, "127.0.0.1").unwrap_err();
        assert!(matches!(err, ApiError::AuthFailure));
    }

    #[tokio::test]
    async fn self_pubkey_reports_none_when_no_signer_is_bound() {
        let state = test_state();
        state.auth.create_user("alice", "correct horse battery", Role::User).unwrap();
        let (_, session_id) = state.auth.authenticate("alice", "correct horse battery", "127.0.0.1").unwrap();
        let app = router(state);

        let res = app
            .oneshot(Request::builder().uri("/api/peers/self").header("x-session-id", &session_id).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let parsed: SelfPubkeyResponse = body_json(res).await;
        assert!(parsed.pubkey.is_none());
    }
}
