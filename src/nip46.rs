//! NIP-46 Session Service (spec §4.3).
//!
//! Maintains one `(signer, agent)` pair per active user: "signer" is a
//! transport keypair derived from the user's `transport_secret`, "agent" is
//! the Nostr-Connect protocol handler subscribed to the user's relays. This
//! is a separate relay identity from the FROST node transport in
//! `crate::signer` — the daemon never holds the raw FROST identity key, so
//! `nip44_encrypt`/`nip44_decrypt`/`nip04_encrypt`/`nip04_decrypt` requests
//! derive their shared secret via `SignerSupervisor::ecdh`, which asks the
//! FROST network to perform the ECDH on our behalf. The transport secret
//! ECDH (used only to decrypt/encrypt the envelope exchanged with the NIP-46
//! client itself) is a local, ordinary k256 ECDH the daemon can do on its
//! own.

use crate::config;
use crate::crypto::nip04;
use crate::crypto::nip44::{self, ConversationKey};
use crate::db::Database;
use crate::events::ServerCapabilities;
use crate::peers::{PeerRegistry, PolicyError};
use crate::pubkey;
use crate::signer::{SignerSupervisor, SupervisorError};
use crate::types::{Nip46Policy, Nip46Profile, Nip46RequestView, Nip46SessionStatus, Nip46SessionView};
use futures_util::{SinkExt, StreamExt};
use k256::schnorr::SigningKey;
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use signature::hazmat::PrehashSigner;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Nip46Error {
    #[error("invalid connect string: {0}")]
    InvalidConnectString(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("operation timed out")]
    Timeout,
}

impl From<rusqlite::Error> for Nip46Error {
    fn from(err: rusqlite::Error) -> Self {
        Nip46Error::Storage(err.to_string())
    }
}

// ------------------------------------------------------- connect onboarding

#[derive(Debug, Clone)]
pub struct ConnectPayload {
    pub client_pubkey: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
    pub profile: Nip46Profile,
    pub requested_policy: Nip46Policy,
}

/// Decodes `nostrconnect://<client_pubkey>?relay=...&secret=...&name=...&
/// url=...&image=...&perms=method[:kind],...` (spec §4.3 `connectFromUri`).
pub fn parse_connect_uri(uri: &str) -> Result<ConnectPayload, Nip46Error> {
    let parsed = url::Url::parse(uri).map_err(|e| Nip46Error::InvalidConnectString(e.to_string()))?;
    if parsed.scheme() != "nostrconnect" {
        return Err(Nip46Error::InvalidConnectString("not a nostrconnect:// uri".to_string()));
    }
    let raw_pubkey = parsed.host_str().or_else(|| parsed.domain()).unwrap_or_default();
    let client_pubkey = pubkey::normalize(raw_pubkey)
        .filter(|p| p.len() == 64)
        .ok_or_else(|| Nip46Error::InvalidConnectString("client_pubkey is not 64-char hex".to_string()))?;

    let mut relays = Vec::new();
    let mut secret = None;
    let mut name = None;
    let mut url_field = None;
    let mut image = None;
    let mut requested_policy = Nip46Policy::default();

    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "relay" => relays.push(value.into_owned()),
            "secret" => secret = Some(value.into_owned()),
            "name" => name = Some(value.into_owned()),
            "url" => url_field = Some(value.into_owned()),
            "image" => image = Some(value.into_owned()),
            "perms" => requested_policy = parse_perms(&value),
            _ => {}
        }
    }

    Ok(ConnectPayload {
        client_pubkey,
        relays,
        secret,
        profile: Nip46Profile { name, url: url_field, image },
        requested_policy,
    })
}

fn parse_perms(raw: &str) -> Nip46Policy {
    let mut policy = Nip46Policy::default();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(2, ':');
        let method = parts.next().unwrap_or_default();
        policy.methods.insert(method.to_string(), true);
        if let Some(kind) = parts.next() {
            policy.kinds.insert(kind.to_string(), true);
        }
    }
    policy
}

/// Default session policy for a newly onboarded client: signing and NIP-44
/// crypto are enabled, NIP-04 is opt-in only (spec §4.3 `setActiveUser`).
fn default_session_policy() -> Nip46Policy {
    let mut methods = HashMap::new();
    methods.insert("sign_event".to_string(), true);
    methods.insert("get_public_key".to_string(), true);
    methods.insert("nip44_encrypt".to_string(), true);
    methods.insert("nip44_decrypt".to_string(), true);
    methods.insert("nip04_encrypt".to_string(), false);
    methods.insert("nip04_decrypt".to_string(), false);
    Nip46Policy { methods, kinds: HashMap::new() }
}

fn merge_policy(defaults: Nip46Policy, requested: Nip46Policy) -> Nip46Policy {
    let mut methods = defaults.methods;
    methods.extend(requested.methods);
    let mut kinds = defaults.kinds;
    kinds.extend(requested.kinds);
    Nip46Policy { methods, kinds }
}

// --------------------------------------------------------------- rpc shapes

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Tagged dispatch variant in place of matching on the method string at
/// every call site (spec REDESIGN FLAGS, "dynamic method dispatch").
#[derive(Debug, Clone, PartialEq, Eq)]
enum Nip46Method {
    Connect,
    Ping,
    GetPublicKey,
    SignEvent,
    Nip44Encrypt,
    Nip44Decrypt,
    Nip04Encrypt,
    Nip04Decrypt,
    Other(String),
}

impl Nip46Method {
    fn decode(method: &str) -> Self {
        match method {
            "connect" => Self::Connect,
            "ping" => Self::Ping,
            "get_public_key" => Self::GetPublicKey,
            "sign_event" => Self::SignEvent,
            "nip44_encrypt" => Self::Nip44Encrypt,
            "nip44_decrypt" => Self::Nip44Decrypt,
            "nip04_encrypt" => Self::Nip04Encrypt,
            "nip04_decrypt" => Self::Nip04Decrypt,
            other => Self::Other(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Ping => "ping",
            Self::GetPublicKey => "get_public_key",
            Self::SignEvent => "sign_event",
            Self::Nip44Encrypt => "nip44_encrypt",
            Self::Nip44Decrypt => "nip44_decrypt",
            Self::Nip04Encrypt => "nip04_encrypt",
            Self::Nip04Decrypt => "nip04_decrypt",
            Self::Other(m) => m.as_str(),
        }
    }
}

fn rpc_result(id: &str, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

fn rpc_error(id: &str, message: impl Into<String>) -> Value {
    json!({ "id": id, "error": message.into() })
}

// ------------------------------------------------------------------ service

/// Owns the per-user agent lifecycle, the request queue, and dispatch to
/// the signer supervisor. Never imports `crate::routes` — handlers call in,
/// this never calls out (spec §9 "cyclic references").
pub struct Nip46Service {
    db: Database,
    peers: Arc<PeerRegistry>,
    supervisor: Arc<SignerSupervisor>,
    capabilities: ServerCapabilities,
    op_timeout_ms: Arc<AtomicU64>,
    in_flight: SyncMutex<HashSet<String>>,
    agent: Mutex<Option<Arc<Nip46Agent>>>,
    active_user: SyncMutex<Option<String>>,
}

impl Nip46Service {
    /// `op_timeout_ms` is shared with the runtime config so a `sign_timeout_ms`
    /// patch via `/api/env` takes effect on the next dispatch without a restart.
    pub fn new(
        db: Database,
        peers: Arc<PeerRegistry>,
        supervisor: Arc<SignerSupervisor>,
        capabilities: ServerCapabilities,
        op_timeout_ms: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            peers,
            supervisor,
            capabilities,
            op_timeout_ms,
            in_flight: SyncMutex::new(HashSet::new()),
            agent: Mutex::new(None),
            active_user: SyncMutex::new(None),
        })
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn active_user(&self) -> Option<String> {
        self.active_user.lock().clone()
    }

    /// `setActiveUser` (spec §4.3): stops the current agent if the user
    /// changed, then starts a fresh one for the new user.
    pub async fn set_active_user(self: &Arc<Self>, user_id: Option<String>) -> Result<(), Nip46Error> {
        let changed = { *self.active_user.lock() != user_id };
        if !changed {
            return Ok(());
        }

        if let Some(old_agent) = self.agent.lock().await.take() {
            old_agent.stop().await;
        }
        *self.active_user.lock() = user_id.clone();

        if let Some(user_id) = user_id {
            self.ensure_started(&user_id).await?;
        }
        Ok(())
    }

    /// Loads relays from the store (or seeds a default list), gets/creates
    /// the transport secret, and spawns a fresh agent (spec §4.3 "Start").
    pub async fn ensure_started(self: &Arc<Self>, user_id: &str) -> Result<(), Nip46Error> {
        let user = self
            .db
            .get_user_by_id(user_id)?
            .ok_or_else(|| Nip46Error::Storage("user not found".to_string()))?;
        let secret = self.db.get_or_create_transport_secret(user_id)?;
        let relays = if user.relays.is_empty() { config::default_relays() } else { user.relays.clone() };

        let agent = Nip46Agent::start(self.clone(), user_id.to_string(), secret, relays);
        *self.agent.lock().await = Some(agent);
        Ok(())
    }

    /// Background task: every 5s, restart the agent if it reports itself
    /// closed and a user is still active (spec §4.3 "Socket closure").
    pub fn spawn_restart_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let Some(user_id) = service.active_user() else { continue };
                let is_closed = match service.agent.lock().await.as_ref() {
                    Some(agent) => agent.is_closed(),
                    None => true,
                };
                if is_closed {
                    if let Err(err) = service.ensure_started(&user_id).await {
                        tracing::warn!(%err, "nip46 agent restart failed");
                    }
                }
            }
        })
    }

    pub async fn stop(&self) {
        if let Some(agent) = self.agent.lock().await.take() {
            agent.stop().await;
        }
    }

    /// `connectFromUri` (spec §4.3): validates and persists a `pending`
    /// session, merges new relays into the user's relay set, and — if an
    /// agent is already running for this user — immediately acks the client
    /// with `{id: secret, result: secret}` (or `"ack"` if no secret).
    pub async fn connect_from_uri(self: &Arc<Self>, user_id: &str, uri: &str) -> Result<Nip46SessionView, Nip46Error> {
        let payload = parse_connect_uri(uri)?;
        let policy = merge_policy(default_session_policy(), payload.requested_policy);

        self.db.upsert_nip46_session(
            user_id,
            &payload.client_pubkey,
            Nip46SessionStatus::Pending,
            &payload.profile,
            &payload.relays,
            &policy,
        )?;

        if !payload.relays.is_empty() {
            let user = self.db.get_user_by_id(user_id)?.ok_or_else(|| Nip46Error::Storage("user not found".to_string()))?;
            let mut merged = user.relays;
            for relay in &payload.relays {
                if !merged.contains(relay) {
                    merged.push(relay.clone());
                }
            }
            self.db.update_user_relays(user_id, &merged)?;
        }

        self.capabilities.log(
            "nip46:session_pending",
            json!({ "user_id": user_id, "client_pubkey": payload.client_pubkey }),
        );

        if let Some(agent) = self.agent.lock().await.as_ref() {
            agent.publish_connect_ack(&payload.client_pubkey, payload.secret.as_deref()).await;
        }

        let session = self
            .db
            .get_nip46_session(user_id, &payload.client_pubkey)?
            .ok_or_else(|| Nip46Error::Storage("session not persisted".to_string()))?;
        Ok(Nip46SessionView::from(&session))
    }

    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<Nip46SessionView>, Nip46Error> {
        Ok(self.db.list_nip46_sessions(user_id)?.iter().map(Nip46SessionView::from).collect())
    }

    pub fn list_requests(&self, user_id: &str) -> Result<Vec<Nip46RequestView>, Nip46Error> {
        Ok(self.db.list_nip46_requests(user_id)?.iter().map(Nip46RequestView::from).collect())
    }

    /// The group pubkey normalized to x-only form, for use as a Nostr
    /// identity (`get_public_key`, event `pubkey` field). The signer
    /// transport may hand back either a 33-byte compressed or x-only key;
    /// NIP-01 events always carry x-only pubkeys (spec §9 open question 1).
    fn identity_pubkey(&self) -> Option<String> {
        let pk = self.supervisor.group_public_key()?;
        Some(pubkey::normalize(&pk).unwrap_or(pk))
    }

    /// Request intake (spec §4.3 "Request intake"). Returns the response
    /// body to encrypt and publish back to the client, or `None` if the
    /// request was queued for operator approval.
    async fn handle_inbound(self: &Arc<Self>, user_id: &str, client_pubkey: &str, request: RpcRequest) -> Option<Value> {
        if let Err(err) = self.db.touch_nip46_session(user_id, client_pubkey, Nip46SessionStatus::Active) {
            tracing::warn!(%err, "failed to touch nip46 session");
        }

        match Nip46Method::decode(&request.method) {
            Nip46Method::Connect => Some(rpc_result(&request.id, json!("ack"))),
            Nip46Method::Ping => Some(rpc_result(&request.id, json!("pong"))),
            Nip46Method::GetPublicKey => match self.identity_pubkey() {
                Some(pk) => Some(rpc_result(&request.id, json!(pk))),
                None => Some(rpc_error(&request.id, "signer node unavailable")),
            },
            method => self.intake_queued(user_id, client_pubkey, &request, method).await,
        }
    }

    /// Deduplicates by request id, persists a pending `Nip46Request`, and
    /// auto-approves when the session policy allows it (spec §4.3 step 3).
    async fn intake_queued(
        self: &Arc<Self>,
        user_id: &str,
        client_pubkey: &str,
        request: &RpcRequest,
        method: Nip46Method,
    ) -> Option<Value> {
        let payload = json!({ "method": method.as_str(), "params": request.params });
        let inserted = self
            .db
            .create_nip46_request_if_absent(&request.id, user_id, client_pubkey, method.as_str(), &payload)
            .unwrap_or(false);
        if !inserted {
            return None;
        }

        let session = match self.db.get_nip46_session(user_id, client_pubkey) {
            Ok(Some(session)) => session,
            _ => return Some(rpc_error(&request.id, "unknown session")),
        };

        let auto_approve = match method {
            Nip46Method::SignEvent => {
                let kind = request.params.first().and_then(|p| p.get("kind")).and_then(Value::as_i64).unwrap_or(-1);
                session.policy.allows_sign_event(kind)
            }
            _ => session.policy.allows_method(method.as_str()),
        };

        if auto_approve {
            self.dispatch(user_id, &request.id).await
        } else {
            self.capabilities.log("nip46:request", json!({ "user_id": user_id, "id": request.id, "method": method.as_str() }));
            None
        }
    }

    /// Explicit operator approval of a pending request.
    pub async fn approve_request(self: &Arc<Self>, user_id: &str, request_id: &str) -> Option<Value> {
        self.dispatch(user_id, request_id).await
    }

    pub fn deny_request(&self, request_id: &str) -> Result<(), Nip46Error> {
        self.db.set_nip46_request_status(request_id, crate::types::Nip46RequestStatus::Denied, None, Some("denied by operator"))?;
        Ok(())
    }

    /// Single-flight dispatch (spec §4.3 "Single-flight"): a second approval
    /// while the first is processing is a no-op.
    async fn dispatch(self: &Arc<Self>, user_id: &str, request_id: &str) -> Option<Value> {
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(request_id.to_string()) {
                return None;
            }
        }
        let outcome = self.dispatch_inner(user_id, request_id).await;
        self.in_flight.lock().remove(request_id);
        outcome
    }

    async fn dispatch_inner(self: &Arc<Self>, user_id: &str, request_id: &str) -> Option<Value> {
        use crate::types::Nip46RequestStatus;

        let req = match self.db.get_nip46_request(request_id) {
            Ok(Some(req)) => req,
            _ => return None,
        };
        if req.status != Nip46RequestStatus::Pending {
            return None;
        }
        let _ = self.db.set_nip46_request_status(request_id, Nip46RequestStatus::Approved, None, None);

        let method = Nip46Method::decode(&req.method);
        let params = req.payload.get("params").cloned().unwrap_or(Value::Array(vec![]));
        let result = match method {
            Nip46Method::SignEvent => self.dispatch_sign_event(&params).await,
            Nip46Method::Nip44Encrypt => self.dispatch_nip44(user_id, &params, true).await,
            Nip46Method::Nip44Decrypt => self.dispatch_nip44(user_id, &params, false).await,
            Nip46Method::Nip04Encrypt => self.dispatch_nip04(user_id, &params, true).await,
            Nip46Method::Nip04Decrypt => self.dispatch_nip04(user_id, &params, false).await,
            other => Err(format!("unsupported method: {}", other.as_str())),
        };

        match result {
            Ok(value) => {
                let result_text = value.to_string();
                let _ = self.db.set_nip46_request_status(request_id, Nip46RequestStatus::Completed, Some(&result_text), None);
                self.capabilities.log(
                    "nip46:request_status",
                    json!({ "user_id": user_id, "id": request_id, "status": "completed" }),
                );
                Some(rpc_result(request_id, value))
            }
            Err(message) => {
                let _ = self.db.set_nip46_request_status(request_id, Nip46RequestStatus::Failed, None, Some(&message));
                self.capabilities.log(
                    "nip46:request_status",
                    json!({ "user_id": user_id, "id": request_id, "status": "failed", "error": message }),
                );
                Some(rpc_error(request_id, message))
            }
        }
    }

    async fn dispatch_sign_event(&self, params: &Value) -> Result<Value, String> {
        let template = params.first().ok_or("missing event template")?;
        let identity = self.identity_pubkey().ok_or("signer node unavailable")?;
        let kind = template.get("kind").and_then(Value::as_i64).ok_or("missing kind")?;
        let content = template.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
        let tags = parse_tags(template.get("tags"));
        let created_at = template.get("created_at").and_then(Value::as_i64).unwrap_or_else(|| chrono::Utc::now().timestamp());

        let hash = compute_event_id(&identity, created_at, kind, &tags, &content);
        let signature = self.supervisor.sign(&hash, self.op_timeout()).await.map_err(|e| e.to_string())?;

        Ok(json!({
            "id": hex::encode(hash),
            "pubkey": identity,
            "created_at": created_at,
            "kind": kind,
            "tags": tags,
            "content": content,
            "sig": signature,
        }))
    }

    /// The signer fan-out is about to invoke `req.ecdh` against `peer`, so
    /// the outbound authorization gate applies here the same way it does for
    /// the peer registry's own outbound calls (spec §4.2 "Authorization gate").
    fn authorize_outbound(&self, user_id: &str, peer: &str) -> Result<(), String> {
        let user = self.db.get_user_by_id(user_id).map_err(|e| e.to_string())?;
        let defaults = user.map(|u| u.peer_policy_defaults).unwrap_or_default();
        self.peers
            .authorize(user_id, peer, defaults, crate::peers::Direction::Outbound)
            .map_err(|e| e.to_string())
    }

    async fn dispatch_nip44(&self, user_id: &str, params: &Value, encrypt: bool) -> Result<Value, String> {
        let peer = params.first().and_then(Value::as_str).ok_or("missing peer pubkey")?;
        let normalized = pubkey::normalize(peer).ok_or("invalid peer pubkey")?;
        self.authorize_outbound(user_id, &normalized)?;
        let shared_hex = self.supervisor.ecdh(&normalized, self.op_timeout()).await.map_err(|e| e.to_string())?;
        let shared = decode_32(&shared_hex).ok_or("malformed shared secret")?;
        let conversation_key = ConversationKey::from_shared_x(&shared);

        let text = params.get(1).and_then(Value::as_str).ok_or("missing text")?;
        if encrypt {
            nip44::encrypt(text, &conversation_key).map(|v| json!(v)).map_err(|e| e.to_string())
        } else {
            nip44::decrypt(text, &conversation_key).map(|v| json!(v)).map_err(|e| e.to_string())
        }
    }

    async fn dispatch_nip04(&self, user_id: &str, params: &Value, encrypt: bool) -> Result<Value, String> {
        let peer = params.first().and_then(Value::as_str).ok_or("missing peer pubkey")?;
        let normalized = pubkey::normalize(peer).ok_or("invalid peer pubkey")?;
        self.authorize_outbound(user_id, &normalized)?;
        let shared_hex = self.supervisor.ecdh(&normalized, self.op_timeout()).await.map_err(|e| e.to_string())?;
        let shared = hex::decode(&shared_hex).map_err(|_| "malformed shared secret".to_string())?;

        let text = params.get(1).and_then(Value::as_str).ok_or("missing text")?;
        if encrypt {
            Ok(json!(nip04::encrypt(text, &shared)))
        } else {
            nip04::decrypt(text, &shared).map(|v| json!(v)).map_err(|e| e.to_string())
        }
    }
}

fn decode_32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

fn parse_tags(value: Option<&Value>) -> Vec<Vec<String>> {
    value
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_array)
                .map(|tag| tag.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .collect()
        })
        .unwrap_or_default()
}

/// NIP-01 event id: `sha256(serialize([0, pubkey, created_at, kind, tags, content]))`.
fn compute_event_id(pubkey_hex: &str, created_at: i64, kind: i64, tags: &[Vec<String>], content: &str) -> [u8; 32] {
    let serialized = json!([0, pubkey_hex, created_at, kind, tags, content]).to_string();
    Sha256::digest(serialized.as_bytes()).into()
}

fn sign_event_hash(secret: &[u8; 32], hash: &[u8; 32]) -> Option<String> {
    let signing_key = SigningKey::from_bytes(secret).ok()?;
    let signature: k256::schnorr::Signature = signing_key.sign_prehash(hash).ok()?;
    Some(hex::encode(signature.to_bytes()))
}

fn derive_xonly_pubkey(secret: &[u8; 32]) -> Option<String> {
    let signing_key = SigningKey::from_bytes(secret).ok()?;
    Some(hex::encode(signing_key.verifying_key().to_bytes()))
}

fn parse_event_frame(text: &str) -> Option<Value> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let array = frame.as_array()?;
    match array.first().and_then(Value::as_str) {
        Some("EVENT") => array.last().cloned(),
        _ => None,
    }
}

// --------------------------------------------------------------------- agent

struct AgentConn {
    writer: Mutex<futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>,
}

/// The Nostr-Connect protocol handler: one relay subscription per configured
/// relay, all feeding a shared inbound channel, plus the transport keypair
/// used to sign and encrypt the kind-24133 envelopes exchanged with clients.
/// This is a distinct relay identity from `crate::signer`'s FROST transport.
pub struct Nip46Agent {
    pubkey_xonly: String,
    secret: [u8; 32],
    conns: Mutex<Vec<Arc<AgentConn>>>,
    stop: tokio::sync::watch::Sender<bool>,
    live_relays: Arc<AtomicUsize>,
}

impl Nip46Agent {
    fn start(service: Arc<Nip46Service>, user_id: String, secret: [u8; 32], relays: Vec<String>) -> Arc<Self> {
        let pubkey_xonly = derive_xonly_pubkey(&secret).unwrap_or_default();
        let (stop_tx, _stop_rx) = tokio::sync::watch::channel(false);
        let agent = Arc::new(Self {
            pubkey_xonly,
            secret,
            conns: Mutex::new(Vec::new()),
            stop: stop_tx,
            live_relays: Arc::new(AtomicUsize::new(0)),
        });

        let (tx, rx) = mpsc::channel::<Value>(256);
        for url in relays {
            agent.clone().spawn_relay(url, tx.clone());
        }
        agent.clone().spawn_processor(service, user_id, rx);
        agent
    }

    fn is_closed(&self) -> bool {
        self.live_relays.load(Ordering::SeqCst) == 0
    }

    async fn stop(&self) {
        let _ = self.stop.send(true);
        let mut conns = self.conns.lock().await;
        for conn in conns.iter() {
            let _ = conn.writer.lock().await.close().await;
        }
        conns.clear();
    }

    fn spawn_relay(self: Arc<Self>, url: String, tx: mpsc::Sender<Value>) {
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let Ok((stream, _)) = connect_async(&url).await else {
                tracing::warn!(relay = %url, "nip46 agent failed to connect");
                return;
            };
            self.live_relays.fetch_add(1, Ordering::SeqCst);

            let (writer, mut reader) = stream.split();
            let conn = Arc::new(AgentConn { writer: Mutex::new(writer) });
            self.conns.lock().await.push(conn.clone());

            let sub_id = Uuid::new_v4().to_string();
            let filter = json!({ "kinds": [24133], "#p": [self.pubkey_xonly] });
            let req_frame = json!(["REQ", sub_id, filter]).to_string();
            let _ = conn.writer.lock().await.send(Message::Text(req_frame)).await;

            loop {
                tokio::select! {
                    frame = reader.next() => {
                        let Some(Ok(Message::Text(text))) = frame else { break };
                        if let Some(event) = parse_event_frame(&text) {
                            let _ = tx.send(event).await;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            self.live_relays.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(relay = %url, "nip46 agent relay connection closed");
        });
    }

    fn spawn_processor(self: Arc<Self>, service: Arc<Nip46Service>, user_id: String, mut rx: mpsc::Receiver<Value>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle_event(&service, &user_id, event).await;
            }
        });
    }

    /// Tries NIP-44 decrypt first, falls back to NIP-04 (spec §4.3
    /// "Decryption fallback"), dispatches the inner request, and publishes
    /// whichever encryption scheme succeeded back to the client.
    async fn handle_event(&self, service: &Arc<Nip46Service>, user_id: &str, event: Value) {
        let Some(sender_pubkey) = event.get("pubkey").and_then(Value::as_str) else { return };
        let Some(content) = event.get("content").and_then(Value::as_str) else { return };
        let Some(peer_xonly) = xonly_bytes(sender_pubkey) else { return };

        let nip44_attempt = ConversationKey::derive(&self.secret, &peer_xonly)
            .ok()
            .and_then(|conv| nip44::decrypt(content, &conv).ok());

        let (plaintext, use_nip44) = match nip44_attempt {
            Some(text) => (text, true),
            None => match self.nip04_decrypt(&peer_xonly, content) {
                Ok(text) => (text, false),
                Err(_) => return,
            },
        };

        let Ok(request) = serde_json::from_str::<RpcRequest>(&plaintext) else { return };
        let Some(response) = service.handle_inbound(user_id, sender_pubkey, request).await else { return };

        let response_text = response.to_string();
        let encrypted = if use_nip44 {
            match ConversationKey::derive(&self.secret, &peer_xonly).and_then(|conv| nip44::encrypt(&response_text, &conv)) {
                Ok(v) => v,
                Err(_) => return,
            }
        } else {
            let Ok(shared) = ecdh_with_secret(&self.secret, &peer_xonly) else { return };
            nip04::encrypt(&response_text, &shared)
        };

        self.publish_response(sender_pubkey, &encrypted).await;
    }

    fn nip04_decrypt(&self, peer_xonly: &[u8; 32], envelope: &str) -> Result<String, nip04::Nip04Error> {
        let shared = ecdh_with_secret(&self.secret, peer_xonly).map_err(|_| nip04::Nip04Error::DecryptionFailed)?;
        nip04::decrypt(envelope, &shared)
    }

    /// Proactive ack sent the moment a `nostrconnect://` uri is consumed
    /// (spec §4.3 "Connect-string onboarding"), preferring NIP-44.
    async fn publish_connect_ack(&self, client_pubkey: &str, secret: Option<&str>) {
        let Some(peer_xonly) = xonly_bytes(client_pubkey) else { return };
        let ack = secret.unwrap_or("ack");
        let body = rpc_result(ack, json!(ack)).to_string();

        let encrypted = match ConversationKey::derive(&self.secret, &peer_xonly) {
            Ok(conv) => match nip44::encrypt(&body, &conv) {
                Ok(text) => text,
                Err(_) => return,
            },
            Err(_) => return,
        };
        self.publish_response(client_pubkey, &encrypted).await;
    }

    async fn publish_response(&self, client_pubkey: &str, content: &str) {
        let created_at = chrono::Utc::now().timestamp();
        let tags = vec![vec!["p".to_string(), client_pubkey.to_string()]];
        let hash = compute_event_id(&self.pubkey_xonly, created_at, 24133, &tags, content);
        let Some(sig) = sign_event_hash(&self.secret, &hash) else { return };

        let event = json!({
            "id": hex::encode(hash),
            "pubkey": self.pubkey_xonly,
            "created_at": created_at,
            "kind": 24133,
            "tags": tags,
            "content": content,
            "sig": sig,
        });
        let frame = json!(["EVENT", event]).to_string();

        let conns = self.conns.lock().await;
        for conn in conns.iter() {
            let _ = conn.writer.lock().await.send(Message::Text(frame.clone())).await;
        }
    }
}

fn xonly_bytes(hex_pubkey: &str) -> Option<[u8; 32]> {
    let normalized = pubkey::normalize(hex_pubkey)?;
    decode_32(&normalized)
}

/// Local k256 ECDH between the agent's transport secret and a NIP-46
/// client's x-only pubkey, used only for the NIP-04 fallback path — distinct
/// from the FROST-peer ECDH in `crate::signer`, which never touches a raw
/// secret key.
fn ecdh_with_secret(secret: &[u8; 32], peer_xonly: &[u8; 32]) -> Result<[u8; 32], ()> {
    nip44::ecdh_shared_x(secret, peer_xonly).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_uri_with_perms() {
        let xonly = "ab".repeat(32);
        let uri = format!("nostrconnect://{xonly}?relay=wss://relay.example&secret=s3cr3t&name=TestApp&perms=sign_event:1,nip44_encrypt");
        let payload = parse_connect_uri(&uri).unwrap();
        assert_eq!(payload.client_pubkey, xonly);
        assert_eq!(payload.relays, vec!["wss://relay.example".to_string()]);
        assert_eq!(payload.secret.as_deref(), Some("s3cr3t"));
        assert!(payload.requested_policy.allows_method("sign_event"));
        assert!(payload.requested_policy.kinds.get("1").copied().unwrap_or(false));
    }

    #[test]
    fn rejects_non_nostrconnect_scheme() {
        let err = parse_connect_uri("https://example.com").unwrap_err();
        assert!(matches!(err, Nip46Error::InvalidConnectString(_)));
    }

    #[test]
    fn rejects_short_pubkey() {
        let err = parse_connect_uri("nostrconnect://deadbeef?relay=wss://r").unwrap_err();
        assert!(matches!(err, Nip46Error::InvalidConnectString(_)));
    }

    #[test]
    fn auto_approve_sign_event_requires_kind_match() {
        let mut methods = HashMap::new();
        methods.insert("sign_event".to_string(), true);
        let mut kinds = HashMap::new();
        kinds.insert("1".to_string(), true);
        let policy = Nip46Policy { methods, kinds };

        assert!(policy.allows_sign_event(1));
        assert!(!policy.allows_sign_event(30023));
    }

    #[test]
    fn parse_event_frame_extracts_event_object() {
        let frame = r#"["EVENT","sub-id",{"id":"abc","pubkey":"def"}]"#;
        let event = parse_event_frame(frame).unwrap();
        assert_eq!(event.get("id").and_then(Value::as_str), Some("abc"));
    }

    #[test]
    fn parse_event_frame_ignores_other_frame_types() {
        assert!(parse_event_frame(r#"["EOSE","sub-id"]"#).is_none());
    }

    #[test]
    fn decode_unknown_method_is_other() {
        assert_eq!(Nip46Method::decode("delegate"), Nip46Method::Other("delegate".to_string()));
    }
}
