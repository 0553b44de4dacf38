//! Signer Node Supervisor (spec §4.1).
//!
//! Owns exactly one instance of the opaque "signer transport" — the
//! FROST/Bifrost node contract described in spec §6 (`on/off`, `req.sign`,
//! `req.ecdh`, `ping`, relay pool status). The transport itself is an
//! external collaborator (FROST ceremony internals are an explicit
//! non-goal); what lives here is the lifecycle, the keepalive/health loop,
//! the event fan-out with dedup, and the serialized node-pointer queue.

use crate::events::ServerCapabilities;
use crate::peers::{PeerRegistry, PingError, PingTransport};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("signer node not started")]
    NotStarted,
    #[error("signer node unavailable: {0}")]
    Unavailable(String),
    #[error("operation timed out")]
    Timeout,
    #[error("node startup failed: {0}")]
    Startup(String),
}

/// A single event emitted by the transport: a tagged message whose tag
/// matches `/sign/…`, `/ecdh/…`, or `/ping/…` (spec §4.1 "Event fan-out").
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub id: String,
    pub tag: String,
    pub msg: Value,
}

/// The contract spec §6 describes for the opaque Bifrost node.
#[async_trait]
pub trait SignerTransport: Send + Sync {
    async fn connect(&self, relays: &[String]) -> Result<(), SupervisorError>;
    async fn disconnect(&self);
    async fn sign(&self, event_hash: &[u8; 32], timeout: Duration) -> Result<String, SupervisorError>;
    async fn ecdh(&self, peer_pubkey_hex: &str, timeout: Duration) -> Result<String, SupervisorError>;
    async fn ping_peer(&self, peer_pubkey_hex: &str, timeout: Duration) -> Result<Option<u64>, SupervisorError>;
    fn relay_status(&self) -> HashMap<String, bool>;
    async fn ensure_relay(&self, url: &str, timeout: Duration) -> Result<(), SupervisorError>;
    fn group_public_key(&self) -> Option<String>;
    fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent>;
}

struct RelayConn {
    writer: Mutex<futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>,
    connected: std::sync::atomic::AtomicBool,
}

/// Real-protocol boundary adapter: manages actual relay WebSocket
/// connections and a small request/response envelope layered on top,
/// standing in for the vendor FROST/Bifrost binding (spec §6 non-goal).
pub struct RelaySignerTransport {
    group_pk: SyncMutex<Option<String>>,
    conns: Mutex<HashMap<String, Arc<RelayConn>>>,
    pending: Arc<SyncMutex<HashMap<String, oneshot::Sender<Value>>>>,
    events_tx: broadcast::Sender<NodeEvent>,
    req_counter: AtomicU32,
}

impl RelaySignerTransport {
    pub fn new(group_pk: Option<String>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            group_pk: SyncMutex::new(group_pk),
            conns: Mutex::new(HashMap::new()),
            pending: Arc::new(SyncMutex::new(HashMap::new())),
            events_tx,
            req_counter: AtomicU32::new(0),
        }
    }

    fn next_id(&self, tag: &str) -> String {
        let n = self.req_counter.fetch_add(1, Ordering::Relaxed);
        format!("{tag}/{n}/{}", Uuid::new_v4())
    }

    async fn connect_one(&self, url: &str, timeout: Duration) -> Result<(), SupervisorError> {
        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| SupervisorError::Timeout)?
            .map_err(|e| SupervisorError::Unavailable(e.to_string()))?;

        let (writer, mut reader) = stream.split();
        let conn = Arc::new(RelayConn {
            writer: Mutex::new(writer),
            connected: std::sync::atomic::AtomicBool::new(true),
        });
        self.conns.lock().await.insert(url.to_string(), conn.clone());

        let pending = self.pending.clone();
        let events_tx = self.events_tx.clone();
        let url_owned = url.to_string();
        let conns_marker = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let Ok(Message::Text(text)) = frame else { continue };
                let Ok(envelope) = serde_json::from_str::<Value>(&text) else { continue };
                dispatch_incoming(envelope, &pending, &events_tx);
            }
            conns_marker.connected.store(false, Ordering::SeqCst);
            tracing::warn!(relay = %url_owned, "relay connection closed");
        });

        Ok(())
    }

    async fn publish(&self, envelope: &Value) -> Result<(), SupervisorError> {
        let conns = self.conns.lock().await;
        if conns.is_empty() {
            return Err(SupervisorError::Unavailable("no connected relays".to_string()));
        }
        let text = envelope.to_string();
        let mut sent = false;
        for conn in conns.values() {
            if !conn.connected.load(Ordering::SeqCst) {
                continue;
            }
            let mut writer = conn.writer.lock().await;
            if writer.send(Message::Text(text.clone())).await.is_ok() {
                sent = true;
            }
        }
        if sent { Ok(()) } else { Err(SupervisorError::Unavailable("no reachable relays".to_string())) }
    }

    async fn request(&self, tag_prefix: &str, body: Value, timeout: Duration) -> Result<Value, SupervisorError> {
        let id = self.next_id(tag_prefix);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let envelope = json!({ "tag": format!("{tag_prefix}/{id}"), "id": id, "body": body });
        if let Err(e) = self.publish(&envelope).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SupervisorError::Unavailable("response channel closed".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SupervisorError::Timeout)
            }
        }
    }
}

fn dispatch_incoming(
    envelope: Value,
    pending: &SyncMutex<HashMap<String, oneshot::Sender<Value>>>,
    events_tx: &broadcast::Sender<NodeEvent>,
) {
    let Some(id) = envelope.get("id").and_then(Value::as_str).map(str::to_string) else { return };
    let tag = envelope.get("tag").and_then(Value::as_str).unwrap_or_default().to_string();
    let body = envelope.get("body").cloned().unwrap_or(Value::Null);

    if let Some(sender) = pending.lock().remove(&id) {
        let _ = sender.send(body.clone());
    }
    let _ = events_tx.send(NodeEvent { id, tag, msg: body });
}

#[async_trait]
impl SignerTransport for RelaySignerTransport {
    async fn connect(&self, relays: &[String]) -> Result<(), SupervisorError> {
        let mut last_err = None;
        let mut any_ok = false;
        for url in relays {
            match self.connect_one(url, Duration::from_secs(10)).await {
                Ok(()) => any_ok = true,
                Err(e) => last_err = Some(e),
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(last_err.unwrap_or(SupervisorError::Unavailable("no relays configured".to_string())))
        }
    }

    async fn disconnect(&self) {
        let mut conns = self.conns.lock().await;
        for conn in conns.values() {
            let _ = conn.writer.lock().await.close().await;
        }
        conns.clear();
    }

    async fn sign(&self, event_hash: &[u8; 32], timeout: Duration) -> Result<String, SupervisorError> {
        let body = json!({ "event_hash": hex::encode(event_hash) });
        let response = self.request("sign", body, timeout).await?;
        response
            .get("signature")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SupervisorError::Unavailable("malformed sign response".to_string()))
    }

    async fn ecdh(&self, peer_pubkey_hex: &str, timeout: Duration) -> Result<String, SupervisorError> {
        let body = json!({ "peer": peer_pubkey_hex });
        let response = self.request("ecdh", body, timeout).await?;
        response
            .get("shared_secret")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SupervisorError::Unavailable("malformed ecdh response".to_string()))
    }

    async fn ping_peer(&self, peer_pubkey_hex: &str, timeout: Duration) -> Result<Option<u64>, SupervisorError> {
        let sent_at = chrono::Utc::now().timestamp_millis();
        let body = json!({ "peer": peer_pubkey_hex, "timestamp": sent_at });
        let response = self.request("ping", body, timeout).await?;
        let latency = response
            .get("latency")
            .and_then(Value::as_u64)
            .or_else(|| {
                response.get("timestamp").and_then(Value::as_i64).map(|ts| (chrono::Utc::now().timestamp_millis() - ts).max(0) as u64)
            });
        Ok(latency)
    }

    fn relay_status(&self) -> HashMap<String, bool> {
        self.conns
            .try_lock()
            .map(|conns| conns.iter().map(|(url, conn)| (url.clone(), conn.connected.load(Ordering::SeqCst))).collect())
            .unwrap_or_default()
    }

    async fn ensure_relay(&self, url: &str, timeout: Duration) -> Result<(), SupervisorError> {
        if let Some(conn) = self.conns.lock().await.get(url) {
            if conn.connected.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        self.connect_one(url, timeout).await
    }

    fn group_public_key(&self) -> Option<String> {
        self.group_pk.lock().clone()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }
}

#[async_trait]
impl PingTransport for SignerSupervisor {
    async fn ping(&self, pubkey: &str, timeout: Duration) -> Result<Option<u64>, PingError> {
        let transport = self.transport().ok_or_else(|| PingError::Unavailable("not started".to_string()))?;
        transport.ping_peer(pubkey, timeout).await.map_err(|e| match e {
            SupervisorError::Timeout => PingError::Timeout,
            other => PingError::Unavailable(other.to_string()),
        })
    }
}

#[derive(Clone)]
pub struct NodeConfig {
    pub group_credential: String,
    pub share_credential: String,
    pub relays: Vec<String>,
}

/// Backoff/connectivity knobs, sourced from the `NODE_*`/`INITIAL_CONNECTIVITY_DELAY`
/// environment keys (spec §6). `Default` mirrors the values this module used
/// before they became configurable, so existing callers and tests are unaffected.
#[derive(Clone, Copy)]
pub struct SupervisorTuning {
    pub restart_delay: Duration,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
    pub initial_connectivity_delay: Duration,
}

impl Default for SupervisorTuning {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(500),
            max_retries: 5,
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(10),
            initial_connectivity_delay: Duration::from_millis(500),
        }
    }
}

struct SupervisorState {
    transport: Option<Arc<dyn SignerTransport>>,
    last_config: Option<NodeConfig>,
    last_activity: std::time::Instant,
    consecutive_failures: u32,
    recent_events: VecDeque<(String, String)>,
}

/// All node-pointer mutations (`start`/`stop`/`recreate`/credential-reload)
/// go through `inner`'s async mutex so they are serialized (spec §4.1
/// "Concurrency lock"): one failure never poisons later operations because
/// the mutex is released on every path, success or error.
pub struct SignerSupervisor {
    inner: Mutex<SupervisorState>,
    capabilities: ServerCapabilities,
    peers: Arc<PeerRegistry>,
    user_id: String,
    health_stop: tokio::sync::watch::Sender<bool>,
    tuning: SupervisorTuning,
}

const DEDUP_WINDOW: usize = 5;
const IDLE_THRESHOLD: Duration = Duration::from_secs(45);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const FAILURE_RECREATE_THRESHOLD: u32 = 3;
const STALE_RECREATE: Duration = Duration::from_secs(600);

impl SignerSupervisor {
    pub fn new(capabilities: ServerCapabilities, peers: Arc<PeerRegistry>, user_id: String) -> Arc<Self> {
        Self::new_with_tuning(capabilities, peers, user_id, SupervisorTuning::default())
    }

    pub fn new_with_tuning(
        capabilities: ServerCapabilities,
        peers: Arc<PeerRegistry>,
        user_id: String,
        tuning: SupervisorTuning,
    ) -> Arc<Self> {
        let (health_stop, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            inner: Mutex::new(SupervisorState {
                transport: None,
                last_config: None,
                last_activity: std::time::Instant::now(),
                consecutive_failures: 0,
                recent_events: VecDeque::with_capacity(DEDUP_WINDOW),
            }),
            capabilities,
            peers,
            user_id,
            health_stop,
            tuning,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn transport(&self) -> Option<Arc<dyn SignerTransport>> {
        self.inner.try_lock().ok().and_then(|s| s.transport.clone())
    }

    /// Retries up to 5 times with exponential backoff capped at 10s; on
    /// final failure falls back to a minimal constructor once; on that
    /// failure, surfaces `NodeStartupError` (spec §4.1 `start`).
    pub async fn start(&self, config: NodeConfig) -> Result<(), SupervisorError> {
        let mut delay = self.tuning.restart_delay;
        let mut last_err = None;
        let max_retries = self.tuning.max_retries.max(1);
        for attempt in 0..max_retries {
            match self.try_connect(&config).await {
                Ok(transport) => {
                    self.install(transport, config).await?;
                    self.spawn_initial_connectivity_sweep();
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(delay).await;
                        delay = Duration::from_secs_f64(delay.as_secs_f64() * self.tuning.backoff_multiplier)
                            .min(self.tuning.max_retry_delay);
                    }
                }
            }
        }

        // Minimal fallback constructor: attempt once more with just the group
        // key, no relay set, so the node at least holds its share in memory.
        let minimal = NodeConfig { relays: vec![], ..config.clone() };
        match self.try_connect(&minimal).await {
            Ok(transport) => {
                self.install(transport, config).await?;
                self.spawn_initial_connectivity_sweep();
                Ok(())
            }
            Err(_) => Err(SupervisorError::Startup(
                last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown startup failure".to_string()),
            )),
        }
    }

    /// One-shot delayed relay probe right after a successful `start`, so a
    /// relay that accepted the TCP handshake but never became ready shows up
    /// in the next health tick instead of silently staying marked up.
    fn spawn_initial_connectivity_sweep(&self) {
        let Some(transport) = self.transport() else { return };
        let delay = self.tuning.initial_connectivity_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let statuses = transport.relay_status();
            let down = statuses.values().filter(|up| !**up).count();
            if down > 0 {
                tracing::debug!(down, "initial connectivity sweep found unready relays");
            }
        });
    }

    async fn try_connect(&self, config: &NodeConfig) -> Result<Arc<dyn SignerTransport>, SupervisorError> {
        let transport: Arc<dyn SignerTransport> = Arc::new(RelaySignerTransport::new(Some(config.group_credential.clone())));
        transport.connect(&config.relays).await?;
        Ok(transport)
    }

    async fn install(&self, transport: Arc<dyn SignerTransport>, config: NodeConfig) -> Result<(), SupervisorError> {
        let mut state = self.inner.lock().await;
        state.transport = Some(transport);
        state.last_config = Some(config);
        state.last_activity = std::time::Instant::now();
        state.consecutive_failures = 0;
        Ok(())
    }

    /// Idempotent; never throws (spec §4.1 `stop`). Also cancels the health
    /// loop — this is a terminal shutdown, not a transport swap.
    pub async fn stop(&self) {
        self.teardown_transport().await;
        let _ = self.health_stop.send(true);
    }

    /// Drops the current transport without signalling `health_stop`, so the
    /// health loop that calls this (via `recreate`) keeps running afterward
    /// instead of cancelling itself on its own next tick.
    async fn teardown_transport(&self) {
        let mut state = self.inner.lock().await;
        if let Some(transport) = state.transport.take() {
            transport.disconnect().await;
        }
    }

    pub async fn recreate(&self) -> Result<(), SupervisorError> {
        let last_config = {
            let state = self.inner.lock().await;
            state.last_config.clone().ok_or(SupervisorError::NotStarted)?
        };
        self.teardown_transport().await;
        self.start(last_config).await
    }

    /// Only a "real" event (a tagged message, not an internal keepalive)
    /// resets `last_activity` — this is what keeps a live ping loop from
    /// masking a dead subscription (spec §4.1).
    pub fn record_real_event(&self, event: &NodeEvent) -> bool {
        let mut state = match self.inner.try_lock() {
            Ok(s) => s,
            Err(_) => return false,
        };
        let key = (event.id.clone(), event.tag.clone());
        if state.recent_events.contains(&key) {
            return false;
        }
        if state.recent_events.len() >= DEDUP_WINDOW {
            state.recent_events.pop_front();
        }
        state.recent_events.push_back(key);
        state.last_activity = std::time::Instant::now();

        if event.tag.starts_with("ping/") {
            self.peers.observe_ping(&event.id, None);
        }
        self.capabilities.log("signer_event", json!({ "tag": event.tag, "id": event.id }));
        true
    }

    pub async fn sign(&self, event_hash: &[u8; 32], timeout: Duration) -> Result<String, SupervisorError> {
        let transport = self.transport().ok_or(SupervisorError::NotStarted)?;
        transport.sign(event_hash, timeout).await
    }

    pub async fn ecdh(&self, peer_pubkey_hex: &str, timeout: Duration) -> Result<String, SupervisorError> {
        let transport = self.transport().ok_or(SupervisorError::NotStarted)?;
        transport.ecdh(peer_pubkey_hex, timeout).await
    }

    pub fn group_public_key(&self) -> Option<String> {
        self.transport().and_then(|t| t.group_public_key())
    }

    /// Spawns the 60s keepalive/health loop (spec §4.1 "Keepalive / health
    /// loop"). Exits on its next tick once `stop()` fires the cancellation
    /// watch.
    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        let mut stop_rx = self.health_stop.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        supervisor.health_tick().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn health_tick(&self) {
        let Some(transport) = self.transport() else { return };

        let statuses = transport.relay_status();
        let mut any_down = false;
        for (url, up) in &statuses {
            if !up {
                any_down = true;
                if transport.ensure_relay(url, Duration::from_secs(10)).await.is_err() {
                    self.bump_failure().await;
                }
            }
        }

        let (idle, stale) = {
            let state = self.inner.lock().await;
            (state.last_activity.elapsed() >= IDLE_THRESHOLD, state.last_activity.elapsed() >= STALE_RECREATE)
        };

        if idle && !any_down {
            if let Some(pubkey) = self.peers.known_pubkeys().first().cloned() {
                match transport.ping_peer(&pubkey, PING_TIMEOUT).await {
                    Ok(_) => self.reset_failures().await,
                    Err(_) => self.bump_failure().await,
                }
            }
        }

        let failures = { self.inner.lock().await.consecutive_failures };
        if failures >= FAILURE_RECREATE_THRESHOLD || stale {
            if let Err(err) = self.recreate().await {
                tracing::error!(%err, "signer supervisor recreate failed");
            }
        }
    }

    async fn bump_failure(&self) {
        let mut state = self.inner.lock().await;
        state.consecutive_failures += 1;
    }

    async fn reset_failures(&self) {
        let mut state = self.inner.lock().await;
        state.consecutive_failures = 0;
        state.last_activity = std::time::Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn supervisor() -> Arc<SignerSupervisor> {
        let caps = ServerCapabilities::new(EventBus::new(16));
        let db = {
            let dir = tempfile::tempdir().unwrap();
            crate::db::Database::open(dir.path().join("signer.sqlite")).unwrap()
        };
        let peers = Arc::new(PeerRegistry::new(db));
        SignerSupervisor::new(caps, peers, "user-1".to_string())
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let supervisor = supervisor();
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn recreate_without_prior_start_fails_cleanly() {
        let supervisor = supervisor();
        let err = supervisor.recreate().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotStarted));
    }

    #[test]
    fn dedup_window_drops_repeated_id_tag_pairs() {
        let supervisor = supervisor();
        let event = NodeEvent { id: "abc".to_string(), tag: "ping/abc".to_string(), msg: Value::Null };
        assert!(supervisor.record_real_event(&event));
        assert!(!supervisor.record_real_event(&event));
    }
}
