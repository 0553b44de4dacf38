use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// A user row (spec §3). `password_hash` is a PHC-format Argon2id string
/// with the salt embedded; `encryption_salt` is the *separate* 16 random
/// bytes used only for credential PBKDF2, never the auth salt (spec §8
/// invariant 3).
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub encryption_salt: [u8; 16],
    pub group_credential: Option<String>,
    pub share_credential: Option<String>,
    pub group_name: Option<String>,
    pub relays: Vec<String>,
    pub peer_policy_defaults: PolicyDefaults,
    pub display_name: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Layered defaults a user can configure for peers with no explicit policy
/// (spec §4.2 `get_policy`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyDefaults {
    pub allow_send: bool,
    pub allow_receive: bool,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self { allow_send: true, allow_receive: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub has_credentials: bool,
    pub relays: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserPublic {
    fn from(u: &User) -> Self {
        Self {
            id: u.id.clone(),
            username: u.username.clone(),
            display_name: u.display_name.clone(),
            role: u.role,
            has_credentials: u.group_credential.is_some() && u.share_credential.is_some(),
            relays: u.relays.clone(),
            created_at: u.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub prefix: String,
    pub token_hash: String,
    pub label: Option<String>,
    pub created_by_user_id: Option<String>,
    pub created_by_admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_used_ip: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyPublic {
    pub id: String,
    pub prefix: String,
    pub label: Option<String>,
    pub created_by_user_id: Option<String>,
    pub created_by_admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_used_ip: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
}

impl From<&ApiKey> for ApiKeyPublic {
    fn from(k: &ApiKey) -> Self {
        Self {
            id: k.id.clone(),
            prefix: k.prefix.clone(),
            label: k.label.clone(),
            created_by_user_id: k.created_by_user_id.clone(),
            created_by_admin: k.created_by_admin,
            created_at: k.created_at,
            last_used_at: k.last_used_at,
            last_used_ip: k.last_used_ip.clone(),
            revoked_at: k.revoked_at,
            revoked_reason: k.revoked_reason.clone(),
        }
    }
}

/// In-memory liveness state for a peer, keyed by its normalized pubkey
/// (spec §3/§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub pubkey: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub last_ping_attempt: Option<DateTime<Utc>>,
}

impl PeerStatus {
    pub fn unknown(pubkey: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            online: false,
            last_seen: None,
            latency_ms: None,
            last_ping_attempt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Config,
    User,
}

/// Persisted per-peer override (spec §3). `None` fields mean "inherit
/// default"; `get_policy` layers this over `PolicyDefaults`.
#[derive(Debug, Clone)]
pub struct PeerPolicyRow {
    pub pubkey: String,
    pub allow_send: Option<bool>,
    pub allow_receive: Option<bool>,
    pub source: PolicySource,
    pub last_updated: DateTime<Utc>,
}

/// The layered view returned by `get_policy` (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub pubkey: String,
    pub allow_send: Option<bool>,
    pub allow_receive: Option<bool>,
    pub effective_send: bool,
    pub effective_receive: bool,
    pub has_explicit_policy: bool,
    pub source: Option<PolicySource>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerView {
    pub pubkey: String,
    pub status: PeerStatus,
    pub policy: EffectivePolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Nip46SessionStatus {
    Pending,
    Active,
    Revoked,
}

impl Nip46SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Nip46Profile {
    pub name: Option<String>,
    pub url: Option<String>,
    pub image: Option<String>,
}

/// `policy.methods`/`policy.kinds` drive auto-approval (spec §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Nip46Policy {
    pub methods: HashMap<String, bool>,
    pub kinds: HashMap<String, bool>,
}

impl Nip46Policy {
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.get(method).copied().unwrap_or(false)
    }

    pub fn allows_sign_event(&self, kind: i64) -> bool {
        if !self.allows_method("sign_event") {
            return false;
        }
        self.kinds.get("*").copied().unwrap_or(false)
            || self.kinds.get(&kind.to_string()).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Nip46Session {
    pub user_id: String,
    pub client_pubkey: String,
    pub status: Nip46SessionStatus,
    pub profile: Nip46Profile,
    pub relays: Vec<String>,
    pub policy: Nip46Policy,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nip46SessionView {
    pub client_pubkey: String,
    pub status: Nip46SessionStatus,
    pub profile: Nip46Profile,
    pub relays: Vec<String>,
    pub policy: Nip46Policy,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl From<&Nip46Session> for Nip46SessionView {
    fn from(s: &Nip46Session) -> Self {
        Self {
            client_pubkey: s.client_pubkey.clone(),
            status: s.status,
            profile: s.profile.clone(),
            relays: s.relays.clone(),
            policy: s.policy.clone(),
            created_at: s.created_at,
            last_active_at: s.last_active_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Nip46RequestStatus {
    Pending,
    Approved,
    Denied,
    Completed,
    Failed,
}

impl Nip46RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Nip46Request {
    pub id: String,
    pub user_id: String,
    pub session_pubkey: String,
    pub method: String,
    pub payload: Value,
    pub status: Nip46RequestStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nip46RequestView {
    pub id: String,
    pub session_pubkey: String,
    pub method: String,
    pub payload: Value,
    pub status: Nip46RequestStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Nip46Request> for Nip46RequestView {
    fn from(r: &Nip46Request) -> Self {
        Self {
            id: r.id.clone(),
            session_pubkey: r.session_pubkey.clone(),
            method: r.method.clone(),
            payload: r.payload.clone(),
            status: r.status,
            result: r.result.clone(),
            error: r.error.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Result of `RateLimiter::check_limit` (spec §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub count: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

// ---- HTTP request/response DTOs (spec §6) ----

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// `POST /api/auth/register`: open while no account exists yet (the first
/// registrant is auto-promoted to admin, see `AuthManager::create_user`),
/// admin-only afterward.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub session_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvPatchRequest {
    #[serde(default)]
    pub relays: Option<Vec<String>>,
    #[serde(default)]
    pub session_timeout_secs: Option<i64>,
    #[serde(default)]
    pub sign_timeout_ms: Option<u64>,
    #[serde(default)]
    pub allowed_origins: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit_enabled: Option<bool>,
    #[serde(default)]
    pub rate_limit_window_secs: Option<i64>,
    #[serde(default)]
    pub rate_limit_max: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvDeleteRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvResponse {
    pub relays: Vec<String>,
    pub session_timeout_secs: i64,
    pub sign_timeout_ms: u64,
    pub allowed_origins: Vec<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_window_secs: i64,
    pub rate_limit_max: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsRequest {
    pub share_credential: String,
    pub group_credential: String,
    pub group_name: Option<String>,
    #[serde(default)]
    pub relays: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerPingRequest {
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerPingResponse {
    pub results: Vec<PeerStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerPolicyRequest {
    #[serde(default)]
    pub allow_send: Option<bool>,
    #[serde(default)]
    pub allow_receive: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfPubkeyResponse {
    pub pubkey: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerListResponse {
    pub peers: Vec<PeerView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyCreateRequest {
    pub label: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyCreateResponse {
    pub token: String,
    pub prefix: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyRevokeRequest {
    pub api_key_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyListResponse {
    pub keys: Vec<ApiKeyPublic>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Nip46SessionListResponse {
    pub sessions: Vec<Nip46SessionView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Nip46RequestListResponse {
    pub requests: Vec<Nip46RequestView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nip46RequestDecisionRequest {
    pub request_id: String,
}
