use crate::types::{
    ApiKey, EffectivePolicy, Nip46Policy, Nip46Profile, Nip46Request, Nip46RequestStatus,
    Nip46Session, Nip46SessionStatus, PeerPolicyRow, PolicyDefaults, PolicySource,
    RateLimitOutcome, Role, User,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn json_text(value: &Value) -> String {
    value.to_string()
}

impl Database {
    pub fn open(db_path: PathBuf) -> rusqlite::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(1),
                    Some(format!("failed creating {}: {e}", parent.display())),
                )
            })?;
            Self::restrict_permissions(parent);
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                encryption_salt TEXT NOT NULL,
                group_credential TEXT,
                share_credential TEXT,
                group_name TEXT,
                relays TEXT NOT NULL DEFAULT '[]',
                policy_default_send INTEGER NOT NULL DEFAULT 1,
                policy_default_receive INTEGER NOT NULL DEFAULT 1,
                display_name TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                transport_secret TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                ip_address TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_access INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                prefix TEXT NOT NULL UNIQUE,
                token_hash TEXT NOT NULL,
                label TEXT,
                created_by_user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
                created_by_admin INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER,
                last_used_ip TEXT,
                revoked_at INTEGER,
                revoked_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(prefix);

            CREATE TABLE IF NOT EXISTS rate_limits (
                identifier TEXT NOT NULL,
                bucket TEXT NOT NULL,
                count INTEGER NOT NULL,
                window_start_ms INTEGER NOT NULL,
                last_attempt_ms INTEGER NOT NULL,
                PRIMARY KEY (identifier, bucket)
            );

            CREATE TABLE IF NOT EXISTS peer_policies (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                pubkey TEXT NOT NULL,
                allow_send INTEGER,
                allow_receive INTEGER,
                source TEXT NOT NULL DEFAULT 'user',
                last_updated INTEGER NOT NULL,
                PRIMARY KEY (user_id, pubkey)
            );

            CREATE TABLE IF NOT EXISTS nip46_sessions (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                client_pubkey TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                profile TEXT NOT NULL DEFAULT '{}',
                relays TEXT NOT NULL DEFAULT '[]',
                policy TEXT NOT NULL DEFAULT '{\"methods\":{},\"kinds\":{}}',
                created_at INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, client_pubkey)
            );

            CREATE TABLE IF NOT EXISTS nip46_session_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                client_pubkey TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nip46_events_session
                ON nip46_session_events(user_id, client_pubkey);

            CREATE TABLE IF NOT EXISTS nip46_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                session_pubkey TEXT NOT NULL,
                method TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nip46_requests_user ON nip46_requests(user_id);
            ",
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    #[cfg(unix)]
    fn restrict_permissions(dir: &std::path::Path) {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_dir: &std::path::Path) {}

    // ---------------------------------------------------------------- users

    pub fn count_users(&self) -> rusqlite::Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
    }

    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        encryption_salt: &[u8; 16],
        role: Role,
    ) -> rusqlite::Result<User> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, username, password_hash, encryption_salt, relays,
                policy_default_send, policy_default_receive, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, '[]', 1, 1, ?5, ?6, ?6)",
            params![id, username, password_hash, hex::encode(encryption_salt), role.as_str(), now],
        )?;
        drop(conn);
        self.get_user_by_id(&id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let salt_hex: String = row.get("encryption_salt")?;
        let mut encryption_salt = [0u8; 16];
        if let Ok(bytes) = hex::decode(&salt_hex) {
            if bytes.len() == 16 {
                encryption_salt.copy_from_slice(&bytes);
            }
        }
        let relays_json: String = row.get("relays")?;
        let relays: Vec<String> = serde_json::from_str(&relays_json).unwrap_or_default();
        let role_str: String = row.get("role")?;
        Ok(User {
            id: row.get("id")?,
            username: row.get("username")?,
            password_hash: row.get("password_hash")?,
            encryption_salt,
            group_credential: row.get("group_credential")?,
            share_credential: row.get("share_credential")?,
            group_name: row.get("group_name")?,
            relays,
            peer_policy_defaults: PolicyDefaults {
                allow_send: row.get::<_, i64>("policy_default_send")? != 0,
                allow_receive: row.get::<_, i64>("policy_default_receive")? != 0,
            },
            display_name: row.get("display_name")?,
            role: Role::parse(&role_str).unwrap_or(Role::User),
            created_at: ts_to_datetime(row.get::<_, i64>("created_at")? / 1000),
            updated_at: ts_to_datetime(row.get::<_, i64>("updated_at")? / 1000),
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> rusqlite::Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], Self::row_to_user)
            .optional()
    }

    pub fn get_user_by_username(&self, username: &str) -> rusqlite::Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM users WHERE username = ?1",
            params![username],
            Self::row_to_user,
        )
        .optional()
    }

    pub fn store_user_credentials(
        &self,
        user_id: &str,
        group_credential: &str,
        share_credential: &str,
        group_name: Option<&str>,
        relays: &[String],
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET group_credential = ?1, share_credential = ?2, group_name = ?3,
                relays = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                group_credential,
                share_credential,
                group_name,
                serde_json::to_string(relays).unwrap_or_else(|_| "[]".to_string()),
                now_ms(),
                user_id,
            ],
        )?;
        Ok(())
    }

    pub fn clear_user_credentials(&self, user_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET group_credential = NULL, share_credential = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now_ms(), user_id],
        )?;
        Ok(())
    }

    pub fn update_user_relays(&self, user_id: &str, relays: &[String]) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET relays = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(relays).unwrap_or_else(|_| "[]".to_string()), now_ms(), user_id],
        )?;
        Ok(())
    }

    pub fn set_encryption_salt(&self, user_id: &str, salt: &[u8; 16]) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET encryption_salt = ?1, updated_at = ?2 WHERE id = ?3",
            params![hex::encode(salt), now_ms(), user_id],
        )?;
        Ok(())
    }

    pub fn set_password_hash(&self, user_id: &str, password_hash: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
            params![password_hash, now_ms(), user_id],
        )?;
        Ok(())
    }

    /// Lazily creates and returns this user's 32-byte NIP-46 transport secret
    /// (spec §4.3).
    pub fn get_or_create_transport_secret(&self, user_id: &str) -> rusqlite::Result<[u8; 32]> {
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT transport_secret FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        if let Some(hex_secret) = existing {
            if let Ok(bytes) = hex::decode(&hex_secret) {
                if bytes.len() == 32 {
                    let mut out = [0u8; 32];
                    out.copy_from_slice(&bytes);
                    return Ok(out);
                }
            }
        }

        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        conn.execute(
            "UPDATE users SET transport_secret = ?1 WHERE id = ?2",
            params![hex::encode(secret), user_id],
        )?;
        Ok(secret)
    }

    // ------------------------------------------------------------- sessions

    pub fn create_session(&self, user_id: &str, ip_address: &str) -> rusqlite::Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, user_id, ip_address, created_at, last_access)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, user_id, ip_address, now],
        )?;
        Ok(id)
    }

    pub fn get_session(&self, id: &str) -> rusqlite::Result<Option<(String, String)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, ip_address FROM sessions WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
    }

    pub fn touch_session(&self, id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET last_access = ?1 WHERE id = ?2",
            params![now_ms(), id],
        )?;
        Ok(())
    }

    pub fn delete_session(&self, id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Evicts sessions idle past `ttl_secs` and returns the evicted ids so
    /// in-memory caches can invalidate them (spec §4.4).
    pub fn sweep_sessions(&self, ttl_secs: i64) -> rusqlite::Result<Vec<String>> {
        let cutoff = now_ms() - ttl_secs * 1000;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM sessions WHERE last_access < ?1")?;
        let ids: Vec<String> = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        conn.execute("DELETE FROM sessions WHERE last_access < ?1", params![cutoff])?;
        Ok(ids)
    }

    // ------------------------------------------------------------ api keys

    pub fn create_api_key(
        &self,
        prefix: &str,
        token_hash: &str,
        label: Option<&str>,
        created_by_user_id: Option<&str>,
        created_by_admin: bool,
    ) -> rusqlite::Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_keys (id, prefix, token_hash, label, created_by_user_id,
                created_by_admin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, prefix, token_hash, label, created_by_user_id, created_by_admin as i64, now],
        )?;
        Ok(id)
    }

    fn row_to_api_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
        Ok(ApiKey {
            id: row.get("id")?,
            prefix: row.get("prefix")?,
            token_hash: row.get("token_hash")?,
            label: row.get("label")?,
            created_by_user_id: row.get("created_by_user_id")?,
            created_by_admin: row.get::<_, i64>("created_by_admin")? != 0,
            created_at: ts_to_datetime(row.get::<_, i64>("created_at")? / 1000),
            last_used_at: row.get::<_, Option<i64>>("last_used_at")?.map(|v| ts_to_datetime(v / 1000)),
            last_used_ip: row.get("last_used_ip")?,
            revoked_at: row.get::<_, Option<i64>>("revoked_at")?.map(|v| ts_to_datetime(v / 1000)),
            revoked_reason: row.get("revoked_reason")?,
        })
    }

    pub fn get_api_key_by_prefix(&self, prefix: &str) -> rusqlite::Result<Option<ApiKey>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM api_keys WHERE prefix = ?1",
            params![prefix],
            Self::row_to_api_key,
        )
        .optional()
    }

    pub fn list_api_keys(&self) -> rusqlite::Result<Vec<ApiKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM api_keys ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], Self::row_to_api_key)?;
        rows.collect()
    }

    pub fn mark_api_key_used(&self, id: &str, ip: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?1, last_used_ip = ?2 WHERE id = ?3",
            params![now_ms(), ip, id],
        )?;
        Ok(())
    }

    pub fn revoke_api_key(&self, id: &str, reason: Option<&str>) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE api_keys SET revoked_at = ?1, revoked_reason = ?2 WHERE id = ?3",
            params![now_ms(), reason, id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------- rate limits

    /// Atomic check-and-increment under an IMMEDIATE transaction (spec §4.5).
    pub fn rate_limit_check(
        &self,
        identifier: &str,
        bucket: &str,
        window_ms: i64,
        max_attempts: u32,
    ) -> rusqlite::Result<RateLimitOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = now_ms();

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT count, window_start_ms FROM rate_limits WHERE identifier = ?1 AND bucket = ?2",
                params![identifier, bucket],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (count, window_start) = match existing {
            Some((count, window_start)) if window_start > now - window_ms => (count + 1, window_start),
            _ => (1, now),
        };

        tx.execute(
            "INSERT INTO rate_limits (identifier, bucket, count, window_start_ms, last_attempt_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identifier, bucket) DO UPDATE SET
                count = excluded.count,
                window_start_ms = excluded.window_start_ms,
                last_attempt_ms = excluded.last_attempt_ms",
            params![identifier, bucket, count, window_start, now],
        )?;
        tx.commit()?;

        let allowed = count <= max_attempts as i64;
        let remaining = (max_attempts as i64 - count).max(0) as u32;
        Ok(RateLimitOutcome {
            allowed,
            count: count as u32,
            remaining,
            reset_at_ms: window_start + window_ms,
        })
    }

    pub fn cleanup_rate_limits(&self, older_than_ms: i64) -> rusqlite::Result<usize> {
        let conn = self.conn.lock();
        let cutoff = now_ms() - older_than_ms;
        conn.execute("DELETE FROM rate_limits WHERE last_attempt_ms < ?1", params![cutoff])
    }

    // ------------------------------------------------------- peer policies

    pub fn get_peer_policy_row(&self, user_id: &str, pubkey: &str) -> rusqlite::Result<Option<PeerPolicyRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT pubkey, allow_send, allow_receive, source, last_updated
             FROM peer_policies WHERE user_id = ?1 AND pubkey = ?2",
            params![user_id, pubkey],
            |row| {
                let source: String = row.get(3)?;
                Ok(PeerPolicyRow {
                    pubkey: row.get(0)?,
                    allow_send: row.get::<_, Option<i64>>(1)?.map(|v| v != 0),
                    allow_receive: row.get::<_, Option<i64>>(2)?.map(|v| v != 0),
                    source: if source == "config" { PolicySource::Config } else { PolicySource::User },
                    last_updated: ts_to_datetime(row.get::<_, i64>(4)? / 1000),
                })
            },
        )
        .optional()
    }

    pub fn list_peer_policy_rows(&self, user_id: &str) -> rusqlite::Result<Vec<PeerPolicyRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT pubkey, allow_send, allow_receive, source, last_updated
             FROM peer_policies WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let source: String = row.get(3)?;
            Ok(PeerPolicyRow {
                pubkey: row.get(0)?,
                allow_send: row.get::<_, Option<i64>>(1)?.map(|v| v != 0),
                allow_receive: row.get::<_, Option<i64>>(2)?.map(|v| v != 0),
                source: if source == "config" { PolicySource::Config } else { PolicySource::User },
                last_updated: ts_to_datetime(row.get::<_, i64>(4)? / 1000),
            })
        })?;
        rows.collect()
    }

    /// Upserts explicit policy overrides; a field left `None` preserves the
    /// previously stored value (spec §4.2 `set_policy`).
    pub fn set_peer_policy(
        &self,
        user_id: &str,
        pubkey: &str,
        allow_send: Option<bool>,
        allow_receive: Option<bool>,
    ) -> rusqlite::Result<()> {
        let existing = self.get_peer_policy_row(user_id, pubkey)?;
        let merged_send = allow_send.or_else(|| existing.as_ref().and_then(|p| p.allow_send));
        let merged_receive = allow_receive.or_else(|| existing.as_ref().and_then(|p| p.allow_receive));

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peer_policies (user_id, pubkey, allow_send, allow_receive, source, last_updated)
             VALUES (?1, ?2, ?3, ?4, 'user', ?5)
             ON CONFLICT(user_id, pubkey) DO UPDATE SET
                allow_send = excluded.allow_send,
                allow_receive = excluded.allow_receive,
                source = 'user',
                last_updated = excluded.last_updated",
            params![
                user_id,
                pubkey,
                merged_send.map(|v| v as i64),
                merged_receive.map(|v| v as i64),
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn reset_peer_policy(&self, user_id: &str, pubkey: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM peer_policies WHERE user_id = ?1 AND pubkey = ?2",
            params![user_id, pubkey],
        )?;
        Ok(())
    }

    pub fn effective_policy(&self, user_id: &str, pubkey: &str, defaults: PolicyDefaults) -> rusqlite::Result<EffectivePolicy> {
        let row = self.get_peer_policy_row(user_id, pubkey)?;
        Ok(match row {
            Some(r) => EffectivePolicy {
                pubkey: pubkey.to_string(),
                allow_send: r.allow_send,
                allow_receive: r.allow_receive,
                effective_send: r.allow_send.unwrap_or(defaults.allow_send),
                effective_receive: r.allow_receive.unwrap_or(defaults.allow_receive),
                has_explicit_policy: r.allow_send.is_some() || r.allow_receive.is_some(),
                source: Some(r.source),
                last_updated: Some(r.last_updated),
            },
            None => EffectivePolicy {
                pubkey: pubkey.to_string(),
                allow_send: None,
                allow_receive: None,
                effective_send: defaults.allow_send,
                effective_receive: defaults.allow_receive,
                has_explicit_policy: false,
                source: None,
                last_updated: None,
            },
        })
    }

    // ------------------------------------------------------- nip46 sessions

    pub fn upsert_nip46_session(
        &self,
        user_id: &str,
        client_pubkey: &str,
        status: Nip46SessionStatus,
        profile: &Nip46Profile,
        relays: &[String],
        policy: &Nip46Policy,
    ) -> rusqlite::Result<()> {
        let now = now_ms();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nip46_sessions (user_id, client_pubkey, status, profile, relays, policy,
                created_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(user_id, client_pubkey) DO UPDATE SET
                status = excluded.status,
                profile = excluded.profile,
                relays = excluded.relays,
                policy = excluded.policy,
                last_active_at = excluded.last_active_at",
            params![
                user_id,
                client_pubkey,
                status.as_str(),
                serde_json::to_string(profile).unwrap_or_default(),
                serde_json::to_string(relays).unwrap_or_default(),
                serde_json::to_string(policy).unwrap_or_default(),
                now,
            ],
        )?;
        Ok(())
    }

    pub fn touch_nip46_session(&self, user_id: &str, client_pubkey: &str, status: Nip46SessionStatus) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE nip46_sessions SET status = ?1, last_active_at = ?2
             WHERE user_id = ?3 AND client_pubkey = ?4",
            params![status.as_str(), now_ms(), user_id, client_pubkey],
        )?;
        Ok(())
    }

    fn row_to_nip46_session(row: &rusqlite::Row) -> rusqlite::Result<Nip46Session> {
        let status: String = row.get("status")?;
        let profile_json: String = row.get("profile")?;
        let relays_json: String = row.get("relays")?;
        let policy_json: String = row.get("policy")?;
        Ok(Nip46Session {
            user_id: row.get("user_id")?,
            client_pubkey: row.get("client_pubkey")?,
            status: Nip46SessionStatus::parse(&status).unwrap_or(Nip46SessionStatus::Pending),
            profile: serde_json::from_str(&profile_json).unwrap_or_default(),
            relays: serde_json::from_str(&relays_json).unwrap_or_default(),
            policy: serde_json::from_str(&policy_json).unwrap_or_default(),
            created_at: ts_to_datetime(row.get::<_, i64>("created_at")? / 1000),
            last_active_at: ts_to_datetime(row.get::<_, i64>("last_active_at")? / 1000),
        })
    }

    pub fn get_nip46_session(&self, user_id: &str, client_pubkey: &str) -> rusqlite::Result<Option<Nip46Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM nip46_sessions WHERE user_id = ?1 AND client_pubkey = ?2",
            params![user_id, client_pubkey],
            Self::row_to_nip46_session,
        )
        .optional()
    }

    pub fn list_nip46_sessions(&self, user_id: &str) -> rusqlite::Result<Vec<Nip46Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM nip46_sessions WHERE user_id = ?1 ORDER BY last_active_at DESC")?;
        let rows = stmt.query_map(params![user_id], Self::row_to_nip46_session)?;
        rows.collect()
    }

    pub fn append_nip46_session_event(
        &self,
        user_id: &str,
        client_pubkey: &str,
        event_type: &str,
        payload: &Value,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nip46_session_events (id, user_id, client_pubkey, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![Uuid::new_v4().to_string(), user_id, client_pubkey, event_type, json_text(payload), now_ms()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------- nip46 requests

    /// Returns `Ok(false)` without inserting if a request with this id
    /// already exists, implementing the intake dedupe rule (spec §4.3).
    pub fn create_nip46_request_if_absent(
        &self,
        id: &str,
        user_id: &str,
        session_pubkey: &str,
        method: &str,
        payload: &Value,
    ) -> rusqlite::Result<bool> {
        let conn = self.conn.lock();
        let exists: Option<String> = conn
            .query_row("SELECT id FROM nip46_requests WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }
        let now = now_ms();
        conn.execute(
            "INSERT INTO nip46_requests (id, user_id, session_pubkey, method, payload, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
            params![id, user_id, session_pubkey, method, json_text(payload), now],
        )?;
        Ok(true)
    }

    fn row_to_nip46_request(row: &rusqlite::Row) -> rusqlite::Result<Nip46Request> {
        let status: String = row.get("status")?;
        let payload_json: String = row.get("payload")?;
        Ok(Nip46Request {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            session_pubkey: row.get("session_pubkey")?,
            method: row.get("method")?,
            payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
            status: Nip46RequestStatus::parse(&status).unwrap_or(Nip46RequestStatus::Pending),
            result: row.get("result")?,
            error: row.get("error")?,
            created_at: ts_to_datetime(row.get::<_, i64>("created_at")? / 1000),
            updated_at: ts_to_datetime(row.get::<_, i64>("updated_at")? / 1000),
        })
    }

    pub fn get_nip46_request(&self, id: &str) -> rusqlite::Result<Option<Nip46Request>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM nip46_requests WHERE id = ?1", params![id], Self::row_to_nip46_request)
            .optional()
    }

    pub fn list_nip46_requests(&self, user_id: &str) -> rusqlite::Result<Vec<Nip46Request>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM nip46_requests WHERE user_id = ?1 ORDER BY created_at DESC")?;
        let rows = stmt.query_map(params![user_id], Self::row_to_nip46_request)?;
        rows.collect()
    }

    pub fn set_nip46_request_status(
        &self,
        id: &str,
        status: Nip46RequestStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE nip46_requests SET status = ?1, result = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
            params![status.as_str(), result, error, now_ms(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        Database::open(dir.path().join("signer.sqlite")).unwrap()
    }

    #[test]
    fn create_and_fetch_user_round_trips() {
        let db = temp_db();
        let salt = [7u8; 16];
        let user = db.create_user("alice", "argon2-hash", &salt, Role::Admin).unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.encryption_salt, salt);

        let fetched = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(fetched.id, user.id);
        assert_eq!(fetched.role, Role::Admin);
    }

    #[test]
    fn rate_limit_is_monotonic_within_window() {
        let db = temp_db();
        let mut last_count = 0;
        for _ in 0..5 {
            let outcome = db.rate_limit_check("1.2.3.4", "auth", 60_000, 5).unwrap();
            assert!(outcome.count >= last_count);
            assert_eq!(outcome.remaining + outcome.count, 5);
            last_count = outcome.count;
        }
        let sixth = db.rate_limit_check("1.2.3.4", "auth", 60_000, 5).unwrap();
        assert!(!sixth.allowed);
    }

    #[test]
    fn session_sweep_evicts_only_expired() {
        let db = temp_db();
        let salt = [1u8; 16];
        let user = db.create_user("bob", "hash", &salt, Role::User).unwrap();
        let session_id = db.create_session(&user.id, "127.0.0.1").unwrap();

        let evicted = db.sweep_sessions(3600).unwrap();
        assert!(evicted.is_empty());
        assert!(db.get_session(&session_id).unwrap().is_some());

        let evicted = db.sweep_sessions(-1).unwrap();
        assert_eq!(evicted, vec![session_id.clone()]);
        assert!(db.get_session(&session_id).unwrap().is_none());
    }

    #[test]
    fn peer_policy_preserves_unset_fields_on_merge() {
        let db = temp_db();
        let salt = [2u8; 16];
        let user = db.create_user("carol", "hash", &salt, Role::User).unwrap();
        let peer = "ab".repeat(32);

        db.set_peer_policy(&user.id, &peer, Some(false), None).unwrap();
        db.set_peer_policy(&user.id, &peer, None, Some(true)).unwrap();

        let row = db.get_peer_policy_row(&user.id, &peer).unwrap().unwrap();
        assert_eq!(row.allow_send, Some(false));
        assert_eq!(row.allow_receive, Some(true));
    }

    #[test]
    fn nip46_request_dedupes_by_id() {
        let db = temp_db();
        let salt = [3u8; 16];
        let user = db.create_user("dora", "hash", &salt, Role::User).unwrap();
        let payload = serde_json::json!({"kind": 1});

        let first = db.create_nip46_request_if_absent("req-1", &user.id, "peer", "sign_event", &payload).unwrap();
        let second = db.create_nip46_request_if_absent("req-1", &user.id, "peer", "sign_event", &payload).unwrap();
        assert!(first);
        assert!(!second);
    }
}
