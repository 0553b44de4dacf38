use crate::crypto::{apikey, credential, password};
use crate::db::Database;
use crate::error::ApiError;
use crate::types::{ApiKey, Role, User};
use parking_lot::RwLock;
use std::collections::HashMap;

/// PBKDF2 iteration floor for the credential encryption key (spec §4.4).
const PBKDF2_ITERATIONS: u32 = 600_000;

/// A logged-in session's cached credential key, derived once at login from
/// the plaintext password and never persisted. `POST /api/user/credentials`
/// uses it to encrypt the incoming share/group credential; it is otherwise
/// dropped on logout or sweep, along with the session row itself.
struct CachedSession {
    user_id: String,
    credential_key: [u8; 32],
}

/// Authentication, session, and API-key management (spec §4.4). Holds no
/// database state of its own beyond a `Database` handle; the in-memory
/// `sessions` map exists only to carry the credential key a plain session
/// row can't hold.
pub struct AuthManager {
    db: Database,
    sessions: RwLock<HashMap<String, CachedSession>>,
}

impl AuthManager {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a user, auto-promoting the very first account in an empty
    /// database to `Role::Admin` regardless of what the caller requested
    /// (spec §4.4 bootstrap note).
    pub fn create_user(&self, username: &str, password: &str, role: Role) -> Result<User, ApiError> {
        if username.trim().is_empty() || password.len() < 8 {
            return Err(ApiError::InvalidInput(
                "username must be non-empty and password at least 8 characters".to_string(),
            ));
        }
        if self.db.get_user_by_username(username)?.is_some() {
            return Err(ApiError::InvalidInput("username already taken".to_string()));
        }

        let role = if self.db.count_users()? == 0 { Role::Admin } else { role };
        let hash = password::hash_password(password);
        let salt = credential::generate_encryption_salt();
        Ok(self.db.create_user(username, &hash, &salt, role)?)
    }

    /// Verifies credentials and opens a session, spending equal wall-clock
    /// time whether or not the account exists (spec §8 scenario S1): a
    /// missing user still runs a real Argon2id verification against a fixed
    /// dummy hash before returning.
    pub fn authenticate(&self, username: &str, password: &str, ip: &str) -> Result<(User, String), ApiError> {
        let Some(user) = self.db.get_user_by_username(username)? else {
            password::verify_dummy();
            return Err(ApiError::AuthFailure);
        };

        if !password::verify_password(password, &user.password_hash) {
            return Err(ApiError::AuthFailure);
        }

        let session_id = self.db.create_session(&user.id, ip)?;
        let credential_key = credential::derive_key(password, &user.encryption_salt, PBKDF2_ITERATIONS);
        self.sessions.write().insert(
            session_id.clone(),
            CachedSession {
                user_id: user.id.clone(),
                credential_key,
            },
        );
        Ok((user, session_id))
    }

    /// Resolves a session id to its owning user id and slides its TTL
    /// forward. Staleness past `session_timeout_secs` is enforced by the
    /// periodic sweep rather than checked per request (spec §4.4).
    pub fn verify_session(&self, session_id: &str) -> Result<String, ApiError> {
        let Some((user_id, _ip)) = self.db.get_session(session_id)? else {
            return Err(ApiError::AuthFailure);
        };
        self.db.touch_session(session_id)?;
        Ok(user_id)
    }

    /// The credential key cached at login for this session, if any. Absent
    /// for sessions resumed after a process restart, by design — PBKDF2
    /// credential handoff always requires the password at the HTTP boundary
    /// (spec §4.4 Open Question resolution).
    pub fn credential_key(&self, session_id: &str) -> Option<[u8; 32]> {
        self.sessions.read().get(session_id).map(|s| s.credential_key)
    }

    pub fn logout(&self, session_id: &str) -> Result<(), ApiError> {
        self.db.delete_session(session_id)?;
        self.sessions.write().remove(session_id);
        Ok(())
    }

    /// Evicts sessions idle past `ttl_secs` from both the database and the
    /// credential-key cache. Intended to run on a recurring interval from
    /// `main.rs` (spec §4.4).
    pub fn sweep_sessions(&self, ttl_secs: i64) -> Result<usize, ApiError> {
        let evicted = self.db.sweep_sessions(ttl_secs)?;
        if !evicted.is_empty() {
            let mut sessions = self.sessions.write();
            for id in &evicted {
                sessions.remove(id);
            }
        }
        Ok(evicted.len())
    }

    /// Encrypts `plaintext` with the session's cached credential key. Used
    /// by `POST /api/user/credentials` to seal the incoming share/group
    /// credential before it's written to storage.
    pub fn encrypt_credential(&self, session_id: &str, plaintext: &str) -> Result<String, ApiError> {
        let key = self.credential_key(session_id).ok_or(ApiError::AuthFailure)?;
        credential::encrypt(plaintext, &key).map_err(|_| ApiError::DecryptionFailed)
    }

    /// Decrypts a stored credential blob with the session's cached key,
    /// needed to hand plaintext share/group credentials to the signer
    /// supervisor on startup.
    pub fn decrypt_credential(&self, session_id: &str, blob: &str) -> Result<String, ApiError> {
        let key = self.credential_key(session_id).ok_or(ApiError::AuthFailure)?;
        credential::decrypt(blob, &key).map_err(|_| ApiError::DecryptionFailed)
    }

    pub fn create_api_key(
        &self,
        label: Option<&str>,
        created_by_user_id: Option<&str>,
        created_by_admin: bool,
    ) -> Result<(String, String, String), ApiError> {
        let (token, prefix) = apikey::generate_token();
        let hash = apikey::hash_token(&token);
        let id = self
            .db
            .create_api_key(&prefix, &hash, label, created_by_user_id, created_by_admin)?;
        Ok((token, prefix, id))
    }

    /// Verifies a presented API key token, rejecting revoked keys, and
    /// records the call's IP as `last_used_ip` (spec §4.4, §6).
    pub fn verify_api_key(&self, token: &str, ip: &str) -> Result<ApiKey, ApiError> {
        if token.len() < apikey::PREFIX_LEN {
            return Err(ApiError::AuthFailure);
        }
        let prefix = &token[..apikey::PREFIX_LEN];
        let Some(key) = self.db.get_api_key_by_prefix(prefix)? else {
            return Err(ApiError::AuthFailure);
        };
        if key.is_revoked() {
            return Err(ApiError::AuthFailure);
        }
        if !apikey::verify_token(token, &key.token_hash) {
            return Err(ApiError::AuthFailure);
        }
        self.db.mark_api_key_used(&key.id, ip)?;
        Ok(key)
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKey>, ApiError> {
        Ok(self.db.list_api_keys()?)
    }

    pub fn revoke_api_key(&self, id: &str, reason: Option<&str>) -> Result<(), ApiError> {
        Ok(self.db.revoke_api_key(id, reason)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("signer.sqlite")).unwrap();
        AuthManager::new(db)
    }

    #[test]
    fn first_user_is_auto_promoted_to_admin() {
        let mgr = manager();
        let user = mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        assert_eq!(user.role, Role::Admin);
    }

    #[test]
    fn second_user_keeps_requested_role() {
        let mgr = manager();
        mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let bob = mgr.create_user("bob", "hunter2hunter2", Role::User).unwrap();
        assert_eq!(bob.role, Role::User);
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let mgr = manager();
        mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let err = mgr.create_user("alice", "different1", Role::User).unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[test]
    fn authenticate_round_trips_and_caches_credential_key() {
        let mgr = manager();
        mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let (user, session_id) = mgr.authenticate("alice", "hunter2hunter2", "127.0.0.1").unwrap();
        assert_eq!(user.username, "alice");
        assert!(mgr.credential_key(&session_id).is_some());
        assert_eq!(mgr.verify_session(&session_id).unwrap(), user.id);
    }

    #[test]
    fn wrong_password_fails_without_creating_a_session() {
        let mgr = manager();
        mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let err = mgr.authenticate("alice", "wrong-password", "127.0.0.1").unwrap_err();
        assert!(matches!(err, ApiError::AuthFailure));
    }

    #[test]
    fn unknown_user_fails_same_as_wrong_password() {
        let mgr = manager();
        let err = mgr.authenticate("nobody", "whatever1", "127.0.0.1").unwrap_err();
        assert!(matches!(err, ApiError::AuthFailure));
    }

    #[test]
    fn logout_drops_both_session_row_and_cached_key() {
        let mgr = manager();
        mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let (_, session_id) = mgr.authenticate("alice", "hunter2hunter2", "127.0.0.1").unwrap();
        mgr.logout(&session_id).unwrap();
        assert!(mgr.verify_session(&session_id).is_err());
        assert!(mgr.credential_key(&session_id).is_none());
    }

    #[test]
    fn sweep_evicts_cached_key_alongside_session_row() {
        let mgr = manager();
        mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let (_, session_id) = mgr.authenticate("alice", "hunter2hunter2", "127.0.0.1").unwrap();
        let evicted = mgr.sweep_sessions(-1).unwrap();
        assert_eq!(evicted, 1);
        assert!(mgr.credential_key(&session_id).is_none());
    }

    #[test]
    fn encrypt_then_decrypt_credential_round_trips_within_a_session() {
        let mgr = manager();
        mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let (_, session_id) = mgr.authenticate("alice", "hunter2hunter2", "127.0.0.1").unwrap();
        let blob = mgr.encrypt_credential(&session_id, "bfshare1...").unwrap();
        assert_eq!(mgr.decrypt_credential(&session_id, &blob).unwrap(), "bfshare1...");
    }

    #[test]
    fn api_key_round_trip_and_revocation() {
        let mgr = manager();
        let user = mgr.create_user("alice", "hunter2hunter2", Role::User).unwrap();
        let (token, prefix, id) = mgr.create_api_key(Some("ci"), Some(&user.id), false).unwrap();
        let key = mgr.verify_api_key(&token, "127.0.0.1").unwrap();
        assert_eq!(key.prefix, prefix);

        mgr.revoke_api_key(&id, Some("rotated")).unwrap();
        let err = mgr.verify_api_key(&token, "127.0.0.1").unwrap_err();
        assert!(matches!(err, ApiError::AuthFailure));
    }

    #[test]
    fn short_or_garbled_token_fails_closed() {
        let mgr = manager();
        let err = mgr.verify_api_key("short", "127.0.0.1").unwrap_err();
        assert!(matches!(err, ApiError::AuthFailure));
    }
}
