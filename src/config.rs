use parking_lot::RwLock;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Runtime configuration, loaded once at startup from the environment keys
/// in spec §6. Every duration-ish key is clamped to its documented range so
/// a malformed `.env` degrades to a safe default instead of panicking deep
/// inside a background task.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,

    pub share_credential: Option<String>,
    pub group_credential: Option<String>,
    pub group_name: Option<String>,
    pub relays: Vec<String>,

    pub session_timeout_secs: i64,
    pub sign_timeout_ms: u64,

    pub rate_limit_enabled: bool,
    pub rate_limit_window_secs: i64,
    pub rate_limit_max: u32,

    pub node_restart_delay_ms: u64,
    pub node_max_retries: u32,
    pub node_backoff_multiplier: f64,
    pub node_max_retry_delay_ms: u64,
    pub initial_connectivity_delay_ms: u64,

    pub allowed_origins: Vec<String>,
    pub admin_secret: Option<String>,
}

fn clamp_i64(raw: Option<String>, default: i64, min: i64, max: i64) -> i64 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn clamp_u64(raw: Option<String>, default: u64, min: u64, max: u64) -> u64 {
    raw.and_then(|v| v.parse::<u64>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn clamp_u32(raw: Option<String>, default: u32, min: u32, max: u32) -> u32 {
    raw.and_then(|v| v.parse::<u32>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn parse_bool(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref() {
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => true,
        Some("0") | Some("false") | Some("FALSE") | Some("no") => false,
        _ => default,
    }
}

/// `RELAYS` accepts either a JSON array or a comma-separated list (spec §6).
fn parse_relays(raw: Option<String>) -> Vec<String> {
    let Some(raw) = raw else {
        return default_relays();
    };
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
            return list;
        }
    }
    trimmed
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Seed relay list for a brand-new user or a freshly onboarded NIP-46 agent
/// (spec §4.3 "Start loads relays from the store... or seeds with a default
/// relay list").
pub fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://relay.primal.net".to_string(),
        "wss://nos.lol".to_string(),
    ]
}

fn parse_csv(raw: Option<String>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = env::var("SIGNER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
                dir.push(".frostr-signer");
                dir
            });

        let db_path = env::var("SIGNER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = data_dir.clone();
                path.push("signer.sqlite");
                path
            });

        Self {
            bind_addr: env::var("SIGNER_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8002".to_string()),
            data_dir,
            db_path,

            share_credential: env::var("SHARE_CRED").ok(),
            group_credential: env::var("GROUP_CRED").ok(),
            group_name: env::var("GROUP_NAME").ok(),
            relays: parse_relays(env::var("RELAYS").ok()),

            session_timeout_secs: clamp_i64(env::var("SESSION_TIMEOUT").ok(), 3600, 60, 86_400),
            sign_timeout_ms: clamp_u64(
                env::var("FROSTR_SIGN_TIMEOUT").ok(),
                30_000,
                1_000,
                120_000,
            ),

            rate_limit_enabled: parse_bool(env::var("RATE_LIMIT_ENABLED").ok(), true),
            rate_limit_window_secs: clamp_i64(env::var("RATE_LIMIT_WINDOW").ok(), 60, 1, 3_600),
            rate_limit_max: clamp_u32(env::var("RATE_LIMIT_MAX").ok(), 5, 1, 10_000),

            node_restart_delay_ms: clamp_u64(
                env::var("NODE_RESTART_DELAY").ok(),
                1_000,
                0,
                60_000,
            ),
            node_max_retries: clamp_u32(env::var("NODE_MAX_RETRIES").ok(), 5, 0, 20),
            node_backoff_multiplier: env::var("NODE_BACKOFF_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v.clamp(1.0, 10.0))
                .unwrap_or(2.0),
            node_max_retry_delay_ms: clamp_u64(
                env::var("NODE_MAX_RETRY_DELAY").ok(),
                10_000,
                1_000,
                120_000,
            ),
            initial_connectivity_delay_ms: clamp_u64(
                env::var("INITIAL_CONNECTIVITY_DELAY").ok(),
                500,
                0,
                30_000,
            ),

            allowed_origins: parse_csv(env::var("ALLOWED_ORIGINS").ok()),
            admin_secret: env::var("ADMIN_SECRET").ok(),
        }
    }
}

/// The mutable subset of `Config` that `GET/POST/DELETE /api/env` can read
/// and patch at runtime (spec §6 "Environment / config keys recognized").
/// `sign_timeout_ms` is shared directly with `Nip46Service` so a patch takes
/// effect on the next dispatch; the relay/origin lists and rate-limit knobs
/// are consulted fresh on every request. The node restart/backoff tuning and
/// bind address are deliberately NOT here — those only take effect at
/// process start.
pub struct RuntimeConfig {
    pub relays: RwLock<Vec<String>>,
    pub session_timeout_secs: AtomicI64,
    pub sign_timeout_ms: Arc<AtomicU64>,
    pub allowed_origins: RwLock<Vec<String>>,
    pub rate_limit_enabled: AtomicBool,
    pub rate_limit_window_secs: AtomicI64,
    pub rate_limit_max: AtomicU32,
}

impl RuntimeConfig {
    pub fn from_config(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            relays: RwLock::new(config.relays.clone()),
            session_timeout_secs: AtomicI64::new(config.session_timeout_secs),
            sign_timeout_ms: Arc::new(AtomicU64::new(config.sign_timeout_ms)),
            allowed_origins: RwLock::new(config.allowed_origins.clone()),
            rate_limit_enabled: AtomicBool::new(config.rate_limit_enabled),
            rate_limit_window_secs: AtomicI64::new(config.rate_limit_window_secs),
            rate_limit_max: AtomicU32::new(config.rate_limit_max),
        })
    }

    pub fn snapshot(&self) -> crate::types::EnvResponse {
        crate::types::EnvResponse {
            relays: self.relays.read().clone(),
            session_timeout_secs: self.session_timeout_secs.load(Ordering::Relaxed),
            sign_timeout_ms: self.sign_timeout_ms.load(Ordering::Relaxed),
            allowed_origins: self.allowed_origins.read().clone(),
            rate_limit_enabled: self.rate_limit_enabled.load(Ordering::Relaxed),
            rate_limit_window_secs: self.rate_limit_window_secs.load(Ordering::Relaxed),
            rate_limit_max: self.rate_limit_max.load(Ordering::Relaxed),
        }
    }

    pub fn apply_patch(&self, patch: &crate::types::EnvPatchRequest) {
        if let Some(relays) = &patch.relays {
            *self.relays.write() = relays.clone();
        }
        if let Some(secs) = patch.session_timeout_secs {
            self.session_timeout_secs.store(secs.clamp(60, 86_400), Ordering::Relaxed);
        }
        if let Some(ms) = patch.sign_timeout_ms {
            self.sign_timeout_ms.store(ms.clamp(1_000, 120_000), Ordering::Relaxed);
        }
        if let Some(origins) = &patch.allowed_origins {
            *self.allowed_origins.write() = origins.clone();
        }
        if let Some(enabled) = patch.rate_limit_enabled {
            self.rate_limit_enabled.store(enabled, Ordering::Relaxed);
        }
        if let Some(secs) = patch.rate_limit_window_secs {
            self.rate_limit_window_secs.store(secs.clamp(1, 3_600), Ordering::Relaxed);
        }
        if let Some(max) = patch.rate_limit_max {
            self.rate_limit_max.store(max.clamp(1, 10_000), Ordering::Relaxed);
        }
    }

    /// Resets the named keys back to their process-start `Config` value
    /// (spec §6 `POST /api/env/delete`). Unknown keys are ignored.
    pub fn delete_keys(&self, keys: &[String], defaults: &Config) {
        for key in keys {
            match key.as_str() {
                "relays" => *self.relays.write() = defaults.relays.clone(),
                "session_timeout_secs" => {
                    self.session_timeout_secs.store(defaults.session_timeout_secs, Ordering::Relaxed)
                }
                "sign_timeout_ms" => self.sign_timeout_ms.store(defaults.sign_timeout_ms, Ordering::Relaxed),
                "allowed_origins" => *self.allowed_origins.write() = defaults.allowed_origins.clone(),
                "rate_limit_enabled" => self.rate_limit_enabled.store(defaults.rate_limit_enabled, Ordering::Relaxed),
                "rate_limit_window_secs" => {
                    self.rate_limit_window_secs.store(defaults.rate_limit_window_secs, Ordering::Relaxed)
                }
                "rate_limit_max" => self.rate_limit_max.store(defaults.rate_limit_max, Ordering::Relaxed),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relays_accepts_json_array() {
        let relays = parse_relays(Some(r#"["wss://a","wss://b"]"#.to_string()));
        assert_eq!(relays, vec!["wss://a".to_string(), "wss://b".to_string()]);
    }

    #[test]
    fn relays_accepts_comma_list() {
        let relays = parse_relays(Some(" wss://a , wss://b ".to_string()));
        assert_eq!(relays, vec!["wss://a".to_string(), "wss://b".to_string()]);
    }

    #[test]
    fn session_timeout_clamped_to_range() {
        assert_eq!(clamp_i64(Some("1".to_string()), 3600, 60, 86_400), 60);
        assert_eq!(
            clamp_i64(Some("999999".to_string()), 3600, 60, 86_400),
            86_400
        );
    }

    fn base_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: PathBuf::from("/tmp/frostr-test"),
            db_path: PathBuf::from("/tmp/frostr-test/signer.sqlite"),
            share_credential: None,
            group_credential: None,
            group_name: None,
            relays: default_relays(),
            session_timeout_secs: 3600,
            sign_timeout_ms: 30_000,
            rate_limit_enabled: true,
            rate_limit_window_secs: 60,
            rate_limit_max: 5,
            node_restart_delay_ms: 500,
            node_max_retries: 5,
            node_backoff_multiplier: 2.0,
            node_max_retry_delay_ms: 10_000,
            initial_connectivity_delay_ms: 500,
            allowed_origins: vec![],
            admin_secret: None,
        }
    }

    #[test]
    fn runtime_config_patch_overrides_only_given_fields() {
        let config = base_config();
        let runtime = RuntimeConfig::from_config(&config);
        runtime.apply_patch(&crate::types::EnvPatchRequest {
            relays: Some(vec!["wss://custom".to_string()]),
            session_timeout_secs: None,
            sign_timeout_ms: Some(5_000),
            allowed_origins: None,
            rate_limit_enabled: None,
            rate_limit_window_secs: None,
            rate_limit_max: None,
        });
        let snapshot = runtime.snapshot();
        assert_eq!(snapshot.relays, vec!["wss://custom".to_string()]);
        assert_eq!(snapshot.sign_timeout_ms, 5_000);
        assert_eq!(snapshot.session_timeout_secs, config.session_timeout_secs);
    }

    #[test]
    fn runtime_config_delete_resets_to_process_defaults() {
        let config = base_config();
        let runtime = RuntimeConfig::from_config(&config);
        runtime.apply_patch(&crate::types::EnvPatchRequest {
            relays: Some(vec!["wss://custom".to_string()]),
            session_timeout_secs: None,
            sign_timeout_ms: None,
            allowed_origins: None,
            rate_limit_enabled: None,
            rate_limit_window_secs: None,
            rate_limit_max: None,
        });
        runtime.delete_keys(&["relays".to_string()], &config);
        assert_eq!(runtime.snapshot().relays, config.relays);
    }
}
