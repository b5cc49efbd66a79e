use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Namespace holding every archived transcript turn.
pub const ARCHIVE_NAMESPACE: &str = "transcript-archive";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub hooks: HookConfig,
    pub storage: StorageConfig,
    pub postgres: Option<PostgresConfig>,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub maintenance: MaintenanceConfig,
    pub autopilot: AutopilotConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HookConfig {
    pub log_level: String,
    pub stdin_timeout_ms: u64,
    pub max_messages: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// `auto` walks the fallback chain; any other value pins one tier.
    pub backend: String,
    pub append_log: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub max_input_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub restore_budget: usize,
    pub guidance_budget: usize,
    pub cross_session_hits: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub auto_optimize: bool,
    pub retention_days: u64,
    pub decay_per_hour: f64,
    pub max_decay_hours: f64,
    pub prune_confidence: f64,
    pub embed_batch: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AutopilotConfig {
    pub enabled: bool,
    pub context_window: u64,
    pub warn_pct: f64,
    pub prune_pct: f64,
    pub chars_per_token: f64,
    pub history_len: usize,
    pub critical_retention_days: u64,
}

fn default_pg_port() -> u16 {
    5432
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".into(),
            stdin_timeout_ms: 200,
            max_messages: 500,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".ctxvault".into(),
            backend: "auto".into(),
            append_log: false,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = dirs::home_dir()
            .map(|home| home.join(".ctxvault").join("models"))
            .unwrap_or_else(|| PathBuf::from(".ctxvault/models"))
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            max_input_chars: 512,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            restore_budget: 4000,
            guidance_budget: 2000,
            cross_session_hits: 3,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            auto_optimize: true,
            retention_days: 30,
            decay_per_hour: 0.005,
            max_decay_hours: 24.0,
            prune_confidence: 0.15,
            embed_batch: 20,
        }
    }
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_window: 200_000,
            warn_pct: 0.70,
            prune_pct: 0.85,
            chars_per_token: 3.5,
            history_len: 50,
            critical_retention_days: 7,
        }
    }
}

impl VaultConfig {
    /// Load `<data_dir>/config.toml` (if present) and apply environment overrides.
    ///
    /// The data directory itself may be moved with `CTXVAULT_DATA_DIR`, so it is
    /// resolved from the environment before the file is looked up.
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("CTXVAULT_DATA_DIR")
            .unwrap_or_else(|_| StorageConfig::default().data_dir);
        Self::load_from(expand_tilde(&data_dir).join("config.toml"))
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            debug!("no config file at {}, using defaults", path.display());
            VaultConfig::default()
        };

        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from an environment lookup (`std::env::var` in production).
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("CTXVAULT_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Some(val) = lookup("CTXVAULT_BACKEND") {
            self.storage.backend = val;
        }
        if let Some(val) = lookup("CTXVAULT_LOG_LEVEL") {
            self.hooks.log_level = val;
        }
        if let Some(val) = lookup("CTXVAULT_EMBEDDING") {
            self.embedding.provider = val;
        }
        override_parsed(&lookup, "CTXVAULT_APPEND_LOG", &mut self.storage.append_log);
        override_parsed(&lookup, "CTXVAULT_RESTORE_BUDGET", &mut self.retrieval.restore_budget);
        override_parsed(&lookup, "CTXVAULT_GUIDANCE_BUDGET", &mut self.retrieval.guidance_budget);
        override_parsed(&lookup, "CTXVAULT_RETENTION_DAYS", &mut self.maintenance.retention_days);
        override_parsed(&lookup, "CTXVAULT_AUTO_OPTIMIZE", &mut self.maintenance.auto_optimize);
        override_parsed(&lookup, "CTXVAULT_AUTOPILOT", &mut self.autopilot.enabled);
        override_parsed(&lookup, "CTXVAULT_CONTEXT_WINDOW", &mut self.autopilot.context_window);
        override_parsed(&lookup, "CTXVAULT_AUTOPILOT_WARN", &mut self.autopilot.warn_pct);
        override_parsed(&lookup, "CTXVAULT_AUTOPILOT_PRUNE", &mut self.autopilot.prune_pct);

        if let Some(pg) = postgres_from_env(&lookup) {
            self.postgres = Some(pg);
        }
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.resolved_data_dir().join("transcript-archive.db")
    }

    pub fn json_path(&self) -> PathBuf {
        self.resolved_data_dir().join("transcript-archive.json")
    }

    pub fn append_log_path(&self) -> PathBuf {
        self.resolved_data_dir().join("transcript-archive.log")
    }

    pub fn autopilot_state_path(&self) -> PathBuf {
        self.resolved_data_dir().join("autopilot-state.json")
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(val) => *slot = val,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable environment override"),
        }
    }
}

/// Postgres parameters from `CTXVAULT_PG_*`, falling back to the libpq `PG*` names.
/// Returns `None` unless host, database and user are all present.
fn postgres_from_env<F>(lookup: &F) -> Option<PostgresConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |ours: &str, libpq: &str| lookup(ours).or_else(|| lookup(libpq));

    let host = get("CTXVAULT_PG_HOST", "PGHOST")?;
    let database = get("CTXVAULT_PG_DATABASE", "PGDATABASE")?;
    let user = get("CTXVAULT_PG_USER", "PGUSER")?;
    let port = get("CTXVAULT_PG_PORT", "PGPORT")
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(default_pg_port);

    Some(PostgresConfig {
        host,
        port,
        database,
        user,
        password: get("CTXVAULT_PG_PASSWORD", "PGPASSWORD").unwrap_or_default(),
        ssl: lookup("CTXVAULT_PG_SSL").is_some_and(|v| v == "true"),
    })
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = VaultConfig::default();
        assert_eq!(config.storage.backend, "auto");
        assert_eq!(config.retrieval.restore_budget, 4000);
        assert_eq!(config.maintenance.retention_days, 30);
        assert!(config.maintenance.auto_optimize);
        assert!(config.autopilot.enabled);
        assert_eq!(config.autopilot.context_window, 200_000);
        assert!(config.postgres.is_none());
        assert!(config.sqlite_path().ends_with("transcript-archive.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[storage]
data_dir = "/tmp/vault"
backend = "json"

[retrieval]
restore_budget = 900

[postgres]
host = "db.internal"
database = "archive"
user = "hooks"
"#;
        let config: VaultConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.backend, "json");
        assert_eq!(config.retrieval.restore_budget, 900);
        assert_eq!(config.json_path(), PathBuf::from("/tmp/vault/transcript-archive.json"));
        let pg = config.postgres.unwrap();
        assert_eq!(pg.port, 5432);
        assert_eq!(pg.password, "");
        // defaults still apply for unset fields
        assert_eq!(config.retrieval.guidance_budget, 2000);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = VaultConfig::default();
        config.apply_env_overrides_from(env(&[
            ("CTXVAULT_DATA_DIR", "/tmp/override"),
            ("CTXVAULT_RESTORE_BUDGET", "500"),
            ("CTXVAULT_AUTO_OPTIMIZE", "false"),
            ("CTXVAULT_AUTOPILOT_WARN", "0.5"),
        ]));

        assert_eq!(config.storage.data_dir, "/tmp/override");
        assert_eq!(config.retrieval.restore_budget, 500);
        assert!(!config.maintenance.auto_optimize);
        assert!((config.autopilot.warn_pct - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unparsable_override_keeps_default() {
        let mut config = VaultConfig::default();
        config.apply_env_overrides_from(env(&[("CTXVAULT_RETENTION_DAYS", "a month")]));
        assert_eq!(config.maintenance.retention_days, 30);
    }

    #[test]
    fn postgres_requires_host_database_and_user() {
        let mut config = VaultConfig::default();
        config.apply_env_overrides_from(env(&[("PGHOST", "localhost"), ("PGUSER", "me")]));
        assert!(config.postgres.is_none());

        config.apply_env_overrides_from(env(&[
            ("PGHOST", "localhost"),
            ("PGUSER", "me"),
            ("CTXVAULT_PG_DATABASE", "vault"),
            ("PGPORT", "6543"),
        ]));
        let pg = config.postgres.unwrap();
        assert_eq!(pg.host, "localhost");
        assert_eq!(pg.database, "vault");
        assert_eq!(pg.port, 6543);
        assert!(!pg.ssl);
    }
}
