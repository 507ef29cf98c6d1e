//! Engine configuration loaded from defaults, an optional TOML file and the environment.
//!
//! Precedence: env `LOOM__*` > file (`LOOM_CONFIG` path, default `config/loom`) > defaults.
//! Nested keys use `__` as separator, e.g. `LOOM__ENGINE__WORKERS=8`.

use crate::error::{LoomError, LoomResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const ENV_CONFIG_PATH: &str = "LOOM_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/loom";

/// Top-level configuration shared by the gateway and the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoomConfig {
    /// Bind host for the gateway.
    pub host: String,
    /// HTTP port for the gateway.
    pub port: u16,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Hosted database / realtime endpoint reached through REST RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcSettings {
    /// Base URL, e.g. `https://xyz.supabase.co`. RPC calls go to `{base_url}/rest/v1/rpc/{name}`.
    #[serde(default)]
    pub base_url: String,
    /// Service key sent as `apikey` and bearer token. Env fallback: `SUPABASE_SERVICE_ROLE_KEY`.
    #[serde(default)]
    pub service_key: Option<String>,
}

/// LLM backends.
///
/// | Key | Env fallback | Default |
/// |-----|--------------|---------|
/// | anthropic_api_key | ANTHROPIC_API_KEY | - |
/// | gemini_api_key | GEMINI_API_KEY | - |
/// | xai_api_key | XAI_API_KEY | - |
/// | default_model | - | gemini-2.5-flash |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,
    #[serde(default = "default_xai_base_url")]
    pub xai_base_url: String,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default)]
    pub xai_api_key: Option<String>,
    /// Model used when a project has no stored model setting.
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Knobs for retries, pooling, heartbeats and iteration budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on concurrently processed units per request.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Provider error bodies are cut to this many characters.
    #[serde(default = "default_error_body_limit")]
    pub error_body_limit: usize,
    /// Elements per concept-extraction call.
    #[serde(default = "default_extraction_batch_size")]
    pub extraction_batch_size: usize,
    /// When true, a model's `status: "completed"` is only honored once the applied
    /// edit count reaches the caller's expected count.
    #[serde(default)]
    pub verify_completion: bool,
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_xai_base_url() -> String {
    "https://api.x.ai".to_string()
}

fn default_model() -> String {
    crate::provider::DEFAULT_GEMINI_MODEL.to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_workers() -> usize {
    4
}

fn default_heartbeat_secs() -> u64 {
    3
}

fn default_max_iterations() -> u32 {
    100
}

fn default_error_body_limit() -> usize {
    300
}

fn default_extraction_batch_size() -> usize {
    25
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            anthropic_base_url: default_anthropic_base_url(),
            gemini_base_url: default_gemini_base_url(),
            xai_base_url: default_xai_base_url(),
            anthropic_api_key: None,
            gemini_api_key: None,
            xai_api_key: None,
            default_model: default_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            workers: default_workers(),
            heartbeat_secs: default_heartbeat_secs(),
            max_iterations: default_max_iterations(),
            error_body_limit: default_error_body_limit(),
            extraction_batch_size: default_extraction_batch_size(),
            verify_completion: false,
        }
    }
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            rpc: RpcSettings::default(),
            providers: ProviderSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl LoomConfig {
    /// Load config from file and environment. Precedence: env `LOOM__*` > `LOOM_CONFIG` file
    /// (default `config/loom.toml`, optional) > defaults. Unset provider keys fall back to the
    /// conventional unprefixed variables.
    pub fn load() -> LoomResult<Self> {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load_with(&path, None)?;
        config.apply_env_fallbacks();
        Ok(config)
    }

    /// Build from `path` plus an environment source. `env = None` reads the process
    /// environment; tests pass an explicit map.
    pub fn load_with(path: &str, env: Option<HashMap<String, String>>) -> LoomResult<Self> {
        let environment = config::Environment::with_prefix("LOOM")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let built = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8787_i64)?
            .add_source(config::File::with_name(path).required(false))
            .add_source(environment)
            .build()?;

        let config: LoomConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> LoomResult<()> {
        if self.engine.max_attempts == 0 {
            return Err(LoomError::Config("engine.max_attempts must be at least 1".into()));
        }
        if self.engine.workers == 0 {
            return Err(LoomError::Config("engine.workers must be at least 1".into()));
        }
        if self.engine.extraction_batch_size == 0 {
            return Err(LoomError::Config(
                "engine.extraction_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn apply_env_fallbacks(&mut self) {
        fill_from_env(&mut self.providers.anthropic_api_key, "ANTHROPIC_API_KEY");
        fill_from_env(&mut self.providers.gemini_api_key, "GEMINI_API_KEY");
        fill_from_env(&mut self.providers.xai_api_key, "XAI_API_KEY");
        fill_from_env(&mut self.rpc.service_key, "SUPABASE_SERVICE_ROLE_KEY");
        if self.rpc.base_url.trim().is_empty() {
            if let Ok(url) = std::env::var("SUPABASE_URL") {
                self.rpc.base_url = url.trim().to_string();
            }
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.engine.max_attempts,
            Duration::from_millis(self.engine.retry_base_delay_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.engine.heartbeat_secs.max(1))
    }
}

fn fill_from_env(slot: &mut Option<String>, name: &str) {
    let present = slot.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
    if present {
        return;
    }
    *slot = std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file_or_env() {
        let config = LoomConfig::load_with("does/not/exist", Some(HashMap::new())).unwrap();
        assert_eq!(config.port, 8787);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.engine.retry_base_delay_ms, 2000);
        assert_eq!(config.engine.heartbeat_secs, 3);
        assert_eq!(config.engine.max_iterations, 100);
        assert_eq!(config.engine.error_body_limit, 300);
        assert!(!config.engine.verify_completion);
        assert_eq!(config.providers.default_model, crate::provider::DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn file_then_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "port = 9100\n\n[engine]\nworkers = 2\nmax_iterations = 12\n\n[rpc]\nbase_url = \"http://db.local\""
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert("LOOM__ENGINE__WORKERS".to_string(), "6".to_string());

        let config = LoomConfig::load_with(path.to_str().unwrap(), Some(env)).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.engine.workers, 6);
        assert_eq!(config.engine.max_iterations, 12);
        assert_eq!(config.rpc.base_url, "http://db.local");
        assert_eq!(config.bind_addr(), "0.0.0.0:9100");
    }

    #[test]
    fn zero_workers_rejected() {
        let mut env = HashMap::new();
        env.insert("LOOM__ENGINE__WORKERS".to_string(), "0".to_string());
        let err = LoomConfig::load_with("does/not/exist", Some(env)).unwrap_err();
        assert!(matches!(err, LoomError::Config(_)));
    }

    #[test]
    fn retry_policy_from_engine_settings() {
        let config = LoomConfig::default();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(2000));
    }
}
