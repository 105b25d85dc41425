//! Configuration types and loading.
//!
//! Config is loaded once from a JSON file (e.g. `~/.sightline/config.json`) and environment.
//! Unlike most settings files a missing file is fatal: the gateway cannot talk to Gemini without a key.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder written by `sightline init`; treated the same as a missing key.
pub const API_KEY_PLACEHOLDER: &str = "YOUR_GEMINI_API_KEY";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Remote model settings (API key, model name).
    #[serde(default)]
    pub gemini: GeminiConfig,

    /// Optional outbound proxy, applied process-wide before the model client is built.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// System instruction that seeds the conversation.
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Gateway bind and port.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Chat streaming limits.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Log broadcast queue settings.
    #[serde(default)]
    pub log_stream: LogStreamConfig,

    /// Screen capture command.
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiConfig {
    /// API key. Overridden by GEMINI_API_KEY env.
    pub api_key: Option<String>,

    /// Model id (default "gemini-2.5-pro").
    #[serde(default = "default_gemini_model")]
    pub model: String,

    /// API root (default Google's public endpoint). Tests point this at a local server.
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

/// Gateway bind and port settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 5001).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    /// Upper bound on one remote streaming call, in seconds (default 300).
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStreamConfig {
    /// Delay between drain attempts while the queue is empty (default 100ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// When set, the queue keeps at most this many entries and drops the oldest.
    /// When absent the queue grows without bound until a viewer drains it.
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Program and arguments that write a PNG of the screen to stdout. No shell is used.
    /// When absent a platform default is used (see `capture::default_capture_command`).
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Fatal startup conditions. The gateway never binds its port when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0} (run `sightline init` to create one)")]
    NotFound(PathBuf),
    #[error("reading config from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config from {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("gemini api key is not set; put it in gemini.apiKey or GEMINI_API_KEY")]
    MissingApiKey,
    #[error("chat.streamTimeoutSecs must be at least 1")]
    ZeroStreamTimeout,
}

fn default_gemini_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_system_prompt() -> String {
    "You are a veteran Civilization VI player.".to_string()
}

fn default_gateway_port() -> u16 {
    5001
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_stream_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            stream_timeout_secs: default_stream_timeout_secs(),
        }
    }
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            capacity: None,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Resolve the Gemini API key: env GEMINI_API_KEY overrides config. The placeholder counts as unset.
pub fn resolve_api_key(config: &Config) -> Option<String> {
    std::env::var("GEMINI_API_KEY")
        .ok()
        .and_then(|s| non_empty(&s))
        .or_else(|| config.gemini.api_key.as_deref().and_then(non_empty))
        .filter(|k| k != API_KEY_PLACEHOLDER)
}

/// Resolve the proxy URL, if any.
pub fn resolve_proxy(config: &Config) -> Option<String> {
    config.proxy.http_proxy.as_deref().and_then(non_empty)
}

/// Export the proxy to the process environment. Must run before any HTTP client is built:
/// reqwest reads these variables when a client is constructed.
pub fn apply_proxy(proxy: &str) {
    for var in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
        std::env::set_var(var, proxy);
    }
}

/// Validate everything that must hold before the gateway may bind. Returns the API key.
pub fn validate(config: &Config) -> Result<String, ConfigError> {
    if config.chat.stream_timeout_secs == 0 {
        return Err(ConfigError::ZeroStreamTimeout);
    }
    resolve_api_key(config).ok_or(ConfigError::MissingApiKey)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SIGHTLINE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".sightline").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). A missing file is an error.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf), ConfigError> {
    let path = path.unwrap_or_else(default_config_path);
    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }
    let s = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config = serde_json::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    log::debug!("loaded config from {}", path.display());
    Ok((config, path))
}

/// Template written by `sightline init`: defaults plus the key placeholder.
pub fn template_config() -> Config {
    let mut config = Config::default();
    config.gemini.api_key = Some(API_KEY_PLACEHOLDER.to_string());
    config
}

/// Write the template config if no file exists at `path`. Returns true when a file was written.
pub fn write_template(path: &Path) -> anyhow::Result<bool> {
    use anyhow::Context;

    if path.exists() {
        log::debug!("config already exists at {}, skipping", path.display());
        return Ok(false);
    }
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
    }
    let body = serde_json::to_string_pretty(&template_config())?;
    std::fs::write(path, body)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    log::info!("created default config at {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("sightline-config-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn defaults_match_local_gateway() {
        let c = Config::default();
        assert_eq!(c.gateway.port, 5001);
        assert_eq!(c.gateway.bind, "127.0.0.1");
        assert_eq!(c.gemini.model, "gemini-2.5-pro");
        assert_eq!(c.log_stream.poll_interval_ms, 100);
        assert!(c.log_stream.capacity.is_none());
        assert_eq!(c.chat.stream_timeout_secs, 300);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: Config = serde_json::from_str(
            r#"{"gemini":{"apiKey":"k"},"proxy":{"httpProxy":" http://127.0.0.1:7890 "}}"#,
        )
        .unwrap();
        assert_eq!(c.gemini.api_key.as_deref(), Some("k"));
        assert_eq!(c.gemini.model, "gemini-2.5-pro");
        assert_eq!(c.prompt.system_prompt, "You are a veteran Civilization VI player.");
        assert_eq!(resolve_proxy(&c).as_deref(), Some("http://127.0.0.1:7890"));
    }

    #[test]
    fn placeholder_key_is_rejected() {
        if std::env::var("GEMINI_API_KEY").is_ok() {
            return;
        }
        let c = template_config();
        assert!(matches!(validate(&c), Err(ConfigError::MissingApiKey)));

        let mut c = Config::default();
        c.gemini.api_key = Some("   ".to_string());
        assert!(matches!(validate(&c), Err(ConfigError::MissingApiKey)));

        c.gemini.api_key = Some("real-key".to_string());
        assert_eq!(validate(&c).unwrap(), "real-key");
    }

    #[test]
    fn zero_stream_timeout_is_rejected() {
        let mut c: Config =
            serde_json::from_str(r#"{"gemini":{"apiKey":"k"},"chat":{"streamTimeoutSecs":0}}"#)
                .unwrap();
        assert!(matches!(validate(&c), Err(ConfigError::ZeroStreamTimeout)));

        c.chat.stream_timeout_secs = 1;
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = temp_path("config.json");
        let err = load_config(Some(path.clone())).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(p) if p == path));
    }

    #[test]
    fn init_template_is_loadable() {
        let path = temp_path("config.json");
        assert!(write_template(&path).unwrap());
        assert!(!write_template(&path).unwrap());
        let (c, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(c.gemini.api_key.as_deref(), Some(API_KEY_PLACEHOLDER));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let path = temp_path("config.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_config(Some(path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
