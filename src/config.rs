use crate::error::{ProxyError, Result};
use crate::providers::{Dialect, ProviderPreset};
use crate::transform::CacheControl;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "prompt-cache-proxy.toml";
const CONFIG_DIR_NAME: &str = "prompt-cache-proxy";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub params: ParamsConfig,
    /// Model ids advertised by `GET /v1/models`.
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialect: Option<Dialect>,
    /// Anthropic cache lifetime, `5m` or `1h`.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
    /// Extra headers sent with every upstream request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Bounds the wait for upstream response headers. Streaming bodies are
    /// not bounded once they start.
    #[serde(default = "default_first_byte_secs")]
    pub first_byte_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            first_byte_secs: default_first_byte_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamsConfig {
    /// Top-level request fields removed before forwarding.
    #[serde(default)]
    pub drop: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_api_key_env() -> String {
    "API_KEY".to_string()
}

fn default_cache_ttl() -> String {
    "1h".to_string()
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_connect_secs() -> u64 {
    60
}

fn default_first_byte_secs() -> u64 {
    240
}

/// Everything the upstream client needs, resolved once at startup.
///
/// Request handling only ever sees this struct; the environment is not read
/// after it is built.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub provider: String,
    pub dialect: Dialect,
    pub endpoint: String,
    pub api_key: String,
    pub cache_control: CacheControl,
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub pool_capacity: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Defaults for a named preset, used when no config file exists.
    pub fn from_preset(name: &str) -> Result<Self> {
        let preset = ProviderPreset::from_name(name)
            .ok_or_else(|| ProxyError::config(format!("Unknown provider '{name}'")))?;

        Ok(Self {
            host: default_host(),
            port: default_port(),
            provider: ProviderConfig {
                name: preset.name.to_string(),
                base_url: None,
                api_key_env: preset.default_api_key_env.to_string(),
                dialect: None,
                cache_ttl: default_cache_ttl(),
                headers: BTreeMap::new(),
            },
            pool: PoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            params: ParamsConfig::default(),
            models: Vec::new(),
        })
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir, then the CLI preset.
    pub fn find_and_load(explicit_path: Option<&Path>, preset: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        if let Some(name) = preset {
            tracing::info!(provider = name, "No config file found, using preset defaults");
            return Self::from_preset(name);
        }

        Err(ProxyError::config(format!(
            "No config file found. Searched: {}. Create one or pass --provider",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Resolve the effective base URL (config override or provider preset default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.provider.base_url {
            return Ok(url.clone());
        }

        let preset = ProviderPreset::from_name(&self.provider.name).ok_or_else(|| {
            ProxyError::config(format!(
                "Unknown provider '{}' and no base_url configured. \
                 Known providers: anthropic, openrouter, openai, deepseek",
                self.provider.name
            ))
        })?;

        Ok(preset.base_url.to_string())
    }

    /// The dialect spoken by the configured provider.
    pub fn dialect(&self) -> Result<Dialect> {
        if let Some(dialect) = self.provider.dialect {
            return Ok(dialect);
        }

        ProviderPreset::from_name(&self.provider.name)
            .map(|p| p.dialect)
            .ok_or_else(|| {
                ProxyError::config(format!(
                    "Provider '{}' is not a preset; set provider.dialect",
                    self.provider.name
                ))
            })
    }

    /// Resolve the API key from the configured environment variable
    pub fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.provider.api_key_env).map_err(|_| {
            ProxyError::config(format!(
                "Environment variable '{}' not set. Set it with your provider API key.",
                self.provider.api_key_env
            ))
        })
    }

    /// The cache marker for this provider. Only Anthropic understands `ttl`.
    #[must_use]
    pub fn cache_control(&self, dialect: Dialect) -> CacheControl {
        match dialect {
            Dialect::OpenAi => CacheControl::ephemeral(),
            Dialect::Anthropic => {
                let ttl = self.provider.cache_ttl.as_str();
                if matches!(ttl, "5m" | "1h") {
                    CacheControl::with_ttl(ttl)
                } else {
                    tracing::warn!(ttl, "Invalid cache_ttl, using default '1h'");
                    CacheControl::with_ttl(default_cache_ttl())
                }
            }
        }
    }

    /// Build the immutable upstream target, reading the API key from the environment.
    pub fn upstream_target(&self) -> Result<UpstreamTarget> {
        let api_key = self.resolve_api_key()?;
        self.upstream_target_with_key(api_key)
    }

    /// Build the upstream target with an explicit key.
    pub fn upstream_target_with_key(&self, api_key: impl Into<String>) -> Result<UpstreamTarget> {
        let dialect = self.dialect()?;
        let base_url = self.effective_base_url()?;

        if self.pool.max_connections == 0 {
            return Err(ProxyError::config("pool.max_connections must be at least 1"));
        }

        Ok(UpstreamTarget {
            provider: self.provider.name.clone(),
            dialect,
            endpoint: dialect.chat_endpoint(&base_url),
            api_key: api_key.into(),
            cache_control: self.cache_control(dialect),
            headers: self.provider.headers.clone(),
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
            first_byte_timeout: Duration::from_secs(self.timeouts.first_byte_secs),
            pool_capacity: self.pool.max_connections,
            acquire_timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
        })
    }
}

impl UpstreamTarget {
    /// Key suitable for logs: only the first and last few characters.
    #[must_use]
    pub fn masked_key(&self) -> String {
        let key = &self.api_key;
        let chars: Vec<char> = key.chars().collect();
        if chars.len() > 20 {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[chars.len() - 10..].iter().collect();
            format!("{head}...{tail}")
        } else {
            let head: String = chars.iter().take(5).collect();
            format!("{head}...")
        }
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from(CONFIG_FILE_NAME));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join(CONFIG_DIR_NAME).join("config.toml"));
    }
    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join(CONFIG_DIR_NAME).join("config.toml"));
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(format!(".{CONFIG_FILE_NAME}")));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
