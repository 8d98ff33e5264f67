// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates accounts and rate limits and provides defaults for everything else
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vkbot_api::transport::{DEFAULT_API_URL, DEFAULT_API_VERSION};
use std::sync::Arc;
use vkbot_api::{
    ClientSettings, Credentials, MeterMode, NoTokenProvider, ProxySettings, StaticTokenProvider,
    TokenProvider, UserCredentials,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vk: VkConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub longpoll: LongPollConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VkConfig {
    #[serde(default = "default_app_id")]
    pub app_id: u64,
    #[serde(default = "default_scope")]
    pub scope: u64,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Assigned round-robin to accounts in order
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    /// Methods callable with a group token on top of the built-in list
    #[serde(default)]
    pub group_methods: Vec<String>,
    /// Community that owns uploaded documents when a group token does the upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            scope: default_scope(),
            api_version: default_api_version(),
            api_url: default_api_url(),
            accounts: Vec::new(),
            proxies: Vec::new(),
            group_methods: Vec::new(),
            group_id: None,
        }
    }
}

/// One VK identity: a group token, or a user access token obtained outside the bot.
///
/// `login` only labels a user account. `password` is accepted so a password-only
/// entry can be rejected with a useful message; the bot never performs a web login.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
}

// Custom Debug impl to redact password and token
impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("user_token", &self.user_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl AccountConfig {
    /// Human-readable label for logs; never includes secrets
    pub fn label(&self, index: usize) -> String {
        match (&self.login, &self.user_token) {
            (Some(login), _) => format!("user:{}", login),
            (None, Some(_)) => format!("user#{}", index),
            (None, None) => format!("group#{}", index),
        }
    }

    pub fn credentials(&self, app_id: u64, scope: u64) -> Result<Credentials> {
        match (&self.token, &self.user_token, &self.password) {
            (Some(token), None, None) if self.login.is_none() => Ok(Credentials::Group {
                token: token.clone(),
            }),
            (None, Some(_), None) => Ok(Credentials::User(UserCredentials {
                username: self.login.clone().unwrap_or_else(|| "user".to_string()),
                password: String::new(),
                app_id,
                scope,
            })),
            (None, None, Some(_)) => anyhow::bail!(
                "Account {} uses a password, but the bot cannot log in with one; \
                 obtain a user access token and set user_token (or VK_USER_TOKEN)",
                self.login.as_deref().unwrap_or("without login")
            ),
            _ => anyhow::bail!(
                "Each vk.accounts entry needs exactly one of token (group) or user_token (user)"
            ),
        }
    }

    /// Token source for this account's session
    pub fn token_provider(&self) -> Arc<dyn TokenProvider> {
        match &self.user_token {
            Some(token) => Arc::new(StaticTokenProvider::new(token.clone())),
            None => Arc::new(NoTokenProvider),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ProxyConfig {
    pub fn settings(&self) -> ProxySettings {
        ProxySettings {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    /// "requests" counts HTTP calls, "calls" counts sub-calls inside batches
    #[serde(default)]
    pub meter: MeterMode,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_per_window: default_max_per_window(),
            meter: MeterMode::default(),
        }
    }
}

impl RateConfig {
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            rate_window: Duration::from_millis(self.window_ms),
            rate_cap: self.max_per_window,
            meter: self.meter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Ceiling for synchronous calls through the pool
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// HTTP timeout for a single execute request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ApiConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollConfig {
    /// Seconds the server holds a poll open
    #[serde(default = "default_wait")]
    pub wait: u32,
    #[serde(default = "default_mode")]
    pub mode: u32,
    #[serde(default = "default_version")]
    pub version: u32,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            wait: default_wait(),
            mode: default_mode(),
            version: default_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    /// Also handle messages sent by the bot account itself
    #[serde(default)]
    pub read_out: bool,
    /// Minimum seconds between handled messages from one user; 0 disables
    #[serde(default)]
    pub flood_interval_secs: u64,
    #[serde(default)]
    pub admins: Vec<i64>,
    #[serde(default)]
    pub whitelist: Vec<i64>,
    #[serde(default)]
    pub blacklist: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist_message: Option<String>,
    #[serde(default)]
    pub log_messages: bool,
    /// Attach the triggering message to the last part of every answer
    #[serde(default)]
    pub forward_messages: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            read_out: false,
            flood_interval_secs: 0,
            admins: Vec::new(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            whitelist_message: None,
            blacklist_message: None,
            log_messages: false,
            forward_messages: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_path")]
    pub path: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
        }
    }
}

impl WorkspaceConfig {
    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.path).join("records.db")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus exporter, e.g. "127.0.0.1:9000"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

fn default_app_id() -> u64 {
    5982451
}

fn default_scope() -> u64 {
    140489887
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_window_ms() -> u64 {
    1000
}

fn default_max_per_window() -> u32 {
    3
}

fn default_call_timeout_secs() -> u64 {
    90
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_wait() -> u32 {
    25
}

fn default_mode() -> u32 {
    10
}

fn default_version() -> u32 {
    1
}

fn default_prefixes() -> Vec<String> {
    vec!["/".to_string(), "!".to_string()]
}

fn default_workspace_path() -> String {
    "./workspace".to_string()
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    } else if path == "~" {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs.home_dir().to_string_lossy().to_string();
        }
        tracing::warn!("Failed to expand tilde: could not determine home directory");
    }
    path.to_string()
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got: {}", name, val)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. VKBOT_CONFIG_PATH env var (if set)
    /// 2. ./config.toml
    /// 3. ~/.config/vkbot/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("VKBOT_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load from the first config file found, then apply env overrides and validate
    pub fn load() -> Result<Self> {
        Self::load_with(Self::find_config_file())
    }

    /// Load from an explicit file, then apply env overrides and validate
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Self::load_with(Some(path.to_path_buf()))
    }

    fn load_with(path: Option<PathBuf>) -> Result<Self> {
        let mut config = match path {
            Some(config_path) => {
                tracing::info!(path = %config_path.display(), "Loading configuration from file");
                let content = std::fs::read_to_string(&config_path)
                    .with_context(|| format!("Failed to read {}", config_path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Failed to parse {}", config_path.display()))?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };

        config.apply_env()?;
        config.workspace.path = expand_tilde(&config.workspace.path);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("VK_TOKEN") {
            if !token.trim().is_empty() {
                self.vk.accounts.push(AccountConfig {
                    token: Some(token),
                    ..Default::default()
                });
            }
        }
        if let Ok(user_token) = std::env::var("VK_USER_TOKEN") {
            if !user_token.trim().is_empty() {
                self.vk.accounts.push(AccountConfig {
                    login: std::env::var("VK_LOGIN").ok(),
                    user_token: Some(user_token),
                    ..Default::default()
                });
            }
        }
        if let Ok(val) = std::env::var("VK_API_VERSION") {
            self.vk.api_version = val;
        }
        if let Ok(val) = std::env::var("VKBOT_WORKSPACE") {
            self.workspace.path = val;
        }
        if let Some(val) = parse_env("VKBOT_RATE_WINDOW_MS")? {
            self.rate.window_ms = val;
        }
        if let Some(val) = parse_env("VKBOT_RATE_MAX")? {
            self.rate.max_per_window = val;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vk.accounts.is_empty() {
            anyhow::bail!(
                "At least one vk.accounts entry is required (or set VK_TOKEN / VK_USER_TOKEN)"
            );
        }
        for account in &self.vk.accounts {
            account.credentials(self.vk.app_id, self.vk.scope)?;
        }
        if self.rate.max_per_window == 0 {
            anyhow::bail!("rate.max_per_window must be greater than zero");
        }
        if self.rate.window_ms == 0 {
            anyhow::bail!("rate.window_ms must be greater than zero");
        }
        for proxy in &self.vk.proxies {
            if proxy.url.trim().is_empty() {
                anyhow::bail!("vk.proxies entries need a url");
            }
        }
        Ok(())
    }

    /// Proxy for the account at `index`, assigned round-robin
    pub fn proxy_for(&self, index: usize) -> Option<&ProxyConfig> {
        if self.vk.proxies.is_empty() {
            None
        } else {
            self.vk.proxies.get(index % self.vk.proxies.len())
        }
    }
}
