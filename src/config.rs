use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port to bind the HTTP server on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted ingest body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Commands accepted per caller per rate-limit window
    #[serde(default = "default_command_rate_limit")]
    pub command_rate_limit: u32,
    /// Rate-limit window in seconds
    #[serde(default = "default_command_rate_window_secs")]
    pub command_rate_window_secs: u64,
}

fn default_port() -> u16 {
    8787
}

fn default_max_body_bytes() -> usize {
    32 * 1024
}

fn default_command_rate_limit() -> u32 {
    20
}

fn default_command_rate_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Shared bearer secret required on /ingest (no auth when unset)
    #[serde(default)]
    pub ingest_secret: Option<String>,
    /// HMAC key for stream-token signing; required to serve
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Stream-token lifetime in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    10 * 60
}

/// Windows driving the ingest → snapshot → broadcast pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Agent records older than this are presented as idle
    #[serde(default = "default_agent_stale_ms")]
    pub agent_stale_ms: u64,
    /// Focus pointer self-clears after this window (shorter than the agent one)
    #[serde(default = "default_focus_stale_ms")]
    pub focus_stale_ms: u64,
    /// Coordinator badges age out after this window
    #[serde(default = "default_badge_ttl_ms")]
    pub badge_ttl_ms: u64,
    /// Maximum badges carried in a snapshot
    #[serde(default = "default_max_badges")]
    pub max_badges: usize,
    /// Event bursts within this window collapse into one snapshot push
    #[serde(default = "default_snapshot_debounce_ms")]
    pub snapshot_debounce_ms: u64,
    /// Self-healing full-snapshot broadcast cadence
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// SSE keep-alive comment cadence
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
}

fn default_agent_stale_ms() -> u64 {
    45_000
}

fn default_focus_stale_ms() -> u64 {
    15_000
}

fn default_badge_ttl_ms() -> u64 {
    60_000
}

fn default_max_badges() -> usize {
    3
}

fn default_snapshot_debounce_ms() -> u64 {
    120
}

fn default_snapshot_interval_ms() -> u64 {
    10_000
}

fn default_keepalive_ms() -> u64 {
    15_000
}

impl SyncConfig {
    pub fn agent_stale(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.agent_stale_ms as i64)
    }

    pub fn focus_stale(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.focus_stale_ms as i64)
    }

    pub fn badge_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.badge_ttl_ms as i64)
    }
}

/// Client sync controller tuning (backoff, polling, display hysteresis).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server base URL for the watch mode
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Polling fallback cadence while the push stream is down
    #[serde(default = "default_poll_base_ms")]
    pub poll_base_ms: u64,
    /// Refresh the stream token this long before it expires
    #[serde(default = "default_token_refresh_lead_secs")]
    pub token_refresh_lead_secs: u64,
    #[serde(default = "default_show_delay_ms")]
    pub show_delay_ms: u64,
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
    #[serde(default = "default_min_display_ms")]
    pub min_display_ms: u64,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_backoff_base_ms() -> u64 {
    600
}

fn default_backoff_factor() -> f64 {
    1.7
}

fn default_backoff_cap_ms() -> u64 {
    15_000
}

fn default_poll_base_ms() -> u64 {
    2_000
}

fn default_token_refresh_lead_secs() -> u64 {
    60
}

fn default_show_delay_ms() -> u64 {
    240
}

fn default_idle_delay_ms() -> u64 {
    900
}

fn default_min_display_ms() -> u64 {
    1_100
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_ms: default_backoff_cap_ms(),
            poll_base_ms: default_poll_base_ms(),
            token_refresh_lead_secs: default_token_refresh_lead_secs(),
            show_delay_ms: default_show_delay_ms(),
            idle_delay_ms: default_idle_delay_ms(),
            min_display_ms: default_min_display_ms(),
        }
    }
}

impl ClientConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("server.port", default_port() as i64)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PULSE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PULSE_AUTH__SIGNING_SECRET, etc.)
            .add_source(
                Environment::with_prefix("PULSE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.auth.signing_secret.as_deref().unwrap_or("").is_empty() {
            errors.push("auth.signing_secret must be set to serve stream tokens".to_string());
        }

        if self.auth.token_ttl_secs == 0 {
            errors.push("auth.token_ttl_secs must be positive".to_string());
        }

        if self.sync.focus_stale_ms >= self.sync.agent_stale_ms {
            errors.push("sync.focus_stale_ms should be shorter than sync.agent_stale_ms".to_string());
        }

        if self.sync.snapshot_debounce_ms >= self.sync.snapshot_interval_ms {
            errors.push(
                "sync.snapshot_debounce_ms should be well below sync.snapshot_interval_ms"
                    .to_string(),
            );
        }

        if self.client.backoff_factor < 1.0 {
            errors.push("client.backoff_factor must be >= 1.0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: default_port(),
                max_body_bytes: default_max_body_bytes(),
                command_rate_limit: default_command_rate_limit(),
                command_rate_window_secs: default_command_rate_window_secs(),
            },
            auth: AuthConfig {
                ingest_secret: None,
                signing_secret: None,
                token_ttl_secs: default_token_ttl_secs(),
            },
            sync: SyncConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            agent_stale_ms: default_agent_stale_ms(),
            focus_stale_ms: default_focus_stale_ms(),
            badge_ttl_ms: default_badge_ttl_ms(),
            max_badges: default_max_badges(),
            snapshot_debounce_ms: default_snapshot_debounce_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            keepalive_ms: default_keepalive_ms(),
        }
    }
}
