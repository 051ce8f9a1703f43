use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::atomic::write_atomic;

// ── Top-level config ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory, computed from home, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path to config.toml, computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Default tracing filter; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub renewal: RenewalConfig,

    #[serde(default)]
    pub redemption: RedemptionConfig,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,
}

fn default_log_level() -> String {
    "info".into()
}

// ── Platform ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_auth_base")]
    pub auth_base: String,
    #[serde(default = "default_eventsub_ws_url")]
    pub eventsub_ws_url: String,
    /// Login of the bot account every worker chats as.
    #[serde(default)]
    pub bot_username: String,
    /// Login with operator rights across the fleet.
    #[serde(default)]
    pub bot_owner: String,
}

fn default_api_base() -> String {
    "https://api.twitch.tv/helix".into()
}

fn default_auth_base() -> String {
    "https://id.twitch.tv/oauth2".into()
}

fn default_eventsub_ws_url() -> String {
    "wss://eventsub.wss.twitch.tv/ws".into()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base: default_api_base(),
            auth_base: default_auth_base(),
            eventsub_ws_url: default_eventsub_ws_url(),
            bot_username: String::new(),
            bot_owner: String::new(),
        }
    }
}

// ── Reliability / supervision ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Per-request timeout for REST and token endpoints.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Delay before the single retry of a transient failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Initial backoff for daemon component restarts.
    #[serde(default = "default_component_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Max backoff for daemon component restarts.
    #[serde(default = "default_component_backoff_max_secs")]
    pub component_max_backoff_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_component_backoff_secs() -> u64 {
    2
}

fn default_component_backoff_max_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            component_initial_backoff_secs: default_component_backoff_secs(),
            component_max_backoff_secs: default_component_backoff_max_secs(),
        }
    }
}

impl ReliabilityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Credential renewal ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Minutes between channel credential sweeps.
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,
    /// Refresh when less than this many minutes remain.
    #[serde(default = "default_refresh_threshold_minutes")]
    pub refresh_threshold_minutes: u64,
    /// Minutes between bot credential checks.
    #[serde(default = "default_bot_check_interval_minutes")]
    pub bot_check_interval_minutes: u64,
    /// Bot credential enters the "days" tier below this many days.
    #[serde(default = "default_warn_days")]
    pub warn_days: u64,
    /// Bot credential enters the "hours" tier below this many hours.
    #[serde(default = "default_urgent_hours")]
    pub urgent_hours: u64,
    /// Link included in expiry alerts.
    #[serde(default = "default_remediation_url")]
    pub remediation_url: String,
    /// Upper bound on channels inspected by the fleet token report.
    #[serde(default = "default_status_sample_size")]
    pub status_sample_size: usize,
}

fn default_sweep_interval_minutes() -> u64 {
    30
}

fn default_refresh_threshold_minutes() -> u64 {
    60
}

fn default_bot_check_interval_minutes() -> u64 {
    360
}

fn default_warn_days() -> u64 {
    7
}

fn default_urgent_hours() -> u64 {
    24
}

fn default_remediation_url() -> String {
    "https://twitchtokengenerator.com".into()
}

fn default_status_sample_size() -> usize {
    5
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            sweep_interval_minutes: default_sweep_interval_minutes(),
            refresh_threshold_minutes: default_refresh_threshold_minutes(),
            bot_check_interval_minutes: default_bot_check_interval_minutes(),
            warn_days: default_warn_days(),
            urgent_hours: default_urgent_hours(),
            remediation_url: default_remediation_url(),
            status_sample_size: default_status_sample_size(),
        }
    }
}

impl RenewalConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes.max(1) * 60)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_minutes * 60)
    }

    pub fn bot_check_interval(&self) -> Duration {
        Duration::from_secs(self.bot_check_interval_minutes.max(1) * 60)
    }
}

// ── Redemptions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionConfig {
    /// Restrict redemptions to the broadcaster, bot owner and allow-list.
    #[serde(default)]
    pub test_mode: bool,
    /// Logins allowed to redeem while test mode is on.
    #[serde(default)]
    pub test_allow_list: Vec<String>,
    /// Timeout length for channels that do not configure one.
    #[serde(default = "default_redemption_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_redemption_timeout_secs() -> u64 {
    crate::store::channel::DEFAULT_REDEMPTION_TIMEOUT_SECS
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            test_allow_list: Vec::new(),
            default_timeout_secs: default_redemption_timeout_secs(),
        }
    }
}

// ── Worker fleet ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Capacity ceiling; enrollment is refused at this many workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_secs")]
    pub batch_delay_secs: u64,
    /// Worker script template. Relative paths resolve against the data dir.
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// File name of each worker's script inside its directory.
    #[serde(default = "default_script_name")]
    pub script_name: String,
    #[serde(default = "default_max_memory")]
    pub max_memory: String,
    #[serde(default = "default_supervisor_bin")]
    pub supervisor_bin: String,
    #[serde(default = "default_supervisor_timeout_secs")]
    pub supervisor_timeout_secs: u64,
    /// Settle time before checking a freshly restarted worker is still up.
    #[serde(default = "default_post_restart_check_ms")]
    pub post_restart_check_ms: u64,
}

fn default_max_workers() -> usize {
    100
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_delay_secs() -> u64 {
    10
}

fn default_template_path() -> PathBuf {
    PathBuf::from("templates/worker.js")
}

fn default_interpreter() -> String {
    "node".into()
}

fn default_script_name() -> String {
    "bot.js".into()
}

fn default_max_memory() -> String {
    "256M".into()
}

fn default_supervisor_bin() -> String {
    "pm2".into()
}

fn default_supervisor_timeout_secs() -> u64 {
    30
}

fn default_post_restart_check_ms() -> u64 {
    2000
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay_secs(),
            template_path: default_template_path(),
            interpreter: default_interpreter(),
            script_name: default_script_name(),
            max_memory: default_max_memory(),
            supervisor_bin: default_supervisor_bin(),
            supervisor_timeout_secs: default_supervisor_timeout_secs(),
            post_restart_check_ms: default_post_restart_check_ms(),
        }
    }
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Operator webhook (Discord-compatible `{"content": ...}` body).
    /// Alerts only go to the log when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_notify_timeout_secs() -> u64 {
    10
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let data_dir = home.join(".chatfleet");

        Self {
            config_path: data_dir.join("config.toml"),
            data_dir,
            log_level: default_log_level(),
            platform: PlatformConfig::default(),
            reliability: ReliabilityConfig::default(),
            renewal: RenewalConfig::default(),
            redemption: RedemptionConfig::default(),
            fleet: FleetConfig::default(),
            notifications: NotificationsConfig::default(),
        }
    }
}

impl Config {
    /// Load `~/.chatfleet/config.toml` (or `$CHATFLEET_HOME/config.toml`),
    /// writing defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        let data_dir = match std::env::var("CHATFLEET_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => UserDirs::new()
                .map(|u| u.home_dir().to_path_buf())
                .context("Could not find home directory")?
                .join(".chatfleet"),
        };
        Self::load_from(&data_dir)
    }

    /// Load the config rooted at `data_dir`, creating it with defaults if absent.
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");
        if !data_dir.exists() {
            fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.data_dir = data_dir.to_path_buf();
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path;
            config.data_dir = data_dir.to_path_buf();
            config.save()?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("CHATFLEET_CLIENT_ID") {
            if !id.is_empty() {
                self.platform.client_id = id;
            }
        }

        if let Ok(secret) = std::env::var("CHATFLEET_CLIENT_SECRET") {
            if !secret.is_empty() {
                self.platform.client_secret = secret;
            }
        }

        if let Ok(level) = std::env::var("CHATFLEET_LOG") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }

        if let Ok(url) = std::env::var("CHATFLEET_NOTIFY_URL") {
            if !url.is_empty() {
                self.notifications.webhook_url = Some(url);
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        write_atomic(&self.config_path, toml_str.as_bytes(), true)
            .context("Failed to write config file")
    }

    // ── Persisted state layout ───────────────────────────────────

    pub fn channels_dir(&self) -> PathBuf {
        self.data_dir.join("channels")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn conduit_path(&self) -> PathBuf {
        self.data_dir.join("conduit.json")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.data_dir.join("workers")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("ecosystem.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("daemon_state.json")
    }

    pub fn template_path(&self) -> PathBuf {
        if self.fleet.template_path.is_absolute() {
            self.fleet.template_path.clone()
        } else {
            self.data_dir.join(&self.fleet.template_path)
        }
    }
}
