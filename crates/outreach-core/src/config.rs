//! Outreach configuration system.
//!
//! Loaded from `~/.outreach/config.toml` (or an explicit path), then patched by
//! environment overrides such as `CRON_SECRET` and `REDIS_URL`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OutreachError, Result};
use crate::types::Channel;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutreachConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sequences: SequenceConfig,
    #[serde(default)]
    pub ab_testing: AbTestingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl OutreachConfig {
    /// Load from the default path, falling back to defaults, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load config from a specific path (no env overrides).
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OutreachError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| OutreachError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Outreach home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".outreach")
    }

    /// Patch values from the environment. `lookup` is normally `std::env::var`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CRON_SECRET") {
            self.cron.secret = Some(v);
        }
        if let Some(v) = get("REDIS_URL") {
            self.queue.redis_url = Some(v);
        }
        if let Some(v) = get("OUTREACH_DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = get("VAPI_API_KEY") {
            self.providers.vapi.get_or_insert_with(VapiConfig::default).api_key = v;
        }
        if let Some(v) = get("POSTMARK_SERVER_TOKEN") {
            self.providers
                .postmark
                .get_or_insert_with(PostmarkConfig::default)
                .server_token = v;
        }
        if let Some(v) = get("INSTANTLY_API_KEY") {
            self.providers
                .instantly
                .get_or_insert_with(InstantlyConfig::default)
                .api_key = v;
        }
        if let Some(v) = get("PWAFLOW_API_KEY") {
            self.providers
                .pwaflow
                .get_or_insert_with(PwaFlowConfig::default)
                .api_key = v;
        }
        if let Some(v) = get("SMS_AUTH_TOKEN") {
            self.providers.sms.get_or_insert_with(SmsConfig::default).auth_token = v;
        }
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

fn bool_true() -> bool { true }

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 3000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.outreach/outreach.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Periodic scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Shared secret for the trigger endpoint. `None` rejects every trigger.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_lock_max_hold_ms")]
    pub lock_max_hold_ms: u64,
    /// PENDING attempts older than this are re-dispatched by the queue drain.
    #[serde(default = "default_stale_pending_secs")]
    pub stale_pending_secs: u64,
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,
    #[serde(default = "default_relearn_interval_secs")]
    pub relearn_interval_secs: u64,
    /// Terminal attempts older than this many days are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_scoring_batch")]
    pub scoring_batch: usize,
}

fn default_lock_max_hold_ms() -> u64 { 300_000 }
fn default_stale_pending_secs() -> u64 { 600 }
fn default_drain_batch() -> usize { 50 }
fn default_relearn_interval_secs() -> u64 { 3600 }
fn default_retention_days() -> i64 { 90 }
fn default_scoring_batch() -> usize { 500 }

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            secret: None,
            lock_max_hold_ms: default_lock_max_hold_ms(),
            stale_pending_secs: default_stale_pending_secs(),
            drain_batch: default_drain_batch(),
            relearn_interval_secs: default_relearn_interval_secs(),
            retention_days: default_retention_days(),
            scoring_batch: default_scoring_batch(),
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue backend connection string. `None` means direct-send only.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Seconds an availability probe result is trusted.
    #[serde(default = "default_probe_ttl_secs")]
    pub probe_ttl_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
    #[serde(default)]
    pub limits: ChannelLimitsConfig,
}

fn default_probe_ttl_secs() -> u64 { 30 }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_ms() -> u64 { 2000 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            probe_ttl_secs: default_probe_ttl_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_ms(),
            limits: ChannelLimitsConfig::default(),
        }
    }
}

/// Concurrency and arrival-rate cap for one channel consumer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelLimit {
    pub concurrency: usize,
    pub per_second: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLimitsConfig {
    #[serde(default = "default_sms_limit")]
    pub sms: ChannelLimit,
    #[serde(default = "default_call_limit")]
    pub call: ChannelLimit,
    #[serde(default = "default_push_limit")]
    pub push: ChannelLimit,
    #[serde(default = "default_email_limit")]
    pub email: ChannelLimit,
}

fn default_sms_limit() -> ChannelLimit { ChannelLimit { concurrency: 1, per_second: 1 } }
fn default_call_limit() -> ChannelLimit { ChannelLimit { concurrency: 1, per_second: 1 } }
fn default_push_limit() -> ChannelLimit { ChannelLimit { concurrency: 5, per_second: 5 } }
fn default_email_limit() -> ChannelLimit { ChannelLimit { concurrency: 10, per_second: 10 } }

impl Default for ChannelLimitsConfig {
    fn default() -> Self {
        Self {
            sms: default_sms_limit(),
            call: default_call_limit(),
            push: default_push_limit(),
            email: default_email_limit(),
        }
    }
}

impl ChannelLimitsConfig {
    pub fn for_channel(&self, channel: Channel) -> ChannelLimit {
        match channel {
            Channel::Sms => self.sms,
            Channel::Call => self.call,
            Channel::Push => self.push,
            Channel::Email => self.email,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Max enrollments advanced per sweep.
    #[serde(default = "default_sequence_batch")]
    pub batch: usize,
}

fn default_sequence_batch() -> usize { 200 }

impl Default for SequenceConfig {
    fn default() -> Self {
        Self { batch: default_sequence_batch() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestingConfig {
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_min_sample() -> u64 { 50 }
fn default_confidence() -> f64 { 0.95 }

impl Default for AbTestingConfig {
    fn default() -> Self {
        Self {
            min_sample: default_min_sample(),
            confidence: default_confidence(),
        }
    }
}

/// Resolved provider credentials. A missing section disables the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub vapi: Option<VapiConfig>,
    #[serde(default)]
    pub sms: Option<SmsConfig>,
    #[serde(default)]
    pub postmark: Option<PostmarkConfig>,
    #[serde(default)]
    pub instantly: Option<InstantlyConfig>,
    #[serde(default)]
    pub pwaflow: Option<PwaFlowConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VapiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_vapi_url")]
    pub base_url: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub default_assistant_id: Option<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn default_vapi_url() -> String { "https://api.vapi.ai".into() }

impl Default for VapiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_vapi_url(),
            phone_number_id: String::new(),
            default_assistant_id: None,
            enabled: true,
        }
    }
}

/// Twilio-compatible SMS gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default = "default_sms_url")]
    pub base_url: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn default_sms_url() -> String { "https://api.twilio.com".into() }

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            base_url: default_sms_url(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostmarkConfig {
    #[serde(default)]
    pub server_token: String,
    #[serde(default)]
    pub from_email: String,
    #[serde(default = "default_message_stream")]
    pub message_stream: String,
    #[serde(default = "default_postmark_url")]
    pub base_url: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn default_message_stream() -> String { "outbound".into() }
fn default_postmark_url() -> String { "https://api.postmarkapp.com".into() }

impl Default for PostmarkConfig {
    fn default() -> Self {
        Self {
            server_token: String::new(),
            from_email: String::new(),
            message_stream: default_message_stream(),
            base_url: default_postmark_url(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantlyConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_instantly_url")]
    pub base_url: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn default_instantly_url() -> String { "https://api.instantly.ai".into() }

impl Default for InstantlyConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_instantly_url(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PwaFlowConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_pwaflow_url")]
    pub base_url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn default_pwaflow_url() -> String { "https://api.pwaflow.com".into() }

impl Default for PwaFlowConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_pwaflow_url(),
            app_id: String::new(),
            enabled: true,
        }
    }
}
