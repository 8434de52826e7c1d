//! Configuration types, defaults, loading, and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream OpenAI-compatible backend (e.g. LM Studio).
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// HTTP server bind configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// SQLite persistence configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Token budget solver coefficients (C3).
    #[serde(default)]
    pub context: ContextConfig,

    /// Hierarchical memory tuning (C4–C8).
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Upstream OpenAI-compatible backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the single upstream backend, e.g. `http://localhost:1234`.
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    /// Optional API key; most local backends accept any non-empty value.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model id used for the gateway's own summarization calls (spec §4.5).
    /// A single local backend usually has exactly one model loaded, so this
    /// doubles as the default when a turn request omits `model`.
    #[serde(default = "default_upstream_model")]
    pub default_model: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            api_key: None,
            default_model: default_upstream_model(),
        }
    }
}

fn default_upstream_model() -> String {
    "local-model".to_string()
}

fn default_upstream_base_url() -> String {
    "http://localhost:1234".to_string()
}

/// HTTP server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. `127.0.0.1:8089`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8089".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    gateway_home().join("gateway.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file; stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Budget solver (C3) coefficients. Field names mirror the settings table in
/// the spec so the TOML file reads like the invariant list it implements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_ctx_model_info_ttl_sec")]
    pub ctx_model_info_ttl_sec: u64,
    #[serde(default = "default_ctx_default_context_length")]
    pub ctx_default_context_length: u32,
    #[serde(default = "default_ctx_safety_pct")]
    pub ctx_safety_pct: f64,
    #[serde(default = "default_ctx_rsys_pct")]
    pub ctx_rsys_pct: f64,
    #[serde(default = "default_ctx_rsys_min")]
    pub ctx_rsys_min: u32,
    #[serde(default = "default_ctx_rout_pct")]
    pub ctx_rout_pct: f64,
    #[serde(default = "default_ctx_rout_default")]
    pub ctx_rout_default: u32,
    #[serde(default = "default_ctx_core_sys_pad_tok")]
    pub ctx_core_sys_pad_tok: u32,
    #[serde(default = "default_r_out_min")]
    pub r_out_min: u32,
    #[serde(default = "default_r_out_floor")]
    pub r_out_floor: u32,
    #[serde(default = "default_safety_tok")]
    pub safety_tok: u32,
    #[serde(default = "default_token_count_mode")]
    pub token_count_mode: String,
    #[serde(default = "default_token_cache_ttl_sec")]
    pub token_cache_ttl_sec: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ctx_model_info_ttl_sec: default_ctx_model_info_ttl_sec(),
            ctx_default_context_length: default_ctx_default_context_length(),
            ctx_safety_pct: default_ctx_safety_pct(),
            ctx_rsys_pct: default_ctx_rsys_pct(),
            ctx_rsys_min: default_ctx_rsys_min(),
            ctx_rout_pct: default_ctx_rout_pct(),
            ctx_rout_default: default_ctx_rout_default(),
            ctx_core_sys_pad_tok: default_ctx_core_sys_pad_tok(),
            r_out_min: default_r_out_min(),
            r_out_floor: default_r_out_floor(),
            safety_tok: default_safety_tok(),
            token_count_mode: default_token_count_mode(),
            token_cache_ttl_sec: default_token_cache_ttl_sec(),
        }
    }
}

fn default_ctx_model_info_ttl_sec() -> u64 {
    300
}
fn default_ctx_default_context_length() -> u32 {
    4096
}
fn default_ctx_safety_pct() -> f64 {
    0.10
}
fn default_ctx_rsys_pct() -> f64 {
    0.05
}
fn default_ctx_rsys_min() -> u32 {
    256
}
fn default_ctx_rout_pct() -> f64 {
    0.25
}
fn default_ctx_rout_default() -> u32 {
    512
}
fn default_ctx_core_sys_pad_tok() -> u32 {
    100
}
fn default_r_out_min() -> u32 {
    256
}
fn default_r_out_floor() -> u32 {
    64
}
fn default_safety_tok() -> u32 {
    64
}
fn default_token_count_mode() -> String {
    "proxy".to_string()
}
fn default_token_cache_ttl_sec() -> u64 {
    300
}

/// Hierarchical memory (C4–C8) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_mem_l1_share")]
    pub mem_l1_share: f64,
    #[serde(default = "default_mem_l2_share")]
    pub mem_l2_share: f64,
    #[serde(default = "default_mem_l3_share")]
    pub mem_l3_share: f64,
    #[serde(default = "default_mem_tools_max_share")]
    pub mem_tools_max_share: f64,
    #[serde(default = "default_l1_min_pairs")]
    pub l1_min_pairs: usize,
    #[serde(default = "default_watermark")]
    pub l1_high: u8,
    #[serde(default = "default_watermark_low")]
    pub l1_low: u8,
    #[serde(default = "default_watermark")]
    pub l2_high: u8,
    #[serde(default = "default_watermark_low")]
    pub l2_low: u8,
    #[serde(default = "default_watermark")]
    pub l3_high: u8,
    #[serde(default = "default_watermark_low")]
    pub l3_low: u8,
    #[serde(default = "default_l2_group_size")]
    pub l2_group_size: usize,
    #[serde(default = "default_l3_group_size")]
    pub l3_group_size: usize,
    #[serde(default = "default_l2_group_max_tokens")]
    pub l2_group_max_tokens: u32,
    #[serde(default = "default_l3_group_max_tokens")]
    pub l3_group_max_tokens: u32,
    #[serde(default = "default_l3_min_nonempty_chars")]
    pub l3_min_nonempty_chars: usize,
    #[serde(default = "default_l3_retry_attempts")]
    pub l3_retry_attempts: u32,
    #[serde(default = "default_l3_style")]
    pub l3_style: String,
    #[serde(default = "default_cap_tok_user")]
    pub cap_tok_user: u32,
    #[serde(default = "default_cap_tok_assistant")]
    pub cap_tok_assistant: u32,
    #[serde(default = "default_mem_promotion_batch_size")]
    pub mem_promotion_batch_size: usize,
    #[serde(default = "default_compaction_iteration_cap")]
    pub compaction_iteration_cap: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mem_l1_share: default_mem_l1_share(),
            mem_l2_share: default_mem_l2_share(),
            mem_l3_share: default_mem_l3_share(),
            mem_tools_max_share: default_mem_tools_max_share(),
            l1_min_pairs: default_l1_min_pairs(),
            l1_high: default_watermark(),
            l1_low: default_watermark_low(),
            l2_high: default_watermark(),
            l2_low: default_watermark_low(),
            l3_high: default_watermark(),
            l3_low: default_watermark_low(),
            l2_group_size: default_l2_group_size(),
            l3_group_size: default_l3_group_size(),
            l2_group_max_tokens: default_l2_group_max_tokens(),
            l3_group_max_tokens: default_l3_group_max_tokens(),
            l3_min_nonempty_chars: default_l3_min_nonempty_chars(),
            l3_retry_attempts: default_l3_retry_attempts(),
            l3_style: default_l3_style(),
            cap_tok_user: default_cap_tok_user(),
            cap_tok_assistant: default_cap_tok_assistant(),
            mem_promotion_batch_size: default_mem_promotion_batch_size(),
            compaction_iteration_cap: default_compaction_iteration_cap(),
        }
    }
}

fn default_mem_l1_share() -> f64 {
    0.60
}
fn default_mem_l2_share() -> f64 {
    0.30
}
fn default_mem_l3_share() -> f64 {
    0.10
}
fn default_mem_tools_max_share() -> f64 {
    0.15
}
fn default_l1_min_pairs() -> usize {
    2
}
fn default_watermark() -> u8 {
    90
}
fn default_watermark_low() -> u8 {
    70
}
fn default_l2_group_size() -> usize {
    4
}
fn default_l3_group_size() -> usize {
    5
}
fn default_l2_group_max_tokens() -> u32 {
    300
}
fn default_l3_group_max_tokens() -> u32 {
    150
}
fn default_l3_min_nonempty_chars() -> usize {
    20
}
fn default_l3_retry_attempts() -> u32 {
    2
}
fn default_l3_style() -> String {
    "bullets".to_string()
}
fn default_cap_tok_user() -> u32 {
    120
}
fn default_cap_tok_assistant() -> u32 {
    80
}
fn default_mem_promotion_batch_size() -> usize {
    4
}
fn default_compaction_iteration_cap() -> u32 {
    20
}

/// Expand a leading `~` or `~/` to the actual home directory.
fn expand_tilde(p: &Path) -> PathBuf {
    if let Ok(rest) = p.strip_prefix("~") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        p.to_path_buf()
    }
}

/// Canonical base directory: `~/.local-responses/`.
pub fn gateway_home() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let p = home.join(".local-responses");
    if !p.exists() {
        let _ = std::fs::create_dir_all(&p);
    }
    p
}

/// Environment variable that overrides the config file path.
pub const CONFIG_PATH_ENV: &str = "RESPONSES_GATEWAY_CONFIG";

impl Config {
    /// Load configuration from the default or `RESPONSES_GATEWAY_CONFIG`-pointed
    /// file, layering environment variable overrides on top.
    ///
    /// Priority (lowest to highest):
    /// 1. Default values
    /// 2. `~/.local-responses/config.toml` (or `RESPONSES_GATEWAY_CONFIG`)
    /// 3. Environment variables
    pub fn load() -> Result<Self> {
        tracing::debug!("loading configuration");

        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(p) => PathBuf::from(p),
            Err(_) => gateway_home().join("config.toml"),
        };

        let mut config = if path.exists() {
            tracing::debug!(?path, "loading config file");
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        config = Self::apply_env_overrides(config);
        config.database.path = expand_tilde(&config.database.path);

        tracing::debug!("configuration loaded successfully");
        Ok(config)
    }

    /// Load configuration from a specific file, with no env overrides applied.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {:?}", path))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    fn apply_env_overrides(mut config: Self) -> Self {
        if let Ok(base_url) = std::env::var("RESPONSES_GATEWAY_UPSTREAM_URL") {
            config.upstream.base_url = base_url;
        }
        if let Ok(bind_addr) = std::env::var("RESPONSES_GATEWAY_BIND_ADDR") {
            config.server.bind_addr = bind_addr;
        }
        if let Ok(db_path) = std::env::var("RESPONSES_GATEWAY_DB_PATH") {
            config.database.path = PathBuf::from(db_path);
        }
        if let Ok(log_level) = std::env::var("RESPONSES_GATEWAY_LOG_LEVEL") {
            config.logging.level = log_level;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.context.ctx_default_context_length, 4096);
        assert_eq!(cfg.context.ctx_rsys_min, 256);
        assert_eq!(cfg.memory.l1_min_pairs, 2);
        assert_eq!(cfg.memory.l1_high, 90);
        assert_eq!(cfg.memory.l1_low, 70);
        assert_eq!(cfg.context.token_count_mode, "proxy");
    }

    #[test]
    fn env_override_wins_over_file_default() {
        // SAFETY: tests in this module run serially within a single process
        // and no other test reads this variable.
        unsafe {
            std::env::set_var("RESPONSES_GATEWAY_BIND_ADDR", "0.0.0.0:9999");
        }
        let cfg = Config::apply_env_overrides(Config::default());
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:9999");
        unsafe {
            std::env::remove_var("RESPONSES_GATEWAY_BIND_ADDR");
        }
    }
}
