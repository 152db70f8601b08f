// Configuration File Support
//
// This module provides configuration file parsing for the opsgate gateway.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from the XDG config directory:
// ~/.config/opsgate/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::PrivilegeTier;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP listener configuration
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// API key material and tiers
    pub auth: AuthConfig,

    /// Rate limiting thresholds
    pub rate_limit: RateLimitSettings,

    /// Process sandbox limits
    pub sandbox: SandboxConfig,

    /// Policy file location
    pub policy: PolicyFileConfig,

    /// Audit log configuration
    pub audit: AuditConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Posture toggle command table
    pub posture: PostureConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the gateway API (execute/posture/health/capabilities)
    pub listen: String,

    /// Origins allowed to call the API from a browser. Empty means no
    /// CORS headers are emitted at all.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8443".to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// A single configured API key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyEntry {
    /// The secret key material
    pub key: String,

    /// Identity this key authenticates as
    pub identity: String,

    /// Privilege tier granted to this identity
    pub tier: PrivilegeTier,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Configured API keys
    pub keys: Vec<ApiKeyEntry>,
}

/// Token bucket sizing for one scope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BucketSettings {
    /// Burst capacity (maximum tokens)
    pub burst: u32,

    /// Sustained rate (tokens refilled per minute)
    pub per_minute: u32,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            burst: 30,
            per_minute: 60,
        }
    }
}

/// Rate limiting thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Whether rate limiting is enforced
    pub enabled: bool,

    /// Idle TTL after which per-identity buckets are reclaimed (seconds)
    pub idle_ttl_secs: u64,

    /// Global ceiling shared by all identities
    pub global: BucketSettings,

    /// Per-identity budget for read-only keys
    pub read_only: BucketSettings,

    /// Per-identity budget for operator keys
    pub operator: BucketSettings,

    /// Per-identity budget for admin keys
    pub admin: BucketSettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_ttl_secs: 300,
            global: BucketSettings {
                burst: 200,
                per_minute: 600,
            },
            read_only: BucketSettings {
                burst: 10,
                per_minute: 30,
            },
            operator: BucketSettings {
                burst: 30,
                per_minute: 60,
            },
            admin: BucketSettings {
                burst: 60,
                per_minute: 120,
            },
        }
    }
}

impl RateLimitSettings {
    /// Budget for a privilege tier
    pub fn for_tier(&self, tier: PrivilegeTier) -> BucketSettings {
        match tier {
            PrivilegeTier::ReadOnly => self.read_only,
            PrivilegeTier::Operator => self.operator,
            PrivilegeTier::Admin => self.admin,
        }
    }
}

/// Process sandbox limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Output cap per stream in bytes
    pub max_output_bytes: usize,

    /// Ceiling on concurrently live child processes
    pub max_concurrent: usize,

    /// Default timeout when neither caller nor rule supplies one (seconds)
    pub default_timeout_secs: u64,

    /// Scratch directory children run in
    pub scratch_dir: String,

    /// Environment variables passed through to children. Everything else
    /// is stripped so host secrets never reach a child process.
    pub env_allowlist: Vec<String>,

    /// Whether rules marked `privileged` may run at all
    pub allow_privileged: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            max_concurrent: 16,
            default_timeout_secs: 30,
            scratch_dir: "/tmp/opsgate".to_string(),
            env_allowlist: vec![
                "PATH".to_string(),
                "HOME".to_string(),
                "LANG".to_string(),
            ],
            allow_privileged: false,
        }
    }
}

/// Policy file location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyFileConfig {
    /// Path to the TOML policy file
    pub path: String,
}

impl Default for PolicyFileConfig {
    fn default() -> Self {
        Self {
            path: "policy.toml".to_string(),
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Path to the append-only JSON-lines audit log
    pub path: String,

    /// Bounded queue depth between the request path and the writer task
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: "opsgate-audit.log".to_string(),
            queue_capacity: 1024,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to expose the metrics listener
    pub enabled: bool,

    /// Address for the internal-only metrics endpoint
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

/// One posture dimension's command table
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostureDimensionConfig {
    /// Declared stub: transitions flip state without spawning anything,
    /// and the state reports `simulated` instead of `on`.
    pub simulated: bool,

    /// Argument vector run to enable the dimension
    pub enable: Vec<String>,

    /// Argument vector run to disable the dimension
    pub disable: Vec<String>,

    /// Dimensions that may not transition concurrently with this one
    pub conflicts_with: Vec<String>,

    /// Timeout for the underlying command (seconds)
    pub timeout_secs: u64,
}

/// Posture toggle command table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostureConfig {
    /// Per-dimension configuration, keyed by dimension name
    /// (firewall, proxy, vpn, tor)
    pub dimensions: HashMap<String, PostureDimensionConfig>,
}

impl Default for PostureConfig {
    fn default() -> Self {
        // Safe default: every dimension is an explicit stub until the
        // operator wires real commands in.
        let mut dimensions = HashMap::new();
        for name in ["firewall", "proxy", "vpn", "tor"] {
            dimensions.insert(
                name.to_string(),
                PostureDimensionConfig {
                    simulated: true,
                    timeout_secs: 30,
                    ..Default::default()
                },
            );
        }
        Self { dimensions }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitSettings::default(),
            sandbox: SandboxConfig::default(),
            policy: PolicyFileConfig::default(),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
            posture: PostureConfig::default(),
        }
    }
}

const KNOWN_DIMENSIONS: [&str; 4] = ["firewall", "proxy", "vpn", "tor"];

impl Config {
    /// Load configuration from the default XDG config directory.
    ///
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/opsgate/config.toml` on Linux/Mac
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("io", "opsgate", "opsgate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("opsgate")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - OPSGATE_LISTEN_ADDR
    /// - OPSGATE_LOG_LEVEL
    /// - OPSGATE_LOG_FORMAT
    /// - OPSGATE_POLICY_PATH
    /// - OPSGATE_AUDIT_PATH
    /// - OPSGATE_MAX_CONCURRENT
    /// - OPSGATE_METRICS_LISTEN
    /// - OPSGATE_API_KEY (registers an additional admin key, identity "env")
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("OPSGATE_LISTEN_ADDR") {
            self.server.listen = addr;
        }
        if let Ok(level) = std::env::var("OPSGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("OPSGATE_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(path) = std::env::var("OPSGATE_POLICY_PATH") {
            self.policy.path = path;
        }
        if let Ok(path) = std::env::var("OPSGATE_AUDIT_PATH") {
            self.audit.path = path;
        }
        if let Ok(max) = std::env::var("OPSGATE_MAX_CONCURRENT") {
            if let Ok(max) = max.parse::<usize>() {
                if max > 0 && max <= 1024 {
                    self.sandbox.max_concurrent = max;
                }
            }
        }
        if let Ok(addr) = std::env::var("OPSGATE_METRICS_LISTEN") {
            self.metrics.listen = addr;
        }
        if let Ok(key) = std::env::var("OPSGATE_API_KEY") {
            if !key.is_empty() {
                self.auth.keys.push(ApiKeyEntry {
                    key,
                    identity: "env".to_string(),
                    tier: PrivilegeTier::Admin,
                });
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.sandbox.max_output_bytes == 0 {
            anyhow::bail!("Sandbox output cap must be > 0");
        }
        if self.sandbox.max_concurrent == 0 || self.sandbox.max_concurrent > 1024 {
            anyhow::bail!("Sandbox max_concurrent must be in 1..=1024");
        }
        if self.sandbox.default_timeout_secs == 0 {
            anyhow::bail!("Sandbox default timeout must be > 0");
        }

        if self.rate_limit.enabled {
            for (name, bucket) in [
                ("global", &self.rate_limit.global),
                ("read_only", &self.rate_limit.read_only),
                ("operator", &self.rate_limit.operator),
                ("admin", &self.rate_limit.admin),
            ] {
                if bucket.burst == 0 || bucket.per_minute == 0 {
                    anyhow::bail!("Rate limit '{}' must have burst and per_minute > 0", name);
                }
            }
        }

        if self.audit.queue_capacity == 0 {
            anyhow::bail!("Audit queue capacity must be > 0");
        }

        let mut seen_keys = std::collections::HashSet::new();
        for entry in &self.auth.keys {
            if entry.key.is_empty() {
                anyhow::bail!("API key for identity '{}' is empty", entry.identity);
            }
            if entry.identity.is_empty() {
                anyhow::bail!("API key entry has empty identity");
            }
            if !seen_keys.insert(entry.key.as_str()) {
                anyhow::bail!(
                    "Duplicate API key material for identity '{}'",
                    entry.identity
                );
            }
        }

        for (name, dim) in &self.posture.dimensions {
            if !KNOWN_DIMENSIONS.contains(&name.as_str()) {
                anyhow::bail!(
                    "Unknown posture dimension '{}'. Must be one of: firewall, proxy, vpn, tor",
                    name
                );
            }
            if !dim.simulated && (dim.enable.is_empty() || dim.disable.is_empty()) {
                anyhow::bail!(
                    "Posture dimension '{}' is not simulated but has no enable/disable commands",
                    name
                );
            }
            if dim.timeout_secs == 0 {
                anyhow::bail!("Posture dimension '{}' has zero timeout", name);
            }
            for conflict in &dim.conflicts_with {
                if !KNOWN_DIMENSIONS.contains(&conflict.as_str()) {
                    anyhow::bail!(
                        "Posture dimension '{}' conflicts with unknown dimension '{}'",
                        name,
                        conflict
                    );
                }
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.listen, "127.0.0.1:8443");
        assert_eq!(config.sandbox.max_output_bytes, 1024 * 1024);
        assert_eq!(config.sandbox.max_concurrent, 16);
        assert!(!config.sandbox.allow_privileged);
        assert!(config.rate_limit.enabled);
        assert_eq!(config.posture.dimensions.len(), 4);
        assert!(config.posture.dimensions["vpn"].simulated);
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_max_concurrent() {
        let mut config = Config::default();
        config.sandbox.max_concurrent = 0;
        assert!(config.validate().is_err());

        config.sandbox.max_concurrent = 2048;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_output_cap() {
        let mut config = Config::default();
        config.sandbox.max_output_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_api_key() {
        let mut config = Config::default();
        config.auth.keys.push(ApiKeyEntry {
            key: String::new(),
            identity: "alice".to_string(),
            tier: PrivilegeTier::Operator,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_duplicate_api_key() {
        let mut config = Config::default();
        for identity in ["alice", "bob"] {
            config.auth.keys.push(ApiKeyEntry {
                key: "same-secret".to_string(),
                identity: identity.to_string(),
                tier: PrivilegeTier::Operator,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_unknown_dimension() {
        let mut config = Config::default();
        config.posture.dimensions.insert(
            "jetpack".to_string(),
            PostureDimensionConfig {
                simulated: true,
                timeout_secs: 30,
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_real_dimension_needs_commands() {
        let mut config = Config::default();
        config.posture.dimensions.insert(
            "vpn".to_string(),
            PostureDimensionConfig {
                simulated: false,
                timeout_secs: 30,
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension(".nonexistent");
        let config = Config::load_from_path(&path);
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[server]
listen = "0.0.0.0:9443"

[logging]
level = "debug"
format = "json"

[[auth.keys]]
key = "test-secret-key"
identity = "alice"
tier = "operator"

[sandbox]
max_output_bytes = 65536
max_concurrent = 4

[policy]
path = "/etc/opsgate/policy.toml"

[posture.dimensions.vpn]
simulated = false
enable = ["openvpn", "--config", "/etc/opsgate/client.ovpn", "--daemon"]
disable = ["pkill", "openvpn"]
conflicts_with = ["proxy"]
timeout_secs = 20
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9443");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.auth.keys.len(), 1);
        assert_eq!(config.auth.keys[0].tier, PrivilegeTier::Operator);
        assert_eq!(config.sandbox.max_output_bytes, 65536);
        assert_eq!(config.policy.path, "/etc/opsgate/policy.toml");

        let vpn = &config.posture.dimensions["vpn"];
        assert!(!vpn.simulated);
        assert_eq!(vpn.enable[0], "openvpn");
        assert_eq!(vpn.conflicts_with, vec!["proxy".to_string()]);
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[server
listen = "bad"
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::remove_var("OPSGATE_LISTEN_ADDR");
        std::env::remove_var("OPSGATE_LOG_LEVEL");
        std::env::remove_var("OPSGATE_MAX_CONCURRENT");
        std::env::remove_var("OPSGATE_API_KEY");

        std::env::set_var("OPSGATE_LISTEN_ADDR", "0.0.0.0:1234");
        std::env::set_var("OPSGATE_LOG_LEVEL", "debug");
        std::env::set_var("OPSGATE_MAX_CONCURRENT", "8");
        std::env::set_var("OPSGATE_API_KEY", "env-secret");

        let config = Config::default().apply_env_overrides();

        assert_eq!(config.server.listen, "0.0.0.0:1234");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.sandbox.max_concurrent, 8);
        assert_eq!(config.auth.keys.len(), 1);
        assert_eq!(config.auth.keys[0].identity, "env");
        assert_eq!(config.auth.keys[0].tier, PrivilegeTier::Admin);

        std::env::remove_var("OPSGATE_LISTEN_ADDR");
        std::env::remove_var("OPSGATE_LOG_LEVEL");
        std::env::remove_var("OPSGATE_MAX_CONCURRENT");
        std::env::remove_var("OPSGATE_API_KEY");
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        std::env::remove_var("OPSGATE_MAX_CONCURRENT");
        std::env::set_var("OPSGATE_MAX_CONCURRENT", "4096"); // over cap

        let config = Config::default().apply_env_overrides();
        assert_eq!(config.sandbox.max_concurrent, 16);

        std::env::remove_var("OPSGATE_MAX_CONCURRENT");
    }

    #[test]
    fn test_rate_limit_for_tier() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.for_tier(PrivilegeTier::ReadOnly).burst, 10);
        assert_eq!(settings.for_tier(PrivilegeTier::Operator).burst, 30);
        assert_eq!(settings.for_tier(PrivilegeTier::Admin).burst, 60);
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "debug".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);
    }
}
