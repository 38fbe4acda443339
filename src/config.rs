use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub database: DatabaseConfig,
    /// Default deadline for each orchestration in milliseconds, 0 = none
    #[serde(default)]
    pub tx_timeout_ms: u64,
    #[serde(default)]
    pub verify_email: VerifyEmailConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

/// Verification email task settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VerifyEmailConfig {
    pub ttl_minutes: i64,
    pub queue: String,
    pub max_retry: u32,
    pub process_in_secs: u64,
    pub link_base_url: String,
}

impl Default for VerifyEmailConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 15,
            queue: "critical".to_string(),
            max_retry: 10,
            process_in_secs: 10,
            link_base_url: "http://localhost:8080/v1/verify_email".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn tx_timeout(&self) -> Option<Duration> {
        (self.tx_timeout_ms > 0).then(|| Duration::from_millis(self.tx_timeout_ms))
    }
}
