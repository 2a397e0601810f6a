// Configuration management with layered configuration (file, env)

use crate::serialization::SerializerKind;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// `instance_id` value asking for a generated node id
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URI of the document store
    pub endpoint: String,
    pub access_key: Option<String>,
    pub database_id: String,
    /// Table holding every document collection
    pub collection_id: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "postgresql://postgres@localhost:5432".to_string(),
            access_key: None,
            database_id: "quartz".to_string(),
            collection_id: "quartz_documents".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler name; also the partition every document is written under
    pub instance_name: String,
    pub instance_id: String,
    pub clustered: bool,
    pub serializer: SerializerKind,
    pub misfire_threshold_ms: u64,
    pub cluster_checkin_interval_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_misfires_per_sweep: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "QuartzScheduler".to_string(),
            instance_id: AUTO_INSTANCE_ID.to_string(),
            clustered: true,
            serializer: SerializerKind::Json,
            misfire_threshold_ms: 60_000,
            cluster_checkin_interval_ms: 7_500,
            lock_timeout_ms: 5_000,
            max_misfires_per_sweep: 20,
        }
    }
}

impl SchedulerConfig {
    /// Node id to run as; `AUTO` becomes `<host>-<uuid>`
    pub fn resolve_instance_id(&self) -> String {
        if self.instance_id.is_empty() || self.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
            format!("{}-{}", host, Uuid::new_v4())
        } else {
            self.instance_id.clone()
        }
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn checkin_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_checkin_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Bounded backoff for operations that hit an unavailable store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

/// Plain SQL identifier: letter or underscore first, at most 63 bytes
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.store.endpoint.is_empty() {
            return Err("Store endpoint cannot be empty".to_string());
        }
        if self.store.database_id.is_empty() {
            return Err("Store database_id cannot be empty".to_string());
        }
        if !is_valid_identifier(&self.store.collection_id) {
            return Err(format!(
                "Store collection_id '{}' must be a plain identifier",
                self.store.collection_id
            ));
        }
        if self.store.max_connections == 0 {
            return Err("Store max_connections must be greater than 0".to_string());
        }
        if self.store.min_connections > self.store.max_connections {
            return Err("Store min_connections cannot exceed max_connections".to_string());
        }

        if self.scheduler.instance_name.is_empty() {
            return Err("Scheduler instance_name cannot be empty".to_string());
        }
        if self.scheduler.cluster_checkin_interval_ms == 0 {
            return Err("Scheduler cluster_checkin_interval_ms must be greater than 0".to_string());
        }
        if self.scheduler.lock_timeout_ms == 0 {
            return Err("Scheduler lock_timeout_ms must be greater than 0".to_string());
        }
        if self.scheduler.misfire_threshold_ms == 0 {
            return Err("Scheduler misfire_threshold_ms must be greater than 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("Retry max_attempts must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err("Retry jitter_factor must be between 0.0 and 1.0".to_string());
        }

        Ok(())
    }
}
