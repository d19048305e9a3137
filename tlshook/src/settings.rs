use std::{path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::analyzer::StructOffsets;
use crate::coordinator::{CoordinatorConfig, DEFAULT_INTERNAL_PROCESS_PATTERN, DEFAULT_SYNC_INTERVAL};

const DEFAULT_PROC_ROOT: &str = "/proc";

/// Go TLS coordinator configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct GoTlsSettings {
    pub exclude_self: Option<bool>,
    pub internal_process_pattern: Option<String>,
    pub sync_interval_secs: Option<u64>,
    pub retry_ineligible: Option<bool>,
    #[serde(default)]
    pub struct_offsets: StructOffsets,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub bpf_object: Option<String>,
    pub proc_root: Option<String>,
    #[serde(default)]
    pub go_tls: GoTlsSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn proc_root(&self) -> PathBuf {
        PathBuf::from(self.proc_root.as_deref().unwrap_or(DEFAULT_PROC_ROOT))
    }

    pub fn to_coordinator_config(&self) -> Result<CoordinatorConfig, regex::Error> {
        let pattern = self
            .go_tls
            .internal_process_pattern
            .as_deref()
            .unwrap_or(DEFAULT_INTERNAL_PROCESS_PATTERN);

        let sync_interval = self
            .go_tls
            .sync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SYNC_INTERVAL);

        Ok(CoordinatorConfig {
            exclude_self: self.go_tls.exclude_self.unwrap_or(true),
            internal_process_pattern: regex::Regex::new(pattern)?,
            sync_interval,
            retry_ineligible: self.go_tls.retry_ineligible.unwrap_or(false),
        })
    }
}
