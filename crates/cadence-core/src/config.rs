use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_ANNOTATION_DOMAIN: &str = "batch.cadence.dev";
pub const DEFAULT_BASE_DELAY_MS: u64 = 5;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 1000;
pub const DEFAULT_LOG_FILTER: &str = "cadence_controller=info,cadence_scheduler=info";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of reconcile workers. Distinct schedules reconcile in parallel;
    /// a single schedule never runs on two workers at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Domain prefix of the `<domain>/scheduled-at` annotation stamped on
    /// every execution record.
    #[serde(default = "default_annotation_domain")]
    pub annotation_domain: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            annotation_domain: DEFAULT_ANNOTATION_DOMAIN.to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn scheduled_at_annotation(&self) -> String {
        format!("{}/scheduled-at", self.annotation_domain)
    }
}

/// Per-key exponential backoff applied when a reconcile pass fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive. `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

impl LoggingConfig {
    pub fn filter_or_default(&self) -> &str {
        self.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// JSON file holding an array of schedule resources to seed the store.
    pub path: Option<String>,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_annotation_domain() -> String {
    DEFAULT_ANNOTATION_DOMAIN.to_string()
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_secs() -> u64 {
    DEFAULT_MAX_DELAY_SECS
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CADENCE_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: CadenceConfig = figment
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        if config.controller.workers == 0 {
            return Err(crate::error::CadenceError::Config(
                "controller.workers must be at least 1".to_string(),
            ));
        }
        if config.controller.annotation_domain.trim().is_empty() {
            return Err(crate::error::CadenceError::Config(
                "controller.annotation_domain must not be empty".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_figment_yields_defaults() {
        let config = CadenceConfig::from_figment(Figment::new()).unwrap();
        assert_eq!(config.controller.workers, DEFAULT_WORKERS);
        assert_eq!(
            config.controller.scheduled_at_annotation(),
            "batch.cadence.dev/scheduled-at"
        );
        assert_eq!(config.backoff.base_delay_ms, 5);
        assert_eq!(config.logging.filter_or_default(), DEFAULT_LOG_FILTER);
        assert!(config.manifest.path.is_none());
    }

    #[test]
    fn toml_overrides_defaults() {
        let toml = r#"
            [controller]
            workers = 8
            annotation_domain = "jobs.example.com"

            [backoff]
            max_delay_secs = 60

            [logging]
            filter = "debug"
        "#;
        let config = CadenceConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap();
        assert_eq!(config.controller.workers, 8);
        assert_eq!(
            config.controller.scheduled_at_annotation(),
            "jobs.example.com/scheduled-at"
        );
        assert_eq!(config.backoff.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert_eq!(config.backoff.max_delay_secs, 60);
        assert_eq!(config.logging.filter_or_default(), "debug");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let toml = "[controller]\nworkers = 0\n";
        let err = CadenceConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
