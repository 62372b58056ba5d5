use std::time::Duration;

use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_SWEEPER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// ─── Scheduler Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the external sweep trigger.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Upper bound on a single email/task dispatch or condition evaluation.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Due enrollments loaded from the store per page.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Enrollments advanced in parallel within one sweep.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Consecutive failed attempts before an enrollment is dead-lettered.
    /// Zero retries forever.
    #[serde(default)]
    pub max_dispatch_attempts: u32,
}

fn default_sweep_interval_ms() -> u64 { 60_000 }
fn default_dispatch_timeout_ms() -> u64 { 10_000 }
fn default_batch_size() -> usize { 500 }
fn default_max_concurrency() -> usize { 16 }

impl SchedulerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_dispatch_attempts: 0,
        }
    }
}

// ─── Lifecycle Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Reject campaign status writes that are not in the transition table.
    /// Off by default: any status may be written directly.
    #[serde(default = "default_enforce_status_transitions")]
    pub enforce_status_transitions: bool,
    /// Enrollments into a campaign without steps start out `completed`
    /// instead of sitting `active` with no due time.
    #[serde(default = "default_complete_empty_enrollments")]
    pub complete_empty_enrollments: bool,
}

fn default_enforce_status_transitions() -> bool { false }
fn default_complete_empty_enrollments() -> bool { true }

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enforce_status_transitions: default_enforce_status_transitions(),
            complete_empty_enrollments: default_complete_empty_enrollments(),
        }
    }
}

// Default functions
fn default_node_id() -> String {
    "sweeper-01".to_string()
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CAMPAIGN_SWEEPER")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.scheduler.dispatch_timeout(), Duration::from_secs(10));
        assert_eq!(config.scheduler.max_dispatch_attempts, 0);
        assert!(!config.lifecycle.enforce_status_transitions);
        assert!(config.lifecycle.complete_empty_enrollments);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "node_id": "sweeper-07",
            "scheduler": { "batch_size": 50, "max_dispatch_attempts": 3 }
        }))
        .unwrap();
        assert_eq!(config.node_id, "sweeper-07");
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.scheduler.max_dispatch_attempts, 3);
        assert_eq!(config.scheduler.max_concurrency, 16);
        assert_eq!(config.metrics.port, 9091);
    }
}
