use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryDbConfig {
    pub uri: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path of the JSON document holding every meter's reading log.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_minimum_state_change")]
    pub minimum_state_change: f64,
    #[serde(default = "default_daily_snapshot_interval_secs")]
    pub daily_snapshot_interval_secs: i64,
    #[serde(default = "default_short_term_window_days")]
    pub short_term_window_days: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            minimum_state_change: default_minimum_state_change(),
            daily_snapshot_interval_secs: default_daily_snapshot_interval_secs(),
            short_term_window_days: default_short_term_window_days(),
        }
    }
}

fn default_minimum_state_change() -> f64 {
    0.1
}

fn default_daily_snapshot_interval_secs() -> i64 {
    86_400
}

fn default_short_term_window_days() -> i64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub history_db: HistoryDbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("READING_SERVICE_CONFIG")
            .unwrap_or_else(|_| "reading-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}

impl ReconcileConfig {
    pub fn settings(&self) -> crate::reconcile::ReconcilerSettings {
        crate::reconcile::ReconcilerSettings {
            minimum_state_change: self.minimum_state_change,
            daily_snapshot_interval: time::Duration::seconds(self.daily_snapshot_interval_secs),
            short_term_window: time::Duration::days(self.short_term_window_days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_reconcile_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [history_db]
            uri = "postgres://localhost/history"
            max_connections = 4

            [storage]
            path = "/var/lib/meters/readings.json"
            "#,
        )
        .expect("minimal config must parse");

        assert_eq!(cfg.reconcile.minimum_state_change, 0.1);
        assert_eq!(cfg.reconcile.daily_snapshot_interval_secs, 86_400);
        assert_eq!(cfg.reconcile.short_term_window_days, 10);
        assert!(cfg.metrics.is_none());
    }
}
