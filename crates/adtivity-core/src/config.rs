use std::time::Duration;

use crate::error::CoreError;
use crate::metric::{default_metric_rules, Granularity, MetricCatalog, MetricRule};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    pub cors_origins: Vec<String>,
    pub pipeline: PipelineConfig,
}

/// Tunables of the ingestion and metrics pipeline.
///
/// Every value is configurable; the defaults are the suggested values for a
/// "real-time" dashboard and should be confirmed per deployment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum events buffered (queued or being written) per tenant.
    pub queue_capacity: usize,
    /// Flush a tenant lane once this many events are buffered.
    pub flush_max_events: usize,
    /// Flush a tenant lane once its oldest buffered event is this old.
    pub flush_interval_ms: u64,
    pub max_properties_bytes: usize,
    pub max_clock_skew_secs: i64,
    pub granularity: Granularity,
    /// How long after a bucket closes late events still invalidate its cache.
    pub late_grace_secs: i64,
    pub cache_ttl_secs: u64,
    pub max_query_span_days: i64,
    pub max_query_metrics: usize,
    pub write_max_attempts: u32,
    pub write_backoff_ms: u64,
    pub write_backoff_max_ms: u64,
    pub metric_rules: Vec<MetricRule>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            flush_max_events: 500,
            flush_interval_ms: 1_000,
            max_properties_bytes: 64 * 1024,
            max_clock_skew_secs: 300,
            granularity: Granularity::Hour,
            late_grace_secs: 86_400,
            cache_ttl_secs: 300,
            max_query_span_days: 92,
            max_query_metrics: 20,
            write_max_attempts: 5,
            write_backoff_ms: 100,
            write_backoff_max_ms: 5_000,
            metric_rules: default_metric_rules(),
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn late_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.late_grace_secs)
    }

    pub fn max_clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_clock_skew_secs)
    }

    pub fn max_query_span(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_query_span_days)
    }

    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// capped at `write_backoff_max_ms`.
    pub fn write_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .write_backoff_ms
            .saturating_mul(factor)
            .min(self.write_backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Suggested `Retry-After` for callers shed by backpressure.
    pub fn retry_after_secs(&self) -> u64 {
        self.flush_interval_ms.div_ceil(1000).max(1)
    }

    pub fn catalog(&self) -> Result<MetricCatalog, CoreError> {
        MetricCatalog::new(self.metric_rules.clone())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.queue_capacity == 0 {
            return Err(CoreError::Config("queue capacity must be > 0".to_string()));
        }
        if self.flush_max_events == 0 || self.flush_max_events > self.queue_capacity {
            return Err(CoreError::Config(format!(
                "flush threshold must be between 1 and the queue capacity ({})",
                self.queue_capacity
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(CoreError::Config("flush interval must be > 0".to_string()));
        }
        if self.write_max_attempts == 0 {
            return Err(CoreError::Config(
                "write attempts must be at least 1".to_string(),
            ));
        }
        if self.max_query_span_days <= 0 || self.max_query_metrics == 0 {
            return Err(CoreError::Config(
                "query limits must be positive".to_string(),
            ));
        }
        if self.late_grace_secs < 0 {
            return Err(CoreError::Config(
                "late grace window must not be negative".to_string(),
            ));
        }
        self.catalog().map(|_| ())
    }

    fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let metric_rules = match std::env::var("ADTIVITY_METRIC_RULES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map_err(|e| format!("invalid ADTIVITY_METRIC_RULES: {e}"))?,
            _ => defaults.metric_rules.clone(),
        };
        let granularity = match std::env::var("ADTIVITY_BUCKET") {
            Ok(raw) => Granularity::parse(&raw)
                .ok_or_else(|| format!("invalid ADTIVITY_BUCKET: {raw} (expected hour|day)"))?,
            Err(_) => defaults.granularity,
        };
        let cfg = Self {
            queue_capacity: env_or("ADTIVITY_QUEUE_CAPACITY", defaults.queue_capacity)?,
            flush_max_events: env_or("ADTIVITY_FLUSH_MAX_EVENTS", defaults.flush_max_events)?,
            flush_interval_ms: env_or("ADTIVITY_FLUSH_INTERVAL_MS", defaults.flush_interval_ms)?,
            max_properties_bytes: env_or(
                "ADTIVITY_MAX_PROPERTIES_BYTES",
                defaults.max_properties_bytes,
            )?,
            max_clock_skew_secs: env_or(
                "ADTIVITY_MAX_CLOCK_SKEW_SECS",
                defaults.max_clock_skew_secs,
            )?,
            granularity,
            late_grace_secs: env_or("ADTIVITY_LATE_GRACE_SECS", defaults.late_grace_secs)?,
            cache_ttl_secs: env_or("ADTIVITY_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            max_query_span_days: env_or(
                "ADTIVITY_MAX_QUERY_SPAN_DAYS",
                defaults.max_query_span_days,
            )?,
            max_query_metrics: defaults.max_query_metrics,
            write_max_attempts: env_or("ADTIVITY_WRITE_MAX_ATTEMPTS", defaults.write_max_attempts)?,
            write_backoff_ms: env_or("ADTIVITY_WRITE_BACKOFF_MS", defaults.write_backoff_ms)?,
            write_backoff_max_ms: env_or(
                "ADTIVITY_WRITE_BACKOFF_MAX_MS",
                defaults.write_backoff_max_ms,
            )?,
            metric_rules,
        };
        cfg.validate().map_err(|e| e.to_string())?;
        Ok(cfg)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            port: env_or("ADTIVITY_PORT", 3000)?,
            data_dir: std::env::var("ADTIVITY_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            duckdb_memory_limit: std::env::var("ADTIVITY_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            cors_origins: std::env::var("ADTIVITY_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            pipeline: PipelineConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn flush_threshold_above_capacity_is_rejected() {
        let cfg = PipelineConfig {
            queue_capacity: 10,
            flush_max_events: 11,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = PipelineConfig {
            write_backoff_ms: 100,
            write_backoff_max_ms: 500,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.write_backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.write_backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.write_backoff(3), Duration::from_millis(400));
        assert_eq!(cfg.write_backoff(4), Duration::from_millis(500));
        assert_eq!(cfg.write_backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        let cfg = PipelineConfig {
            flush_interval_ms: 1_500,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.retry_after_secs(), 2);
    }
}
