//! Tracing and logging configuration structures

use serde::{Deserialize, Serialize};

/// Type of trace exporter to use
///
/// Only OTLP is supported. Jaeger, Tempo and other backends accept OTLP
/// natively on port 4317.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExporterType {
    #[default]
    Otlp,
}

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Configuration for structured logging and distributed tracing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Export spans to the collector. Logging is always set up.
    pub enabled: bool,

    pub exporter: ExporterType,

    /// OTLP collector endpoint, e.g. "http://jaeger:4317"
    pub otlp_endpoint: Option<String>,

    /// Sample rate (0.0 to 1.0)
    /// - 0.1: sample 10% of traces (production)
    /// - 1.0: sample all traces (development)
    pub sample_rate: f64,

    pub service_version: String,

    /// Deployment environment (development, staging, production)
    pub environment: String,

    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exporter: ExporterType::Otlp,
            otlp_endpoint: Some("http://jaeger:4317".to_string()),
            sample_rate: 0.1,
            service_version: "dev".to_string(),
            environment: "development".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl TracingConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TRACING_ENABLED`: Enable span export (true/false)
    /// - `OTLP_ENDPOINT`: OTLP collector endpoint (default: http://jaeger:4317)
    /// - `TRACING_SAMPLE_RATE`: Sample rate (0.0-1.0)
    /// - `SERVICE_VERSION`: Service version
    /// - `APP_ENV`: Environment (development/staging/production)
    /// - `LOG_LEVEL`: Default log filter (default: info)
    /// - `LOG_FORMAT`: `text` or `json`
    pub fn from_env() -> Self {
        let enabled = std::env::var("TRACING_ENABLED")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

        let otlp_endpoint = std::env::var("OTLP_ENDPOINT")
            .ok()
            .or_else(|| Some("http://jaeger:4317".to_string()));

        let sample_rate = std::env::var("TRACING_SAMPLE_RATE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.1)
            .clamp(0.0, 1.0);

        let service_version =
            std::env::var("SERVICE_VERSION").unwrap_or_else(|_| "dev".to_string());

        let environment = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_format = std::env::var("LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default();

        Self {
            enabled,
            exporter: ExporterType::Otlp,
            otlp_endpoint,
            sample_rate,
            service_version,
            environment,
            log_level,
            log_format,
        }
    }

    /// Sample rate clamped to 0.0..=1.0, whatever way the config was built
    pub fn sample_ratio(&self) -> f64 {
        self.sample_rate.clamp(0.0, 1.0)
    }

    /// Create production configuration
    pub fn production(service_version: &str) -> Self {
        Self {
            enabled: true,
            otlp_endpoint: Some("http://jaeger-collector:4317".to_string()),
            sample_rate: 0.1,
            service_version: service_version.to_string(),
            environment: "production".to_string(),
            log_format: LogFormat::Json,
            ..Self::default()
        }
    }

    /// Create staging configuration
    pub fn staging(service_version: &str) -> Self {
        Self {
            enabled: true,
            otlp_endpoint: Some("http://jaeger-collector:4317".to_string()),
            sample_rate: 0.5,
            service_version: service_version.to_string(),
            environment: "staging".to_string(),
            log_format: LogFormat::Json,
            ..Self::default()
        }
    }

    /// Create development configuration (trace all requests)
    pub fn development() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: Some("http://localhost:4317".to_string()),
            sample_rate: 1.0,
            log_level: "debug".to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.sample_rate, 0.1);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_production_config() {
        let config = TracingConfig::production("1.2.3");
        assert!(config.enabled);
        assert_eq!(config.sample_rate, 0.1);
        assert_eq!(config.service_version, "1.2.3");
        assert_eq!(config.environment, "production");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_development_config() {
        let config = TracingConfig::development();
        assert!(config.enabled);
        assert_eq!(config.sample_rate, 1.0);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("text"), LogFormat::Text);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Text);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("TRACING_SAMPLE_RATE", "2.5");
        std::env::set_var("LOG_FORMAT", "json");
        let config = TracingConfig::from_env();
        assert_eq!(config.sample_rate, 1.0); // Should be clamped to 1.0
        assert_eq!(config.log_format, LogFormat::Json);
        std::env::remove_var("TRACING_SAMPLE_RATE");
        std::env::remove_var("LOG_FORMAT");
    }

    #[test]
    fn test_config_deserialize() {
        let config: TracingConfig = serde_json::from_str(
            r#"{
                "enabled": true,
                "exporter": "otlp",
                "otlp_endpoint": null,
                "sample_rate": 0.25,
                "service_version": "2.0.0",
                "environment": "staging",
                "log_level": "warn",
                "log_format": "json"
            }"#,
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.otlp_endpoint, None);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_sample_ratio_clamped() {
        let mut config = TracingConfig {
            sample_rate: 2.5,
            ..TracingConfig::default()
        };
        assert_eq!(config.sample_ratio(), 1.0);

        config.sample_rate = -0.5;
        assert_eq!(config.sample_ratio(), 0.0);

        config.sample_rate = 0.25;
        assert_eq!(config.sample_ratio(), 0.25);
    }
}
