//! Engine configuration.
//!
//! Configuration is read from the environment (via clap's `env` support), deserialised from JSON,
//! or constructed directly by an embedding application.

use clap::Parser;
use serde::Deserialize;
use validator::Validate;

use crate::error::ReductionError;

/// Reduction engine configuration
#[derive(Clone, Debug, Deserialize, Parser, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of worker threads. Defaults to the number of CPUs.
    #[arg(long, env = "NCD_REDUCTION_THREADS")]
    #[validate(range(min = 1, message = "threads must be greater than 0"))]
    #[serde(default)]
    pub threads: Option<usize>,
    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = crate::tracing::DEFAULT_FILTER, env = "NCD_REDUCTION_LOG_FILTER")]
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Whether stages record prometheus metrics.
    #[arg(long, default_value_t = false, env = "NCD_REDUCTION_METRICS")]
    #[serde(default)]
    pub metrics: bool,
}

fn default_log_filter() -> String {
    crate::tracing::DEFAULT_FILTER.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: None,
            log_filter: default_log_filter(),
            metrics: false,
        }
    }
}

impl EngineConfig {
    /// Returns a validated configuration read from `NCD_REDUCTION_*` environment variables.
    pub fn from_env() -> Result<Self, ReductionError> {
        let config = Self::try_parse_from(["ncd-reduction"]).map_err(|err| {
            let mut error = validator::ValidationError::new("invalid environment configuration");
            error.add_param("error".into(), &err.to_string());
            error
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a validated configuration deserialised from JSON.
    pub fn from_json(json: &str) -> Result<Self, ReductionError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of worker threads to use.
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Install the global tracing subscriber, filtering with `log_filter` unless `RUST_LOG` is set.
    pub fn init_tracing(&self) {
        crate::tracing::init_tracing(&self.log_filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_all_cpus() {
        let config = EngineConfig::default();
        assert_eq!(num_cpus::get().max(1), config.worker_threads());
        assert_eq!("ncd_reduction=info", config.log_filter);
        assert!(!config.metrics);
    }

    #[test]
    fn from_json_minimal() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(EngineConfig::default(), config);
    }

    #[test]
    fn from_json_all_fields() {
        let config =
            EngineConfig::from_json(r#"{"threads": 3, "log_filter": "debug", "metrics": true}"#)
                .unwrap();
        assert_eq!(3, config.worker_threads());
        assert_eq!("debug", config.log_filter);
        assert!(config.metrics);
    }

    #[test]
    fn from_json_zero_threads() {
        match EngineConfig::from_json(r#"{"threads": 0}"#) {
            Err(ReductionError::ParametersValidation(errors)) => {
                assert!(errors.field_errors().contains_key("threads"))
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn from_json_unknown_field() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"thread": 3}"#),
            Err(ReductionError::ParametersJson(_))
        ));
    }

    #[test]
    fn parse_from_args() {
        let config = EngineConfig::try_parse_from(["ncd-reduction", "--threads", "2"]).unwrap();
        assert_eq!(Some(2), config.threads);
    }
}
