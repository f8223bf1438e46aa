//! Configuration validation module providing validation rules and constraints.
//!
//! Validation runs once, after defaults, file, and environment overrides are
//! merged, and before a coordinator is created. Each section has its own
//! validator so error messages point at the offending setting.

use crate::Result;
use crate::config::CoordinatorConfig;
use crate::error::TaskForgeError;

/// Trait defining the validation interface for configuration sections.
pub trait ConfigValidator {
    /// Validate the configuration and return any errors found.
    fn validate(&self, config: &CoordinatorConfig) -> Result<()>;
}

/// Port-range validator.
pub struct PortValidator;

impl ConfigValidator for PortValidator {
    fn validate(&self, config: &CoordinatorConfig) -> Result<()> {
        if config.port.port == 0 && config.port.low_port > config.port.high_port {
            return Err(TaskForgeError::config(format!(
                "port range {}-{} is inverted",
                config.port.low_port, config.port.high_port
            )));
        }
        Ok(())
    }
}

/// Timeout validator.
pub struct TimeoutValidator;

impl ConfigValidator for TimeoutValidator {
    fn validate(&self, config: &CoordinatorConfig) -> Result<()> {
        let t = &config.timeouts;
        if t.short_secs == 0 || t.long_secs == 0 {
            return Err(TaskForgeError::config(
                "short and long timeouts must be nonzero",
            ));
        }
        if t.keepalive_timeout_secs < t.keepalive_interval_secs {
            return Err(TaskForgeError::config(format!(
                "keepalive timeout ({}s) must not be shorter than the probe interval ({}s)",
                t.keepalive_timeout_secs, t.keepalive_interval_secs
            )));
        }
        Ok(())
    }
}

/// Transfer-tuning validator.
pub struct TransferValidator;

impl ConfigValidator for TransferValidator {
    fn validate(&self, config: &CoordinatorConfig) -> Result<()> {
        let t = &config.transfer;
        if t.default_rate_bytes_per_sec == 0 {
            return Err(TaskForgeError::config(
                "default transfer rate must be nonzero",
            ));
        }
        if t.outlier_factor == 0 {
            return Err(TaskForgeError::config("transfer outlier factor must be nonzero"));
        }
        Ok(())
    }
}

/// Scheduler-tuning validator.
pub struct SchedulingValidator;

impl ConfigValidator for SchedulingValidator {
    fn validate(&self, config: &CoordinatorConfig) -> Result<()> {
        let s = &config.scheduling;
        if s.submit_multiplier <= 0.0 {
            return Err(TaskForgeError::config(format!(
                "submit multiplier must be positive, got {}",
                s.submit_multiplier
            )));
        }
        if s.fast_abort_multiplier < 0.0 {
            return Err(TaskForgeError::config(
                "fast-abort multiplier must not be negative",
            ));
        }
        if s.max_new_workers_per_cycle == 0 {
            return Err(TaskForgeError::config(
                "at least one connection must be accepted per cycle",
            ));
        }
        Ok(())
    }
}

/// Run every section validator against `config`.
pub fn validate(config: &CoordinatorConfig) -> Result<()> {
    let validators: [&dyn ConfigValidator; 4] = [
        &PortValidator,
        &TimeoutValidator,
        &TransferValidator,
        &SchedulingValidator,
    ];
    for validator in validators {
        validator.validate(config)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_port_range_rejected() {
        let mut config = CoordinatorConfig::default();
        config.port.low_port = 9300;
        config.port.high_port = 9200;
        assert!(validate(&config).is_err());
        // an explicit port ignores the range
        config.port.port = 9123;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn keepalive_timeout_must_cover_interval() {
        let mut config = CoordinatorConfig::default();
        config.timeouts.keepalive_interval_secs = 300;
        config.timeouts.keepalive_timeout_secs = 100;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_transfer_rate_rejected() {
        let mut config = CoordinatorConfig::default();
        config.transfer.default_rate_bytes_per_sec = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn non_positive_multiplier_rejected() {
        let mut config = CoordinatorConfig::default();
        config.scheduling.submit_multiplier = 0.0;
        assert!(validate(&config).is_err());
    }
}
