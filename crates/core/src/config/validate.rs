use super::{types::Config, ConfigError};
use crate::limits::ExecutionLimits;

/// Validate configuration
/// Currently validates:
/// - Engine limits (concurrency at least 1, positive timeout)
/// - Cache capacity and TTL
/// - A processor program is set
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    ExecutionLimits::try_from(&config.engine)
        .map_err(|e| ConfigError::ValidationError(format!("engine: {}", e)))?;

    if config.cache.max_entries == 0 {
        return Err(ConfigError::ValidationError(
            "cache.max_entries cannot be 0".to_string(),
        ));
    }
    if config.cache.ttl_secs == Some(0) {
        return Err(ConfigError::ValidationError(
            "cache.ttl_secs cannot be 0".to_string(),
        ));
    }

    if config.processor.program.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "processor.program is required".to_string(),
        ));
    }

    Ok(())
}
