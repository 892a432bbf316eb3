use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let audit = &config.audit;
    if audit.interval_secs == 0 {
        return Err(invalid("audit.interval_secs must be > 0"));
    }
    if audit.stale_claim_threshold_secs == 0 {
        return Err(invalid("audit.stale_claim_threshold_secs must be > 0"));
    }
    if audit.max_retries == 0 {
        return Err(invalid("audit.max_retries must be >= 1"));
    }

    if config.notifier.capacity == 0 {
        return Err(invalid("notifier.capacity must be > 0"));
    }

    let workers = &config.workers;
    if workers.count == 0 {
        return Err(invalid("workers.count must be > 0"));
    }
    if workers.poll_interval_ms == 0 {
        return Err(invalid("workers.poll_interval_ms must be > 0"));
    }
    if workers.max_backoff_ms < workers.poll_interval_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "workers.max_backoff_ms ({}) is below poll_interval_ms ({})",
                workers.max_backoff_ms, workers.poll_interval_ms
            ),
        });
    }

    for (i, handler) in workers.handlers.iter().enumerate() {
        if handler.name.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("workers.handlers[{}].name must not be empty", i),
            });
        }
        if handler.kinds.is_empty() {
            return Err(ConfigError::Validation {
                message: format!("workers.handlers '{}' lists no kinds", handler.name),
            });
        }
        if handler.program.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("workers.handlers '{}' has no program", handler.name),
            });
        }
    }

    if config.logging.level.trim().is_empty() {
        return Err(invalid("logging.level must not be empty"));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}
