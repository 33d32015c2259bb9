// src/config/validate.rs

use globset::Glob;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{QaError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = QaError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.run, raw.runner))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_runners(cfg)?;
    validate_run_section(cfg)?;
    validate_runners(cfg)?;
    Ok(())
}

fn ensure_has_runners(cfg: &RawConfigFile) -> Result<()> {
    if cfg.runner.is_empty() {
        return Err(QaError::ConfigError(
            "config must contain at least one [runner.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_run_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.run.workers == Some(0) {
        return Err(QaError::ConfigError(
            "[run].workers must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_runners(cfg: &RawConfigFile) -> Result<()> {
    for (name, runner) in cfg.runner.iter() {
        if runner.command.is_empty() || runner.command[0].trim().is_empty() {
            return Err(QaError::ConfigError(format!(
                "runner '{name}' must have a non-empty `command`"
            )));
        }
        if runner.patterns.is_empty() {
            return Err(QaError::ConfigError(format!(
                "runner '{name}' must have at least one entry in `patterns`"
            )));
        }
        for pattern in runner.patterns.iter() {
            Glob::new(pattern).map_err(|e| {
                QaError::ConfigError(format!(
                    "runner '{name}' has invalid pattern '{pattern}': {e}"
                ))
            })?;
        }
    }
    Ok(())
}
