// src/config/validate.rs

use anyhow::{anyhow, Result};

use crate::config::Settings;

/// Run basic semantic validation against resolved settings.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.state_dir.as_os_str().is_empty() {
        return Err(anyhow!("[daemon].state_dir must not be empty"));
    }

    if settings.conda_command.trim().is_empty() {
        return Err(anyhow!("[daemon].conda_command must not be empty"));
    }

    if settings.tick_interval_ms == 0 {
        return Err(anyhow!("[daemon].tick_interval_ms must be >= 1 (got 0)"));
    }

    if settings.history_retention_days <= 0 {
        return Err(anyhow!(
            "[daemon].history_retention_days must be >= 1 (got {})",
            settings.history_retention_days
        ));
    }

    if settings.backup_retention_days <= 0 {
        return Err(anyhow!(
            "[daemon].backup_retention_days must be >= 1 (got {})",
            settings.backup_retention_days
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn default_settings_are_valid() {
        assert!(validate_settings(&Settings::default()).is_ok());
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        let mut settings = Settings::default();
        settings.tick_interval_ms = 0;
        assert!(validate_settings(&settings).is_err());
    }
}
