// src/config.rs
// Runtime configuration from the .env file and its surrounding layout.

use crate::BackupError;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATS_INTERVAL_SECS: i64 = 60;
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Everything the command needs to know about its environment.
///
/// The `.env` file is found by walking up from the working directory
/// (dotenvy's own search); the data directory sits next to it and holds
/// the store file and the run log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the Immich data tree to back up
    pub immich_path: PathBuf,
    /// Cadence of sync-tool stats output; doubles as the stale threshold
    pub stats_interval_secs: i64,
    pub max_retries: i64,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self, BackupError> {
        let env_path = dotenvy::dotenv().map_err(|e| {
            BackupError::ConfigurationMissing(format!(
                "no .env file found walking up from the current directory: {}",
                e
            ))
        })?;

        let immich_path = PathBuf::from(require_var("BACKUP_IMMICH_PATH")?);
        if !immich_path.is_dir() {
            return Err(BackupError::ConfigurationMissing(format!(
                "BACKUP_IMMICH_PATH '{}' does not exist",
                immich_path.display()
            )));
        }

        let data_dir = env_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("data");

        Ok(Self {
            immich_path,
            stats_interval_secs: optional_int("BACKUP_STATS_INTERVAL", DEFAULT_STATS_INTERVAL_SECS)?,
            max_retries: optional_int("BACKUP_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            data_dir,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("backup.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("backup.log")
    }
}

fn require_var(name: &str) -> Result<String, BackupError> {
    std::env::var(name).map_err(|_| {
        BackupError::ConfigurationMissing(format!("required environment variable {} is not set", name))
    })
}

fn optional_int(name: &str, default: i64) -> Result<i64, BackupError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| {
            BackupError::ConfigurationMissing(format!("{} must be an integer, got '{}'", name, value))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_hang_off_data_dir() {
        let config = Config {
            immich_path: PathBuf::from("/srv/immich"),
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            data_dir: PathBuf::from("/srv/backup/data"),
        };

        assert_eq!(config.db_path(), PathBuf::from("/srv/backup/data/backup.db"));
        assert_eq!(config.log_path(), PathBuf::from("/srv/backup/data/backup.log"));
    }

    #[test]
    fn test_optional_int_default_and_parse() {
        // Variável inexistente usa o default
        assert_eq!(optional_int("BACKUP_TEST_UNSET_VAR", 60).unwrap(), 60);

        std::env::set_var("BACKUP_TEST_INTERVAL_VAR", "30");
        assert_eq!(optional_int("BACKUP_TEST_INTERVAL_VAR", 60).unwrap(), 30);

        std::env::set_var("BACKUP_TEST_INTERVAL_VAR", "soon");
        assert!(optional_int("BACKUP_TEST_INTERVAL_VAR", 60).is_err());
        std::env::remove_var("BACKUP_TEST_INTERVAL_VAR");
    }
}
