//! Environment-based Configuration
//!
//! All settings come from environment variables, with a `.env` file honored
//! in development.
//!
//! # Environment Variables
//!
//! - `FROST_COORD_DB` - path to the sqlite database (default: "coordinator.db")
//! - `FROST_COORD_LOG_LEVEL` - trace, debug, info, warn, error (default: "info")
//! - `FROST_COORD_LOG_JSON` - "1" for JSON log output (default: off)
//! - `FROST_COORD_BAUD` - serial baud rate (default: 115200)
//! - `FROST_COORD_NONCE_LOW_WATER` - inventory level that triggers
//!   replenishment (default: 8)
//! - `FROST_COORD_NONCE_TARGET` - inventory level replenishment tops up to
//!   (default: 32)
//! - `FROST_COORD_FIRMWARE_DIGEST` - hex digest of the newest known firmware
//!   (default: all zeros, upgrade prompts disabled)

use std::env;
use thiserror::Error;

use crate::keystore::{DEFAULT_NONCE_LOW_WATER, DEFAULT_NONCE_TARGET};
use crate::types::FirmwareDigest;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub log_level: String,
    pub log_json: bool,
    pub baud: u32,
    pub nonce_low_water: usize,
    pub nonce_target: usize,
    pub latest_firmware: FirmwareDigest,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: "coordinator.db".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            baud: 115_200,
            nonce_low_water: DEFAULT_NONCE_LOW_WATER,
            nonce_target: DEFAULT_NONCE_TARGET,
            latest_firmware: FirmwareDigest([0; 32]),
        }
    }
}

impl Config {
    /// Load configuration from the environment, reading `.env` first
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = Config::default();
        if let Ok(path) = env::var("FROST_COORD_DB") {
            config.db_path = path;
        }
        if let Ok(level) = env::var("FROST_COORD_LOG_LEVEL") {
            config.log_level = level;
        }
        config.log_json = env::var("FROST_COORD_LOG_JSON").map(|v| v == "1").unwrap_or(false);

        if let Ok(baud) = env::var("FROST_COORD_BAUD") {
            config.baud = baud
                .parse()
                .map_err(|_| ConfigError::InvalidValue("FROST_COORD_BAUD".into(), baud))?;
        }
        if let Ok(low) = env::var("FROST_COORD_NONCE_LOW_WATER") {
            config.nonce_low_water = low
                .parse()
                .map_err(|_| ConfigError::InvalidValue("FROST_COORD_NONCE_LOW_WATER".into(), low))?;
        }
        if let Ok(target) = env::var("FROST_COORD_NONCE_TARGET") {
            config.nonce_target = target
                .parse()
                .map_err(|_| ConfigError::InvalidValue("FROST_COORD_NONCE_TARGET".into(), target))?;
        }
        if config.nonce_target < config.nonce_low_water {
            return Err(ConfigError::InvalidValue(
                "FROST_COORD_NONCE_TARGET".into(),
                format!(
                    "target {} is below low water {}",
                    config.nonce_target, config.nonce_low_water
                ),
            ));
        }
        if let Ok(digest) = env::var("FROST_COORD_FIRMWARE_DIGEST") {
            config.latest_firmware = digest.parse().map_err(|e: String| {
                ConfigError::InvalidValue("FROST_COORD_FIRMWARE_DIGEST".into(), e)
            })?;
        }

        Ok(config)
    }
}
