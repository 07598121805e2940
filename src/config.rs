use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::cipher::{KdfParams, PBKDF2_ITERATIONS};
use crate::crypto::identity::MIN_RSA_BITS;
use crate::errors::{GistError, Result};
use crate::identity::custody::CustodyOptions;

/// Prefix for environment overrides, e.g. `GIST_KDF_ITERATIONS=200000`.
pub const ENV_PREFIX: &str = "GIST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the CLI keeps the device store and the local directory file.
    pub data_dir: PathBuf,
    /// PBKDF2 rounds for new envelopes. Changing this breaks decryption of
    /// envelopes written with a different value.
    pub kdf_iterations: u32,
    pub rsa_key_bits: usize,
    pub directory_cache_ttl_secs: u64,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("gist"),
            kdf_iterations: PBKDF2_ITERATIONS,
            rsa_key_bits: MIN_RSA_BITS,
            directory_cache_ttl_secs: 30,
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, an optional TOML file and `GIST_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| GistError::Config(e.to_string()))?;

        let cfg: AppConfig = settings
            .try_deserialize()
            .map_err(|e| GistError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations < PBKDF2_ITERATIONS {
            return Err(GistError::Config(format!(
                "kdf_iterations must be at least {PBKDF2_ITERATIONS}"
            )));
        }
        if self.rsa_key_bits < MIN_RSA_BITS {
            return Err(GistError::Config(format!(
                "rsa_key_bits must be at least {MIN_RSA_BITS}"
            )));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GistError::Config(e.to_string()))
    }

    pub fn custody_options(&self) -> Result<CustodyOptions> {
        Ok(CustodyOptions {
            kdf: KdfParams::new(self.kdf_iterations)?,
            rsa_key_bits: self.rsa_key_bits,
        })
    }

    pub fn directory_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.directory_cache_ttl_secs)
    }

    pub fn device_store_path(&self) -> PathBuf {
        self.data_dir.join("device.bin")
    }

    pub fn directory_path(&self) -> PathBuf {
        self.data_dir.join("directory.json")
    }
}
