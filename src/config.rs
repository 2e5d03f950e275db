use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

use engine::DeviceFn;
use serde::Deserialize;

use crate::{EstimatorErr, Result};

const WORKING_DIR_VAR: &str = "ESTIMATOR_WORKING_DIR";
const SEED_VAR: &str = "ESTIMATOR_SEED";
const CHIEF_VAR: &str = "ESTIMATOR_CHIEF";

/// The runtime configuration of an estimator.
#[derive(Clone)]
pub struct Configuration {
    working_dir: Option<PathBuf>,
    is_chief: bool,
    random_seed: Option<u64>,
    device_fn: Option<DeviceFn>,
    save_checkpoint_steps: Option<u64>,
    log_loss_steps: Option<u64>,
}

/// The serialized form of a `Configuration`.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConfigFile {
    working_dir: Option<PathBuf>,
    is_chief: bool,
    random_seed: Option<u64>,
    save_checkpoint_steps: Option<u64>,
    log_loss_steps: Option<u64>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            working_dir: None,
            is_chief: true,
            random_seed: None,
            save_checkpoint_steps: None,
            log_loss_steps: None,
        }
    }
}

impl Configuration {
    /// Creates a new `Configuration` for a chief without a working directory.
    pub fn new() -> Self {
        Self {
            working_dir: None,
            is_chief: true,
            random_seed: None,
            device_fn: None,
            save_checkpoint_steps: None,
            log_loss_steps: None,
        }
    }

    /// Parses a configuration from its JSON form.
    ///
    /// # Arguments
    /// * `json` - A JSON object, every field is optional.
    ///
    /// # Returns
    /// The configuration or an error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)?;

        Ok(Self {
            working_dir: file.working_dir,
            is_chief: file.is_chief,
            random_seed: file.random_seed,
            device_fn: None,
            save_checkpoint_steps: file.save_checkpoint_steps,
            log_loss_steps: file.log_loss_steps,
        })
    }

    /// Reads a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Overrides fields with the `ESTIMATOR_*` environment variables that are set.
    ///
    /// # Returns
    /// The updated configuration or an error if a variable can't be parsed.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(WORKING_DIR_VAR) {
            self.working_dir = Some(PathBuf::from(dir));
        }

        if let Some(seed) = lookup(SEED_VAR) {
            let seed = seed.parse().map_err(|e| {
                EstimatorErr::InvalidConfig(format!("{SEED_VAR} must be an integer: {e}"))
            })?;
            self.random_seed = Some(seed);
        }

        if let Some(chief) = lookup(CHIEF_VAR) {
            self.is_chief = match chief.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(EstimatorErr::InvalidConfig(format!(
                        "{CHIEF_VAR} must be a boolean, got {other}"
                    )));
                }
            };
        }

        Ok(self)
    }

    pub fn with_working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_chief(mut self, is_chief: bool) -> Self {
        self.is_chief = is_chief;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Sets the function placing every node of the graph on a device.
    pub fn with_device_fn(mut self, device_fn: DeviceFn) -> Self {
        self.device_fn = Some(device_fn);
        self
    }

    /// Saves a checkpoint every `steps` training steps, requires a working directory.
    pub fn with_save_checkpoint_steps(mut self, steps: u64) -> Self {
        self.save_checkpoint_steps = Some(steps);
        self
    }

    /// Logs the training loss every `steps` training steps.
    pub fn with_log_loss_steps(mut self, steps: u64) -> Self {
        self.log_loss_steps = Some(steps);
        self
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn is_chief(&self) -> bool {
        self.is_chief
    }

    pub fn random_seed(&self) -> Option<u64> {
        self.random_seed
    }

    pub fn device_fn(&self) -> Option<&DeviceFn> {
        self.device_fn.as_ref()
    }

    pub fn save_checkpoint_steps(&self) -> Option<u64> {
        self.save_checkpoint_steps
    }

    pub fn log_loss_steps(&self) -> Option<u64> {
        self.log_loss_steps
    }

    /// Checks the configuration is consistent.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.save_checkpoint_steps == Some(0) || self.log_loss_steps == Some(0) {
            return Err(EstimatorErr::InvalidConfig(
                "step intervals must be greater than 0".into(),
            ));
        }

        if self.save_checkpoint_steps.is_some() && self.working_dir.is_none() {
            return Err(EstimatorErr::InvalidConfig(
                "saving checkpoints requires a working directory".into(),
            ));
        }

        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("working_dir", &self.working_dir)
            .field("is_chief", &self.is_chief)
            .field("random_seed", &self.random_seed)
            .field("device_fn", &self.device_fn.is_some())
            .field("save_checkpoint_steps", &self.save_checkpoint_steps)
            .field("log_loss_steps", &self.log_loss_steps)
            .finish()
    }
}
