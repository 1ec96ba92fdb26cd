use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::coordinator::RetryConfig;
use crate::core::pipeline::Pipeline;
use crate::delegate::{DelegateConfig, InvokerConfig};
use crate::guard::GuardConfig;
use crate::quality::QualityConfig;
use crate::{clog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for file checkpoints. Defaults to `~/.conductor/checkpoints`.
    pub dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub delegates: Vec<DelegateConfig>,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn checkpoints_dir(&self) -> Result<PathBuf> {
        match &self.checkpoints.dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("checkpoints")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: {} stage(s), {} delegate(s), max_retries={}, accept={}",
            config.pipeline.stages.len(),
            config.delegates.len(),
            config.retry.max_retries_per_stage,
            config.quality.accept_threshold
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                clog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let checkpoints = self.checkpoints_dir()?;
        if !checkpoints.exists() {
            clog_debug!("Creating checkpoints directory: {}", checkpoints.display());
            fs::create_dir_all(&checkpoints)?;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        let q = &self.quality;
        if q.revise_floor > q.accept_threshold {
            return Err(Error::Validation(format!(
                "quality.revise_floor {} above accept_threshold {}",
                q.revise_floor, q.accept_threshold
            )));
        }
        if self.invoker.default_timeout_ms == 0 {
            return Err(Error::Validation(
                "invoker.default_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
