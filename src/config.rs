//! Runtime configuration
//!
//! Loaded from `narrative.toml` (or the file named by `NARRATIVE_CONFIG`).
//! Every field has a default so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NarrativeError, Result};

pub const CONFIG_ENV: &str = "NARRATIVE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "narrative.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeConfig {
    pub replication: ReplicationConfig,
    pub dialogue: DialogueTiming,
    pub server: ServerConfig,
    pub autosave: AutosaveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Log entries older than this are pruned on the next append
    pub stale_after_secs: f64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30.0,
        }
    }
}

/// How long dialogue lines stay on screen when no voice clip drives them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueTiming {
    pub letters_per_second: f32,
    pub min_display_secs: f32,
    pub player_line_secs: f32,
}

impl Default for DialogueTiming {
    fn default() -> Self {
        Self {
            letters_per_second: 25.0,
            min_display_secs: 2.0,
            player_line_secs: 1.0,
        }
    }
}

impl DialogueTiming {
    /// Display time for an NPC line of text
    pub fn line_display_time(&self, text: &str) -> Duration {
        let letters = text.chars().count() as f32;
        let reading = if self.letters_per_second > 0.0 {
            letters / self.letters_per_second
        } else {
            0.0
        };
        Duration::from_secs_f32(reading.max(self.min_display_secs).max(0.0))
    }

    pub fn player_line_time(&self) -> Duration {
        Duration::from_secs_f32(self.player_line_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub autosave_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:2567".to_string(),
            data_dir: PathBuf::from("data"),
            database_url: "sqlite:narrative.db?mode=rwc".to_string(),
            autosave_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Flag the component for saving whenever a quest changes state
    pub on_quest_updated: bool,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            on_quest_updated: true,
        }
    }
}

impl NarrativeConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NarrativeError::Parse {
            path: "<config>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| NarrativeError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Resolve the config file from the environment, falling back to defaults
    /// when the file does not exist.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            warn!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let config = Self::load(&path)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }
}
