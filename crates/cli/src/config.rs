//! Application configuration, persisted as JSON.

use std::path::{Path, PathBuf};

use chatglm_core::{GenerateOption, GenerationConfig};
use serde::{Deserialize, Serialize};

/// Global configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model used when `--model` is not given.
    #[serde(default)]
    pub model: Option<PathBuf>,
    /// Generation defaults; command-line flags override them per call.
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl AppConfig {
    /// Platform config directory: `~/.config/chatglm/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatglm")
    }

    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_file())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_file())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Set one value by its `config set` key.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let option = match key {
            "model" => {
                self.model = Some(PathBuf::from(value));
                return Ok(());
            }
            "max_length" => GenerateOption::MaxLength(value.parse()?),
            "max_context_length" => GenerateOption::MaxContextLength(value.parse()?),
            "do_sample" => GenerateOption::DoSample(value.parse()?),
            "top_k" => GenerateOption::TopK(value.parse()?),
            "top_p" => GenerateOption::TopP(value.parse()?),
            "temperature" => GenerateOption::Temperature(value.parse()?),
            "repetition_penalty" => GenerateOption::RepetitionPenalty(value.parse()?),
            "num_threads" => GenerateOption::NumThreads(value.parse()?),
            _ => anyhow::bail!("Unknown config key: {key}"),
        };

        let mut generation = self.generation.clone();
        option.apply(&mut generation);
        generation.validate()?;
        self.generation = generation;
        Ok(())
    }
}
