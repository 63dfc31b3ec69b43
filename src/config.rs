//! Runtime configuration for llmodel-bridge.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Missing fields fall back to their defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::inference::model_loader::DEFAULT_BUILD_VARIANT;
use crate::inference::native::PromptOptions;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llmodel-bridge", about = "Bridge to the llmodel native inference engine")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the model path from the configuration file.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the OpenAI-compatible HTTP API.
    Serve {
        /// HTTP listen address (overrides the configuration file).
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run one prompt and stream the answer to stdout.
    Prompt {
        /// Prompt text.
        text: String,

        /// Maximum tokens to generate.
        #[arg(long)]
        max_tokens: Option<i32>,

        /// Sampling temperature.
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Print the embedding of a text as JSON.
    Embed {
        /// Text to embed.
        text: String,
    },

    /// List GPU devices able to hold the model.
    Gpus,

    /// Print model metadata and native state.
    Info,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model configuration.
    pub model: ModelConfig,

    /// Default sampling parameters.
    pub generation: PromptOptions,

    /// HTTP server configuration.
    pub server: ServerConfig,
}

/// Model loading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the model file.
    pub model_path: PathBuf,

    /// Backend build variant ("auto", "default", "avxonly", "cuda", "kompute", "metal").
    pub build_variant: String,

    /// Architecture tag; inferred from the file name when absent.
    pub model_type: Option<String>,

    /// Directory searched for backend implementation libraries.
    pub library_path: Option<PathBuf>,

    /// Context size in tokens.
    pub n_ctx: i32,

    /// Number of layers to offload to the GPU.
    pub n_gpu_layers: i32,

    /// Device selector ("cpu", "gpu", "amd", "nvidia", "intel" or a device name).
    pub device: String,

    /// Thread count applied after loading (engine default when absent).
    pub threads: Option<i32>,

    /// Maximum prompts running or queued on this model at once.
    pub max_queued_prompts: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            build_variant: DEFAULT_BUILD_VARIANT.to_string(),
            model_type: None,
            library_path: None,
            n_ctx: 2048,
            n_gpu_layers: 100,
            device: "cpu".to_string(),
            threads: None,
            max_queued_prompts: 8,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:4891").
    pub listen: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4891".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.generation.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.model.build_variant, "auto");
        assert_eq!(cfg.model.device, "cpu");
        assert_eq!(cfg.server.listen, "127.0.0.1:4891");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"model": {"model_path": "/models/orca.gguf", "threads": 6}, "generation": {"temp": 0.2}}"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.model.model_path, PathBuf::from("/models/orca.gguf"));
        assert_eq!(cfg.model.threads, Some(6));
        assert_eq!(cfg.model.n_ctx, 2048);
        assert_eq!(cfg.generation.temp, 0.2);
        assert_eq!(cfg.generation.top_k, PromptOptions::default().top_k);
    }

    #[test]
    fn test_invalid_generation_defaults_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"generation": {"top_p": 3.0}}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(cfg.model.max_queued_prompts, 8);
    }
}
