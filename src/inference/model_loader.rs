//! Model metadata resolution.
//!
//! Everything the adapter can answer without touching the native handle is
//! resolved here once, at load time: display name, type tag, the file path
//! and the backend variant that were handed to the factory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Backend variant used when none is configured.
pub const DEFAULT_BUILD_VARIANT: &str = "auto";

/// Immutable facts about a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Architecture tag (e.g., "llama", "mpt", "gptj").
    pub model_type: String,

    /// Display name: the model file name.
    pub name: String,

    /// Path handed to the factory.
    pub model_path: PathBuf,

    /// Build variant handed to the factory (e.g., "auto", "cuda", "avxonly").
    pub build_variant: String,

    /// Where the engine looks for its backend libraries.
    pub library_path: String,
}

impl ModelMetadata {
    /// Resolve metadata for `model_path`.
    ///
    /// `type_hint` wins over the file-name heuristics; an empty variant falls
    /// back to [`DEFAULT_BUILD_VARIANT`].
    pub fn resolve(
        model_path: &Path,
        build_variant: &str,
        type_hint: Option<&str>,
        library_path: impl Into<String>,
    ) -> Self {
        let name = model_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let model_type = match type_hint {
            Some(hint) if !hint.trim().is_empty() => hint.trim().to_lowercase(),
            _ => infer_model_type(&name).to_string(),
        };

        let build_variant = if build_variant.trim().is_empty() {
            DEFAULT_BUILD_VARIANT.to_string()
        } else {
            build_variant.trim().to_string()
        };

        Self {
            model_type,
            name,
            model_path: model_path.to_path_buf(),
            build_variant,
            library_path: library_path.into(),
        }
    }
}

/// Guess the architecture from the file name.
pub fn infer_model_type(file_name: &str) -> &'static str {
    let lowered = file_name.to_lowercase();

    if lowered.contains("mpt") {
        "mpt"
    } else if lowered.contains("gptj") || lowered.contains("gpt4all-j") || lowered.contains("gpt-j") {
        "gptj"
    } else if lowered.contains("falcon") {
        "falcon"
    } else if lowered.contains("replit") {
        "replit"
    } else if lowered.contains("bert") || lowered.contains("minilm") || lowered.contains("embed") {
        "bert"
    } else if lowered.contains("starcoder") {
        "starcoder"
    } else {
        // GGUF llama-family covers mistral, orca, hermes, wizard, ...
        "llama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_and_type_from_file_name() {
        let meta = ModelMetadata::resolve(
            Path::new("/models/ggml-mpt-7b-instruct.bin"),
            "auto",
            None,
            "/usr/lib/gpt4all",
        );
        assert_eq!(meta.name, "ggml-mpt-7b-instruct.bin");
        assert_eq!(meta.model_type, "mpt");
        assert_eq!(meta.library_path, "/usr/lib/gpt4all");
    }

    #[test]
    fn test_type_hint_wins() {
        let meta = ModelMetadata::resolve(Path::new("model.gguf"), "cuda", Some(" LLaMA "), "");
        assert_eq!(meta.model_type, "llama");
        assert_eq!(meta.build_variant, "cuda");
    }

    #[test]
    fn test_empty_variant_defaults() {
        let meta = ModelMetadata::resolve(Path::new("all-MiniLM-L6-v2.gguf2.f16.gguf"), " ", None, "");
        assert_eq!(meta.build_variant, DEFAULT_BUILD_VARIANT);
        assert_eq!(meta.model_type, "bert");
    }

    #[test]
    fn test_default_family_is_llama() {
        assert_eq!(infer_model_type("mistral-7b-openorca.Q4_0.gguf"), "llama");
        assert_eq!(infer_model_type("ggml-gpt4all-j-v1.3-groovy.bin"), "gptj");
    }
}
