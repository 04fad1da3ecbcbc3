//! Model registry: display names mapped to runtime model identifiers
//!
//! Extending the set of supported models means adding an entry to a
//! TOML file pointed at by `LAAMA_MODELS_FILE`:
//!
//! ```toml
//! default = "llama3.1"
//!
//! [[models]]
//! name = "Llama 3.1"
//! id = "llama3.1"
//!
//! [[models]]
//! name = "Mistral"
//! id = "mistral:7b-instruct"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Human-readable name shown in the UI
    pub name: String,

    /// Identifier understood by the model runtime
    pub id: String,
}

impl ModelEntry {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    default: Option<String>,
    models: Vec<ModelEntry>,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
    default_id: String,
}

impl ModelRegistry {
    /// The models shipped with the app
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                ModelEntry::new("Llama 3.1", "llama3.1"),
                ModelEntry::new("Gemma 2", "gemma2"),
            ],
            default_id: "llama3.1".to_string(),
        }
    }

    /// Build a registry from entries; the first entry is the default
    /// unless one is named.
    pub fn new(entries: Vec<ModelEntry>, default_id: Option<String>) -> Result<Self, ConfigError> {
        let Some(first) = entries.first() else {
            return Err(ConfigError::Validation("model registry is empty".into()));
        };
        let default_id = default_id.unwrap_or_else(|| first.id.clone());

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for entry in &entries {
            if entry.id.trim().is_empty() || entry.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "model entries need a name and an id".into(),
                ));
            }
            if !ids.insert(entry.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate model id: {}",
                    entry.id
                )));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate model name: {}",
                    entry.name
                )));
            }
        }

        if !ids.contains(default_id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "default model {default_id} is not in the registry"
            )));
        }

        Ok(Self {
            entries,
            default_id,
        })
    }

    /// Load the registry from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load the registry from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ModelsFile = toml::from_str(content)?;
        Self::new(file.models, file.default)
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Accept either a runtime id or a display name and return the id
    pub fn resolve(&self, name_or_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == name_or_id)
            .or_else(|| self.entries.iter().find(|e| e.name == name_or_id))
            .map(|e| e.id.as_str())
    }

    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_models() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.default_id(), "llama3.1");
        assert_eq!(registry.resolve("Gemma 2"), Some("gemma2"));
        assert_eq!(registry.resolve("gemma2"), Some("gemma2"));
        assert_eq!(registry.display_name("llama3.1"), Some("Llama 3.1"));
        assert_eq!(registry.resolve("gpt-4"), None);
    }

    #[test]
    fn test_parse_models_file() {
        let registry = ModelRegistry::from_toml(
            r#"
default = "mistral"

[[models]]
name = "Llama 3.1"
id = "llama3.1"

[[models]]
name = "Mistral"
id = "mistral"
"#,
        )
        .unwrap();

        assert_eq!(registry.entries().len(), 2);
        assert_eq!(registry.default_id(), "mistral");
        assert!(registry.contains("llama3.1"));
    }

    #[test]
    fn test_first_entry_is_default() {
        let registry = ModelRegistry::from_toml(
            r#"
[[models]]
name = "Phi 3"
id = "phi3"
"#,
        )
        .unwrap();
        assert_eq!(registry.default_id(), "phi3");
    }

    #[test]
    fn test_rejects_invalid_registries() {
        let duplicate = r#"
[[models]]
name = "A"
id = "same"

[[models]]
name = "B"
id = "same"
"#;
        assert!(matches!(
            ModelRegistry::from_toml(duplicate),
            Err(ConfigError::Validation(_))
        ));

        let unknown_default = r#"
default = "missing"

[[models]]
name = "A"
id = "a"
"#;
        assert!(matches!(
            ModelRegistry::from_toml(unknown_default),
            Err(ConfigError::Validation(_))
        ));

        assert!(matches!(
            ModelRegistry::from_toml("models = []"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            ModelRegistry::from_toml("models = 3"),
            Err(ConfigError::Toml(_))
        ));
    }
}
