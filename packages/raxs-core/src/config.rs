//! Store configuration.
//!
//! The config is usually loaded from a TOML file with [`StoreConfig::load`];
//! [`StoreConfig::for_path`] builds one for a directory in code.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::DEWEY_MODEL;

const DEFAULT_CONTENT: &str = "content.xml";
const DEFAULT_HISTORY: &str = "history";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Store root directory. Relative paths in a config file are resolved
    /// against the file's directory.
    pub root: PathBuf,
    /// Document path, relative to `root`.
    #[serde(default = "default_content")]
    pub content_path: PathBuf,
    /// History directory, relative to `root`.
    ///
    /// `None` turns versioning off. Files spell it as an empty string.
    #[serde(default = "default_history", with = "history_path")]
    pub history_path: Option<PathBuf>,
    /// Name of the tree model in the registry.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_content() -> PathBuf {
    PathBuf::from(DEFAULT_CONTENT)
}

fn default_history() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_HISTORY))
}

fn default_model() -> String {
    DEWEY_MODEL.to_string()
}

mod history_path {
    use std::path::PathBuf;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        match path {
            Some(path) => path.serialize(s),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        let path = PathBuf::deserialize(d)?;
        Ok(Some(path).filter(|p| !p.as_os_str().is_empty()))
    }
}

impl StoreConfig {
    /// A directory holds `content.xml` and `history/`; a file path names the
    /// document itself, with its history next to it.
    pub fn for_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let is_document = path.extension().is_some() && !path.is_dir();
        let (root, content_path) = match (is_document, path.file_name()) {
            (true, Some(name)) => (crate::store::parent_dir(path).to_path_buf(), PathBuf::from(name)),
            _ => (path.to_path_buf(), default_content()),
        };
        Self {
            root,
            content_path,
            history_path: default_history(),
            model: default_model(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn without_history(mut self) -> Self {
        self.history_path = None;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid store config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        if config.root.is_relative() {
            config.root = crate::store::parent_dir(path).join(&config.root);
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(format!("cannot serialize store config: {e}")))
    }

    pub fn content_file(&self) -> PathBuf {
        self.root.join(&self.content_path)
    }

    /// `None` when versioning is off.
    pub fn history_dir(&self) -> Option<PathBuf> {
        self.history_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| self.root.join(p))
    }

    pub fn validate(&self) -> Result<()> {
        if self.content_path.as_os_str().is_empty() {
            return Err(Error::Config("content_path must not be empty".into()));
        }
        if self.model.is_empty() {
            return Err(Error::Config("model must not be empty".into()));
        }
        if let Some(history) = self.history_dir() {
            if history == self.content_file() {
                return Err(Error::Config(
                    "history_path and content_path name the same file".into(),
                ));
            }
        }
        Ok(())
    }
}
