//! Story loader - YAML file loading and parsing

use super::types::StoryDefinition;
use crate::sdk::error::StoryError;
use std::fs;
use std::path::Path;

/// Loads story definitions from YAML files
pub struct StoryLoader;

impl StoryLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a story definition from a YAML file
    pub fn load_story<P: AsRef<Path>>(&self, path: P) -> Result<StoryDefinition, StoryError> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// Parse a story definition from a YAML string
    pub fn parse_yaml(content: &str) -> Result<StoryDefinition, StoryError> {
        let def: StoryDefinition = serde_yaml::from_str(content)?;
        Ok(def)
    }

    /// Load every `.yaml`/`.yml` file of a directory, sorted by file name
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<StoryDefinition>, StoryError> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        let mut stories = Vec::with_capacity(paths.len());
        for path in paths {
            log::debug!("Loading story file {}", path.display());
            stories.push(self.load_story(&path)?);
        }
        Ok(stories)
    }
}

impl Default for StoryLoader {
    fn default() -> Self {
        Self::new()
    }
}
