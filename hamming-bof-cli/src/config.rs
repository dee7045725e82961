//! Build configuration loading
//!
//! An optional JSON file provides the [`IndexConfig`]; command-line flags
//! override individual fields on top of it.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use hamming_bof::IndexConfig;

/// Flags that override the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub num_words: Option<usize>,
    pub seed: Option<u64>,
    pub kmeans_niters: Option<usize>,
    pub show_progress: bool,
}

/// Load the build configuration, falling back to defaults without a file.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<IndexConfig> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => IndexConfig::default(),
    };

    if let Some(num_words) = overrides.num_words {
        config.vocabulary.num_words = num_words;
    }
    if let Some(seed) = overrides.seed {
        config.vocabulary.seed = seed;
    }
    if let Some(niters) = overrides.kmeans_niters {
        config.vocabulary.kmeans_niters = niters;
    }
    config.show_progress |= overrides.show_progress;

    Ok(config)
}

/// Read image ids, one per line. Blank lines and `#` comments are skipped.
pub fn read_image_list(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read image list from {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
