/// Named byte-stream provider the player reads WAV files from.
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

static PLAYABLE_EXTENSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\.wav$").expect("valid extension pattern"));

const READ_BUFFER_SIZE: usize = 64 * 1024;

type Result<T> = std::result::Result<T, AssetError>;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Asset '{name}' not found in '{category}'")]
    NotFound { category: String, name: String },

    #[error("Invalid asset name '{name}'")]
    InvalidName { name: String },

    #[error("Asset I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type AssetStream = Box<dyn Read + Send>;

/// Lists and opens named byte streams grouped by category.
pub trait AssetSource: Send + Sync {
    /// Playable names under `category`, sorted.
    fn list(&self, category: &str) -> Result<Vec<String>>;

    fn open(&self, category: &str, name: &str) -> Result<AssetStream>;
}

/// Assets stored as files in `<root>/<category>/`.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn category_dir(&self, category: &str) -> Result<PathBuf> {
        validate_name(category)?;
        Ok(self.root.join(category))
    }
}

impl AssetSource for DirectoryAssets {
    fn list(&self, category: &str) -> Result<Vec<String>> {
        let dir = self.category_dir(category)?;
        let entries = std::fs::read_dir(&dir).map_err(|e| AssetError::Io { path: dir.clone(), source: e })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AssetError::Io { path: dir.clone(), source: e })?;

            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("Skipping asset with a non UTF-8 name in {:?}", dir);
                continue;
            };

            if is_file && PLAYABLE_EXTENSION.is_match(&name) && is_plain_name(&name) {
                names.push(name);
            }
        }

        debug!("Found {} playable assets in {:?}", names.len(), dir);
        Ok(names.into_iter().sorted().collect())
    }

    fn open(&self, category: &str, name: &str) -> Result<AssetStream> {
        validate_name(name)?;
        let path = self.category_dir(category)?.join(name);

        match File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AssetError::NotFound {
                category: category.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(AssetError::Io { path, source: e }),
        }
    }
}

// Plain file names only: no separators, no hidden or parent entries
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0'])
}

fn validate_name(name: &str) -> Result<()> {
    if !is_plain_name(name) {
        return Err(AssetError::InvalidName { name: name.to_string() });
    }

    Ok(())
}
