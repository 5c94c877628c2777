//! Tag → destination mapping and the filesystem checks around it

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedFile {
    pub tag: String,
    pub path: PathBuf,
}

/// Ordered, keys-unique mapping from tag to destination path.
///
/// Insertion order is the order files are requested from the parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedFiles {
    entries: Vec<TaggedFile>,
}

impl TaggedFiles {
    /// Parse `tag:path` pairs. The tag ends at the first `:`.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::Config("at least one tag:path pair is required".into()));
        }
        let mut files = TaggedFiles::default();
        for spec in specs {
            let spec = spec.as_ref();
            let (tag, path) = spec
                .split_once(':')
                .ok_or_else(|| Error::Config(format!("expected tag:path, got {spec:?}")))?;
            if tag.is_empty() {
                return Err(Error::Config(format!("empty tag in {spec:?}")));
            }
            if path.is_empty() {
                return Err(Error::Config(format!("empty path in {spec:?}")));
            }
            files.insert(tag, path)?;
        }
        Ok(files)
    }

    pub fn insert(&mut self, tag: &str, path: impl Into<PathBuf>) -> Result<()> {
        if self.get(tag).is_some() {
            return Err(Error::Config(format!("duplicate tag {tag:?}")));
        }
        self.entries.push(TaggedFile {
            tag: tag.to_string(),
            path: path.into(),
        });
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|f| f.tag == tag)
            .map(|f| f.path.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaggedFile> {
        self.entries.iter()
    }

    pub fn tags(&self) -> Vec<String> {
        self.entries.iter().map(|f| f.tag.clone()).collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|f| f.path.clone()).collect()
    }
}

/// True when every path exists. Existence alone marks a file complete.
pub fn validate_paths<P: AsRef<Path>>(paths: &[P]) -> bool {
    paths.iter().all(|p| p.as_ref().exists())
}

/// Create the parent directory of every destination (recursive, idempotent).
///
/// The destination itself is left absent so [`validate_paths`] stays meaningful.
pub fn create_destination_dirs(files: &TaggedFiles) -> Result<()> {
    for file in files.iter() {
        if let Some(parent) = file.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}
