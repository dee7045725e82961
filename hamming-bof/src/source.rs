//! Upstream descriptor sources.
//!
//! Local feature extraction lives outside this crate. A [`DescriptorSource`]
//! turns an image identifier into its `[n, D]` matrix of local descriptors;
//! the index only requires that it is deterministic per image if rebuilds
//! must be reproducible.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use ndarray_npy::ReadNpyExt;

use crate::error::{Error, Result};

/// Provides the local descriptors of an image.
pub trait DescriptorSource: Send + Sync {
    /// Ordered descriptors of `image_id`, shape `[n, D]`.
    fn descriptors(&self, image_id: &str) -> Result<Array2<f32>>;
}

/// Reads `<dir>/<image_id>.npy`, each a 2-D `f32` array.
#[derive(Debug, Clone)]
pub struct NpyDescriptorSource {
    dir: PathBuf,
}

impl NpyDescriptorSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding the descriptors of `image_id`.
    ///
    /// Ids must name a single file inside the directory: empty ids, `.`,
    /// `..` and ids containing a path separator are rejected.
    pub fn path_for(&self, image_id: &str) -> Result<PathBuf> {
        let escapes = image_id.is_empty()
            || image_id == "."
            || image_id == ".."
            || image_id.contains(['/', '\\']);
        if escapes {
            return Err(Error::Source {
                image_id: image_id.to_string(),
                message: "invalid image id: must be a plain file name".into(),
            });
        }
        Ok(self.dir.join(format!("{}.npy", image_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Image ids of every `.npy` file directly under the directory, sorted.
    pub fn list_images(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("npy") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl DescriptorSource for NpyDescriptorSource {
    fn descriptors(&self, image_id: &str) -> Result<Array2<f32>> {
        let path = self.path_for(image_id)?;
        let source_error = |message: String| Error::Source {
            image_id: image_id.to_string(),
            message,
        };

        let file = File::open(&path)
            .map_err(|e| source_error(format!("failed to open {}: {}", path.display(), e)))?;
        Array2::<f32>::read_npy(BufReader::new(file))
            .map_err(|e| source_error(format!("failed to read {}: {}", path.display(), e)))
    }
}

/// Descriptors held in memory, keyed by image id.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    images: HashMap<String, Array2<f32>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_id: impl Into<String>, descriptors: Array2<f32>) {
        self.images.insert(image_id.into(), descriptors);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl DescriptorSource for InMemorySource {
    fn descriptors(&self, image_id: &str) -> Result<Array2<f32>> {
        self.images
            .get(image_id)
            .cloned()
            .ok_or_else(|| Error::Source {
                image_id: image_id.to_string(),
                message: "unknown image".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_npy::WriteNpyExt;
    use tempfile::TempDir;

    #[test]
    fn test_npy_source_reads_and_lists() {
        let dir = TempDir::new().unwrap();
        let a = array![[1.0f32, 2.0], [3.0, 4.0]];
        a.write_npy(File::create(dir.path().join("b.npy")).unwrap())
            .unwrap();
        a.write_npy(File::create(dir.path().join("a.npy")).unwrap())
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = NpyDescriptorSource::new(dir.path());
        assert_eq!(source.list_images().unwrap(), vec!["a", "b"]);
        assert_eq!(source.descriptors("a").unwrap(), a);
    }

    #[test]
    fn test_npy_source_missing_image() {
        let dir = TempDir::new().unwrap();
        let source = NpyDescriptorSource::new(dir.path());

        match source.descriptors("missing") {
            Err(Error::Source { image_id, .. }) => assert_eq!(image_id, "missing"),
            other => panic!("expected Source error, got {:?}", other),
        }
    }

    #[test]
    fn test_npy_source_rejects_ids_outside_directory() {
        let root = TempDir::new().unwrap();
        let inner = root.path().join("descriptors");
        std::fs::create_dir(&inner).unwrap();
        array![[1.0f32, 2.0]]
            .write_npy(File::create(root.path().join("x.npy")).unwrap())
            .unwrap();

        let source = NpyDescriptorSource::new(&inner);
        for id in ["../x", "a/b", "a\\b", "..", ".", ""] {
            match source.descriptors(id) {
                Err(Error::Source { image_id, message }) => {
                    assert_eq!(image_id, id);
                    assert!(message.contains("invalid image id"), "{}", message);
                }
                other => panic!("expected Source error for {:?}, got {:?}", id, other),
            }
        }
        assert_eq!(
            source.path_for("img_01.v2").unwrap(),
            inner.join("img_01.v2.npy")
        );
    }

    #[test]
    fn test_in_memory_source() {
        let mut source = InMemorySource::new();
        source.insert("x", Array2::zeros((3, 4)));

        assert_eq!(source.len(), 1);
        assert_eq!(source.descriptors("x").unwrap().dim(), (3, 4));
        assert!(source.descriptors("y").is_err());
    }
}
