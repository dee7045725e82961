//! On-disk persistence of an [`IndexState`].
//!
//! One directory per index:
//!
//! | File | Content |
//! |---|---|
//! | `metadata.json` | [`Metadata`] |
//! | `images.json` | image ids in index order |
//! | `vocabulary.npy` | `[K, D]` f32 |
//! | `projection.npy` | `[D', D]` f32 |
//! | `medians.npy` | `[K, D']` f32, zero rows for unpopulated words |
//! | `idf.npy` | `[K]` f32 |
//! | `codes.npy` | word of every corpus descriptor, image-major |
//! | `doclens.npy` | descriptors per image |
//! | `ivf_lengths.npy` | signatures per word |
//! | `ivf_images.npy` | owning image of every stored signature, word-major |
//! | `signatures.npy` | `[total, ceil(D'/8)]` packed signature bytes |
//!
//! Saving writes a sibling staging directory and swaps it into place under
//! an exclusive [`IndexLockGuard`]; loading holds the lock shared.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ndarray::{s, Array1, Array2};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};

use crate::embedding::BinarySignature;
use crate::error::{Error, Result};
use crate::index::{IndexState, Metadata, FORMAT_VERSION};
use crate::ivf::{InvertedIndex, InvertedListEntry};
use crate::lock::{lock_path, IndexLockGuard};
use crate::projection::ProjectionMatrix;
use crate::utils::packed_len;
use crate::weights::WeightTable;

const METADATA: &str = "metadata.json";
const IMAGES: &str = "images.json";
const VOCABULARY: &str = "vocabulary.npy";
const PROJECTION: &str = "projection.npy";
const MEDIANS: &str = "medians.npy";
const IDF: &str = "idf.npy";
const CODES: &str = "codes.npy";
const DOCLENS: &str = "doclens.npy";
const IVF_LENGTHS: &str = "ivf_lengths.npy";
const IVF_IMAGES: &str = "ivf_images.npy";
const SIGNATURES: &str = "signatures.npy";

/// Handle on an index directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a saved index is present.
    pub fn exists(&self) -> bool {
        self.path.join(METADATA).is_file()
    }

    /// Persist `state`, replacing any index already stored here.
    pub fn save(&self, state: &IndexState) -> Result<()> {
        let _guard = IndexLockGuard::acquire(&self.path)?;

        let staging = self.sibling("staging")?;
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        if let Err(e) = write_state(&staging, state) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let old = self.sibling("old")?;
        if old.exists() {
            fs::remove_dir_all(&old)?;
        }
        if self.path.exists() {
            fs::rename(&self.path, &old)?;
        }
        fs::rename(&staging, &self.path)?;
        if old.exists() {
            fs::remove_dir_all(&old)?;
        }

        tracing::info!(
            path = %self.path.display(),
            images = state.num_images(),
            signatures = state.ivf().num_signatures(),
            "Index saved"
        );
        Ok(())
    }

    /// Load the stored index fully into memory.
    pub fn load(&self) -> Result<IndexState> {
        self.ensure_dir()?;
        let _guard = IndexLockGuard::acquire_shared(&self.path)?;
        let state = read_state(&self.path)?;

        tracing::info!(
            path = %self.path.display(),
            images = state.num_images(),
            words = state.num_words(),
            "Index loaded"
        );
        Ok(state)
    }

    /// Read only `metadata.json`.
    pub fn metadata(&self) -> Result<Metadata> {
        self.ensure_dir()?;
        let _guard = IndexLockGuard::acquire_shared(&self.path)?;
        read_json(&self.path, METADATA)
    }

    /// Reads never create the lock file of an index that was never saved.
    ///
    /// A save leaves its lock file behind, so while one swaps directories
    /// the reader still waits on the lock and re-checks the directory.
    fn ensure_dir(&self) -> Result<()> {
        if self.path.is_dir() || lock_path(&self.path)?.is_file() {
            Ok(())
        } else {
            Err(Error::CorruptIndex(format!(
                "no index directory at {}",
                self.path.display()
            )))
        }
    }

    fn sibling(&self, suffix: &str) -> Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Config(format!(
                    "index path '{}' has no usable directory name",
                    self.path.display()
                ))
            })?;
        Ok(self
            .path
            .with_file_name(format!(".{}.{}", name, suffix)))
    }
}

fn write_state(dir: &Path, state: &IndexState) -> Result<()> {
    let num_words = state.num_words();
    let projected_dim = state.projected_dim();
    let ivf = state.ivf();

    serde_json::to_writer_pretty(create(dir, METADATA)?, &state.metadata())?;
    serde_json::to_writer(create(dir, IMAGES)?, state.image_ids())?;

    state.vocabulary().write_npy(create(dir, VOCABULARY)?)?;
    state.projection().view().write_npy(create(dir, PROJECTION)?)?;
    state.weights().as_array().write_npy(create(dir, IDF)?)?;

    let mut medians = Array2::<f32>::zeros((num_words, projected_dim));
    for (word, entry) in ivf.entries().iter().enumerate() {
        if let Some(median) = entry.median_view() {
            medians.row_mut(word).assign(&median);
        }
    }
    medians.write_npy(create(dir, MEDIANS)?)?;

    let codes: Array1<u64> = state
        .assignments()
        .iter()
        .flat_map(|words| words.iter().map(|&w| w as u64))
        .collect();
    codes.write_npy(create(dir, CODES)?)?;

    let doclens: Array1<u64> = state
        .assignments()
        .iter()
        .map(|words| words.len() as u64)
        .collect();
    doclens.write_npy(create(dir, DOCLENS)?)?;

    let ivf_lengths: Array1<u64> = ivf.entries().iter().map(|e| e.len() as u64).collect();
    ivf_lengths.write_npy(create(dir, IVF_LENGTHS)?)?;

    let ivf_images: Array1<u64> = ivf
        .entries()
        .iter()
        .flat_map(|e| e.images.iter().map(|&m| m as u64))
        .collect();
    ivf_images.write_npy(create(dir, IVF_IMAGES)?)?;

    let width = packed_len(projected_dim);
    let total = ivf.num_signatures();
    let mut signatures = Array2::<u8>::zeros((total, width));
    let all = ivf.entries().iter().flat_map(|e| e.signatures.iter());
    for (mut row, sig) in signatures.outer_iter_mut().zip(all) {
        row.assign(&ndarray::ArrayView1::from(sig.as_bytes()));
    }
    signatures.write_npy(create(dir, SIGNATURES)?)?;

    Ok(())
}

fn read_state(dir: &Path) -> Result<IndexState> {
    if !dir.is_dir() {
        return Err(Error::CorruptIndex(format!(
            "no index directory at {}",
            dir.display()
        )));
    }

    let metadata: Metadata = read_json(dir, METADATA)?;
    if metadata.format_version != FORMAT_VERSION {
        return Err(Error::CorruptIndex(format!(
            "unsupported format version {} (expected {})",
            metadata.format_version, FORMAT_VERSION
        )));
    }

    let image_ids: Vec<String> = read_json(dir, IMAGES)?;
    let vocabulary: Array2<f32> = read_npy(dir, VOCABULARY)?;
    let projection: Array2<f32> = read_npy(dir, PROJECTION)?;
    let medians: Array2<f32> = read_npy(dir, MEDIANS)?;
    let idf: Array1<f32> = read_npy(dir, IDF)?;
    let codes: Array1<u64> = read_npy(dir, CODES)?;
    let doclens: Array1<u64> = read_npy(dir, DOCLENS)?;
    let ivf_lengths: Array1<u64> = read_npy(dir, IVF_LENGTHS)?;
    let ivf_images: Array1<u64> = read_npy(dir, IVF_IMAGES)?;
    let signatures: Array2<u8> = read_npy(dir, SIGNATURES)?;

    let num_words = vocabulary.nrows();
    let dim = vocabulary.ncols();
    let projected_dim = projection.nrows();
    let num_images = image_ids.len();

    check(num_words > 0, || "vocabulary is empty".into())?;
    check(projection.ncols() == dim, || {
        format!(
            "projection has {} columns, vocabulary has {}",
            projection.ncols(),
            dim
        )
    })?;
    check(medians.dim() == (num_words, projected_dim), || {
        format!(
            "medians have shape {:?}, expected {:?}",
            medians.dim(),
            (num_words, projected_dim)
        )
    })?;
    check(idf.len() == num_words, || {
        format!("idf has {} entries for {} words", idf.len(), num_words)
    })?;
    check(ivf_lengths.len() == num_words, || {
        format!(
            "ivf_lengths has {} entries for {} words",
            ivf_lengths.len(),
            num_words
        )
    })?;
    check(doclens.len() == num_images, || {
        format!(
            "doclens has {} entries for {} images",
            doclens.len(),
            num_images
        )
    })?;

    let num_descriptors = checked_total(&doclens, DOCLENS)?;
    check(codes.len() == num_descriptors, || {
        format!(
            "codes has {} entries, doclens sum to {}",
            codes.len(),
            num_descriptors
        )
    })?;
    let num_signatures = checked_total(&ivf_lengths, IVF_LENGTHS)?;
    check(ivf_images.len() == num_signatures, || {
        format!(
            "ivf_images has {} entries, ivf_lengths sum to {}",
            ivf_images.len(),
            num_signatures
        )
    })?;
    check(signatures.nrows() == num_signatures, || {
        format!(
            "{} signatures stored, ivf_lengths sum to {}",
            signatures.nrows(),
            num_signatures
        )
    })?;
    check(num_signatures == num_descriptors, || {
        format!(
            "{} signatures stored for {} descriptors",
            num_signatures, num_descriptors
        )
    })?;
    check(signatures.ncols() == packed_len(projected_dim), || {
        format!(
            "signatures are {} bytes wide, expected {}",
            signatures.ncols(),
            packed_len(projected_dim)
        )
    })?;
    if let Some(&word) = codes.iter().find(|&&w| w as usize >= num_words) {
        return Err(Error::CorruptIndex(format!(
            "code {} out of range for {} words",
            word, num_words
        )));
    }
    if let Some(&image) = ivf_images.iter().find(|&&m| m as usize >= num_images) {
        return Err(Error::CorruptIndex(format!(
            "ivf image {} out of range for {} images",
            image, num_images
        )));
    }

    let expected = Metadata {
        format_version: FORMAT_VERSION,
        num_images,
        num_words,
        populated_words: ivf_lengths.iter().filter(|&&l| l > 0).count(),
        descriptor_dim: dim,
        projected_dim,
        num_descriptors,
    };
    check(metadata == expected, || {
        format!(
            "metadata {:?} does not match stored arrays {:?}",
            metadata, expected
        )
    })?;

    // Lengths are bounded by their checked totals, so every slice is in range.
    let mut assignments = Vec::with_capacity(num_images);
    let mut offset = 0usize;
    for &len in doclens.iter() {
        let len = len as usize;
        let words: Array1<usize> = codes
            .slice(s![offset..offset + len])
            .iter()
            .map(|&w| w as usize)
            .collect();
        assignments.push(words);
        offset += len;
    }

    // Inverted lists are filled image-major, so the codes fully determine
    // which image owns every stored signature.
    let mut owners: Vec<Vec<u64>> = vec![Vec::new(); num_words];
    for (image, words) in assignments.iter().enumerate() {
        for &word in words.iter() {
            owners[word].push(image as u64);
        }
    }
    for (word, (expected, &stored)) in owners.iter().zip(ivf_lengths.iter()).enumerate() {
        check(expected.len() as u64 == stored, || {
            format!(
                "word {} has {} stored signatures, codes assign it {}",
                word,
                stored,
                expected.len()
            )
        })?;
    }
    if let Some(row) = owners
        .iter()
        .flatten()
        .zip(ivf_images.iter())
        .position(|(expected, stored)| expected != stored)
    {
        return Err(Error::CorruptIndex(format!(
            "ivf image of signature {} does not match the codes",
            row
        )));
    }

    let mut entries = Vec::with_capacity(num_words);
    let mut offset = 0usize;
    for (word, &len) in ivf_lengths.iter().enumerate() {
        let len = len as usize;
        let median = (len > 0).then(|| medians.row(word).to_owned());
        let mut entry = InvertedListEntry::new(median);
        for row in offset..offset + len {
            let bytes = signatures.row(row).to_vec();
            let signature = BinarySignature::from_packed(bytes, projected_dim)
                .map_err(|e| Error::CorruptIndex(format!("signature {}: {}", row, e)))?;
            entry.signatures.push(signature);
            entry.images.push(ivf_images[row] as usize);
        }
        entries.push(entry);
        offset += len;
    }

    if let Some(word) = idf.iter().position(|v| !v.is_finite() || *v <= 0.0) {
        return Err(Error::CorruptIndex(format!(
            "idf of word {} is {}",
            word, idf[word]
        )));
    }
    let weights = WeightTable::from_assignments(&assignments, num_words)?;
    check(weights.as_array() == idf.view(), || {
        "idf does not match the document frequencies of the codes".into()
    })?;

    let projection = ProjectionMatrix::new(projection)
        .map_err(|e| Error::CorruptIndex(format!("projection: {}", e)))?;
    let ivf = InvertedIndex::from_entries(entries, projected_dim);

    Ok(IndexState::from_parts(
        image_ids,
        assignments,
        weights,
        vocabulary,
        projection,
        ivf,
    ))
}

/// Sum of a stored length array, rejecting totals that overflow.
fn checked_total(lengths: &Array1<u64>, name: &str) -> Result<usize> {
    lengths
        .iter()
        .try_fold(0u64, |total, &len| total.checked_add(len))
        .and_then(|total| usize::try_from(total).ok())
        .ok_or_else(|| Error::CorruptIndex(format!("{} sums past the addressable range", name)))
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::CorruptIndex(message()))
    }
}

fn create(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(dir.join(name))?))
}

fn open(dir: &Path, name: &str) -> Result<BufReader<File>> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(Error::CorruptIndex(format!("missing {}", name)));
    }
    Ok(BufReader::new(File::open(&path)?))
}

fn read_json<T: serde::de::DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    serde_json::from_reader(open(dir, name)?)
        .map_err(|e| Error::CorruptIndex(format!("failed to parse {}: {}", name, e)))
}

fn read_npy<T: ReadNpyExt>(dir: &Path, name: &str) -> Result<T> {
    T::read_npy(open(dir, name)?)
        .map_err(|e| Error::CorruptIndex(format!("failed to read {}: {}", name, e)))
}
