//! Index state and the build pipeline.
//!
//! Building runs once over the whole corpus:
//!
//! 1. train the visual vocabulary (k-means over every descriptor),
//! 2. assign each descriptor to its nearest visual word,
//! 3. project descriptors with the fixed projection matrix,
//! 4. compute per-word medians of the projected descriptors,
//! 5. binarize every projected descriptor against its word's median,
//! 6. fill the inverted lists and compute idf weights.
//!
//! Steps 2, 3 and 5 run per image in parallel. Step 6 merges the per-image
//! results in corpus order, so the result is deterministic for a fixed
//! vocabulary.

use std::borrow::Cow;
use std::collections::HashSet;

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::embedding::{compute_medians, embed_descriptors, BinarySignature};
use crate::error::{Error, Result};
use crate::ivf::InvertedIndex;
use crate::kmeans::{assign_words, build_vocabulary, VocabularyConfig};
use crate::projection::ProjectionMatrix;
use crate::source::DescriptorSource;
use crate::utils::concat_rows;
use crate::weights::WeightTable;

/// Version of the on-disk layout written by [`crate::store::IndexStore`].
pub const FORMAT_VERSION: u32 = 1;

/// Configuration for index creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Vocabulary (k-means) settings
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
    /// Display a progress bar while embedding the corpus
    #[serde(default)]
    pub show_progress: bool,
}

/// Summary of an index, persisted as `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub format_version: u32,
    /// Number of indexed images
    pub num_images: usize,
    /// Vocabulary size K
    pub num_words: usize,
    /// Words that received at least one descriptor
    pub populated_words: usize,
    /// Descriptor dimension D
    pub descriptor_dim: usize,
    /// Projected dimension D' (signature length in bits)
    pub projected_dim: usize,
    /// Total number of corpus descriptors (= stored signatures)
    pub num_descriptors: usize,
}

/// The complete, immutable state of a built index.
///
/// This is the unit of persistence and the only input of the query path:
/// medians, projection and weights used at query time always come from here.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexState {
    image_ids: Vec<String>,
    assignments: Vec<Array1<usize>>,
    weights: WeightTable,
    vocabulary: Array2<f32>,
    projection: ProjectionMatrix,
    ivf: InvertedIndex,
}

impl IndexState {
    /// Build an index by pulling every image's descriptors from `source`.
    ///
    /// # Arguments
    ///
    /// * `image_ids` - Corpus image identifiers, in index order
    /// * `source` - Descriptor extraction collaborator
    /// * `projection` - Fixed `[D', D]` projection matrix
    /// * `config` - Index configuration
    pub fn build<S>(
        image_ids: Vec<String>,
        source: &S,
        projection: ProjectionMatrix,
        config: &IndexConfig,
    ) -> Result<Self>
    where
        S: DescriptorSource + ?Sized,
    {
        tracing::info!(images = image_ids.len(), "Extracting corpus descriptors");

        let descriptors: Vec<Array2<f32>> = image_ids
            .par_iter()
            .map(|id| source.descriptors(id))
            .collect::<Result<_>>()?;

        Self::from_descriptors(image_ids, &descriptors, projection, config)
    }

    /// Build an index from in-memory descriptors, training the vocabulary.
    pub fn from_descriptors(
        image_ids: Vec<String>,
        descriptors: &[Array2<f32>],
        projection: ProjectionMatrix,
        config: &IndexConfig,
    ) -> Result<Self> {
        validate_corpus(&image_ids, descriptors, projection.input_dim())?;

        let flat = concat_rows(descriptors, projection.input_dim())?;
        let vocabulary = build_vocabulary(&flat.view(), &config.vocabulary)?;

        Self::from_vocabulary(image_ids, descriptors, vocabulary, projection, config)
    }

    /// Build an index with a caller-supplied vocabulary.
    pub fn from_vocabulary(
        image_ids: Vec<String>,
        descriptors: &[Array2<f32>],
        vocabulary: Array2<f32>,
        projection: ProjectionMatrix,
        config: &IndexConfig,
    ) -> Result<Self> {
        validate_corpus(&image_ids, descriptors, projection.input_dim())?;
        validate_vocabulary(&vocabulary.view(), projection.input_dim())?;

        let assignments: Vec<Array1<usize>> = descriptors
            .par_iter()
            .map(|d| assign_words(&d.view(), &vocabulary.view()))
            .collect::<Result<_>>()?;

        Self::from_assignments(
            image_ids,
            descriptors,
            assignments,
            vocabulary,
            projection,
            config,
        )
    }

    /// Build an index from descriptors whose word assignments are already known.
    ///
    /// # Arguments
    ///
    /// * `image_ids` - Corpus image identifiers
    /// * `descriptors` - Per-image descriptors, each `[n_i, D]`
    /// * `assignments` - Per-image word ids, each of length `n_i`
    /// * `vocabulary` - `[K, D]` vocabulary the assignments refer to
    /// * `projection` - `[D', D]` projection matrix
    /// * `config` - Index configuration
    pub fn from_assignments(
        image_ids: Vec<String>,
        descriptors: &[Array2<f32>],
        assignments: Vec<Array1<usize>>,
        vocabulary: Array2<f32>,
        projection: ProjectionMatrix,
        config: &IndexConfig,
    ) -> Result<Self> {
        let dim = projection.input_dim();
        let projected_dim = projection.output_dim();
        validate_corpus(&image_ids, descriptors, dim)?;
        validate_vocabulary(&vocabulary.view(), dim)?;

        if assignments.len() != descriptors.len() {
            return Err(Error::dimension(
                "word assignments",
                descriptors.len(),
                assignments.len(),
            ));
        }
        for (image, (words, d)) in assignments.iter().zip(descriptors).enumerate() {
            if words.len() != d.nrows() {
                return Err(Error::dimension(
                    format!("word assignments of image '{}'", image_ids[image]),
                    d.nrows(),
                    words.len(),
                ));
            }
        }

        let num_words = vocabulary.nrows();

        let projected: Vec<Array2<f32>> = descriptors
            .par_iter()
            .map(|d| projection.project_batch(&d.view()))
            .collect::<Result<_>>()?;

        let flat_projected = concat_rows(&projected, projected_dim)?;
        let flat_words: Vec<usize> = assignments
            .iter()
            .flat_map(|words| words.iter().copied())
            .collect();

        tracing::info!(
            descriptors = flat_words.len(),
            words = num_words,
            projected_dim,
            "Computing per-word medians"
        );
        let medians = compute_medians(&flat_projected.view(), &flat_words, num_words)?;

        let progress = if config.show_progress {
            let bar = indicatif::ProgressBar::new(image_ids.len() as u64);
            bar.set_message("Embedding images...");
            Some(bar)
        } else {
            None
        };

        let signatures: Vec<Vec<BinarySignature>> = projected
            .par_iter()
            .zip(assignments.par_iter())
            .map(|(p, words)| {
                let words: Cow<'_, [usize]> = match words.as_slice() {
                    Some(slice) => Cow::Borrowed(slice),
                    None => Cow::Owned(words.to_vec()),
                };
                let sigs = embed_descriptors(&p.view(), &words, &medians);
                if let Some(ref bar) = progress {
                    bar.inc(1);
                }
                sigs
            })
            .collect::<Result<_>>()?;

        if let Some(bar) = progress {
            bar.finish();
        }

        let ivf = InvertedIndex::build(medians, &assignments, &signatures, projected_dim)?;
        let weights = WeightTable::from_assignments(&assignments, num_words)?;

        tracing::info!(
            images = image_ids.len(),
            signatures = ivf.num_signatures(),
            populated_words = ivf.populated_words(),
            "Index built"
        );

        Ok(Self {
            image_ids,
            assignments,
            weights,
            vocabulary,
            projection,
            ivf,
        })
    }

    /// Assemble a state from loaded parts; shape checks are the caller's job.
    pub(crate) fn from_parts(
        image_ids: Vec<String>,
        assignments: Vec<Array1<usize>>,
        weights: WeightTable,
        vocabulary: Array2<f32>,
        projection: ProjectionMatrix,
        ivf: InvertedIndex,
    ) -> Self {
        Self {
            image_ids,
            assignments,
            weights,
            vocabulary,
            projection,
            ivf,
        }
    }

    pub fn image_ids(&self) -> &[String] {
        &self.image_ids
    }

    pub fn image_id(&self, index: usize) -> Option<&str> {
        self.image_ids.get(index).map(String::as_str)
    }

    pub fn num_images(&self) -> usize {
        self.image_ids.len()
    }

    /// Vocabulary size K.
    pub fn num_words(&self) -> usize {
        self.vocabulary.nrows()
    }

    /// Descriptor dimension D.
    pub fn descriptor_dim(&self) -> usize {
        self.projection.input_dim()
    }

    /// Projected dimension D'.
    pub fn projected_dim(&self) -> usize {
        self.projection.output_dim()
    }

    pub fn num_descriptors(&self) -> usize {
        self.assignments.iter().map(|a| a.len()).sum()
    }

    /// Word assignments of each corpus image.
    pub fn assignments(&self) -> &[Array1<usize>] {
        &self.assignments
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    pub fn vocabulary(&self) -> ArrayView2<'_, f32> {
        self.vocabulary.view()
    }

    pub fn projection(&self) -> &ProjectionMatrix {
        &self.projection
    }

    pub fn ivf(&self) -> &InvertedIndex {
        &self.ivf
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            format_version: FORMAT_VERSION,
            num_images: self.num_images(),
            num_words: self.num_words(),
            populated_words: self.ivf.populated_words(),
            descriptor_dim: self.descriptor_dim(),
            projected_dim: self.projected_dim(),
            num_descriptors: self.num_descriptors(),
        }
    }
}

fn validate_corpus(image_ids: &[String], descriptors: &[Array2<f32>], dim: usize) -> Result<()> {
    if image_ids.len() != descriptors.len() {
        return Err(Error::dimension(
            "corpus descriptors",
            image_ids.len(),
            descriptors.len(),
        ));
    }

    let mut seen = HashSet::with_capacity(image_ids.len());
    for id in image_ids {
        if !seen.insert(id.as_str()) {
            return Err(Error::Config(format!("duplicate image id '{}'", id)));
        }
    }

    for (id, d) in image_ids.iter().zip(descriptors) {
        if d.nrows() > 0 && d.ncols() != dim {
            return Err(Error::dimension(
                format!("descriptors of image '{}'", id),
                dim,
                d.ncols(),
            ));
        }
    }

    Ok(())
}

fn validate_vocabulary(vocabulary: &ArrayView2<f32>, dim: usize) -> Result<()> {
    if vocabulary.nrows() == 0 {
        return Err(Error::Config("vocabulary is empty".into()));
    }
    if vocabulary.ncols() != dim {
        return Err(Error::dimension("vocabulary", dim, vocabulary.ncols()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn identity_projection(dim: usize) -> ProjectionMatrix {
        ProjectionMatrix::new(Array2::eye(dim)).unwrap()
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("img{}", i)).collect()
    }

    #[test]
    fn test_three_images_two_words() {
        let descriptors = vec![
            array![[1.0f32, 2.0]],
            array![[-3.0f32, 0.5]],
            array![[1.5f32, -2.0]],
        ];
        let assignments = vec![array![0usize], array![1usize], array![0usize]];
        let vocabulary = array![[1.0f32, 0.0], [-3.0, 0.0]];

        let state = IndexState::from_assignments(
            ids(3),
            &descriptors,
            assignments,
            vocabulary,
            identity_projection(2),
            &IndexConfig::default(),
        )
        .unwrap();

        assert_eq!(state.ivf().lookup(0).unwrap().len(), 2);
        assert_eq!(state.ivf().lookup(1).unwrap().len(), 1);
        assert_eq!(state.num_descriptors(), 3);

        // word 0 median is the mean of its two projected descriptors
        assert_eq!(
            state.ivf().lookup(0).unwrap().median,
            Some(array![1.25f32, 0.0])
        );
    }

    #[test]
    fn test_from_vocabulary_assigns_nearest_words() {
        let descriptors = vec![array![[0.9f32, 0.1], [9.0, 0.0]], array![[10.5f32, 0.2]]];
        let vocabulary = array![[1.0f32, 0.0], [10.0, 0.0]];

        let state = IndexState::from_vocabulary(
            ids(2),
            &descriptors,
            vocabulary,
            identity_projection(2),
            &IndexConfig::default(),
        )
        .unwrap();

        assert_eq!(state.assignments()[0].to_vec(), vec![0, 1]);
        assert_eq!(state.assignments()[1].to_vec(), vec![1]);
        assert_eq!(state.weights().document_frequency(1), 2);
    }

    #[test]
    fn test_images_without_descriptors_are_kept() {
        let descriptors = vec![array![[1.0f32, 0.0]], Array2::zeros((0, 0))];
        let vocabulary = array![[1.0f32, 0.0]];

        let state = IndexState::from_vocabulary(
            ids(2),
            &descriptors,
            vocabulary,
            identity_projection(2),
            &IndexConfig::default(),
        )
        .unwrap();

        assert_eq!(state.num_images(), 2);
        assert!(state.assignments()[1].is_empty());
        assert_eq!(state.metadata().num_descriptors, 1);
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let descriptors = vec![array![[1.0f32, 0.0]], array![[0.0f32, 1.0]]];
        let result = IndexState::from_vocabulary(
            vec!["a".into(), "a".into()],
            &descriptors,
            array![[1.0f32, 0.0]],
            identity_projection(2),
            &IndexConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_descriptor_dimension_mismatch() {
        let descriptors = vec![array![[1.0f32, 0.0, 3.0]]];
        let result = IndexState::from_vocabulary(
            ids(1),
            &descriptors,
            array![[1.0f32, 0.0]],
            identity_projection(2),
            &IndexConfig::default(),
        );
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_rejects_assignment_length_mismatch() {
        let descriptors = vec![array![[1.0f32, 0.0], [0.0, 1.0]]];
        let result = IndexState::from_assignments(
            ids(1),
            &descriptors,
            vec![array![0usize]],
            array![[1.0f32, 0.0]],
            identity_projection(2),
            &IndexConfig::default(),
        );
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_insufficient_data_for_vocabulary() {
        let descriptors = vec![array![[1.0f32, 0.0]], array![[0.0f32, 1.0]]];
        let config = IndexConfig {
            vocabulary: VocabularyConfig {
                num_words: 5,
                ..Default::default()
            },
            ..Default::default()
        };

        let result =
            IndexState::from_descriptors(ids(2), &descriptors, identity_projection(2), &config);
        assert!(matches!(
            result,
            Err(Error::InsufficientData {
                requested: 5,
                available: 2
            })
        ));
    }

    #[test]
    fn test_config_json_defaults() {
        let config: IndexConfig =
            serde_json::from_str(r#"{"vocabulary": {"num_words": 64}}"#).unwrap();
        assert_eq!(config.vocabulary.num_words, 64);
        assert_eq!(config.vocabulary.seed, 42);
        assert!(!config.show_progress);

        let empty: IndexConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, IndexConfig::default());
    }
}
