//! Visual vocabulary construction and word assignment.
//!
//! The vocabulary is trained with fastkmeans-rs over the concatenated
//! descriptors of the whole corpus. Word assignment is a nearest-centroid
//! search under Euclidean distance, evaluated in batches as
//! `argmax(x·c - ½‖c‖²)`.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::concat_rows;

pub use fastkmeans_rs::{FastKMeans, KMeansConfig};

/// Maximum memory (bytes) for the `[batch, K]` score matrix in `assign_words`.
const MAX_NEAREST_CENTROID_MEMORY: usize = 512 * 1024 * 1024;

/// Configuration for vocabulary training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyConfig {
    /// Number of visual words (K). Must satisfy `0 < K <= N`.
    #[serde(default = "default_num_words")]
    pub num_words: usize,
    /// Number of k-means iterations (default: 20)
    #[serde(default = "default_kmeans_niters")]
    pub kmeans_niters: usize,
    /// Maximum number of points per centroid used by k-means (default: 256)
    #[serde(default = "default_max_points_per_centroid")]
    pub max_points_per_centroid: usize,
    /// Random seed; a fixed seed gives a reproducible vocabulary (default: 42)
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Upper bound on the descriptors handed to k-means.
    /// If None, every descriptor of the corpus is used.
    #[serde(default)]
    pub max_training_descriptors: Option<usize>,
}

fn default_num_words() -> usize {
    1000
}

fn default_kmeans_niters() -> usize {
    20
}

fn default_max_points_per_centroid() -> usize {
    256
}

fn default_seed() -> u64 {
    42
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            num_words: default_num_words(),
            kmeans_niters: default_kmeans_niters(),
            max_points_per_centroid: default_max_points_per_centroid(),
            seed: default_seed(),
            max_training_descriptors: None,
        }
    }
}

impl VocabularyConfig {
    fn kmeans_config(&self) -> KMeansConfig {
        KMeansConfig {
            k: self.num_words,
            max_iters: self.kmeans_niters,
            tol: 1e-8,
            seed: self.seed,
            max_points_per_centroid: Some(self.max_points_per_centroid),
            chunk_size_data: 51_200,
            chunk_size_centroids: 10_240,
            verbose: false,
        }
    }
}

/// Cluster the corpus descriptors into `config.num_words` centroids.
///
/// # Arguments
///
/// * `descriptors` - All corpus descriptors, shape `[N, dim]`
/// * `config` - Vocabulary configuration
///
/// # Returns
///
/// The vocabulary of shape `[K, dim]`
///
/// # Errors
///
/// `Error::InsufficientData` when `N < K`, `Error::Config` when `K == 0`.
pub fn build_vocabulary(
    descriptors: &ArrayView2<f32>,
    config: &VocabularyConfig,
) -> Result<Array2<f32>> {
    let num_words = config.num_words;
    let available = descriptors.nrows();

    if num_words == 0 {
        return Err(Error::Config("num_words must be greater than 0".into()));
    }
    if available < num_words {
        return Err(Error::InsufficientData {
            requested: num_words,
            available,
        });
    }

    let sampled;
    let training = match sample_indices(available, num_words, config) {
        Some(indices) => {
            sampled = descriptors.select(Axis(0), &indices);
            sampled.view()
        }
        None => descriptors.view(),
    };

    tracing::info!(
        descriptors = available,
        training = training.nrows(),
        words = num_words,
        "Training visual vocabulary"
    );

    let mut kmeans = FastKMeans::with_config(config.kmeans_config());
    kmeans
        .train(&training)
        .map_err(|e| Error::Clustering(format!("K-means training failed: {}", e)))?;

    let vocabulary = kmeans
        .centroids()
        .ok_or_else(|| Error::Clustering("K-means did not produce centroids".into()))?
        .to_owned();

    if vocabulary.nrows() != num_words {
        return Err(Error::Clustering(format!(
            "expected {} centroids, k-means returned {}",
            num_words,
            vocabulary.nrows()
        )));
    }
    if vocabulary.iter().any(|v| !v.is_finite()) {
        return Err(Error::Clustering("k-means produced non-finite centroids".into()));
    }

    Ok(vocabulary)
}

/// Cluster the descriptors of several images.
///
/// The per-image matrices are flattened before clustering.
pub fn build_vocabulary_from_images(
    images: &[Array2<f32>],
    config: &VocabularyConfig,
) -> Result<Array2<f32>> {
    let dim = images
        .iter()
        .find(|d| d.nrows() > 0)
        .map(|d| d.ncols())
        .ok_or(Error::InsufficientData {
            requested: config.num_words,
            available: 0,
        })?;

    let flat = concat_rows(images, dim)?;
    build_vocabulary(&flat.view(), config)
}

/// Random subset of row indices when the corpus exceeds the training budget.
fn sample_indices(
    available: usize,
    num_words: usize,
    config: &VocabularyConfig,
) -> Option<Vec<usize>> {
    let budget = config.max_training_descriptors?.max(num_words);
    if available <= budget {
        return None;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut indices: Vec<usize> = (0..available).collect();
    indices.shuffle(&mut rng);
    indices.truncate(budget);
    indices.sort_unstable();
    Some(indices)
}

/// Assign each descriptor to its nearest visual word (Euclidean distance).
///
/// Ties resolve to the lowest word id.
///
/// # Arguments
///
/// * `descriptors` - Descriptors to assign, shape `[N, dim]`
/// * `vocabulary` - Vocabulary, shape `[K, dim]`
///
/// # Returns
///
/// Word ids of shape `[N]`
pub fn assign_words(
    descriptors: &ArrayView2<f32>,
    vocabulary: &ArrayView2<f32>,
) -> Result<Array1<usize>> {
    let n = descriptors.nrows();
    if n == 0 {
        return Ok(Array1::zeros(0));
    }

    let num_words = vocabulary.nrows();
    if num_words == 0 {
        return Err(Error::Config("vocabulary is empty".into()));
    }
    if descriptors.ncols() != vocabulary.ncols() {
        return Err(Error::dimension(
            "word assignment",
            vocabulary.ncols(),
            descriptors.ncols(),
        ));
    }

    // ‖x - c‖² = ‖x‖² - 2(x·c - ½‖c‖²); ‖x‖² is constant per row.
    let half_norms: Array1<f32> = vocabulary
        .axis_iter(Axis(0))
        .map(|c| 0.5 * c.dot(&c))
        .collect();

    let max_batch_by_memory = MAX_NEAREST_CENTROID_MEMORY / (num_words * std::mem::size_of::<f32>());
    let batch_size = max_batch_by_memory.clamp(1, 4096);

    let mut words = Vec::with_capacity(n);

    for start in (0..n).step_by(batch_size) {
        let end = (start + batch_size).min(n);
        let batch = descriptors.slice(s![start..end, ..]);

        // [batch, dim] @ [dim, K] -> [batch, K]
        let scores = batch.dot(&vocabulary.t());

        let batch_words: Vec<usize> = scores
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| {
                let mut best_idx = 0;
                let mut best_score = f32::NEG_INFINITY;
                for (idx, (&score, &half_norm)) in row.iter().zip(half_norms.iter()).enumerate() {
                    let adjusted = score - half_norm;
                    if adjusted > best_score {
                        best_score = adjusted;
                        best_idx = idx;
                    }
                }
                best_idx
            })
            .collect();

        words.extend(batch_words);
    }

    Ok(Array1::from_vec(words))
}
