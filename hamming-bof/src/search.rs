//! Query path: word assignment, signature voting and idf-weighted ranking.
//!
//! For every query descriptor the engine looks up its visual word's inverted
//! list and casts one vote per stored signature within the Hamming threshold.
//! Votes are weighted by the word's idf and summed per image; images are
//! ranked by that weighted score, ties keeping corpus order.

use std::cmp::Ordering;
use std::collections::HashMap;

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::embedding::BinarySignature;
use crate::error::{Error, Result};
use crate::index::IndexState;
use crate::kmeans::assign_words;
use crate::source::DescriptorSource;

/// Search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParameters {
    /// A stored signature votes iff its Hamming distance to the query
    /// signature is strictly below this value. Bit-identical signatures
    /// always vote, so 0 admits exact matches only.
    #[serde(default = "default_hamming_threshold")]
    pub hamming_threshold: u32,
    /// Number of images to return
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_hamming_threshold() -> u32 {
    25
}

fn default_top_k() -> usize {
    20
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            hamming_threshold: default_hamming_threshold(),
            top_k: default_top_k(),
        }
    }
}

/// Result of a single query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Query ID (position in a batch)
    pub query_id: usize,
    /// Ranked image identifiers
    pub image_ids: Vec<String>,
    /// Corpus positions of the ranked images
    pub image_indices: Vec<usize>,
    /// idf-weighted score of each ranked image
    pub scores: Vec<f32>,
    /// Unweighted vote total of each ranked image
    pub votes: Vec<u32>,
}

impl QueryResult {
    fn empty(query_id: usize) -> Self {
        Self {
            query_id,
            image_ids: vec![],
            image_indices: vec![],
            scores: vec![],
            votes: vec![],
        }
    }
}

/// Votes cast by one query descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorVotes {
    /// Visual word of the descriptor
    pub word: usize,
    /// idf weight of that word
    pub idf: f32,
    /// `(image index, vote count)` pairs, sorted by image index
    pub votes: Vec<(usize, u32)>,
}

#[inline]
fn within_threshold(distance: u32, threshold: u32) -> bool {
    distance == 0 || distance < threshold
}

/// Compute the votes of every query descriptor.
///
/// Words, projection and medians are taken from `state`.
///
/// # Arguments
///
/// * `state` - Loaded index
/// * `query` - Query descriptors, shape `[n, D]`
/// * `hamming_threshold` - Voting threshold (see [`SearchParameters`])
pub fn hamming_votes(
    state: &IndexState,
    query: &ArrayView2<f32>,
    hamming_threshold: u32,
) -> Result<Vec<DescriptorVotes>> {
    if query.nrows() == 0 {
        return Ok(vec![]);
    }
    if query.ncols() != state.descriptor_dim() {
        return Err(Error::dimension(
            "query descriptors",
            state.descriptor_dim(),
            query.ncols(),
        ));
    }

    let words = assign_words(query, &state.vocabulary())?.to_vec();
    let projected = state.projection().project_batch(query)?;

    projected
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(words.par_iter())
        .map(|(row, &word)| {
            let entry = state.ivf().lookup(word).ok_or(Error::WordOutOfRange {
                word,
                num_words: state.num_words(),
            })?;

            let mut counts: HashMap<usize, u32> = HashMap::new();
            if let Some(median) = entry.median_view() {
                let signature = BinarySignature::from_projection(&row, &median)?;
                for (stored, image) in entry.iter() {
                    if within_threshold(signature.hamming(stored), hamming_threshold) {
                        *counts.entry(image).or_insert(0) += 1;
                    }
                }
            }

            let mut votes: Vec<(usize, u32)> = counts.into_iter().collect();
            votes.sort_unstable_by_key(|&(image, _)| image);

            Ok(DescriptorVotes {
                word,
                idf: state.weights().idf(word),
                votes,
            })
        })
        .collect()
}

/// Search the index with one image's descriptors.
///
/// # Errors
///
/// `Error::EmptyIndex` if the index holds no images, `Error::NoDescriptors`
/// if `query` has no rows.
pub fn search_one(
    state: &IndexState,
    query: &Array2<f32>,
    params: &SearchParameters,
) -> Result<QueryResult> {
    let num_images = state.num_images();
    if num_images == 0 {
        return Err(Error::EmptyIndex);
    }
    if query.nrows() == 0 {
        return Err(Error::NoDescriptors);
    }

    let descriptor_votes = hamming_votes(state, &query.view(), params.hamming_threshold)?;

    // Accumulated in descriptor order so repeated queries sum identically.
    let mut scores = vec![0.0f32; num_images];
    let mut totals = vec![0u32; num_images];
    for dv in &descriptor_votes {
        for &(image, count) in &dv.votes {
            scores[image] += dv.idf * count as f32;
            totals[image] += count;
        }
    }

    let mut ranking: Vec<usize> = (0..num_images).collect();
    // Stable: equal scores keep corpus order.
    ranking.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    ranking.truncate(params.top_k);

    tracing::debug!(
        descriptors = query.nrows(),
        candidates = totals.iter().filter(|&&v| v > 0).count(),
        returned = ranking.len(),
        "Query scored"
    );

    Ok(QueryResult {
        query_id: 0,
        image_ids: ranking
            .iter()
            .map(|&i| state.image_ids()[i].clone())
            .collect(),
        scores: ranking.iter().map(|&i| scores[i]).collect(),
        votes: ranking.iter().map(|&i| totals[i]).collect(),
        image_indices: ranking,
    })
}

/// Search for multiple queries in parallel.
///
/// A query that fails (for instance one without descriptors) yields an
/// empty result.
pub fn search_many(
    state: &IndexState,
    queries: &[Array2<f32>],
    params: &SearchParameters,
    show_progress: bool,
) -> Result<Vec<QueryResult>> {
    if state.num_images() == 0 {
        return Err(Error::EmptyIndex);
    }

    let progress = if show_progress {
        let bar = indicatif::ProgressBar::new(queries.len() as u64);
        bar.set_message("Searching...");
        Some(bar)
    } else {
        None
    };

    let results: Vec<QueryResult> = queries
        .par_iter()
        .enumerate()
        .map(|(i, query)| {
            let mut result = search_one(state, query, params).unwrap_or_else(|e| {
                tracing::debug!(query = i, error = %e, "Query failed");
                QueryResult::empty(i)
            });
            result.query_id = i;

            if let Some(ref bar) = progress {
                bar.inc(1);
            }

            result
        })
        .collect();

    if let Some(bar) = progress {
        bar.finish();
    }

    Ok(results)
}

impl IndexState {
    /// Search the index with a single query.
    pub fn search(&self, query: &Array2<f32>, params: &SearchParameters) -> Result<QueryResult> {
        search_one(self, query, params)
    }

    /// Search the index with multiple queries.
    pub fn search_batch(
        &self,
        queries: &[Array2<f32>],
        params: &SearchParameters,
        show_progress: bool,
    ) -> Result<Vec<QueryResult>> {
        search_many(self, queries, params, show_progress)
    }

    /// Extract the descriptors of `image_id` from `source` and search with them.
    pub fn search_image<S>(
        &self,
        source: &S,
        image_id: &str,
        params: &SearchParameters,
    ) -> Result<QueryResult>
    where
        S: DescriptorSource + ?Sized,
    {
        if self.num_images() == 0 {
            return Err(Error::EmptyIndex);
        }
        let query = source.descriptors(image_id)?;
        search_one(self, &query, params)
    }
}
