//! Inverse document frequency weights per visual word

use ndarray::{Array1, ArrayView1};

use crate::error::{Error, Result};

/// Smoothed idf weight per visual word.
///
/// `idf(w) = ln((n_images + 1) / (df(w) + 1)) + 1`, where `df(w)` is the
/// number of images with at least one descriptor assigned to `w`. Words
/// that occur in most images get weights close to 1, rare words larger ones.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    idf: Array1<f32>,
    document_frequency: Vec<usize>,
    num_images: usize,
}

impl WeightTable {
    /// Compute idf weights from per-image word assignments.
    pub fn from_assignments(words: &[Array1<usize>], num_words: usize) -> Result<Self> {
        let document_frequency = document_frequencies(words, num_words)?;
        let num_images = words.len();
        let idf = document_frequency
            .iter()
            .map(|&df| smoothed_idf(num_images, df))
            .collect();

        Ok(Self {
            idf,
            document_frequency,
            num_images,
        })
    }

    /// Weight of a word.
    ///
    /// # Panics
    ///
    /// Panics if `word` is outside the vocabulary.
    pub fn idf(&self, word: usize) -> f32 {
        self.idf[word]
    }

    /// Number of images containing the word.
    pub fn document_frequency(&self, word: usize) -> usize {
        self.document_frequency[word]
    }

    pub fn num_words(&self) -> usize {
        self.idf.len()
    }

    pub fn num_images(&self) -> usize {
        self.num_images
    }

    pub fn as_array(&self) -> ArrayView1<'_, f32> {
        self.idf.view()
    }
}

fn smoothed_idf(num_images: usize, df: usize) -> f32 {
    (((num_images as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0) as f32
}

/// Count, per word, the images whose descriptors use it at least once.
pub fn document_frequencies(words: &[Array1<usize>], num_words: usize) -> Result<Vec<usize>> {
    let mut df = vec![0usize; num_words];
    let mut seen = vec![usize::MAX; num_words];

    for (image, image_words) in words.iter().enumerate() {
        for &word in image_words.iter() {
            if word >= num_words {
                return Err(Error::WordOutOfRange { word, num_words });
            }
            if seen[word] != image {
                seen[word] = image;
                df[word] += 1;
            }
        }
    }

    Ok(df)
}
