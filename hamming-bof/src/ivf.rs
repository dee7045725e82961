//! Inverted index of Hamming signatures per visual word.

use ndarray::{Array1, ArrayView1};

use crate::embedding::BinarySignature;
use crate::error::{Error, Result};

/// One visual word's inverted list.
///
/// Holds the word's median and every `(signature, image index)` pair
/// contributed by the corpus, in accumulation order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InvertedListEntry {
    /// Per-dimension median of the projected descriptors of this word.
    /// `None` for words that received no descriptors.
    pub median: Option<Array1<f32>>,
    /// Signatures of all descriptors assigned to this word
    pub signatures: Vec<BinarySignature>,
    /// Owning image index of each signature (position in the corpus image list)
    pub images: Vec<usize>,
}

impl InvertedListEntry {
    pub fn new(median: Option<Array1<f32>>) -> Self {
        Self {
            median,
            signatures: Vec::new(),
            images: Vec::new(),
        }
    }

    fn push(&mut self, signature: BinarySignature, image: usize) {
        self.signatures.push(signature);
        self.images.push(image);
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn median_view(&self) -> Option<ArrayView1<'_, f32>> {
        self.median.as_ref().map(|m| m.view())
    }

    /// Iterate over `(signature, image index)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&BinarySignature, usize)> + '_ {
        self.signatures.iter().zip(self.images.iter().copied())
    }
}

/// Per-word inverted lists of `(signature, image index)` pairs.
///
/// Built once; no deletion or update.
#[derive(Debug, Clone, PartialEq)]
pub struct InvertedIndex {
    entries: Vec<InvertedListEntry>,
    signature_bits: usize,
}

impl InvertedIndex {
    /// Build the inverted lists.
    ///
    /// Pairs are appended image by image, descriptor by descriptor, so the
    /// order of every list is deterministic. Signatures are expected to be
    /// computed beforehand (in parallel, per image); this merge is the only
    /// step that touches the lists.
    ///
    /// # Arguments
    ///
    /// * `medians` - One entry per word, `None` for words without descriptors
    /// * `words` - Word assignments of each image's descriptors
    /// * `signatures` - Signatures of each image's descriptors
    /// * `signature_bits` - Signature length D'
    pub fn build(
        medians: Vec<Option<Array1<f32>>>,
        words: &[Array1<usize>],
        signatures: &[Vec<BinarySignature>],
        signature_bits: usize,
    ) -> Result<Self> {
        if words.len() != signatures.len() {
            return Err(Error::dimension(
                "inverted index images",
                words.len(),
                signatures.len(),
            ));
        }

        for (word, median) in medians.iter().enumerate() {
            if let Some(median) = median {
                if median.len() != signature_bits {
                    return Err(Error::dimension(
                        format!("median of word {}", word),
                        signature_bits,
                        median.len(),
                    ));
                }
            }
        }

        let num_words = medians.len();
        let mut entries: Vec<InvertedListEntry> =
            medians.into_iter().map(InvertedListEntry::new).collect();

        for (image, (image_words, image_sigs)) in words.iter().zip(signatures).enumerate() {
            if image_words.len() != image_sigs.len() {
                return Err(Error::dimension(
                    format!("signatures of image {}", image),
                    image_words.len(),
                    image_sigs.len(),
                ));
            }

            for (&word, signature) in image_words.iter().zip(image_sigs) {
                let entry = entries
                    .get_mut(word)
                    .ok_or(Error::WordOutOfRange { word, num_words })?;
                if entry.median.is_none() {
                    return Err(Error::MissingMedian { word });
                }
                if signature.len() != signature_bits {
                    return Err(Error::dimension(
                        format!("signature in image {} (word {})", image, word),
                        signature_bits,
                        signature.len(),
                    ));
                }
                entry.push(signature.clone(), image);
            }
        }

        Ok(Self {
            entries,
            signature_bits,
        })
    }

    /// Assemble an index from already-built entries (used when loading).
    pub(crate) fn from_entries(entries: Vec<InvertedListEntry>, signature_bits: usize) -> Self {
        Self {
            entries,
            signature_bits,
        }
    }

    /// Inverted list of a word, O(1).
    pub fn lookup(&self, word: usize) -> Option<&InvertedListEntry> {
        self.entries.get(word)
    }

    pub fn entries(&self) -> &[InvertedListEntry] {
        &self.entries
    }

    pub fn num_words(&self) -> usize {
        self.entries.len()
    }

    /// Signature length D' in bits.
    pub fn signature_bits(&self) -> usize {
        self.signature_bits
    }

    /// Total number of stored signatures.
    pub fn num_signatures(&self) -> usize {
        self.entries.iter().map(|e| e.len()).sum()
    }

    /// Number of words that received at least one descriptor.
    pub fn populated_words(&self) -> usize {
        self.entries.iter().filter(|e| e.median.is_some()).count()
    }
}
