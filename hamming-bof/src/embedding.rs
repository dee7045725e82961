//! Hamming Embedding: per-word medians and binary signatures.
//!
//! At build time every visual word gets the per-dimension median of the
//! projected descriptors assigned to it. A projected descriptor is then
//! binarized against its word's median: bit `i` is set iff the projected
//! value is strictly greater than the median component. Two descriptors of
//! the same word are compared by the Hamming distance of their signatures.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::utils::{median_in_place, packbits, packed_len, unpackbits};

/// A bit vector of length D', packed big-endian into `ceil(D'/8)` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinarySignature {
    nbits: usize,
    packed: Vec<u8>,
}

impl BinarySignature {
    /// Binarize a projected descriptor against its word's median.
    pub fn from_projection(projected: &ArrayView1<f32>, median: &ArrayView1<f32>) -> Result<Self> {
        if projected.len() != median.len() {
            return Err(Error::dimension(
                "signature median",
                median.len(),
                projected.len(),
            ));
        }

        let nbits = projected.len();
        let bits = projected.iter().zip(median.iter()).map(|(p, m)| p > m);
        Ok(Self {
            nbits,
            packed: packbits(bits, nbits),
        })
    }

    /// Rebuild a signature from its packed bytes.
    ///
    /// Fails if the byte count does not match `nbits` or padding bits are set.
    pub fn from_packed(packed: Vec<u8>, nbits: usize) -> Result<Self> {
        let expected = packed_len(nbits);
        if packed.len() != expected {
            return Err(Error::dimension("packed signature", expected, packed.len()));
        }

        let padding = expected * 8 - nbits;
        if padding > 0 {
            let mask = (1u8 << padding) - 1;
            if packed[expected - 1] & mask != 0 {
                return Err(Error::Config(format!(
                    "packed signature of {} bits has padding bits set",
                    nbits
                )));
            }
        }

        Ok(Self { nbits, packed })
    }

    /// Signature length in bits (D').
    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.packed
    }

    pub fn bit(&self, i: usize) -> bool {
        (self.packed[i / 8] >> (7 - (i % 8))) & 1 == 1
    }

    pub fn to_bits(&self) -> Vec<bool> {
        unpackbits(&self.packed, self.nbits)
    }

    /// Number of differing bits.
    ///
    /// Both signatures must have the same length; every signature stored in
    /// one index has length D'.
    pub fn hamming(&self, other: &BinarySignature) -> u32 {
        debug_assert_eq!(self.nbits, other.nbits);
        self.packed
            .iter()
            .zip(other.packed.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Compute the per-word median of projected descriptors.
///
/// # Arguments
///
/// * `projected` - Projected descriptors of the whole corpus, shape `[N, D']`
/// * `words` - Word id of each row, length `N`
/// * `num_words` - Vocabulary size K
///
/// # Returns
///
/// K entries; `None` for words that received no descriptors.
pub fn compute_medians(
    projected: &ArrayView2<f32>,
    words: &[usize],
    num_words: usize,
) -> Result<Vec<Option<Array1<f32>>>> {
    if projected.nrows() != words.len() {
        return Err(Error::dimension(
            "median word assignments",
            projected.nrows(),
            words.len(),
        ));
    }

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); num_words];
    for (row, &word) in words.iter().enumerate() {
        members
            .get_mut(word)
            .ok_or(Error::WordOutOfRange { word, num_words })?
            .push(row);
    }

    let dim = projected.ncols();
    let medians: Vec<Option<Array1<f32>>> = members
        .par_iter()
        .map(|rows| {
            if rows.is_empty() {
                return None;
            }
            let group = projected.select(Axis(0), rows);
            let mut column = Vec::with_capacity(rows.len());
            let median: Array1<f32> = (0..dim)
                .map(|d| {
                    column.clear();
                    column.extend(group.column(d).iter().copied());
                    median_in_place(&mut column)
                })
                .collect();
            Some(median)
        })
        .collect();

    let empty = medians.iter().filter(|m| m.is_none()).count();
    if empty > 0 {
        tracing::warn!(
            empty_words = empty,
            num_words,
            "Visual words without descriptors are excluded from the index"
        );
    }

    Ok(medians)
}

/// Binarize a batch of projected descriptors against their words' medians.
///
/// # Errors
///
/// `Error::MissingMedian` if a descriptor is assigned to a word without a
/// median, `Error::WordOutOfRange` for word ids outside `medians`.
pub fn embed_descriptors(
    projected: &ArrayView2<f32>,
    words: &[usize],
    medians: &[Option<Array1<f32>>],
) -> Result<Vec<BinarySignature>> {
    if projected.nrows() != words.len() {
        return Err(Error::dimension(
            "signature word assignments",
            projected.nrows(),
            words.len(),
        ));
    }

    projected
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(words.par_iter())
        .map(|(row, &word)| {
            let median = medians
                .get(word)
                .ok_or(Error::WordOutOfRange {
                    word,
                    num_words: medians.len(),
                })?
                .as_ref()
                .ok_or(Error::MissingMedian { word })?;
            BinarySignature::from_projection(&row, &median.view())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_signature_strictly_greater() {
        let projected = array![1.0f32, 0.5, -2.0, 3.0];
        let median = array![0.0f32, 0.5, -1.0, 2.9];

        let sig = BinarySignature::from_projection(&projected.view(), &median.view()).unwrap();
        assert_eq!(sig.len(), 4);
        // Equal values produce a 0 bit.
        assert_eq!(sig.to_bits(), vec![true, false, false, true]);
        assert_eq!(sig.as_bytes(), &[0b1001_0000]);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let projected: Array1<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        let median: Array1<f32> = (0..64).map(|i| (i as f32 * 0.11).cos() * 0.5).collect();

        let a = BinarySignature::from_projection(&projected.view(), &median.view()).unwrap();
        let b = BinarySignature::from_projection(&projected.view(), &median.view()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), 8);
    }

    #[test]
    fn test_signature_dimension_mismatch() {
        let projected = array![1.0f32, 2.0];
        let median = array![0.0f32, 0.0, 0.0];
        assert!(matches!(
            BinarySignature::from_projection(&projected.view(), &median.view()),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_hamming_distance() {
        let a = BinarySignature::from_packed(vec![0b1111_0000, 0b1010_0000], 12).unwrap();
        let b = BinarySignature::from_packed(vec![0b0000_0000, 0b1000_0000], 12).unwrap();

        assert_eq!(a.hamming(&a), 0);
        assert_eq!(a.hamming(&b), 5);
        assert_eq!(b.hamming(&a), 5);
    }

    #[test]
    fn test_from_packed_validation() {
        assert!(BinarySignature::from_packed(vec![0, 0], 8).is_err());
        // 12 bits leave 4 padding bits in the last byte
        assert!(BinarySignature::from_packed(vec![0, 0b0000_0001], 12).is_err());
        assert!(BinarySignature::from_packed(vec![0xff, 0b1111_0000], 12).is_ok());
    }

    #[test]
    fn test_compute_medians() {
        let projected = array![[1.0f32, 10.0], [3.0, 20.0], [5.0, 0.0], [2.0, 4.0], [4.0, 6.0]];
        let words = [0, 0, 0, 2, 2];

        let medians = compute_medians(&projected.view(), &words, 3).unwrap();
        assert_eq!(medians.len(), 3);
        assert_eq!(medians[0], Some(array![3.0f32, 10.0]));
        assert_eq!(medians[1], None);
        assert_eq!(medians[2], Some(array![3.0f32, 5.0]));
    }

    #[test]
    fn test_compute_medians_word_out_of_range() {
        let projected = Array2::<f32>::zeros((2, 4));
        match compute_medians(&projected.view(), &[0, 7], 3) {
            Err(Error::WordOutOfRange { word, num_words }) => {
                assert_eq!(word, 7);
                assert_eq!(num_words, 3);
            }
            other => panic!("expected WordOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_embed_descriptors() {
        let projected = array![[1.0f32, -1.0], [0.0, 0.0], [5.0, 5.0]];
        let words = [0, 0, 1];
        let medians = vec![Some(array![0.0f32, 0.0]), Some(array![4.0f32, 6.0])];

        let sigs = embed_descriptors(&projected.view(), &words, &medians).unwrap();
        assert_eq!(sigs.len(), 3);
        assert_eq!(sigs[0].to_bits(), vec![true, false]);
        assert_eq!(sigs[1].to_bits(), vec![false, false]);
        assert_eq!(sigs[2].to_bits(), vec![true, false]);
    }

    #[test]
    fn test_embed_descriptors_missing_median() {
        let projected = array![[1.0f32, -1.0]];
        let medians = vec![Some(array![0.0f32, 0.0]), None];

        assert!(matches!(
            embed_descriptors(&projected.view(), &[1], &medians),
            Err(Error::MissingMedian { word: 1 })
        ));
    }
}
