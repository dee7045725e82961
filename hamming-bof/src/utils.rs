//! Numeric and bit-packing helpers shared by the build and query paths

use ndarray::{s, Array2};

use crate::error::{Error, Result};

/// Compute the q-th quantile of a slice using linear interpolation.
///
/// The slice is sorted in place. At `q = 0.5` this is the usual median:
/// the middle value for odd lengths, the mean of the two middle values
/// for even lengths.
///
/// # Arguments
///
/// * `values` - Input values (will be sorted)
/// * `q` - Quantile to compute (between 0.0 and 1.0)
pub fn quantile_in_place(values: &mut [f32], q: f64) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    let idx_float = q * (n - 1) as f64;
    let lower_idx = idx_float.floor() as usize;
    let upper_idx = idx_float.ceil() as usize;

    if lower_idx == upper_idx {
        values[lower_idx]
    } else {
        let weight = (idx_float - lower_idx as f64) as f32;
        values[lower_idx] * (1.0 - weight) + values[upper_idx] * weight
    }
}

/// Median of a slice (sorted in place).
pub fn median_in_place(values: &mut [f32]) -> f32 {
    quantile_in_place(values, 0.5)
}

/// Number of bytes needed to hold `nbits` packed bits.
pub fn packed_len(nbits: usize) -> usize {
    nbits.div_ceil(8)
}

/// Pack bits into bytes (big-endian within each byte).
///
/// Trailing bits of the last byte are zero.
pub fn packbits<I>(bits: I, nbits: usize) -> Vec<u8>
where
    I: IntoIterator<Item = bool>,
{
    let mut packed = vec![0u8; packed_len(nbits)];
    for (i, bit) in bits.into_iter().take(nbits).enumerate() {
        if bit {
            packed[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    packed
}

/// Unpack the first `nbits` bits of big-endian packed bytes.
pub fn unpackbits(bytes: &[u8], nbits: usize) -> Vec<bool> {
    (0..nbits)
        .map(|i| (bytes[i / 8] >> (7 - (i % 8))) & 1 == 1)
        .collect()
}

/// Concatenate per-image descriptor matrices into a single `[N, dim]` array.
///
/// Images without descriptors are skipped whatever their column count.
pub fn concat_rows(images: &[Array2<f32>], dim: usize) -> Result<Array2<f32>> {
    let total: usize = images.iter().map(|d| d.nrows()).sum();
    let mut flat = Array2::<f32>::zeros((total, dim));
    let mut offset = 0;

    for (i, image) in images.iter().enumerate() {
        let n = image.nrows();
        if n == 0 {
            continue;
        }
        if image.ncols() != dim {
            return Err(Error::dimension(
                format!("descriptors of image {}", i),
                dim,
                image.ncols(),
            ));
        }
        flat.slice_mut(s![offset..offset + n, ..]).assign(image);
        offset += n;
    }

    Ok(flat)
}
