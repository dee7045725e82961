//! Fixed linear projection applied to descriptors before binarization

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_npy::ReadNpyExt;

use crate::error::{Error, Result};

/// A `[D', D]` projection matrix mapping D-dimensional descriptors to
/// D'-dimensional vectors: `reduced = P · descriptor`.
///
/// The matrix is a configuration artifact; it is never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionMatrix {
    matrix: Array2<f32>,
}

impl ProjectionMatrix {
    /// Wrap a `[D', D]` matrix.
    pub fn new(matrix: Array2<f32>) -> Result<Self> {
        if matrix.nrows() == 0 || matrix.ncols() == 0 {
            return Err(Error::Config(format!(
                "projection matrix must be non-empty, got shape {:?}",
                matrix.dim()
            )));
        }
        Ok(Self { matrix })
    }

    /// Load a projection matrix from an `.npy` file holding a 2-D `f32` array.
    pub fn from_npy(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let matrix = Array2::<f32>::read_npy(BufReader::new(file))?;
        Self::new(matrix)
    }

    /// Descriptor dimension D.
    pub fn input_dim(&self) -> usize {
        self.matrix.ncols()
    }

    /// Projected dimension D' (signature length in bits).
    pub fn output_dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.matrix.view()
    }

    /// Project one descriptor.
    pub fn project(&self, descriptor: &ArrayView1<f32>) -> Result<Array1<f32>> {
        if descriptor.len() != self.input_dim() {
            return Err(Error::dimension(
                "projection",
                self.input_dim(),
                descriptor.len(),
            ));
        }
        Ok(self.matrix.dot(descriptor))
    }

    /// Project a batch of descriptors: `[N, D] -> [N, D']`.
    pub fn project_batch(&self, descriptors: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if descriptors.nrows() == 0 {
            return Ok(Array2::zeros((0, self.output_dim())));
        }
        if descriptors.ncols() != self.input_dim() {
            return Err(Error::dimension(
                "projection",
                self.input_dim(),
                descriptors.ncols(),
            ));
        }
        Ok(descriptors.dot(&self.matrix.t()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Axis};
    use ndarray_npy::WriteNpyExt;
    use tempfile::TempDir;

    fn sample_projection() -> ProjectionMatrix {
        ProjectionMatrix::new(array![[1.0, 0.0, 2.0], [0.0, -1.0, 1.0]]).unwrap()
    }

    #[test]
    fn test_project_single() {
        let p = sample_projection();
        let reduced = p.project(&array![1.0, 2.0, 3.0].view()).unwrap();
        assert_eq!(reduced, array![7.0f32, 1.0]);
    }

    #[test]
    fn test_project_batch_matches_single() {
        let p = sample_projection();
        let descriptors = array![[1.0f32, 2.0, 3.0], [-1.0, 0.5, 0.0]];
        let batch = p.project_batch(&descriptors.view()).unwrap();

        for (i, row) in descriptors.axis_iter(Axis(0)).enumerate() {
            assert_eq!(batch.row(i), p.project(&row).unwrap());
        }
    }

    #[test]
    fn test_project_dimension_mismatch() {
        let p = sample_projection();
        match p.project(&array![1.0, 2.0].view()) {
            Err(Error::DimensionMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("expected DimensionMismatch, got {:?}", other),
        }
        assert!(p.project_batch(&Array2::zeros((2, 4)).view()).is_err());
    }

    #[test]
    fn test_empty_matrix_rejected() {
        assert!(matches!(
            ProjectionMatrix::new(Array2::zeros((0, 3))),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_npy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projection.npy");
        let matrix = array![[0.25f32, -0.5], [1.5, 2.0], [3.0, 0.125]];
        matrix.write_npy(File::create(&path).unwrap()).unwrap();

        let p = ProjectionMatrix::from_npy(&path).unwrap();
        assert_eq!(p.output_dim(), 3);
        assert_eq!(p.input_dim(), 2);
        assert_eq!(p.view(), matrix.view());
    }
}
