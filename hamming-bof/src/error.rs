//! Error types for the hamming-bof library

use thiserror::Error;

/// Result type alias for hamming-bof operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while building, persisting or querying an index
#[derive(Error, Debug)]
pub enum Error {
    /// The corpus holds fewer descriptors than the requested vocabulary size
    #[error("Insufficient data: cannot build {requested} visual words from {available} descriptors")]
    InsufficientData { requested: usize, available: usize },

    /// Descriptor, projection or median dimensions disagree
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A word id outside of the vocabulary
    #[error("Word {word} is out of range for a vocabulary of {num_words} words")]
    WordOutOfRange { word: usize, num_words: usize },

    /// A signature was requested for a word that received no descriptors
    #[error("Word {word} has no median (no descriptors were assigned to it)")]
    MissingMedian { word: usize },

    /// Persisted index failed its shape invariants
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// Query against an index without images
    #[error("Index contains no images")]
    EmptyIndex,

    /// Query image produced no local descriptors
    #[error("Query image has no descriptors")]
    NoDescriptors,

    /// Invalid configuration or input
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error raised by the k-means routine
    #[error("Clustering failed: {0}")]
    Clustering(String),

    /// Error raised by a descriptor source
    #[error("Descriptor source failed for image '{image_id}': {message}")]
    Source { image_id: String, message: String },

    /// Error reading/writing files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// NPY read error
    #[error("NPY read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    /// NPY write error
    #[error("NPY write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
}

impl Error {
    pub(crate) fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}
