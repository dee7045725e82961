//! Hamming-BoF: Bag-of-Features image retrieval with Hamming Embedding
//!
//! Local descriptors are quantized to a k-means visual vocabulary, then
//! refined with a binary signature computed against a per-word median in a
//! projected space. Queries vote for the images whose signatures fall within
//! a Hamming threshold, weighted by the idf of each visual word.

pub mod embedding;
pub mod error;
pub mod index;
pub mod ivf;
pub mod kmeans;
pub mod lock;
pub mod projection;
pub mod search;
pub mod shared;
pub mod source;
pub mod store;
pub mod utils;
pub mod weights;

pub use embedding::{compute_medians, embed_descriptors, BinarySignature};
pub use error::{Error, Result};
pub use index::{IndexConfig, IndexState, Metadata};
pub use ivf::{InvertedIndex, InvertedListEntry};
pub use kmeans::{assign_words, build_vocabulary, FastKMeans, KMeansConfig, VocabularyConfig};
pub use projection::ProjectionMatrix;
pub use search::{hamming_votes, search_many, search_one, QueryResult, SearchParameters};
pub use shared::SharedIndex;
pub use source::{DescriptorSource, InMemorySource, NpyDescriptorSource};
pub use store::IndexStore;
pub use weights::WeightTable;
