//! Queries running against a shared index while it is rebuilt and swapped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use hamming_bof::{
    IndexConfig, IndexState, IndexStore, ProjectionMatrix, SearchParameters, SharedIndex,
    VocabularyConfig,
};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

fn corpus(num_images: usize, seed: u64) -> (Vec<String>, Vec<Array2<f32>>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let images = (0..num_images)
        .map(|_| Array2::random_using((20, 16), Uniform::new(-1.0f32, 1.0), &mut rng))
        .collect();
    let ids = (0..num_images).map(|i| format!("{}-{}", seed, i)).collect();
    (ids, images)
}

fn build(num_images: usize, seed: u64) -> IndexState {
    let (ids, images) = corpus(num_images, seed);
    let mut rng = StdRng::seed_from_u64(seed + 1000);
    let projection = ProjectionMatrix::new(Array2::random_using(
        (16, 16),
        Uniform::new(-1.0f32, 1.0),
        &mut rng,
    ))
    .unwrap();
    let config = IndexConfig {
        vocabulary: VocabularyConfig {
            num_words: 4,
            kmeans_niters: 3,
            ..Default::default()
        },
        show_progress: false,
    };
    IndexState::from_descriptors(ids, &images, projection, &config).unwrap()
}

#[test]
fn test_queries_see_whole_states_during_swaps() {
    let shared = Arc::new(SharedIndex::new(build(5, 1)));
    let stop = Arc::new(AtomicBool::new(false));
    let (_, queries) = corpus(3, 42);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            let queries = queries.clone();
            thread::spawn(move || {
                let params = SearchParameters {
                    hamming_threshold: 8,
                    top_k: 100,
                };
                let mut completed = 0usize;
                while !stop.load(Ordering::Relaxed) || completed == 0 {
                    let snapshot = shared.snapshot();
                    let prefix = snapshot.image_ids()[0].split('-').next().unwrap().to_string();
                    for query in &queries {
                        let result = snapshot.search(query, &params).unwrap();
                        // Every ranked image comes from the snapshot's own corpus.
                        assert_eq!(result.image_ids.len(), snapshot.num_images());
                        assert!(result.image_ids.iter().all(|id| id.starts_with(&prefix)));
                    }
                    completed += 1;
                }
                completed
            })
        })
        .collect();

    for seed in 2..6u64 {
        shared.replace(build(5 + seed as usize, seed));
    }
    stop.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(shared.snapshot().num_images(), 10);
}

#[test]
fn test_save_while_reading_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(IndexStore::new(dir.path().join("index")));
    store.save(&build(4, 7)).unwrap();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for seed in 8..11u64 {
                store.save(&build(4, seed)).unwrap();
            }
        })
    };

    // Loads serialize against saves, so each one observes a complete index.
    for _ in 0..10 {
        let state = store.load().unwrap();
        assert_eq!(state.num_images(), 4);
    }
    writer.join().unwrap();

    let shared = SharedIndex::open(&store).unwrap();
    assert!(shared.snapshot().image_ids()[0].starts_with("10-"));
}
