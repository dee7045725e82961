use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use hamming_bof::{
    IndexState, IndexStore, NpyDescriptorSource, ProjectionMatrix, QueryResult, SearchParameters,
};
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::{load_config, read_image_list, Overrides};

const MAIN_HELP: &str = "\
EXAMPLES:
    # Build an index from per-image descriptor files (<dir>/<id>.npy)
    hbof build --descriptors ./descriptors --projection P.npy --index ./index

    # Restrict the corpus to a list of image ids, with 20k visual words
    hbof build --images images.txt --descriptors ./descriptors \\
        --projection P.npy --index ./index --words 20000

    # Query with a corpus image, or with any [n, D] descriptor file
    hbof query --index ./index --image img_0042 --descriptors ./descriptors
    hbof query --index ./index --query query.npy --threshold 24 --top-k 10

    # Index summary
    hbof stats --index ./index

ENVIRONMENT:
    RUST_LOG controls log verbosity (default: info)";

#[derive(Parser)]
#[command(
    name = "hbof",
    version,
    about = "Image retrieval with Bag-of-Features and Hamming Embedding",
    after_help = MAIN_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an index and save it to disk
    Build {
        /// File listing image ids, one per line (default: every .npy in --descriptors)
        #[arg(long)]
        images: Option<PathBuf>,

        /// Directory holding one <image_id>.npy descriptor matrix per image
        #[arg(long)]
        descriptors: PathBuf,

        /// Projection matrix [D', D] as .npy
        #[arg(long)]
        projection: PathBuf,

        /// Output index directory
        #[arg(long)]
        index: PathBuf,

        /// JSON build configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of visual words
        #[arg(long)]
        words: Option<usize>,

        /// Random seed for the vocabulary
        #[arg(long)]
        seed: Option<u64>,

        /// Number of k-means iterations
        #[arg(long)]
        niters: Option<usize>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Query an index
    Query {
        /// Index directory
        #[arg(long)]
        index: PathBuf,

        /// Query image id, read from --descriptors
        #[arg(long, requires = "descriptors", conflicts_with = "query")]
        image: Option<String>,

        /// Directory holding <image_id>.npy descriptor files
        #[arg(long)]
        descriptors: Option<PathBuf>,

        /// Query descriptors [n, D] as .npy
        #[arg(long, required_unless_present = "image")]
        query: Option<PathBuf>,

        /// Hamming distance threshold
        #[arg(short = 't', long, default_value = "25")]
        threshold: u32,

        /// Number of results
        #[arg(short = 'k', long, default_value = "20")]
        top_k: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print index metadata
    Stats {
        /// Index directory
        #[arg(long)]
        index: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            images,
            descriptors,
            projection,
            index,
            config,
            words,
            seed,
            niters,
            progress,
        } => {
            let overrides = Overrides {
                num_words: words,
                seed,
                kmeans_niters: niters,
                show_progress: progress,
            };
            cmd_build(
                images.as_deref(),
                &descriptors,
                &projection,
                &index,
                config.as_deref(),
                &overrides,
            )
        }
        Commands::Query {
            index,
            image,
            descriptors,
            query,
            threshold,
            top_k,
            json,
        } => {
            let params = SearchParameters {
                hamming_threshold: threshold,
                top_k,
            };
            cmd_query(
                &index,
                image.as_deref(),
                descriptors.as_deref(),
                query.as_deref(),
                &params,
                json,
            )
        }
        Commands::Stats { index, json } => cmd_stats(&index, json),
    }
}

fn cmd_build(
    images: Option<&Path>,
    descriptors: &Path,
    projection: &Path,
    index: &Path,
    config: Option<&Path>,
    overrides: &Overrides,
) -> Result<()> {
    let config = load_config(config, overrides)?;
    tracing::debug!(?config, "Build configuration");
    let source = NpyDescriptorSource::new(descriptors);

    let image_ids = match images {
        Some(list) => read_image_list(list)?,
        None => source.list_images().with_context(|| {
            format!("Failed to list descriptor files in {}", descriptors.display())
        })?,
    };
    if image_ids.is_empty() {
        bail!("No images to index");
    }

    let projection = ProjectionMatrix::from_npy(projection)
        .with_context(|| format!("Failed to load projection from {}", projection.display()))?;

    let state = IndexState::build(image_ids, &source, projection, &config)
        .context("Failed to build index")?;
    IndexStore::new(index)
        .save(&state)
        .with_context(|| format!("Failed to save index to {}", index.display()))?;

    println!(
        "{} {} images, {} descriptors, {} visual words -> {}",
        "Indexed".green().bold(),
        state.num_images(),
        state.num_descriptors(),
        state.num_words(),
        index.display()
    );
    Ok(())
}

fn cmd_query(
    index: &Path,
    image: Option<&str>,
    descriptors: Option<&Path>,
    query: Option<&Path>,
    params: &SearchParameters,
    json: bool,
) -> Result<()> {
    let state = open_index(index)?;

    let result = match (image, descriptors, query) {
        (Some(image), Some(dir), _) => state
            .search_image(&NpyDescriptorSource::new(dir), image, params)
            .with_context(|| format!("Query with image '{}' failed", image))?,
        (_, _, Some(path)) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let query = Array2::<f32>::read_npy(BufReader::new(file))
                .with_context(|| format!("Failed to read descriptors from {}", path.display()))?;
            state.search(&query, params).context("Query failed")?
        }
        _ => bail!("Provide either --image with --descriptors, or --query"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_results(&result);
    }
    Ok(())
}

fn print_results(result: &QueryResult) {
    if result.image_ids.is_empty() {
        println!("No results.");
        return;
    }
    for (rank, ((id, score), votes)) in result
        .image_ids
        .iter()
        .zip(&result.scores)
        .zip(&result.votes)
        .enumerate()
    {
        println!(
            "{} {} {}",
            format!("{}.", rank + 1).dimmed(),
            id.bold(),
            format!("(score: {:.3}, votes: {})", score, votes).dimmed()
        );
    }
}

fn cmd_stats(index: &Path, json: bool) -> Result<()> {
    let store = IndexStore::new(index);
    if !store.exists() {
        bail!("No index found at {}", index.display());
    }
    let metadata = store
        .metadata()
        .with_context(|| format!("Failed to read metadata of {}", index.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    println!("Index:            {}", index.display().to_string().cyan());
    println!("Images:           {}", metadata.num_images);
    println!("Descriptors:      {}", metadata.num_descriptors);
    println!(
        "Visual words:     {} ({} populated)",
        metadata.num_words, metadata.populated_words
    );
    println!("Descriptor dim:   {}", metadata.descriptor_dim);
    println!("Signature bits:   {}", metadata.projected_dim);
    Ok(())
}

fn open_index(index: &Path) -> Result<IndexState> {
    let store = IndexStore::new(index);
    if !store.exists() {
        bail!("No index found at {}", index.display());
    }
    store
        .load()
        .with_context(|| format!("Failed to load index from {}", index.display()))
}
