//! Language model perplexity evaluation
//!
//! Scores a text file with one or more GGUF models, optionally interpolating
//! kNN-LM retrieval probabilities or saving a datastore of hidden-state keys.

use anyhow::{Context, Result, bail};
use clap::Parser;
use directories::ProjectDirs;
use indicatif::{ProgressBar, ProgressStyle};
use knnlm_engine::config::EvalConfig;
use knnlm_engine::dataset::LmDataset;
use knnlm_engine::datastore::Datastore;
use knnlm_engine::eval::{BatchOutcome, Evaluator};
use knnlm_engine::knn::ExactKnn;
use knnlm_engine::lm::{
    LlamaCppModel, get_tokenizer_path, get_variant_path, registry, resolve_variant,
};
use knnlm_engine::provider::{LanguageModel, RetrievalProvider};
use knnlm_engine::vocab::Vocabulary;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Evaluate language model perplexity, with optional kNN-LM retrieval
#[derive(Parser, Debug)]
#[command(name = "knnlm-eval-lm")]
#[command(about = "Evaluate language model perplexity with optional kNN-LM retrieval")]
struct Cli {
    /// Text file to evaluate, one sentence or paragraph per line
    data: PathBuf,

    /// Config file (default: <config dir>/knnlm/config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// GGUF model file; repeat for an ensemble (overrides the model variant)
    #[arg(long = "path")]
    paths: Vec<PathBuf>,

    /// Model variant id from models.toml
    #[arg(long)]
    model: Option<String>,

    /// HuggingFace tokenizer.json
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Plain dict.txt vocabulary (instead of a tokenizer)
    #[arg(long)]
    dict: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    tokens_per_sample: Option<usize>,

    #[arg(long)]
    context_window: Option<usize>,

    #[arg(long)]
    softmax_batch: Option<usize>,

    /// Subword continuation marker, e.g. "@@ "
    #[arg(long)]
    remove_bpe: Option<String>,

    #[arg(long)]
    output_word_probs: bool,

    #[arg(long)]
    output_word_stats: bool,

    /// Save top-K predictions and references as JSON
    #[arg(long)]
    save_predictions: Option<PathBuf>,

    /// Interpolate kNN-LM retrieval probabilities
    #[arg(long)]
    knnlm: bool,

    /// Datastore prefix to retrieve from or to save to
    #[arg(long)]
    dstore_prefix: Option<PathBuf>,

    /// Build a datastore from the evaluated text
    #[arg(long)]
    save_knnlm_dstore: bool,

    /// Datastore rows (capacity)
    #[arg(long)]
    dstore_size: Option<usize>,

    /// Store or read keys as f16
    #[arg(long)]
    dstore_fp16: bool,

    /// Retrieval interpolation weight
    #[arg(long)]
    lmbda: Option<f32>,

    /// Neighbors retrieved per position
    #[arg(short, long)]
    k: Option<usize>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

/// Get the project directories for knnlm.
fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "knnlm", "knnlm")
}

fn load_config(cli: &Cli) -> Result<EvalConfig> {
    let path = match &cli.config {
        Some(p) => Some(p.clone()),
        None => project_dirs()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|p| p.exists()),
    };
    let mut config = match path {
        Some(p) => EvalConfig::load_from(&p)
            .with_context(|| format!("Failed to load config from {}", p.display()))?,
        None => EvalConfig::default(),
    };

    if !cli.paths.is_empty() {
        config.model.paths = cli.paths.clone();
    }
    if cli.model.is_some() {
        config.model.variant = cli.model.clone();
    }
    if cli.tokenizer.is_some() {
        config.model.tokenizer = cli.tokenizer.clone();
    }
    if cli.dict.is_some() {
        config.model.dict = cli.dict.clone();
    }
    if let Some(n) = cli.batch_size {
        config.eval.batch_size = n;
    }
    if let Some(n) = cli.tokens_per_sample {
        config.eval.tokens_per_sample = n;
    }
    if let Some(n) = cli.context_window {
        config.eval.context_window = n;
    }
    if cli.softmax_batch.is_some() {
        config.scoring.softmax_batch = cli.softmax_batch;
    }
    if cli.remove_bpe.is_some() {
        config.eval.remove_bpe = cli.remove_bpe.clone();
    }
    config.eval.output_word_probs |= cli.output_word_probs;
    config.eval.output_word_stats |= cli.output_word_stats;
    if cli.save_predictions.is_some() {
        config.eval.predictions_path = cli.save_predictions.clone();
    }

    config.knnlm.enabled |= cli.knnlm;
    config.datastore.save |= cli.save_knnlm_dstore;
    config.datastore.fp16 |= cli.dstore_fp16;
    if let Some(prefix) = &cli.dstore_prefix {
        if config.datastore.save {
            config.datastore.prefix = Some(prefix.clone());
        } else {
            config.knnlm.dstore_prefix = Some(prefix.clone());
        }
    }
    if cli.dstore_size.is_some() {
        config.datastore.capacity = cli.dstore_size;
    }
    if let Some(l) = cli.lmbda {
        config.knnlm.lambda = l;
    }
    if let Some(k) = cli.k {
        config.knnlm.k = k;
    }

    config.validate()?;
    Ok(config)
}

/// Load the vocabulary: a dict.txt, an explicit tokenizer.json, or the registry tokenizer.
fn load_vocab(config: &EvalConfig) -> Result<Vocabulary> {
    let remove_bpe = config.eval.remove_bpe.as_deref();
    if let Some(dict) = &config.model.dict {
        info!("Loading dictionary from {}", dict.display());
        return Vocabulary::load_dict(dict, remove_bpe)
            .with_context(|| format!("Failed to load {}", dict.display()));
    }

    let family = resolve_variant(config.model.variant.as_deref())
        .ok()
        .map(|(family, _)| family);
    let specials = family
        .map(|f| f.special_tokens.clone())
        .unwrap_or_default();
    let tokenizer = match (&config.model.tokenizer, family) {
        (Some(path), _) => path.clone(),
        (None, Some(family)) => get_tokenizer_path(family)?,
        (None, None) => bail!("no vocabulary: set model.dict, model.tokenizer or a known variant"),
    };
    info!("Loading tokenizer from {}", tokenizer.display());
    Vocabulary::from_tokenizer_file(&tokenizer, &specials, remove_bpe)
        .with_context(|| format!("Failed to load {}", tokenizer.display()))
}

fn load_models(config: &EvalConfig) -> Result<Vec<Box<dyn LanguageModel>>> {
    let paths = if config.model.paths.is_empty() {
        let (family, variant) =
            resolve_variant(config.model.variant.as_deref()).with_context(|| {
                format!(
                    "available variants: {}",
                    registry().all_variant_ids().join(", ")
                )
            })?;
        info!("Downloading/loading model variant: {} ...", variant.id);
        vec![get_variant_path(family, variant)?]
    } else {
        config.model.paths.clone()
    };

    paths
        .iter()
        .map(|path| {
            info!("Loading GGUF from {}...", path.display());
            let mut model = LlamaCppModel::from_file_with_n_ctx(path, config.model.n_ctx)
                .with_context(|| format!("Failed to load GGUF from {}", path.display()))?;
            model.set_n_threads(config.model.n_threads);
            Ok(Box::new(model) as Box<dyn LanguageModel>)
        })
        .collect()
}

fn load_retrieval(
    config: &EvalConfig,
    models: &[Box<dyn LanguageModel>],
) -> Result<Option<Box<dyn RetrievalProvider>>> {
    if !config.knnlm.enabled {
        return Ok(None);
    }
    let Some(prefix) = &config.knnlm.dstore_prefix else {
        bail!("--knnlm needs --dstore-prefix");
    };
    let dim = config
        .datastore
        .embed_dim
        .or_else(|| models.first().map(|m| m.hidden_dim()))
        .context("cannot determine the datastore key width")?;
    let dstore = Datastore::open(prefix, dim, config.datastore.precision())
        .with_context(|| format!("Failed to open datastore {}", prefix.display()))?;
    info!("Retrieving from {} keys in {}", dstore.len(), prefix.display());
    Ok(Some(Box::new(ExactKnn::new(dstore, config.knn_config())?)))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "knnlm_eval_lm=debug,knnlm_engine=debug"
    } else {
        "knnlm_eval_lm=info,knnlm_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;
    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let vocab = load_vocab(&config)?;
    info!("Vocabulary: {} types", vocab.len());
    let dataset = LmDataset::load(
        &cli.data,
        &vocab,
        config.block_size(),
        config.eval.add_bos_token,
    )
    .with_context(|| format!("Failed to read {}", cli.data.display()))?;

    let models = load_models(&config)?;
    let retrieval = load_retrieval(&config, &models)?;
    let (batch_size, context_window) = (config.eval.batch_size, config.eval.context_window);
    let mut evaluator = Evaluator::new(config, models, vocab, retrieval)?;

    let pb = ProgressBar::new(dataset.len().div_ceil(batch_size) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta}) {msg}")
            .context("invalid progress template")?
            .progress_chars("=>-"),
    );
    for sample in dataset.batches(batch_size, context_window) {
        let outcome = evaluator.process_batch(&sample?)?;
        if let BatchOutcome::Scored { .. } = outcome {
            pb.set_message(format!("{} tokens", evaluator.state().ntokens));
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let report = evaluator.finalize()?;
    if let Some(dstore) = &report.datastore {
        println!(
            "Datastore: {} of {} rows, {} samples{}",
            dstore.rows,
            dstore.capacity,
            dstore.samples,
            if dstore.overflowed { " (truncated)" } else { "" }
        );
    }
    println!(
        "Loss (base 2): {:.4}, Perplexity: {:.2}",
        report.avg_nll_base2, report.perplexity
    );
    Ok(())
}
