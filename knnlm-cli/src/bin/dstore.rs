//! Datastore inspection
//!
//! Prints the shape, sample ranges and rows of a datastore written by
//! `knnlm-eval-lm --save-knnlm-dstore`, and runs exact nearest-neighbor
//! queries against its stored keys.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use knnlm_engine::datastore::{Datastore, DatastorePaths, KeyPrecision};
use knnlm_engine::knn::{ExactKnn, KnnConfig};
use std::path::PathBuf;

/// knnlm datastore tool: inspect and query saved datastores.
#[derive(Parser, Debug)]
#[command(name = "knnlm-dstore")]
#[command(about = "knnlm datastore tool: inspect and query saved datastores")]
struct Cli {
    /// Datastore prefix (files are <prefix>_keys.npy, <prefix>_vals.npy, <prefix>_map.json)
    prefix: PathBuf,

    /// Key width
    #[arg(long)]
    dim: usize,

    /// Keys are stored as f16
    #[arg(long)]
    fp16: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the shape and usage of the datastore.
    Info,

    /// Print the row range written for a sample id.
    Sample { id: u64 },

    /// Print values and leading key components of a row range.
    Rows {
        #[arg(long, default_value_t = 0)]
        start: usize,

        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Key components shown per row
        #[arg(long, default_value_t = 4)]
        width: usize,
    },

    /// Find the nearest neighbors of a stored key.
    Neighbors {
        /// Row whose key is the query
        row: usize,

        #[arg(short, long, default_value_t = 8)]
        k: usize,

        /// Skip rows of the query's own sample
        #[arg(long)]
        exclude_same_sample: bool,
    },
}

fn run_info(dstore: &Datastore, paths: &DatastorePaths) -> Result<()> {
    println!("keys:      {}", paths.keys.display());
    println!("values:    {}", paths.vals.display());
    println!("rows:      {} of {}", dstore.len(), dstore.capacity());
    println!("dim:       {} ({:?})", dstore.dim(), dstore.precision());
    match dstore.sample_ranges() {
        Some(ranges) => println!("samples:   {}", ranges.len()),
        None => println!("samples:   no range map"),
    }
    Ok(())
}

fn run_sample(dstore: &Datastore, id: u64) -> Result<()> {
    let ranges = dstore
        .sample_ranges()
        .context("datastore has no range map")?;
    let Some(&(start, end)) = ranges.get(&id) else {
        bail!("sample {} was not written to this datastore", id);
    };
    println!("sample {}: rows [{}, {}) ({} rows)", id, start, end, end - start);
    Ok(())
}

fn run_rows(dstore: &Datastore, start: usize, count: usize, width: usize) -> Result<()> {
    let end = start.saturating_add(count).min(dstore.len());
    if start >= end {
        bail!("row {} is outside the {} rows in use", start, dstore.len());
    }
    let mut key = vec![0.0f32; dstore.dim()];
    for row in start..end {
        dstore.key_into(row, &mut key);
        let norm = key.iter().map(|x| x * x).sum::<f32>().sqrt();
        let head: Vec<String> = key
            .iter()
            .take(width)
            .map(|x| format!("{:.4}", x))
            .collect();
        println!(
            "{}\t{}\t|k|={:.4}\t[{}]",
            row,
            dstore.value(row),
            norm,
            head.join(", ")
        );
    }
    Ok(())
}

fn run_neighbors(dstore: Datastore, row: usize, k: usize, exclude_same_sample: bool) -> Result<()> {
    if row >= dstore.len() {
        bail!("row {} is outside the {} rows in use", row, dstore.len());
    }
    let query = dstore.key(row);
    let exclude = if exclude_same_sample {
        let ranges = dstore
            .sample_ranges()
            .context("excluding the own sample needs the range map")?;
        ranges
            .values()
            .find(|&&(s, e)| (s as usize..e as usize).contains(&row))
            .map(|&(s, e)| (s as usize, e as usize))
    } else {
        None
    };

    let mut knn = ExactKnn::new(
        dstore,
        KnnConfig {
            k,
            temperature: 1.0,
            exclude_same_sample,
        },
    )?;
    for n in knn.search(&query, exclude) {
        println!(
            "{}\t{}\t{:.4}",
            n.index,
            knn.datastore().value(n.index),
            n.distance
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let precision = if cli.fp16 {
        KeyPrecision::Fp16
    } else {
        KeyPrecision::Fp32
    };
    let dstore = Datastore::open(&cli.prefix, cli.dim, precision)
        .with_context(|| format!("Failed to open datastore {}", cli.prefix.display()))?;

    match cli.command {
        Commands::Info => run_info(&dstore, &DatastorePaths::from_prefix(&cli.prefix)),
        Commands::Sample { id } => run_sample(&dstore, id),
        Commands::Rows {
            start,
            count,
            width,
        } => run_rows(&dstore, start, count, width),
        Commands::Neighbors {
            row,
            k,
            exclude_same_sample,
        } => run_neighbors(dstore, row, k, exclude_same_sample),
    }
}
