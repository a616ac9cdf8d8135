//! Benchmarks for scoring, retrieval fusion and kNN search
//!
//! Run with: cargo bench
//!
//! Note: The llama.cpp benchmarks require downloading models from HuggingFace.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use knnlm_engine::datastore::{Datastore, DatastoreWriter, KeyPrecision};
use knnlm_engine::error::Result;
use knnlm_engine::knn::{ExactKnn, KnnConfig};
use knnlm_engine::lm::{LlamaCppModel, get_variant_path, resolve_variant};
use knnlm_engine::provider::LanguageModel;
use knnlm_engine::sample::{DecoderOutput, KeyType, NetInput, Sample};
use knnlm_engine::scorer::{ScorerConfig, SequenceScorer};
use knnlm_engine::tensor::{Matrix, Tensor3, TokenId};
use knnlm_engine::{batch_for_softmax, combine_in_place};

const VOCAB: usize = 32_000;
const DIM: usize = 256;

/// Deterministic pseudo-random logits and keys.
struct SyntheticModel;

fn noise(seed: usize) -> f32 {
    let x = (seed as u64).wrapping_mul(6364136223846793005).rotate_left(17);
    (x % 1000) as f32 / 100.0
}

impl LanguageModel for SyntheticModel {
    fn forward(&self, input: &NetInput) -> Result<DecoderOutput> {
        let (bsz, tsz) = (input.src_tokens.rows(), input.src_tokens.cols());
        let logits = (0..bsz * tsz * VOCAB).map(noise).collect();
        let hidden = (0..bsz * tsz * DIM).map(|i| noise(i + 7)).collect();
        Ok(DecoderOutput::new(Tensor3::new([bsz, tsz, VOCAB], logits)?)
            .with_hidden(KeyType::LastFfnOutput, Tensor3::new([bsz, tsz, DIM], hidden)?))
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn hidden_dim(&self) -> usize {
        DIM
    }
}

fn sample(bsz: usize, tsz: usize) -> Sample {
    let tokens: Vec<TokenId> = (0..bsz * tsz).map(|i| (i % VOCAB) as TokenId + 4).collect();
    Sample {
        ids: (0..bsz as u64).collect(),
        net_input: Some(NetInput {
            src_tokens: Matrix::new(bsz, tsz, tokens.clone()).unwrap(),
            src_lengths: vec![tsz; bsz],
        }),
        target: Matrix::new(bsz, tsz, tokens).unwrap(),
        start_indices: None,
        ntokens: bsz * tsz,
    }
}

// ============================================================================
// Scoring benchmarks
// ============================================================================

fn bench_scoring(c: &mut Criterion) {
    let models: Vec<Box<dyn LanguageModel>> = vec![Box::new(SyntheticModel)];
    let batch = sample(2, 64);

    let mut group = c.benchmark_group("scoring");
    group.sample_size(10);

    group.bench_function("whole_batch", |b| {
        let scorer = SequenceScorer::new(ScorerConfig::new(1, 2)).unwrap();
        b.iter(|| scorer.score(&models, black_box(&batch), None).unwrap())
    });

    group.bench_function("softmax_batch_16", |b| {
        let mut config = ScorerConfig::new(1, 2);
        config.softmax_batch = 16;
        let scorer = SequenceScorer::new(config).unwrap();
        b.iter(|| scorer.score(&models, black_box(&batch), None).unwrap())
    });

    group.bench_function("split_only", |b| {
        let logits = Tensor3::zeros([2, 64, VOCAB]);
        b.iter(|| {
            batch_for_softmax(logits.view(), black_box(&batch.target), 16)
                .unwrap()
                .count()
        })
    });

    group.finish();
}

fn bench_combine(c: &mut Criterion) {
    let model: Vec<f32> = (0..VOCAB).map(|i| -noise(i)).collect();
    let retrieval: Vec<f32> = (0..VOCAB).map(|i| -noise(i + 1)).collect();

    c.bench_function("combine_full_vocab_row", |b| {
        b.iter(|| {
            let mut fused = model.clone();
            combine_in_place(&mut fused, black_box(&retrieval), 0.25).unwrap();
            fused
        })
    });
}

// ============================================================================
// kNN benchmarks
// ============================================================================

fn bench_knn(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let prefix = dir.path().join("bench");
    let rows = 4096;
    let mut writer = DatastoreWriter::create(&prefix, rows, DIM, KeyPrecision::Fp16).unwrap();
    let keys = Matrix::new(rows, DIM, (0..rows * DIM).map(noise).collect()).unwrap();
    let values: Vec<TokenId> = (0..rows as TokenId).collect();
    writer.write(0, &keys, &values).unwrap();
    writer.finish().unwrap();

    let dstore = Datastore::open(&prefix, DIM, KeyPrecision::Fp16).unwrap();
    let mut knn = ExactKnn::new(
        dstore,
        KnnConfig {
            k: 64,
            temperature: 1.0,
            exclude_same_sample: false,
        },
    )
    .unwrap();
    let query = keys.row(17).to_vec();

    c.bench_function("exact_knn_4096x256", |b| {
        b.iter(|| knn.search(black_box(&query), None))
    });
}

// ============================================================================
// llama.cpp backend benchmarks
// ============================================================================

fn bench_llamacpp(c: &mut Criterion) {
    let model = match resolve_variant(None)
        .ok()
        .and_then(|(family, variant)| get_variant_path(family, variant).ok())
        .and_then(|p| LlamaCppModel::from_file_with_n_ctx(&p, 256).ok())
    {
        Some(m) => m,
        None => {
            eprintln!("Skipping llama.cpp benchmarks: model not available");
            return;
        }
    };
    let models: Vec<Box<dyn LanguageModel>> = vec![Box::new(model)];
    let scorer = SequenceScorer::new(ScorerConfig::new(0, 2)).unwrap();

    let mut group = c.benchmark_group("llamacpp");
    group.sample_size(10);
    group.measurement_time(std::time::Duration::from_secs(30));

    for tsz in [64, 256] {
        let mut batch = sample(1, tsz);
        for t in batch.target.as_mut_slice() {
            *t = *t % 1000 + 100;
        }
        if let Some(input) = batch.net_input.as_mut() {
            input.src_tokens = batch.target.clone();
        }
        group.bench_function(format!("score_{}", tsz), |b| {
            b.iter(|| scorer.score(&models, black_box(&batch), None).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scoring, bench_combine, bench_knn, bench_llamacpp);
criterion_main!(benches);
