//! Exact nearest-neighbor retrieval over a saved datastore.

use tracing::debug;

use crate::combine::log_sum_exp;
use crate::datastore::Datastore;
use crate::error::{EvalError, Result};
use crate::provider::{RetrievalOutput, RetrievalProvider, RetrievalQuery};
use crate::scorer::ZERO_PROB_FLOOR;
use crate::tensor::{Matrix, Tensor3};

/// Retrieval settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnnConfig {
    /// Neighbors per query.
    pub k: usize,
    /// Distance scale of the neighbor softmax.
    pub temperature: f32,
    /// Ignore datastore rows written for the querying sample itself.
    pub exclude_same_sample: bool,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            k: 1024,
            temperature: 1.0,
            exclude_same_sample: false,
        }
    }
}

/// One retrieved neighbor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    /// Squared L2 distance to the query.
    pub distance: f32,
}

/// Brute-force kNN provider: scans every key for every query position.
pub struct ExactKnn {
    dstore: Datastore,
    config: KnnConfig,
    scratch: Vec<f32>,
}

impl ExactKnn {
    pub fn new(dstore: Datastore, config: KnnConfig) -> Result<Self> {
        if config.k == 0 {
            return Err(EvalError::InvalidConfiguration(
                "k must be positive".to_string(),
            ));
        }
        if config.temperature.is_nan() || config.temperature <= 0.0 {
            return Err(EvalError::InvalidConfiguration(format!(
                "temperature must be positive, got {}",
                config.temperature
            )));
        }
        if config.exclude_same_sample && dstore.sample_ranges().is_none() {
            return Err(EvalError::MissingConfiguration(
                "excluding same-sample neighbors needs the datastore range map".to_string(),
            ));
        }
        debug!(
            "kNN over {} keys of dim {}, k={}",
            dstore.len(),
            dstore.dim(),
            config.k
        );
        let scratch = vec![0.0; dstore.dim()];
        Ok(Self {
            dstore,
            config,
            scratch,
        })
    }

    pub fn datastore(&self) -> &Datastore {
        &self.dstore
    }

    /// The `k` nearest keys to `query`, closest first, skipping rows in `exclude`.
    pub fn search(&mut self, query: &[f32], exclude: Option<(usize, usize)>) -> Vec<Neighbor> {
        let mut all = Vec::with_capacity(self.dstore.len());
        for index in 0..self.dstore.len() {
            if exclude.is_some_and(|(s, e)| index >= s && index < e) {
                continue;
            }
            self.dstore.key_into(index, &mut self.scratch);
            let distance = query
                .iter()
                .zip(&self.scratch)
                .map(|(q, k)| (q - k) * (q - k))
                .sum();
            all.push(Neighbor { index, distance });
        }

        let cmp = |a: &Neighbor, b: &Neighbor| {
            a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index))
        };
        let k = self.config.k.min(all.len());
        if k == 0 {
            return Vec::new();
        }
        if k < all.len() {
            all.select_nth_unstable_by(k - 1, cmp);
            all.truncate(k);
        }
        all.sort_unstable_by(cmp);
        all
    }

    /// Log-weights of `neighbors` under `softmax(-distance / temperature)`.
    fn log_weights(&self, neighbors: &[Neighbor]) -> Vec<f32> {
        let scaled: Vec<f32> = neighbors
            .iter()
            .map(|n| -n.distance / self.config.temperature)
            .collect();
        let norm = log_sum_exp(&scaled);
        scaled.into_iter().map(|s| s - norm).collect()
    }
}

impl RetrievalProvider for ExactKnn {
    fn query(&mut self, query: &RetrievalQuery<'_>) -> Result<RetrievalOutput> {
        let [bsz, tsz, dim] = query.keys.dims();
        if dim != self.dstore.dim() {
            return Err(EvalError::Shape(format!(
                "query keys of dim {} against datastore of dim {}",
                dim,
                self.dstore.dim()
            )));
        }
        if query.targets.rows() != bsz || query.targets.cols() != tsz {
            return Err(EvalError::Shape(format!(
                "targets {}x{} for keys {:?}",
                query.targets.rows(),
                query.targets.cols(),
                query.keys.dims()
            )));
        }

        let mut target_lp = Matrix::filled(bsz, tsz, ZERO_PROB_FLOOR);
        let mut vocab_lp = if query.full_vocab {
            let dims = [bsz, tsz, query.vocab_size];
            Some(Tensor3::new(dims, vec![ZERO_PROB_FLOOR; bsz * tsz * query.vocab_size])?)
        } else {
            None
        };

        for i in 0..bsz {
            let exclude = if self.config.exclude_same_sample {
                query
                    .sample_ids
                    .get(i)
                    .and_then(|id| self.dstore.sample_ranges().and_then(|r| r.get(id)))
                    .map(|&(s, e)| (s as usize, e as usize))
            } else {
                None
            };

            for t in 0..tsz {
                let target = query.targets.get(i, t);
                if target == query.pad {
                    continue;
                }
                let neighbors = self.search(query.keys.row(i, t), exclude);
                if neighbors.is_empty() {
                    continue;
                }
                let weights = self.log_weights(&neighbors);

                let matching: Vec<f32> = neighbors
                    .iter()
                    .zip(&weights)
                    .filter(|(n, _)| self.dstore.value(n.index) == i64::from(target))
                    .map(|(_, &w)| w)
                    .collect();
                if !matching.is_empty() {
                    target_lp.row_mut(i)[t] = log_sum_exp(&matching);
                }

                if let Some(vocab) = vocab_lp.as_mut() {
                    let mut probs = vec![0.0f32; query.vocab_size];
                    for (n, &w) in neighbors.iter().zip(&weights) {
                        let value = self.dstore.value(n.index);
                        let slot = usize::try_from(value).ok().and_then(|v| probs.get_mut(v));
                        if let Some(p) = slot {
                            *p += w.exp();
                        }
                    }
                    for (out, p) in vocab.row_mut(i, t).iter_mut().zip(probs) {
                        if p > 0.0 {
                            *out = p.ln();
                        }
                    }
                }
            }
        }

        Ok(RetrievalOutput {
            target_log_probs: target_lp,
            vocab_log_probs: vocab_lp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{DatastoreWriter, KeyPrecision};
    use crate::tensor::TokenId;
    use tempfile::TempDir;

    const PAD: TokenId = 1;

    fn store(dir: &TempDir) -> Datastore {
        let prefix = dir.path().join("ds");
        let mut w = DatastoreWriter::create(&prefix, 8, 2, KeyPrecision::Fp32).unwrap();
        let keys = Matrix::from_rows(vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![10.0, 10.0]]).unwrap();
        w.write(0, &keys, &[5, 6, 7]).unwrap();
        let keys = Matrix::from_rows(vec![vec![0.0, 0.1]]).unwrap();
        w.write(1, &keys, &[5]).unwrap();
        w.finish().unwrap();
        Datastore::open(&prefix, 2, KeyPrecision::Fp32).unwrap()
    }

    fn run(
        knn: &mut ExactKnn,
        key: [f32; 2],
        target: TokenId,
        id: u64,
        full: bool,
    ) -> RetrievalOutput {
        let keys = Tensor3::new([1, 1, 2], key.to_vec()).unwrap();
        let targets = Matrix::filled(1, 1, target);
        let model = Matrix::filled(1, 1, 0.0);
        let ids = [id];
        knn.query(&RetrievalQuery {
            keys: &keys,
            targets: &targets,
            sample_ids: &ids,
            pad: PAD,
            vocab_size: 8,
            model_log_probs: &model,
            full_vocab: full,
        })
        .unwrap()
    }

    #[test]
    fn test_search_orders_by_distance() {
        let dir = TempDir::new().unwrap();
        let mut knn = ExactKnn::new(
            store(&dir),
            KnnConfig {
                k: 2,
                ..KnnConfig::default()
            },
        )
        .unwrap();
        let found = knn.search(&[0.0, 0.0], None);
        assert_eq!(found.iter().map(|n| n.index).collect::<Vec<_>>(), vec![0, 3]);
        assert!((found[1].distance - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_target_log_prob_sums_matching_neighbors() {
        let dir = TempDir::new().unwrap();
        let mut knn = ExactKnn::new(
            store(&dir),
            KnnConfig {
                k: 3,
                temperature: 1.0,
                exclude_same_sample: false,
            },
        )
        .unwrap();
        let out = run(&mut knn, [0.0, 0.0], 5, 9, true);
        // neighbors 0 (d=0, v=5), 3 (d=0.01, v=5), 1 (d=1, v=6)
        let w = [0.0f32, -0.01, -1.0];
        let norm = log_sum_exp(&w);
        let expected = log_sum_exp(&[w[0] - norm, w[1] - norm]);
        assert!((out.target_log_probs.get(0, 0) - expected).abs() < 1e-5);

        let vocab = out.vocab_log_probs.unwrap();
        assert!((vocab.row(0, 0)[5] - expected).abs() < 1e-5);
        assert!((vocab.row(0, 0)[6] - (w[2] - norm)).abs() < 1e-5);
        assert_eq!(vocab.row(0, 0)[7], ZERO_PROB_FLOOR);
    }

    #[test]
    fn test_no_match_and_pad_floor() {
        let dir = TempDir::new().unwrap();
        let mut knn = ExactKnn::new(
            store(&dir),
            KnnConfig {
                k: 1,
                ..KnnConfig::default()
            },
        )
        .unwrap();
        let miss = run(&mut knn, [0.0, 0.0], 7, 9, false);
        assert_eq!(miss.target_log_probs.get(0, 0), ZERO_PROB_FLOOR);
        let pad = run(&mut knn, [0.0, 0.0], PAD, 9, false);
        assert_eq!(pad.target_log_probs.get(0, 0), ZERO_PROB_FLOOR);
    }

    #[test]
    fn test_exclude_same_sample() {
        let dir = TempDir::new().unwrap();
        let mut knn = ExactKnn::new(
            store(&dir),
            KnnConfig {
                k: 1,
                temperature: 1.0,
                exclude_same_sample: true,
            },
        )
        .unwrap();
        // sample 0 owns rows 0..3, so the nearest remaining key is row 3
        let found = knn.search(&[0.0, 0.0], Some((0, 3)));
        assert_eq!(found[0].index, 3);
        let out = run(&mut knn, [10.0, 10.0], 7, 0, false);
        assert_eq!(out.target_log_probs.get(0, 0), ZERO_PROB_FLOOR);
    }

    #[test]
    fn test_dim_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut knn = ExactKnn::new(store(&dir), KnnConfig::default()).unwrap();
        let keys = Tensor3::zeros([1, 1, 3]);
        let targets = Matrix::filled(1, 1, 5);
        let model = Matrix::filled(1, 1, 0.0);
        let result = knn.query(&RetrievalQuery {
            keys: &keys,
            targets: &targets,
            sample_ids: &[0],
            pad: PAD,
            vocab_size: 8,
            model_log_probs: &model,
            full_vocab: false,
        });
        assert!(matches!(result, Err(EvalError::Shape(_))));
    }
}
