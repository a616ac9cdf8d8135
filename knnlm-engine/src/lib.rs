pub mod alignment;
pub mod combine;
pub mod config;
pub mod dataset;
pub mod datastore;
pub mod error;
pub mod eval;
pub mod knn;
pub mod lm;
pub mod predictions;
pub mod provider;
pub mod sample;
pub mod scorer;
pub mod softmax_batch;
pub mod tensor;
pub mod vocab;
pub mod word_stats;

pub use combine::{combine_in_place, combine_log_probs, log_sum_exp};
pub use config::EvalConfig;
pub use dataset::LmDataset;
pub use datastore::{Datastore, DatastoreWriter, KeyPrecision};
pub use error::{EvalError, Result};
pub use eval::{BatchOutcome, EvalPhase, EvalReport, Evaluator};
pub use knn::{ExactKnn, KnnConfig};
pub use provider::{LanguageModel, RetrievalProvider};
pub use sample::{DecoderOutput, Hypothesis, KeyType, NetInput, Sample};
pub use scorer::{ScorerConfig, SequenceScorer};
pub use softmax_batch::batch_for_softmax;
pub use tensor::{Matrix, Tensor3, TokenId};
pub use vocab::Vocabulary;
pub use word_stats::{WordStat, WordStats};
