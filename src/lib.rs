pub mod classifier;
pub mod config;
pub mod confidence_gate;
pub mod error;
pub mod features;
pub mod labeling;
pub mod model_artifact;
pub mod pipeline;
pub mod review;
pub mod spending_report;
pub mod transaction_source;

pub use classifier::{predict_table, LinearClassifier, Prediction, TransactionClassifier};
pub use config::{ClassifyRunRequest, ReviewMode, RunConfig};
pub use confidence_gate::{group_uncertain, partition, GateOutcome, GateVerdict, UncertainGroup};
pub use error::ClassifyError;
pub use features::{FeatureExtractor, FeatureVector};
pub use labeling::{merge_labels, write_labeled_dataset, LabeledDataset};
pub use model_artifact::ModelArtifact;
pub use pipeline::{
    build_decision_source, classify_records, preview_classification, run_classification,
    run_with_config, LoadedModel, RunOutcome,
};
pub use review::{
    ConsoleDecisionSource, DecisionSource, KeepPredictions, PreparedDecisions, ReviewDecision,
    ReviewDecisions, ReviewQueue,
};
pub use spending_report::{aggregate_spending, SpendingReport};
pub use transaction_source::{load_transaction_table, TransactionRecord, TransactionTable};
