use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::classifier::{predict_table, LinearClassifier, Prediction, TransactionClassifier};
use crate::config::{ClassifyRunRequest, ReviewMode, RunConfig};
use crate::confidence_gate::{group_uncertain, partition, GateOutcome};
use crate::error::ClassifyError;
use crate::features::FeatureExtractor;
use crate::labeling::{merge_labels, write_labeled_dataset, LabeledDataset};
use crate::model_artifact::ModelArtifact;
use crate::review::{
    save_decisions, ConsoleDecisionSource, DecisionSource, KeepPredictions, PreparedDecisions,
    ReviewQueue,
};
use crate::spending_report::{aggregate_spending, SpendingReport};
use crate::transaction_source::{load_transaction_table, TransactionTable};

const PREVIEW_GROUP_LIMIT: usize = 20;

/// Validated artifact plus the two components built from it.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub artifact: ModelArtifact,
    pub extractor: FeatureExtractor,
    pub classifier: LinearClassifier,
}

impl LoadedModel {
    pub fn load(path: &Path) -> Result<Self, ClassifyError> {
        Self::from_artifact(ModelArtifact::load(path)?)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ClassifyError> {
        let extractor = FeatureExtractor::from_artifact(&artifact)?;
        let classifier = LinearClassifier::from_artifact(&artifact);
        Ok(Self {
            artifact,
            extractor,
            classifier,
        })
    }
}

/// Deterministic extraction and prediction for every record, in input order.
pub fn classify_records(artifact: &ModelArtifact, table: &TransactionTable) -> Result<Vec<Prediction>, ClassifyError> {
    let model = LoadedModel::from_artifact(artifact.clone())?;
    predict_table(&model.extractor, &model.classifier, table)
}

/// Predictions plus gate outcome for one table, before any review.
#[derive(Debug, Clone)]
pub struct GatedBatch {
    pub predictions: Vec<Prediction>,
    pub outcome: GateOutcome,
    pub queue: ReviewQueue,
}

pub fn gate_batch(
    extractor: &FeatureExtractor,
    classifier: &dyn TransactionClassifier,
    table: &TransactionTable,
    threshold: f64,
) -> Result<GatedBatch, ClassifyError> {
    let predictions = predict_table(extractor, classifier, table)?;
    let outcome = partition(&predictions, threshold);
    let groups = group_uncertain(&table.records, &outcome);
    let queue = ReviewQueue::new(&table.records, &predictions, groups);
    log::info!(
        "{} accepted, {} uncertain across {} distinct description(s) at threshold {}",
        outcome.accepted.len(),
        outcome.uncertain.len(),
        queue.len(),
        threshold
    );
    Ok(GatedBatch {
        predictions,
        outcome,
        queue,
    })
}

#[derive(Debug, Clone)]
pub struct ReviewedBatch {
    pub gated: GatedBatch,
    pub dataset: LabeledDataset,
    pub report: SpendingReport,
    pub review_prompts: usize,
    pub overrides: usize,
}

/// Gate, review to completion, merge and aggregate. Writes nothing.
pub fn review_batch(
    extractor: &FeatureExtractor,
    classifier: &dyn TransactionClassifier,
    table: &TransactionTable,
    threshold: f64,
    non_reportable: &[String],
    source: &mut dyn DecisionSource,
) -> Result<ReviewedBatch, ClassifyError> {
    let mut gated = gate_batch(extractor, classifier, table, threshold)?;
    let review_prompts = gated.queue.pending_count();
    gated.queue.run(source)?;
    let decisions = gated.queue.decisions()?;
    let dataset = merge_labels(&table.records, &gated.predictions, &decisions);
    let report = aggregate_spending(&table.records, &dataset, non_reportable);
    Ok(ReviewedBatch {
        overrides: decisions.override_count(),
        gated,
        dataset,
        report,
        review_prompts,
    })
}

pub fn build_decision_source(cfg: &RunConfig) -> Result<Box<dyn DecisionSource>, ClassifyError> {
    let prepared = || -> Result<PreparedDecisions, ClassifyError> {
        let path = cfg.decisions_path.as_deref().ok_or_else(|| {
            ClassifyError::Config(format!(
                "review_mode {} requires decisions_path",
                cfg.review_mode.as_str()
            ))
        })?;
        PreparedDecisions::from_csv_path(path)
    };
    let source: Box<dyn DecisionSource> = match cfg.review_mode {
        ReviewMode::Interactive => Box::new(ConsoleDecisionSource::stdio()),
        ReviewMode::Replay => Box::new(prepared()?),
        ReviewMode::ReplayThenPrompt => {
            Box::new(prepared()?.with_fallback(Box::new(ConsoleDecisionSource::stdio())))
        }
        ReviewMode::Skip => Box::new(KeepPredictions),
    };
    Ok(source)
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub generated_at: String,
    pub artifact_sha1: String,
    pub config: RunConfig,
    pub records_count: usize,
    pub zero_filled_cells: usize,
    /// Logical field -> source header it was read from.
    pub column_mapping: BTreeMap<String, String>,
    pub batch: ReviewedBatch,
    pub decisions_saved: Option<usize>,
}

impl RunOutcome {
    pub fn report(&self) -> &SpendingReport {
        &self.batch.report
    }

    pub fn summary_json(&self) -> Value {
        let path_text = |p: &Path| p.to_string_lossy().to_string();
        json!({
            "run_id": self.run_id,
            "generated_at": self.generated_at,
            "model_path": path_text(&self.config.model_path),
            "artifact_sha1": self.artifact_sha1,
            "source_path": path_text(&self.config.source_path),
            "review_threshold": self.config.review_threshold,
            "review_mode": self.config.review_mode.as_str(),
            "records_count": self.records_count,
            "zero_filled_amount_cells": self.zero_filled_cells,
            "column_mapping": self.column_mapping,
            "accepted_count": self.batch.gated.outcome.accepted.len(),
            "uncertain_count": self.batch.gated.outcome.uncertain.len(),
            "review_prompts": self.batch.review_prompts,
            "overrides": self.batch.overrides,
            "overridden_records": self.batch.dataset.overridden_count(),
            "output_path": path_text(&self.config.output_path),
            "report_path": self.config.report_path.as_deref().map(path_text),
            "decisions_saved_path": self.config.save_decisions_path.as_deref().map(path_text),
            "decisions_saved": self.decisions_saved,
            "non_reportable_categories": self.config.non_reportable_categories,
            "report": self.batch.report.to_json(),
        })
    }
}

/// One complete run: load, classify, review, then write outputs.
/// Nothing is written unless every earlier step succeeded.
pub fn run_with_config(cfg: RunConfig, source: &mut dyn DecisionSource) -> Result<RunOutcome, ClassifyError> {
    let model = LoadedModel::load(&cfg.model_path)?;
    let table = load_transaction_table(&cfg.source_path)?;

    let batch = review_batch(
        &model.extractor,
        &model.classifier,
        &table,
        cfg.review_threshold,
        &cfg.non_reportable_categories,
        source,
    )?;

    write_labeled_dataset(&cfg.output_path, &table, &batch.dataset)?;
    if let Some(report_path) = &cfg.report_path {
        batch.report.write_csv(report_path)?;
        log::info!("wrote spending report to {}", report_path.to_string_lossy());
    }
    let decisions_saved = match &cfg.save_decisions_path {
        Some(path) => Some(save_decisions(path, &batch.gated.queue)?),
        None => None,
    };

    Ok(RunOutcome {
        run_id: Uuid::new_v4().to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        artifact_sha1: model.artifact.fingerprint.clone(),
        records_count: table.len(),
        zero_filled_cells: table.zero_filled_cells,
        column_mapping: table.mapping,
        config: cfg,
        batch,
        decisions_saved,
    })
}

pub fn run_classification(
    req: ClassifyRunRequest,
    source: &mut dyn DecisionSource,
) -> Result<RunOutcome, ClassifyError> {
    run_with_config(RunConfig::resolve(req)?, source)
}

/// Classifies and gates without asking anyone or writing anything.
pub fn preview_classification(req: ClassifyRunRequest) -> Result<Value, ClassifyError> {
    let cfg = RunConfig::resolve(req)?;
    let model = LoadedModel::load(&cfg.model_path)?;
    let table = load_transaction_table(&cfg.source_path)?;
    let gated = gate_batch(&model.extractor, &model.classifier, &table, cfg.review_threshold)?;

    let pending_groups = gated
        .queue
        .items()
        .iter()
        .take(PREVIEW_GROUP_LIMIT)
        .map(|item| {
            json!({
                "description": item.description,
                "uncertain_records": item.uncertain_rows.len(),
                "affected_records": item.affected_rows,
                "predicted_categories": item.predicted_categories,
                "min_confidence": item.min_confidence,
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "model_path": cfg.model_path.to_string_lossy().to_string(),
        "artifact_sha1": model.artifact.fingerprint,
        "source_path": cfg.source_path.to_string_lossy().to_string(),
        "review_threshold": cfg.review_threshold,
        "classes": model.classifier.classes(),
        "column_mapping": table.mapping,
        "records_count": table.len(),
        "accepted_count": gated.outcome.accepted.len(),
        "uncertain_count": gated.outcome.uncertain.len(),
        "review_prompts": gated.queue.len(),
        "pending_groups": pending_groups,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassDistribution;
    use crate::features::FeatureVector;
    use crate::model_artifact::tests::sample_artifact;
    use crate::review::ReviewPrompt;
    use crate::transaction_source::table_from_rows;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;

    fn create_temp_path(prefix: &str, ext: &str) -> PathBuf {
        let unique = format!("{prefix}_{}_{}.{}", std::process::id(), Uuid::new_v4(), ext);
        std::env::temp_dir().join(unique)
    }

    /// Negative amounts look like FOOD at 0.4, positive ones like INCOME at 0.95.
    struct FixedClassifier {
        classes: Vec<String>,
    }

    impl FixedClassifier {
        fn new() -> Self {
            Self {
                classes: ["FOOD", "GROCERIES", "INCOME"].iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl TransactionClassifier for FixedClassifier {
        fn classes(&self) -> &[String] {
            &self.classes
        }

        fn n_features(&self) -> usize {
            5
        }

        fn predict_distribution(&self, features: &FeatureVector) -> Result<ClassDistribution, ClassifyError> {
            if features.len() != 5 {
                return Err(ClassifyError::DimensionMismatch {
                    expected: 5,
                    actual: features.len(),
                });
            }
            let probs = if features.amount() > 0.0 {
                [0.03, 0.02, 0.95]
            } else {
                [0.4, 0.35, 0.25]
            };
            Ok(ClassDistribution {
                entries: self.classes.iter().cloned().zip(probs).collect(),
            })
        }
    }

    struct Counting {
        answer: &'static str,
        prompts: Vec<String>,
    }

    impl DecisionSource for Counting {
        fn respond(&mut self, prompt: &ReviewPrompt<'_>) -> Result<String, ClassifyError> {
            self.prompts.push(prompt.description.to_string());
            Ok(self.answer.to_string())
        }
    }

    fn scenario_table() -> TransactionTable {
        let rows = [
            ["Transaction Description", "Debit Amount", "Credit Amount"],
            ["COFFEE SHOP", "3.50", ""],
            ["COFFEE SHOP", "4.00", ""],
            ["SALARY", "", "2000.00"],
        ]
        .iter()
        .map(|r| r.iter().map(|c| c.to_string()).collect())
        .collect();
        table_from_rows(Path::new("scenario.csv"), rows).expect("scenario table")
    }

    #[test]
    fn coffee_and_salary_scenario() {
        let table = scenario_table();
        let extractor = FeatureExtractor::from_artifact(&sample_artifact()).expect("extractor");
        let mut source = Counting {
            answer: "dining",
            prompts: Vec::new(),
        };
        let batch = review_batch(
            &extractor,
            &FixedClassifier::new(),
            &table,
            0.5,
            &["FAMILY".to_string(), "IGNORE".to_string()],
            &mut source,
        )
        .expect("review batch");

        assert_eq!(batch.gated.outcome.accepted, vec![2]);
        assert_eq!(batch.gated.outcome.uncertain, vec![0, 1]);
        assert_eq!(source.prompts, vec!["COFFEE SHOP"]);
        assert_eq!(batch.review_prompts, 1);
        assert_eq!(batch.dataset.category(0), Some("DINING"));
        assert_eq!(batch.dataset.category(1), Some("DINING"));
        assert_eq!(batch.dataset.category(2), Some("INCOME"));
        assert_eq!(batch.dataset.rows[0].confidence, 0.4);
        assert_eq!(batch.report.total_for("DINING"), Some(-750));
        assert_eq!(batch.report.total_for("INCOME"), Some(200_000));
        let text = batch.report.render_text();
        assert!(text.contains("DINING"));
        assert!(text.contains("-7.50"));
        assert!(text.contains("2000.00"));
    }

    #[test]
    fn classification_is_deterministic() {
        let table = scenario_table();
        let artifact = sample_artifact();
        let first = classify_records(&artifact, &table).expect("first pass");
        let second = classify_records(&artifact, &table).expect("second pass");
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn narrower_extractor_is_stopped_by_the_classifier() {
        let table = scenario_table();
        let extractor = FeatureExtractor::from_artifact(&sample_artifact()).expect("extractor");

        struct SixWide;
        impl TransactionClassifier for SixWide {
            fn classes(&self) -> &[String] {
                &[]
            }
            fn n_features(&self) -> usize {
                6
            }
            fn predict_distribution(&self, _features: &FeatureVector) -> Result<ClassDistribution, ClassifyError> {
                unreachable!("width is checked before any record is scored")
            }
        }

        let err = gate_batch(&extractor, &SixWide, &table, 0.5).expect_err("mismatch");
        assert!(matches!(
            err,
            ClassifyError::DimensionMismatch { expected: 6, actual: 5 }
        ));
    }

    fn prompt_for(description: &str) -> ReviewPrompt<'_> {
        ReviewPrompt {
            position: 1,
            total: 1,
            description,
            predicted_categories: &[],
            uncertain_records: 1,
            affected_records: 1,
            min_confidence: 0.4,
        }
    }

    #[test]
    fn replay_modes_answer_from_the_decisions_sheet() {
        let sheet = create_temp_path("txn_categorizer_answers", "csv");
        fs::write(&sheet, "description,category\nCOFFEE SHOP,dining\n").expect("write sheet");

        for mode in [ReviewMode::Replay, ReviewMode::ReplayThenPrompt] {
            let cfg = RunConfig::resolve(ClassifyRunRequest {
                review_mode: Some(mode),
                decisions_path: Some(sheet.to_string_lossy().to_string()),
                ..Default::default()
            })
            .expect("resolve");
            let mut source = build_decision_source(&cfg).expect("decision source");
            assert_eq!(
                source.respond(&prompt_for("COFFEE SHOP")).expect("answer"),
                "dining"
            );
        }

        let cfg = RunConfig::resolve(ClassifyRunRequest {
            review_mode: Some(ReviewMode::Replay),
            decisions_path: Some(sheet.to_string_lossy().to_string()),
            ..Default::default()
        })
        .expect("resolve");
        let mut replay = build_decision_source(&cfg).expect("replay source");
        assert_eq!(replay.respond(&prompt_for("SALARY")).expect("unknown"), "");
        let _ = fs::remove_file(&sheet);

        let err = build_decision_source(&cfg).err().expect("missing sheet");
        assert_eq!(err.category(), "CONFIG_ERROR");
    }

    #[test]
    fn skip_mode_keeps_every_prediction() {
        let cfg = RunConfig::resolve(ClassifyRunRequest {
            review_mode: Some(ReviewMode::Skip),
            ..Default::default()
        })
        .expect("resolve");
        let mut source = build_decision_source(&cfg).expect("skip source");
        assert_eq!(source.respond(&prompt_for("COFFEE SHOP")).expect("answer"), "");
    }

    fn scenario_artifact_json() -> Value {
        json!({
            "format_version": 1,
            "vectorizer": {"vocabulary": {"coffee": 0, "shop": 1, "salary": 2}},
            "classifier": {
                "kind": "linear",
                "classes": ["FOOD", "GROCERIES", "INCOME"],
                "coef": [
                    [0.1, 0.1, 0.0, 0.0],
                    [0.0, 0.0, 0.0, 0.0],
                    [0.0, 0.0, 1.0, 0.01]
                ],
                "intercept": [0.0, 0.0, 0.0]
            },
            "feature_layout": {"text_features": 3, "amount_feature_index": 3, "n_features": 4}
        })
    }

    struct RunFiles {
        model: PathBuf,
        source: PathBuf,
        output: PathBuf,
        report: PathBuf,
        decisions: PathBuf,
    }

    impl RunFiles {
        fn create() -> Self {
            let files = Self {
                model: create_temp_path("txn_categorizer_model", "json"),
                source: create_temp_path("txn_categorizer_uncat", "csv"),
                output: create_temp_path("txn_categorizer_cat", "csv"),
                report: create_temp_path("txn_categorizer_report", "csv"),
                decisions: create_temp_path("txn_categorizer_decisions", "csv"),
            };
            fs::write(
                &files.model,
                serde_json::to_vec(&scenario_artifact_json()).expect("serialize artifact"),
            )
            .expect("write model");
            fs::write(
                &files.source,
                "Transaction Date,Transaction Type,Transaction Description,Debit Amount,Credit Amount\n\
                 01/03/2024,DEB,COFFEE SHOP,3.50,\n\
                 02/03/2024,DEB,COFFEE SHOP,4.00,\n\
                 28/03/2024,BGC,SALARY,,2000.00\n",
            )
            .expect("write source");
            files
        }

        fn request(&self) -> ClassifyRunRequest {
            ClassifyRunRequest {
                model_path: Some(self.model.to_string_lossy().to_string()),
                source_path: Some(self.source.to_string_lossy().to_string()),
                output_path: Some(self.output.to_string_lossy().to_string()),
                report_path: Some(self.report.to_string_lossy().to_string()),
                save_decisions_path: Some(self.decisions.to_string_lossy().to_string()),
                ..Default::default()
            }
        }

        fn cleanup(&self) {
            for path in [&self.model, &self.source, &self.output, &self.report, &self.decisions] {
                let _ = fs::remove_file(path);
            }
        }
    }

    #[test]
    fn full_run_writes_labeled_dataset_report_and_decisions() {
        let files = RunFiles::create();
        let mut answers = HashMap::new();
        answers.insert("COFFEE SHOP".to_string(), "dining".to_string());
        let mut source = PreparedDecisions::new(answers);

        let outcome = run_classification(files.request(), &mut source).expect("run");
        let summary = outcome.summary_json();
        assert_eq!(summary["records_count"], 3);
        assert_eq!(summary["accepted_count"], 1);
        assert_eq!(summary["uncertain_count"], 2);
        assert_eq!(summary["review_prompts"], 1);
        assert_eq!(summary["overrides"], 1);
        assert_eq!(summary["overridden_records"], 2);
        assert_eq!(summary["decisions_saved"], 1);
        assert_eq!(summary["artifact_sha1"].as_str().map(str::len), Some(40));
        assert_eq!(summary["column_mapping"]["description"], "Transaction Description");
        assert_eq!(summary["column_mapping"]["debit"], "Debit Amount");

        let labeled = fs::read_to_string(&files.output).expect("read output");
        let lines = labeled.lines().collect::<Vec<_>>();
        assert!(lines[0].ends_with("Credit Amount,Predicted Category,Confidence"));
        assert!(lines[1].starts_with("01/03/2024,DEB,COFFEE SHOP,3.50,,DINING,0.3"));
        assert!(lines[3].starts_with("28/03/2024,BGC,SALARY,,2000.00,INCOME,0.9"));

        let report = fs::read_to_string(&files.report).expect("read report");
        assert_eq!(report, "category,amount,records\nDINING,-7.50,2\nINCOME,2000.00,1\n");

        let saved = fs::read_to_string(&files.decisions).expect("read decisions");
        assert!(saved.contains("COFFEE SHOP,dining,DINING,2"));
        files.cleanup();
    }

    #[test]
    fn rerun_with_same_decisions_is_byte_identical() {
        let files = RunFiles::create();
        let mut answers = HashMap::new();
        answers.insert("COFFEE SHOP".to_string(), "dining".to_string());

        run_classification(files.request(), &mut PreparedDecisions::new(answers.clone())).expect("first");
        let first = fs::read(&files.output).expect("first output");
        run_classification(files.request(), &mut PreparedDecisions::new(answers)).expect("second");
        let second = fs::read(&files.output).expect("second output");
        assert_eq!(first, second);
        files.cleanup();
    }

    #[test]
    fn bad_artifact_fails_before_anything_is_written() {
        let files = RunFiles::create();
        let mut broken = scenario_artifact_json();
        broken["feature_layout"]["n_features"] = json!(7);
        fs::write(&files.model, serde_json::to_vec(&broken).expect("serialize")).expect("write model");

        let err = run_classification(files.request(), &mut KeepPredictions).expect_err("broken model");
        assert_eq!(err.category(), "STARTUP_ERROR");
        assert!(!files.output.exists());
        assert!(!files.report.exists());
        files.cleanup();
    }

    #[test]
    fn failing_review_channel_writes_nothing() {
        struct Broken;
        impl DecisionSource for Broken {
            fn respond(&mut self, _prompt: &ReviewPrompt<'_>) -> Result<String, ClassifyError> {
                Err(ClassifyError::ReviewChannel("terminal went away".to_string()))
            }
        }

        let files = RunFiles::create();
        let err = run_classification(files.request(), &mut Broken).expect_err("review failure");
        assert_eq!(err.category(), "REVIEW_ERROR");
        assert!(!files.output.exists());
        files.cleanup();
    }

    #[test]
    fn preview_reports_pending_groups_without_writing() {
        let files = RunFiles::create();
        let preview = preview_classification(files.request()).expect("preview");
        assert_eq!(preview["records_count"], 3);
        assert_eq!(preview["classes"], json!(["FOOD", "GROCERIES", "INCOME"]));
        assert_eq!(preview["review_prompts"], 1);
        assert_eq!(preview["pending_groups"][0]["description"], "COFFEE SHOP");
        assert_eq!(preview["pending_groups"][0]["uncertain_records"], 2);
        assert!(!files.output.exists());
        files.cleanup();
    }
}
