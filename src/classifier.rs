use crate::error::ClassifyError;
use crate::features::{FeatureExtractor, FeatureVector};
use crate::model_artifact::ModelArtifact;
use crate::transaction_source::TransactionTable;

/// Per-class probabilities in the classifier's class order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDistribution {
    pub entries: Vec<(String, f64)>,
}

impl ClassDistribution {
    /// Highest-probability class; ties resolve to the earliest class.
    pub fn top(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (category, p) in &self.entries {
            if best.map(|(_, bp)| *p > bp).unwrap_or(true) {
                best = Some((category.as_str(), *p));
            }
        }
        best
    }

    pub fn probability(&self, category: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(c, _)| c == category)
            .map(|(_, p)| *p)
    }

    pub fn total(&self) -> f64 {
        self.entries.iter().map(|(_, p)| p).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub category: String,
    /// Maximum class probability for this record.
    pub confidence: f64,
}

pub trait TransactionClassifier {
    fn classes(&self) -> &[String];

    fn n_features(&self) -> usize;

    fn predict_distribution(&self, features: &FeatureVector) -> Result<ClassDistribution, ClassifyError>;

    fn predict(&self, features: &FeatureVector) -> Result<String, ClassifyError> {
        Ok(self.predict_with_confidence(features)?.category)
    }

    fn predict_with_confidence(&self, features: &FeatureVector) -> Result<Prediction, ClassifyError> {
        let dist = self.predict_distribution(features)?;
        let (category, confidence) = dist.top().ok_or_else(|| {
            ClassifyError::IncompatibleArtifact("classifier returned no classes".to_string())
        })?;
        Ok(Prediction {
            category: category.to_string(),
            confidence,
        })
    }
}

/// Logistic-regression style model: `intercept + coef · x`, softmax over
/// classes, or the logistic function for single-row binary models.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    classes: Vec<String>,
    coef: Vec<Vec<f64>>,
    intercept: Vec<f64>,
    n_features: usize,
}

impl LinearClassifier {
    pub fn from_artifact(artifact: &ModelArtifact) -> Self {
        let spec = &artifact.classifier;
        Self {
            classes: spec.classes.clone(),
            coef: spec.coef.clone(),
            intercept: spec.intercept.clone(),
            n_features: artifact.feature_layout.n_features,
        }
    }

    fn decision_scores(&self, features: &FeatureVector) -> Vec<f64> {
        let amount_idx = features.amount_index();
        self.coef
            .iter()
            .zip(&self.intercept)
            .map(|(row, b)| {
                let text: f64 = features
                    .text_entries()
                    .iter()
                    .map(|(idx, v)| row[*idx] * v)
                    .sum();
                b + text + row[amount_idx] * features.amount()
            })
            .collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps = scores.iter().map(|s| (s - max).exp()).collect::<Vec<_>>();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

impl TransactionClassifier for LinearClassifier {
    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_distribution(&self, features: &FeatureVector) -> Result<ClassDistribution, ClassifyError> {
        if features.len() != self.n_features {
            return Err(ClassifyError::DimensionMismatch {
                expected: self.n_features,
                actual: features.len(),
            });
        }
        if let Some((idx, _)) = features.text_entries().iter().find(|(idx, _)| *idx >= self.n_features - 1) {
            return Err(ClassifyError::DimensionMismatch {
                expected: self.n_features,
                actual: idx + 2,
            });
        }

        let scores = self.decision_scores(features);
        let probs = if scores.len() == 1 {
            let p = sigmoid(scores[0]);
            vec![1.0 - p, p]
        } else {
            softmax(&scores)
        };
        Ok(ClassDistribution {
            entries: self.classes.iter().cloned().zip(probs).collect(),
        })
    }
}

/// Extracts features and predicts every record once, in input order.
pub fn predict_table(
    extractor: &FeatureExtractor,
    classifier: &dyn TransactionClassifier,
    table: &TransactionTable,
) -> Result<Vec<Prediction>, ClassifyError> {
    if extractor.layout().n_features != classifier.n_features() {
        return Err(ClassifyError::DimensionMismatch {
            expected: classifier.n_features(),
            actual: extractor.layout().n_features,
        });
    }
    let mut out = Vec::with_capacity(table.len());
    let mut text_misses = 0_usize;
    for record in &table.records {
        let features = extractor.extract_record(record);
        if !features.has_text_signal() {
            text_misses += 1;
        }
        out.push(classifier.predict_with_confidence(&features)?);
    }
    if text_misses > 0 {
        log::info!("{text_misses} description(s) had no vocabulary overlap; amount only");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_artifact::tests::sample_artifact;
    use serde_json::json;

    fn sample() -> (FeatureExtractor, LinearClassifier) {
        let artifact = sample_artifact();
        (
            FeatureExtractor::from_artifact(&artifact).expect("extractor"),
            LinearClassifier::from_artifact(&artifact),
        )
    }

    #[test]
    fn distribution_sums_to_one_and_confidence_is_its_max() {
        let (extractor, clf) = sample();
        let v = extractor.extract("COFFEE SHOP", -3.5);
        let dist = clf.predict_distribution(&v).expect("distribution");
        assert!((dist.total() - 1.0).abs() < 1e-12);
        let pred = clf.predict_with_confidence(&v).expect("prediction");
        assert_eq!(pred.category, "FOOD");
        let max = dist.entries.iter().map(|(_, p)| *p).fold(0.0, f64::max);
        assert_eq!(pred.confidence, max);
        assert_eq!(clf.predict(&v).expect("predict"), "FOOD");
    }

    #[test]
    fn amount_alone_drives_out_of_vocabulary_records() {
        let (extractor, clf) = sample();
        let v = extractor.extract("ACME PAYROLL", 2000.0);
        assert!(!v.has_text_signal());
        let pred = clf.predict_with_confidence(&v).expect("prediction");
        assert_eq!(pred.category, "INCOME");
        assert!(pred.confidence > 0.99);
    }

    #[test]
    fn wrong_width_is_rejected_before_scoring() {
        let (_, clf) = sample();
        let short = FeatureVector::from_parts(vec![(0, 1.0)], 1.0, 4);
        assert!(matches!(
            clf.predict_distribution(&short),
            Err(ClassifyError::DimensionMismatch { expected: 5, actual: 4 })
        ));
        let stray = FeatureVector::from_parts(vec![(4, 1.0)], 1.0, 5);
        assert!(matches!(
            clf.predict_distribution(&stray),
            Err(ClassifyError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn binary_single_row_model_uses_logistic_function() {
        let value = json!({
            "format_version": 1,
            "vectorizer": {"vocabulary": {"rent": 0}},
            "classifier": {
                "kind": "linear",
                "classes": ["HOUSING", "OTHER"],
                "coef": [[-2.0, 0.0]],
                "intercept": [0.0]
            },
            "feature_layout": {"text_features": 1, "amount_feature_index": 1, "n_features": 2}
        });
        let bytes = serde_json::to_vec(&value).expect("serialize");
        let artifact = ModelArtifact::from_slice(&bytes).expect("artifact");
        let extractor = FeatureExtractor::from_artifact(&artifact).expect("extractor");
        let clf = LinearClassifier::from_artifact(&artifact);

        let rent = clf
            .predict_with_confidence(&extractor.extract("RENT", -900.0))
            .expect("rent");
        assert_eq!(rent.category, "HOUSING");
        let unknown = clf
            .predict_distribution(&extractor.extract("???", 10.0))
            .expect("unknown");
        assert_eq!(unknown.probability("HOUSING"), Some(0.5));
        // Exact tie goes to the first class.
        assert_eq!(unknown.top(), Some(("HOUSING", 0.5)));
    }

    #[test]
    fn repeated_prediction_is_identical() {
        let (extractor, clf) = sample();
        let v = extractor.extract("TESCO STORES", -42.1);
        let a = clf.predict_with_confidence(&v).expect("first");
        let b = clf.predict_with_confidence(&v).expect("second");
        assert_eq!(a, b);
    }
}
