//! Trained model bundle: a frozen text vectorizer, a linear classifier and
//! the feature layout both sides were trained against.
//!
//! The bundle is exported from the training side as JSON. Loading either
//! yields a fully validated [`ModelArtifact`] or fails; nothing downstream
//! ever sees a partially checked model.

use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::ClassifyError;

pub const SUPPORTED_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_TOKEN_PATTERN: &str = r"(?u)\b\w\w+\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermWeighting {
    Count,
    Binary,
    Tfidf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorNorm {
    L1,
    L2,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Linear,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorizerSpec {
    pub vocabulary: HashMap<String, usize>,
    #[serde(default = "default_true")]
    pub lowercase: bool,
    #[serde(default)]
    pub token_pattern: Option<String>,
    #[serde(default)]
    pub ngram_range: Option<(usize, usize)>,
    #[serde(default)]
    pub weighting: Option<TermWeighting>,
    #[serde(default)]
    pub idf: Option<Vec<f64>>,
    #[serde(default)]
    pub sublinear_tf: bool,
    /// Absent or `null` falls back to the weighting default.
    #[serde(default)]
    pub norm: Option<VectorNorm>,
}

fn default_true() -> bool {
    true
}

impl VectorizerSpec {
    pub fn width(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn weighting(&self) -> TermWeighting {
        self.weighting.unwrap_or(TermWeighting::Count)
    }

    pub fn effective_norm(&self) -> Option<VectorNorm> {
        match (self.norm, self.weighting()) {
            (Some(VectorNorm::None), _) => None,
            (Some(norm), _) => Some(norm),
            (None, TermWeighting::Tfidf) => Some(VectorNorm::L2),
            (None, _) => None,
        }
    }

    pub fn token_pattern(&self) -> &str {
        self.token_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_TOKEN_PATTERN)
    }

    pub fn ngram_range(&self) -> (usize, usize) {
        self.ngram_range.unwrap_or((1, 1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierSpec {
    pub kind: ClassifierKind,
    pub classes: Vec<String>,
    pub coef: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
}

/// Column ordering shared by the feature extractor and the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FeatureLayout {
    pub text_features: usize,
    pub amount_feature_index: usize,
    pub n_features: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub vectorizer: VectorizerSpec,
    pub classifier: ClassifierSpec,
    pub feature_layout: FeatureLayout,
    #[serde(skip)]
    pub fingerprint: String,
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn incompatible(msg: impl Into<String>) -> ClassifyError {
    ClassifyError::IncompatibleArtifact(msg.into())
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

impl ModelArtifact {
    pub fn load(path: &Path) -> Result<Self, ClassifyError> {
        let bytes = fs::read(path).map_err(|e| ClassifyError::artifact(path, e.to_string()))?;
        let artifact = Self::from_slice(&bytes).map_err(|e| match e {
            ClassifyError::Json(err) => ClassifyError::artifact(path, format!("malformed JSON: {err}")),
            other => other,
        })?;
        log::info!(
            "loaded model {} ({} classes, {} features, sha1 {})",
            path.to_string_lossy(),
            artifact.classes().len(),
            artifact.feature_layout.n_features,
            &artifact.fingerprint[..12]
        );
        Ok(artifact)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ClassifyError> {
        let mut artifact: ModelArtifact = serde_json::from_slice(bytes)?;
        artifact.fingerprint = sha1_hex(bytes);
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn classes(&self) -> &[String] {
        &self.classifier.classes
    }

    pub fn validate(&self) -> Result<(), ClassifyError> {
        if self.format_version != SUPPORTED_FORMAT_VERSION {
            return Err(incompatible(format!(
                "unsupported format_version {} (expected {SUPPORTED_FORMAT_VERSION})",
                self.format_version
            )));
        }
        self.validate_vectorizer()?;
        self.validate_layout()?;
        self.validate_classifier()
    }

    fn validate_vectorizer(&self) -> Result<(), ClassifyError> {
        let vec = &self.vectorizer;
        let width = vec.width();
        if width == 0 {
            return Err(incompatible("vectorizer vocabulary is empty"));
        }
        let mut seen = vec![false; width];
        for (token, idx) in &vec.vocabulary {
            match seen.get_mut(*idx) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => {
                    return Err(incompatible(format!(
                        "vocabulary column {idx} is assigned twice (token {token:?})"
                    )))
                }
                None => {
                    return Err(incompatible(format!(
                        "vocabulary column {idx} for token {token:?} is outside 0..{width}"
                    )))
                }
            }
        }

        let (min_n, max_n) = vec.ngram_range();
        if min_n == 0 || min_n > max_n {
            return Err(incompatible(format!("invalid ngram_range ({min_n}, {max_n})")));
        }
        regex::Regex::new(vec.token_pattern())
            .map_err(|e| incompatible(format!("invalid token_pattern: {e}")))?;

        match (vec.weighting(), &vec.idf) {
            (TermWeighting::Tfidf, None) => Err(incompatible("tfidf weighting requires idf")),
            (TermWeighting::Tfidf, Some(idf)) if idf.len() != width => Err(incompatible(format!(
                "idf has {} entries but the vocabulary has {width}",
                idf.len()
            ))),
            (_, Some(idf)) if !all_finite(idf) => Err(incompatible("idf contains non-finite values")),
            _ => Ok(()),
        }
    }

    fn validate_layout(&self) -> Result<(), ClassifyError> {
        let layout = self.feature_layout;
        let width = self.vectorizer.width();
        if layout.text_features != width {
            return Err(incompatible(format!(
                "feature_layout.text_features is {} but the vocabulary has {width} columns",
                layout.text_features
            )));
        }
        if layout.amount_feature_index != layout.text_features {
            return Err(incompatible(format!(
                "amount must be the last feature (index {}), found index {}",
                layout.text_features, layout.amount_feature_index
            )));
        }
        if layout.n_features != layout.text_features + 1 {
            return Err(incompatible(format!(
                "feature_layout.n_features is {} but text + amount is {}",
                layout.n_features,
                layout.text_features + 1
            )));
        }
        Ok(())
    }

    fn validate_classifier(&self) -> Result<(), ClassifyError> {
        let clf = &self.classifier;
        let n_classes = clf.classes.len();
        if n_classes < 2 {
            return Err(incompatible("classifier needs at least two classes"));
        }
        if clf.classes.iter().any(|c| c.is_empty()) {
            return Err(incompatible("classifier has an empty class label"));
        }
        let expected_rows = if n_classes == 2 { [1, 2] } else { [n_classes, n_classes] };
        if !expected_rows.contains(&clf.coef.len()) {
            return Err(incompatible(format!(
                "coef has {} rows for {n_classes} classes",
                clf.coef.len()
            )));
        }
        if clf.intercept.len() != clf.coef.len() {
            return Err(incompatible(format!(
                "intercept has {} entries but coef has {} rows",
                clf.intercept.len(),
                clf.coef.len()
            )));
        }
        let n_features = self.feature_layout.n_features;
        for (row_idx, row) in clf.coef.iter().enumerate() {
            if row.len() != n_features {
                return Err(ClassifyError::DimensionMismatch {
                    expected: row.len(),
                    actual: n_features,
                });
            }
            if !all_finite(row) {
                return Err(incompatible(format!("coef row {row_idx} has non-finite weights")));
            }
        }
        if !all_finite(&clf.intercept) {
            return Err(incompatible("intercept has non-finite values"));
        }
        Ok(())
    }
}
