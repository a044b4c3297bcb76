use regex::Regex;
use std::collections::{BTreeMap, HashMap};

use crate::error::ClassifyError;
use crate::model_artifact::{FeatureLayout, ModelArtifact, TermWeighting, VectorNorm};
use crate::transaction_source::TransactionRecord;

/// Text columns first (sparse), signed amount as the final column.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    text: Vec<(usize, f64)>,
    amount: f64,
    width: usize,
}

impl FeatureVector {
    pub(crate) fn from_parts(text: Vec<(usize, f64)>, amount: f64, width: usize) -> Self {
        Self {
            text,
            amount,
            width,
        }
    }

    pub fn len(&self) -> usize {
        self.width
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0
    }

    pub fn text_entries(&self) -> &[(usize, f64)] {
        &self.text
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn amount_index(&self) -> usize {
        self.width.saturating_sub(1)
    }

    /// False when no description token was in the vocabulary.
    pub fn has_text_signal(&self) -> bool {
        self.text.iter().any(|(_, v)| *v != 0.0)
    }

    pub fn to_dense(&self) -> Vec<f64> {
        let mut dense = vec![0.0; self.width];
        for (idx, value) in &self.text {
            if let Some(slot) = dense.get_mut(*idx) {
                *slot = *value;
            }
        }
        if let Some(last) = dense.last_mut() {
            *last = self.amount;
        }
        dense
    }
}

/// Frozen bag-of-tokens vectorizer. Never refit here.
#[derive(Debug, Clone)]
pub struct TextVectorizer {
    vocabulary: HashMap<String, usize>,
    lowercase: bool,
    token_re: Regex,
    ngram_range: (usize, usize),
    weighting: TermWeighting,
    idf: Option<Vec<f64>>,
    sublinear_tf: bool,
    norm: Option<VectorNorm>,
}

impl TextVectorizer {
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self, ClassifyError> {
        let spec = &artifact.vectorizer;
        let token_re = Regex::new(spec.token_pattern()).map_err(|e| {
            ClassifyError::IncompatibleArtifact(format!("invalid token_pattern: {e}"))
        })?;
        Ok(Self {
            vocabulary: spec.vocabulary.clone(),
            lowercase: spec.lowercase,
            token_re,
            ngram_range: spec.ngram_range(),
            weighting: spec.weighting(),
            idf: spec.idf.clone(),
            sublinear_tf: spec.sublinear_tf,
            norm: spec.effective_norm(),
        })
    }

    pub fn width(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let text = if self.lowercase {
            text.to_lowercase()
        } else {
            text.to_string()
        };
        let words = self
            .token_re
            .find_iter(&text)
            .map(|m| m.as_str().to_string())
            .collect::<Vec<_>>();

        let (min_n, max_n) = self.ngram_range;
        if (min_n, max_n) == (1, 1) {
            return words;
        }
        let mut terms = Vec::new();
        for n in min_n..=max_n.min(words.len()) {
            for window in words.windows(n) {
                terms.push(window.join(" "));
            }
        }
        terms
    }

    pub fn transform(&self, text: &str) -> Vec<(usize, f64)> {
        let mut counts = BTreeMap::<usize, f64>::new();
        for term in self.tokenize(text) {
            if let Some(idx) = self.vocabulary.get(&term) {
                *counts.entry(*idx).or_insert(0.0) += 1.0;
            }
        }

        let mut entries = counts
            .into_iter()
            .map(|(idx, count)| (idx, self.weigh(idx, count)))
            .collect::<Vec<_>>();

        let scale = match self.norm {
            Some(VectorNorm::L2) => entries.iter().map(|(_, v)| v * v).sum::<f64>().sqrt(),
            Some(VectorNorm::L1) => entries.iter().map(|(_, v)| v.abs()).sum::<f64>(),
            Some(VectorNorm::None) | None => 1.0,
        };
        if scale > 0.0 && scale != 1.0 {
            for (_, v) in &mut entries {
                *v /= scale;
            }
        }
        entries
    }

    fn weigh(&self, idx: usize, count: f64) -> f64 {
        match self.weighting {
            TermWeighting::Binary => 1.0,
            TermWeighting::Count => count,
            TermWeighting::Tfidf => {
                let tf = if self.sublinear_tf { 1.0 + count.ln() } else { count };
                let idf = self
                    .idf
                    .as_ref()
                    .and_then(|w| w.get(idx))
                    .copied()
                    .unwrap_or(1.0);
                tf * idf
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    vectorizer: TextVectorizer,
    layout: FeatureLayout,
}

impl FeatureExtractor {
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self, ClassifyError> {
        let vectorizer = TextVectorizer::from_artifact(artifact)?;
        let layout = artifact.feature_layout;
        if vectorizer.width() != layout.text_features {
            return Err(ClassifyError::DimensionMismatch {
                expected: layout.text_features,
                actual: vectorizer.width(),
            });
        }
        Ok(Self { vectorizer, layout })
    }

    pub fn layout(&self) -> FeatureLayout {
        self.layout
    }

    pub fn vectorizer(&self) -> &TextVectorizer {
        &self.vectorizer
    }

    pub fn extract(&self, description: &str, amount: f64) -> FeatureVector {
        FeatureVector::from_parts(
            self.vectorizer.transform(description),
            amount,
            self.layout.n_features,
        )
    }

    pub fn extract_record(&self, record: &TransactionRecord) -> FeatureVector {
        self.extract(&record.description, record.amount())
    }
}
