use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ClassifyError;

pub const DEFAULT_MODEL_PATH: &str = "transaction_clf.json";
pub const DEFAULT_SOURCE_PATH: &str = "data/uncat_data.csv";
pub const DEFAULT_OUTPUT_PATH: &str = "data/cat_data.csv";
pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.5;
pub const DEFAULT_NON_REPORTABLE_CATEGORIES: &[&str] = &["FAMILY", "IGNORE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    /// Prompt on the console for every uncertain description.
    Interactive,
    /// Answer from a prepared decisions file; unknown descriptions keep the prediction.
    Replay,
    /// Answer from a prepared decisions file, prompt for the rest.
    ReplayThenPrompt,
    /// Keep every machine prediction.
    Skip,
}

impl ReviewMode {
    pub fn parse(raw: &str) -> Result<Self, ClassifyError> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "" | "interactive" => Ok(Self::Interactive),
            "replay" => Ok(Self::Replay),
            "replay_then_prompt" => Ok(Self::ReplayThenPrompt),
            "skip" | "none" => Ok(Self::Skip),
            other => Err(ClassifyError::Config(format!(
                "unsupported review_mode: {other} (interactive, replay, replay_then_prompt, skip)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Replay => "replay",
            Self::ReplayThenPrompt => "replay_then_prompt",
            Self::Skip => "skip",
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ClassifyRunRequest {
    pub model_path: Option<String>,
    pub source_path: Option<String>,
    pub output_path: Option<String>,
    pub report_path: Option<String>,
    pub decisions_path: Option<String>,
    pub save_decisions_path: Option<String>,
    pub review_threshold: Option<f64>,
    pub non_reportable_categories: Option<Vec<String>>,
    pub review_mode: Option<ReviewMode>,
}

impl ClassifyRunRequest {
    pub fn from_json_file(path: &Path) -> Result<Self, ClassifyError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ClassifyError::Config(format!("cannot read config {}: {e}", path.to_string_lossy()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ClassifyError::Config(format!("invalid config {}: {e}", path.to_string_lossy()))
        })
    }

    /// Fields set on `overrides` win over the ones already present.
    pub fn merged_with(self, overrides: ClassifyRunRequest) -> Self {
        Self {
            model_path: overrides.model_path.or(self.model_path),
            source_path: overrides.source_path.or(self.source_path),
            output_path: overrides.output_path.or(self.output_path),
            report_path: overrides.report_path.or(self.report_path),
            decisions_path: overrides.decisions_path.or(self.decisions_path),
            save_decisions_path: overrides.save_decisions_path.or(self.save_decisions_path),
            review_threshold: overrides.review_threshold.or(self.review_threshold),
            non_reportable_categories: overrides
                .non_reportable_categories
                .or(self.non_reportable_categories),
            review_mode: overrides.review_mode.or(self.review_mode),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model_path: PathBuf,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub report_path: Option<PathBuf>,
    pub decisions_path: Option<PathBuf>,
    pub save_decisions_path: Option<PathBuf>,
    pub review_threshold: f64,
    pub non_reportable_categories: Vec<String>,
    pub review_mode: ReviewMode,
}

fn resolve_path(raw: Option<String>, field: &str, default: &str) -> Result<PathBuf, ClassifyError> {
    match raw {
        None => Ok(PathBuf::from(default)),
        Some(text) => resolve_optional_path(Some(text), field)?
            .ok_or_else(|| ClassifyError::Config(format!("{field} must not be empty"))),
    }
}

fn resolve_optional_path(raw: Option<String>, field: &str) -> Result<Option<PathBuf>, ClassifyError> {
    match raw {
        None => Ok(None),
        Some(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Err(ClassifyError::Config(format!("{field} must not be empty")));
            }
            Ok(Some(PathBuf::from(text)))
        }
    }
}

pub fn resolve_review_threshold(raw: Option<f64>) -> Result<f64, ClassifyError> {
    let v = raw.unwrap_or(DEFAULT_REVIEW_THRESHOLD);
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(ClassifyError::Config(
            "review_threshold must be between 0 and 1".to_string(),
        ));
    }
    Ok(v)
}

pub fn normalize_category_list(raw: Option<Vec<String>>) -> Vec<String> {
    let mut out = Vec::new();
    let items = raw.unwrap_or_else(|| {
        DEFAULT_NON_REPORTABLE_CATEGORIES
            .iter()
            .map(|s| s.to_string())
            .collect()
    });
    for item in items {
        let category = item.trim().to_uppercase();
        if !category.is_empty() && !out.contains(&category) {
            out.push(category);
        }
    }
    out
}

impl RunConfig {
    pub fn resolve(req: ClassifyRunRequest) -> Result<Self, ClassifyError> {
        let review_mode = req.review_mode.unwrap_or(ReviewMode::Interactive);
        let decisions_path = resolve_optional_path(req.decisions_path, "decisions_path")?;
        if matches!(review_mode, ReviewMode::Replay | ReviewMode::ReplayThenPrompt)
            && decisions_path.is_none()
        {
            return Err(ClassifyError::Config(format!(
                "review_mode {} requires decisions_path",
                review_mode.as_str()
            )));
        }

        Ok(Self {
            model_path: resolve_path(req.model_path, "model_path", DEFAULT_MODEL_PATH)?,
            source_path: resolve_path(req.source_path, "source_path", DEFAULT_SOURCE_PATH)?,
            output_path: resolve_path(req.output_path, "output_path", DEFAULT_OUTPUT_PATH)?,
            report_path: resolve_optional_path(req.report_path, "report_path")?,
            decisions_path,
            save_decisions_path: resolve_optional_path(
                req.save_decisions_path,
                "save_decisions_path",
            )?,
            review_threshold: resolve_review_threshold(req.review_threshold)?,
            non_reportable_categories: normalize_category_list(req.non_reportable_categories),
            review_mode,
        })
    }
}
