//! Human review of uncertain predictions.
//!
//! Every distinct uncertain description is one [`ReviewItem`] that moves
//! from `Pending` to `Resolved` exactly once. Answers come from a
//! [`DecisionSource`]: the console in normal use, a prepared answer sheet
//! for replays and tests. A resolved override is keyed by description, so
//! it reaches every record with that description when labels are merged,
//! including rows that were confident enough to skip the gate.

use csv::{ReaderBuilder, WriterBuilder};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;

use crate::classifier::Prediction;
use crate::confidence_gate::UncertainGroup;
use crate::error::ClassifyError;
use crate::transaction_source::TransactionRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    KeepPrediction,
    Override(String),
}

fn strip_line_terminator(raw: &str) -> &str {
    let raw = raw.strip_suffix('\n').unwrap_or(raw);
    raw.strip_suffix('\r').unwrap_or(raw)
}

impl ReviewDecision {
    /// Empty means keep; anything else is taken verbatim and upper-cased.
    pub fn from_response(raw: &str) -> Self {
        let text = strip_line_terminator(raw);
        if text.is_empty() {
            Self::KeepPrediction
        } else {
            Self::Override(text.to_uppercase())
        }
    }

    pub fn override_category(&self) -> Option<&str> {
        match self {
            Self::KeepPrediction => None,
            Self::Override(category) => Some(category.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewState {
    Pending,
    Resolved {
        response: String,
        decision: ReviewDecision,
    },
}

#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub description: String,
    pub uncertain_rows: Vec<usize>,
    /// Every row with this description, including accepted ones.
    pub affected_rows: usize,
    /// Distinct machine predictions among the uncertain rows, first seen first.
    pub predicted_categories: Vec<String>,
    pub min_confidence: f64,
    pub state: ReviewState,
}

impl ReviewItem {
    pub fn is_pending(&self) -> bool {
        matches!(self.state, ReviewState::Pending)
    }

    pub fn decision(&self) -> Option<&ReviewDecision> {
        match &self.state {
            ReviewState::Pending => None,
            ReviewState::Resolved { decision, .. } => Some(decision),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReviewPrompt<'a> {
    pub position: usize,
    pub total: usize,
    pub description: &'a str,
    pub predicted_categories: &'a [String],
    pub uncertain_records: usize,
    pub affected_records: usize,
    pub min_confidence: f64,
}

pub trait DecisionSource {
    /// Returns the raw response line for one prompt.
    fn respond(&mut self, prompt: &ReviewPrompt<'_>) -> Result<String, ClassifyError>;
}

/// Line-oriented prompt over any reader/writer pair.
pub struct ConsoleDecisionSource<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsoleDecisionSource<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

impl ConsoleDecisionSource<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

fn channel_err(e: io::Error) -> ClassifyError {
    ClassifyError::ReviewChannel(e.to_string())
}

impl<R: BufRead, W: Write> DecisionSource for ConsoleDecisionSource<R, W> {
    fn respond(&mut self, prompt: &ReviewPrompt<'_>) -> Result<String, ClassifyError> {
        let out = &mut self.output;
        writeln!(out).map_err(channel_err)?;
        writeln!(
            out,
            "[{}/{}] Transaction description: {}.",
            prompt.position, prompt.total, prompt.description
        )
        .map_err(channel_err)?;
        writeln!(
            out,
            "Predicted category: {} (confidence {:.2}, {} record(s))",
            prompt.predicted_categories.join(" / "),
            prompt.min_confidence,
            prompt.affected_records
        )
        .map_err(channel_err)?;
        writeln!(
            out,
            "Press enter to keep the predicted category. Else, type the desired category."
        )
        .map_err(channel_err)?;
        write!(out, "Category: ").map_err(channel_err)?;
        out.flush().map_err(channel_err)?;

        let mut line = String::new();
        let read = self.input.read_line(&mut line).map_err(channel_err)?;
        if read == 0 {
            log::warn!(
                "review input closed at {:?}; keeping the prediction",
                prompt.description
            );
            writeln!(self.output).map_err(channel_err)?;
        }
        Ok(strip_line_terminator(&line).to_string())
    }
}

/// Keeps every machine prediction.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepPredictions;

impl DecisionSource for KeepPredictions {
    fn respond(&mut self, _prompt: &ReviewPrompt<'_>) -> Result<String, ClassifyError> {
        Ok(String::new())
    }
}

/// Answers looked up by exact description, e.g. from an earlier run.
#[derive(Default)]
pub struct PreparedDecisions {
    answers: HashMap<String, String>,
    fallback: Option<Box<dyn DecisionSource>>,
}

impl PreparedDecisions {
    pub fn new(answers: HashMap<String, String>) -> Self {
        Self {
            answers,
            fallback: None,
        }
    }

    /// Descriptions without a prepared answer are asked of `fallback`.
    pub fn with_fallback(mut self, fallback: Box<dyn DecisionSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Reads a `description,category` sheet. Cells are not trimmed.
    pub fn from_csv_path(path: &Path) -> Result<Self, ClassifyError> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| {
                ClassifyError::Config(format!(
                    "cannot read decisions {}: {e}",
                    path.to_string_lossy()
                ))
            })?;
        let headers = reader.headers()?.clone();
        let position = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
        let (Some(desc_idx), Some(cat_idx)) = (position("description"), position("category")) else {
            return Err(ClassifyError::Config(format!(
                "decisions file {} needs description and category columns",
                path.to_string_lossy()
            )));
        };

        let mut answers = HashMap::new();
        for rec in reader.records() {
            let rec = rec?;
            // An empty description is a real group; only short rows are skipped.
            let Some(description) = rec.get(desc_idx) else {
                continue;
            };
            let category = rec.get(cat_idx).unwrap_or_default();
            answers.insert(description.to_string(), category.to_string());
        }
        log::info!(
            "loaded {} prepared decision(s) from {}",
            answers.len(),
            path.to_string_lossy()
        );
        Ok(Self::new(answers))
    }
}

impl DecisionSource for PreparedDecisions {
    fn respond(&mut self, prompt: &ReviewPrompt<'_>) -> Result<String, ClassifyError> {
        if let Some(answer) = self.answers.get(prompt.description) {
            return Ok(answer.clone());
        }
        match self.fallback.as_mut() {
            Some(fallback) => fallback.respond(prompt),
            None => Ok(String::new()),
        }
    }
}

/// Resolved decisions keyed by exact description, in review order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewDecisions {
    order: Vec<String>,
    by_description: HashMap<String, ReviewDecision>,
}

impl ReviewDecisions {
    pub fn insert(&mut self, description: impl Into<String>, decision: ReviewDecision) {
        let description = description.into();
        if !self.by_description.contains_key(&description) {
            self.order.push(description.clone());
        }
        self.by_description.insert(description, decision);
    }

    pub fn get(&self, description: &str) -> Option<&ReviewDecision> {
        self.by_description.get(description)
    }

    pub fn override_for(&self, description: &str) -> Option<&str> {
        self.get(description).and_then(ReviewDecision::override_category)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn override_count(&self) -> usize {
        self.by_description
            .values()
            .filter(|d| d.override_category().is_some())
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReviewDecision)> {
        self.order
            .iter()
            .filter_map(|d| self.by_description.get(d).map(|dec| (d.as_str(), dec)))
    }
}

#[derive(Debug, Clone)]
pub struct ReviewQueue {
    items: Vec<ReviewItem>,
}

impl ReviewQueue {
    pub fn new(
        records: &[TransactionRecord],
        predictions: &[Prediction],
        groups: Vec<UncertainGroup>,
    ) -> Self {
        let mut per_description: HashMap<&str, usize> = HashMap::new();
        for record in records {
            *per_description.entry(record.description.as_str()).or_insert(0) += 1;
        }

        let items = groups
            .into_iter()
            .map(|group| {
                let mut predicted_categories = Vec::<String>::new();
                let mut min_confidence = f64::INFINITY;
                for pred in group.rows.iter().filter_map(|r| predictions.get(*r)) {
                    if !predicted_categories.contains(&pred.category) {
                        predicted_categories.push(pred.category.clone());
                    }
                    min_confidence = min_confidence.min(pred.confidence);
                }
                ReviewItem {
                    affected_rows: per_description
                        .get(group.description.as_str())
                        .copied()
                        .unwrap_or(group.rows.len()),
                    description: group.description,
                    uncertain_rows: group.rows,
                    predicted_categories,
                    min_confidence: if min_confidence.is_finite() { min_confidence } else { 0.0 },
                    state: ReviewState::Pending,
                }
            })
            .collect();
        Self { items }
    }

    pub fn items(&self) -> &[ReviewItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_pending()).count()
    }

    /// Records a response for one pending item. Resolved items are terminal.
    pub fn resolve(&mut self, position: usize, response: &str) -> Result<&ReviewDecision, ClassifyError> {
        let item = self.items.get_mut(position).ok_or_else(|| {
            ClassifyError::ReviewChannel(format!("no review item at position {position}"))
        })?;
        if !item.is_pending() {
            return Err(ClassifyError::ReviewChannel(format!(
                "{:?} was already reviewed",
                item.description
            )));
        }
        let decision = ReviewDecision::from_response(response);
        match &decision {
            ReviewDecision::KeepPrediction => {
                log::debug!("kept prediction for {:?}", item.description)
            }
            ReviewDecision::Override(category) => log::debug!(
                "{:?} -> {category} ({} record(s))",
                item.description,
                item.affected_rows
            ),
        }
        item.state = ReviewState::Resolved {
            response: strip_line_terminator(response).to_string(),
            decision,
        };
        item.decision().ok_or_else(|| {
            ClassifyError::ReviewChannel(format!("{:?} did not resolve", item.description))
        })
    }

    /// Asks `source` about every pending item, in order, once each.
    pub fn run(&mut self, source: &mut dyn DecisionSource) -> Result<(), ClassifyError> {
        let total = self.items.len();
        for position in 0..total {
            if !self.items[position].is_pending() {
                continue;
            }
            let response = {
                let item = &self.items[position];
                let prompt = ReviewPrompt {
                    position: position + 1,
                    total,
                    description: &item.description,
                    predicted_categories: &item.predicted_categories,
                    uncertain_records: item.uncertain_rows.len(),
                    affected_records: item.affected_rows,
                    min_confidence: item.min_confidence,
                };
                source.respond(&prompt)?
            };
            self.resolve(position, &response)?;
        }
        Ok(())
    }

    /// Fails while anything is still pending.
    pub fn decisions(&self) -> Result<ReviewDecisions, ClassifyError> {
        let pending = self.pending_count();
        if pending > 0 {
            return Err(ClassifyError::ReviewIncomplete { pending });
        }
        let mut out = ReviewDecisions::default();
        for item in &self.items {
            if let Some(decision) = item.decision() {
                out.insert(item.description.clone(), decision.clone());
            }
        }
        Ok(out)
    }
}

const DECISION_HEADERS: &[&str] = &["description", "response", "category", "records"];

/// Writes resolved items as a sheet that [`PreparedDecisions::from_csv_path`] can replay.
pub fn save_decisions(path: &Path, queue: &ReviewQueue) -> Result<usize, ClassifyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    writer.write_record(DECISION_HEADERS)?;
    let mut written = 0_usize;
    for item in queue.items() {
        let ReviewState::Resolved { response, decision } = &item.state else {
            continue;
        };
        writer.write_record([
            item.description.as_str(),
            response.as_str(),
            decision.override_category().unwrap_or_default(),
            item.affected_rows.to_string().as_str(),
        ])?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}
