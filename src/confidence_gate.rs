use std::collections::HashMap;

use crate::classifier::Prediction;
use crate::transaction_source::TransactionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Accepted,
    Uncertain,
}

/// Acceptance needs confidence strictly above the threshold.
pub fn verdict(confidence: f64, threshold: f64) -> GateVerdict {
    if confidence > threshold {
        GateVerdict::Accepted
    } else {
        GateVerdict::Uncertain
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub threshold: f64,
    pub accepted: Vec<usize>,
    pub uncertain: Vec<usize>,
}

pub fn partition(predictions: &[Prediction], threshold: f64) -> GateOutcome {
    let mut accepted = Vec::new();
    let mut uncertain = Vec::new();
    for (row, pred) in predictions.iter().enumerate() {
        match verdict(pred.confidence, threshold) {
            GateVerdict::Accepted => accepted.push(row),
            GateVerdict::Uncertain => uncertain.push(row),
        }
    }
    GateOutcome {
        threshold,
        accepted,
        uncertain,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UncertainGroup {
    pub description: String,
    /// Uncertain rows carrying this exact description, ascending.
    pub rows: Vec<usize>,
}

/// Groups uncertain rows by exact description, in order of first appearance.
/// No trimming or case folding: "Shop" and "SHOP " are different groups.
pub fn group_uncertain(records: &[TransactionRecord], outcome: &GateOutcome) -> Vec<UncertainGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<UncertainGroup> = Vec::new();
    for &row in &outcome.uncertain {
        let Some(record) = records.get(row) else {
            continue;
        };
        match index.get(record.description.as_str()) {
            Some(&pos) => groups[pos].rows.push(row),
            None => {
                index.insert(record.description.as_str(), groups.len());
                groups.push(UncertainGroup {
                    description: record.description.clone(),
                    rows: vec![row],
                });
            }
        }
    }
    groups
}
