use csv::WriterBuilder;
use std::fs;
use std::path::Path;

use crate::classifier::Prediction;
use crate::error::ClassifyError;
use crate::review::ReviewDecisions;
use crate::transaction_source::{TransactionRecord, TransactionTable};

pub const CATEGORY_COLUMN: &str = "Predicted Category";
pub const CONFIDENCE_COLUMN: &str = "Confidence";

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRow {
    pub row: usize,
    pub category: String,
    pub predicted_category: String,
    /// Kept from the original prediction even when overridden.
    pub confidence: f64,
    pub overridden: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabeledDataset {
    pub rows: Vec<LabeledRow>,
}

impl LabeledDataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn overridden_count(&self) -> usize {
        self.rows.iter().filter(|r| r.overridden).count()
    }

    pub fn category(&self, row: usize) -> Option<&str> {
        self.rows.get(row).map(|r| r.category.as_str())
    }
}

/// Override when the description resolved to one, machine prediction otherwise.
/// Records and predictions are paired by position.
pub fn merge_labels(
    records: &[TransactionRecord],
    predictions: &[Prediction],
    decisions: &ReviewDecisions,
) -> LabeledDataset {
    let rows = records
        .iter()
        .zip(predictions)
        .enumerate()
        .map(|(row, (record, pred))| {
            let resolved = decisions.override_for(&record.description);
            LabeledRow {
                row,
                category: resolved.unwrap_or(&pred.category).to_string(),
                predicted_category: pred.category.clone(),
                confidence: pred.confidence,
                overridden: resolved.is_some(),
            }
        })
        .collect();
    LabeledDataset { rows }
}

/// Serialises the labeled dataset: input columns, then category and confidence.
pub fn labeled_csv_bytes(table: &TransactionTable, dataset: &LabeledDataset) -> Result<Vec<u8>, ClassifyError> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
    let mut header = table.headers.clone();
    header.push(CATEGORY_COLUMN.to_string());
    header.push(CONFIDENCE_COLUMN.to_string());
    writer.write_record(&header)?;

    for labeled in &dataset.rows {
        let Some(record) = table.records.get(labeled.row) else {
            continue;
        };
        let mut out = record.cells.clone();
        out.push(labeled.category.clone());
        out.push(labeled.confidence.to_string());
        writer.write_record(&out)?;
    }
    writer
        .into_inner()
        .map_err(|e| ClassifyError::Io(std::io::Error::other(e.to_string())))
}

pub fn write_labeled_dataset(
    path: &Path,
    table: &TransactionTable,
    dataset: &LabeledDataset,
) -> Result<(), ClassifyError> {
    let bytes = labeled_csv_bytes(table, dataset)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    log::info!(
        "wrote {} labeled transactions to {}",
        dataset.len(),
        path.to_string_lossy()
    );
    Ok(())
}
