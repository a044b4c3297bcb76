use csv::WriterBuilder;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::ClassifyError;
use crate::labeling::LabeledDataset;
use crate::transaction_source::{cents_to_text, TransactionRecord};

const REPORT_HEADERS: &[&str] = &["category", "amount", "records"];
const BAR_WIDTH: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryTotal {
    pub category: String,
    pub amount_cents: i64,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpendingReport {
    /// Ascending by total, ties by category name.
    pub totals: Vec<CategoryTotal>,
    pub excluded: Vec<CategoryTotal>,
}

pub fn aggregate_spending(
    records: &[TransactionRecord],
    dataset: &LabeledDataset,
    non_reportable: &[String],
) -> SpendingReport {
    let mut buckets: BTreeMap<&str, (i64, usize)> = BTreeMap::new();
    for labeled in &dataset.rows {
        let Some(record) = records.get(labeled.row) else {
            continue;
        };
        let bucket = buckets.entry(labeled.category.as_str()).or_insert((0, 0));
        bucket.0 = bucket.0.checked_add(record.amount_cents).unwrap_or_else(|| {
            log::warn!("total for {} saturated at line {}", labeled.category, record.line_no);
            bucket.0.saturating_add(record.amount_cents)
        });
        bucket.1 += 1;
    }

    let mut report = SpendingReport::default();
    for (category, (amount_cents, count)) in buckets {
        let total = CategoryTotal {
            category: category.to_string(),
            amount_cents,
            records: count,
        };
        if non_reportable.iter().any(|c| c == category) {
            report.excluded.push(total);
        } else {
            report.totals.push(total);
        }
    }
    report
        .totals
        .sort_by(|a, b| a.amount_cents.cmp(&b.amount_cents).then_with(|| a.category.cmp(&b.category)));
    report
}

impl SpendingReport {
    pub fn total_for(&self, category: &str) -> Option<i64> {
        self.totals
            .iter()
            .find(|t| t.category == category)
            .map(|t| t.amount_cents)
    }

    pub fn to_json(&self) -> Value {
        let row = |t: &CategoryTotal| {
            json!({
                "category": t.category,
                "amount_cents": t.amount_cents,
                "amount": cents_to_text(t.amount_cents),
                "records": t.records,
            })
        };
        json!({
            "categories": self.totals.iter().map(row).collect::<Vec<_>>(),
            "excluded_categories": self.excluded.iter().map(row).collect::<Vec<_>>(),
        })
    }

    /// Text table with a bar proportional to each category's absolute total.
    pub fn render_text(&self) -> String {
        let mut out = String::from("Money Credited Per Category\n");
        if self.totals.is_empty() {
            out.push_str("(no reportable categories)\n");
            return out;
        }
        let name_width = self.totals.iter().map(|t| t.category.chars().count()).max().unwrap_or(0);
        let amounts = self
            .totals
            .iter()
            .map(|t| cents_to_text(t.amount_cents))
            .collect::<Vec<_>>();
        let amount_width = amounts.iter().map(String::len).max().unwrap_or(0);
        let max_abs = self
            .totals
            .iter()
            .map(|t| t.amount_cents.unsigned_abs())
            .max()
            .unwrap_or(0);

        for (total, amount) in self.totals.iter().zip(&amounts) {
            let bar_len = if max_abs == 0 {
                0
            } else {
                ((total.amount_cents.unsigned_abs() as f64 / max_abs as f64) * BAR_WIDTH as f64).round()
                    as usize
            };
            let bar_char = if total.amount_cents < 0 { '-' } else { '+' };
            out.push_str(&format!(
                "{:<name_width$}  {:>amount_width$}  {}\n",
                total.category,
                amount,
                bar_char.to_string().repeat(bar_len),
            ));
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), ClassifyError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
        writer.write_record(REPORT_HEADERS)?;
        for total in &self.totals {
            writer.write_record([
                total.category.clone(),
                cents_to_text(total.amount_cents),
                total.records.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}
