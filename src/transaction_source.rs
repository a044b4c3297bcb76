use calamine::{open_workbook_auto, Data, Reader};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::ClassifyError;

/// One transaction line. Identity is the position in [`TransactionTable::records`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub line_no: usize,
    pub description: String,
    /// Credit minus debit, in minor units.
    pub amount_cents: i64,
    pub cells: Vec<String>,
}

impl TransactionRecord {
    pub fn amount(&self) -> f64 {
        self.amount_cents as f64 / 100.0
    }
}

#[derive(Debug, Clone)]
pub struct TransactionTable {
    pub headers: Vec<String>,
    pub records: Vec<TransactionRecord>,
    /// Logical field -> header text it was resolved from.
    pub mapping: BTreeMap<String, String>,
    pub zero_filled_cells: usize,
}

impl TransactionTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
struct AliasSpec {
    field: &'static str,
    aliases: &'static [&'static str],
}

const FIELD_DESCRIPTION: &str = "description";
const FIELD_CREDIT: &str = "credit";
const FIELD_DEBIT: &str = "debit";
const FIELD_AMOUNT: &str = "amount";

const ALIAS_SPECS: &[AliasSpec] = &[
    AliasSpec {
        field: FIELD_DESCRIPTION,
        aliases: &[
            "Transaction Description",
            "Description",
            "Details",
            "Memo",
            "Narrative",
        ],
    },
    AliasSpec {
        field: FIELD_CREDIT,
        aliases: &["Credit Amount", "Credit", "Paid In", "Money In"],
    },
    AliasSpec {
        field: FIELD_DEBIT,
        aliases: &["Debit Amount", "Debit", "Paid Out", "Money Out"],
    },
    AliasSpec {
        field: FIELD_AMOUNT,
        aliases: &["Amount"],
    },
];

const MISSING_AMOUNT_MARKERS: &[&str] = &["", "nan", "-", "null"];

fn trim_cell(text: &str) -> String {
    text.trim()
        .trim_start_matches('\u{feff}')
        .trim()
        .to_string()
}

fn normalize_key(key: &str) -> String {
    trim_cell(key)
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Parses a money cell into minor units. `Ok(None)` means the value is missing.
pub fn parse_amount_to_cents(raw: &str) -> Result<Option<i64>, String> {
    let trimmed = raw.trim();
    if MISSING_AMOUNT_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return Ok(None);
    }
    let mut s = trimmed
        .replace(',', "")
        .replace(['£', '$', '€'], "")
        .replace(' ', "");
    if s.is_empty() {
        return Ok(None);
    }

    let negative = s.starts_with('-');
    if s.starts_with('-') || s.starts_with('+') {
        s = s[1..].to_string();
    }
    if s.is_empty() {
        return Err(format!("invalid amount: {trimmed}"));
    }

    let parts = s.split('.').collect::<Vec<_>>();
    if parts.len() > 2 {
        return Err(format!("invalid amount: {trimmed}"));
    }
    let int_part = if parts[0].is_empty() { "0" } else { parts[0] };
    if !int_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid amount: {trimmed}"));
    }
    let frac_part = if parts.len() == 2 { parts[1] } else { "" };
    if !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid amount: {trimmed}"));
    }
    if frac_part.len() > 2 {
        return Err(format!("amount has more than two decimals: {trimmed}"));
    }

    let int_val = int_part
        .parse::<i64>()
        .map_err(|_| format!("amount out of range: {trimmed}"))?;
    let frac_val = match frac_part.len() {
        0 => 0_i64,
        1 => {
            frac_part
                .parse::<i64>()
                .map_err(|_| format!("invalid amount: {trimmed}"))?
                * 10
        }
        _ => frac_part
            .parse::<i64>()
            .map_err(|_| format!("invalid amount: {trimmed}"))?,
    };

    let mut cents = int_val
        .checked_mul(100)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or_else(|| format!("amount out of range: {trimmed}"))?;
    if negative {
        cents = -cents;
    }
    Ok(Some(cents))
}

pub fn cents_to_text(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

fn resolve_alias_mapping_from_row(row: &[String]) -> HashMap<&'static str, usize> {
    let mut normalized: HashMap<String, usize> = HashMap::new();
    for (idx, cell) in row.iter().enumerate() {
        let key = normalize_key(cell);
        if !key.is_empty() {
            normalized.entry(key).or_insert(idx);
        }
    }

    let mut mapping = HashMap::new();
    for spec in ALIAS_SPECS {
        for alias in spec.aliases {
            if let Some(idx) = normalized.get(&normalize_key(alias)) {
                mapping.insert(spec.field, *idx);
                break;
            }
        }
    }
    mapping
}

fn has_required_fields(mapping: &HashMap<&'static str, usize>) -> bool {
    mapping.contains_key(FIELD_DESCRIPTION)
        && ((mapping.contains_key(FIELD_CREDIT) && mapping.contains_key(FIELD_DEBIT))
            || mapping.contains_key(FIELD_AMOUNT))
}

fn missing_fields(mapping: &HashMap<&'static str, usize>) -> Vec<String> {
    let mut missing = Vec::new();
    if !mapping.contains_key(FIELD_DESCRIPTION) {
        missing.push(FIELD_DESCRIPTION.to_string());
    }
    if !mapping.contains_key(FIELD_AMOUNT) {
        for field in [FIELD_CREDIT, FIELD_DEBIT] {
            if !mapping.contains_key(field) {
                missing.push(field.to_string());
            }
        }
    }
    missing
}

fn find_header_row(
    path: &Path,
    rows: &[Vec<String>],
) -> Result<(usize, HashMap<&'static str, usize>), ClassifyError> {
    let mut best: Option<HashMap<&'static str, usize>> = None;
    for (idx, row) in rows.iter().enumerate() {
        let mapping = resolve_alias_mapping_from_row(row);
        if has_required_fields(&mapping) {
            return Ok((idx, mapping));
        }
        if best.as_ref().map(|b| mapping.len() > b.len()).unwrap_or(true) {
            best = Some(mapping);
        }
    }
    Err(ClassifyError::MissingFields {
        path: path.to_string_lossy().to_string(),
        fields: missing_fields(&best.unwrap_or_default()),
    })
}

fn cell_at(row: &[String], idx: Option<usize>) -> &str {
    idx.and_then(|i| row.get(i)).map(String::as_str).unwrap_or("")
}

/// Builds a table from raw rows that still include the header row (and
/// anything above it).
pub fn table_from_rows(path: &Path, rows: Vec<Vec<String>>) -> Result<TransactionTable, ClassifyError> {
    let (header_idx, mapping_idx) = find_header_row(path, &rows)?;
    let headers = rows[header_idx].iter().map(|h| trim_cell(h)).collect::<Vec<_>>();
    let mapping = mapping_idx
        .iter()
        .filter_map(|(field, idx)| headers.get(*idx).map(|h| (field.to_string(), h.clone())))
        .collect::<BTreeMap<_, _>>();

    let desc_idx = mapping_idx.get(FIELD_DESCRIPTION).copied();
    let split_columns = mapping_idx.contains_key(FIELD_CREDIT) && mapping_idx.contains_key(FIELD_DEBIT);

    let mut records = Vec::new();
    let mut zero_filled_cells = 0_usize;
    for (offset, row) in rows.into_iter().enumerate().skip(header_idx + 1) {
        let line_no = offset + 1;
        if row.iter().all(|c| trim_cell(c).is_empty()) {
            continue;
        }
        if row.len() > headers.len() {
            return Err(ClassifyError::source(
                path,
                format!(
                    "line {line_no}: {} cells but the header has {}",
                    row.len(),
                    headers.len()
                ),
            ));
        }

        let mut parse_cell = |field: &str| -> Result<i64, ClassifyError> {
            let raw = cell_at(&row, mapping_idx.get(field).copied());
            match parse_amount_to_cents(raw) {
                Ok(Some(cents)) => Ok(cents),
                Ok(None) => {
                    zero_filled_cells += 1;
                    log::debug!("line {line_no}: missing {field} treated as zero");
                    Ok(0)
                }
                Err(err) => Err(ClassifyError::source(path, format!("line {line_no}: {err}"))),
            }
        };
        let amount_cents = if split_columns {
            let credit = parse_cell(FIELD_CREDIT)?;
            let debit = parse_cell(FIELD_DEBIT)?;
            credit
                .checked_sub(debit)
                .ok_or_else(|| ClassifyError::source(path, format!("line {line_no}: amount out of range")))?
        } else {
            parse_cell(FIELD_AMOUNT)?
        };

        let description = cell_at(&row, desc_idx).to_string();
        let mut cells = row;
        cells.resize(headers.len(), String::new());
        records.push(TransactionRecord {
            line_no,
            description,
            amount_cents,
            cells,
        });
    }

    if records.is_empty() {
        return Err(ClassifyError::source(path, "no transaction rows after the header"));
    }

    Ok(TransactionTable {
        headers,
        records,
        mapping,
        zero_filled_cells,
    })
}

fn read_csv_rows(path: &Path) -> Result<Vec<Vec<String>>, ClassifyError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| ClassifyError::source(path, format!("cannot open CSV: {e}")))?;

    let mut rows = Vec::new();
    for rec in reader.records() {
        let rec = rec.map_err(|e| ClassifyError::source(path, format!("bad CSV row: {e}")))?;
        rows.push(rec.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Numeric cells are rounded to cents; formula results carry binary noise.
fn workbook_cell_text(cell: &Data) -> String {
    match cell {
        Data::Float(f) if f.is_finite() => format!("{:.2}", (f * 100.0).round() / 100.0),
        other => other.to_string(),
    }
}

fn read_workbook_rows(path: &Path) -> Result<Vec<Vec<String>>, ClassifyError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| ClassifyError::source(path, format!("cannot open workbook: {e}")))?;
    let sheet_names = workbook.sheet_names().to_owned();
    let first_sheet = sheet_names
        .first()
        .cloned()
        .ok_or_else(|| ClassifyError::source(path, "workbook has no sheets"))?;

    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| ClassifyError::source(path, format!("cannot read sheet {first_sheet}: {e}")))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(workbook_cell_text).collect::<Vec<_>>())
        .collect())
}

pub fn load_transaction_table(path: &Path) -> Result<TransactionTable, ClassifyError> {
    if !path.is_file() {
        return Err(ClassifyError::source(path, "file not found"));
    }
    let suffix = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let rows = match suffix.as_str() {
        "csv" => read_csv_rows(path)?,
        "xlsx" | "xls" => read_workbook_rows(path)?,
        _ => {
            return Err(ClassifyError::source(
                path,
                format!("unsupported file type .{suffix} (expected .csv/.xlsx/.xls)"),
            ))
        }
    };
    let table = table_from_rows(path, rows)?;
    log::info!(
        "loaded {} transactions from {} ({} missing amount cells zero-filled)",
        table.len(),
        path.to_string_lossy(),
        table.zero_filled_cells
    );
    Ok(table)
}
