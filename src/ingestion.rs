//! Boundary between the external extract loader and the analysis core.
//!
//! Rows arrive as loosely typed canonical records. Each row is validated into a
//! [`Transaction`] or rejected with [`VarianceError::MalformedRow`]; nothing is
//! silently coerced.

use crate::error::{Result, VarianceError};
use crate::schema::{PeriodTag, Transaction};
use crate::utils::quarter_bounds;
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// A canonical row as produced by the column-normalization layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub amount: Option<String>,
    pub period: Option<String>,
    pub counterparty: Option<String>,
    pub document_id: Option<String>,
    pub description: Option<String>,
    pub currency: Option<String>,
    pub posting_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarterRef {
    pub year: i32,
    pub quarter: u32,
}

impl QuarterRef {
    pub fn new(year: i32, quarter: u32) -> Self {
        Self { year, quarter }
    }

    pub fn contains(self, date: NaiveDate) -> Result<bool> {
        let (start, end) = quarter_bounds(self.year, self.quarter)?;
        Ok(date >= start && date <= end)
    }
}

/// The two quarters being compared, used to tag rows that only carry a posting date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonWindow {
    pub prior: QuarterRef,
    pub current: QuarterRef,
}

impl ComparisonWindow {
    /// Same quarter in `current_year - 1` and `current_year`.
    pub fn year_over_year(current_year: i32, quarter: u32) -> Self {
        Self {
            prior: QuarterRef::new(current_year - 1, quarter),
            current: QuarterRef::new(current_year, quarter),
        }
    }

    pub fn period_for(&self, date: NaiveDate) -> Result<Option<PeriodTag>> {
        if self.current.contains(date)? {
            Ok(Some(PeriodTag::Current))
        } else if self.prior.contains(date)? {
            Ok(Some(PeriodTag::Prior))
        } else {
            Ok(None)
        }
    }
}

/// Result of reading a whole table: valid transactions plus the rows that were rejected.
#[derive(Debug, Default)]
pub struct IngestedTable {
    pub transactions: Vec<Transaction>,
    pub rejected_rows: Vec<VarianceError>,
}

pub fn parse_period_tag(raw: &str) -> Option<PeriodTag> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "prior" | "py" | "previous" => Some(PeriodTag::Prior),
        "current" | "cy" => Some(PeriodTag::Current),
        _ => None,
    }
}

/// Validates one row. Returns `Ok(None)` when the row is dated outside the
/// comparison window.
pub fn validate_row(
    line: usize,
    row: &CanonicalRow,
    window: Option<&ComparisonWindow>,
) -> Result<Option<Transaction>> {
    let malformed = |reason: String| VarianceError::MalformedRow { line, reason };

    let account_id = non_blank(&row.account_id)
        .ok_or_else(|| malformed("missing account_id".to_string()))?;

    let raw_amount =
        non_blank(&row.amount).ok_or_else(|| malformed("missing amount".to_string()))?;
    let amount: f64 = raw_amount
        .parse()
        .map_err(|_| malformed(format!("amount '{}' is not numeric", raw_amount)))?;
    if !amount.is_finite() {
        return Err(malformed(format!("amount '{}' is not finite", raw_amount)));
    }

    let posting_date = match non_blank(&row.posting_date) {
        Some(raw) => Some(
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|_| malformed(format!("posting_date '{}' is not YYYY-MM-DD", raw)))?,
        ),
        None => None,
    };

    let period = match non_blank(&row.period) {
        Some(raw) => parse_period_tag(&raw)
            .ok_or_else(|| malformed(format!("unknown period tag '{}'", raw)))?,
        None => match (posting_date, window) {
            (Some(date), Some(window)) => match window.period_for(date)? {
                Some(period) => period,
                None => {
                    debug!("Line {}: {} is outside the comparison window", line, date);
                    return Ok(None);
                }
            },
            _ => return Err(malformed("missing period tag".to_string())),
        },
    };

    let account_name = non_blank(&row.account_name).unwrap_or_else(|| account_id.clone());

    Ok(Some(Transaction {
        account_id,
        account_name,
        amount,
        period,
        counterparty: non_blank(&row.counterparty),
        document_id: non_blank(&row.document_id),
        description: row.description.clone().unwrap_or_default().trim().to_string(),
        currency: non_blank(&row.currency).map(|c| c.to_ascii_uppercase()),
        posting_date,
    }))
}

/// Reads a canonical CSV table with a header row. Malformed rows are collected,
/// not fatal.
pub fn read_canonical_csv<R: Read>(
    reader: R,
    window: Option<&ComparisonWindow>,
) -> Result<IngestedTable> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(reader);

    let mut table = IngestedTable::default();

    for (idx, record) in csv_reader.deserialize::<CanonicalRow>().enumerate() {
        // Header is line 1.
        let line = idx + 2;
        let row = match record {
            Ok(row) => row,
            Err(e) => {
                table.rejected_rows.push(VarianceError::MalformedRow {
                    line,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        match validate_row(line, &row, window) {
            Ok(Some(tx)) => table.transactions.push(tx),
            Ok(None) => {}
            Err(e) if e.is_input_error() => table.rejected_rows.push(e),
            Err(e) => return Err(e),
        }
    }

    debug!(
        "Read {} transactions, rejected {} rows",
        table.transactions.len(),
        table.rejected_rows.len()
    );

    Ok(table)
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
