use crate::config::MaterialityThresholds;
use crate::error::{Result, VarianceError};
use crate::schema::{AccountPeriodTotal, PercentageDelta, PeriodTag, Transaction, VarianceRecord};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Records for accounts that passed the currency check, plus the accounts that did not.
#[derive(Debug, Default)]
pub struct VarianceOutcome {
    pub records: Vec<VarianceRecord>,
    pub rejected: Vec<(String, VarianceError)>,
}

/// One counterparty's contribution to an account's change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverContribution {
    pub counterparty: String,
    pub prior: f64,
    pub current: f64,
    pub delta: f64,
    /// |delta| over |account delta|; 0 when the account did not move.
    pub share: f64,
}

#[derive(Default)]
struct AccountAccumulator {
    name: Option<String>,
    prior: f64,
    current: f64,
    prior_count: usize,
    current_count: usize,
}

impl AccountAccumulator {
    fn add(&mut self, tx: &Transaction) {
        if self.name.is_none() && !tx.account_name.trim().is_empty() {
            self.name = Some(tx.account_name.clone());
        }
        match tx.period {
            PeriodTag::Prior => {
                self.prior += tx.amount;
                self.prior_count += 1;
            }
            PeriodTag::Current => {
                self.current += tx.amount;
                self.current_count += 1;
            }
        }
    }
}

/// Computes one variance record per account present in either period.
///
/// Fails with [`VarianceError::MixedCurrency`] if any account carries an
/// inconsistent currency.
pub fn compute_variance(
    transactions: &[Transaction],
    thresholds: &MaterialityThresholds,
) -> Result<Vec<VarianceRecord>> {
    let mut outcome = compute_variance_partitioned(transactions, thresholds);
    if outcome.rejected.is_empty() {
        Ok(outcome.records)
    } else {
        Err(outcome.rejected.swap_remove(0).1)
    }
}

/// Like [`compute_variance`], but drops accounts with inconsistent currency
/// and reports them instead of failing the whole run.
pub fn compute_variance_partitioned(
    transactions: &[Transaction],
    thresholds: &MaterialityThresholds,
) -> VarianceOutcome {
    let rejected = currency_violations(transactions);
    let rejected_ids: BTreeSet<&str> = rejected.iter().map(|(id, _)| id.as_str()).collect();

    let mut accounts: BTreeMap<&str, AccountAccumulator> = BTreeMap::new();
    for tx in transactions {
        if rejected_ids.contains(tx.account_id.as_str()) {
            continue;
        }
        accounts.entry(tx.account_id.as_str()).or_default().add(tx);
    }

    let total_abs_delta: f64 = accounts
        .values()
        .map(|acc| (acc.current - acc.prior).abs())
        .sum();

    let mut records: Vec<VarianceRecord> = accounts
        .into_iter()
        .map(|(account_id, acc)| {
            let absolute_delta = acc.current - acc.prior;
            let percentage_delta = PercentageDelta::from_totals(acc.prior, acc.current);
            let share_of_total_abs_delta = if total_abs_delta > 0.0 {
                absolute_delta.abs() / total_abs_delta
            } else {
                0.0
            };

            let mut record = VarianceRecord {
                account_id: account_id.to_string(),
                account_name: acc.name.unwrap_or_else(|| account_id.to_string()),
                prior_total: acc.prior,
                current_total: acc.current,
                absolute_delta,
                percentage_delta,
                share_of_total_abs_delta,
                materiality_flag: false,
                rank: 0,
            };
            record.materiality_flag = is_material(&record, thresholds);
            record
        })
        .collect();

    records.sort_by(presentation_order);
    for (idx, record) in records.iter_mut().enumerate() {
        record.rank = idx + 1;
    }

    debug!(
        "Computed {} variance records ({} material, {} accounts rejected)",
        records.len(),
        records.iter().filter(|r| r.materiality_flag).count(),
        rejected.len()
    );

    VarianceOutcome { records, rejected }
}

/// Materiality test for a single record.
pub fn is_material(record: &VarianceRecord, thresholds: &MaterialityThresholds) -> bool {
    if record.absolute_delta.abs() >= thresholds.absolute {
        return true;
    }

    if let PercentageDelta::Defined(pct) = record.percentage_delta {
        if record.prior_total.abs() >= thresholds.min_base && pct.abs() >= thresholds.percentage {
            return true;
        }
    }

    matches!(
        thresholds.min_share_total,
        Some(min_share) if record.share_of_total_abs_delta >= min_share
    )
}

/// Descending |delta|, ties broken by ascending account id.
pub fn presentation_order(a: &VarianceRecord, b: &VarianceRecord) -> Ordering {
    b.absolute_delta
        .abs()
        .total_cmp(&a.absolute_delta.abs())
        .then_with(|| a.account_id.cmp(&b.account_id))
}

pub fn account_period_totals(transactions: &[Transaction]) -> Vec<AccountPeriodTotal> {
    let mut totals: BTreeMap<(&str, PeriodTag), (f64, usize)> = BTreeMap::new();
    for tx in transactions {
        let entry = totals
            .entry((tx.account_id.as_str(), tx.period))
            .or_insert((0.0, 0));
        entry.0 += tx.amount;
        entry.1 += 1;
    }

    totals
        .into_iter()
        .map(|((account_id, period), (total_amount, transaction_count))| AccountPeriodTotal {
            account_id: account_id.to_string(),
            period,
            total_amount,
            transaction_count,
        })
        .collect()
}

/// Per-counterparty breakdown of one account's change, largest movers first.
/// Postings without a counterparty are grouped under `"(none)"`.
pub fn drivers_for_account(
    transactions: &[Transaction],
    account_id: &str,
    top_n: usize,
) -> Vec<DriverContribution> {
    let mut groups: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for tx in transactions.iter().filter(|tx| tx.account_id == account_id) {
        let key = tx.counterparty.as_deref().unwrap_or("(none)");
        let entry = groups.entry(key).or_insert((0.0, 0.0));
        match tx.period {
            PeriodTag::Prior => entry.0 += tx.amount,
            PeriodTag::Current => entry.1 += tx.amount,
        }
    }

    let account_delta: f64 = groups.values().map(|(p, c)| c - p).sum();

    let mut drivers: Vec<DriverContribution> = groups
        .into_iter()
        .map(|(counterparty, (prior, current))| {
            let delta = current - prior;
            DriverContribution {
                counterparty: counterparty.to_string(),
                prior,
                current,
                delta,
                share: if account_delta != 0.0 {
                    delta.abs() / account_delta.abs()
                } else {
                    0.0
                },
            }
        })
        .collect();

    drivers.sort_by(|a, b| {
        b.delta
            .abs()
            .total_cmp(&a.delta.abs())
            .then_with(|| a.counterparty.cmp(&b.counterparty))
    });
    drivers.truncate(top_n);
    drivers
}

/// Largest postings of an account by |amount|.
pub fn samples_for_account<'a>(
    transactions: &'a [Transaction],
    account_id: &str,
    top_n: usize,
) -> Vec<&'a Transaction> {
    let mut samples: Vec<&Transaction> = transactions
        .iter()
        .filter(|tx| tx.account_id == account_id)
        .collect();
    samples.sort_by(|a, b| b.amount.abs().total_cmp(&a.amount.abs()));
    samples.truncate(top_n);
    samples
}

/// The currency most postings carry. Ties go to the smaller code, so the
/// result does not depend on row order.
fn reference_currency(transactions: &[Transaction]) -> Option<&str> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for currency in transactions.iter().filter_map(|tx| tx.currency.as_deref()) {
        *counts.entry(currency).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a_code, a_count), (b_code, b_count)| {
            a_count.cmp(b_count).then_with(|| b_code.cmp(a_code))
        })
        .map(|(code, _)| code)
}

/// Accounts with a posting in a currency other than the run's reference
/// currency. Postings without a currency are not checked.
fn currency_violations(transactions: &[Transaction]) -> Vec<(String, VarianceError)> {
    let Some(reference) = reference_currency(transactions) else {
        return Vec::new();
    };

    let mut foreign: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for tx in transactions {
        match tx.currency.as_deref() {
            Some(currency) if currency != reference => {
                foreign
                    .entry(tx.account_id.as_str())
                    .or_default()
                    .insert(currency);
            }
            _ => {}
        }
    }

    foreign
        .into_iter()
        .filter_map(|(account_id, currencies)| {
            let found = currencies.into_iter().next()?;
            warn!(
                "Account {} posts in {} but the run currency is {}",
                account_id, found, reference
            );
            Some((
                account_id.to_string(),
                VarianceError::MixedCurrency {
                    account_id: account_id.to_string(),
                    expected: reference.to_string(),
                    found: found.to_string(),
                },
            ))
        })
        .collect()
}
