//! One analysis run over a pair of periods: variance numbers, evidence for the
//! material deviations and their commentary.

use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::evidence::EvidenceClassifier;
use crate::keywords::top_keywords;
use crate::llm::{CommentaryEvent, CommentaryProtocol, ModelEndpoint, PromptMode};
use crate::schema::{CommentaryRecord, EvidenceFact, PeriodTag, Transaction, VarianceRecord};
use crate::variance::{
    compute_variance_partitioned, drivers_for_account, samples_for_account, DriverContribution,
};
use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

pub const TOP_DRIVERS: usize = 5;
pub const TOP_KEYWORDS: usize = 8;
pub const TOP_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub variance: VarianceRecord,
    pub facts: Vec<EvidenceFact>,
    pub drivers: Vec<DriverContribution>,
    pub keywords: Vec<(String, usize)>,
    /// Largest postings of the account, for display next to the commentary.
    pub samples: Vec<Transaction>,
    /// Present for material accounts that were not cancelled.
    pub commentary: Option<CommentaryRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAccount {
    pub account_id: String,
    pub reason: String,
}

/// Output contract of a run. Rows are in rank order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub rows: Vec<AnalysisRow>,
    pub rejected_accounts: Vec<RejectedAccount>,
    pub cancelled_accounts: Vec<String>,
}

impl AnalysisReport {
    pub fn material_rows(&self) -> impl Iterator<Item = &AnalysisRow> {
        self.rows.iter().filter(|row| row.variance.materiality_flag)
    }

    pub fn row(&self, account_id: &str) -> Option<&AnalysisRow> {
        self.rows
            .iter()
            .find(|row| row.variance.account_id == account_id)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Numbers and facts without calling a model.
pub fn analyze_without_commentary(
    transactions: &[Transaction],
    config: &AnalysisConfig,
) -> Result<AnalysisReport> {
    config.validate()?;
    let classifier = EvidenceClassifier::new(config.evidence.clone());
    Ok(build_report(transactions, config, &classifier))
}

fn build_report(
    transactions: &[Transaction],
    config: &AnalysisConfig,
    classifier: &EvidenceClassifier,
) -> AnalysisReport {
    let outcome = compute_variance_partitioned(transactions, &config.materiality);

    let rejected_accounts = outcome
        .rejected
        .into_iter()
        .map(|(account_id, err)| {
            warn!("Account {} rejected: {}", account_id, err);
            RejectedAccount {
                account_id,
                reason: err.to_string(),
            }
        })
        .collect();

    let rows = outcome
        .records
        .into_iter()
        .map(|variance| build_row(transactions, variance, classifier))
        .collect();

    AnalysisReport {
        rows,
        rejected_accounts,
        cancelled_accounts: Vec::new(),
    }
}

/// Material accounts get facts, drivers, keywords and samples; the rest only their numbers.
fn build_row(
    transactions: &[Transaction],
    variance: VarianceRecord,
    classifier: &EvidenceClassifier,
) -> AnalysisRow {
    if !variance.materiality_flag {
        return AnalysisRow {
            variance,
            facts: Vec::new(),
            drivers: Vec::new(),
            keywords: Vec::new(),
            samples: Vec::new(),
            commentary: None,
        };
    }

    let account_id = variance.account_id.as_str();
    let (prior, current): (Vec<&Transaction>, Vec<&Transaction>) = transactions
        .iter()
        .filter(|tx| tx.account_id == account_id)
        .partition(|tx| tx.period == PeriodTag::Prior);

    let facts = classifier.classify(account_id, &prior, &current);
    let drivers = drivers_for_account(transactions, account_id, TOP_DRIVERS);
    let keywords = top_keywords(
        prior
            .iter()
            .chain(current.iter())
            .map(|tx| tx.description.as_str()),
        TOP_KEYWORDS,
    );
    let samples = samples_for_account(transactions, account_id, TOP_SAMPLES)
        .into_iter()
        .cloned()
        .collect();

    AnalysisRow {
        variance,
        facts,
        drivers,
        keywords,
        samples,
        commentary: None,
    }
}

/// Runs the whole pipeline for one pair of periods.
pub struct VarianceAnalyzer<E: ModelEndpoint> {
    config: AnalysisConfig,
    classifier: EvidenceClassifier,
    protocol: CommentaryProtocol<E>,
}

impl<E: ModelEndpoint> VarianceAnalyzer<E> {
    pub fn new(config: AnalysisConfig, endpoint: E) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            classifier: EvidenceClassifier::new(config.evidence.clone()),
            protocol: CommentaryProtocol::new(endpoint, config.model.clone()),
            config,
        })
    }

    pub fn with_progress(mut self, progress: Sender<CommentaryEvent>) -> Self {
        self.protocol = self.protocol.with_progress(progress);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Computes the report and narrates every material account.
    ///
    /// `cancel` is checked before each account's commentary starts. Finished
    /// commentary is kept; skipped accounts are listed in `cancelled_accounts`
    /// and keep their numbers and facts.
    pub async fn run(
        &self,
        transactions: &[Transaction],
        mode: PromptMode,
        cancel: &CancellationToken,
    ) -> AnalysisReport {
        let mut report = build_report(transactions, &self.config, &self.classifier);
        let material: Vec<usize> = report
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.variance.materiality_flag)
            .map(|(idx, _)| idx)
            .collect();

        info!(
            "Analyzing {} accounts, {} material, concurrency {}",
            report.rows.len(),
            material.len(),
            self.config.model.max_concurrency
        );

        let rows = &report.rows;
        let commentaries: Vec<(usize, Option<CommentaryRecord>)> = stream::iter(material)
            .map(|idx| async move {
                if cancel.is_cancelled() {
                    return (idx, None);
                }
                let row = &rows[idx];
                let commentary = self
                    .protocol
                    .generate_commentary(&row.variance, &row.facts, mode)
                    .await;
                (idx, Some(commentary))
            })
            .buffered(self.config.model.max_concurrency.max(1))
            .collect()
            .await;

        for (idx, commentary) in commentaries {
            match commentary {
                Some(record) => report.rows[idx].commentary = Some(record),
                None => report
                    .cancelled_accounts
                    .push(report.rows[idx].variance.account_id.clone()),
            }
        }

        if !report.cancelled_accounts.is_empty() {
            warn!(
                "Run cancelled, {} accounts left without commentary",
                report.cancelled_accounts.len()
            );
        }

        report
    }
}
