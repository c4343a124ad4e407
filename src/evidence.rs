//! Derives the facts that can be asserted about a deviation from the
//! underlying postings alone.
//!
//! Each [`FactRule`] is an independent predicate over one account's prior and
//! current postings. The [`EvidenceClassifier`] runs its rules in order,
//! drops drafts without supporting documents and numbers the rest `F1`, `F2`, ...

use crate::config::EvidenceThresholds;
use crate::keywords::{matched_terms, KeywordTheme};
use crate::schema::{EvidenceFact, FactConfidence, FactKind, PeriodTag, Transaction};
use crate::utils::{format_amount, format_share, relative_change};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Everything a rule may look at for one account.
pub struct EvidenceContext<'a> {
    pub account_id: &'a str,
    pub prior: &'a [&'a Transaction],
    pub current: &'a [&'a Transaction],
    pub thresholds: &'a EvidenceThresholds,
    pub prior_total: f64,
    pub current_total: f64,
}

impl<'a> EvidenceContext<'a> {
    pub fn delta(&self) -> f64 {
        self.current_total - self.prior_total
    }

    pub fn postings(&self, period: PeriodTag) -> &'a [&'a Transaction] {
        match period {
            PeriodTag::Prior => self.prior,
            PeriodTag::Current => self.current,
        }
    }

    fn all_postings(&self) -> impl Iterator<Item = &'a Transaction> + '_ {
        self.prior.iter().chain(self.current.iter()).copied()
    }
}

/// A fact before the classifier has assigned its id.
#[derive(Debug, Clone, PartialEq)]
pub struct FactDraft {
    pub kind: FactKind,
    pub description: String,
    pub supporting_document_ids: BTreeSet<String>,
    pub confidence: FactConfidence,
}

pub trait FactRule: Send + Sync {
    fn kind(&self) -> FactKind;
    fn derive(&self, ctx: &EvidenceContext<'_>) -> Vec<FactDraft>;
}

pub struct EvidenceClassifier {
    thresholds: EvidenceThresholds,
    rules: Vec<Box<dyn FactRule>>,
}

impl EvidenceClassifier {
    pub fn new(thresholds: EvidenceThresholds) -> Self {
        Self {
            thresholds,
            rules: vec![
                Box::new(CounterpartyConcentrationRule),
                Box::new(OneOffDocumentRule),
                Box::new(KeywordMatchRule),
                Box::new(VolumeChangeRule),
            ],
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn FactRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn thresholds(&self) -> &EvidenceThresholds {
        &self.thresholds
    }

    pub fn classify(
        &self,
        account_id: &str,
        prior: &[&Transaction],
        current: &[&Transaction],
    ) -> Vec<EvidenceFact> {
        let ctx = EvidenceContext {
            account_id,
            prior,
            current,
            thresholds: &self.thresholds,
            prior_total: prior.iter().map(|tx| tx.amount).sum(),
            current_total: current.iter().map(|tx| tx.amount).sum(),
        };

        let mut facts = Vec::new();
        for rule in &self.rules {
            for draft in rule.derive(&ctx) {
                if draft.supporting_document_ids.is_empty() {
                    debug!(
                        "Account {}: dropping {} draft without supporting documents",
                        account_id,
                        rule.kind()
                    );
                    continue;
                }
                facts.push(EvidenceFact {
                    id: format!("F{}", facts.len() + 1),
                    kind: draft.kind,
                    description: draft.description,
                    supporting_document_ids: draft.supporting_document_ids,
                    confidence: draft.confidence,
                });
            }
        }

        debug!("Account {}: {} evidence facts", account_id, facts.len());
        facts
    }

    /// Splits `transactions` by period for `account_id` and classifies them.
    pub fn classify_account(
        &self,
        transactions: &[Transaction],
        account_id: &str,
    ) -> Vec<EvidenceFact> {
        let (prior, current) = split_account(transactions, account_id);
        self.classify(account_id, &prior, &current)
    }
}

impl Default for EvidenceClassifier {
    fn default() -> Self {
        Self::new(EvidenceThresholds::default())
    }
}

pub fn split_account<'a>(
    transactions: &'a [Transaction],
    account_id: &str,
) -> (Vec<&'a Transaction>, Vec<&'a Transaction>) {
    transactions
        .iter()
        .filter(|tx| tx.account_id == account_id)
        .partition(|tx| tx.period == PeriodTag::Prior)
}

fn document_ids<'a>(postings: impl Iterator<Item = &'a Transaction>) -> BTreeSet<String> {
    postings.filter_map(|tx| tx.document_id.clone()).collect()
}

/// A single counterparty explains most of the account's change.
pub struct CounterpartyConcentrationRule;

impl FactRule for CounterpartyConcentrationRule {
    fn kind(&self) -> FactKind {
        FactKind::CounterpartyConcentration
    }

    fn derive(&self, ctx: &EvidenceContext<'_>) -> Vec<FactDraft> {
        let delta = ctx.delta();
        if delta == 0.0 {
            return Vec::new();
        }

        let mut by_counterparty: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        for tx in ctx.all_postings() {
            let Some(counterparty) = tx.counterparty.as_deref() else {
                continue;
            };
            let entry = by_counterparty.entry(counterparty).or_insert((0.0, 0.0));
            match tx.period {
                PeriodTag::Prior => entry.0 += tx.amount,
                PeriodTag::Current => entry.1 += tx.amount,
            }
        }

        let mut drafts: Vec<(f64, FactDraft)> = by_counterparty
            .into_iter()
            .filter_map(|(counterparty, (prior, current))| {
                let share = (current - prior) / delta;
                if share < ctx.thresholds.concentration_share {
                    return None;
                }
                let docs = document_ids(
                    ctx.all_postings()
                        .filter(|tx| tx.counterparty.as_deref() == Some(counterparty)),
                );
                Some((
                    share,
                    FactDraft {
                        kind: FactKind::CounterpartyConcentration,
                        description: format!(
                            "Counterparty '{}' accounts for {} of the change ({} of {}); prior {}, current {}.",
                            counterparty,
                            format_share(share),
                            format_amount(current - prior),
                            format_amount(delta),
                            format_amount(prior),
                            format_amount(current),
                        ),
                        supporting_document_ids: docs,
                        confidence: FactConfidence::DataBased,
                    },
                ))
            })
            .collect();

        drafts.sort_by(|a, b| b.0.total_cmp(&a.0));
        drafts.into_iter().map(|(_, draft)| draft).collect()
    }
}

/// A single document drives the change and does not recur in the other period.
pub struct OneOffDocumentRule;

struct DocumentSummary<'a> {
    amount: f64,
    counterparty: Option<&'a str>,
}

fn summarize_documents<'a>(postings: &[&'a Transaction]) -> BTreeMap<&'a str, DocumentSummary<'a>> {
    let mut docs: BTreeMap<&str, DocumentSummary> = BTreeMap::new();
    for tx in postings {
        let Some(doc) = tx.document_id.as_deref() else {
            continue;
        };
        let entry = docs.entry(doc).or_insert(DocumentSummary {
            amount: 0.0,
            counterparty: tx.counterparty.as_deref(),
        });
        entry.amount += tx.amount;
    }
    docs
}

impl OneOffDocumentRule {
    fn has_counterpart(
        doc_id: &str,
        doc: &DocumentSummary<'_>,
        other_period: &[&Transaction],
        tolerance: f64,
    ) -> bool {
        other_period.iter().any(|tx| {
            if tx.document_id.as_deref() == Some(doc_id) {
                return true;
            }
            match (doc.counterparty, tx.counterparty.as_deref()) {
                (Some(a), Some(b)) if a == b => {
                    (tx.amount - doc.amount).abs() <= tolerance * doc.amount.abs()
                }
                _ => false,
            }
        })
    }
}

impl FactRule for OneOffDocumentRule {
    fn kind(&self) -> FactKind {
        FactKind::OneOffDocument
    }

    fn derive(&self, ctx: &EvidenceContext<'_>) -> Vec<FactDraft> {
        let delta = ctx.delta();
        if delta == 0.0 {
            return Vec::new();
        }

        let mut drafts = Vec::new();
        for period in [PeriodTag::Current, PeriodTag::Prior] {
            let postings = ctx.postings(period);
            let other = ctx.postings(period.other());

            for (doc_id, doc) in summarize_documents(postings) {
                // A prior-period posting that disappears moves the delta the opposite way.
                let contribution = match period {
                    PeriodTag::Current => doc.amount,
                    PeriodTag::Prior => -doc.amount,
                };
                let share = contribution / delta;
                if share < ctx.thresholds.one_off_share {
                    continue;
                }
                if Self::has_counterpart(doc_id, &doc, other, ctx.thresholds.counterpart_tolerance)
                {
                    continue;
                }

                let counterparty = doc
                    .counterparty
                    .map(|c| format!(", counterparty '{}'", c))
                    .unwrap_or_default();
                drafts.push(FactDraft {
                    kind: FactKind::OneOffDocument,
                    description: format!(
                        "Document {} ({} period{}) posts {}, {} of the change of {}, with no counterpart in the {} period; non-recurring posting.",
                        doc_id,
                        period,
                        counterparty,
                        format_amount(doc.amount),
                        format_share(share),
                        format_amount(delta),
                        period.other(),
                    ),
                    supporting_document_ids: BTreeSet::from([doc_id.to_string()]),
                    confidence: FactConfidence::DataBased,
                });
            }
        }
        drafts
    }
}

/// Posting texts mention vocabulary that suggests a cause. Suggestive only.
pub struct KeywordMatchRule;

impl FactRule for KeywordMatchRule {
    fn kind(&self) -> FactKind {
        FactKind::KeywordMatch
    }

    fn derive(&self, ctx: &EvidenceContext<'_>) -> Vec<FactDraft> {
        let mut drafts = Vec::new();

        for theme in KeywordTheme::ALL {
            let mut terms: BTreeSet<&'static str> = BTreeSet::new();
            let mut docs = BTreeSet::new();
            let mut prior_hits = 0usize;
            let mut current_hits = 0usize;

            for tx in ctx.all_postings() {
                let Some(doc) = tx.document_id.as_deref() else {
                    continue;
                };
                let matched = matched_terms(theme, &tx.description);
                if matched.is_empty() {
                    continue;
                }
                terms.extend(matched);
                docs.insert(doc.to_string());
                match tx.period {
                    PeriodTag::Prior => prior_hits += 1,
                    PeriodTag::Current => current_hits += 1,
                }
            }

            if docs.is_empty() {
                continue;
            }

            drafts.push(FactDraft {
                kind: FactKind::KeywordMatch,
                description: format!(
                    "Posting texts contain terms suggesting a {} ({}) in {} current and {} prior postings.",
                    theme,
                    terms.into_iter().collect::<Vec<_>>().join(", "),
                    current_hits,
                    prior_hits,
                ),
                supporting_document_ids: docs,
                confidence: FactConfidence::Indicative,
            });
        }

        drafts
    }
}

/// Posting count moved materially while the average amount per posting held steady.
pub struct VolumeChangeRule;

impl FactRule for VolumeChangeRule {
    fn kind(&self) -> FactKind {
        FactKind::VolumeChange
    }

    fn derive(&self, ctx: &EvidenceContext<'_>) -> Vec<FactDraft> {
        let prior_count = ctx.prior.len();
        let current_count = ctx.current.len();
        if prior_count == 0 || current_count == 0 {
            return Vec::new();
        }

        let count_change = (current_count as f64 - prior_count as f64) / prior_count as f64;
        if count_change.abs() < ctx.thresholds.volume_count_change {
            return Vec::new();
        }

        let prior_avg = ctx.prior_total / prior_count as f64;
        let current_avg = ctx.current_total / current_count as f64;
        let Some(avg_change) = relative_change(prior_avg, current_avg) else {
            return Vec::new();
        };
        if avg_change.abs() > ctx.thresholds.stable_average_tolerance {
            return Vec::new();
        }

        let busier = if current_count > prior_count {
            PeriodTag::Current
        } else {
            PeriodTag::Prior
        };

        vec![FactDraft {
            kind: FactKind::VolumeChange,
            description: format!(
                "Posting count moved from {} to {} ({:+.1}%) while the average amount per posting stayed near {} vs {} ({:+.1}%); the change is volume-driven rather than price-driven.",
                prior_count,
                current_count,
                count_change * 100.0,
                format_amount(prior_avg),
                format_amount(current_avg),
                avg_change * 100.0,
            ),
            supporting_document_ids: document_ids(ctx.postings(busier).iter().copied()),
            confidence: FactConfidence::DataBased,
        }]
    }
}
