use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Which side of the year-over-year comparison a posting belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodTag {
    Prior,
    Current,
}

impl PeriodTag {
    pub fn other(self) -> Self {
        match self {
            PeriodTag::Prior => PeriodTag::Current,
            PeriodTag::Current => PeriodTag::Prior,
        }
    }
}

impl fmt::Display for PeriodTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodTag::Prior => write!(f, "prior"),
            PeriodTag::Current => write!(f, "current"),
        }
    }
}

/// One row of the canonical transaction table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub account_id: String,
    pub account_name: String,
    /// Signed amount: revenue positive, expense negative.
    pub amount: f64,
    pub period: PeriodTag,
    pub counterparty: Option<String>,
    pub document_id: Option<String>,
    pub description: String,
    /// Only checked for consistency; amounts are never converted.
    pub currency: Option<String>,
    pub posting_date: Option<NaiveDate>,
}

impl Transaction {
    pub fn new(
        account_id: impl Into<String>,
        account_name: impl Into<String>,
        amount: f64,
        period: PeriodTag,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            account_name: account_name.into(),
            amount,
            period,
            counterparty: None,
            document_id: None,
            description: String::new(),
            currency: None,
            posting_date: None,
        }
    }

    pub fn with_counterparty(mut self, counterparty: impl Into<String>) -> Self {
        self.counterparty = Some(counterparty.into());
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn with_posting_date(mut self, date: NaiveDate) -> Self {
        self.posting_date = Some(date);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPeriodTotal {
    pub account_id: String,
    pub period: PeriodTag,
    pub total_amount: f64,
    pub transaction_count: usize,
}

/// Relative change against the prior period.
///
/// `Undefined` is produced when the prior total is zero. It is not 0% and
/// callers must not treat it as such.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PercentageDelta {
    Defined(f64),
    Undefined,
}

impl PercentageDelta {
    pub fn from_totals(prior: f64, current: f64) -> Self {
        if prior == 0.0 {
            PercentageDelta::Undefined
        } else {
            PercentageDelta::Defined((current - prior) / prior.abs())
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            PercentageDelta::Defined(v) => Some(v),
            PercentageDelta::Undefined => None,
        }
    }

    pub fn is_undefined(self) -> bool {
        matches!(self, PercentageDelta::Undefined)
    }
}

impl fmt::Display for PercentageDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PercentageDelta::Defined(v) => write!(f, "{:+.1}%", v * 100.0),
            PercentageDelta::Undefined => write!(f, "n/a"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceRecord {
    pub account_id: String,
    pub account_name: String,
    pub prior_total: f64,
    pub current_total: f64,
    /// Always `current_total - prior_total`.
    pub absolute_delta: f64,
    pub percentage_delta: PercentageDelta,
    /// |delta| of this account over the sum of |delta| across the run.
    pub share_of_total_abs_delta: f64,
    pub materiality_flag: bool,
    /// 1-based presentation rank.
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactKind {
    CounterpartyConcentration,
    OneOffDocument,
    KeywordMatch,
    VolumeChange,
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactKind::CounterpartyConcentration => "COUNTERPARTY_CONCENTRATION",
            FactKind::OneOffDocument => "ONE_OFF_DOCUMENT",
            FactKind::KeywordMatch => "KEYWORD_MATCH",
            FactKind::VolumeChange => "VOLUME_CHANGE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactConfidence {
    DataBased,
    Indicative,
}

impl fmt::Display for FactConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactConfidence::DataBased => write!(f, "DATA_BASED"),
            FactConfidence::Indicative => write!(f, "INDICATIVE"),
        }
    }
}

/// A statement about a deviation that can be made from transaction contents alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFact {
    pub id: String,
    pub kind: FactKind,
    pub description: String,
    /// Never empty.
    pub supporting_document_ids: BTreeSet<String>,
    pub confidence: FactConfidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceLabel {
    #[schemars(description = "Directly supported by at least one DATA_BASED fact you cite.")]
    DataBased,

    #[schemars(description = "Suggested by the cited facts but not proven by them.")]
    Indicative,

    #[schemars(description = "No verifiable explanation can be given from the facts provided.")]
    Open,
}

impl EvidenceLabel {
    pub const ALL: [EvidenceLabel; 3] = [
        EvidenceLabel::DataBased,
        EvidenceLabel::Indicative,
        EvidenceLabel::Open,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceLabel::DataBased => "DATA_BASED",
            EvidenceLabel::Indicative => "INDICATIVE",
            EvidenceLabel::Open => "OPEN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.as_str() == raw)
    }
}

impl fmt::Display for EvidenceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a commentary record reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentaryOutcome {
    Validated,
    RetryExhausted,
    ModelUnreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentaryRecord {
    pub account_id: String,
    pub narrative_text: String,
    pub evidence_label: EvidenceLabel,
    /// Ids of the facts the narrative relies on; always a subset of the facts supplied.
    pub source_facts: Vec<String>,
    pub generation_attempt_count: u32,
    pub headline: Option<String>,
    pub open_questions: Vec<String>,
    pub outcome: CommentaryOutcome,
    pub last_failure: Option<String>,
}
