//! # Variance Copilot
//!
//! Deterministic year-over-year variance analysis on quarterly accounting
//! extracts, with evidence-graded commentary from a locally hosted language model.
//!
//! ## Core Concepts
//!
//! - **Variance Record**: prior and current totals of one account, the absolute and
//!   percentage delta, and whether the deviation is material
//! - **Evidence Fact**: a statement that can be made from the postings alone
//!   (concentration on one counterparty, a one-off document, a volume shift,
//!   suggestive posting texts), always backed by document ids
//! - **Commentary**: a narrative returned by the model, validated against the facts
//!   and labeled `DATA_BASED`, `INDICATIVE` or `OPEN`
//! - **Numbers first**: every figure is computed here; the model only narrates, and
//!   any failure to narrate degrades to an `OPEN` record instead of an error
//!
//! ## Example
//!
//! ```rust,ignore
//! use variance_copilot::*;
//! use tokio_util::sync::CancellationToken;
//!
//! let table = read_canonical_csv(std::fs::File::open("extract.csv")?, None)?;
//! let config = AnalysisConfig::default().with_env_overrides()?;
//! let client = OllamaClient::from_config(&config.model);
//!
//! let analyzer = VarianceAnalyzer::new(config, client)?;
//! let report = analyzer
//!     .run(&table.transactions, PromptMode::Strict, &CancellationToken::new())
//!     .await;
//!
//! for row in report.material_rows() {
//!     println!("{} {}", row.variance.account_id, row.variance.percentage_delta);
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod error;
pub mod evidence;
pub mod ingestion;
pub mod keywords;
pub mod llm;
pub mod schema;
pub mod utils;
pub mod variance;

pub use analysis::{
    analyze_without_commentary, AnalysisReport, AnalysisRow, RejectedAccount, VarianceAnalyzer,
};
pub use config::{AnalysisConfig, EvidenceThresholds, MaterialityThresholds, ModelConfig};
pub use error::{Result, VarianceError};
pub use evidence::{EvidenceClassifier, FactRule};
pub use ingestion::*;
pub use llm::{CommentaryEvent, CommentaryProtocol, GenerationRequest, ModelEndpoint, PromptMode};
#[cfg(feature = "ollama")]
pub use llm::OllamaClient;
pub use schema::*;
pub use variance::{
    account_period_totals, compute_variance, compute_variance_partitioned, VarianceOutcome,
};

use log::info;
use std::io::Read;

/// Reads a canonical CSV extract and computes numbers and facts in one step.
/// Rows that fail validation are returned next to the report.
pub fn analyze_csv_without_commentary<R: Read>(
    reader: R,
    window: Option<&ComparisonWindow>,
    config: &AnalysisConfig,
) -> Result<(AnalysisReport, Vec<VarianceError>)> {
    let table = read_canonical_csv(reader, window)?;
    info!(
        "Loaded {} transactions ({} rows rejected)",
        table.transactions.len(),
        table.rejected_rows.len()
    );
    let report = analyze_without_commentary(&table.transactions, config)?;
    Ok((report, table.rejected_rows))
}
