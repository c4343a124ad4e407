use serde_json::json;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use variance_copilot::llm::{CommentaryReply, UNREACHABLE_NARRATIVE};
use variance_copilot::*;

/// Answers like a well-behaved model: cites the first DATA_BASED fact listed in
/// the prompt, falls back to the first fact, and says OPEN when there are none.
struct FactCitingEndpoint;

fn scripted_reply(request: &GenerationRequest) -> String {
    let prompt = request.last_user_message().unwrap_or_default();
    let fact_lines: Vec<&str> = prompt.lines().filter(|l| l.starts_with("[F")).collect();
    let fact_id = |line: &str| line[1..line.find(']').unwrap_or(1)].to_string();

    let reply = if let Some(line) = fact_lines.iter().find(|l| l.contains("(DATA_BASED)")) {
        let id = fact_id(line);
        json!({
            "narrative": format!("The deviation is explained by {}.", id),
            "evidence_label": "DATA_BASED",
            "source_facts": [id],
            "headline": "Deviation explained by postings"
        })
    } else if let Some(line) = fact_lines.first() {
        let id = fact_id(line);
        json!({
            "narrative": format!("Posting texts ({}) suggest a cause.", id),
            "evidence_label": "INDICATIVE",
            "source_facts": [id],
            "questions": ["Can the department confirm the cause?"]
        })
    } else {
        json!({
            "narrative": "No verifiable explanation can be given from the data.",
            "evidence_label": "OPEN",
            "source_facts": []
        })
    };

    format!("Here is the commentary:\n```json\n{}\n```\nLet me know if anything is unclear.", reply)
}

impl ModelEndpoint for FactCitingEndpoint {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        Ok(scripted_reply(request))
    }
}

struct DownEndpoint;

impl ModelEndpoint for DownEndpoint {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Err(VarianceError::ModelUnreachable {
            endpoint: "http://localhost:11434".to_string(),
            details: "connection refused".to_string(),
        })
    }
}

/// Cancels the run as soon as the first account is narrated.
struct CancellingEndpoint {
    token: CancellationToken,
}

impl ModelEndpoint for CancellingEndpoint {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.token.cancel();
        Ok(scripted_reply(request))
    }
}

fn tx(
    account: &str,
    name: &str,
    amount: f64,
    period: PeriodTag,
    counterparty: &str,
    doc: &str,
    text: &str,
) -> Transaction {
    Transaction::new(account, name, amount, period)
        .with_counterparty(counterparty)
        .with_document(doc)
        .with_description(text)
        .with_currency("EUR")
}

fn manufacturing_quarter() -> Vec<Transaction> {
    use PeriodTag::{Current, Prior};
    vec![
        tx("5000", "Material", -60_000.0, Prior, "Steel Co", "A1", "Stahl Lieferung"),
        tx("5000", "Material", -40_000.0, Prior, "Copper Co", "A2", "Kupfer Lieferung"),
        tx("5000", "Material", -100_000.0, Current, "Steel Co", "B1", "Stahl Lieferung"),
        tx("5000", "Material", -45_000.0, Current, "Copper Co", "B2", "Kupfer Lieferung"),
        tx("6200", "Services", -12_000.0, Prior, "Cleaner", "P1", "Reinigung"),
        tx("6200", "Services", -8_000.0, Prior, "Advisor", "P2", "Beratung"),
        tx("6200", "Services", -13_000.0, Current, "Cleaner", "C1", "Reinigung"),
        tx("6200", "Services", -12_000.0, Current, "Advisor", "C2", "Beratung"),
        tx("6200", "Services", -120_000.0, Current, "Law Firm", "D-9001", "Sonderberatung Rechtsstreit"),
        tx("4000", "Revenue", 50_000.0, Current, "New Customer", "R1", "Neukunde Auftrag"),
        tx("6000", "Rent", -10_000.0, Prior, "Landlord", "M1", "Miete"),
        tx("6000", "Rent", -10_000.0, Current, "Landlord", "M2", "Miete"),
        tx("7000", "Travel", -5_000.0, Prior, "Airline", "T1", "Flug").with_currency("USD"),
        tx("7000", "Travel", -30_000.0, Current, "Airline", "T2", "Flug").with_currency("USD"),
    ]
}

fn fast_config(max_concurrency: usize) -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.model.max_concurrency = max_concurrency;
    config.model.connect_retries = 1;
    config.model.connect_backoff_ms = 1;
    config
}

#[tokio::test]
async fn test_manufacturing_quarter_end_to_end() {
    let data = manufacturing_quarter();
    let analyzer = VarianceAnalyzer::new(fast_config(3), FactCitingEndpoint).unwrap();
    let report = analyzer
        .run(&data, PromptMode::Strict, &CancellationToken::new())
        .await;

    let order: Vec<&str> = report
        .rows
        .iter()
        .map(|row| row.variance.account_id.as_str())
        .collect();
    assert_eq!(order, vec!["6200", "4000", "5000", "6000"]);

    assert_eq!(report.rejected_accounts.len(), 1);
    assert_eq!(report.rejected_accounts[0].account_id, "7000");
    assert!(report.rejected_accounts[0].reason.contains("USD"));
    assert!(report.cancelled_accounts.is_empty());

    let material = report.row("5000").unwrap();
    assert_eq!(material.variance.prior_total, -100_000.0);
    assert_eq!(material.variance.current_total, -145_000.0);
    assert_eq!(material.variance.absolute_delta, -45_000.0);
    let pct = material.variance.percentage_delta.value().unwrap();
    assert!((pct.abs() - 0.45).abs() < 1e-12);
    assert!(material.variance.materiality_flag);

    let services = report.row("6200").unwrap();
    assert!(services.facts.iter().any(|f| {
        f.kind == FactKind::OneOffDocument && f.supporting_document_ids.contains("D-9001")
    }));

    let revenue = report.row("4000").unwrap();
    assert_eq!(revenue.variance.percentage_delta, PercentageDelta::Undefined);
    assert!(revenue.variance.materiality_flag);

    for row in &report.rows {
        assert_eq!(row.commentary.is_some(), row.variance.materiality_flag);
        let Some(commentary) = &row.commentary else {
            continue;
        };
        assert_eq!(commentary.outcome, CommentaryOutcome::Validated);
        assert_eq!(commentary.generation_attempt_count, 1);
        assert_eq!(commentary.evidence_label, EvidenceLabel::DataBased);

        let supplied: BTreeSet<&str> = row.facts.iter().map(|f| f.id.as_str()).collect();
        assert!(!commentary.source_facts.is_empty());
        assert!(commentary
            .source_facts
            .iter()
            .all(|id| supplied.contains(id.as_str())));
    }

    let rent = report.row("6000").unwrap();
    assert!(!rent.variance.materiality_flag);
    assert!(rent.commentary.is_none());
}

#[tokio::test]
async fn test_unreachable_model_still_delivers_numbers() {
    let data = manufacturing_quarter();
    let analyzer = VarianceAnalyzer::new(fast_config(2), DownEndpoint).unwrap();
    let report = analyzer
        .run(&data, PromptMode::Strict, &CancellationToken::new())
        .await;

    assert_eq!(report.rows.len(), 4);
    assert_eq!(report.material_rows().count(), 3);
    for row in report.material_rows() {
        let commentary = row.commentary.as_ref().unwrap();
        assert_eq!(commentary.outcome, CommentaryOutcome::ModelUnreachable);
        assert_eq!(commentary.evidence_label, EvidenceLabel::Open);
        assert_eq!(commentary.narrative_text, UNREACHABLE_NARRATIVE);
        assert!(commentary.source_facts.is_empty());
    }
    assert_eq!(report.row("6200").unwrap().variance.absolute_delta, -125_000.0);
}

#[tokio::test]
async fn test_cancellation_keeps_finished_commentary() {
    let data = manufacturing_quarter();
    let token = CancellationToken::new();
    let endpoint = CancellingEndpoint {
        token: token.clone(),
    };
    let analyzer = VarianceAnalyzer::new(fast_config(1), endpoint).unwrap();
    let report = analyzer.run(&data, PromptMode::Strict, &token).await;

    let first = report.row("6200").unwrap();
    assert_eq!(
        first.commentary.as_ref().unwrap().outcome,
        CommentaryOutcome::Validated
    );
    assert_eq!(report.cancelled_accounts, vec!["4000".to_string(), "5000".to_string()]);
    assert!(report.row("4000").unwrap().commentary.is_none());
    assert!(!report.row("5000").unwrap().facts.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let data = manufacturing_quarter();
    let token = CancellationToken::new();
    token.cancel();
    let analyzer = VarianceAnalyzer::new(fast_config(2), FactCitingEndpoint).unwrap();
    let report = analyzer.run(&data, PromptMode::Normal, &token).await;

    assert_eq!(report.cancelled_accounts.len(), 3);
    assert!(report.rows.iter().all(|row| row.commentary.is_none()));
    assert_eq!(report.rows.len(), 4);
}

#[tokio::test]
async fn test_progress_events_are_reported() {
    let data = manufacturing_quarter();
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let analyzer = VarianceAnalyzer::new(fast_config(1), FactCitingEndpoint)
        .unwrap()
        .with_progress(tx);
    analyzer
        .run(&data, PromptMode::Strict, &CancellationToken::new())
        .await;
    drop(analyzer);

    let mut validated = Vec::new();
    while let Some(event) = rx.recv().await {
        if let CommentaryEvent::Validated { account_id, .. } = event {
            validated.push(account_id);
        }
    }
    assert_eq!(validated, vec!["6200", "4000", "5000"]);
}

/// Deterministic pseudo-random ledger for property checks.
fn synthetic_ledger(seed: u64, accounts: usize) -> Vec<Transaction> {
    let mut state = seed;
    let mut next = move || {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (state >> 33) as f64 / (1u64 << 31) as f64
    };

    let mut data = Vec::new();
    for a in 0..accounts {
        let account = format!("{}", 4000 + a * 10);
        let postings = 1 + (next() * 6.0) as usize;
        for p in 0..postings {
            let period = if next() < 0.5 {
                PeriodTag::Prior
            } else {
                PeriodTag::Current
            };
            let amount = ((next() - 0.5) * 200_000.0).round();
            let mut t = Transaction::new(&account, "Synthetic", amount, period)
                .with_counterparty(format!("CP{}", (next() * 3.0) as usize));
            if next() < 0.8 {
                t = t.with_document(format!("{}-{}", account, p));
            }
            data.push(t.with_description("Sonderzahlung Korrektur"));
        }
    }
    data
}

#[test]
fn test_conservation_and_undefined_percentages() {
    for seed in 1..=20 {
        let data = synthetic_ledger(seed, 30);
        let records = compute_variance(&data, &MaterialityThresholds::default()).unwrap();

        let delta_sum: f64 = records.iter().map(|r| r.absolute_delta).sum();
        let current: f64 = data
            .iter()
            .filter(|t| t.period == PeriodTag::Current)
            .map(|t| t.amount)
            .sum();
        let prior: f64 = data
            .iter()
            .filter(|t| t.period == PeriodTag::Prior)
            .map(|t| t.amount)
            .sum();
        assert!((delta_sum - (current - prior)).abs() < 1e-6);

        for record in &records {
            if record.prior_total == 0.0 {
                assert!(record.percentage_delta.is_undefined());
            } else {
                assert!(!record.percentage_delta.is_undefined());
            }
        }
    }
}

#[test]
fn test_materiality_is_monotonic() {
    let data = synthetic_ledger(7, 40);
    let absolutes = [0.0, 1_000.0, 10_000.0, 50_000.0, 1e9];
    let percentages = [0.0, 0.05, 0.10, 0.5, 1e9];

    let flags = |absolute: f64, percentage: f64| -> Vec<(String, bool)> {
        let mut records =
            compute_variance(&data, &MaterialityThresholds::new(absolute, percentage)).unwrap();
        records.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        records
            .into_iter()
            .map(|r| (r.account_id, r.materiality_flag))
            .collect()
    };

    for (i, &a_low) in absolutes.iter().enumerate() {
        for (j, &p_low) in percentages.iter().enumerate() {
            let low = flags(a_low, p_low);
            for &a_high in &absolutes[i..] {
                for &p_high in &percentages[j..] {
                    let high = flags(a_high, p_high);
                    for (l, h) in low.iter().zip(&high) {
                        assert_eq!(l.0, h.0);
                        assert!(!h.1 || l.1, "flag appeared for {} when raising thresholds", h.0);
                    }
                }
            }
        }
    }
}

#[test]
fn test_facts_always_cite_documents() {
    let classifier = EvidenceClassifier::default();
    for seed in 1..=10 {
        let data = synthetic_ledger(seed, 25);
        let ids: BTreeSet<&str> = data.iter().map(|t| t.account_id.as_str()).collect();
        for id in ids {
            for fact in classifier.classify_account(&data, id) {
                assert!(!fact.supporting_document_ids.is_empty());
            }
        }
    }
}

#[test]
fn test_csv_with_comparison_window() {
    let csv = "\
account_id,account_name,amount,period,counterparty,document_id,description,currency,posting_date
5000,Material,-100000,,Steel Co,A1,Stahl,EUR,2023-02-10
5000,Material,-145000,,Steel Co,B1,Stahl,EUR,2024-03-05
5000,Material,-999999,,Steel Co,X1,Stahl,EUR,2024-04-01
4000,Revenue,50000,,Customer,R1,Umsatz,eur,2024-01-15
";
    let window = ComparisonWindow::year_over_year(2024, 1);
    let (report, rejected) =
        analyze_csv_without_commentary(csv.as_bytes(), Some(&window), &AnalysisConfig::default())
            .unwrap();

    assert!(rejected.is_empty());
    assert!(report.rejected_accounts.is_empty());
    let material = report.row("5000").unwrap();
    assert_eq!(material.variance.absolute_delta, -45_000.0);
    assert!(report.row("4000").unwrap().variance.percentage_delta.is_undefined());
}

#[test]
fn test_mixed_currency_fails_strict_computation() {
    let err = compute_variance(&manufacturing_quarter(), &MaterialityThresholds::default())
        .unwrap_err();
    match err {
        VarianceError::MixedCurrency {
            account_id,
            expected,
            found,
        } => {
            assert_eq!(account_id, "7000");
            assert_eq!(expected, "EUR");
            assert_eq!(found, "USD");
        }
        other => panic!("expected MixedCurrency, got {:?}", other),
    }
}

#[test]
fn test_config_layers() {
    let config = AnalysisConfig::from_json_str(
        r#"{"materiality": {"absolute": 5000}, "model": {"schema_retries": 1}}"#,
    )
    .unwrap();
    assert_eq!(config.materiality.absolute, 5_000.0);
    assert_eq!(config.materiality.percentage, 0.10);
    assert_eq!(config.model.schema_retries, 1);
    assert_eq!(config.evidence, EvidenceThresholds::default());

    let config = config
        .with_overrides_from(|key| match key {
            "OLLAMA_MODEL" => Some("mistral:7b".to_string()),
            "OLLAMA_TIMEOUT" => Some("30".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.model.model, "mistral:7b");
    assert_eq!(config.model.request_timeout_secs, 30);

    assert!(AnalysisConfig::from_json_str(r#"{"materiality": {"percentage": -0.1}}"#).is_err());
}

#[test]
fn test_schema_generation() {
    let schema = CommentaryReply::json_schema();
    let text = serde_json::to_string_pretty(&schema).unwrap();
    println!("{}", text);
    assert!(text.contains("narrative"));
    assert!(text.contains("source_facts"));
    assert!(text.contains("INDICATIVE"));
}
