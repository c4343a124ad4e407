use crate::error::{Result, VarianceError};
use crate::llm::types::{CommentaryReply, PromptMode};
use crate::schema::{EvidenceFact, EvidenceLabel, FactConfidence};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

fn re_fact_id() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"\bF\d+\b").expect("invalid regex"))
}

fn rejected(reason: impl Into<String>) -> VarianceError {
    VarianceError::ResponseValidationFailure(reason.into())
}

/// Checks an extracted reply against the facts that were supplied for it.
///
/// In every mode the reply needs a non-empty `narrative`, an `evidence_label`
/// from the closed set and may only cite supplied fact ids. [`PromptMode::Strict`]
/// also requires the label to be backed by the cited facts and rejects
/// narratives that mention fact ids which were never supplied.
pub fn validate_reply(
    value: &Value,
    facts: &[EvidenceFact],
    mode: PromptMode,
) -> Result<CommentaryReply> {
    let obj = value
        .as_object()
        .ok_or_else(|| rejected("reply is not a JSON object"))?;

    let narrative = obj
        .get("narrative")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| rejected("'narrative' must be a non-empty string"))?
        .to_string();

    let evidence_label = parse_label(obj)?;

    let supplied: HashMap<&str, &EvidenceFact> =
        facts.iter().map(|f| (f.id.as_str(), f)).collect();

    let source_facts = parse_source_facts(obj)?;
    if let Some(unknown) = source_facts
        .iter()
        .find(|id| !supplied.contains_key(id.as_str()))
    {
        return Err(rejected(format!(
            "'source_facts' cites fact id '{}' which was not supplied",
            unknown
        )));
    }

    if mode == PromptMode::Strict {
        if let Some(m) = re_fact_id()
            .find_iter(&narrative)
            .find(|m| !supplied.contains_key(m.as_str()))
        {
            return Err(rejected(format!(
                "narrative mentions fact id '{}' which was not supplied",
                m.as_str()
            )));
        }

        if facts.is_empty() && evidence_label != EvidenceLabel::Open {
            return Err(rejected(format!(
                "no facts were supplied, so evidence_label must be OPEN, not {}",
                evidence_label
            )));
        }

        match evidence_label {
            EvidenceLabel::DataBased => {
                let backed = source_facts.iter().any(|id| {
                    supplied
                        .get(id.as_str())
                        .is_some_and(|f| f.confidence == FactConfidence::DataBased)
                });
                if !backed {
                    return Err(rejected(
                        "DATA_BASED requires citing at least one DATA_BASED fact in 'source_facts'",
                    ));
                }
            }
            EvidenceLabel::Indicative if source_facts.is_empty() => {
                return Err(rejected(
                    "INDICATIVE requires citing at least one fact in 'source_facts'",
                ));
            }
            _ => {}
        }
    }

    let headline = obj
        .get("headline")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let questions = match obj.get("questions") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(single)) if !single.trim().is_empty() => vec![single.trim().to_string()],
        _ => Vec::new(),
    };

    Ok(CommentaryReply {
        narrative,
        evidence_label,
        source_facts,
        headline,
        questions,
    })
}

fn parse_label(obj: &Map<String, Value>) -> Result<EvidenceLabel> {
    let raw = obj
        .get("evidence_label")
        .ok_or_else(|| rejected("'evidence_label' is missing"))?;
    let text = raw
        .as_str()
        .ok_or_else(|| rejected(format!("'evidence_label' must be a string, got {}", raw)))?;

    EvidenceLabel::parse(text.trim()).ok_or_else(|| {
        let allowed: Vec<&str> = EvidenceLabel::ALL.iter().map(|l| l.as_str()).collect();
        rejected(format!(
            "evidence_label '{}' is not one of {}",
            text,
            allowed.join(", ")
        ))
    })
}

/// Cited ids in first-seen order without duplicates. A missing field means no citations.
fn parse_source_facts(obj: &Map<String, Value>) -> Result<Vec<String>> {
    let items = match obj.get("source_facts") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(rejected(format!(
                "'source_facts' must be an array of fact ids, got {}",
                other
            )))
        }
    };

    let mut ids: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let id = item
            .as_str()
            .map(str::trim)
            .ok_or_else(|| rejected(format!("'source_facts' entry {} is not a string", item)))?;
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FactKind;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn fact(id: &str, confidence: FactConfidence) -> EvidenceFact {
        EvidenceFact {
            id: id.to_string(),
            kind: FactKind::OneOffDocument,
            description: "desc".to_string(),
            supporting_document_ids: BTreeSet::from(["D1".to_string()]),
            confidence,
        }
    }

    fn facts() -> Vec<EvidenceFact> {
        vec![
            fact("F1", FactConfidence::DataBased),
            fact("F2", FactConfidence::Indicative),
        ]
    }

    fn message(result: Result<CommentaryReply>) -> String {
        match result {
            Err(VarianceError::ResponseValidationFailure(msg)) => msg,
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_data_based_reply() {
        let value = json!({
            "narrative": "Document D1 (F1) explains the increase.",
            "evidence_label": "DATA_BASED",
            "source_facts": ["F1", "F1"],
            "headline": " One-off legal fee ",
            "questions": ["Is the fee recurring?", 3]
        });
        let reply = validate_reply(&value, &facts(), PromptMode::Strict).unwrap();
        assert_eq!(reply.evidence_label, EvidenceLabel::DataBased);
        assert_eq!(reply.source_facts, vec!["F1".to_string()]);
        assert_eq!(reply.headline.as_deref(), Some("One-off legal fee"));
        assert_eq!(reply.questions, vec!["Is the fee recurring?".to_string()]);
    }

    #[test]
    fn test_missing_or_empty_narrative() {
        let value = json!({"evidence_label": "OPEN"});
        assert!(message(validate_reply(&value, &[], PromptMode::Normal)).contains("narrative"));

        let value = json!({"narrative": "  ", "evidence_label": "OPEN"});
        assert!(validate_reply(&value, &[], PromptMode::Normal).is_err());
    }

    #[test]
    fn test_label_outside_closed_set() {
        let value = json!({"narrative": "x", "evidence_label": "HYPOTHESIS"});
        let msg = message(validate_reply(&value, &facts(), PromptMode::Normal));
        assert!(msg.contains("HYPOTHESIS"));

        let value = json!({"narrative": "x", "evidence_label": "open"});
        assert!(validate_reply(&value, &facts(), PromptMode::Normal).is_err());

        let value = json!({"narrative": "x"});
        assert!(validate_reply(&value, &facts(), PromptMode::Normal).is_err());
    }

    #[test]
    fn test_unknown_source_fact_rejected_in_every_mode() {
        let value = json!({"narrative": "x", "evidence_label": "INDICATIVE", "source_facts": ["F9"]});
        assert!(validate_reply(&value, &facts(), PromptMode::Normal).is_err());
        assert!(validate_reply(&value, &facts(), PromptMode::Strict).is_err());
    }

    #[test]
    fn test_strict_rejects_unsupplied_fact_in_narrative() {
        let value = json!({
            "narrative": "As F3 shows, prices rose.",
            "evidence_label": "INDICATIVE",
            "source_facts": ["F2"]
        });
        let msg = message(validate_reply(&value, &facts(), PromptMode::Strict));
        assert!(msg.contains("F3"));
        assert!(validate_reply(&value, &facts(), PromptMode::Normal).is_ok());
    }

    #[test]
    fn test_strict_requires_backing_for_labels() {
        let only_indicative = json!({
            "narrative": "Keywords suggest a price increase.",
            "evidence_label": "DATA_BASED",
            "source_facts": ["F2"]
        });
        assert!(validate_reply(&only_indicative, &facts(), PromptMode::Strict).is_err());
        assert!(validate_reply(&only_indicative, &facts(), PromptMode::Normal).is_ok());

        let uncited = json!({"narrative": "Maybe prices.", "evidence_label": "INDICATIVE"});
        assert!(validate_reply(&uncited, &facts(), PromptMode::Strict).is_err());
    }

    #[test]
    fn test_strict_without_facts_only_accepts_open() {
        let value = json!({"narrative": "Costs rose.", "evidence_label": "INDICATIVE", "source_facts": []});
        assert!(message(validate_reply(&value, &[], PromptMode::Strict)).contains("OPEN"));

        let value = json!({"narrative": "No verifiable cause.", "evidence_label": "OPEN"});
        let reply = validate_reply(&value, &[], PromptMode::Strict).unwrap();
        assert_eq!(reply.evidence_label, EvidenceLabel::Open);
        assert!(reply.source_facts.is_empty());
    }

    #[test]
    fn test_source_facts_must_be_string_array() {
        let value = json!({"narrative": "x", "evidence_label": "OPEN", "source_facts": "F1"});
        assert!(validate_reply(&value, &facts(), PromptMode::Normal).is_err());

        let value = json!({"narrative": "x", "evidence_label": "OPEN", "source_facts": [1]});
        assert!(validate_reply(&value, &facts(), PromptMode::Normal).is_err());
    }
}
