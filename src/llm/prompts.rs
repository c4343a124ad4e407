// Prompts for the evidence-graded commentary protocol

use crate::llm::types::{CommentaryReply, PromptMode};
use crate::schema::{EvidenceFact, VarianceRecord};
use crate::utils::{format_amount, format_share, format_signed_amount};

pub const SYSTEM_PROMPT_STRICT: &str = r#"
You are a controlling assistant explaining year-over-year deviations of account balances.

## STRICT RULES (MUST be followed)

### 1. Do not invent numbers, do not calculate
- Every number has already been computed and is given to you.
- Use ONLY the exact values from the data.
- Do NOT round, add, subtract or estimate.

### 2. Do not invent reasons
- Explain the deviation ONLY with the FACTS listed in the request.
- Refer to facts by their id (F1, F2, ...). Never mention an id that is not listed.
- If the cause is unclear, say so and ask an open question instead of guessing.
- Never write "probably because..." without a fact to back it.

### 3. Evidence label (MANDATORY)
- `DATA_BASED`: the explanation follows directly from at least one cited DATA_BASED fact.
- `INDICATIVE`: the cited facts suggest the explanation but do not prove it.
- `OPEN`: no verifiable explanation can be given. If no facts are listed, this is the ONLY allowed label.

### 4. Output: ONLY valid JSON
- No markdown, no text before or after the JSON object.
- Plain numbers only: no thousand separators, no leading `+`.
"#;

pub const SYSTEM_PROMPT_NORMAL: &str = r#"
You are a controlling assistant explaining year-over-year deviations of account balances.

## RULES
1. Use the numbers given; do not calculate on your own.
2. Distinguish facts from assumptions and cite the fact ids you rely on.
3. Choose the evidence label that matches how well the facts support you:
   `DATA_BASED`, `INDICATIVE` or `OPEN`.

## OUTPUT
Return a single JSON object and nothing else.
"#;

/// System prompt for `mode` with the reply schema appended.
pub fn system_prompt(mode: PromptMode) -> String {
    let rules = match mode {
        PromptMode::Strict => SYSTEM_PROMPT_STRICT,
        PromptMode::Normal => SYSTEM_PROMPT_NORMAL,
    };
    let schema = serde_json::to_string_pretty(&CommentaryReply::json_schema()).unwrap_or_default();

    format!(
        "{}\n## RESPONSE SCHEMA\nYour reply MUST be one JSON object matching this schema:\n```json\n{}\n```\n",
        rules.trim_start(),
        schema
    )
}

/// The per-account request: the record's numbers and the facts, nothing else.
pub fn build_user_prompt(record: &VarianceRecord, facts: &[EvidenceFact]) -> String {
    let mut prompt = format!(
        "ACCOUNT: {} - {}\n\n\
        FIGURES:\n\
        - Prior period: {}\n\
        - Current period: {}\n\
        - Delta: {} ({})\n\
        - Share of total absolute delta: {}\n\n\
        FACTS:\n",
        record.account_id,
        record.account_name,
        format_amount(record.prior_total),
        format_amount(record.current_total),
        format_signed_amount(record.absolute_delta),
        record.percentage_delta,
        format_share(record.share_of_total_abs_delta),
    );

    if facts.is_empty() {
        prompt.push_str(
            "(none) No verifiable facts were derived for this account. Use evidence_label OPEN.\n",
        );
    } else {
        for fact in facts {
            let documents: Vec<&str> = fact
                .supporting_document_ids
                .iter()
                .map(String::as_str)
                .collect();
            prompt.push_str(&format!(
                "[{}] {} ({}): {} Documents: {}\n",
                fact.id,
                fact.kind,
                fact.confidence,
                fact.description,
                documents.join(", ")
            ));
        }
    }

    prompt.push_str("\nExplain the deviation. Return ONLY the JSON object.");
    prompt
}

pub fn build_correction_prompt(reason: &str) -> String {
    format!(
        "Your previous reply could not be accepted.\n\n\
        ERROR: {}\n\n\
        TASK: Return the corrected reply as ONE JSON object matching the schema. \
        Cite only the fact ids listed in the request. \
        No markdown, no explanations before or after the JSON.",
        reason
    )
}
