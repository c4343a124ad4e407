//! Locates the structured block inside a free-text model reply.
//!
//! Models wrap JSON in prose or code fences and emit numbers JSON does not
//! allow. Candidates are tried in order: every outermost balanced `{...}`
//! object, then the slice from the first `{` to the last `}`. Each candidate is
//! parsed as-is first and again after [`repair_json`].

use crate::error::{Result, VarianceError};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

re!(re_grouped_number, r":\s*[+-]?\d{1,3}(?:,\d{3})+\b");
re!(re_leading_plus, r"(:\s*)\+(\d)");
re!(re_trailing_comma, r",(\s*[}\]])");

pub fn extract_structured_block(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Err(VarianceError::ResponseParseFailure(
            "empty reply".to_string(),
        ));
    }

    let mut candidates = balanced_objects(text);
    if let Some(slice) = loose_slice(text) {
        if !candidates.contains(&slice) {
            candidates.push(slice);
        }
    }

    if candidates.is_empty() {
        return Err(VarianceError::ResponseParseFailure(
            "no JSON object found in reply".to_string(),
        ));
    }

    let mut last_error = String::new();
    let mut fallback = None;
    for candidate in candidates {
        let parsed = parse_object(candidate).or_else(|e| {
            last_error = e;
            parse_object(&repair_json(candidate))
        });
        match parsed {
            Ok(value) if has_reply_keys(&value) => return Ok(value),
            Ok(value) => {
                fallback.get_or_insert(value);
            }
            Err(e) => last_error = e,
        }
    }

    fallback.ok_or_else(|| {
        VarianceError::ResponseParseFailure(format!(
            "reply contains no parseable JSON object: {}",
            last_error
        ))
    })
}

/// Placeholder objects in prose (`{}`, `{"x": 1}`) lose to a block that looks
/// like a reply.
fn has_reply_keys(value: &Value) -> bool {
    value.get("narrative").is_some() || value.get("evidence_label").is_some()
}

fn parse_object(candidate: &str) -> std::result::Result<Value, String> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("top-level value is not an object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Every outermost balanced `{...}` span, in order of appearance. Braces inside
/// JSON strings are ignored.
pub fn balanced_objects(text: &str) -> Vec<&str> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if depth == 0 {
            if ch == '{' {
                depth = 1;
                start = i;
                in_string = false;
                escaped = false;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    objects.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    objects
}

pub fn loose_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Fixes number and comma defects that models commonly produce:
/// `"delta": -115,209`, `"delta": +380376` and trailing commas.
pub fn repair_json(candidate: &str) -> String {
    let text = re_grouped_number().replace_all(candidate, |caps: &Captures| caps[0].replace(',', ""));
    let text = re_leading_plus().replace_all(&text, "$1$2");
    let text = re_trailing_comma().replace_all(&text, "$1");
    text.into_owned()
}
