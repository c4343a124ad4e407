//! Posting-text tokenization and the curated vocabulary behind keyword facts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

const STOPWORDS_DE: &[&str] = &[
    "der", "die", "das", "den", "dem", "des", "ein", "eine", "einer", "und", "oder", "aber",
    "wenn", "weil", "dass", "als", "auch", "noch", "schon", "von", "vom", "zum", "zur", "mit",
    "bei", "nach", "vor", "fuer", "für", "durch", "ist", "sind", "war", "hat", "haben", "wird",
    "werden", "kann", "muss",
];

const STOPWORDS_EN: &[&str] = &[
    "the", "and", "but", "for", "with", "from", "are", "was", "were", "been", "have", "has",
    "had", "does", "did", "will", "would", "can", "could", "per", "via",
];

fn stopwords() -> &'static HashSet<&'static str> {
    static STOPWORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    STOPWORDS.get_or_init(|| STOPWORDS_DE.iter().chain(STOPWORDS_EN).copied().collect())
}

/// Lowercase alphabetic tokens longer than two characters. Digits and
/// punctuation separate tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphabetic())
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Most frequent non-stopword tokens across `texts`, ties broken alphabetically.
pub fn top_keywords<'a, I>(texts: I, top_n: usize) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    let stop = stopwords();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for text in texts {
        for token in tokenize(text) {
            if !stop.contains(token.as_str()) {
                *counts.entry(token).or_insert(0) += 1;
            }
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(top_n);
    ranked
}

/// What a matched term suggests about the cause of a deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordTheme {
    PriceIncrease,
    OneTimeCharge,
    VolumeChange,
    ReversalOrCorrection,
    TimingOrAccrual,
}

impl KeywordTheme {
    pub const ALL: [KeywordTheme; 5] = [
        KeywordTheme::PriceIncrease,
        KeywordTheme::OneTimeCharge,
        KeywordTheme::VolumeChange,
        KeywordTheme::ReversalOrCorrection,
        KeywordTheme::TimingOrAccrual,
    ];

    /// Single words match as token prefixes; terms containing a space or
    /// hyphen match as substrings of the lowercased text.
    pub fn terms(self) -> &'static [&'static str] {
        match self {
            KeywordTheme::PriceIncrease => &[
                "price", "preis", "tarif", "inflation", "indexation", "indexier", "erhöh",
                "surcharge", "zuschlag", "teuerung", "rate increase",
            ],
            KeywordTheme::OneTimeCharge => &[
                "einmal", "sonder", "one-time", "one-off", "one time", "nonrecurring",
                "non-recurring", "settlement", "penalty", "nachzahlung", "abfindung",
                "severance", "impairment", "write-off",
            ],
            KeywordTheme::VolumeChange => &[
                "volume", "menge", "additional", "zusätzlich", "expansion", "headcount",
                "overtime", "überstunden", "neukunde", "new customer",
            ],
            KeywordTheme::ReversalOrCorrection => &[
                "storno", "reversal", "reversed", "correction", "korrektur", "gutschrift",
                "rückbuchung", "credit note",
            ],
            KeywordTheme::TimingOrAccrual => &[
                "accrual", "abgrenzung", "rückstellung", "deferral", "prepaid",
                "vorauszahlung", "catch-up", "prior period",
            ],
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            KeywordTheme::PriceIncrease => "price or rate increase",
            KeywordTheme::OneTimeCharge => "one-time charge",
            KeywordTheme::VolumeChange => "volume change",
            KeywordTheme::ReversalOrCorrection => "reversal or correction",
            KeywordTheme::TimingOrAccrual => "timing or accrual effect",
        }
    }
}

impl fmt::Display for KeywordTheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Vocabulary terms of `theme` found in `text`.
pub fn matched_terms(theme: KeywordTheme, text: &str) -> Vec<&'static str> {
    let lowered = text.to_lowercase();
    let tokens = tokenize(&lowered);

    theme
        .terms()
        .iter()
        .copied()
        .filter(|term| {
            if term.contains(|c: char| c == ' ' || c == '-') {
                lowered.contains(term)
            } else {
                tokens.iter().any(|t| t.starts_with(term))
            }
        })
        .collect()
}
