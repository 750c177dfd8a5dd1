//! Command detector
//!
//! Cheap keyword scoring used when the interpreter does not supply its own
//! confidence. Scores a chat message in [0, 1] for how likely it is an
//! operation request, and guesses the operation kind.

use crate::models::OperationKind;

/// Static keyword lists — zero allocation
const ACTION_PHRASES: &[&str] = &[
    // Swaps and bridges
    "swap", "exchange", "convert", "bridge", "trade", "buy", "sell",
    // Conditional orders
    "limit order", "when price", "if price", "when the price",
    // Posting
    "post on x", "post on twitter", "send a tweet", "schedule a tweet", "tweet this",
    "write a tweet", "publish a post",
];

const ASSET_KEYWORDS: &[&str] = &[
    "near", "eth", "ethereum", "btc", "bitcoin", "usdc", "usdt", "sol", "solana", "token",
    "wallet", "defi",
];

const QUESTION_PREFIXES: &[&str] = &["what", "how", "why", "explain", "tell me", "is", "are"];

const LIMIT_MARKERS: &[&str] = &[
    "limit", "when price", "if price", "when the price", "reaches", "hits", "above", "below",
];

const RECURRING_MARKERS: &[&str] = &["every", "daily", "weekly", "monthly", "recurring", "dca"];

const POST_MARKERS: &[&str] = &["tweet", "twitter", "post on x", "publish a post", "thread"];

pub struct CommandDetector;

impl CommandDetector {
    pub fn confidence(message: &str) -> f32 {
        let text = message.to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric() && c != '.')
            .map(|w| w.trim_matches('.'))
            .filter(|w| !w.is_empty())
            .collect();

        let mut score = 0.0f32;

        if ACTION_PHRASES.iter().any(|p| contains_term(&text, &words, p)) {
            score += 0.6;
        }

        let assets = ASSET_KEYWORDS
            .iter()
            .filter(|kw| words.contains(kw))
            .count();
        score += (assets as f32 * 0.15).min(0.3);

        if words.iter().any(|w| w.parse::<f64>().is_ok()) {
            score += 0.15;
        }

        if QUESTION_PREFIXES
            .iter()
            .any(|q| text.trim_start().starts_with(&format!("{} ", q)))
        {
            score -= 0.3;
        }

        score.clamp(0.0, 1.0)
    }

    /// Best guess at the operation kind a command asks for.
    pub fn suggest_kind(message: &str) -> Option<OperationKind> {
        let text = message.to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |markers: &[&str]| markers.iter().any(|m| contains_term(&text, &words, m));

        if has(POST_MARKERS) {
            Some(OperationKind::SocialPost)
        } else if has(RECURRING_MARKERS) {
            Some(OperationKind::RecurringSwap)
        } else if has(LIMIT_MARKERS) {
            Some(OperationKind::LimitSwap)
        } else if has(ACTION_PHRASES) {
            Some(OperationKind::Swap)
        } else {
            None
        }
    }
}

/// Multi-word terms match as substrings, single words as whole words.
fn contains_term(text: &str, words: &[&str], term: &str) -> bool {
    if term.contains(' ') {
        text.contains(term)
    } else {
        words.contains(&term)
    }
}
