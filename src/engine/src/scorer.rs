//! Segment scoring: how well the oracle predicted what the narrator wrote.
//!
//! Accuracy is the Jaccard overlap of content tokens between the consensus
//! prediction and the revealed text. Everything here is pure and lock-free.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::models::SegmentScore;

/// Bonus per twist marker found in the revealed text.
const SURPRISE_PER_MARKER: f64 = 0.2;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "so", "of", "to", "in", "on", "at", "by", "for",
    "with", "from", "as", "into", "is", "are", "was", "were", "be", "been", "being", "it", "its",
    "this", "that", "these", "those", "he", "she", "they", "we", "i", "you", "his", "her",
    "their", "our", "my", "your", "him", "them", "me", "us", "do", "does", "did", "has", "have",
    "had", "then", "there", "just", "very",
];

/// Phrases that signal the story broke from expectation, as token sequences.
const TWIST_MARKERS: &[&[&str]] = &[
    &["suddenly"],
    &["unexpectedly"],
    &["however"],
    &["instead"],
    &["but", "then"],
    &["plot", "twist"],
    &["turned", "out"],
    &["little", "did"],
    &["without", "warning"],
    &["out", "of", "nowhere"],
    &["to", "everyone's", "surprise"],
    &["in", "fact"],
    &["never"],
    &["revealed"],
    &["betrayed"],
];

/// One oracle candidate for the next segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub text: String,
    pub confidence: f64,
}

impl Prediction {
    pub fn new(text: &str, confidence: f64) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

/// Score a revealed segment against the oracle's candidates.
///
/// Fails only on malformed input: blank `actual` text or a confidence outside `[0, 1]`.
pub fn score(predictions: &[Prediction], actual: &str) -> EngineResult<SegmentScore> {
    if actual.trim().is_empty() {
        return Err(EngineError::Validation("actual text must not be empty".to_string()));
    }
    for p in predictions {
        if !p.confidence.is_finite() || !(0.0..=1.0).contains(&p.confidence) {
            return Err(EngineError::Validation(format!(
                "prediction confidence {} outside [0, 1]",
                p.confidence
            )));
        }
    }

    let consensus = consensus(predictions);
    let accuracy = consensus
        .map(|p| similarity(&p.text, actual))
        .unwrap_or(0.0);
    let twist_markers = count_twist_markers(actual);
    let surprise_bonus = (SURPRISE_PER_MARKER * twist_markers as f64).min(1.0);

    debug!(
        "[SCORER] accuracy={:.3} markers={} candidates={}",
        accuracy,
        twist_markers,
        predictions.len()
    );

    Ok(SegmentScore {
        accuracy,
        unpredictability: 1.0 - accuracy,
        surprise_bonus,
        twist_markers,
        consensus: consensus.map(|p| p.text.clone()),
    })
}

/// Pick the highest-confidence candidate.
///
/// Ties go to the candidate sharing the most content tokens with the others,
/// then to the earliest one.
pub fn consensus(predictions: &[Prediction]) -> Option<&Prediction> {
    let best = predictions
        .iter()
        .map(|p| p.confidence)
        .fold(f64::NEG_INFINITY, f64::max);
    let tied: Vec<usize> = (0..predictions.len())
        .filter(|&i| predictions[i].confidence == best)
        .collect();

    if tied.len() <= 1 {
        return tied.first().map(|&i| &predictions[i]);
    }

    let token_sets: Vec<BTreeSet<String>> =
        predictions.iter().map(|p| content_tokens(&p.text)).collect();
    let overlap = |i: usize| -> usize {
        (0..token_sets.len())
            .filter(|&j| j != i)
            .map(|j| token_sets[i].intersection(&token_sets[j]).count())
            .sum()
    };

    let mut winner = tied[0];
    let mut winner_overlap = overlap(winner);
    for &i in &tied[1..] {
        let o = overlap(i);
        if o > winner_overlap {
            winner = i;
            winner_overlap = o;
        }
    }
    Some(&predictions[winner])
}

/// Token-set overlap `|A ∩ B| / |A ∪ B|` in `[0, 1]`.
///
/// Falls back to all tokens when both texts are made only of stop words.
pub fn similarity(predicted: &str, actual: &str) -> f64 {
    let (a, b) = (content_tokens(predicted), content_tokens(actual));
    if let Some(ratio) = jaccard(&a, &b) {
        return ratio;
    }
    let all = |text: &str| tokens(text).into_iter().collect::<BTreeSet<_>>();
    jaccard(&all(predicted), &all(actual)).unwrap_or(0.0)
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<f64> {
    let union = a.union(b).count();
    if union == 0 {
        return None;
    }
    Some(a.intersection(b).count() as f64 / union as f64)
}

/// Lowercase whitespace tokens with surrounding punctuation stripped.
fn tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn content_tokens(text: &str) -> BTreeSet<String> {
    tokens(text)
        .into_iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Count occurrences of twist marker phrases in `text`.
pub fn count_twist_markers(text: &str) -> usize {
    let toks = tokens(text);
    TWIST_MARKERS
        .iter()
        .map(|marker| {
            if marker.len() > toks.len() {
                return 0;
            }
            toks.windows(marker.len())
                .filter(|w| w.iter().zip(marker.iter()).all(|(t, m)| t == m))
                .count()
        })
        .sum()
}
