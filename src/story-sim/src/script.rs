//! Built-in story script: what the oracle predicted for each segment and what was written.

use rust_decimal::Decimal;

use engine::{Prediction, Side};

/// One scripted segment.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedSegment {
    /// Oracle candidates as (text, confidence).
    pub predictions: &'static [(&'static str, f64)],
    pub actual: &'static str,
}

impl ScriptedSegment {
    pub fn predictions(&self) -> Vec<Prediction> {
        self.predictions
            .iter()
            .map(|(text, confidence)| Prediction::new(text, *confidence))
            .collect()
    }

    /// Confidence the pool is priced from: the oracle's strongest candidate.
    pub fn ai_confidence(&self) -> anyhow::Result<Decimal> {
        let best = self
            .predictions
            .iter()
            .map(|(_, c)| *c)
            .fold(0.0, f64::max);
        Ok(Decimal::try_from(best)?.round_dp(4))
    }
}

const SCRIPT: &[ScriptedSegment] = &[
    ScriptedSegment {
        predictions: &[
            ("the detective examines the muddy footprints", 0.82),
            ("the detective calls the inspector", 0.41),
        ],
        actual: "The detective examines the muddy footprints by the gate.",
    },
    ScriptedSegment {
        predictions: &[
            ("the butler confesses to the theft", 0.77),
            ("the maid hides the jewels", 0.35),
        ],
        actual: "Suddenly the butler vanished, and the jewels were never stolen at all.",
    },
    ScriptedSegment {
        predictions: &[("the ship reaches the harbor at dawn", 0.9)],
        actual: "The ship reaches the harbor at dawn, battered but whole.",
    },
    ScriptedSegment {
        predictions: &[
            ("the captain orders a retreat", 0.66),
            ("the crew mutinies", 0.66),
        ],
        actual: "Without warning the sea itself rose up and spoke the captain's name.",
    },
    ScriptedSegment {
        predictions: &[("the old king names his heir", 0.71)],
        actual: "The old king names his heir before the assembled court.",
    },
    ScriptedSegment {
        predictions: &[
            ("the heir accepts the crown", 0.8),
            ("the heir refuses the crown", 0.2),
        ],
        actual: "Instead, the heir burned the crown and walked into the desert.",
    },
];

/// Segment `index` of the script, wrapping around.
pub fn segment(index: usize) -> &'static ScriptedSegment {
    &SCRIPT[index % SCRIPT.len()]
}

/// Side a spectator backs on a segment. Alternates per spectator and per segment.
pub fn spectator_side(spectator: usize, segment: usize) -> Side {
    if (spectator + segment) % 2 == 0 {
        Side::OracleCorrect
    } else {
        Side::OracleWrong
    }
}
